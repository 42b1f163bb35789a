use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};

/// How a session credential was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Supplied once through config or environment, never expires
    StaticToken,
    /// Issued by the OAuth flow, valid until `expires_at`
    OAuthToken,
}

/// Platform session credential attached to every outbound request
#[derive(Debug)]
pub struct SessionCredential {
    kind: CredentialKind,
    value: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionCredential {
    pub fn static_token(value: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::StaticToken,
            value: SecretString::from(value.into()),
            expires_at: None,
        }
    }

    pub fn oauth(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            kind: CredentialKind::OAuthToken,
            value: SecretString::from(value.into()),
            expires_at: Some(expires_at),
        }
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the credential can still be used at `now`
    ///
    /// OAuth tokens are treated as stale `skew` before their expiry so a
    /// request never leaves with a token about to lapse.
    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match (self.kind, self.expires_at) {
            (CredentialKind::StaticToken, _) => true,
            (CredentialKind::OAuthToken, Some(expires_at)) => now + skew < expires_at,
            (CredentialKind::OAuthToken, None) => false,
        }
    }
}

impl Clone for SessionCredential {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            value: SecretString::from(self.value.expose_secret().to_owned()),
            expires_at: self.expires_at,
        }
    }
}
