use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use super::{AuthError, CredentialSource, SessionCredential};

/// Token returned by the external OAuth flow
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// External OAuth capability (e.g. the Databricks CLI)
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Read the current token; `AuthError::NoSession` when the user must log in
    async fn fetch_token(&self) -> Result<FetchedToken, AuthError>;

    /// Run the interactive login flow and wait for it to finish
    async fn login(&self) -> Result<(), AuthError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<SessionCredential, AuthError>>>;

/// Cached token plus the refresh currently in flight, if any
struct TokenState {
    skew: chrono::Duration,
    cache: RwLock<Option<SessionCredential>>,
    inflight: Mutex<Option<RefreshFuture>>,
}

impl TokenState {
    fn cached(&self) -> Option<SessionCredential> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .as_ref()
            .filter(|c| c.is_valid_at(Utc::now(), self.skew))
            .cloned()
    }

    fn store(&self, credential: &SessionCredential) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        *cache = Some(credential.clone());
    }

    fn clear_inflight(&self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        *inflight = None;
    }
}

/// Caching OAuth credential source
///
/// Reads go through an `RwLock`ed cache. On a stale cache the first caller
/// spawns one refresh task and every caller, the first included, awaits that
/// task's shared result. The task is detached from the callers, so a caller
/// that goes away mid-login does not cancel the login for the others.
pub struct RefreshingTokenSource {
    fetcher: Arc<dyn TokenFetcher>,
    state: Arc<TokenState>,
}

impl RefreshingTokenSource {
    pub fn new(fetcher: Arc<dyn TokenFetcher>, skew: Duration) -> Self {
        Self {
            fetcher,
            state: Arc::new(TokenState {
                skew: chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero()),
                cache: RwLock::new(None),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Join the refresh in flight, or start one
    fn refresh_future(&self) -> RefreshFuture {
        let mut inflight = self
            .state
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(shared) = inflight.as_ref() {
            return shared.clone();
        }
        // A refresh may have landed between the cache check and this lock.
        if let Some(credential) = self.state.cached() {
            return futures::future::ready(Ok(credential)).boxed().shared();
        }

        let fetcher = self.fetcher.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let result = refresh(fetcher.as_ref()).await;
            if let Ok(credential) = &result {
                state.store(credential);
            }
            state.clear_inflight();
            result
        });

        let state = self.state.clone();
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    state.clear_inflight();
                    Err(AuthError::LoginFailed(format!("token refresh task failed: {e}")))
                }
            }
        }
        .boxed()
        .shared();

        *inflight = Some(shared.clone());
        shared
    }
}

/// Fetch a token, logging in once if there is no usable session
async fn refresh(fetcher: &dyn TokenFetcher) -> Result<SessionCredential, AuthError> {
    match fetch_valid(fetcher).await {
        Err(AuthError::NoSession(reason)) => {
            warn!("No valid Databricks session ({reason}), launching interactive login");
            fetcher.login().await?;
            info!("Databricks login completed, retrying token fetch");
            fetch_valid(fetcher)
                .await
                .map_err(|e| AuthError::Exhausted(e.to_string()))
        }
        result => result,
    }
}

/// Fetch a token and reject one that has already expired
async fn fetch_valid(fetcher: &dyn TokenFetcher) -> Result<SessionCredential, AuthError> {
    let fetched = fetcher.fetch_token().await?;
    let credential = SessionCredential::oauth(fetched.access_token, fetched.expires_at);
    if !credential.is_valid_at(Utc::now(), chrono::Duration::zero()) {
        return Err(AuthError::NoSession(format!(
            "token expired at {}",
            fetched.expires_at
        )));
    }

    debug!(expires_at = %fetched.expires_at, "Obtained Databricks OAuth token");
    Ok(credential)
}

#[async_trait]
impl CredentialSource for RefreshingTokenSource {
    async fn credential(&self) -> Result<SessionCredential, AuthError> {
        if let Some(credential) = self.state.cached() {
            return Ok(credential);
        }

        self.refresh_future().await
    }

    fn name(&self) -> &'static str {
        "oauth"
    }
}
