//! Integration tests for request forwarding
//!
//! The serving endpoint is a wiremock server; requests go through the real
//! router so rewriting, relaying, error mapping and exchange logging are all
//! exercised together.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

use databricks_claude::config::{Config, Mode};
use databricks_claude::proxy::{AppState, StreamingRelay, create_router};

// =============================================================================
// Test Fixtures
// =============================================================================

const SESSION_TOKEN: &str = "dapi-session";
const VENDOR_KEY: &str = "sk-ant-vendor";
const MESSAGES_PATH: &str = "/serving-endpoints/anthropic/v1/messages";

fn test_config(upstream: &str, dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.workspace.host = Some(upstream.to_string());
    config.auth.token = Some(SESSION_TOKEN.to_string());
    config.auth.vendor_key = Some(VENDOR_KEY.to_string());
    config.log.path = dir.path().join("proxy.log");
    config
}

fn test_state(config: &Config) -> Arc<AppState> {
    Arc::new(AppState::from_config(config).unwrap())
}

fn log_lines(dir: &tempfile::TempDir) -> Vec<String> {
    std::fs::read_to_string(dir.path().join("proxy.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

fn messages_body(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "max_tokens": 256,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

/// A request shaped like the agent CLI's, carrying its own credentials
fn agent_request(body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/messages?beta=true")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-ant-client")
        .header("x-api-key", "sk-ant-client")
        .header("anthropic-version", "2023-06-01")
        .header("anthropic-beta", "interleaved-thinking-2025-05-14")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Forwarding Tests
// =============================================================================

mod forwarding_tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_rewritten_for_serving_endpoint() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .and(matchers::path(MESSAGES_PATH))
            .and(matchers::query_param("beta", "true"))
            .and(matchers::header("authorization", "Bearer dapi-session"))
            .and(matchers::header("x-anthropic-api-key", VENDOR_KEY))
            .and(matchers::header("anthropic-version", "2023-06-01"))
            .and(matchers::header("anthropic-beta", "interleaved-thinking-2025-05-14"))
            .and(matchers::body_json(messages_body("databricks-claude-opus-4-6")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "content": [{"type": "text", "text": "Hi"}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["id"], "msg_1");

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get("x-api-key").is_none());

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("POST /v1/messages status=200"));
    }

    #[tokio::test]
    async fn test_databricks_mode_sends_coding_agent_header() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .and(matchers::path(MESSAGES_PATH))
            .and(matchers::header("x-databricks-use-coding-agent-mode", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut config = test_config(&mock_server.uri(), &dir);
        config.workspace.mode = Mode::Databricks;
        config.auth.vendor_key = None;
        let app = create_router(test_state(&config));

        let response = app
            .oneshot(agent_request(&messages_body("claude-opus-4-6")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let received = mock_server.received_requests().await.unwrap();
        assert!(received[0].headers.get("x-anthropic-api-key").is_none());
    }

    #[tokio::test]
    async fn test_response_headers_never_echo_credentials() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-request-id", "req-42")
                    .insert_header("x-debug-auth", "Bearer dapi-session")
                    .insert_header("x-anthropic-api-key", VENDOR_KEY)
                    .set_body_json(serde_json::json!({})),
            )
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-42");
        assert!(response.headers().get("x-debug-auth").is_none());
        assert!(response.headers().get("x-anthropic-api-key").is_none());
    }

    #[tokio::test]
    async fn test_non_json_body_is_streamed_through() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();

        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/serving-endpoints/anthropic/v1/files"))
            .and(matchers::body_bytes(payload.clone()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let request = Request::builder()
            .method("PUT")
            .uri("/v1/files")
            .header("content-type", "application/octet-stream")
            .body(Body::from(payload))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_concurrent_requests_each_logged_once() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(8)
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move {
                    app.oneshot(agent_request(&messages_body("claude-3-opus")))
                        .await
                        .unwrap()
                        .status()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 8);
        assert!(lines.iter().all(|l| l.contains("status=200")));
    }
}

// =============================================================================
// Streaming Response Tests
// =============================================================================

mod streaming_response_tests {
    use super::*;

    #[tokio::test]
    async fn test_event_stream_relayed_byte_for_byte() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hi\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        // Not logged until the body has been relayed
        assert!(log_lines(&dir).is_empty());

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes, sse.as_bytes());

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("status=200"));
    }
}

// =============================================================================
// Error Handling Tests
// =============================================================================

mod error_handling_tests {
    use super::*;

    #[tokio::test]
    async fn test_upstream_error_status_is_preserved() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "upstream_status");
        assert_eq!(json["error"]["message"], "Rate limit exceeded");

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("error=upstream_status status=429"));
    }

    #[tokio::test]
    async fn test_upstream_rate_limit_keeps_headers_and_vendor_error() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let vendor_error = serde_json::json!({
            "type": "error",
            "error": {"type": "rate_limit_error", "message": "Number of requests has exceeded your rate limit"}
        });
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "17")
                    .insert_header("request-id", "req_011")
                    .set_body_json(vendor_error.clone()),
            )
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "17");
        assert_eq!(response.headers()["request-id"], "req_011");
        assert_eq!(body_json(response).await, vendor_error);

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("error=upstream_status status=429"));
    }

    #[tokio::test]
    async fn test_upstream_server_error_is_preserved() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("endpoint scaling up"))
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out_with_504() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(serde_json::json!({})),
            )
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &dir);
        let mut state = AppState::from_config(&config).unwrap();
        state.relay =
            StreamingRelay::new(Duration::from_secs(1), Duration::from_millis(300)).unwrap();
        let app = create_router(Arc::new(state));

        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("error=upstream_timeout status=504"));
    }

    #[tokio::test]
    async fn test_unknown_model_never_reaches_upstream() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let app = create_router(test_state(&test_config(&mock_server.uri(), &dir)));
        let response = app
            .oneshot(agent_request(&messages_body("gpt-4o")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("error=routing_error status=400"));
    }

    #[tokio::test]
    async fn test_unwritable_log_does_not_fail_requests() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&mock_server)
            .await;

        let mut config = test_config(&mock_server.uri(), &dir);
        // A directory where the log file should be
        config.log.path = dir.path().to_path_buf();
        let app = create_router(test_state(&config));

        let response = app
            .oneshot(agent_request(&messages_body("claude-3-opus")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
