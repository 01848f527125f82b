//! End-to-end tests of the session transport
//!
//! Drives `SessionTransport` directly with hand-written handlers:
//! - POST request/response correlation, notifications, failures
//! - SSE stream lifecycle, heartbeat, push delivery
//! - close semantics

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::Notify;

use mcp_session_transport::config::{AuthConfig, TransportConfig};
use mcp_session_transport::gateway::AuthGate;
use mcp_session_transport::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcResponse, RequestId,
};
use mcp_session_transport::transport::{MessageHandler, SessionTransport};
use mcp_session_transport::{Error, Result};

/// Answers every request with `"ok"` before returning
struct OkHandler;

#[async_trait]
impl MessageHandler for OkHandler {
    async fn on_message(&self, transport: Arc<SessionTransport>, message: JsonRpcMessage) -> Result<()> {
        if let JsonRpcMessage::Request(request) = message {
            transport
                .send(JsonRpcResponse::success(request.id, json!("ok")).into())
                .await?;
        }
        Ok(())
    }
}

/// Answers from a background task after `delay`, echoing the method name
struct DeferredHandler {
    delay: Duration,
}

#[async_trait]
impl MessageHandler for DeferredHandler {
    async fn on_message(&self, transport: Arc<SessionTransport>, message: JsonRpcMessage) -> Result<()> {
        if let JsonRpcMessage::Request(request) = message {
            let delay = if request.method == "slow" { self.delay } else { Duration::ZERO };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = transport
                    .send(JsonRpcResponse::success(request.id, json!(request.method)).into())
                    .await;
            });
        }
        Ok(())
    }
}

/// Never answers; signals each invocation
#[derive(Default)]
struct SilentHandler {
    invoked: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for SilentHandler {
    async fn on_message(&self, _: Arc<SessionTransport>, _: JsonRpcMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invoked.notify_one();
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn on_message(&self, _: Arc<SessionTransport>, _: JsonRpcMessage) -> Result<()> {
        Err(Error::handler("boom"))
    }
}

fn transport_with(handler: Arc<dyn MessageHandler>) -> Arc<SessionTransport> {
    let transport = SessionTransport::new(Some("session-1".to_string()), TransportConfig::default());
    transport.set_message_handler(handler);
    transport
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn next_event(body: &mut axum::body::BodyDataStream) -> Option<String> {
    let chunk = body.next().await?.unwrap();
    Some(String::from_utf8(chunk.to_vec()).unwrap())
}

// ── POST ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_post_request_returns_handler_response() {
    let transport = transport_with(Arc::new(OkHandler));
    let response = transport
        .handle_post_request(
            &HeaderMap::new(),
            br#"{"jsonrpc":"2.0","method":"foo","id":1}"#,
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_HEADERS],
        "Content-Type, mcp-session-id, Authorization"
    );
    assert_eq!(headers["mcp-session-id"], "session-1");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"jsonrpc":"2.0","id":1,"result":"ok"}"#);
}

#[tokio::test]
async fn test_post_without_session_id_omits_header() {
    let transport = SessionTransport::new(None, TransportConfig::default());
    transport.set_message_handler(Arc::new(OkHandler));
    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":"a"}"#, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("mcp-session-id").is_none());
}

#[tokio::test]
async fn test_post_notification_returns_null_and_calls_handler_once() {
    let handler = Arc::new(SilentHandler::default());
    let transport = transport_with(handler.clone());

    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"jsonrpc":"2.0","method":"foo"}"#, None)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"null");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_invalid_json_is_internal_error() {
    let transport = transport_with(Arc::new(OkHandler));
    let response = transport
        .handle_post_request(&HeaderMap::new(), b"{not json", None)
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32603);
    assert_eq!(body["id"], Value::Null);
    assert!(!body["error"]["message"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_post_handler_error_is_reported() {
    let transport = transport_with(Arc::new(FailingHandler));
    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":1}"#, None)
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(
        body,
        json!({"jsonrpc": "2.0", "error": {"code": -32603, "message": "boom"}, "id": null})
    );
}

#[tokio::test]
async fn test_post_without_handler_is_method_not_found() {
    let transport = SessionTransport::new(Some("s".into()), TransportConfig::default());
    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":5}"#, None)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32601, "message": "Method not found"}})
    );
}

#[tokio::test]
async fn test_post_message_without_method_is_method_not_found() {
    let transport = transport_with(Arc::new(OkHandler));
    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"jsonrpc":"2.0","id":7,"result":1}"#, None)
        .await;
    let body = body_json(response).await;
    assert_eq!(body["id"], 7);
    assert_eq!(body["error"]["code"], -32601);

    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"jsonrpc":"2.0"}"#, None)
        .await;
    let body = body_json(response).await;
    assert_eq!(body["id"], 0);
    assert_eq!(body["error"]["message"], "Method not found");
}

#[tokio::test]
async fn test_post_request_with_null_id_is_answered() {
    let transport = transport_with(Arc::new(OkHandler));
    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":null}"#, None)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"jsonrpc":"2.0","id":null,"result":"ok"}"#);
}

#[tokio::test]
async fn test_post_malformed_request_is_invalid_request() {
    let transport = transport_with(Arc::new(OkHandler));
    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":42,"id":1}"#, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn test_post_rejected_by_auth_gate() {
    let transport = transport_with(Arc::new(OkHandler));
    let gate = AuthGate::from_config(&AuthConfig::with_key("abc123"));

    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":1}"#, Some(&gate))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["code"], -32600);

    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
    let response = transport
        .handle_post_request(&headers, br#"{"method":"foo","id":1}"#, Some(&gate))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let transport = transport_with(Arc::new(DeferredHandler {
        delay: Duration::from_millis(50),
    }));

    let slow_headers = HeaderMap::new();
    let fast_headers = HeaderMap::new();
    let slow = transport.handle_post_request(
        &slow_headers,
        br#"{"jsonrpc":"2.0","method":"slow","id":1}"#,
        None,
    );
    let fast = transport.handle_post_request(
        &fast_headers,
        br#"{"jsonrpc":"2.0","method":"fast","id":2}"#,
        None,
    );
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(body_json(slow).await, json!({"jsonrpc": "2.0", "id": 1, "result": "slow"}));
    assert_eq!(body_json(fast).await, json!({"jsonrpc": "2.0", "id": 2, "result": "fast"}));
}

#[tokio::test]
async fn test_duplicate_in_flight_id_is_rejected() {
    let handler = Arc::new(SilentHandler::default());
    let transport = SessionTransport::new(
        Some("s".into()),
        TransportConfig {
            request_timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        },
    );
    transport.set_message_handler(handler.clone());

    let first = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":1}"#, None)
                .await
        })
    };
    handler.invoked.notified().await;

    let second = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":1}"#, None)
        .await;
    let body = body_json(second).await;
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], 1);

    transport
        .send(JsonRpcResponse::success(RequestId::from(1_i64), json!("first")).into())
        .await
        .unwrap();
    let first = first.await.unwrap();
    assert_eq!(body_json(first).await["result"], "first");
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let handler = Arc::new(SilentHandler::default());
    let transport = SessionTransport::new(
        Some("s".into()),
        TransportConfig {
            request_timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        },
    );
    transport.set_message_handler(handler.clone());

    let response = transport
        .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":1}"#, None)
        .await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32603);
    assert_eq!(body["error"]["message"], "Request timed out");

    // A late answer no longer has a waiter and is not an error
    transport
        .send(JsonRpcResponse::success(RequestId::from(1_i64), json!("late")).into())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_fails_waiting_request() {
    let handler = Arc::new(SilentHandler::default());
    let transport = transport_with(handler.clone());

    let pending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .handle_post_request(&HeaderMap::new(), br#"{"method":"foo","id":1}"#, None)
                .await
        })
    };
    handler.invoked.notified().await;
    transport.close();

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["error"]["message"], "Transport is closed");
}

// ── send / close ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_after_close_fails() {
    let transport = transport_with(Arc::new(OkHandler));
    transport.close();
    let err = transport
        .send(JsonRpcNotification::new("notifications/message", None).into())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportClosed));
}

#[tokio::test]
async fn test_send_without_stream_is_noop() {
    let transport = transport_with(Arc::new(OkHandler));
    assert!(!transport.has_sse_channel());
    transport
        .send(JsonRpcNotification::new("notifications/message", None).into())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent_and_fires_callback_once() {
    let transport = transport_with(Arc::new(OkHandler));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    transport.set_close_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    transport.close();
    transport.close();
    assert!(transport.is_closed());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_generated_session_ids_differ() {
    assert_ne!(
        SessionTransport::generate_session_id(),
        SessionTransport::generate_session_id()
    );
}

// ── SSE ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_without_session_id_is_bad_request() {
    let transport = SessionTransport::new(None, TransportConfig::default());
    let response = transport.handle_get_request(None, None);
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"Session ID required for SSE");
}

#[tokio::test]
async fn test_get_rejected_by_auth_gate_only_with_headers() {
    let transport = transport_with(Arc::new(OkHandler));
    let gate = AuthGate::from_config(&AuthConfig::with_key("abc123"));

    let mut wrong = HeaderMap::new();
    wrong.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
    let response = transport.handle_get_request(Some(&wrong), Some(&gate));
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        r#"Bearer realm="MCP Server""#
    );

    // No request headers to inspect: the gate is skipped
    let response = transport.handle_get_request(None, Some(&gate));
    assert_eq!(response.status(), StatusCode::OK);
    transport.close();
}

#[tokio::test(start_paused = true)]
async fn test_sse_stream_lifecycle() {
    let transport = transport_with(Arc::new(OkHandler));
    let response = transport.handle_get_request(None, None);

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_HEADERS],
        "Cache-Control, mcp-session-id, Authorization"
    );
    assert_eq!(headers["mcp-session-id"], "session-1");
    assert!(transport.has_sse_channel());

    let mut body = response.into_body().into_data_stream();
    assert_eq!(
        next_event(&mut body).await.unwrap(),
        "data: Connected to MCP server\n\n"
    );

    transport
        .send(JsonRpcNotification::new("notifications/progress", Some(json!({"p": 1}))).into())
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut body).await.unwrap(),
        "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"p\":1}}\n\n"
    );

    let before = tokio::time::Instant::now();
    assert_eq!(next_event(&mut body).await.unwrap(), "event: ping\ndata: ping\n\n");
    assert!(before.elapsed() >= Duration::from_secs(29));

    transport.close();
    assert!(!transport.has_sse_channel());
    assert!(next_event(&mut body).await.is_none());
}

#[tokio::test]
async fn test_unclaimed_response_is_pushed_over_sse() {
    let transport = transport_with(Arc::new(OkHandler));
    let mut body = transport.handle_get_request(None, None).into_body().into_data_stream();
    next_event(&mut body).await.unwrap();

    transport
        .send(JsonRpcResponse::success(RequestId::from(99_i64), json!(true)).into())
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut body).await.unwrap(),
        "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":99,\"result\":true}\n\n"
    );
    transport.close();
}

#[tokio::test]
async fn test_client_disconnect_closes_transport() {
    let transport = transport_with(Arc::new(OkHandler));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    transport.set_close_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let response = transport.handle_get_request(None, None);
    drop(response);

    assert!(transport.is_closed());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    transport.close();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_stream_replaces_first() {
    let transport = transport_with(Arc::new(OkHandler));
    let mut first = transport.handle_get_request(None, None).into_body().into_data_stream();
    next_event(&mut first).await.unwrap();

    let mut second = transport.handle_get_request(None, None).into_body().into_data_stream();
    next_event(&mut second).await.unwrap();

    // The replaced stream ends without closing the session
    assert!(next_event(&mut first).await.is_none());
    drop(first);
    assert!(!transport.is_closed());

    transport
        .send(JsonRpcNotification::new("n", None).into())
        .await
        .unwrap();
    assert!(next_event(&mut second).await.unwrap().starts_with("event: message\n"));
    transport.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_racing_stream_open_leaves_no_live_stream() {
    for _ in 0..200 {
        let transport = transport_with(Arc::new(OkHandler));
        let closer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.close() })
        };
        let response = transport.handle_get_request(None, None);
        closer.await.unwrap();

        assert!(transport.is_closed());
        assert!(!transport.has_sse_channel());
        if response.status() == StatusCode::OK {
            // The stream may carry the greeting, but must then end
            let mut body = response.into_body().into_data_stream();
            let first = next_event(&mut body).await;
            if first.is_some() {
                assert!(next_event(&mut body).await.is_none());
            }
        } else {
            assert_eq!(response.status(), StatusCode::GONE);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_stream_keeps_session_busy() {
    let transport = transport_with(Arc::new(OkHandler));
    let idle = Duration::from_secs(60);

    let response = transport.handle_get_request(None, None);
    tokio::time::advance(idle * 2).await;
    assert!(!transport.is_idle(idle));

    drop(response);
    transport.close();
    let fresh = transport_with(Arc::new(OkHandler));
    assert!(!fresh.is_idle(idle));
    tokio::time::advance(idle).await;
    assert!(fresh.is_idle(idle));
}

#[tokio::test]
async fn test_get_on_closed_transport_is_gone() {
    let transport = transport_with(Arc::new(OkHandler));
    transport.close();
    let response = transport.handle_get_request(None, None);
    assert_eq!(response.status(), StatusCode::GONE);
}
