//! Session-scoped JSON-RPC transport over HTTP POST and SSE
//!
//! A [`SessionTransport`] serves one session:
//! - POST carries a client request; the HTTP response is whatever response
//!   the [`MessageHandler`] eventually passes to [`SessionTransport::send`]
//! - GET opens the SSE stream; every other `send` is pushed there as a
//!   `message` event
//! - `close` ends the session, its stream, and any request still waiting

mod bridge;
mod push;
mod sse;

pub use self::bridge::{Inbound, MessageBridge, classify, method_not_found};
pub use self::push::{CancelCallback, PushChannel, PushStream, StreamPushChannel};
pub use self::sse::{CONNECTED_MESSAGE, MESSAGE_EVENT, PING_EVENT, SseChannel, encode_event};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::gateway::AuthGate;
use crate::protocol::JsonRpcMessage;
use crate::session::{SESSION_HEADER, generate_session_id};
use crate::{Error, Result};

/// Business-logic side of the transport.
///
/// Requests must eventually be answered by calling
/// [`SessionTransport::send`] with a response carrying the request's id.
/// Returning an error fails the HTTP exchange with a 500.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound request or notification
    async fn on_message(&self, transport: Arc<SessionTransport>, message: JsonRpcMessage)
    -> Result<()>;
}

/// Callback fired once when the transport closes
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

const POST_ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const POST_ALLOW_HEADERS: &str = "Content-Type, mcp-session-id, Authorization";
const SSE_ALLOW_HEADERS: &str = "Cache-Control, mcp-session-id, Authorization";

/// One session's transport
pub struct SessionTransport {
    session_id: Option<String>,
    config: TransportConfig,
    closed: AtomicBool,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    on_close: Mutex<Option<CloseCallback>>,
    sse: Mutex<Option<Arc<SseChannel>>>,
    bridge: MessageBridge,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .field("sse", &self.has_sse_channel())
            .field("pending", &self.bridge.pending_count())
            .finish_non_exhaustive()
    }
}

impl SessionTransport {
    /// Create an open transport for `session_id`
    #[must_use]
    pub fn new(session_id: Option<String>, config: TransportConfig) -> Arc<Self> {
        let bridge = MessageBridge::new(config.request_timeout);
        Arc::new(Self {
            session_id: session_id.filter(|id| !id.is_empty()),
            config,
            closed: AtomicBool::new(false),
            handler: RwLock::new(None),
            on_close: Mutex::new(None),
            sse: Mutex::new(None),
            bridge,
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Generate a new random session id
    #[must_use]
    pub fn generate_session_id() -> String {
        generate_session_id()
    }

    /// Nothing to start; present for the transport lifecycle contract.
    pub async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Session id, if any
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Register the business-logic handler
    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Register the callback run once on close
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_close.lock() = Some(Box::new(callback));
    }

    /// Whether the transport reached its terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether an SSE stream is currently open
    #[must_use]
    pub fn has_sse_channel(&self) -> bool {
        self.sse.lock().as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Whether the session has nothing in flight and has seen no traffic
    /// for at least `idle_for`.
    ///
    /// An open SSE stream or a request awaiting its response keeps the
    /// session busy regardless of age.
    #[must_use]
    pub fn is_idle(&self, idle_for: Duration) -> bool {
        !self.has_sse_channel()
            && self.in_flight.load(Ordering::SeqCst) == 0
            && self.bridge.pending_count() == 0
            && self.last_activity.lock().elapsed() >= idle_for
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Handle a POSTed JSON-RPC message.
    pub async fn handle_post_request(
        self: &Arc<Self>,
        headers: &HeaderMap,
        body: &[u8],
        auth: Option<&AuthGate>,
    ) -> Response {
        if let Some(gate) = auth {
            if !gate.validate(headers) {
                return AuthGate::unauthorized_response();
            }
        }

        let outcome = {
            let _active = InFlight::enter(self);
            self.process_body(body).await
        };

        match outcome {
            Ok(reply) => self.json_reply(reply.as_ref()),
            Err(e) => {
                let status = match e {
                    Error::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                error!(session_id = ?self.session_id, error = %e, "Error handling POST request");
                internal_error_response(status, &e)
            }
        }
    }

    async fn process_body(self: &Arc<Self>, body: &[u8]) -> Result<Option<JsonRpcMessage>> {
        let message: Value = serde_json::from_slice(body)?;
        let handler = self.handler.read().clone();
        self.bridge.process(self, handler, message).await
    }

    fn json_reply(&self, reply: Option<&JsonRpcMessage>) -> Response {
        let body = match serde_json::to_vec(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize JSON-RPC response");
                return internal_error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.into());
            }
        };

        let mut response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
                (
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static(POST_ALLOW_METHODS),
                ),
                (
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static(POST_ALLOW_HEADERS),
                ),
            ],
            body,
        )
            .into_response();
        self.insert_session_header(response.headers_mut());
        response
    }

    /// Open the SSE stream for this session.
    ///
    /// Auth runs only when both headers and a gate are supplied.
    pub fn handle_get_request(
        self: &Arc<Self>,
        headers: Option<&HeaderMap>,
        auth: Option<&AuthGate>,
    ) -> Response {
        if let (Some(headers), Some(gate)) = (headers, auth) {
            if !gate.validate(headers) {
                return AuthGate::unauthorized_response();
            }
        }

        let Some(session_id) = self.session_id.clone() else {
            return (
                StatusCode::BAD_REQUEST,
                [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
                "Session ID required for SSE",
            )
                .into_response();
        };

        if self.is_closed() {
            return session_gone_response();
        }

        self.touch();
        let (push, stream) = StreamPushChannel::new(self.config.sse_buffer_size);
        let weak = Arc::downgrade(self);
        let channel = SseChannel::open(push, self.config.heartbeat_interval, move || {
            if let Some(transport) = weak.upgrade() {
                debug!(session_id = ?transport.session_id, "SSE client disconnected");
                transport.close();
            }
        });

        let previous = self.sse.lock().replace(Arc::clone(&channel));
        if let Some(previous) = previous {
            debug!(session_id = %session_id, "Replacing existing SSE stream");
            previous.close();
        }
        // `close()` flips the flag before it takes the channel; a close that
        // ran since the check above may have missed this one.
        if self.is_closed() {
            let installed = self.sse.lock().take();
            if let Some(installed) = installed {
                installed.close();
            }
            channel.close();
            return session_gone_response();
        }
        info!(session_id = %session_id, "SSE stream opened");

        let mut response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (header::CONNECTION, HeaderValue::from_static("keep-alive")),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
                (
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static(SSE_ALLOW_HEADERS),
                ),
            ],
            Body::from_stream(stream),
        )
            .into_response();
        self.insert_session_header(response.headers_mut());
        response
    }

    fn insert_session_header(&self, headers: &mut HeaderMap) {
        let Some(id) = self.session_id.as_deref() else {
            return;
        };
        match HeaderValue::from_str(id) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(SESSION_HEADER), value);
            }
            Err(e) => warn!(error = %e, "Session id is not a valid header value"),
        }
    }

    /// Deliver a message to the client.
    ///
    /// A response whose id matches a waiting POST completes that exchange.
    /// Anything else goes out on the SSE stream, or nowhere if none is open.
    pub async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        self.touch();

        let message = match message {
            JsonRpcMessage::Response(response) => match self.bridge.resolve(response) {
                Ok(()) => return Ok(()),
                Err(unclaimed) => JsonRpcMessage::Response(unclaimed),
            },
            other => other,
        };

        let channel = self.sse.lock().clone();
        match channel {
            Some(channel) if !channel.is_closed() => {
                let data = serde_json::to_string(&message)?;
                channel.send_message(&data, Some(MESSAGE_EVENT));
            }
            _ => {
                debug!(session_id = ?self.session_id, "No SSE stream open; message dropped");
            }
        }
        Ok(())
    }

    /// Close the transport. Idempotent; the close callback runs exactly once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let channel = self.sse.lock().take();
        if let Some(channel) = channel {
            channel.close();
        }
        self.bridge.cancel_all();

        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        info!(session_id = ?self.session_id, "Transport closed");
    }
}

/// Counts a POST as in flight until dropped, refreshing the activity clock
/// on the way in and out.
struct InFlight<'a>(&'a SessionTransport);

impl<'a> InFlight<'a> {
    fn enter(transport: &'a SessionTransport) -> Self {
        transport.touch();
        transport.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(transport)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 410 for a GET on a closed session
fn session_gone_response() -> Response {
    (
        StatusCode::GONE,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        "Session closed",
    )
        .into_response()
}

/// 500/504 with a JSON-RPC internal-error envelope
fn internal_error_response(status: StatusCode, err: &Error) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "error": {
            "code": crate::error::rpc_codes::INTERNAL_ERROR,
            "message": err.client_message()
        },
        "id": null
    });
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body.to_string(),
    )
        .into_response()
}
