//! Built-in message handler used by the standalone server
//!
//! Answers `ping` with an empty result and everything else with
//! "Method not found". Real deployments plug in their own
//! [`MessageHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::Result;
use crate::protocol::{JsonRpcMessage, JsonRpcResponse};
use crate::transport::{MessageHandler, SessionTransport, method_not_found};

/// Minimal handler: `ping` only
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinHandler;

#[async_trait]
impl MessageHandler for BuiltinHandler {
    async fn on_message(&self, transport: Arc<SessionTransport>, message: JsonRpcMessage) -> Result<()> {
        match message {
            JsonRpcMessage::Request(request) => {
                let response = if request.method == "ping" {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    method_not_found(request.id)
                };
                transport.send(response.into()).await
            }
            JsonRpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "Ignoring notification");
                Ok(())
            }
            JsonRpcMessage::Response(_) => Ok(()),
        }
    }
}
