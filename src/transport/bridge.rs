//! Correlation of POSTed requests with the responses the handler sends
//!
//! Each inbound request registers a one-shot waiter under its id before the
//! handler runs. [`MessageBridge::resolve`] completes the waiter when the
//! handler sends a response carrying that id, so any number of requests with
//! distinct ids can be in flight on one session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{MessageHandler, SessionTransport};
use crate::error::rpc_codes;
use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use crate::{Error, Result};

/// Shape of an inbound message, decided by key presence
#[derive(Debug)]
pub enum Inbound {
    /// `method` and `id` present
    Request(JsonRpcRequest),
    /// `method` present, no `id`
    Notification(JsonRpcNotification),
    /// No `method`; answered with "Method not found" under this id
    Unroutable(RequestId),
    /// `method` present but fields have the wrong types
    Invalid(String),
}

/// Classify a raw inbound message
#[must_use]
pub fn classify(message: Value) -> Inbound {
    let has_method = message.get("method").is_some();
    let has_id = message.get("id").is_some();

    if !has_method {
        let id = message
            .get("id")
            .filter(|id| !id.is_null())
            .and_then(|id| serde_json::from_value(id.clone()).ok())
            .unwrap_or(RequestId::Number(0));
        return Inbound::Unroutable(id);
    }

    if has_id {
        match serde_json::from_value(message) {
            Ok(request) => Inbound::Request(request),
            Err(e) => Inbound::Invalid(e.to_string()),
        }
    } else {
        match serde_json::from_value(message) {
            Ok(notification) => Inbound::Notification(notification),
            Err(e) => Inbound::Invalid(e.to_string()),
        }
    }
}

/// "Method not found" envelope for `id`
#[must_use]
pub fn method_not_found(id: RequestId) -> JsonRpcResponse {
    JsonRpcResponse::error(Some(id), rpc_codes::METHOD_NOT_FOUND, "Method not found")
}

/// A registered request waiting for its response
#[derive(Debug)]
struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<JsonRpcResponse>,
}

/// Request/response correlation for one session
#[derive(Debug)]
pub struct MessageBridge {
    pending: DashMap<RequestId, Waiter>,
    next_ticket: AtomicU64,
    timeout: Duration,
}

impl MessageBridge {
    /// Create a bridge whose requests wait at most `timeout` for a response
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            timeout,
        }
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run one inbound message through the handler.
    ///
    /// Returns the response envelope for requests, `None` for notifications.
    pub async fn process(
        &self,
        transport: &Arc<SessionTransport>,
        handler: Option<Arc<dyn MessageHandler>>,
        message: Value,
    ) -> Result<Option<JsonRpcMessage>> {
        let inbound = classify(message);

        let Some(handler) = handler else {
            let id = match inbound {
                Inbound::Request(request) => request.id,
                Inbound::Unroutable(id) => id,
                Inbound::Notification(_) | Inbound::Invalid(_) => RequestId::Number(0),
            };
            return Ok(Some(method_not_found(id).into()));
        };

        match inbound {
            Inbound::Request(request) => self.process_request(transport, handler, request).await,
            Inbound::Notification(notification) => {
                debug!(method = %notification.method, "Dispatching notification");
                handler
                    .on_message(Arc::clone(transport), notification.into())
                    .await?;
                Ok(None)
            }
            Inbound::Unroutable(id) => Ok(Some(method_not_found(id).into())),
            Inbound::Invalid(reason) => {
                debug!(reason = %reason, "Rejecting malformed JSON-RPC message");
                Ok(Some(
                    JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Invalid Request")
                        .into(),
                ))
            }
        }
    }

    async fn process_request(
        &self,
        transport: &Arc<SessionTransport>,
        handler: Arc<dyn MessageHandler>,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcMessage>> {
        let id = request.id.clone();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(id = %id, "Request id already in flight");
                return Ok(Some(
                    JsonRpcResponse::error(
                        Some(id),
                        rpc_codes::INVALID_REQUEST,
                        "Request id already in flight",
                    )
                    .into(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(Waiter { ticket, tx });
            }
        }
        let _pending = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
            ticket,
        };

        debug!(id = %id, method = %request.method, "Dispatching request");
        let exchange = async {
            handler
                .on_message(Arc::clone(transport), request.into())
                .await?;
            rx.await.map_err(|_| Error::TransportClosed)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(Some(response.into())),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(id = %id, timeout = ?self.timeout, "Handler did not respond in time");
                Err(Error::RequestTimeout(self.timeout))
            }
        }
    }

    /// Hand `response` to the request waiting for its id.
    ///
    /// Gives the response back when nobody is waiting for it.
    pub fn resolve(&self, response: JsonRpcResponse) -> std::result::Result<(), JsonRpcResponse> {
        let Some(id) = response.id.as_ref() else {
            return Err(response);
        };
        match self.pending.remove(id) {
            Some((id, waiter)) => {
                if waiter.tx.send(response).is_err() {
                    debug!(id = %id, "Response arrived after the request was abandoned");
                }
                Ok(())
            }
            None => Err(response),
        }
    }

    /// Fail every waiting request with [`Error::TransportClosed`]
    pub fn cancel_all(&self) {
        self.pending.clear();
    }
}

/// Removes the waiter when the request finishes, times out, or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, Waiter>,
    id: RequestId,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // Only our own waiter; a newer request may reuse the id.
        self.pending
            .remove_if(&self.id, |_, waiter| waiter.ticket == self.ticket);
    }
}
