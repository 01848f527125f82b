//! Server-Sent Events channel for server-to-client push
//!
//! One channel per GET stream. It frames `event`/`data` blocks, keeps the
//! connection alive with a `ping` heartbeat, and tears the heartbeat down
//! synchronously when the channel closes or the client disconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::push::PushChannel;

/// Data of the unnamed event sent when the stream opens
pub const CONNECTED_MESSAGE: &str = "Connected to MCP server";

/// Event name (and data) of the heartbeat
pub const PING_EVENT: &str = "ping";

/// Event name for pushed JSON-RPC messages
pub const MESSAGE_EVENT: &str = "message";

/// Encode one SSE block: optional `event:` line, one `data:` line per line of
/// `data`, blank-line terminator.
#[must_use]
pub fn encode_event(data: &str, event: Option<&str>) -> Bytes {
    let mut frame = String::with_capacity(data.len() + 32);
    if let Some(event) = event {
        frame.push_str("event: ");
        frame.push_str(event);
        frame.push('\n');
    }
    if data.is_empty() {
        frame.push_str("data: \n");
    }
    for line in data.lines() {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

/// Outbound SSE stream bound to one session
pub struct SseChannel {
    push: Arc<dyn PushChannel>,
    closed: AtomicBool,
    heartbeat: CancellationToken,
}

impl std::fmt::Debug for SseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseChannel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SseChannel {
    /// Open a channel over `push`.
    ///
    /// Sends the connection event, starts the heartbeat, and arranges for
    /// `on_cancel` to run once if the client disconnects before the server
    /// closes the channel. Must be called inside a tokio runtime.
    pub fn open<F>(push: Arc<dyn PushChannel>, heartbeat_interval: Duration, on_cancel: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let channel = Arc::new(Self {
            push,
            closed: AtomicBool::new(false),
            heartbeat: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&channel);
        channel.push.on_cancel(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                channel.mark_cancelled();
            }
            on_cancel();
        }));

        channel.send_message(CONNECTED_MESSAGE, None);
        channel.spawn_heartbeat(heartbeat_interval);
        channel
    }

    fn spawn_heartbeat(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        let token = self.heartbeat.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(channel) = weak.upgrade() else { break };
                        channel.send_message(PING_EVENT, Some(PING_EVENT));
                    }
                }
            }
            debug!("SSE heartbeat stopped");
        });
    }

    /// Push one event. Silently ignored once closed; delivery failures are
    /// logged and never surface to the caller.
    pub fn send_message(&self, data: &str, event: Option<&str>) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.push.enqueue(encode_event(data, event)) {
            warn!(error = %e, event = event.unwrap_or("(unnamed)"), "Error sending SSE message");
        }
    }

    /// Whether the channel stopped accepting events
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the heartbeat has been told to stop
    #[must_use]
    pub fn heartbeat_stopped(&self) -> bool {
        self.heartbeat.is_cancelled()
    }

    /// Close from the server side. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.cancel();
        if let Err(e) = self.push.close() {
            warn!(error = %e, "Error closing SSE stream");
        }
    }

    fn mark_cancelled(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.heartbeat.cancel();
        debug!("SSE stream cancelled by client");
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        self.heartbeat.cancel();
    }
}
