//! In-process session registry
//!
//! Maps `mcp-session-id` values to their [`SessionTransport`]. A transport
//! removes itself from the registry when it closes; idle ones are closed by
//! the reaper.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::session::{SessionIdGenerator, UuidSessionIds};
use crate::transport::{MessageHandler, SessionTransport};

type SessionMap = DashMap<String, Arc<SessionTransport>>;

/// Live sessions of one server
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    handler: Arc<dyn MessageHandler>,
    ids: Arc<dyn SessionIdGenerator>,
    config: TransportConfig,
}

impl SessionRegistry {
    /// Create a registry wiring every new session to `handler`
    pub fn new(handler: Arc<dyn MessageHandler>, config: TransportConfig) -> Self {
        Self::with_id_generator(handler, config, Arc::new(UuidSessionIds))
    }

    /// Create a registry with a custom session id source
    pub fn with_id_generator(
        handler: Arc<dyn MessageHandler>,
        config: TransportConfig,
        ids: Arc<dyn SessionIdGenerator>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            handler,
            ids,
            config,
        }
    }

    /// Transport for `session_id`, if it is live
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionTransport>> {
        self.sessions
            .get(session_id)
            .map(|t| Arc::clone(t.value()))
            .filter(|t| !t.is_closed())
    }

    /// Transport for `session_id`, creating it (under a fresh id when `None`)
    pub fn get_or_create(&self, session_id: Option<&str>) -> Arc<SessionTransport> {
        if let Some(existing) = session_id.and_then(|id| self.get(id)) {
            return existing;
        }

        let id = session_id
            .filter(|id| !id.is_empty())
            .map_or_else(|| self.ids.generate(), String::from);

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(slot) if !slot.get().is_closed() => Arc::clone(slot.get()),
            // A closed transport whose close callback has not run yet.
            Entry::Occupied(mut slot) => {
                let transport = self.create(&id);
                slot.insert(Arc::clone(&transport));
                transport
            }
            Entry::Vacant(slot) => {
                let transport = self.create(&id);
                slot.insert(Arc::clone(&transport));
                transport
            }
        }
    }

    fn create(&self, id: &str) -> Arc<SessionTransport> {
        let transport = SessionTransport::new(Some(id.to_string()), self.config.clone());
        transport.set_message_handler(Arc::clone(&self.handler));

        let sessions: Weak<SessionMap> = Arc::downgrade(&self.sessions);
        let this = Arc::downgrade(&transport);
        let closed_id = id.to_string();
        transport.set_close_callback(move || {
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            // Only our own entry; the id may already belong to a successor.
            if sessions
                .remove_if(&closed_id, |_, t| std::ptr::eq(Arc::as_ptr(t), this.as_ptr()))
                .is_some()
            {
                debug!(session_id = %closed_id, "Session removed from registry");
            }
        });

        info!(session_id = %id, "Created session");
        transport
    }

    /// Close and forget `session_id`. Returns whether it existed.
    pub fn close(&self, session_id: &str) -> bool {
        // Take it out first; the close callback removes by key too.
        match self.sessions.remove(session_id) {
            Some((_, transport)) => {
                transport.close();
                true
            }
            None => false,
        }
    }

    /// Close every session
    pub fn close_all(&self) {
        let transports: Vec<Arc<SessionTransport>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();
        for transport in transports {
            transport.close();
        }
    }

    /// Close every session idle for at least `idle_for`. Returns how many
    /// were closed.
    pub fn reap_idle(&self, idle_for: Duration) -> usize {
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle(idle_for))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in candidates {
            // Re-check under the shard lock; traffic may have arrived since.
            if let Some((_, transport)) = self
                .sessions
                .remove_if(&id, |_, t| t.is_idle(idle_for))
            {
                transport.close();
                debug!(session_id = %id, "Reaped idle session");
                reaped += 1;
            }
        }
        reaped
    }

    /// Run [`SessionRegistry::reap_idle`] periodically until `shutdown` fires
    pub fn spawn_reaper(
        self: &Arc<Self>,
        idle_for: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = (idle_for / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        let reaped = registry.reap_idle(idle_for);
                        if reaped > 0 {
                            info!(reaped, remaining = registry.len(), "Closed idle sessions");
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
