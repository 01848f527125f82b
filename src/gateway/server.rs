//! Transport server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::auth::AuthGate;
use super::registry::SessionRegistry;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::transport::MessageHandler;
use crate::{Error, Result};

/// HTTP server hosting one transport per session
pub struct Gateway {
    config: Config,
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    /// Create a server dispatching every session's messages to `handler`
    pub fn new(config: Config, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new(handler, config.transport.clone()));
        Ok(Self { config, registry })
    }

    /// Session registry backing this server
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and serve until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            auth: AuthGate::from_config(&self.config.auth),
        });
        let app = create_router(state, self.config.server.max_body_size);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("MCP SESSION TRANSPORT v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!("  POST http://{addr}/  (JSON-RPC requests)");
        info!("  GET  http://{addr}/  (SSE stream, requires {})", crate::session::SESSION_HEADER);
        info!(
            heartbeat = ?self.config.transport.heartbeat_interval,
            request_timeout = ?self.config.transport.request_timeout,
            session_idle_timeout = ?self.config.transport.session_idle_timeout,
            "Transport settings"
        );
        if self.config.auth.required {
            info!(header = %self.config.auth.header_name, "AUTHENTICATION required");
        } else {
            warn!("AUTHENTICATION disabled - transport is open to all requests");
        }
        info!("============================================================");

        let reaper_shutdown = CancellationToken::new();
        let reaper = self.registry.spawn_reaper(
            self.config.transport.session_idle_timeout,
            reaper_shutdown.clone(),
        );

        let registry = Arc::clone(&self.registry);
        let grace = self.config.server.shutdown_timeout;
        let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();

        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open SSE streams never end on their own; close them so the drain can finish.
            registry.close_all();
            let _ = drained_tx.send(());
        })
        .into_future();

        let outcome = tokio::select! {
            result = serve => result.map_err(|e| Error::Internal(e.to_string())),
            () = async {
                let _ = drained_rx.await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(grace = ?grace, "Shutdown grace period elapsed; dropping open connections");
                Ok(())
            }
        };

        reaper_shutdown.cancel();
        if let Err(e) = reaper.await {
            warn!(error = %e, "Session reaper task failed");
        }

        outcome?;
        info!("Transport server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
