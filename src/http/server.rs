//! HTTP server lifecycle: bind, serve, and shut down on SIGINT/SIGTERM.

use crate::error::{DbError, DbResult};
use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// How long in-flight requests get to finish after a shutdown signal.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpServer {
    host: String,
    port: u16,
}

impl HttpServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serve `app` until SIGINT or SIGTERM, then stop accepting connections
    /// and give in-flight requests up to [`GRACEFUL_TIMEOUT`] to finish.
    pub async fn run(&self, app: Router) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::connection(
                format!("Failed to bind to {bind_addr}: {e}"),
                "Check that the port is available",
            )
        })?;
        info!(address = %bind_addr, "HTTP server listening");

        let (stopping_tx, stopping_rx) = oneshot::channel::<()>();
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            wait_for_signal().await;
            let _ = stopping_tx.send(());
        });
        let drain_limit = async move {
            match stopping_rx.await {
                Ok(()) => tokio::time::sleep(GRACEFUL_TIMEOUT).await,
                Err(_) => std::future::pending().await,
            }
        };

        tokio::select! {
            result = serve => result.map_err(|e| {
                error!(error = %e, "HTTP server error");
                DbError::internal(format!("HTTP server error: {e}"))
            })?,
            () = drain_limit => warn!(
                timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                "Requests still in flight at the shutdown timeout"
            ),
        }

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
