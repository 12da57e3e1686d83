//! HTTP server with graceful shutdown

use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{error::Result, handlers::router, state::AppState};

/// Login bodies are two short strings
const BODY_LIMIT_BYTES: usize = 16 * 1024;

/// Server instance
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server instance
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Router with the full middleware stack applied
    pub fn app(&self) -> Router {
        let service = &self.state.config().service;

        // Layers are applied in reverse order (bottom layer is innermost)
        router(self.state.clone())
            .layer(ConcurrencyLimitLayer::new(service.worker_pool_size))
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                service.timeout(),
            ))
            .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(CatchPanicLayer::new())
    }

    /// Bind `service.port` and serve until SIGINT or SIGTERM
    pub async fn serve(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config().service.port));
        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// In-flight requests are drained, then queued lockout events are
    /// handed to the channel before returning.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let config = self.state.config();
        tracing::info!(
            service = %config.service.name,
            addr = %listener.local_addr()?,
            worker_pool_size = config.service.worker_pool_size,
            timeout_secs = config.service.timeout_secs,
            max_attempts = config.lockout.max_attempts,
            "Server listening"
        );

        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Flushing queued lockout events");
        self.state.coordinator().emitter().flush().await;
        tracing::info!("Server shutdown complete");

        Ok(())
    }

    /// Get the application state
    pub fn state(&self) -> &AppState {
        &self.state
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    tracing::info!("Shutdown signal received, draining requests...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::account::{Account, MemoryAccountStore};
    use crate::attempts::MemoryAttemptCache;
    use crate::channel::MemoryEventLog;
    use crate::config::Config;
    use crate::lockout::{LockoutConfig, PlaintextVerifier};

    #[tokio::test]
    async fn test_shutdown_flushes_lockout_events() {
        let mut config = Config::default();
        config.lockout = LockoutConfig::default().with_max_attempts(1);

        let accounts = Arc::new(MemoryAccountStore::new());
        accounts.insert(Account::active("alice", "pw"));
        let log = MemoryEventLog::new();

        let state = AppState::builder()
            .config(config)
            .attempts(Arc::new(MemoryAttemptCache::new()))
            .accounts(accounts)
            .verifier(Arc::new(PlaintextVerifier))
            .publisher(Arc::new(log.clone()))
            .build()
            .unwrap();

        state.coordinator().authenticate("alice", "wrong").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Server::new(state)
            .serve_on(listener, std::future::ready(()))
            .await
            .unwrap();

        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity, "alice");
    }
}
