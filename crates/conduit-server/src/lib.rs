//! HTTP API server for Conduit.
//!
//! Exposes the orchestration engine over a small REST surface:
//!
//! - `GET /` welcome message
//! - `GET /health` status and version
//! - `GET /tools` the current tool snapshot
//! - `POST /chat` one query, as JSON or as chunked plain text
//!
//! # Example
//!
//! ```ignore
//! use conduit_server::{AppState, Server, ServerConfig};
//!
//! let state = AppState::new(provider, registry, engine_config, ServerConfig::default());
//! Server::new(state).run().await?;
//! ```

pub mod config;
pub mod conversations;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use conversations::ConversationStore;
pub use error::{ErrorResponse, Result, ServerError};
pub use routes::{ChatRequest, ChatResponse, ToolEntry};
pub use state::AppState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// The Conduit HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let router = Router::new()
            .merge(routes::health_routes())
            .route("/tools", get(routes::list_tools_handler))
            .route("/chat", post(routes::chat_handler));

        let router = if self.state.config.request_tracing {
            router.layer(TraceLayer::new_for_http())
        } else {
            router
        };
        router.with_state(self.state.clone())
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = self.bind_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        info!("Starting server on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(format!("Server error: {}", e)))?;

        info!("Server stopped");
        Ok(())
    }

    /// Get the configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
