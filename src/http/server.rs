//! HTTP server implementation.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{router, AppState};
use crate::error::Result;

/// HTTP server for the rate limit API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Handler state
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have completed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server for rate limit API");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
