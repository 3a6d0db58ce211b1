//! HTTP listener with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener (so the
//! caller learns the actual port before traffic flows), and `serve()`
//! accepts connections until the shutdown future resolves, then drains.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::HttpConfig;
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Manages one HTTP listener's lifecycle.
pub struct HttpServer {
    config: HttpConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl HttpServer {
    /// Creates a server without binding any port.
    #[must_use]
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// Handlers take in-flight guards from it so shutdown can drain them.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound address, whose port differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;

        info!(%local, "HTTP listener bound");

        self.listener = Some(listener);
        Ok(local)
    }

    /// Serves `router` behind the shared middleware stack until `shutdown`
    /// resolves, then waits for in-flight requests to drain.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        self,
        router: Router,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let controller = self.shutdown;
        let router = router.layer(build_http_layers(&self.config));

        controller.set_ready();

        let signal_ctrl = Arc::clone(&controller);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                signal_ctrl.trigger_shutdown();
            })
            .await?;

        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("HTTP listener drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with in-flight requests remaining"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;
    use crate::network::shutdown::HealthState;

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut server = HttpServer::new(HttpConfig::loopback());
        let addr = server.start().await.expect("start should succeed");
        assert!(addr.port() > 0, "OS-assigned port should be > 0");
        assert!(server.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_fails() {
        let server = HttpServer::new(HttpConfig::loopback());
        let result = server.serve(Router::new(), std::future::ready(())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serves_until_shutdown_then_stops() {
        let mut server = HttpServer::new(HttpConfig::loopback());
        let addr = server.start().await.unwrap();
        let controller = server.shutdown_controller();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let handle = tokio::spawn(server.serve(router, async move {
            let _ = rx.await;
        }));

        let body = reqwest::get(format!("http://{addr}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");
        assert_eq!(controller.health_state(), HealthState::Ready);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
