//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parley_providers::ProviderChain;
use tokio::net::TcpListener;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::directory::SessionDirectory;
use crate::dispatcher::{Dispatcher, SessionCleanup};
use crate::health::{self, HealthResponse};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::PROVIDER_DEGRADED;
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::store::SessionStore;
use crate::websocket::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Protocol dispatcher handed to each socket.
    pub dispatcher: Dispatcher,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Live sessions.
    pub directory: Arc<SessionDirectory>,
    /// Provider chains, for health reporting.
    pub chain: Arc<ProviderChain>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    /// Max inbound message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<SessionDirectory>,
    chain: Arc<ProviderChain>,
    dispatcher: Dispatcher,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server. `store` persists sessions across restarts when
    /// given.
    pub fn new(
        config: ServerConfig,
        chain: Arc<ProviderChain>,
        store: Option<Arc<dyn SessionStore>>,
        metrics: PrometheusHandle,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut directory = SessionDirectory::new(config.code_attempts);
        if let Some(store) = store {
            directory = directory.with_store(store);
        }
        let directory = Arc::new(directory);
        SessionCleanup::install(Arc::clone(&directory), &registry);

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&chain),
            config.dispatch(),
        );

        Self {
            config,
            registry,
            directory,
            chain,
            dispatcher,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            registry: Arc::clone(&self.registry),
            directory: Arc::clone(&self.directory),
            chain: Arc::clone(&self.chain),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            max_message_size: self.config.max_message_size,
            send_queue_capacity: self.config.send_queue_capacity,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown. Returns the
    /// bound address (useful with port 0).
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        self.shutdown.spawn("http", async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(token.cancelled_owned());
            if let Err(e) = serve.await {
                error!(error = %e, "http server failed");
            }
        });
        info!(%addr, "relay listening");
        Ok(addr)
    }

    /// Start the heartbeat monitor and the session expiry sweeper.
    pub fn spawn_background(&self) {
        let monitor = HeartbeatMonitor::new(Arc::clone(&self.registry));
        let interval = self.config.heartbeat_interval();
        let token = self.shutdown.token();
        self.shutdown.spawn("heartbeat", async move {
            monitor.run(interval, token).await;
        });

        let directory = Arc::clone(&self.directory);
        let chain = Arc::clone(&self.chain);
        let grace = self.config.grace_period();
        let every = self.config.cleanup_interval();
        let token = self.shutdown.token();
        self.shutdown.spawn("session-sweeper", async move {
            run_sweeper(directory, chain, grace, every, token).await;
        });
    }

    /// Start everything, wait for `signal`, then shut down gracefully.
    pub async fn serve_until<F>(&self, signal: F) -> std::io::Result<SocketAddr>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = self.listen().await?;
        self.spawn_background();
        signal.await;
        info!("shutdown requested");
        self.shutdown
            .graceful_shutdown(self.config.shutdown_timeout())
            .await;
        self.directory.flush_store().await;
        info!("relay stopped");
        Ok(addr)
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the session directory.
    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// One sweep: drop expired sessions, purge the store, refresh provider
/// health gauges.
async fn sweep_once(directory: &SessionDirectory, chain: &ProviderChain, grace: Duration) {
    let expired = directory.expire(grace);
    if !expired.is_empty() {
        debug!(count = expired.len(), "expired sessions removed");
    }
    if let Some(store) = directory.store() {
        match store.delete_expired(grace).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired session records purged"),
            Err(e) => warn!(error = %e, "failed to purge expired session records"),
        }
    }
    for (_, names) in chain.describe() {
        for name in names {
            let degraded = if chain.health().is_degraded(&name) { 1.0 } else { 0.0 };
            metrics::gauge!(PROVIDER_DEGRADED, "provider" => name).set(degraded);
        }
    }
}

async fn run_sweeper(
    directory: Arc<SessionDirectory>,
    chain: Arc<ProviderChain>,
    grace: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_once(&directory, &chain, grace).await,
            () = cancel.cancelled() => {
                debug!("session sweeper stopped");
                return;
            }
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.registry.len(),
        state.directory.len(),
        state.chain.health().degraded_providers(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let AppState {
        dispatcher,
        registry,
        shutdown,
        max_message_size,
        send_queue_capacity,
        ..
    } = state;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(
                socket,
                dispatcher,
                registry,
                shutdown.token(),
                send_queue_capacity,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use parley_core::{ConnectionId, SessionCode};
    use parley_providers::mock::MockProvider;
    use parley_providers::{ProviderHealthTracker, Synthesizer, Transcriber, Translator};
    use tower::ServiceExt;

    use crate::metrics::detached_handle;
    use crate::store::{MemorySessionStore, SessionStore};

    fn make_chain() -> Arc<ProviderChain> {
        let mock = Arc::new(MockProvider::new("mock").with_transcript("hello"));
        Arc::new(ProviderChain::new(
            vec![Arc::clone(&mock) as Arc<dyn Transcriber>],
            vec![Arc::clone(&mock) as Arc<dyn Translator>],
            Vec::<Arc<dyn Synthesizer>>::new(),
            Duration::from_secs(1),
            Arc::new(ProviderHealthTracker::new()),
        ))
    }

    fn make_server() -> RelayServer {
        RelayServer::new(ServerConfig::default(), make_chain(), None, detached_handle())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert!(server.registry().is_empty());
        assert!(server.directory().is_empty());
    }

    #[test]
    fn shutdown_coordinator_accessible() {
        let server = make_server();
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["active_sessions"], 0);
    }

    #[tokio::test]
    async fn health_counts_sessions() {
        let server = make_server();
        let _ = server
            .directory()
            .create_session(&ConnectionId::from("p1"), "en-US", None)
            .unwrap();
        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["active_sessions"], 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_json(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.shutdown().task_count(), 1);
        server.shutdown().graceful_shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions_and_records() {
        let store = Arc::new(MemorySessionStore::new());
        let server = RelayServer::new(
            ServerConfig::default(),
            make_chain(),
            Some(Arc::clone(&store) as Arc<dyn SessionStore>),
            detached_handle(),
        );
        let presenter = ConnectionId::from("p1");
        let code: SessionCode = server
            .directory()
            .create_session(&presenter, "en-US", None)
            .unwrap();
        let _ = server.directory().leave_session(&presenter);

        sweep_once(server.directory(), &server.chain, Duration::ZERO).await;
        assert!(!server.directory().contains(&code));
    }

    #[tokio::test]
    async fn background_tasks_stop_on_shutdown() {
        let server = make_server();
        server.spawn_background();
        assert_eq!(server.shutdown().task_count(), 2);
        server.shutdown().graceful_shutdown(Duration::from_secs(1)).await;
        assert!(server.shutdown().is_shutting_down());
        assert_eq!(server.shutdown().task_count(), 0);
    }
}
