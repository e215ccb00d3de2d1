//! Axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use relaydesk_core::RelayError;
use relaydesk_store::{Database, MessageRepo, SessionRepo};
use relaydesk_telemetry::MetricsRecorder;

use crate::assistant::Assistant;
use crate::client;
use crate::config::ServerSettings;
use crate::coordinator::HandoffCoordinator;
use crate::fanout::NotificationFanout;
use crate::handlers;
use crate::locks::SessionLocks;
use crate::presence::PresenceRegistry;
use crate::router::MessageRouter;
use crate::shutdown::ShutdownCoordinator;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ServerSettings>,
    pub sessions: SessionRepo,
    pub messages: MessageRepo,
    pub presence: Arc<PresenceRegistry>,
    pub router: MessageRouter,
    pub coordinator: Arc<HandoffCoordinator>,
    pub metrics: Arc<MetricsRecorder>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every component over `db`. Agent engagements are rebuilt from
    /// the persisted human-mode sessions.
    pub fn new(
        db: Database,
        settings: ServerSettings,
        assistant: Arc<dyn Assistant>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, RelayError> {
        let sessions = SessionRepo::new(db.clone());
        let messages = MessageRepo::new(db);
        let presence = Arc::new(PresenceRegistry::new(settings.max_send_queue));
        let locks = Arc::new(SessionLocks::new());

        let assignments = sessions.active_assignments()?;
        if !assignments.is_empty() {
            info!(count = assignments.len(), "restored agent engagements");
        }
        presence.restore_engagements(assignments);

        let router = MessageRouter::new(
            sessions.clone(),
            messages.clone(),
            Arc::clone(&presence),
            Arc::clone(&locks),
            assistant,
            Arc::clone(&metrics),
            &settings.assistant_fallback_reply,
        );
        let fanout = Arc::new(NotificationFanout::new(Arc::clone(&presence), Arc::clone(&metrics)));
        let coordinator = Arc::new(HandoffCoordinator::new(
            sessions.clone(),
            messages.clone(),
            Arc::clone(&presence),
            locks,
            router.clone(),
            fanout,
            Arc::clone(&metrics),
            settings.close_connections_on_end,
        ));

        Ok(Self {
            settings: Arc::new(settings),
            sessions,
            messages,
            presence,
            router,
            coordinator,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        })
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/session/start", post(handlers::start_session))
        .route("/api/session/info", get(handlers::session_info))
        .route("/api/session/user/active", get(handlers::active_session))
        .route("/api/session/user/{user_id}", get(handlers::user_sessions))
        .route("/api/session/agent/{agent_id}", get(handlers::agent_sessions))
        .route("/api/session/messages", get(handlers::session_messages))
        .route("/api/session/end", post(handlers::end_session))
        .route("/api/session/transfer", post(handlers::assign_session))
        .route("/api/sessions/ai", get(handlers::assistant_sessions))
        .route("/api/agent/takeover", post(handlers::agent_takeover))
        .route("/api/agent/assign-session", post(handlers::assign_session))
        .route("/api/agent/status", post(handlers::set_availability))
        .route("/api/agent/active-sessions/{agent_id}", get(handlers::agent_sessions))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(client::ws_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, serve, and start background tasks. Returns a handle to stop them.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let shutdown = Arc::clone(&state.shutdown);
    let cleanup = client::start_cleanup_task(
        Arc::clone(&state.presence),
        Arc::clone(&state.metrics),
        state.settings.cleanup_interval(),
        state.settings.client_timeout(),
        shutdown.token(),
    );

    let token = shutdown.token();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
    });

    info!(addr = %local_addr, "relaydesk server started");

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        tasks: vec![server, cleanup],
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, close live sockets, and wait for background tasks.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        self.shutdown.graceful_shutdown(self.tasks, timeout).await;
        info!("relaydesk server stopped");
    }
}
