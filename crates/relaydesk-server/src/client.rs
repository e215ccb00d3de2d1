//! Duplex WebSocket connections: upgrade, reader/writer split, liveness.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use relaydesk_core::ids::{AgentId, ConnectionId, SessionId, UserId};
use relaydesk_core::session::Participant;
use relaydesk_core::RelayError;
use relaydesk_store::SessionRepo;
use relaydesk_telemetry::MetricsRecorder;

use crate::connection::ClientConnection;
use crate::handlers::ApiError;
use crate::metrics;
use crate::presence::PresenceRegistry;
use crate::server::AppState;
use crate::wire::{self, InboundFrame};

/// Query string of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}

/// Validate the identity a connection is opened with. Exactly one of
/// `userId`/`agentId`. Users must own the session they bind to; agents may
/// bind to any existing session (they only see it once assigned) or to none
/// for the lobby.
pub fn resolve_identity(
    sessions: &SessionRepo,
    params: &ConnectParams,
) -> Result<(Option<SessionId>, Participant), RelayError> {
    let participant = match (non_blank(params.user_id.as_ref()), non_blank(params.agent_id.as_ref())) {
        (Some(user), None) => Participant::User(UserId::from_raw(user)),
        (None, Some(agent)) => Participant::Agent(AgentId::from_raw(agent)),
        _ => {
            return Err(RelayError::InvalidRequest(
                "exactly one of userId or agentId is required".into(),
            ))
        }
    };

    let session_id = non_blank(params.session_id.as_ref()).map(SessionId::from_raw);
    match (&session_id, &participant) {
        (None, Participant::User(_)) => {
            return Err(RelayError::InvalidRequest("sessionId is required for users".into()));
        }
        (Some(id), Participant::User(user)) => {
            let session = sessions.get(id)?;
            if &session.user_id != user {
                return Err(RelayError::NotParticipant {
                    session_id: id.clone(),
                    participant: participant.to_string(),
                });
            }
        }
        (Some(id), Participant::Agent(_)) => {
            let _ = sessions.get(id)?;
        }
        (None, Participant::Agent(_)) => {}
    }
    Ok((session_id, participant))
}

/// GET /ws?sessionId=&userId=|agentId=
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> Response {
    match resolve_identity(&state.sessions, &params) {
        Ok((session_id, participant)) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, session_id, participant))
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: Option<SessionId>,
    participant: Participant,
) {
    let (conn, rx) = match state.router.attach(session_id, participant).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(error = %e, "failed to attach connection");
            return;
        }
    };
    let role = conn.participant.role().to_string();
    state.metrics.gauge_add(metrics::WS_CONNECTIONS_ACTIVE, &[], 1);
    state
        .metrics
        .counter_inc(metrics::WS_CONNECTIONS_TOTAL, &[("role", &role)], 1);
    info!(
        conn_id = %conn.id,
        participant = %conn.participant,
        session_id = ?conn.session_id,
        "client connected"
    );

    handle_ws_connection(socket, Arc::clone(&conn), rx, state.clone()).await;

    let _ = state.presence.unregister(&conn.id);
    state.metrics.gauge_add(metrics::WS_CONNECTIONS_ACTIVE, &[], -1);
    info!(conn_id = %conn.id, "client disconnected");
}

type WsSink = SplitSink<WebSocket, WsMessage>;

/// Write one text frame. Returns false once the socket is unusable.
async fn write_text(ws_tx: &mut WsSink, text: String, write_timeout: Duration, conn_id: &ConnectionId) -> bool {
    match tokio::time::timeout(write_timeout, ws_tx.send(WsMessage::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            let err = RelayError::ConnectionLost(e.to_string());
            debug!(conn_id = %conn_id, error = %err, "socket write failed");
            false
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "socket write timed out, dropping connection");
            false
        }
    }
}

/// Split the socket into a writer fed by the connection's queue (plus
/// periodic pings) and a reader that relays inbound frames. Returns when
/// either side finishes.
async fn handle_ws_connection(
    socket: WebSocket,
    conn: Arc<ClientConnection>,
    mut rx: mpsc::Receiver<String>,
    state: AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = state.settings.heartbeat_interval();
    let write_timeout = state.settings.delivery_timeout();
    let cancel = state.shutdown.token();

    let writer_conn = Arc::clone(&conn);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = writer_conn.closed() => {
                    // frames queued before the close still go out
                    while let Ok(text) = rx.try_recv() {
                        if !write_text(&mut ws_tx, text, write_timeout, &writer_conn.id).await {
                            break;
                        }
                    }
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if !write_text(&mut ws_tx, text, write_timeout, &writer_conn.id).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    trace!(conn_id = %writer_conn.id, "sent ping");
                }
            }
        }
        let _ = tokio::time::timeout(write_timeout, ws_tx.send(WsMessage::Close(None))).await;
    });

    let reader_conn = Arc::clone(&conn);
    let reader_state = state.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            reader_conn.mark_alive();
            match msg {
                WsMessage::Text(text) => {
                    handle_inbound(&reader_state, &reader_conn, text.as_str()).await;
                }
                WsMessage::Close(_) => break,
                // pongs only refresh liveness; axum answers pings itself
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
    }
    writer.abort();
    reader.abort();
}

async fn handle_inbound(state: &AppState, conn: &ClientConnection, raw: &str) {
    let frame: InboundFrame = match serde_json::from_str(raw) {
        Ok(f) => f,
        Err(e) => {
            debug!(conn_id = %conn.id, error = %e, "invalid inbound frame");
            let err = RelayError::InvalidRequest(format!("invalid frame: {e}"));
            let _ = state.router.push(conn, wire::error_frame(&err));
            return;
        }
    };
    let Some(session_id) = &conn.session_id else {
        let err = RelayError::InvalidRequest("connection is not bound to a session".into());
        let _ = state.router.push(conn, wire::error_frame(&err));
        return;
    };

    if let Err(e) = state
        .router
        .relay(
            session_id,
            conn.participant.clone().into(),
            &frame.message,
            Some(&conn.id),
        )
        .await
    {
        debug!(conn_id = %conn.id, code = e.error_kind(), "relay rejected");
        let _ = state.router.push(conn, wire::error_frame(&e));
    }
}

/// Periodically unregister connections that stopped responding. Session
/// state is never touched.
pub fn start_cleanup_task(
    presence: Arc<PresenceRegistry>,
    recorder: Arc<MetricsRecorder>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => break,
            }
            let evicted = presence.sweep_dead(timeout);
            for conn in &evicted {
                warn!(
                    conn_id = %conn.id,
                    participant = %conn.participant,
                    idle_secs = conn.idle_for().as_secs(),
                    "evicted unresponsive connection"
                );
            }
            if !evicted.is_empty() {
                recorder.counter_inc(metrics::WS_EVICTIONS_TOTAL, &[], evicted.len() as u64);
            }
        }
    })
}
