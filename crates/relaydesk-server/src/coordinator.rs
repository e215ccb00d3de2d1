//! Handoff Coordinator: the per-session state machine
//! `assistant-active -> human-active -> completed`.
//!
//! Every transition runs under the session lock and applies the state
//! change and its announcement in one store transaction, then delivers the
//! announcement before the lock is released. Agent claims go through a
//! presence reservation taken before any session lock.

use std::sync::Arc;

use relaydesk_telemetry::MetricsRecorder;
use serde::Serialize;
use tracing::{info, instrument};

use relaydesk_core::events::{HandoffKind, LifecycleEvent};
use relaydesk_core::ids::{AgentId, SessionId, UserId};
use relaydesk_core::session::{Availability, Participant, SessionMode, SessionStatus};
use relaydesk_core::RelayError;
use relaydesk_store::{MessageRepo, MessageRow, SessionChange, SessionRepo, SessionRow};

use crate::fanout::NotificationFanout;
use crate::locks::SessionLocks;
use crate::metrics;
use crate::presence::{AgentReservation, PresenceRegistry};
use crate::router::MessageRouter;
use crate::wire::{self, ChatFrame};

const SESSION_ENDED_NOTICE: &str = "This conversation has ended.";

/// Result of a successful takeover or assignment: the session after the
/// transition and its full log.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffOutcome {
    pub session_id: SessionId,
    pub session: SessionRow,
    pub messages: Vec<MessageRow>,
}

pub struct HandoffCoordinator {
    sessions: SessionRepo,
    messages: MessageRepo,
    presence: Arc<PresenceRegistry>,
    locks: Arc<SessionLocks>,
    router: MessageRouter,
    fanout: Arc<NotificationFanout>,
    metrics: Arc<MetricsRecorder>,
    close_on_end: bool,
}

impl HandoffCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionRepo,
        messages: MessageRepo,
        presence: Arc<PresenceRegistry>,
        locks: Arc<SessionLocks>,
        router: MessageRouter,
        fanout: Arc<NotificationFanout>,
        metrics: Arc<MetricsRecorder>,
        close_on_end: bool,
    ) -> Self {
        Self {
            sessions,
            messages,
            presence,
            locks,
            router,
            fanout,
            metrics,
            close_on_end,
        }
    }

    /// Open a new assistant-mode session for `user_id`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn start_session(&self, user_id: &UserId) -> Result<SessionRow, RelayError> {
        let session = self.sessions.create(user_id)?;
        info!(session_id = %session.id, "session started");
        let _ = self
            .fanout
            .broadcast_to_available_agents(&LifecycleEvent::SessionCreated {
                session_id: session.id.clone(),
                user_id: user_id.clone(),
            });
        Ok(session)
    }

    /// Claim an assistant-mode session for `agent_id`: the named one, or
    /// the longest-waiting eligible one when `session_id` is `None`.
    #[instrument(skip(self), fields(agent_id = %agent_id, session_id = ?session_id))]
    pub async fn takeover(
        &self,
        agent_id: &AgentId,
        session_id: Option<&SessionId>,
    ) -> Result<HandoffOutcome, RelayError> {
        let result = match session_id {
            Some(id) => self.claim_one(agent_id, id, HandoffKind::Takeover).await,
            None => self.claim_pooled(agent_id).await,
        };
        self.record("takeover", &result);
        result
    }

    /// Explicitly assign `session_id` to `agent_id`.
    #[instrument(skip(self), fields(agent_id = %agent_id, session_id = %session_id))]
    pub async fn assign(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<HandoffOutcome, RelayError> {
        let result = self.claim_one(agent_id, session_id, HandoffKind::Assign).await;
        self.record("assign", &result);
        result
    }

    /// Complete the session. Irreversible; a second call fails with
    /// `SessionClosed`.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn end(&self, session_id: &SessionId) -> Result<SessionRow, RelayError> {
        let result = self.end_locked(session_id).await;
        self.record("end", &result);
        if result.is_ok() {
            let _ = self
                .fanout
                .broadcast_to_available_agents(&LifecycleEvent::SessionEnded {
                    session_id: session_id.clone(),
                });
        }
        result
    }

    /// Declare an agent available or busy. Existing assignments are kept.
    pub fn set_availability(&self, agent_id: &AgentId, availability: Availability) {
        self.presence.set_agent_availability(agent_id, availability);
    }

    async fn claim_one(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
        kind: HandoffKind,
    ) -> Result<HandoffOutcome, RelayError> {
        let mut reservation = self.presence.reserve_agent(agent_id)?;
        self.claim(&mut reservation, session_id, kind).await
    }

    /// Walk eligible sessions oldest-waiting first; a session someone else
    /// won in the meantime is skipped.
    async fn claim_pooled(&self, agent_id: &AgentId) -> Result<HandoffOutcome, RelayError> {
        let mut reservation = self.presence.reserve_agent(agent_id)?;
        let candidates = self.sessions.list_assistant_mode_sessions()?;
        for candidate in candidates {
            match self
                .claim(&mut reservation, &candidate.session.id, HandoffKind::Takeover)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(RelayError::AlreadyAssigned(_) | RelayError::SessionClosed(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(RelayError::NoSessionAvailable)
    }

    async fn claim(
        &self,
        reservation: &mut AgentReservation<'_>,
        session_id: &SessionId,
        kind: HandoffKind,
    ) -> Result<HandoffOutcome, RelayError> {
        let agent_id = reservation.agent_id().clone();
        let guard = self.locks.lock(session_id).await;

        let current = self.sessions.get(session_id)?;
        if current.status.is_terminal() {
            return Err(RelayError::SessionClosed(session_id.clone()));
        }
        if current.mode == SessionMode::Human {
            return Err(RelayError::AlreadyAssigned(session_id.clone()));
        }

        let mut history = self.messages.list(session_id)?;
        let notice = format!("Agent {agent_id} has joined the conversation.");
        let change = SessionChange::Mode {
            mode: SessionMode::Human,
            agent: Some(agent_id.clone()),
        };
        let (session, notice_msg) = self.sessions.apply(session_id, &change, Some(&notice))?;
        reservation.commit(session_id);

        // The agent's connections on this session were not admitted before,
        // so they get the backlog first.
        let participant = Participant::Agent(agent_id.clone());
        let agent_conns: Vec<_> = self
            .presence
            .connections_for(session_id)
            .into_iter()
            .filter(|c| c.participant == participant)
            .collect();
        for msg in &history {
            if let Some(frame) = wire::encode(&ChatFrame::history(msg)) {
                for conn in &agent_conns {
                    let _ = self.router.push(conn, frame.clone());
                }
            }
        }
        if let Some(msg) = notice_msg {
            let _ = self.router.deliver_message(&session, &msg, None);
            history.push(msg);
        }
        let _ = self.router.deliver_state(&session);
        drop(guard);

        info!(
            session_id = %session_id,
            agent_id = %agent_id,
            action = kind.as_str(),
            "session handed to agent"
        );
        let _ = self
            .fanout
            .broadcast_to_available_agents(&LifecycleEvent::SessionTakenOver {
                session_id: session_id.clone(),
                agent_id,
                kind,
            });

        Ok(HandoffOutcome {
            session_id: session.id.clone(),
            session,
            messages: history,
        })
    }

    async fn end_locked(&self, session_id: &SessionId) -> Result<SessionRow, RelayError> {
        let guard = self.locks.lock(session_id).await;
        let current = self.sessions.get(session_id)?;
        if current.status.is_terminal() {
            return Err(RelayError::SessionClosed(session_id.clone()));
        }

        let (session, notice) = self.sessions.apply(
            session_id,
            &SessionChange::Status(SessionStatus::Completed),
            Some(SESSION_ENDED_NOTICE),
        )?;
        if let Some(agent) = &session.assigned_agent {
            self.presence.release_agent(agent, session_id);
        }
        if let Some(msg) = &notice {
            let _ = self.router.deliver_message(&session, msg, None);
        }
        let _ = self.router.deliver_state(&session);
        if self.close_on_end {
            for conn in self.presence.connections_for(session_id) {
                conn.close();
            }
        }
        drop(guard);

        info!(session_id = %session_id, "session ended");
        Ok(session)
    }

    fn record<T>(&self, transition: &str, result: &Result<T, RelayError>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.error_kind(),
        };
        self.metrics.counter_inc(
            metrics::HANDOFF_TRANSITIONS_TOTAL,
            &[("transition", transition), ("outcome", outcome)],
            1,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relaydesk_core::session::SenderRole;
    use relaydesk_store::Database;
    use tokio::sync::mpsc;

    use crate::assistant::CannedAssistant;

    struct Fixture {
        coordinator: HandoffCoordinator,
        sessions: SessionRepo,
        messages: MessageRepo,
        presence: Arc<PresenceRegistry>,
        locks: Arc<SessionLocks>,
        metrics: Arc<MetricsRecorder>,
    }

    fn fixture(close_on_end: bool) -> Fixture {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let messages = MessageRepo::new(db);
        let presence = Arc::new(PresenceRegistry::new(64));
        let locks = Arc::new(SessionLocks::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let router = MessageRouter::new(
            sessions.clone(),
            messages.clone(),
            presence.clone(),
            locks.clone(),
            Arc::new(CannedAssistant::new("canned")),
            metrics.clone(),
            "fallback",
        );
        let fanout = Arc::new(NotificationFanout::new(presence.clone(), metrics.clone()));
        let coordinator = HandoffCoordinator::new(
            sessions.clone(),
            messages.clone(),
            presence.clone(),
            locks.clone(),
            router,
            fanout,
            metrics.clone(),
            close_on_end,
        );
        Fixture {
            coordinator,
            sessions,
            messages,
            presence,
            locks,
            metrics,
        }
    }

    fn agent(name: &str) -> AgentId {
        AgentId::from_raw(name)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn texts(frames: &[String]) -> Vec<serde_json::Value> {
        frames
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn start_session_notifies_lobby() {
        let f = fixture(true);
        let (_lobby, mut rx) = f.presence.register(None, Participant::Agent(agent("a1")));
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        assert_eq!(s.mode, SessionMode::Assistant);

        let events = texts(&drain(&mut rx));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "new_session");
        assert_eq!(events[0]["payload"]["sessionId"], s.id.as_str());
    }

    #[tokio::test]
    async fn takeover_transitions_and_announces() {
        let f = fixture(true);
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        f.messages.append(&s.id, SenderRole::User, "help").unwrap();
        let (_u, mut user_rx) =
            f.presence.register(Some(s.id.clone()), Participant::User(UserId::from_raw("u1")));
        let (_a, mut agent_rx) = f.presence.register(Some(s.id.clone()), Participant::Agent(agent("a1")));

        let outcome = f.coordinator.takeover(&agent("a1"), None).await.unwrap();
        assert_eq!(outcome.session_id, s.id);
        assert_eq!(outcome.session.mode, SessionMode::Human);
        assert_eq!(outcome.session.assigned_agent, Some(agent("a1")));
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[1].sender, SenderRole::System);

        let user_frames = texts(&drain(&mut user_rx));
        assert_eq!(user_frames[0]["sender"], "system");
        assert!(user_frames[0]["message"].as_str().unwrap().contains("a1"));
        assert_eq!(user_frames[1]["type"], "state");

        let agent_frames = texts(&drain(&mut agent_rx));
        assert_eq!(agent_frames[0]["type"], "history");
        assert_eq!(agent_frames[0]["message"], "help");
        assert_eq!(agent_frames[1]["sender"], "system");
        assert_eq!(agent_frames[2]["mode"], "human");

        assert_eq!(
            f.metrics.counter_get(
                metrics::HANDOFF_TRANSITIONS_TOTAL,
                &[("transition", "takeover"), ("outcome", "ok")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn pooled_takeover_picks_oldest_waiting() {
        let f = fixture(true);
        let older = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        std::thread::sleep(Duration::from_millis(3));
        let newer = f.coordinator.start_session(&UserId::from_raw("u2")).unwrap();

        let first = f.coordinator.takeover(&agent("a1"), None).await.unwrap();
        let second = f.coordinator.takeover(&agent("a2"), None).await.unwrap();
        assert_eq!(first.session_id, older.id);
        assert_eq!(second.session_id, newer.id);
    }

    #[tokio::test]
    async fn empty_pool_is_no_session_available() {
        let f = fixture(true);
        let err = f.coordinator.takeover(&agent("a1"), None).await.unwrap_err();
        assert_eq!(err, RelayError::NoSessionAvailable);
        assert!(!err.is_fatal());
        // the failed attempt must not leave the agent reserved
        assert!(f.presence.reserve_agent(&agent("a1")).is_ok());
    }

    #[tokio::test]
    async fn assign_to_human_session_is_already_assigned() {
        let f = fixture(true);
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        f.coordinator.assign(&agent("a1"), &s.id).await.unwrap();

        let err = f.coordinator.assign(&agent("a2"), &s.id).await.unwrap_err();
        assert_eq!(err, RelayError::AlreadyAssigned(s.id.clone()));
        let after = f.sessions.get(&s.id).unwrap();
        assert_eq!(after.assigned_agent, Some(agent("a1")));
    }

    #[tokio::test]
    async fn engaged_agent_cannot_claim_another() {
        let f = fixture(true);
        let s1 = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        let s2 = f.coordinator.start_session(&UserId::from_raw("u2")).unwrap();
        f.coordinator.assign(&agent("a1"), &s1.id).await.unwrap();

        let err = f.coordinator.assign(&agent("a1"), &s2.id).await.unwrap_err();
        assert!(matches!(err, RelayError::AgentUnavailable(_)));

        f.coordinator.end(&s1.id).await.unwrap();
        assert!(f.coordinator.assign(&agent("a1"), &s2.id).await.is_ok());
    }

    #[tokio::test]
    async fn busy_agent_is_unavailable() {
        let f = fixture(true);
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        f.coordinator.set_availability(&agent("a1"), Availability::Busy);
        let err = f.coordinator.takeover(&agent("a1"), Some(&s.id)).await.unwrap_err();
        assert!(matches!(err, RelayError::AgentUnavailable(_)));
        assert_eq!(f.sessions.get(&s.id).unwrap().mode, SessionMode::Assistant);
    }

    #[tokio::test]
    async fn end_is_terminal_and_not_repeatable() {
        let f = fixture(true);
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        let (user_conn, mut rx) =
            f.presence.register(Some(s.id.clone()), Participant::User(UserId::from_raw("u1")));

        let ended = f.coordinator.end(&s.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);

        let frames = drain(&mut rx);
        let json = texts(&frames);
        assert_eq!(json[0]["message"], SESSION_ENDED_NOTICE);
        assert_eq!(json[1]["status"], "completed");
        assert_eq!(json.len(), 2);
        assert!(user_conn.is_closed());

        assert_eq!(f.coordinator.end(&s.id).await.unwrap_err(), RelayError::SessionClosed(s.id.clone()));
        assert_eq!(
            f.coordinator.takeover(&agent("a1"), Some(&s.id)).await.unwrap_err(),
            RelayError::SessionClosed(s.id.clone())
        );
        let log = f.messages.list(&s.id).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn end_without_close_keeps_connections_open() {
        let f = fixture(false);
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        let (user_conn, mut rx) =
            f.presence.register(Some(s.id.clone()), Participant::User(UserId::from_raw("u1")));
        f.coordinator.end(&s.id).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 2);
        assert!(!user_conn.is_closed());
    }

    #[tokio::test]
    async fn end_unknown_session_is_not_found() {
        let f = fixture(true);
        let err = f.coordinator.end(&SessionId::from_raw("sess_nope")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_sessions_leave_no_lock_entries() {
        let f = fixture(true);
        for i in 0..50 {
            let sid = SessionId::from_raw(format!("sess_unknown_{i}"));
            assert!(matches!(f.coordinator.end(&sid).await, Err(RelayError::NotFound(_))));
            assert!(matches!(
                f.coordinator.assign(&agent("a1"), &sid).await,
                Err(RelayError::NotFound(_))
            ));
            assert!(matches!(
                f.coordinator.takeover(&agent("a1"), Some(&sid)).await,
                Err(RelayError::NotFound(_))
            ));
        }
        assert!(f.locks.is_empty());
        // failed claims released the agent again
        assert!(f.presence.reserve_agent(&agent("a1")).is_ok());
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_transitions() {
        let f = fixture(true);
        let s = f.coordinator.start_session(&UserId::from_raw("u1")).unwrap();
        let _ = f.coordinator.takeover(&agent("a1"), Some(&s.id)).await.unwrap();
        assert!(f.locks.is_empty());
        let _ = f.coordinator.end(&s.id).await.unwrap();
        assert!(f.locks.is_empty());
    }
}
