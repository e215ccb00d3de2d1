//! Message Router: append-then-deliver under the session lock.

use std::sync::Arc;
use std::time::Instant;

use relaydesk_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use relaydesk_core::ids::{ConnectionId, SessionId};
use relaydesk_core::session::{Participant, Sender, SenderRole};
use relaydesk_core::RelayError;
use relaydesk_store::{MessageRepo, MessageRow, SessionRepo, SessionRow};

use crate::assistant::Assistant;
use crate::connection::ClientConnection;
use crate::locks::SessionLocks;
use crate::metrics;
use crate::presence::PresenceRegistry;
use crate::wire::{self, ChatFrame, StateFrame};

#[derive(Clone)]
pub struct MessageRouter {
    sessions: SessionRepo,
    messages: MessageRepo,
    presence: Arc<PresenceRegistry>,
    locks: Arc<SessionLocks>,
    assistant: Arc<dyn Assistant>,
    metrics: Arc<MetricsRecorder>,
    fallback_reply: Arc<str>,
}

impl MessageRouter {
    pub fn new(
        sessions: SessionRepo,
        messages: MessageRepo,
        presence: Arc<PresenceRegistry>,
        locks: Arc<SessionLocks>,
        assistant: Arc<dyn Assistant>,
        metrics: Arc<MetricsRecorder>,
        fallback_reply: &str,
    ) -> Self {
        Self {
            sessions,
            messages,
            presence,
            locks,
            assistant,
            metrics,
            fallback_reply: fallback_reply.into(),
        }
    }

    /// Append `text` to the session log and deliver it to every admitted
    /// connection on the session except `origin`.
    ///
    /// Human senders must be participants of the session. A user message
    /// on an assistant-mode session schedules an assistant reply once the
    /// lock is released.
    #[instrument(skip(self, text, origin), fields(session_id = %session_id, sender = %sender.role()))]
    pub async fn relay(
        &self,
        session_id: &SessionId,
        sender: Sender,
        text: &str,
        origin: Option<&ConnectionId>,
    ) -> Result<MessageRow, RelayError> {
        let (session, message) = self.append_and_deliver(session_id, &sender, text, origin).await?;

        if sender.role() == SenderRole::User && session.is_assistant_active() {
            let router = self.clone();
            let msg = message.clone();
            let _ = tokio::spawn(async move { router.answer(session, msg).await });
        }
        Ok(message)
    }

    async fn append_and_deliver(
        &self,
        session_id: &SessionId,
        sender: &Sender,
        text: &str,
        origin: Option<&ConnectionId>,
    ) -> Result<(SessionRow, MessageRow), RelayError> {
        let started = Instant::now();
        if text.trim().is_empty() {
            return Err(RelayError::InvalidRequest("message text is empty".into()));
        }

        let guard = self.locks.lock(session_id).await;
        let session = self.sessions.get(session_id)?;
        if session.status.is_terminal() {
            return Err(RelayError::SessionClosed(session_id.clone()));
        }
        match sender {
            Sender::Participant(p) if !session.admits(p) => {
                return Err(RelayError::NotParticipant {
                    session_id: session_id.clone(),
                    participant: p.to_string(),
                });
            }
            Sender::Assistant if !session.is_assistant_active() => {
                return Err(RelayError::InvalidRequest(
                    "session is not in assistant mode".into(),
                ));
            }
            _ => {}
        }

        let message = self.messages.append(session_id, sender.role(), text)?;
        let recipients = self.deliver_message(&session, &message, origin);
        drop(guard);

        let role = sender.role().to_string();
        self.metrics
            .counter_inc(metrics::RELAY_MESSAGES_TOTAL, &[("sender", &role)], 1);
        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = started.elapsed().as_micros() as f64 / 1000.0;
        self.metrics
            .histogram_observe(metrics::RELAY_LATENCY_MS, &[], elapsed_ms);
        debug!(sequence = message.sequence, recipients, "message relayed");
        Ok((session, message))
    }

    /// Deliver an already-appended message to the session's admitted
    /// connections. Must be called with the session lock held.
    pub(crate) fn deliver_message(
        &self,
        session: &SessionRow,
        message: &MessageRow,
        origin: Option<&ConnectionId>,
    ) -> usize {
        match wire::encode(&ChatFrame::live(message)) {
            Some(frame) => self.deliver_frame(session, &frame, origin),
            None => 0,
        }
    }

    /// Deliver the session's state frame to its admitted connections.
    pub(crate) fn deliver_state(&self, session: &SessionRow) -> usize {
        match wire::encode(&StateFrame::of(session)) {
            Some(frame) => self.deliver_frame(session, &frame, None),
            None => 0,
        }
    }

    fn deliver_frame(&self, session: &SessionRow, frame: &str, origin: Option<&ConnectionId>) -> usize {
        self.presence
            .connections_for(&session.id)
            .iter()
            .filter(|c| session.admits(&c.participant))
            .filter(|c| origin != Some(&c.id))
            .filter(|c| self.push(c, frame.to_string()))
            .count()
    }

    /// Queue one frame on one connection. Failures are logged and counted,
    /// never propagated.
    pub(crate) fn push(&self, conn: &ClientConnection, frame: String) -> bool {
        match conn.send(frame) {
            Ok(()) => true,
            Err(failure) => {
                warn!(
                    conn_id = %conn.id,
                    participant = %conn.participant,
                    reason = failure.as_str(),
                    dropped = conn.drop_count(),
                    "failed to deliver frame"
                );
                self.metrics.counter_inc(
                    metrics::RELAY_DELIVERY_FAILURES_TOTAL,
                    &[("reason", failure.as_str())],
                    1,
                );
                false
            }
        }
    }

    /// Register a connection and, for a session-bound one, push the current
    /// session state. Both happen under the session lock, so a concurrent
    /// transition is seen either entirely before or entirely after.
    pub async fn attach(
        &self,
        session_id: Option<SessionId>,
        participant: Participant,
    ) -> Result<(Arc<ClientConnection>, mpsc::Receiver<String>), RelayError> {
        let Some(session_id) = session_id else {
            return Ok(self.presence.register(None, participant));
        };
        let _guard = self.locks.lock(&session_id).await;
        let session = self.sessions.get(&session_id)?;
        let (conn, rx) = self.presence.register(Some(session_id), participant);
        if let Some(frame) = wire::encode(&StateFrame::of(&session)) {
            let _ = self.push(&conn, frame);
        }
        Ok((conn, rx))
    }

    /// Generate and relay the assistant's reply to `message`. The reply is
    /// dropped if the session left assistant mode meanwhile.
    pub(crate) async fn answer(&self, session: SessionRow, message: MessageRow) {
        let history = match self.messages.list(&session.id) {
            Ok(h) => h,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "failed to load history for assistant");
                Vec::new()
            }
        };

        let reply = match self.assistant.reply(&session, &history, &message.text).await {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "assistant failed, using fallback reply");
                self.metrics
                    .counter_inc(metrics::ASSISTANT_FAILURES_TOTAL, &[], 1);
                self.fallback_reply.to_string()
            }
        };

        match self
            .append_and_deliver(&session.id, &Sender::Assistant, &reply, None)
            .await
        {
            Ok(_) => {}
            Err(RelayError::InvalidRequest(_) | RelayError::SessionClosed(_)) => {
                debug!(session_id = %session.id, "session left assistant mode, reply discarded");
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "failed to relay assistant reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use relaydesk_core::ids::{AgentId, UserId};
    use relaydesk_core::session::{SessionMode, SessionStatus};
    use relaydesk_store::Database;

    use crate::assistant::{AssistantError, CannedAssistant};

    struct FailingAssistant;

    #[async_trait]
    impl Assistant for FailingAssistant {
        async fn reply(&self, _: &SessionRow, _: &[MessageRow], _: &str) -> Result<String, AssistantError> {
            Err(AssistantError::Unavailable("offline".into()))
        }
    }

    struct Fixture {
        router: MessageRouter,
        sessions: SessionRepo,
        messages: MessageRepo,
        presence: Arc<PresenceRegistry>,
        locks: Arc<SessionLocks>,
        metrics: Arc<MetricsRecorder>,
    }

    fn fixture_with(assistant: Arc<dyn Assistant>, queue_depth: usize) -> Fixture {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let messages = MessageRepo::new(db);
        let presence = Arc::new(PresenceRegistry::new(queue_depth));
        let metrics = Arc::new(MetricsRecorder::new());
        let locks = Arc::new(SessionLocks::new());
        let router = MessageRouter::new(
            sessions.clone(),
            messages.clone(),
            presence.clone(),
            locks.clone(),
            assistant,
            metrics.clone(),
            "fallback",
        );
        Fixture {
            router,
            sessions,
            messages,
            presence,
            locks,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(CannedAssistant::new("canned")), 32)
    }

    fn user() -> Participant {
        Participant::User(UserId::from_raw("u1"))
    }

    fn agent() -> Participant {
        Participant::Agent(AgentId::from_raw("a1"))
    }

    fn human_session(f: &Fixture) -> SessionRow {
        let s = f.sessions.create(&UserId::from_raw("u1")).unwrap();
        f.sessions
            .set_mode(&s.id, SessionMode::Human, Some(&AgentId::from_raw("a1")))
            .unwrap()
    }

    async fn next_text(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(t)) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_delivers_to_others_not_origin() {
        let f = fixture();
        let s = human_session(&f);
        let (user_conn, mut user_rx) = f.presence.register(Some(s.id.clone()), user());
        let (agent_conn, mut agent_rx) = f.presence.register(Some(s.id.clone()), agent());

        f.router
            .relay(&s.id, agent().into(), "hello", Some(&agent_conn.id))
            .await
            .unwrap();

        let frame = next_text(&mut user_rx).await;
        assert_eq!(frame["sender"], "agent");
        assert_eq!(frame["message"], "hello");
        assert!(agent_rx.try_recv().is_err());
        assert_eq!(f.metrics.counter_get(metrics::RELAY_MESSAGES_TOTAL, &[("sender", "agent")]), 1);
        drop(user_conn);
    }

    #[tokio::test]
    async fn unassigned_agent_cannot_relay_or_receive() {
        let f = fixture();
        let s = f.sessions.create(&UserId::from_raw("u1")).unwrap();
        let (_c, mut rx) = f.presence.register(Some(s.id.clone()), agent());

        let err = f.router.relay(&s.id, agent().into(), "hi", None).await.unwrap_err();
        assert!(matches!(err, RelayError::NotParticipant { .. }));

        f.router
            .relay(&s.id, Sender::System, "notice", None)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_on_completed_session_appends_nothing() {
        let f = fixture();
        let s = human_session(&f);
        f.sessions.set_status(&s.id, SessionStatus::Completed).unwrap();

        let err = f.router.relay(&s.id, user().into(), "late", None).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionClosed(_)));
        assert!(f.messages.list(&s.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let f = fixture();
        let s = human_session(&f);
        let err = f.router.relay(&s.id, user().into(), "   ", None).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let f = fixture();
        let err = f
            .router
            .relay(&SessionId::from_raw("sess_missing"), user().into(), "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_sessions_leave_no_lock_entries() {
        let f = fixture();
        for i in 0..50 {
            let sid = SessionId::from_raw(format!("sess_unknown_{i}"));
            let err = f.router.relay(&sid, user().into(), "x", None).await.unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)));
            let err = f.router.attach(Some(sid), user()).await.unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)));
        }
        assert!(f.locks.is_empty());
        assert_eq!(f.presence.connection_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_does_not_block_others_or_fail_append() {
        let f = fixture_with(Arc::new(CannedAssistant::new("canned")), 1);
        let s = human_session(&f);
        let (_slow, _slow_rx) = f.presence.register(Some(s.id.clone()), user());
        let (_fast, mut fast_rx) = f.presence.register(Some(s.id.clone()), user());

        f.router.relay(&s.id, agent().into(), "one", None).await.unwrap();
        let _ = next_text(&mut fast_rx).await;
        f.router.relay(&s.id, agent().into(), "two", None).await.unwrap();

        assert_eq!(next_text(&mut fast_rx).await["message"], "two");
        assert_eq!(f.messages.list(&s.id).unwrap().len(), 2);
        assert_eq!(
            f.metrics
                .counter_get(metrics::RELAY_DELIVERY_FAILURES_TOTAL, &[("reason", "queue_full")]),
            1
        );
    }

    #[tokio::test]
    async fn connections_observe_append_order() {
        let f = fixture();
        let s = human_session(&f);
        let (_a, mut rx_a) = f.presence.register(Some(s.id.clone()), user());
        let (_b, mut rx_b) = f.presence.register(Some(s.id.clone()), agent());

        for i in 0..10 {
            f.router
                .relay(&s.id, Sender::System, &format!("m{i}"), None)
                .await
                .unwrap();
        }
        for rx in [&mut rx_a, &mut rx_b] {
            for i in 0..10 {
                assert_eq!(next_text(rx).await["sequence"], i);
            }
        }
    }

    #[tokio::test]
    async fn user_message_in_assistant_mode_gets_reply() {
        let f = fixture();
        let s = f.sessions.create(&UserId::from_raw("u1")).unwrap();
        let (conn, mut rx) = f.presence.register(Some(s.id.clone()), user());

        f.router
            .relay(&s.id, user().into(), "where is my order?", Some(&conn.id))
            .await
            .unwrap();

        let frame = next_text(&mut rx).await;
        assert_eq!(frame["sender"], "assistant");
        assert_eq!(frame["message"], "canned");
    }

    #[tokio::test]
    async fn assistant_failure_relays_fallback() {
        let f = fixture_with(Arc::new(FailingAssistant), 32);
        let s = f.sessions.create(&UserId::from_raw("u1")).unwrap();
        let (_conn, mut rx) = f.presence.register(Some(s.id.clone()), user());

        let msg = f.router.relay(&s.id, user().into(), "hi", None).await.unwrap();
        let _ = next_text(&mut rx).await;
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["message"], "fallback");
        assert_eq!(msg.sequence, 0);
        assert_eq!(f.metrics.counter_get(metrics::ASSISTANT_FAILURES_TOTAL, &[]), 1);
    }

    #[tokio::test]
    async fn reply_is_dropped_after_takeover() {
        let f = fixture();
        let s = f.sessions.create(&UserId::from_raw("u1")).unwrap();
        let msg = f.messages.append(&s.id, SenderRole::User, "hi").unwrap();
        f.sessions
            .set_mode(&s.id, SessionMode::Human, Some(&AgentId::from_raw("a1")))
            .unwrap();

        f.router.answer(s.clone(), msg).await;

        let log = f.messages.list(&s.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sender, SenderRole::User);
    }

    #[tokio::test]
    async fn attach_sends_current_state() {
        let f = fixture();
        let s = human_session(&f);
        let (conn, mut rx) = f.router.attach(Some(s.id.clone()), user()).await.unwrap();
        assert_eq!(conn.session_id.as_ref(), Some(&s.id));
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["type"], "state");
        assert_eq!(frame["mode"], "human");
        assert_eq!(frame["assignedAgent"], "a1");
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn lobby_attach_gets_no_state() {
        let f = fixture();
        let (conn, mut rx) = f.router.attach(None, agent()).await.unwrap();
        assert!(conn.session_id.is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(f.presence.connection_count(), 1);
    }
}
