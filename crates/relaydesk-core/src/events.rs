use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId, UserId};

/// How an agent came to own a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    Takeover,
    Assign,
}

impl HandoffKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Takeover => "takeover",
            Self::Assign => "assign",
        }
    }
}

/// Session lifecycle events pushed to available agents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    SessionCreated {
        session_id: SessionId,
        user_id: UserId,
    },
    SessionTakenOver {
        session_id: SessionId,
        agent_id: AgentId,
        kind: HandoffKind,
    },
    SessionEnded {
        session_id: SessionId,
    },
}

impl LifecycleEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionTakenOver { session_id, .. }
            | Self::SessionEnded { session_id } => session_id,
        }
    }

    /// Event name on the wire.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "new_session",
            Self::SessionTakenOver { .. } => "session_update",
            Self::SessionEnded { .. } => "session_end",
        }
    }

    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionTakenOver { .. } => "session_taken_over",
            Self::SessionEnded { .. } => "session_ended",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::SessionCreated { session_id, user_id } => serde_json::json!({
                "sessionId": session_id,
                "userId": user_id,
                "mode": "assistant",
                "status": "active",
            }),
            Self::SessionTakenOver {
                session_id,
                agent_id,
                kind,
            } => serde_json::json!({
                "sessionId": session_id,
                "assignedAgent": agent_id,
                "mode": "human",
                "action": kind.as_str(),
            }),
            Self::SessionEnded { session_id } => serde_json::json!({
                "sessionId": session_id,
                "status": "completed",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_types() {
        let sid = SessionId::new();
        let created = LifecycleEvent::SessionCreated {
            session_id: sid.clone(),
            user_id: UserId::from_raw("u1"),
        };
        let taken = LifecycleEvent::SessionTakenOver {
            session_id: sid.clone(),
            agent_id: AgentId::from_raw("a1"),
            kind: HandoffKind::Takeover,
        };
        let ended = LifecycleEvent::SessionEnded { session_id: sid.clone() };
        assert_eq!(created.wire_type(), "new_session");
        assert_eq!(taken.wire_type(), "session_update");
        assert_eq!(ended.wire_type(), "session_end");
        assert_eq!(ended.session_id(), &sid);
    }

    #[test]
    fn takeover_payload_names_agent_and_action() {
        let event = LifecycleEvent::SessionTakenOver {
            session_id: SessionId::from_raw("sess_1"),
            agent_id: AgentId::from_raw("a1"),
            kind: HandoffKind::Assign,
        };
        let payload = event.payload();
        assert_eq!(payload["sessionId"], "sess_1");
        assert_eq!(payload["assignedAgent"], "a1");
        assert_eq!(payload["action"], "assign");
    }
}
