//! JSON frames exchanged over the duplex connection.
//!
//! Chat frames carry `{sender, message}`; lifecycle events carry
//! `{type, payload}`.

use serde::{Deserialize, Serialize};
use tracing::error;

use relaydesk_core::events::LifecycleEvent;
use relaydesk_core::ids::{AgentId, SessionId};
use relaydesk_core::session::{SenderRole, SessionMode, SessionStatus};
use relaydesk_core::RelayError;
use relaydesk_store::{MessageRow, SessionRow};

/// A relayed message. `type` is set to `"history"` for replayed log entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub session_id: SessionId,
    pub sender: SenderRole,
    pub message: String,
    pub sequence: i64,
    pub timestamp: String,
}

impl ChatFrame {
    pub fn live(msg: &MessageRow) -> Self {
        Self {
            kind: None,
            session_id: msg.session_id.clone(),
            sender: msg.sender,
            message: msg.text.clone(),
            sequence: msg.sequence,
            timestamp: msg.timestamp.clone(),
        }
    }

    pub fn history(msg: &MessageRow) -> Self {
        Self {
            kind: Some("history".into()),
            ..Self::live(msg)
        }
    }
}

/// Current session state, sent on connect and after every transition.
/// Never appended to the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: SenderRole,
    pub session_id: SessionId,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub assigned_agent: Option<AgentId>,
}

impl StateFrame {
    pub fn of(session: &SessionRow) -> Self {
        Self {
            kind: "state".into(),
            sender: SenderRole::System,
            session_id: session.id.clone(),
            mode: session.mode,
            status: session.status,
            assigned_agent: session.assigned_agent.clone(),
        }
    }
}

/// Text frame sent by a client. Any `sender` field is ignored; the sender
/// is the identity the connection was opened with.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundFrame {
    pub message: String,
}

pub fn encode<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "failed to serialize frame");
            None
        }
    }
}

pub fn event_frame(event: &LifecycleEvent) -> String {
    serde_json::json!({
        "type": event.wire_type(),
        "payload": event.payload(),
    })
    .to_string()
}

pub fn error_frame(err: &RelayError) -> String {
    serde_json::json!({
        "type": "error",
        "payload": {
            "code": err.error_kind(),
            "message": err.to_string(),
        },
    })
    .to_string()
}
