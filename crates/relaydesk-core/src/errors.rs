use crate::ids::{AgentId, SessionId};

/// Typed outcomes of session, routing and handoff operations.
///
/// Everything except `Storage` is recoverable and reported to the caller.
/// `Storage` means the session store could not be reached or written and
/// the mutation was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("session {0} is completed")]
    SessionClosed(SessionId),
    #[error("no session available for takeover")]
    NoSessionAvailable,
    #[error("session {0} is already assigned")]
    AlreadyAssigned(SessionId),
    #[error("agent {0} is not available")]
    AgentUnavailable(AgentId),
    #[error("{participant} is not a participant of session {session_id}")]
    NotParticipant {
        session_id: SessionId,
        participant: String,
    },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl RelayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Short classification string for logging/metrics and wire codes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::SessionClosed(_) => "session_closed",
            Self::NoSessionAvailable => "no_session_available",
            Self::AlreadyAssigned(_) => "already_assigned",
            Self::AgentUnavailable(_) => "agent_unavailable",
            Self::NotParticipant { .. } => "not_participant",
            Self::ConnectionLost(_) => "connection_lost",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage_unavailable",
        }
    }
}
