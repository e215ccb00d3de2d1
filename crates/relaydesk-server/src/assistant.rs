//! Automated reply collaborator used while a session is in assistant mode.

use async_trait::async_trait;

use relaydesk_store::{MessageRow, SessionRow};

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant unavailable: {0}")]
    Unavailable(String),
    #[error("assistant returned an empty reply")]
    EmptyReply,
}

/// Produces the reply to a user message. Called outside any session lock,
/// so implementations may block on remote services.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn reply(
        &self,
        session: &SessionRow,
        history: &[MessageRow],
        text: &str,
    ) -> Result<String, AssistantError>;
}

/// Replies with a fixed text.
pub struct CannedAssistant {
    reply: String,
}

impl CannedAssistant {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

#[async_trait]
impl Assistant for CannedAssistant {
    async fn reply(
        &self,
        _session: &SessionRow,
        _history: &[MessageRow],
        _text: &str,
    ) -> Result<String, AssistantError> {
        if self.reply.trim().is_empty() {
            return Err(AssistantError::EmptyReply);
        }
        Ok(self.reply.clone())
    }
}
