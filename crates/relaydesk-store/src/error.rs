use relaydesk_core::ids::SessionId;
use relaydesk_core::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {0} is completed")]
    SessionClosed(SessionId),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Anything the store cannot classify is treated as the store being
/// unavailable, so callers fail closed.
impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => RelayError::NotFound(what),
            StoreError::SessionClosed(id) => RelayError::SessionClosed(id),
            StoreError::InvalidTransition(msg) => RelayError::InvalidRequest(msg),
            other => RelayError::Storage(other.to_string()),
        }
    }
}
