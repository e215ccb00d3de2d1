use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relaydesk_core::ids::{MessageId, SessionId};
use relaydesk_core::session::{SenderRole, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One entry in a session's append-only message log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sequence: i64,
    pub sender: SenderRole,
    pub text: String,
    pub timestamp: String,
}

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to an open session and bump its last activity.
    #[instrument(skip(self, text), fields(session_id = %session_id, sender = %sender))]
    pub fn append(
        &self,
        session_id: &SessionId,
        sender: SenderRole,
        text: &str,
    ) -> Result<MessageRow, StoreError> {
        self.db
            .with_tx(|tx| append_in(tx, session_id, sender, text))
    }

    /// Full log for a session in append order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            session_status(conn, session_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, session_id, sequence, sender, text, timestamp
                 FROM messages WHERE session_id = ?1
                 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn session_status(conn: &Connection, session_id: &SessionId) -> Result<SessionStatus, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table: "sessions",
        column: "status",
        detail: format!("unknown variant: {raw}"),
    })
}

/// Append inside an existing transaction. Fails with `SessionClosed` once the
/// session is completed.
pub(crate) fn append_in(
    conn: &Connection,
    session_id: &SessionId,
    sender: SenderRole,
    text: &str,
) -> Result<MessageRow, StoreError> {
    if session_status(conn, session_id)?.is_terminal() {
        return Err(StoreError::SessionClosed(session_id.clone()));
    }

    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE session_id = ?1",
        [session_id.as_str()],
        |row| row.get(0),
    )?;
    let id = MessageId::new();
    let now = row_helpers::now();

    conn.execute(
        "INSERT INTO messages (id, session_id, sequence, sender, text, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id.as_str(),
            session_id.as_str(),
            sequence,
            sender.to_string(),
            text,
            now
        ],
    )?;
    conn.execute(
        "UPDATE sessions SET last_activity = ?1 WHERE id = ?2",
        rusqlite::params![now, session_id.as_str()],
    )?;

    Ok(MessageRow {
        id,
        session_id: session_id.clone(),
        sequence,
        sender,
        text: text.to_string(),
        timestamp: now,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        sequence: row_helpers::get(row, 2, "messages", "sequence")?,
        sender: row_helpers::parse_enum(row, 3, "messages", "sender")?,
        text: row_helpers::get(row, 4, "messages", "text")?,
        timestamp: row_helpers::get(row, 5, "messages", "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use relaydesk_core::ids::UserId;

    fn setup() -> (SessionRepo, MessageRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let session = sessions.create(&UserId::from_raw("u1")).unwrap();
        (sessions, MessageRepo::new(db), session.id)
    }

    #[test]
    fn append_assigns_increasing_sequence() {
        let (_, repo, sid) = setup();
        let a = repo.append(&sid, SenderRole::User, "hi").unwrap();
        let b = repo.append(&sid, SenderRole::Assistant, "hello").unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert!(a.id.as_str().starts_with("msg_"));
    }

    #[test]
    fn history_preserves_sender_and_text_in_order() {
        let (_, repo, sid) = setup();
        let sent = [
            (SenderRole::User, "where is my order?"),
            (SenderRole::Assistant, "let me check"),
            (SenderRole::System, "An agent joined"),
            (SenderRole::Agent, "found it"),
        ];
        for (sender, text) in sent {
            repo.append(&sid, sender, text).unwrap();
        }
        let log = repo.list(&sid).unwrap();
        let got: Vec<(SenderRole, &str)> = log.iter().map(|m| (m.sender, m.text.as_str())).collect();
        assert_eq!(got, sent.to_vec());
    }

    #[test]
    fn append_to_completed_session_fails() {
        let (sessions, repo, sid) = setup();
        sessions.set_status(&sid, SessionStatus::Completed).unwrap();
        let err = repo.append(&sid, SenderRole::User, "too late").unwrap_err();
        assert!(matches!(err, StoreError::SessionClosed(_)));
        assert!(repo.list(&sid).unwrap().is_empty());
    }

    #[test]
    fn append_to_missing_session_is_not_found() {
        let (_, repo, _) = setup();
        let err = repo
            .append(&SessionId::from_raw("sess_nope"), SenderRole::User, "x")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn append_bumps_last_activity() {
        let (sessions, repo, sid) = setup();
        let before = sessions.get(&sid).unwrap().last_activity;
        std::thread::sleep(std::time::Duration::from_millis(3));
        let msg = repo.append(&sid, SenderRole::User, "ping").unwrap();
        let after = sessions.get(&sid).unwrap().last_activity;
        assert!(after > before);
        assert_eq!(after, msg.timestamp);
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaydesk.db");
        let sid = {
            let db = Database::open(&path).unwrap();
            let s = SessionRepo::new(db.clone()).create(&UserId::from_raw("u1")).unwrap();
            MessageRepo::new(db).append(&s.id, SenderRole::User, "persisted").unwrap();
            s.id
        };
        let db = Database::open(&path).unwrap();
        let log = MessageRepo::new(db).list(&sid).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "persisted");
    }
}
