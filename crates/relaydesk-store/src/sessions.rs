use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relaydesk_core::ids::{AgentId, SessionId, UserId};
use relaydesk_core::session::{Participant, SenderRole, SessionMode, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{self, MessageRow};
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    #[serde(rename = "sessionId")]
    pub id: SessionId,
    pub user_id: UserId,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub assigned_agent: Option<AgentId>,
    pub created_at: String,
    pub last_activity: String,
}

impl SessionRow {
    pub fn is_assistant_active(&self) -> bool {
        self.status == SessionStatus::Active && self.mode == SessionMode::Assistant
    }

    /// Whether `participant` may read and write this session: the owning
    /// user always, an agent only while it is the assigned agent.
    pub fn admits(&self, participant: &Participant) -> bool {
        match participant {
            Participant::User(user) => *user == self.user_id,
            Participant::Agent(agent) => {
                self.mode == SessionMode::Human && self.assigned_agent.as_ref() == Some(agent)
            }
        }
    }
}

/// A session as shown in listings, with the text of its latest message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: SessionRow,
    pub last_message: Option<String>,
}

/// A mutation of session state applied by [`SessionRepo::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionChange {
    Mode {
        mode: SessionMode,
        agent: Option<AgentId>,
    },
    Status(SessionStatus),
}

const SESSION_COLUMNS: &str =
    "s.id, s.user_id, s.mode, s.status, s.assigned_agent, s.created_at, s.last_activity";

const LAST_MESSAGE: &str =
    "(SELECT m.text FROM messages m WHERE m.session_id = s.id ORDER BY m.sequence DESC LIMIT 1)";

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in assistant mode.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn create(&self, user_id: &UserId) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = row_helpers::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, mode, status, created_at, last_activity)
                 VALUES (?1, ?2, 'assistant', 'active', ?3, ?3)",
                rusqlite::params![id.as_str(), user_id.as_str(), now],
            )?;

            Ok(SessionRow {
                id,
                user_id: user_id.clone(),
                mode: SessionMode::Assistant,
                status: SessionStatus::Active,
                assigned_agent: None,
                created_at: now.clone(),
                last_activity: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| get_in(conn, id))
    }

    /// Apply `change` and, if given, append `notice` as a system message,
    /// in one transaction. The notice is appended before the change so a
    /// terminal notice still lands on a session that is being completed.
    #[instrument(skip(self, notice), fields(session_id = %id))]
    pub fn apply(
        &self,
        id: &SessionId,
        change: &SessionChange,
        notice: Option<&str>,
    ) -> Result<(SessionRow, Option<MessageRow>), StoreError> {
        self.db.with_tx(|tx| {
            let current = get_in(tx, id)?;
            if current.status.is_terminal() {
                return Err(StoreError::SessionClosed(id.clone()));
            }

            let message = match notice {
                Some(text) => Some(messages::append_in(tx, id, SenderRole::System, text)?),
                None => None,
            };

            match change {
                SessionChange::Mode { mode, agent } => {
                    match (mode, agent) {
                        (SessionMode::Human, Some(_)) | (SessionMode::Assistant, None) => {}
                        (SessionMode::Human, None) => {
                            return Err(StoreError::InvalidTransition(
                                "human mode requires an assigned agent".into(),
                            ))
                        }
                        (SessionMode::Assistant, Some(_)) => {
                            return Err(StoreError::InvalidTransition(
                                "assistant mode cannot have an assigned agent".into(),
                            ))
                        }
                    }
                    tx.execute(
                        "UPDATE sessions SET mode = ?1, assigned_agent = ?2 WHERE id = ?3",
                        rusqlite::params![
                            mode.to_string(),
                            agent.as_ref().map(AgentId::as_str),
                            id.as_str()
                        ],
                    )?;
                }
                SessionChange::Status(status) => {
                    tx.execute(
                        "UPDATE sessions SET status = ?1 WHERE id = ?2",
                        rusqlite::params![status.to_string(), id.as_str()],
                    )?;
                }
            }

            Ok((get_in(tx, id)?, message))
        })
    }

    pub fn set_mode(
        &self,
        id: &SessionId,
        mode: SessionMode,
        agent: Option<&AgentId>,
    ) -> Result<SessionRow, StoreError> {
        let change = SessionChange::Mode {
            mode,
            agent: agent.cloned(),
        };
        self.apply(id, &change, None).map(|(row, _)| row)
    }

    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<SessionRow, StoreError> {
        self.apply(id, &SessionChange::Status(status), None)
            .map(|(row, _)| row)
    }

    /// A user's sessions, most recently active first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_by_user(
        &self,
        user_id: &UserId,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.list_where("s.user_id = ?1", user_id.as_str(), status, "DESC")
    }

    /// Sessions an agent has been assigned, most recently active first.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn list_by_agent(
        &self,
        agent_id: &AgentId,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.list_where("s.assigned_agent = ?1", agent_id.as_str(), status, "DESC")
    }

    /// Active assistant-mode sessions, longest waiting first (ties by id).
    #[instrument(skip(self))]
    pub fn list_assistant_mode_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.list_where(
            "s.mode = ?1",
            &SessionMode::Assistant.to_string(),
            Some(SessionStatus::Active),
            "ASC",
        )
    }

    /// The user's most recently active session that is still open.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn active_for_user(&self, user_id: &UserId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s
                 WHERE s.user_id = ?1 AND s.status = 'active'
                 ORDER BY s.last_activity DESC, s.id DESC LIMIT 1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([user_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// (agent, session) pairs for every active human-mode session.
    pub fn active_assignments(&self) -> Result<Vec<(AgentId, SessionId)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT assigned_agent, id FROM sessions
                 WHERE status = 'active' AND mode = 'human'",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let agent: String = row_helpers::get(row, 0, "sessions", "assigned_agent")?;
                let session: String = row_helpers::get(row, 1, "sessions", "id")?;
                out.push((AgentId::from_raw(agent), SessionId::from_raw(session)));
            }
            Ok(out)
        })
    }

    fn list_where(
        &self,
        predicate: &str,
        value: &str,
        status: Option<SessionStatus>,
        direction: &str,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let status_clause = if status.is_some() { " AND s.status = ?2" } else { "" };
            let sql = format!(
                "SELECT {SESSION_COLUMNS}, {LAST_MESSAGE} FROM sessions s
                 WHERE {predicate}{status_clause}
                 ORDER BY s.last_activity {direction}, s.id {direction}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match status {
                Some(s) => stmt.query(rusqlite::params![value, s.to_string()])?,
                None => stmt.query([value])?,
            };
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(SessionSummary {
                    session: row_to_session(row)?,
                    last_message: row_helpers::get_opt(row, 7, "messages", "text")?,
                });
            }
            Ok(results)
        })
    }
}

pub(crate) fn get_in(conn: &Connection, id: &SessionId) -> Result<SessionRow, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ?1");
    conn.query_row(&sql, [id.as_str()], |row| Ok(row_to_session(row)))
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "user_id")?),
        mode: row_helpers::parse_enum(row, 2, "sessions", "mode")?,
        status: row_helpers::parse_enum(row, 3, "sessions", "status")?,
        assigned_agent: row_helpers::get_opt::<String>(row, 4, "sessions", "assigned_agent")?
            .map(AgentId::from_raw),
        created_at: row_helpers::get(row, 5, "sessions", "created_at")?,
        last_activity: row_helpers::get(row, 6, "sessions", "last_activity")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRepo;

    fn setup() -> (SessionRepo, MessageRepo) {
        let db = Database::in_memory().unwrap();
        (SessionRepo::new(db.clone()), MessageRepo::new(db))
    }

    fn user(name: &str) -> UserId {
        UserId::from_raw(name)
    }

    fn agent(name: &str) -> AgentId {
        AgentId::from_raw(name)
    }

    #[test]
    fn create_starts_in_assistant_mode() {
        let (repo, _) = setup();
        let session = repo.create(&user("u1")).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.mode, SessionMode::Assistant);
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.assigned_agent.is_none());
        assert_eq!(repo.get(&session.id).unwrap(), session);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (repo, _) = setup();
        let result = repo.get(&SessionId::from_raw("sess_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn set_mode_enforces_agent_invariant() {
        let (repo, _) = setup();
        let s = repo.create(&user("u1")).unwrap();

        let err = repo.set_mode(&s.id, SessionMode::Human, None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        let err = repo
            .set_mode(&s.id, SessionMode::Assistant, Some(&agent("a1")))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        let updated = repo.set_mode(&s.id, SessionMode::Human, Some(&agent("a1"))).unwrap();
        assert_eq!(updated.mode, SessionMode::Human);
        assert_eq!(updated.assigned_agent, Some(agent("a1")));
    }

    #[test]
    fn completed_is_terminal() {
        let (repo, _) = setup();
        let s = repo.create(&user("u1")).unwrap();
        repo.set_status(&s.id, SessionStatus::Completed).unwrap();

        assert!(matches!(
            repo.set_status(&s.id, SessionStatus::Completed),
            Err(StoreError::SessionClosed(_))
        ));
        assert!(matches!(
            repo.set_status(&s.id, SessionStatus::Active),
            Err(StoreError::SessionClosed(_))
        ));
        assert!(matches!(
            repo.set_mode(&s.id, SessionMode::Human, Some(&agent("a1"))),
            Err(StoreError::SessionClosed(_))
        ));
    }

    #[test]
    fn apply_appends_notice_atomically() {
        let (repo, messages) = setup();
        let s = repo.create(&user("u1")).unwrap();

        let (row, notice) = repo
            .apply(&s.id, &SessionChange::Status(SessionStatus::Completed), Some("ended"))
            .unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
        let notice = notice.unwrap();
        assert_eq!(notice.sender, SenderRole::System);

        let log = messages.list(&s.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "ended");
    }

    #[test]
    fn rejected_change_leaves_no_notice() {
        let (repo, messages) = setup();
        let s = repo.create(&user("u1")).unwrap();
        let change = SessionChange::Mode {
            mode: SessionMode::Human,
            agent: None,
        };
        assert!(repo.apply(&s.id, &change, Some("joined")).is_err());
        assert!(messages.list(&s.id).unwrap().is_empty());
    }

    #[test]
    fn list_by_user_filters_and_carries_last_message() {
        let (repo, messages) = setup();
        let a = repo.create(&user("u1")).unwrap();
        let b = repo.create(&user("u1")).unwrap();
        repo.create(&user("u2")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        messages.append(&a.id, SenderRole::User, "first").unwrap();
        messages.append(&a.id, SenderRole::Assistant, "latest").unwrap();
        repo.set_status(&b.id, SessionStatus::Completed).unwrap();

        let all = repo.list_by_user(&user("u1"), None).unwrap();
        assert_eq!(all.len(), 2);
        // `a` saw activity after `b` was created.
        assert_eq!(all[0].session.id, a.id);
        assert_eq!(all[0].last_message.as_deref(), Some("latest"));

        let done = repo
            .list_by_user(&user("u1"), Some(SessionStatus::Completed))
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].session.id, b.id);
        assert!(done[0].last_message.is_none());
    }

    #[test]
    fn list_by_agent_only_returns_assigned() {
        let (repo, _) = setup();
        let a = repo.create(&user("u1")).unwrap();
        repo.create(&user("u2")).unwrap();
        repo.set_mode(&a.id, SessionMode::Human, Some(&agent("a1"))).unwrap();

        let mine = repo.list_by_agent(&agent("a1"), None).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].session.id, a.id);
        assert!(repo.list_by_agent(&agent("a2"), None).unwrap().is_empty());
    }

    #[test]
    fn pool_is_oldest_activity_first() {
        let (repo, messages) = setup();
        let first = repo.create(&user("u1")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let second = repo.create(&user("u2")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let taken = repo.create(&user("u3")).unwrap();
        repo.set_mode(&taken.id, SessionMode::Human, Some(&agent("a1"))).unwrap();

        // New activity moves `first` behind `second`.
        std::thread::sleep(std::time::Duration::from_millis(3));
        messages.append(&first.id, SenderRole::User, "still waiting").unwrap();

        let pool: Vec<SessionId> = repo
            .list_assistant_mode_sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.session.id)
            .collect();
        assert_eq!(pool, vec![second.id, first.id]);
    }

    #[test]
    fn active_for_user_skips_completed() {
        let (repo, _) = setup();
        assert!(repo.active_for_user(&user("u1")).unwrap().is_none());
        let s = repo.create(&user("u1")).unwrap();
        assert_eq!(repo.active_for_user(&user("u1")).unwrap().unwrap().id, s.id);
        repo.set_status(&s.id, SessionStatus::Completed).unwrap();
        assert!(repo.active_for_user(&user("u1")).unwrap().is_none());
    }

    #[test]
    fn active_assignments_lists_human_sessions() {
        let (repo, _) = setup();
        let a = repo.create(&user("u1")).unwrap();
        let b = repo.create(&user("u2")).unwrap();
        repo.set_mode(&a.id, SessionMode::Human, Some(&agent("a1"))).unwrap();
        repo.set_mode(&b.id, SessionMode::Human, Some(&agent("a2"))).unwrap();
        repo.set_status(&b.id, SessionStatus::Completed).unwrap();

        assert_eq!(repo.active_assignments().unwrap(), vec![(agent("a1"), a.id)]);
    }

    #[test]
    fn admits_owner_and_assigned_agent_only() {
        let (repo, _) = setup();
        let s = repo.create(&user("u1")).unwrap();
        assert!(s.admits(&Participant::User(user("u1"))));
        assert!(!s.admits(&Participant::User(user("u2"))));
        assert!(!s.admits(&Participant::Agent(agent("a1"))));

        let s = repo.set_mode(&s.id, SessionMode::Human, Some(&agent("a1"))).unwrap();
        assert!(s.admits(&Participant::Agent(agent("a1"))));
        assert!(!s.admits(&Participant::Agent(agent("a2"))));
    }

    #[test]
    fn summary_serializes_wire_names() {
        let (repo, _) = setup();
        let s = repo.create(&user("u1")).unwrap();
        let summary = SessionSummary {
            session: s.clone(),
            last_message: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["sessionId"], s.id.as_str());
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["mode"], "assistant");
        assert!(json["assignedAgent"].is_null());
        assert!(json.get("lastActivity").is_some());
    }
}
