use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use lectern_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Locked,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Locked => write!(f, "locked"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "locked" => Ok(Self::Locked),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Persisted session record binding a caller's conversation to remote
/// assistant resources. Once locked, local_paths and document_ids are
/// immutable and assistant_id/thread_id are the source of truth for resume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub status: SessionStatus,
    pub local_paths: Vec<String>,
    pub document_ids: Vec<String>,
    pub assistant_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Remote resource ids persisted atomically with the active→locked transition.
#[derive(Clone, Debug)]
pub struct LockedResources {
    pub document_ids: Vec<String>,
    pub assistant_id: String,
    pub thread_id: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new active session with no paths yet.
    #[instrument(skip(self))]
    pub fn create(&self) -> Result<SessionRecord, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, status, local_paths, document_ids, created_at, updated_at)
                 VALUES (?1, 'active', '[]', '[]', ?2, ?3)",
                rusqlite::params![id.as_str(), now, now],
            )?;

            Ok(SessionRecord {
                id,
                status: SessionStatus::Active,
                local_paths: Vec::new(),
                document_ids: Vec::new(),
                assistant_id: None,
                thread_id: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, local_paths, document_ids, assistant_id, thread_id,
                        created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Append a local file path to an active session.
    ///
    /// The append is conditional on `status = 'active'`, so an append racing
    /// the lock transition loses cleanly with a Conflict.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn append_local_path(&self, id: &SessionId, path: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions
                 SET local_paths = json_insert(local_paths, '$[#]', ?2), updated_at = ?3
                 WHERE id = ?1 AND status = 'active'",
                rusqlite::params![id.as_str(), path, now],
            )?;
            if changed == 0 {
                return Err(missing_or_locked(conn, id));
            }
            Ok(())
        })
    }

    /// Perform the active→locked transition, persisting the remote resource
    /// ids in the same conditional update.
    ///
    /// Permitted exactly once: a second call observes zero changed rows and
    /// reports a Conflict, which callers treat as "lost the race — resume
    /// from the persisted ids instead".
    #[instrument(skip(self, resources), fields(session_id = %id))]
    pub fn lock(&self, id: &SessionId, resources: &LockedResources) -> Result<(), StoreError> {
        let document_ids = serde_json::to_string(&resources.document_ids)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions
                 SET status = 'locked', document_ids = ?2, assistant_id = ?3,
                     thread_id = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = 'active'",
                rusqlite::params![
                    id.as_str(),
                    document_ids,
                    resources.assistant_id,
                    resources.thread_id,
                    now,
                ],
            )?;
            if changed == 0 {
                return Err(missing_or_locked(conn, id));
            }
            Ok(())
        })
    }

    /// Delete the session record. The caller must already have released the
    /// remote resources.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn remove(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

}

fn missing_or_locked(conn: &rusqlite::Connection, id: &SessionId) -> StoreError {
    let exists = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id.as_str()], |_| Ok(()))
        .is_ok();
    if exists {
        StoreError::Conflict(format!("session {id} is locked"))
    } else {
        StoreError::NotFound(format!("session {id}"))
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let status_str: String = row_helpers::get(row, 1, "sessions", "status")?;
    let paths_raw: String = row_helpers::get(row, 2, "sessions", "local_paths")?;
    let docs_raw: String = row_helpers::get(row, 3, "sessions", "document_ids")?;

    Ok(SessionRecord {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        local_paths: row_helpers::parse_string_list(&paths_raw, "sessions", "local_paths")?,
        document_ids: row_helpers::parse_string_list(&docs_raw, "sessions", "document_ids")?,
        assistant_id: row_helpers::get_opt(row, 4, "sessions", "assistant_id")?,
        thread_id: row_helpers::get_opt(row, 5, "sessions", "thread_id")?,
        created_at: row_helpers::get(row, 6, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 7, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn resources() -> LockedResources {
        LockedResources {
            document_ids: vec!["doc_1".into(), "doc_2".into()],
            assistant_id: "asst_1".into(),
            thread_id: "thread_1".into(),
        }
    }

    #[test]
    fn create_session() {
        let repo = setup();
        let session = repo.create().unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.local_paths.is_empty());
        assert!(session.document_ids.is_empty());
        assert!(session.assistant_id.is_none());
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_paths_in_order() {
        let repo = setup();
        let session = repo.create().unwrap();
        repo.append_local_path(&session.id, "/tmp/a.pdf").unwrap();
        repo.append_local_path(&session.id, "/tmp/b.pdf").unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.local_paths, vec!["/tmp/a.pdf", "/tmp/b.pdf"]);
    }

    #[test]
    fn append_to_missing_session_is_not_found() {
        let repo = setup();
        let result = repo.append_local_path(&SessionId::from_raw("sess_gone"), "/tmp/a.pdf");
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn lock_persists_resource_ids() {
        let repo = setup();
        let session = repo.create().unwrap();
        repo.append_local_path(&session.id, "/tmp/a.pdf").unwrap();
        repo.lock(&session.id, &resources()).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.status, SessionStatus::Locked);
        assert_eq!(fetched.document_ids, vec!["doc_1", "doc_2"]);
        assert_eq!(fetched.assistant_id.as_deref(), Some("asst_1"));
        assert_eq!(fetched.thread_id.as_deref(), Some("thread_1"));
        // Local paths survive the transition untouched
        assert_eq!(fetched.local_paths, vec!["/tmp/a.pdf"]);
    }

    #[test]
    fn second_lock_is_conflict() {
        let repo = setup();
        let session = repo.create().unwrap();
        repo.lock(&session.id, &resources()).unwrap();

        let second = LockedResources {
            document_ids: vec!["doc_other".into()],
            assistant_id: "asst_other".into(),
            thread_id: "thread_other".into(),
        };
        let result = repo.lock(&session.id, &second);
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // The first writer's ids are untouched
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.assistant_id.as_deref(), Some("asst_1"));
    }

    #[test]
    fn lock_missing_session_is_not_found() {
        let repo = setup();
        let result = repo.lock(&SessionId::from_raw("sess_gone"), &resources());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_after_lock_is_conflict() {
        let repo = setup();
        let session = repo.create().unwrap();
        repo.append_local_path(&session.id, "/tmp/a.pdf").unwrap();
        repo.lock(&session.id, &resources()).unwrap();

        let result = repo.append_local_path(&session.id, "/tmp/b.pdf");
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.local_paths, vec!["/tmp/a.pdf"]);
        assert_eq!(fetched.document_ids, vec!["doc_1", "doc_2"]);
    }

    #[test]
    fn remove_session() {
        let repo = setup();
        let session = repo.create().unwrap();
        repo.remove(&session.id).unwrap();
        assert!(matches!(repo.get(&session.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn remove_is_idempotent() {
        let repo = setup();
        repo.remove(&SessionId::from_raw("sess_gone")).unwrap();
    }

    #[test]
    fn invalid_status_returns_corrupt_row() {
        let repo = setup();
        let session = repo.create().unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'INVALID' WHERE id = ?1",
                    [session.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let result = repo.get(&session.id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
