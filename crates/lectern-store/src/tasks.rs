use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use lectern_core::ids::TaskId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One unit of asynchronous work in the durable queue.
///
/// `next_run_at` gates when a pending/retrying row becomes due;
/// `lease_expires_at` bounds how long a running row stays claimed before
/// another worker may take it over (at-least-once redelivery).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub kind: String,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub err_trace: Option<String>,
    pub next_run_at: String,
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new pending task, due immediately.
    #[instrument(skip(self, payload), fields(kind))]
    pub fn insert(&self, kind: &str, payload: &serde_json::Value) -> Result<TaskId, StoreError> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(payload)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, kind, status, payload, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?4, ?4)",
                rusqlite::params![id.as_str(), kind, payload, now],
            )?;
            Ok(id.clone())
        })
    }

    /// Get a task by ID.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn get(&self, id: &TaskId) -> Result<TaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} FROM tasks WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    /// Atomically claim the next due task, if any.
    ///
    /// Due means: pending/retrying with next_run_at in the past, or running
    /// with an expired lease (its worker died mid-task). Claiming moves the
    /// row to running, bumps the attempt counter, and sets a fresh lease.
    #[instrument(skip(self))]
    pub fn claim_next(&self, lease: Duration) -> Result<Option<TaskRow>, StoreError> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let lease_str = (now + chrono::Duration::from_std(lease).unwrap_or_default()).to_rfc3339();

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE tasks
                 SET status = 'running', attempts = attempts + 1,
                     lease_expires_at = ?1, updated_at = ?2
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE (status IN ('pending', 'retrying') AND next_run_at <= ?2)
                        OR (status = 'running' AND lease_expires_at <= ?2)
                     ORDER BY next_run_at ASC, id ASC
                     LIMIT 1
                 )
                 RETURNING {RETURNING_COLUMNS}"
            ))?;
            let mut rows = stmt.query(rusqlite::params![lease_str, now_str])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_task(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Record a successful outcome.
    #[instrument(skip(self, result), fields(task_id = %id))]
    pub fn mark_success(
        &self,
        id: &TaskId,
        result: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = serde_json::to_string(result)?;
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks
                 SET status = 'success', result = ?2, error = NULL, err_trace = NULL,
                     lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1",
                rusqlite::params![id.as_str(), result, now],
            )?;
            Ok(())
        })
    }

    /// Record a terminal failure with a readable error and its full trace.
    #[instrument(skip(self, error, trace), fields(task_id = %id))]
    pub fn mark_failed(&self, id: &TaskId, error: &str, trace: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks
                 SET status = 'failed', error = ?2, err_trace = ?3,
                     lease_expires_at = NULL, updated_at = ?4
                 WHERE id = ?1",
                rusqlite::params![id.as_str(), error, trace, now],
            )?;
            Ok(())
        })
    }

    /// Schedule another attempt after a delay, keeping the latest error
    /// visible while the task waits.
    #[instrument(skip(self, error, trace), fields(task_id = %id))]
    pub fn mark_retrying(
        &self,
        id: &TaskId,
        delay: Duration,
        error: &str,
        trace: &str,
    ) -> Result<(), StoreError> {
        let next = (Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
            .to_rfc3339();
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks
                 SET status = 'retrying', error = ?2, err_trace = ?3, next_run_at = ?4,
                     lease_expires_at = NULL, updated_at = ?5
                 WHERE id = ?1",
                rusqlite::params![id.as_str(), error, trace, next, now],
            )?;
            Ok(())
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, kind, status, payload, attempts, result, error, \
                              err_trace, next_run_at, lease_expires_at, created_at, updated_at";
const RETURNING_COLUMNS: &str = "id, kind, status, payload, attempts, result, error, \
                                 err_trace, next_run_at, lease_expires_at, created_at, updated_at";

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status_str: String = row_helpers::get(row, 2, "tasks", "status")?;
    let payload_raw: String = row_helpers::get(row, 3, "tasks", "payload")?;
    let result_raw: Option<String> = row_helpers::get_opt(row, 5, "tasks", "result")?;

    let payload = serde_json::from_str(&payload_raw).map_err(|e| StoreError::CorruptRow {
        table: "tasks",
        column: "payload",
        detail: format!("invalid JSON: {e}"),
    })?;
    let result = match result_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| StoreError::CorruptRow {
            table: "tasks",
            column: "result",
            detail: format!("invalid JSON: {e}"),
        })?),
        None => None,
    };

    Ok(TaskRow {
        id: TaskId::from_raw(row_helpers::get::<String>(row, 0, "tasks", "id")?),
        kind: row_helpers::get(row, 1, "tasks", "kind")?,
        status: row_helpers::parse_enum(&status_str, "tasks", "status")?,
        payload,
        attempts: row_helpers::get::<i64>(row, 4, "tasks", "attempts")? as u32,
        result,
        error: row_helpers::get_opt(row, 6, "tasks", "error")?,
        err_trace: row_helpers::get_opt(row, 7, "tasks", "err_trace")?,
        next_run_at: row_helpers::get(row, 8, "tasks", "next_run_at")?,
        lease_expires_at: row_helpers::get_opt(row, 9, "tasks", "lease_expires_at")?,
        created_at: row_helpers::get(row, 10, "tasks", "created_at")?,
        updated_at: row_helpers::get(row, 11, "tasks", "updated_at")?,
    })
}
