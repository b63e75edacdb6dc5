use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::machine::{SideEffect, Transition, TransitionSpec};
use super::models::*;
use super::status::JobStatus;

const JOB_COLUMNS: &str = "id, name, description, owner, collaborators, filename, status, failed, \
     output IS NOT NULL, errors IS NOT NULL, submitted_at, updated_at";

/// Async-safe handle to the job database.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Changes written together with a status update.
#[derive(Debug, Clone, Default)]
pub struct TransitionChange {
    pub actor: Option<String>,
    pub run_output: RunOutput,
}

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    owner TEXT NOT NULL,
                    collaborators TEXT NOT NULL DEFAULT '[]',
                    filename TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'PENDING_CODE_REVIEW',
                    failed INTEGER NOT NULL DEFAULT 0,
                    archive BLOB NOT NULL,
                    output BLOB,
                    errors BLOB,
                    submitted_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS transition_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    transition TEXT NOT NULL,
                    source TEXT NOT NULL,
                    target TEXT NOT NULL,
                    actor TEXT,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    text TEXT NOT NULL,
                    by TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_transition_log_job ON transition_log(job_id);
                CREATE INDEX IF NOT EXISTS idx_comments_job ON comments(job_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Job CRUD ──────────────────────────────────────────────────────

    pub fn create_job(&self, new: &NewJob) -> Result<Job> {
        let now = Utc::now().to_rfc3339();
        let collaborators =
            serde_json::to_string(&new.collaborators).context("Failed to encode collaborators")?;
        self.conn
            .execute(
                "INSERT INTO jobs (name, description, owner, collaborators, filename, status, archive, submitted_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    new.name,
                    new.description,
                    new.owner,
                    collaborators,
                    new.filename,
                    JobStatus::PendingCodeReview.as_str(),
                    new.archive,
                    now,
                ],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// List jobs newest first. Deleted jobs are hidden unless asked for.
    pub fn list_jobs(&self, include_deleted: bool) -> Result<Vec<Job>> {
        let sql = if include_deleted {
            format!("SELECT {} FROM jobs ORDER BY id DESC", JOB_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM jobs WHERE status != '{}' ORDER BY id DESC",
                JOB_COLUMNS,
                JobStatus::Deleted.as_str()
            )
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn read_blob(&self, id: i64, field: BlobField) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", field.column());
        let blob: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read {} for job {}", field.column(), id))?;
        Ok(blob.flatten())
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// Apply a transition as one conditional update keyed on the expected
    /// source status, writing the log entry in the same SQL transaction.
    ///
    /// Returns `None` when the job is no longer in `spec.source`; nothing is
    /// written in that case.
    pub fn commit_transition(
        &self,
        id: i64,
        spec: &TransitionSpec,
        change: &TransitionChange,
    ) -> Result<Option<TransitionLogEntry>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transition")?;
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let (set_failed, output, errors) = match spec.side_effect {
            SideEffect::StoreRunOutput { failed } => (
                failed,
                change.run_output.output.as_deref(),
                change.run_output.errors.as_deref(),
            ),
            SideEffect::None | SideEffect::Dispatch => (false, None, None),
        };

        let changed = tx
            .execute(
                "UPDATE jobs SET status = ?1,
                    failed = CASE WHEN ?2 THEN 1 ELSE failed END,
                    output = COALESCE(?3, output),
                    errors = COALESCE(?4, errors),
                    updated_at = ?5
                 WHERE id = ?6 AND status = ?7",
                params![
                    spec.target.as_str(),
                    set_failed,
                    output,
                    errors,
                    now_str,
                    id,
                    spec.source.as_str(),
                ],
            )
            .context("Failed to update job status")?;
        if changed == 0 {
            return Ok(None);
        }

        let actor = if spec.records_actor {
            change.actor.clone()
        } else {
            None
        };
        tx.execute(
            "INSERT INTO transition_log (job_id, transition, source, target, actor, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                spec.transition.as_str(),
                spec.source.as_str(),
                spec.target.as_str(),
                actor,
                now_str,
            ],
        )
        .context("Failed to insert transition log entry")?;
        let log_id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit transition")?;

        Ok(Some(TransitionLogEntry {
            id: log_id,
            job_id: id,
            transition: spec.transition,
            source: spec.source,
            target: spec.target,
            actor,
            timestamp: now,
        }))
    }

    pub fn transition_log(&self, job_id: i64) -> Result<Vec<TransitionLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, transition, source, target, actor, timestamp
                 FROM transition_log WHERE job_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare transition_log")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query transition log")?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, job_id, transition, source, target, actor, timestamp) =
                row.context("Failed to read transition log row")?;
            entries.push(TransitionLogEntry {
                id,
                job_id,
                transition: Transition::from_str(&transition).map_err(|e| anyhow::anyhow!(e))?,
                source: JobStatus::from_str(&source).map_err(|e| anyhow::anyhow!(e))?,
                target: JobStatus::from_str(&target).map_err(|e| anyhow::anyhow!(e))?,
                actor,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }
        Ok(entries)
    }

    // ── Comments ──────────────────────────────────────────────────────

    pub fn add_comment(&self, job_id: i64, text: &str, by: &str) -> Result<Comment> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO comments (job_id, text, by, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![job_id, text, by, now.to_rfc3339()],
            )
            .context("Failed to insert comment")?;
        Ok(Comment {
            id: self.conn.last_insert_rowid(),
            job_id,
            text: text.to_string(),
            by: by.to_string(),
            timestamp: now,
        })
    }

    /// Comments for a job in creation order.
    pub fn list_comments(&self, job_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, text, by, timestamp FROM comments WHERE job_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query comments")?;
        let mut comments = Vec::new();
        for row in rows {
            let (id, job_id, text, by, timestamp) = row.context("Failed to read comment row")?;
            comments.push(Comment {
                id,
                job_id,
                text,
                by,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }
        Ok(comments)
    }

    pub fn latest_comment(&self, job_id: i64) -> Result<Option<Comment>> {
        Ok(self.list_comments(job_id)?.pop())
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: i64,
    name: String,
    description: String,
    owner: String,
    collaborators: String,
    filename: String,
    status: String,
    failed: bool,
    has_output: bool,
    has_errors: bool,
    submitted_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            owner: row.get(3)?,
            collaborators: row.get(4)?,
            filename: row.get(5)?,
            status: row.get(6)?,
            failed: row.get(7)?,
            has_output: row.get(8)?,
            has_errors: row.get(9)?,
            submitted_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let collaborators: Vec<String> = serde_json::from_str(&self.collaborators)
            .context("Failed to parse job collaborators JSON")?;
        Ok(Job {
            id: self.id,
            name: self.name,
            description: self.description,
            owner: self.owner,
            collaborators,
            filename: self.filename,
            status,
            failed: self.failed,
            has_output: self.has_output,
            has_errors: self.has_errors,
            submitted_at: parse_timestamp(&self.submitted_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
