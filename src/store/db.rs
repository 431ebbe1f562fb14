use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::graph::TaskGraph;
use super::models::*;
use crate::errors::OrchestrationError;

/// Async-safe handle to the store.
///
/// Wraps `StoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl DbHandle {
    pub fn new(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(StoreDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(StoreDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreDb) -> Result<R> + Send + 'static,
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

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StoreDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StoreDb {
    conn: Connection,
}

const TASK_COLUMNS: &str = "task_id, feature_id, sequence_number, title, kind, status, depends_on, \
     payload, priority, external_ref, execution_ref, created_at, ready_at, started_at, updated_at";

const EXECUTION_COLUMNS: &str = "execution_id, task_id, workspace_path, backend_port, frontend_port, \
     branch_name, metadata, created_at, released_at";

impl StoreDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("Failed to enable WAL journal")?;
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
                CREATE TABLE IF NOT EXISTS features (
                    feature_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'in_progress',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    feature_id TEXT NOT NULL REFERENCES features(feature_id),
                    sequence_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'generic',
                    status TEXT NOT NULL DEFAULT 'queued',
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    payload TEXT NOT NULL DEFAULT '',
                    priority INTEGER NOT NULL DEFAULT 0,
                    external_ref TEXT,
                    execution_ref TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    ready_at TEXT,
                    started_at TEXT,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(feature_id, sequence_number)
                );

                CREATE TABLE IF NOT EXISTS executions (
                    execution_id TEXT PRIMARY KEY,
                    task_id INTEGER NOT NULL REFERENCES tasks(task_id),
                    workspace_path TEXT,
                    backend_port INTEGER,
                    frontend_port INTEGER,
                    branch_name TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    released_at TEXT
                );

                CREATE TABLE IF NOT EXISTS port_slots (
                    slot_index INTEGER PRIMARY KEY,
                    reserved_by TEXT UNIQUE,
                    reserved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS status_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    feature_id TEXT NOT NULL,
                    task_id INTEGER,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS loop_guard (
                    task_id INTEGER PRIMARY KEY,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_failure_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_feature_status ON tasks(feature_id, status);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id);
                CREATE INDEX IF NOT EXISTS idx_status_messages_feature ON status_messages(feature_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Features ──────────────────────────────────────────────────────

    /// Create a feature and batch-insert all of its tasks in one transaction.
    ///
    /// Tasks without dependencies start `ready`; the rest start `queued`.
    /// A feature's tasks are inserted exactly once.
    pub fn submit_feature(&self, spec: &FeatureSpec) -> Result<Vec<Task>> {
        TaskGraph::build(&spec.feature_id, &spec.tasks)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin submit transaction")?;

        let existing: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE feature_id = ?1",
                params![spec.feature_id],
                |row| row.get(0),
            )
            .context("Failed to count existing tasks")?;
        if existing > 0 {
            return Err(OrchestrationError::InvalidGraph {
                feature_id: spec.feature_id.clone(),
                message: "feature was already submitted".to_string(),
            }
            .into());
        }

        tx.execute(
            "INSERT INTO features (feature_id, title) VALUES (?1, ?2)
             ON CONFLICT(feature_id) DO NOTHING",
            params![spec.feature_id, spec.title],
        )
        .context("Failed to insert feature")?;

        for task in &spec.tasks {
            let status = if task.depends_on.is_empty() {
                TaskStatus::Ready
            } else {
                TaskStatus::Queued
            };
            let depends_json =
                serde_json::to_string(&task.depends_on).context("Failed to serialize depends_on")?;
            tx.execute(
                "INSERT INTO tasks (feature_id, sequence_number, title, kind, status, depends_on, payload, priority, ready_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CASE WHEN ?5 = 'ready' THEN datetime('now') END)",
                params![
                    spec.feature_id,
                    task.sequence_number,
                    task.title,
                    task.kind.as_str(),
                    status.as_str(),
                    depends_json,
                    task.payload,
                    task.priority
                ],
            )
            .with_context(|| format!("Failed to insert task {}", task.sequence_number))?;
        }

        tx.commit().context("Failed to commit submit transaction")?;
        self.get_tasks_for_feature(&spec.feature_id)
    }

    /// Batch-insert a feature's tasks (feature title left empty).
    pub fn insert_tasks(&self, feature_id: &str, specs: &[TaskSpec]) -> Result<Vec<Task>> {
        self.submit_feature(&FeatureSpec {
            feature_id: feature_id.to_string(),
            title: String::new(),
            tasks: specs.to_vec(),
        })
    }

    pub fn get_feature(&self, feature_id: &str) -> Result<Option<Feature>> {
        let row = self
            .conn
            .query_row(
                "SELECT feature_id, title, status, created_at, completed_at FROM features WHERE feature_id = ?1",
                params![feature_id],
                read_feature_row,
            )
            .optional()
            .context("Failed to query feature")?;
        row.map(FeatureRow::into_feature).transpose()
    }

    pub fn list_features(&self) -> Result<Vec<Feature>> {
        let mut stmt = self
            .conn
            .prepare("SELECT feature_id, title, status, created_at, completed_at FROM features ORDER BY created_at, feature_id")
            .context("Failed to prepare list_features")?;
        let rows = stmt
            .query_map([], read_feature_row)
            .context("Failed to query features")?;
        let mut features = Vec::new();
        for row in rows {
            features.push(row.context("Failed to read feature row")?.into_feature()?);
        }
        Ok(features)
    }

    pub fn in_progress_features(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT feature_id FROM features WHERE status = 'in_progress' ORDER BY created_at, feature_id")
            .context("Failed to prepare in_progress_features")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query in-progress features")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read feature id")?);
        }
        Ok(ids)
    }

    /// Set a feature's status. Returns false if the feature was already in
    /// that status (so notifications fire once).
    pub fn set_feature_status(&self, feature_id: &str, status: &FeatureStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE features SET status = ?1, \
                 completed_at = CASE WHEN ?1 = 'in_progress' THEN NULL ELSE datetime('now') END \
                 WHERE feature_id = ?2 AND status != ?1",
                params![status.as_str(), feature_id],
            )
            .context("Failed to update feature status")?;
        Ok(changed == 1)
    }

    pub fn feature_progress(&self, feature_id: &str) -> Result<FeatureProgress> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks WHERE feature_id = ?1 GROUP BY status")
            .context("Failed to prepare feature_progress")?;
        let rows = stmt
            .query_map(params![feature_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query feature progress")?;
        let mut progress = FeatureProgress::default();
        for row in rows {
            let (status, count) = row.context("Failed to read progress row")?;
            progress.total += count as usize;
            progress.counts.insert(status, count as usize);
        }
        Ok(progress)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id],
                read_task_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn get_tasks_for_feature(&self, feature_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE feature_id = ?1 ORDER BY sequence_number",
                TASK_COLUMNS
            ),
            params![feature_id],
        )
    }

    /// Promote every `queued` task of the feature whose dependencies are all
    /// `completed` to `ready`. Returns the tasks promoted by this call.
    ///
    /// Each promotion is its own conditional update, so concurrent callers
    /// never promote the same task twice.
    pub fn find_ready(&self, feature_id: &str) -> Result<Vec<Task>> {
        let tasks = self.get_tasks_for_feature(feature_id)?;
        let completed: HashSet<i64> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.sequence_number)
            .collect();
        let graph = TaskGraph::from_edges(
            tasks
                .iter()
                .map(|t| (t.sequence_number, t.depends_on.clone())),
        );

        let mut promoted = Vec::new();
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Queued) {
            if graph.dependencies_satisfied(task.sequence_number, &completed)
                && self.transition(task.task_id, TaskStatus::Queued, TaskStatus::Ready)?
                && let Some(updated) = self.get_task(task.task_id)?
            {
                promoted.push(updated);
            }
        }
        Ok(promoted)
    }

    /// Tasks currently `ready`, ordered by priority (highest first) then
    /// sequence number. `None` spans all features.
    pub fn ready_tasks(&self, feature_id: Option<&str>) -> Result<Vec<Task>> {
        match feature_id {
            Some(feature_id) => self.query_tasks(
                &format!(
                    "SELECT {} FROM tasks WHERE feature_id = ?1 AND status = 'ready' \
                     ORDER BY priority DESC, sequence_number ASC, task_id ASC",
                    TASK_COLUMNS
                ),
                params![feature_id],
            ),
            None => self.query_tasks(
                &format!(
                    "SELECT {} FROM tasks WHERE status = 'ready' \
                     ORDER BY priority DESC, sequence_number ASC, task_id ASC",
                    TASK_COLUMNS
                ),
                [],
            ),
        }
    }

    /// Durable count of `running` tasks across all features.
    pub fn count_running(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'running'",
                [],
                |row| row.get(0),
            )
            .context("Failed to count running tasks")
    }

    /// Every task in `status`, across features.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE status = ?1 ORDER BY feature_id, sequence_number",
                TASK_COLUMNS
            ),
            params![status.as_str()],
        )
    }

    /// Compare-and-swap status update. Returns false (and changes nothing)
    /// when the current status is not `from`.
    pub fn transition(&self, task_id: i64, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        if !is_valid_transition(from, to) {
            anyhow::bail!("Invalid task transition {} -> {} for task {}", from, to, task_id);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = datetime('now'), \
                 ready_at = CASE WHEN ?1 = 'ready' THEN datetime('now') ELSE ready_at END, \
                 started_at = CASE WHEN ?1 = 'running' THEN datetime('now') ELSE started_at END \
                 WHERE task_id = ?2 AND status = ?3",
                params![to.as_str(), task_id, from.as_str()],
            )
            .context("Failed to transition task")?;
        Ok(changed == 1)
    }

    pub fn set_external_ref(&self, task_id: i64, external_ref: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET external_ref = ?1, updated_at = datetime('now') WHERE task_id = ?2",
                params![external_ref, task_id],
            )
            .context("Failed to set external_ref")?;
        Ok(())
    }

    pub fn set_execution_ref(&self, task_id: i64, execution_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET execution_ref = ?1, updated_at = datetime('now') WHERE task_id = ?2",
                params![execution_id, task_id],
            )
            .context("Failed to set execution_ref")?;
        Ok(())
    }

    fn query_tasks<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, read_task_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    // ── Executions ────────────────────────────────────────────────────

    pub fn create_execution(
        &self,
        execution_id: &str,
        task_id: i64,
        metadata: &ExecutionMetadata,
    ) -> Result<Execution> {
        metadata.check_single_writer()?;
        let metadata_json =
            serde_json::to_string(metadata).context("Failed to serialize execution metadata")?;
        self.conn
            .execute(
                "INSERT INTO executions (execution_id, task_id, metadata) VALUES (?1, ?2, ?3)",
                params![execution_id, task_id, metadata_json],
            )
            .context("Failed to insert execution")?;
        self.get_execution(execution_id)?
            .context("Execution not found after insert")
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions WHERE execution_id = ?1",
                    EXECUTION_COLUMNS
                ),
                params![execution_id],
                read_execution_row,
            )
            .optional()
            .context("Failed to query execution")?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    pub fn update_execution_metadata(
        &self,
        execution_id: &str,
        metadata: &ExecutionMetadata,
    ) -> Result<()> {
        metadata.check_single_writer()?;
        let metadata_json =
            serde_json::to_string(metadata).context("Failed to serialize execution metadata")?;
        let changed = self
            .conn
            .execute(
                "UPDATE executions SET metadata = ?1 WHERE execution_id = ?2",
                params![metadata_json, execution_id],
            )
            .context("Failed to update execution metadata")?;
        if changed == 0 {
            anyhow::bail!("Execution {} not found", execution_id);
        }
        Ok(())
    }

    pub fn set_execution_workspace(
        &self,
        execution_id: &str,
        workspace_path: Option<&str>,
        branch_name: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET workspace_path = ?1, branch_name = COALESCE(?2, branch_name) \
                 WHERE execution_id = ?3",
                params![workspace_path, branch_name, execution_id],
            )
            .context("Failed to update execution workspace")?;
        Ok(())
    }

    pub fn set_execution_ports(&self, execution_id: &str, ports: Option<PortPair>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET backend_port = ?1, frontend_port = ?2 WHERE execution_id = ?3",
                params![
                    ports.map(|p| p.backend),
                    ports.map(|p| p.frontend),
                    execution_id
                ],
            )
            .context("Failed to update execution ports")?;
        Ok(())
    }

    pub fn mark_execution_released(&self, execution_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET released_at = datetime('now') \
                 WHERE execution_id = ?1 AND released_at IS NULL",
                params![execution_id],
            )
            .context("Failed to mark execution released")?;
        Ok(())
    }

    /// Delete an execution that never ran and point its task back at
    /// `previous`.
    pub fn discard_execution(&self, execution_id: &str, task_id: i64, previous: Option<&str>) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin discard transaction")?;
        tx.execute(
            "DELETE FROM executions WHERE execution_id = ?1 AND task_id = ?2",
            params![execution_id, task_id],
        )
        .context("Failed to delete execution")?;
        tx.execute(
            "UPDATE tasks SET execution_ref = ?1, updated_at = datetime('now') \
             WHERE task_id = ?2 AND execution_ref = ?3",
            params![previous, task_id, execution_id],
        )
        .context("Failed to restore execution_ref")?;
        tx.commit().context("Failed to commit discard")?;
        Ok(())
    }

    pub fn executions_for_task(&self, task_id: i64) -> Result<Vec<Execution>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM executions WHERE task_id = ?1 ORDER BY created_at, rowid",
                EXECUTION_COLUMNS
            ))
            .context("Failed to prepare executions_for_task")?;
        let rows = stmt
            .query_map(params![task_id], read_execution_row)
            .context("Failed to query executions")?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row.context("Failed to read execution row")?.into_execution()?);
        }
        Ok(executions)
    }

    // ── Port slots ────────────────────────────────────────────────────

    /// Make sure slots `0..capacity` exist. Existing reservations are kept.
    pub fn ensure_port_slots(&self, capacity: u32) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin port slot transaction")?;
        {
            let mut stmt = tx
                .prepare("INSERT OR IGNORE INTO port_slots (slot_index) VALUES (?1)")
                .context("Failed to prepare port slot insert")?;
            for index in 0..capacity {
                stmt.execute(params![index])
                    .context("Failed to insert port slot")?;
            }
        }
        tx.commit().context("Failed to commit port slots")?;
        Ok(())
    }

    /// Atomically claim the lowest free slot below `capacity` for
    /// `execution_id`. A repeated claim by the same id returns its slot.
    pub fn claim_port_slot(&self, execution_id: &str, capacity: u32) -> Result<Option<u32>> {
        if let Some(existing) = self.reserved_slot_for(execution_id)? {
            return Ok(Some(existing));
        }
        let changed = self
            .conn
            .execute(
                "UPDATE port_slots SET reserved_by = ?1, reserved_at = datetime('now') \
                 WHERE slot_index = ( \
                     SELECT slot_index FROM port_slots \
                     WHERE reserved_by IS NULL AND slot_index < ?2 \
                     ORDER BY slot_index LIMIT 1 \
                 ) AND reserved_by IS NULL",
                params![execution_id, capacity],
            )
            .context("Failed to claim port slot")?;
        if changed == 0 {
            return Ok(None);
        }
        self.reserved_slot_for(execution_id)
    }

    pub fn release_port_slot(&self, execution_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE port_slots SET reserved_by = NULL, reserved_at = NULL WHERE reserved_by = ?1",
                params![execution_id],
            )
            .context("Failed to release port slot")?;
        Ok(changed > 0)
    }

    pub fn reserved_slot_for(&self, execution_id: &str) -> Result<Option<u32>> {
        self.conn
            .query_row(
                "SELECT slot_index FROM port_slots WHERE reserved_by = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up reserved slot")
    }

    pub fn list_port_slots(&self) -> Result<Vec<PortSlot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT slot_index, reserved_by, reserved_at FROM port_slots ORDER BY slot_index")
            .context("Failed to prepare list_port_slots")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PortSlot {
                    slot_index: row.get(0)?,
                    reserved_by: row.get(1)?,
                    reserved_at: row.get(2)?,
                })
            })
            .context("Failed to query port slots")?;
        let mut slots = Vec::new();
        for row in rows {
            slots.push(row.context("Failed to read port slot row")?);
        }
        Ok(slots)
    }

    // ── Status messages ───────────────────────────────────────────────

    pub fn append_status_message(
        &self,
        feature_id: &str,
        task_id: Option<i64>,
        body: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO status_messages (feature_id, task_id, body) VALUES (?1, ?2, ?3)",
                params![feature_id, task_id, body],
            )
            .context("Failed to insert status message")?;
        Ok(())
    }

    /// The `limit` most recent messages for a feature, newest first.
    pub fn recent_status_messages(&self, feature_id: &str, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT body FROM status_messages WHERE feature_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_status_messages")?;
        let rows = stmt
            .query_map(params![feature_id, limit as i64], |row| row.get::<_, String>(0))
            .context("Failed to query status messages")?;
        let mut bodies = Vec::new();
        for row in rows {
            bodies.push(row.context("Failed to read status message")?);
        }
        Ok(bodies)
    }

    // ── Loop guard ledger ─────────────────────────────────────────────

    pub fn get_attempt_record(&self, task_id: i64) -> Result<Option<AttemptRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT attempt_count, last_failure_at FROM loop_guard WHERE task_id = ?1",
                params![task_id],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .context("Failed to query loop guard entry")?;
        match row {
            None => Ok(None),
            Some((attempt_count, last_failure)) => {
                let last_failure_at = last_failure
                    .map(|s| {
                        chrono::DateTime::parse_from_rfc3339(&s)
                            .map(|t| t.with_timezone(&chrono::Utc))
                            .with_context(|| format!("corrupt last_failure_at '{}'", s))
                    })
                    .transpose()?;
                Ok(Some(AttemptRecord {
                    attempt_count,
                    last_failure_at,
                }))
            }
        }
    }

    pub fn put_attempt_record(&self, task_id: i64, record: &AttemptRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO loop_guard (task_id, attempt_count, last_failure_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(task_id) DO UPDATE SET attempt_count = ?2, last_failure_at = ?3",
                params![
                    task_id,
                    record.attempt_count,
                    record.last_failure_at.map(|t| t.to_rfc3339())
                ],
            )
            .context("Failed to upsert loop guard entry")?;
        Ok(())
    }

    pub fn clear_attempt_record(&self, task_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM loop_guard WHERE task_id = ?1", params![task_id])
            .context("Failed to clear loop guard entry")?;
        Ok(())
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

struct FeatureRow {
    feature_id: String,
    title: String,
    status: String,
    created_at: String,
    completed_at: Option<String>,
}

fn read_feature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeatureRow> {
    Ok(FeatureRow {
        feature_id: row.get(0)?,
        title: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        completed_at: row.get(4)?,
    })
}

impl FeatureRow {
    fn into_feature(self) -> Result<Feature> {
        let status = FeatureStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse feature status")?;
        Ok(Feature {
            feature_id: self.feature_id,
            title: self.title,
            status,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for tasks.
struct TaskRow {
    task_id: i64,
    feature_id: String,
    sequence_number: i64,
    title: String,
    kind: String,
    status: String,
    depends_on: String,
    payload: String,
    priority: i32,
    external_ref: Option<String>,
    execution_ref: Option<String>,
    created_at: String,
    ready_at: Option<String>,
    started_at: Option<String>,
    updated_at: String,
}

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get(0)?,
        feature_id: row.get(1)?,
        sequence_number: row.get(2)?,
        title: row.get(3)?,
        kind: row.get(4)?,
        status: row.get(5)?,
        depends_on: row.get(6)?,
        payload: row.get(7)?,
        priority: row.get(8)?,
        external_ref: row.get(9)?,
        execution_ref: row.get(10)?,
        created_at: row.get(11)?,
        ready_at: row.get(12)?,
        started_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let kind = TaskKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task kind")?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let depends_on: Vec<i64> = serde_json::from_str(&self.depends_on)
            .map_err(|e| anyhow::anyhow!("corrupt depends_on JSON '{}': {}", self.depends_on, e))?;
        Ok(Task {
            task_id: self.task_id,
            feature_id: self.feature_id,
            sequence_number: self.sequence_number,
            title: self.title,
            kind,
            status,
            depends_on,
            payload: self.payload,
            priority: self.priority,
            external_ref: self.external_ref,
            execution_ref: self.execution_ref,
            created_at: self.created_at,
            ready_at: self.ready_at,
            started_at: self.started_at,
            updated_at: self.updated_at,
        })
    }
}

struct ExecutionRow {
    execution_id: String,
    task_id: i64,
    workspace_path: Option<String>,
    backend_port: Option<u16>,
    frontend_port: Option<u16>,
    branch_name: Option<String>,
    metadata: String,
    created_at: String,
    released_at: Option<String>,
}

fn read_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        execution_id: row.get(0)?,
        task_id: row.get(1)?,
        workspace_path: row.get(2)?,
        backend_port: row.get(3)?,
        frontend_port: row.get(4)?,
        branch_name: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
        released_at: row.get(8)?,
    })
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        let metadata: ExecutionMetadata = serde_json::from_str(&self.metadata)
            .context("Failed to parse execution metadata JSON")?;
        let ports = match (self.backend_port, self.frontend_port) {
            (Some(backend), Some(frontend)) => Some(PortPair { backend, frontend }),
            _ => None,
        };
        Ok(Execution {
            execution_id: self.execution_id,
            task_id: self.task_id,
            workspace_path: self.workspace_path,
            ports,
            branch_name: self.branch_name,
            metadata,
            created_at: self.created_at,
            released_at: self.released_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
