// src/store.rs
//
// =============================================================================
// TRANSCODE CLUSTER: PERSISTENT STORE
// =============================================================================
//
// ACID operations over Nodes and Jobs, spec.md §4.1. Grounded in the
// teacher's `CheckpointStore` (src/checkpoint.rs): the same hybrid-relational
// split (status/timestamps/ids as columns, everything else as JSON text) and
// the same additive-only migration idiom.
//
// Two deliberate departures from the teacher, recorded in DESIGN.md:
// 1. One `Mutex<Connection>` held for the store's lifetime instead of a
//    fresh `Connection::open` per call — this is what makes "connection
//    pool of 1" (spec.md §4.1) an enforced invariant rather than a comment.
// 2. No in-memory job/node cache of any kind survives a method return. The
//    teacher's `MarketplaceCoordinator` kept a `HashMap<Uuid, NodeState>`
//    across ticks; every mutation here re-reads from SQLite, which is what
//    spec.md §9's "implicit shared caches are forbidden" redesign note asks
//    for.

use crate::error::{StoreError, StoreResult};
use crate::fsm;
use crate::model::{
    FailureReason, Job, JobSpec, JobStatus, JobSummary, Node, NodeStatus, Priority, QueueClass,
    StateTransition,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration as StdDuration;
use uuid::Uuid;

pub struct Store {
    conn: Mutex<Connection>,
}

// -----------------------------------------------------------------------------
// Open + migrate
// -----------------------------------------------------------------------------

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;
             PRAGMA foreign_keys=ON;",
        )?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates tables if absent, then adds any column a newer schema
    /// expects but an older database file lacks. Never destructive: we
    /// only ever `ADD COLUMN`, never `DROP`/`RENAME`.
    fn migrate(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL UNIQUE,
                cpu_threads INTEGER NOT NULL DEFAULT 0,
                cpu_model TEXT NOT NULL DEFAULT '',
                ram_total_mb INTEGER NOT NULL DEFAULT 0,
                ram_free_mb INTEGER NOT NULL DEFAULT 0,
                gpu_type TEXT,
                capability_tags_json TEXT NOT NULL DEFAULT '[]',
                cpu_use_pct REAL NOT NULL DEFAULT 0.0,
                current_job_id TEXT,
                status TEXT NOT NULL DEFAULT 'available',
                last_heartbeat_ms INTEGER NOT NULL DEFAULT 0,
                registered_at_ms INTEGER NOT NULL DEFAULT 0,
                labels_json TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                sequence_number INTEGER NOT NULL UNIQUE,
                scenario TEXT NOT NULL DEFAULT '',
                engine TEXT NOT NULL DEFAULT 'auto',
                queue TEXT NOT NULL DEFAULT 'default',
                priority TEXT NOT NULL DEFAULT 'medium',
                confidence_hint REAL,
                parameters_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'queued',
                assigned_node TEXT,
                progress_pct INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                error_message TEXT,
                failure_reason TEXT,
                logs TEXT NOT NULL DEFAULT '',
                created_at_ms INTEGER NOT NULL DEFAULT 0,
                started_at_ms INTEGER,
                last_activity_ms INTEGER NOT NULL DEFAULT 0,
                completed_at_ms INTEGER,
                history_json TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_queue_priority_created
                ON jobs(queue, priority, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_jobs_status_activity
                ON jobs(status, last_activity_ms);",
        )?;

        // Additive column introspection: any column named above that an
        // older on-disk schema lacks gets appended with its default.
        Self::add_missing_columns(
            conn,
            "jobs",
            &[
                ("failure_reason", "TEXT"),
                ("logs", "TEXT NOT NULL DEFAULT ''"),
                ("history_json", "TEXT NOT NULL DEFAULT '[]'"),
            ],
        )?;
        Self::add_missing_columns(
            conn,
            "nodes",
            &[("labels_json", "TEXT NOT NULL DEFAULT '{}'")],
        )?;

        Ok(())
    }

    fn add_missing_columns(
        conn: &Connection,
        table: &str,
        columns: &[(&str, &str)],
    ) -> StoreResult<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let existing: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(Result::ok)
            .collect();

        for (name, decl) in columns {
            if !existing.iter().any(|c| c == name) {
                conn.execute(
                    &format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"),
                    [],
                )?;
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Row <-> struct mapping
// -----------------------------------------------------------------------------

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn opt_ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_dt)
}

fn node_from_row(row: &Row) -> rusqlite::Result<Node> {
    let id: String = row.get("id")?;
    let tags_json: String = row.get("capability_tags_json")?;
    let labels_json: String = row.get("labels_json")?;
    let status: String = row.get("status")?;
    let current_job_id: Option<String> = row.get("current_job_id")?;

    Ok(Node {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get("name")?,
        address: row.get("address")?,
        cpu_threads: row.get::<_, i64>("cpu_threads")? as usize,
        cpu_model: row.get("cpu_model")?,
        ram_total_mb: row.get::<_, i64>("ram_total_mb")? as u64,
        ram_free_mb: row.get::<_, i64>("ram_free_mb")? as u64,
        gpu_type: row.get("gpu_type")?,
        capability_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        cpu_use_pct: row.get::<_, f64>("cpu_use_pct")? as f32,
        current_job_id: current_job_id.and_then(|s| Uuid::parse_str(&s).ok()),
        status: match status.as_str() {
            "busy" => NodeStatus::Busy,
            "offline" => NodeStatus::Offline,
            _ => NodeStatus::Available,
        },
        last_heartbeat: ms_to_dt(row.get("last_heartbeat_ms")?),
        registered_at: ms_to_dt(row.get("registered_at_ms")?),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let id: String = row.get("id")?;
    let engine: String = row.get("engine")?;
    let queue: String = row.get("queue")?;
    let priority: String = row.get("priority")?;
    let status: String = row.get("status")?;
    let assigned_node: Option<String> = row.get("assigned_node")?;
    let failure_reason: Option<String> = row.get("failure_reason")?;
    let parameters_json: String = row.get("parameters_json")?;
    let history_json: String = row.get("history_json")?;

    Ok(Job {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        sequence_number: row.get("sequence_number")?,
        scenario: row.get("scenario")?,
        engine: match engine.as_str() {
            "ffmpeg" => crate::model::Engine::Ffmpeg,
            "gstreamer" => crate::model::Engine::Gstreamer,
            _ => crate::model::Engine::Auto,
        },
        queue: match queue.as_str() {
            "live" => QueueClass::Live,
            "batch" => QueueClass::Batch,
            _ => QueueClass::Default,
        },
        priority: match priority.as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        },
        confidence_hint: row.get("confidence_hint")?,
        parameters: serde_json::from_str(&parameters_json).unwrap_or_default(),
        status: JobStatus::from_db_str(&status).unwrap_or(JobStatus::Queued),
        assigned_node: assigned_node.and_then(|s| Uuid::parse_str(&s).ok()),
        progress_pct: row.get::<_, i64>("progress_pct")? as u8,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        error_message: row.get("error_message")?,
        failure_reason: failure_reason.and_then(|s| serde_json::from_value(serde_json::json!(s)).ok()),
        logs: row.get("logs")?,
        created_at: ms_to_dt(row.get("created_at_ms")?),
        started_at: opt_ms_to_dt(row.get("started_at_ms")?),
        last_activity: ms_to_dt(row.get("last_activity_ms")?),
        completed_at: opt_ms_to_dt(row.get("completed_at_ms")?),
        history: serde_json::from_str(&history_json).unwrap_or_default(),
    })
}

fn failure_reason_str(reason: FailureReason) -> &'static str {
    match reason {
        FailureReason::UserError => "user_error",
        FailureReason::CapabilityMismatch => "capability_mismatch",
        FailureReason::InputError => "input_error",
        FailureReason::NetworkError => "network_error",
        FailureReason::ResourceError => "resource_error",
        FailureReason::Timeout => "timeout",
        FailureReason::RuntimeError => "runtime_error",
    }
}

// -----------------------------------------------------------------------------
// Retry-on-contention helper (spec.md §7: StoreConflict retried internally
// up to 3 times with a short backoff before surfacing).
// -----------------------------------------------------------------------------

fn retry_on_busy<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> StoreResult<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < 3 =>
            {
                attempt += 1;
                thread::sleep(StdDuration::from_millis(20 * attempt as u64));
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                return Err(StoreError::StoreConflict)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// -----------------------------------------------------------------------------
// Node operations
// -----------------------------------------------------------------------------

impl Store {
    /// Insert-or-update-in-place keyed by address; returns the canonical
    /// record (with the existing ID if the address was already known).
    pub fn register_node(&self, node: Node) -> StoreResult<Node> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            let existing_id: Option<String> = conn
                .query_row(
                    "SELECT id FROM nodes WHERE address = ?1",
                    params![node.address],
                    |r| r.get(0),
                )
                .optional()?;

            let id = match &existing_id {
                Some(s) => Uuid::parse_str(s).unwrap_or(node.id),
                None => node.id,
            };

            let tags_json = serde_json::to_string(&node.capability_tags).unwrap();
            let labels_json = serde_json::to_string(&node.labels).unwrap();
            let registered_at_ms = node.registered_at.timestamp_millis();
            let heartbeat_ms = node.last_heartbeat.timestamp_millis();

            conn.execute(
                "INSERT INTO nodes (id, name, address, cpu_threads, cpu_model, ram_total_mb,
                    ram_free_mb, gpu_type, capability_tags_json, cpu_use_pct, current_job_id,
                    status, last_heartbeat_ms, registered_at_ms, labels_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(address) DO UPDATE SET
                    name=excluded.name,
                    cpu_threads=excluded.cpu_threads,
                    cpu_model=excluded.cpu_model,
                    ram_total_mb=excluded.ram_total_mb,
                    ram_free_mb=excluded.ram_free_mb,
                    gpu_type=excluded.gpu_type,
                    capability_tags_json=excluded.capability_tags_json,
                    last_heartbeat_ms=excluded.last_heartbeat_ms,
                    labels_json=excluded.labels_json",
                params![
                    id.to_string(),
                    node.name,
                    node.address,
                    node.cpu_threads as i64,
                    node.cpu_model,
                    node.ram_total_mb as i64,
                    node.ram_free_mb as i64,
                    node.gpu_type,
                    tags_json,
                    node.cpu_use_pct as f64,
                    node.current_job_id.map(|u| u.to_string()),
                    node.status_db_str(),
                    heartbeat_ms,
                    registered_at_ms,
                    labels_json,
                ],
            )?;

            conn.query_row(
                "SELECT * FROM nodes WHERE id = ?1",
                params![id.to_string()],
                node_from_row,
            )
        })
    }

    pub fn get_node(&self, id: Uuid) -> StoreResult<Node> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM nodes WHERE id = ?1",
            params![id.to_string()],
            node_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn update_node_status(&self, id: Uuid, status: NodeStatus) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let affected = retry_on_busy(|| {
            conn.execute(
                "UPDATE nodes SET status=?1, last_heartbeat_ms=?2 WHERE id=?3",
                params![status_db_str(status), now, id.to_string()],
            )
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_node_heartbeat(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let affected = retry_on_busy(|| {
            conn.execute(
                "UPDATE nodes SET last_heartbeat_ms=?1 WHERE id=?2",
                params![now, id.to_string()],
            )
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn delete_node(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let affected = retry_on_busy(|| {
            conn.execute("DELETE FROM nodes WHERE id=?1", params![id.to_string()])
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn list_available_nodes(&self) -> StoreResult<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM nodes WHERE status = 'available'")?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    pub fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM nodes")?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Nodes whose heartbeat is older than `worker_timeout`; used by the
    /// health loop (spec.md §4.4 step 1).
    pub fn list_stale_nodes(&self, worker_timeout: StdDuration) -> StoreResult<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::from_std(worker_timeout).unwrap())
            .timestamp_millis();
        let mut stmt = conn.prepare(
            "SELECT * FROM nodes WHERE status != 'offline' AND last_heartbeat_ms < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], node_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

fn status_db_str(s: NodeStatus) -> &'static str {
    match s {
        NodeStatus::Available => "available",
        NodeStatus::Busy => "busy",
        NodeStatus::Offline => "offline",
    }
}

trait NodeDbExt {
    fn status_db_str(&self) -> &'static str;
}
impl NodeDbExt for Node {
    fn status_db_str(&self) -> &'static str {
        status_db_str(self.status)
    }
}

// -----------------------------------------------------------------------------
// Job operations
// -----------------------------------------------------------------------------

impl Store {
    /// Allocates the next sequence number under the store's single writer
    /// lock and inserts the job in `queued`. Sequence numbers are mandatory
    /// and atomically allocated, per the Open Question resolution in
    /// DESIGN.md.
    pub fn create_job(&self, spec: JobSpec) -> StoreResult<Job> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            let next_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM jobs",
                [],
                |r| r.get(0),
            )?;

            let job = Job::from_spec(spec.clone(), next_seq);
            insert_job(&conn, &job)?;
            Ok(job)
        })
    }

    pub fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id.to_string()],
            job_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn get_job_by_seq(&self, seq: i64) -> StoreResult<Job> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM jobs WHERE sequence_number = ?1",
            params![seq],
            job_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Validates against the FSM, appends a transition, updates status.
    /// Idempotent: `to == current` is a no-op that returns `Ok(false)`.
    pub fn transition_state(&self, job_id: Uuid, to: JobStatus, reason: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            let tx = conn.unchecked_transaction()?;
            let mut job = match tx
                .query_row(
                    "SELECT * FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                    job_from_row,
                )
                .optional()?
            {
                Some(j) => j,
                None => return Ok(Err(StoreError::NotFound)),
            };

            if job.status == to {
                return Ok(Ok(false));
            }

            if !fsm::allowed_transition(job.status, to) {
                return Ok(Err(StoreError::InvalidTransition {
                    from: job.status.as_db_str().into(),
                    to: to.as_db_str().into(),
                }));
            }

            apply_transition(&mut job, to, reason);
            update_job_full(&tx, &job)?;
            tx.commit()?;
            Ok(Ok(true))
        })?
    }

    /// Atomic: job `queued` -> `assigned`, node -> `busy`, node.current_job
    /// set. Idempotent if the same pair is already assigned.
    pub fn assign_job_to_worker(&self, job_id: Uuid, node_id: Uuid) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            let tx = conn.unchecked_transaction()?;

            let mut job = match tx
                .query_row(
                    "SELECT * FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                    job_from_row,
                )
                .optional()?
            {
                Some(j) => j,
                None => return Ok(Err(StoreError::NotFound)),
            };

            if job.status == JobStatus::Assigned && job.assigned_node == Some(node_id) {
                return Ok(Ok(false));
            }

            if !fsm::allowed_transition(job.status, JobStatus::Assigned) {
                return Ok(Err(StoreError::InvalidTransition {
                    from: job.status.as_db_str().into(),
                    to: "assigned".into(),
                }));
            }

            let node = match tx
                .query_row(
                    "SELECT * FROM nodes WHERE id = ?1",
                    params![node_id.to_string()],
                    node_from_row,
                )
                .optional()?
            {
                Some(n) => n,
                None => return Ok(Err(StoreError::NotFound)),
            };

            if node.status == NodeStatus::Busy && node.current_job_id != Some(job_id) {
                return Ok(Err(StoreError::NodeBusy));
            }
            if node.status == NodeStatus::Offline {
                return Ok(Err(StoreError::NodeUnavailable));
            }

            apply_transition(&mut job, JobStatus::Assigned, "assigned to worker");
            job.assigned_node = Some(node_id);
            update_job_full(&tx, &job)?;

            tx.execute(
                "UPDATE nodes SET status='busy', current_job_id=?1, last_heartbeat_ms=?2 WHERE id=?3",
                params![
                    job_id.to_string(),
                    Utc::now().timestamp_millis(),
                    node_id.to_string()
                ],
            )?;

            tx.commit()?;
            Ok(Ok(true))
        })?
    }

    /// Atomic: job `running` -> `completed`, node `busy` -> `available`.
    pub fn complete_job(&self, job_id: Uuid, node_id: Uuid) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            let tx = conn.unchecked_transaction()?;

            let mut job = match tx
                .query_row(
                    "SELECT * FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                    job_from_row,
                )
                .optional()?
            {
                Some(j) => j,
                None => return Ok(Err(StoreError::NotFound)),
            };

            if job.status == JobStatus::Completed {
                return Ok(Ok(false));
            }

            if !fsm::allowed_transition(job.status, JobStatus::Completed) {
                return Ok(Err(StoreError::InvalidTransition {
                    from: job.status.as_db_str().into(),
                    to: "completed".into(),
                }));
            }

            apply_transition(&mut job, JobStatus::Completed, "completed by worker");
            job.progress_pct = 100;
            update_job_full(&tx, &job)?;

            tx.execute(
                "UPDATE nodes SET status='available', current_job_id=NULL WHERE id=?1
                 AND current_job_id=?2",
                params![node_id.to_string(), job_id.to_string()],
            )?;

            tx.commit()?;
            Ok(Ok(true))
        })?
    }

    /// Frees `node_id` if it still holds `job_id`, without touching the
    /// job's (already-terminal) status. Used when a worker confirms a
    /// canceled job's process has been torn down, spec.md §5 cancellation
    /// semantics.
    pub fn release_node_if_attached(&self, node_id: Uuid, job_id: Uuid) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            conn.execute(
                "UPDATE nodes SET status='available', current_job_id=NULL WHERE id=?1
                 AND current_job_id=?2",
                params![node_id.to_string(), job_id.to_string()],
            )
        })?;
        Ok(())
    }

    /// Increments retry_count, clears assigned_node, transitions to
    /// `queued`, frees the node if still attached. Callable from any
    /// non-terminal status: detours through the FSM's intermediate
    /// states (`running -> timed_out -> retrying -> queued`, etc.) the
    /// same way the cleanup loop does by hand, so callers never need to
    /// pre-transition before requeuing.
    pub fn retry_job(&self, job_id: Uuid, reason: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        retry_on_busy(|| {
            let tx = conn.unchecked_transaction()?;
            let mut job = match tx
                .query_row(
                    "SELECT * FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                    job_from_row,
                )
                .optional()?
            {
                Some(j) => j,
                None => return Ok(Err(StoreError::NotFound)),
            };

            let freed_node = job.assigned_node.take();

            loop {
                let next = match job.status {
                    JobStatus::Running => JobStatus::TimedOut,
                    JobStatus::Assigned | JobStatus::TimedOut => JobStatus::Retrying,
                    JobStatus::Retrying => JobStatus::Queued,
                    _ => {
                        return Ok(Err(StoreError::InvalidTransition {
                            from: job.status.as_db_str().into(),
                            to: "queued".into(),
                        }))
                    }
                };
                if !fsm::allowed_transition(job.status, next) {
                    return Ok(Err(StoreError::InvalidTransition {
                        from: job.status.as_db_str().into(),
                        to: next.as_db_str().into(),
                    }));
                }
                if next == JobStatus::Queued {
                    job.retry_count += 1;
                }
                apply_transition(&mut job, next, reason);
                if next == JobStatus::Queued {
                    break;
                }
            }

            update_job_full(&tx, &job)?;

            if let Some(node_id) = freed_node {
                tx.execute(
                    "UPDATE nodes SET status='available', current_job_id=NULL WHERE id=?1
                     AND current_job_id=?2",
                    params![node_id.to_string(), job_id.to_string()],
                )?;
            }

            tx.commit()?;
            Ok(Ok(()))
        })?
    }

    pub fn heartbeat_job(&self, job_id: Uuid) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let affected = retry_on_busy(|| {
            conn.execute(
                "UPDATE jobs SET last_activity_ms=?1 WHERE id=?2",
                params![now, job_id.to_string()],
            )
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_progress(&self, job_id: Uuid, progress_pct: u8) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let affected = retry_on_busy(|| {
            conn.execute(
                "UPDATE jobs SET progress_pct=?1, last_activity_ms=?2 WHERE id=?3",
                params![progress_pct as i64, now, job_id.to_string()],
            )
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Records the failure detail on a job without mutating its state —
    /// callers pair this with `transition_state`/`retry_job`.
    pub fn set_failure(
        &self,
        job_id: Uuid,
        message: &str,
        reason: FailureReason,
        logs: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let affected = retry_on_busy(|| {
            conn.execute(
                "UPDATE jobs SET error_message=?1, failure_reason=?2, logs=?3 WHERE id=?4",
                params![
                    message,
                    failure_reason_str(reason),
                    logs,
                    job_id.to_string()
                ],
            )
        })?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Jobs in `assigned`/`running` whose assigned node is offline or has
    /// missed heartbeats (spec.md §4.1 `get_orphaned`).
    pub fn get_orphaned(&self, worker_timeout: StdDuration) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::from_std(worker_timeout).unwrap())
            .timestamp_millis();
        let mut stmt = conn.prepare(
            "SELECT j.* FROM jobs j
             LEFT JOIN nodes n ON n.id = j.assigned_node
             WHERE j.status IN ('assigned', 'running')
               AND (n.id IS NULL OR n.status = 'offline' OR n.last_heartbeat_ms < ?1)",
        )?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Jobs whose (state, elapsed) exceed the FSM-computed timeout
    /// (spec.md §4.1 `get_timed_out`); already-marked `timed_out` jobs are
    /// included so the cleanup loop can act on a coordinator-restart
    /// recovery too.
    pub fn get_timed_out(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = 'timed_out'")?;
        let rows = stmt.query_map([], job_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Jobs in `assigned` longer than `assigned_timeout` or `running`
    /// longer than their computed per-engine timeout without activity;
    /// used directly by the health loop rather than going through
    /// `get_timed_out`, which only sees jobs already marked.
    pub fn get_running_over_timeout(&self, heartbeat_timeout: StdDuration) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::from_std(heartbeat_timeout).unwrap())
            .timestamp_millis();
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'running' AND last_activity_ms < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    pub fn get_assigned_over_timeout(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let cutoff =
            (Utc::now() - chrono::Duration::from_std(fsm::ASSIGNED_TIMEOUT).unwrap())
                .timestamp_millis();
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'assigned' AND last_activity_ms < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Snapshot of jobs in `queued`/`retrying`, spec.md §4.1 `get_queued`.
    pub fn get_queued(
        &self,
        queue: Option<QueueClass>,
        priority: Option<Priority>,
    ) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT * FROM jobs WHERE status IN ('queued', 'retrying')",
        );
        if let Some(q) = queue {
            sql.push_str(&format!(" AND queue = '{}'", queue_db_str(q)));
        }
        if let Some(p) = priority {
            sql.push_str(&format!(" AND priority = '{}'", priority_db_str(p)));
        }
        sql.push_str(" ORDER BY created_at_ms ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], job_from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    pub fn list_jobs_summary(&self) -> StoreResult<Vec<JobSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, sequence_number, status, queue, priority, assigned_node,
                    progress_pct, last_activity_ms
             FROM jobs ORDER BY last_activity_ms DESC LIMIT 1000",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let status: String = row.get(2)?;
            let queue: String = row.get(3)?;
            let priority: String = row.get(4)?;
            let assigned_node: Option<String> = row.get(5)?;
            Ok(JobSummary {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                sequence_number: row.get(1)?,
                status: JobStatus::from_db_str(&status).unwrap_or(JobStatus::Queued),
                queue: match queue.as_str() {
                    "live" => QueueClass::Live,
                    "batch" => QueueClass::Batch,
                    _ => QueueClass::Default,
                },
                priority: match priority.as_str() {
                    "high" => Priority::High,
                    "low" => Priority::Low,
                    _ => Priority::Medium,
                },
                assigned_node: assigned_node.and_then(|s| Uuid::parse_str(&s).ok()),
                progress_pct: row.get::<_, i64>(6)? as u8,
                updated_at: ms_to_dt(row.get(7)?),
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

fn queue_db_str(q: QueueClass) -> &'static str {
    match q {
        QueueClass::Live => "live",
        QueueClass::Default => "default",
        QueueClass::Batch => "batch",
    }
}

fn priority_db_str(p: Priority) -> &'static str {
    match p {
        Priority::High => "high",
        Priority::Medium => "medium",
        Priority::Low => "low",
    }
}

fn apply_transition(job: &mut Job, to: JobStatus, reason: &str) {
    let now = Utc::now();
    job.history.push(StateTransition {
        from: job.status,
        to,
        timestamp: now,
        reason: reason.to_string(),
    });
    if job.status == JobStatus::Queued && job.started_at.is_none() {
        job.started_at = Some(now);
    }
    job.status = to;
    job.last_activity = now;
    if to.is_terminal() {
        job.completed_at = Some(now);
    }
}

fn insert_job(conn: &Connection, job: &Job) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, sequence_number, scenario, engine, queue, priority,
            confidence_hint, parameters_json, status, assigned_node, progress_pct,
            retry_count, max_retries, error_message, failure_reason, logs,
            created_at_ms, started_at_ms, last_activity_ms, completed_at_ms, history_json)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
        params![
            job.id.to_string(),
            job.sequence_number,
            job.scenario,
            engine_db_str(job.engine),
            queue_db_str(job.queue),
            priority_db_str(job.priority),
            job.confidence_hint,
            serde_json::to_string(&job.parameters).unwrap(),
            job.status.as_db_str(),
            job.assigned_node.map(|u| u.to_string()),
            job.progress_pct as i64,
            job.retry_count as i64,
            job.max_retries as i64,
            job.error_message,
            job.failure_reason.map(failure_reason_str),
            job.logs,
            job.created_at.timestamp_millis(),
            job.started_at.map(|d| d.timestamp_millis()),
            job.last_activity.timestamp_millis(),
            job.completed_at.map(|d| d.timestamp_millis()),
            serde_json::to_string(&job.history).unwrap(),
        ],
    )?;
    Ok(())
}

fn update_job_full(conn: &Connection, job: &Job) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE jobs SET status=?1, assigned_node=?2, progress_pct=?3, retry_count=?4,
            error_message=?5, failure_reason=?6, logs=?7, started_at_ms=?8,
            last_activity_ms=?9, completed_at_ms=?10, history_json=?11
         WHERE id=?12",
        params![
            job.status.as_db_str(),
            job.assigned_node.map(|u| u.to_string()),
            job.progress_pct as i64,
            job.retry_count as i64,
            job.error_message,
            job.failure_reason.map(failure_reason_str),
            job.logs,
            job.started_at.map(|d| d.timestamp_millis()),
            job.last_activity.timestamp_millis(),
            job.completed_at.map(|d| d.timestamp_millis()),
            serde_json::to_string(&job.history).unwrap(),
            job.id.to_string(),
        ],
    )?;
    Ok(())
}

fn engine_db_str(e: crate::model::Engine) -> &'static str {
    match e {
        crate::model::Engine::Auto => "auto",
        crate::model::Engine::Ffmpeg => "ffmpeg",
        crate::model::Engine::Gstreamer => "gstreamer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Engine, Priority, QueueClass};

    fn test_node(address: &str) -> Node {
        Node::new_registration(
            "w1".into(),
            address.into(),
            8,
            "generic".into(),
            16384,
            8192,
            None,
            vec![],
            Default::default(),
        )
    }

    fn test_spec() -> JobSpec {
        JobSpec {
            scenario: "720p-h264".into(),
            engine: Engine::Ffmpeg,
            queue: QueueClass::Default,
            priority: Priority::Medium,
            confidence_hint: None,
            parameters: Default::default(),
            max_retries: 3,
        }
    }

    #[test]
    fn register_node_is_idempotent_on_address() {
        let store = Store::open_in_memory().unwrap();
        let n1 = store.register_node(test_node("10.0.0.1:9000")).unwrap();
        let n2 = store.register_node(test_node("10.0.0.1:9000")).unwrap();
        assert_eq!(n1.id, n2.id);
        assert_eq!(store.list_nodes().unwrap().len(), 1);
    }

    #[test]
    fn create_job_allocates_sequence_numbers() {
        let store = Store::open_in_memory().unwrap();
        let j1 = store.create_job(test_spec()).unwrap();
        let j2 = store.create_job(test_spec()).unwrap();
        assert_eq!(j1.sequence_number, 1);
        assert_eq!(j2.sequence_number, 2);
        assert_eq!(j1.status, JobStatus::Queued);
    }

    #[test]
    fn assign_complete_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let node = store.register_node(test_node("10.0.0.2:9000")).unwrap();
        let job = store.create_job(test_spec()).unwrap();

        assert!(store.assign_job_to_worker(job.id, node.id).unwrap());
        // idempotent
        assert!(!store.assign_job_to_worker(job.id, node.id).unwrap());

        let reloaded_node = store.get_node(node.id).unwrap();
        assert_eq!(reloaded_node.status, NodeStatus::Busy);
        assert_eq!(reloaded_node.current_job_id, Some(job.id));

        assert!(store
            .transition_state(job.id, JobStatus::Running, "started")
            .unwrap());
        assert!(store.complete_job(job.id, node.id).unwrap());
        assert!(!store.complete_job(job.id, node.id).unwrap());

        let reloaded_job = store.get_job(job.id).unwrap();
        assert_eq!(reloaded_job.status, JobStatus::Completed);
        assert_eq!(reloaded_job.history.last().unwrap().to, JobStatus::Completed);

        let freed_node = store.get_node(node.id).unwrap();
        assert_eq!(freed_node.status, NodeStatus::Available);
        assert_eq!(freed_node.current_job_id, None);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let job = store.create_job(test_spec()).unwrap();
        let err = store
            .transition_state(job.id, JobStatus::Completed, "skip ahead")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn retry_job_requeues_and_frees_node() {
        let store = Store::open_in_memory().unwrap();
        let node = store.register_node(test_node("10.0.0.3:9000")).unwrap();
        let job = store.create_job(test_spec()).unwrap();
        store.assign_job_to_worker(job.id, node.id).unwrap();
        store
            .transition_state(job.id, JobStatus::Running, "started")
            .unwrap();
        store
            .transition_state(job.id, JobStatus::TimedOut, "no heartbeat")
            .unwrap();

        store.retry_job(job.id, "worker dead").unwrap();

        let reloaded_job = store.get_job(job.id).unwrap();
        assert_eq!(reloaded_job.status, JobStatus::Queued);
        assert_eq!(reloaded_job.retry_count, 1);
        assert_eq!(reloaded_job.assigned_node, None);

        let reloaded_node = store.get_node(node.id).unwrap();
        assert_eq!(reloaded_node.status, NodeStatus::Available);
    }

    #[test]
    fn get_queued_orders_by_creation_and_filters() {
        let store = Store::open_in_memory().unwrap();
        let mut low_batch = test_spec();
        low_batch.queue = QueueClass::Batch;
        low_batch.priority = Priority::Low;
        store.create_job(low_batch).unwrap();

        let mut high_live = test_spec();
        high_live.queue = QueueClass::Live;
        high_live.priority = Priority::High;
        store.create_job(high_live).unwrap();

        let all = store.get_queued(None, None).unwrap();
        assert_eq!(all.len(), 2);

        let only_live = store.get_queued(Some(QueueClass::Live), None).unwrap();
        assert_eq!(only_live.len(), 1);
        assert_eq!(only_live[0].queue, QueueClass::Live);
    }

    #[test]
    fn migrate_is_idempotent_and_additive() {
        let conn = Connection::open_in_memory().unwrap();
        Store::migrate(&conn).unwrap();
        // Simulate an older schema missing a newer column.
        conn.execute("ALTER TABLE jobs DROP COLUMN logs", [])
            .unwrap_or(0); // sqlite may not support DROP COLUMN; ignore if so
        Store::migrate(&conn).unwrap();
        Store::migrate(&conn).unwrap();
    }
}
