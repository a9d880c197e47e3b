//! `SQLite`-backed implementation of [`Store`].
//!
//! Uses a single `Mutex<Connection>` per process. Cross-process safety comes
//! from `SQLite` itself: WAL journaling, a busy timeout, `IMMEDIATE`
//! transactions for multi-row writes, and the uniqueness constraints on
//! mount mappings and dispatch guards.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::error::{StoreError, StoreResult};
use super::{
    FlowInstance, FlowStatus, JobInstance, JobStatus, MountMapping, NewFlowInstance, Store,
};
use crate::flow::models::{flow_from_value, FlowDecodeError, DESTINATION_PORT, SOURCE_PORT};

/// How long a writer waits on another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idempotent DDL for scheduler tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS flow_instances (
    id TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    flow_name TEXT NOT NULL,
    flow_json TEXT NOT NULL,
    src_uid TEXT NOT NULL,
    sender TEXT,
    arrival_priority INTEGER,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_instance_id TEXT NOT NULL REFERENCES flow_instances(id),
    model_index INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    input_ports TEXT NOT NULL,
    output_ports TEXT NOT NULL,
    priority INTEGER NOT NULL,
    gpu INTEGER NOT NULL,
    status TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (flow_instance_id, model_index)
);

CREATE TABLE IF NOT EXISTS mount_mappings (
    flow_instance_id TEXT NOT NULL REFERENCES flow_instances(id),
    port TEXT NOT NULL,
    blob_uid TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (flow_instance_id, port)
);

CREATE TABLE IF NOT EXISTS dispatch_guards (
    flow_instance_id TEXT NOT NULL REFERENCES flow_instances(id),
    model_index INTEGER NOT NULL,
    claimed_at TEXT NOT NULL,
    PRIMARY KEY (flow_instance_id, model_index)
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON job_instances (status);
CREATE INDEX IF NOT EXISTS idx_flows_status ON flow_instances (status);
";

const FLOW_COLUMNS: &str = "f.id, f.schema_version, f.flow_json, f.src_uid, f.sender, \
     f.arrival_priority, f.status, f.created_at, f.updated_at";

const JOB_COLUMNS: &str = "j.id, j.flow_instance_id, j.model_index, j.model_name, \
     j.input_ports, j.output_ports, j.priority, j.gpu, j.status, j.retries, \
     j.created_at, j.updated_at";

/// Flow row as read, before JSON and status decoding.
struct FlowRow {
    id: String,
    schema_version: i64,
    flow_json: String,
    src_uid: String,
    sender: Option<String>,
    arrival_priority: Option<i64>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl FlowRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            schema_version: row.get(1)?,
            flow_json: row.get(2)?,
            src_uid: row.get(3)?,
            sender: row.get(4)?,
            arrival_priority: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> StoreResult<FlowInstance> {
        let raw: serde_json::Value = serde_json::from_str(&self.flow_json)?;
        let flow = flow_from_value(raw).map_err(|e| match e {
            FlowDecodeError::Invalid(inner) => StoreError::Serialization(inner),
            FlowDecodeError::UnsupportedSchema(v) => StoreError::CorruptRow(format!(
                "flow instance '{}' stored with schema {} (column says {})",
                self.id, v, self.schema_version
            )),
        })?;

        Ok(FlowInstance {
            flow,
            src_uid: self.src_uid,
            sender: self.sender,
            arrival_priority: self
                .arrival_priority
                .map(|p| narrow(p, "arrival_priority"))
                .transpose()?,
            status: self.status.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            id: self.id,
        })
    }
}

/// Job row as read, before JSON and status decoding.
struct JobRow {
    id: i64,
    flow_instance_id: String,
    model_index: i64,
    model_name: String,
    input_ports: String,
    output_ports: String,
    priority: i64,
    gpu: bool,
    status: String,
    retries: i64,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_instance_id: row.get(1)?,
            model_index: row.get(2)?,
            model_name: row.get(3)?,
            input_ports: row.get(4)?,
            output_ports: row.get(5)?,
            priority: row.get(6)?,
            gpu: row.get(7)?,
            status: row.get(8)?,
            retries: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self) -> StoreResult<JobInstance> {
        Ok(JobInstance {
            id: self.id,
            flow_instance_id: self.flow_instance_id,
            model_index: narrow(self.model_index, "model_index")?,
            model_name: self.model_name,
            input_ports: serde_json::from_str(&self.input_ports)?,
            output_ports: serde_json::from_str(&self.output_ports)?,
            priority: narrow(self.priority, "priority")?,
            gpu: self.gpu,
            status: self.status.parse()?,
            retries: narrow(self.retries, "retries")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Convert a stored integer into a narrower Rust type.
fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> StoreResult<T> {
    T::try_from(value)
        .map_err(|_| StoreError::CorruptRow(format!("{} out of range: {}", column, value)))
}

/// `SQLite`-backed scheduler storage.
///
/// Create with [`SqliteStore::open`] for file-backed persistence or
/// [`SqliteStore::in_memory`] for tests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at `path`, creating parent directories.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StoreError::sqlite("open", e))?;
        let journal: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| StoreError::sqlite("enable wal", e))?;
        debug!(path = %path.display(), journal = %journal, "opened scheduler store");
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::sqlite("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StoreError::sqlite("busy timeout", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StoreError::sqlite("foreign keys", e))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::sqlite("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn query_flow(conn: &Connection, id: &str) -> StoreResult<Option<FlowInstance>> {
        let sql = format!("SELECT {} FROM flow_instances f WHERE f.id = ?1", FLOW_COLUMNS);
        conn.query_row(&sql, [id], FlowRow::from_row)
            .optional()
            .map_err(|e| StoreError::sqlite("get_flow_by_id", e))?
            .map(FlowRow::decode)
            .transpose()
    }

    fn query_flows(
        conn: &Connection,
        context: &'static str,
        filter: &str,
    ) -> StoreResult<Vec<FlowInstance>> {
        let sql = format!("SELECT {} FROM flow_instances f {}", FLOW_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::sqlite(context, e))?;
        let rows = stmt
            .query_map([], FlowRow::from_row)
            .map_err(|e| StoreError::sqlite(context, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StoreError::sqlite(context, e))?;
        rows.into_iter().map(FlowRow::decode).collect()
    }

    fn query_jobs<P: rusqlite::Params>(
        conn: &Connection,
        context: &'static str,
        sql: &str,
        params: P,
    ) -> StoreResult<Vec<JobInstance>> {
        let mut stmt = conn.prepare(sql).map_err(|e| StoreError::sqlite(context, e))?;
        let rows = stmt
            .query_map(params, JobRow::from_row)
            .map_err(|e| StoreError::sqlite(context, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StoreError::sqlite(context, e))?;
        rows.into_iter().map(JobRow::decode).collect()
    }

    /// Insert a dispatch guard row. A primary-key conflict means the guard is
    /// already held; any other failure, e.g. an unknown flow, is an error.
    fn insert_guard(
        conn: &Connection,
        flow_instance_id: &str,
        model_index: usize,
    ) -> StoreResult<bool> {
        let index = i64::try_from(model_index)
            .map_err(|_| StoreError::CorruptRow(format!("model index {} too large", model_index)))?;

        match conn.execute(
            "INSERT INTO dispatch_guards (flow_instance_id, model_index, claimed_at) \
             VALUES (?1, ?2, ?3)",
            params![flow_instance_id, index, Self::now()],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
                    && err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Ok(false)
            }
            Err(e) => Err(StoreError::sqlite("insert_dispatch_guard", e)),
        }
    }

    fn set_dispatched(conn: &Connection, job_id: i64) -> StoreResult<bool> {
        let changed = conn
            .execute(
                "UPDATE job_instances SET status = ?1, retries = retries + 1, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![
                    JobStatus::Dispatched.as_str(),
                    Self::now(),
                    job_id,
                    JobStatus::Pending.as_str()
                ],
            )
            .map_err(|e| StoreError::sqlite("mark_job_dispatched", e))?;
        Ok(changed > 0)
    }
}

impl Store for SqliteStore {
    fn create_flow_instance(&self, new: &NewFlowInstance) -> StoreResult<(FlowInstance, bool)> {
        let flow_json = serde_json::to_string(&new.flow)?;
        let now = Self::now();

        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::sqlite("create_flow_instance: begin", e))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO flow_instances \
                 (id, schema_version, flow_name, flow_json, src_uid, sender, arrival_priority, \
                  status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    new.id,
                    new.flow.schema,
                    new.flow.name,
                    flow_json,
                    new.src_uid,
                    new.sender,
                    new.arrival_priority,
                    FlowStatus::Pending.as_str(),
                    now,
                ],
            )
            .map_err(|e| StoreError::sqlite("create_flow_instance: flow", e))?;

        let created = inserted > 0;
        if created {
            for job in &new.jobs {
                tx.execute(
                    "INSERT INTO job_instances \
                     (flow_instance_id, model_index, model_name, input_ports, output_ports, \
                      priority, gpu, status, retries, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
                    params![
                        new.id,
                        i64::try_from(job.model_index).map_err(|_| {
                            StoreError::CorruptRow(format!(
                                "model index {} too large",
                                job.model_index
                            ))
                        })?,
                        job.model_name,
                        serde_json::to_string(&job.input_ports)?,
                        serde_json::to_string(&job.output_ports)?,
                        job.priority,
                        job.gpu,
                        JobStatus::Pending.as_str(),
                        now,
                    ],
                )
                .map_err(|e| StoreError::sqlite("create_flow_instance: job", e))?;
            }

            tx.execute(
                "INSERT OR IGNORE INTO mount_mappings (flow_instance_id, port, blob_uid, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![new.id, SOURCE_PORT, new.src_uid, now],
            )
            .map_err(|e| StoreError::sqlite("create_flow_instance: src mapping", e))?;
        }

        let instance = Self::query_flow(&tx, &new.id)?.ok_or_else(|| {
            StoreError::CorruptRow(format!("flow instance '{}' vanished during insert", new.id))
        })?;

        tx.commit()
            .map_err(|e| StoreError::sqlite("create_flow_instance: commit", e))?;

        if created {
            info!(flow_instance = %new.id, jobs = new.jobs.len(), "flow instance created");
        }
        Ok((instance, created))
    }

    fn insert_mount_mapping(
        &self,
        flow_instance_id: &str,
        port: &str,
        blob_uid: &str,
    ) -> StoreResult<MountMapping> {
        let conn = self.lock_conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO mount_mappings (flow_instance_id, port, blob_uid, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![flow_instance_id, port, blob_uid, Self::now()],
            )
            .map_err(|e| StoreError::sqlite("insert_mount_mapping", e))?;

        let stored: String = conn
            .query_row(
                "SELECT blob_uid FROM mount_mappings WHERE flow_instance_id = ?1 AND port = ?2",
                params![flow_instance_id, port],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::sqlite("insert_mount_mapping: read back", e))?;

        if inserted == 0 {
            debug!(
                flow_instance = flow_instance_id,
                port,
                existing = %stored,
                ignored = blob_uid,
                "port already bound"
            );
        }

        Ok(MountMapping {
            flow_instance_id: flow_instance_id.to_string(),
            port: port.to_string(),
            blob_uid: stored,
        })
    }

    fn insert_dispatch_guard(
        &self,
        flow_instance_id: &str,
        model_index: usize,
    ) -> StoreResult<bool> {
        let conn = self.lock_conn()?;
        Self::insert_guard(&conn, flow_instance_id, model_index)
    }

    fn update_job_status(
        &self,
        job_id: i64,
        expected: JobStatus,
        target: JobStatus,
    ) -> StoreResult<bool> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE job_instances SET status = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![target.as_str(), Self::now(), job_id, expected.as_str()],
            )
            .map_err(|e| StoreError::sqlite("update_job_status", e))?;
        Ok(changed > 0)
    }

    fn mark_job_dispatched(&self, job_id: i64) -> StoreResult<bool> {
        let conn = self.lock_conn()?;
        Self::set_dispatched(&conn, job_id)
    }

    fn claim_job(&self, job: &JobInstance) -> StoreResult<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::sqlite("claim_job: begin", e))?;

        // Dropping the transaction rolls back the guard
        if !Self::insert_guard(&tx, &job.flow_instance_id, job.model_index)? {
            return Ok(false);
        }
        if !Self::set_dispatched(&tx, job.id)? {
            debug!(job_id = job.id, "claim released, job is no longer pending");
            return Ok(false);
        }

        tx.commit()
            .map_err(|e| StoreError::sqlite("claim_job: commit", e))?;
        Ok(true)
    }

    fn update_flow_status(
        &self,
        flow_instance_id: &str,
        expected: FlowStatus,
        target: FlowStatus,
    ) -> StoreResult<bool> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE flow_instances SET status = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![target.as_str(), Self::now(), flow_instance_id, expected.as_str()],
            )
            .map_err(|e| StoreError::sqlite("update_flow_status", e))?;
        Ok(changed > 0)
    }

    fn finish_flow(&self, flow_instance_id: &str) -> StoreResult<bool> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE flow_instances SET status = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4 \
                 AND EXISTS (SELECT 1 FROM mount_mappings m \
                             WHERE m.flow_instance_id = ?3 AND m.port = ?5)",
                params![
                    FlowStatus::FinishedSuccess.as_str(),
                    Self::now(),
                    flow_instance_id,
                    FlowStatus::Pending.as_str(),
                    DESTINATION_PORT,
                ],
            )
            .map_err(|e| StoreError::sqlite("finish_flow", e))?;
        Ok(changed > 0)
    }

    fn get_runnable_candidates(&self) -> StoreResult<Vec<JobInstance>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM job_instances j \
             JOIN flow_instances f ON f.id = j.flow_instance_id \
             WHERE j.status = ?1 AND f.status = ?2 \
             ORDER BY j.priority, j.id",
            JOB_COLUMNS
        );
        Self::query_jobs(
            &conn,
            "get_runnable_candidates",
            &sql,
            params![JobStatus::Pending.as_str(), FlowStatus::Pending.as_str()],
        )
    }

    fn get_flow_by_id(&self, flow_instance_id: &str) -> StoreResult<Option<FlowInstance>> {
        let conn = self.lock_conn()?;
        Self::query_flow(&conn, flow_instance_id)
    }

    fn get_job_by_id(&self, job_id: i64) -> StoreResult<Option<JobInstance>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM job_instances j WHERE j.id = ?1", JOB_COLUMNS);
        Ok(Self::query_jobs(&conn, "get_job_by_id", &sql, [job_id])?
            .into_iter()
            .next())
    }

    fn non_terminal_flows(&self) -> StoreResult<Vec<FlowInstance>> {
        let conn = self.lock_conn()?;
        Self::query_flows(
            &conn,
            "non_terminal_flows",
            "WHERE f.status = 'PENDING' ORDER BY f.created_at, f.id",
        )
    }

    fn mount_mapping(&self, flow_instance_id: &str) -> StoreResult<BTreeMap<String, String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT port, blob_uid FROM mount_mappings WHERE flow_instance_id = ?1")
            .map_err(|e| StoreError::sqlite("mount_mapping", e))?;
        let rows = stmt
            .query_map([flow_instance_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::sqlite("mount_mapping", e))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()
            .map_err(|e| StoreError::sqlite("mount_mapping", e))?;
        Ok(rows)
    }

    fn list_flows(&self) -> StoreResult<Vec<FlowInstance>> {
        let conn = self.lock_conn()?;
        Self::query_flows(&conn, "list_flows", "ORDER BY f.created_at DESC, f.id")
    }

    fn jobs_for_flow(&self, flow_instance_id: &str) -> StoreResult<Vec<JobInstance>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM job_instances j WHERE j.flow_instance_id = ?1 ORDER BY j.model_index",
            JOB_COLUMNS
        );
        Self::query_jobs(&conn, "jobs_for_flow", &sql, [flow_instance_id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::models::{Flow, Model, CURRENT_SCHEMA};
    use crate::store::NewJobInstance;

    fn model(name: &str, input: &str, output: &str) -> Model {
        Model {
            name: name.to_string(),
            input_ports: [("in".to_string(), input.to_string())].into_iter().collect(),
            output_ports: [("out".to_string(), output.to_string())].into_iter().collect(),
            static_ports: BTreeMap::new(),
            execution: serde_json::Value::Null,
            gpu: false,
        }
    }

    fn new_instance(id: &str) -> NewFlowInstance {
        let flow = Flow {
            schema: CURRENT_SCHEMA,
            name: "two-step".to_string(),
            version: "1".to_string(),
            priority: 2,
            models: vec![model("m1", "src", "A"), model("m2", "A", "dst")],
            triggers: serde_json::Value::Null,
            destinations: Vec::new(),
        };
        NewFlowInstance {
            id: id.to_string(),
            src_uid: "blob-src".to_string(),
            sender: Some("modality-1".to_string()),
            arrival_priority: Some(2),
            jobs: vec![
                NewJobInstance {
                    model_index: 0,
                    model_name: "m1".to_string(),
                    input_ports: vec!["src".to_string()],
                    output_ports: vec!["A".to_string()],
                    priority: 2,
                    gpu: false,
                },
                NewJobInstance {
                    model_index: 1,
                    model_name: "m2".to_string(),
                    input_ports: vec!["A".to_string()],
                    output_ports: vec!["dst".to_string()],
                    priority: 5,
                    gpu: true,
                },
            ],
            flow,
        }
    }

    #[test]
    fn create_flow_instance_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let new = new_instance("flow-1");

        let (first, created) = store.create_flow_instance(&new).unwrap();
        assert!(created);
        assert_eq!(first.status, FlowStatus::Pending);
        assert_eq!(first.flow.models.len(), 2);

        let (second, created_again) = store.create_flow_instance(&new).unwrap();
        assert!(!created_again);
        assert_eq!(second.id, first.id);

        let jobs = store.jobs_for_flow("flow-1").unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].priority, 5);
        assert!(jobs[1].gpu);
        assert_eq!(jobs[1].input_ports, vec!["A".to_string()]);
    }

    #[test]
    fn create_seeds_source_mapping() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();

        let mapping = store.mount_mapping("flow-1").unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get("src"), Some(&"blob-src".to_string()));
    }

    #[test]
    fn mount_mapping_insert_or_ignore_returns_existing() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();

        let first = store.insert_mount_mapping("flow-1", "A", "blob-a1").unwrap();
        let second = store.insert_mount_mapping("flow-1", "A", "blob-a2").unwrap();

        assert_eq!(first.blob_uid, "blob-a1");
        assert_eq!(second.blob_uid, "blob-a1");
        assert_eq!(store.mount_mapping("flow-1").unwrap().len(), 2);
    }

    #[test]
    fn dispatch_guard_claims_once() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();

        assert!(store.insert_dispatch_guard("flow-1", 0).unwrap());
        assert!(!store.insert_dispatch_guard("flow-1", 0).unwrap());
        assert!(store.insert_dispatch_guard("flow-1", 1).unwrap());
    }

    #[test]
    fn dispatch_guard_for_unknown_flow_is_an_error() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.insert_dispatch_guard("missing", 0).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite { .. }));
    }

    #[test]
    fn claim_job_guards_and_marks_together() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();
        let job = store.jobs_for_flow("flow-1").unwrap().remove(0);

        assert!(store.claim_job(&job).unwrap());
        let stored = store.get_job_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dispatched);
        assert_eq!(stored.retries, 1);

        assert!(!store.claim_job(&job).unwrap());
        assert!(!store.insert_dispatch_guard("flow-1", job.model_index).unwrap());
        assert_eq!(store.get_job_by_id(job.id).unwrap().unwrap().retries, 1);
    }

    #[test]
    fn claim_job_rolls_back_guard_for_non_pending_job() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();
        let job = store.jobs_for_flow("flow-1").unwrap().remove(0);
        assert!(store.mark_job_dispatched(job.id).unwrap());

        assert!(!store.claim_job(&job).unwrap());
        // The guard insert was undone with the transaction
        assert!(store.insert_dispatch_guard("flow-1", job.model_index).unwrap());
    }

    #[test]
    fn job_status_is_compare_and_set() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();
        let job = &store.jobs_for_flow("flow-1").unwrap()[0];

        assert!(store.mark_job_dispatched(job.id).unwrap());
        assert!(!store.mark_job_dispatched(job.id).unwrap());
        assert!(store
            .update_job_status(job.id, JobStatus::Dispatched, JobStatus::Success)
            .unwrap());
        assert!(!store
            .update_job_status(job.id, JobStatus::Dispatched, JobStatus::Fail)
            .unwrap());

        let stored = store.get_job_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.retries, 1);
    }

    #[test]
    fn finish_flow_requires_destination() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();

        assert!(!store.finish_flow("flow-1").unwrap());

        store.insert_mount_mapping("flow-1", "dst", "blob-out").unwrap();
        assert!(store.finish_flow("flow-1").unwrap());
        assert!(!store.finish_flow("flow-1").unwrap());

        let flow = store.get_flow_by_id("flow-1").unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::FinishedSuccess);
        assert!(store.non_terminal_flows().unwrap().is_empty());
    }

    #[test]
    fn update_flow_status_compare_and_set() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();

        assert!(store
            .update_flow_status("flow-1", FlowStatus::Pending, FlowStatus::FinishedSuccess)
            .unwrap());
        assert!(!store
            .update_flow_status("flow-1", FlowStatus::Pending, FlowStatus::FinishedSuccess)
            .unwrap());
    }

    #[test]
    fn runnable_candidates_skip_finished_flows_and_order_by_priority() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_flow_instance(&new_instance("flow-1")).unwrap();
        store.create_flow_instance(&new_instance("flow-2")).unwrap();

        let candidates = store.get_runnable_candidates().unwrap();
        assert_eq!(candidates.len(), 4);
        assert!(candidates[0].priority <= candidates[3].priority);

        store.insert_mount_mapping("flow-2", "dst", "blob").unwrap();
        store.finish_flow("flow-2").unwrap();

        let candidates = store.get_runnable_candidates().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|j| j.flow_instance_id == "flow-1"));
    }

    #[test]
    fn unknown_ids_return_none() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get_flow_by_id("missing").unwrap().is_none());
        assert!(store.get_job_by_id(42).unwrap().is_none());
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scheduler.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_flow_instance(&new_instance("flow-1")).unwrap();
            assert!(store.insert_dispatch_guard("flow-1", 0).unwrap());
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.get_flow_by_id("flow-1").unwrap().is_some());
        assert!(!reopened.insert_dispatch_guard("flow-1", 0).unwrap());
        assert_eq!(reopened.list_flows().unwrap().len(), 1);
    }
}
