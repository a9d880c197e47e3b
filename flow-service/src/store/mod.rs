//! Durable scheduler state.
//!
//! [`Store`] is the storage contract for flow instances, job instances,
//! mount mappings and dispatch guards. [`SqliteStore`] is the file-backed
//! implementation; several scheduler processes may share one database file.
//!
//! Uniqueness conflicts on mount mappings and dispatch guards are reported
//! as ordinary return values, never as errors. Every other failure is a
//! [`StoreError`] and should propagate so the inbound message is redelivered.

pub mod error;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::flow::Flow;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;

/// Lifecycle of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Pending,
    FinishedSuccess,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Pending => "PENDING",
            FlowStatus::FinishedSuccess => "FINISHED_SUCCESS",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::FinishedSuccess)
    }
}

impl FromStr for FlowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FlowStatus::Pending),
            "FINISHED_SUCCESS" => Ok(FlowStatus::FinishedSuccess),
            other => Err(StoreError::CorruptRow(format!("unknown flow status '{}'", other))),
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle of a job instance. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Dispatched,
    Success,
    Fail,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Success => "SUCCESS",
            JobStatus::Fail => "FAIL",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Fail)
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "DISPATCHED" => Ok(JobStatus::Dispatched),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAIL" => Ok(JobStatus::Fail),
            other => Err(StoreError::CorruptRow(format!("unknown job status '{}'", other))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One execution of a flow for one arriving study
#[derive(Debug, Clone, Serialize)]
pub struct FlowInstance {
    pub id: String,
    pub flow: Flow,
    pub src_uid: String,
    pub sender: Option<String>,
    /// Priority carried by the flow-arrived message, kept for diagnostics
    pub arrival_priority: Option<u8>,
    pub status: FlowStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// One execution attempt of one model within a flow instance
#[derive(Debug, Clone, Serialize)]
pub struct JobInstance {
    /// Row id, used as the correlation id on the wire
    pub id: i64,
    pub flow_instance_id: String,
    pub model_index: usize,
    pub model_name: String,
    /// Logical ports that must be bound before dispatch
    pub input_ports: Vec<String>,
    /// Logical ports this job binds on success
    pub output_ports: Vec<String>,
    pub priority: u8,
    pub gpu: bool,
    pub status: JobStatus,
    pub retries: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// A bound port: (flow instance, port) -> blob uid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountMapping {
    pub flow_instance_id: String,
    pub port: String,
    pub blob_uid: String,
}

/// Job row to create alongside a new flow instance
#[derive(Debug, Clone)]
pub struct NewJobInstance {
    pub model_index: usize,
    pub model_name: String,
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
    pub priority: u8,
    pub gpu: bool,
}

/// Everything `create_flow_instance` writes in one transaction
#[derive(Debug, Clone)]
pub struct NewFlowInstance {
    pub id: String,
    pub flow: Flow,
    pub src_uid: String,
    pub sender: Option<String>,
    pub arrival_priority: Option<u8>,
    pub jobs: Vec<NewJobInstance>,
}

/// Storage contract for scheduler state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Store>`.
pub trait Store: Send + Sync {
    /// Insert a flow instance, one job per model, and the `src` mapping,
    /// atomically.
    ///
    /// Returns the stored instance and whether this call created it. An
    /// existing id is left untouched.
    fn create_flow_instance(&self, new: &NewFlowInstance) -> StoreResult<(FlowInstance, bool)>;

    /// Bind a port, ignoring the write if the port is already bound.
    ///
    /// Returns the row that is stored after the call, which is the existing
    /// row on conflict.
    fn insert_mount_mapping(
        &self,
        flow_instance_id: &str,
        port: &str,
        blob_uid: &str,
    ) -> StoreResult<MountMapping>;

    /// Claim a model index for dispatch. Returns `false` when already claimed.
    fn insert_dispatch_guard(&self, flow_instance_id: &str, model_index: usize)
        -> StoreResult<bool>;

    /// Compare-and-set a job's status. Returns `true` if the row changed.
    fn update_job_status(
        &self,
        job_id: i64,
        expected: JobStatus,
        target: JobStatus,
    ) -> StoreResult<bool>;

    /// PENDING -> DISPATCHED, counting the attempt.
    fn mark_job_dispatched(&self, job_id: i64) -> StoreResult<bool>;

    /// Insert the job's dispatch guard and mark it DISPATCHED, atomically.
    ///
    /// Returns `false` and writes nothing when the guard is already held or
    /// the job is no longer PENDING. On error neither write is kept, so a
    /// retry sees the job unclaimed.
    fn claim_job(&self, job: &JobInstance) -> StoreResult<bool>;

    /// Compare-and-set a flow's status. Returns `true` if the row changed.
    fn update_flow_status(
        &self,
        flow_instance_id: &str,
        expected: FlowStatus,
        target: FlowStatus,
    ) -> StoreResult<bool>;

    /// PENDING -> FINISHED_SUCCESS, only if `dst` is bound. The check and the
    /// transition happen in one statement, so exactly one caller sees `true`.
    fn finish_flow(&self, flow_instance_id: &str) -> StoreResult<bool>;

    /// PENDING jobs belonging to PENDING flows, by priority then id.
    fn get_runnable_candidates(&self) -> StoreResult<Vec<JobInstance>>;

    fn get_flow_by_id(&self, flow_instance_id: &str) -> StoreResult<Option<FlowInstance>>;

    fn get_job_by_id(&self, job_id: i64) -> StoreResult<Option<JobInstance>>;

    fn non_terminal_flows(&self) -> StoreResult<Vec<FlowInstance>>;

    /// All bound ports of a flow instance: port -> blob uid.
    fn mount_mapping(&self, flow_instance_id: &str) -> StoreResult<BTreeMap<String, String>>;

    /// All flow instances, newest first.
    fn list_flows(&self) -> StoreResult<Vec<FlowInstance>>;

    /// Jobs of one flow instance, by model index.
    fn jobs_for_flow(&self, flow_instance_id: &str) -> StoreResult<Vec<JobInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn Store) {}
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Dispatched,
            JobStatus::Success,
            JobStatus::Fail,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            "FINISHED_SUCCESS".parse::<FlowStatus>().unwrap(),
            FlowStatus::FinishedSuccess
        );
        assert!("DONE".parse::<FlowStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Fail.is_terminal());
        assert!(!JobStatus::Dispatched.is_terminal());
        assert!(FlowStatus::FinishedSuccess.is_terminal());
    }

    #[test]
    fn status_serializes_upper_snake() {
        assert_eq!(
            serde_json::to_string(&FlowStatus::FinishedSuccess).unwrap(),
            "\"FINISHED_SUCCESS\""
        );
    }
}
