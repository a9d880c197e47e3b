// Scheduler Configuration
// YAML config with per-field defaults; CLI flags override individual fields

use crate::broker::Topology;
use crate::error::{ServiceError, ServiceResult};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Priority given to every non-root job
pub const DEFAULT_RESCHEDULE_PRIORITY: u8 = 5;

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Database file (default: ~/.studyflow/scheduler.db)
    pub database_path: PathBuf,

    /// Dispatch priority for jobs that wait on another model's output
    pub reschedule_priority: u8,

    /// Broker names
    pub topology: Topology,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            reschedule_priority: DEFAULT_RESCHEDULE_PRIORITY,
            topology: Topology::default(),
        }
    }
}

/// `~/.studyflow/scheduler.db`, or relative to the working directory when
/// there is no home directory
pub fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".studyflow")
        .join("scheduler.db")
}

impl SchedulerConfig {
    /// Parse and validate a YAML config document
    pub fn from_yaml(source: &str) -> ServiceResult<Self> {
        let config: SchedulerConfig = serde_yaml::from_str(source)
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&source)
    }

    pub fn validate(&self) -> ServiceResult<()> {
        self.topology.validate().map_err(ServiceError::Config)?;

        if self.reschedule_priority > self.topology.max_priority {
            return Err(ServiceError::Config(format!(
                "reschedule_priority {} exceeds topology.max_priority {}",
                self.reschedule_priority, self.topology.max_priority
            )));
        }

        Ok(())
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }
}
