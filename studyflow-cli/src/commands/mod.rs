pub mod process;
pub mod status;
pub mod validate;

use std::path::{Path, PathBuf};

use color_eyre::Result;

use flow_service::SchedulerConfig;

/// Load the config file if given, then apply `--db`
pub fn resolve_config(config: Option<&Path>, db: Option<PathBuf>) -> Result<SchedulerConfig> {
    let config = match config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };

    let config = match db {
        Some(path) => config.with_database_path(path),
        None => config,
    };
    tracing::debug!(db = %config.database_path.display(), "scheduler config resolved");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_flag_overrides_default_path() {
        let config = resolve_config(None, Some(PathBuf::from("/tmp/flows.db"))).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/flows.db"));
        assert_eq!(config.reschedule_priority, 5);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(resolve_config(Some(Path::new("/nonexistent/studyflow.yaml")), None).is_err());
    }
}
