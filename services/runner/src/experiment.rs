//! Experiment directories and the process-wide key/value store.
//!
//! Runs write their artifacts under
//! `<user-data>/microflow/Experiments/Exp_<YYYY_MM_DD_HH_MM_SS>/`. The
//! current experiment's directory name lives in a process-wide key/value
//! map under `experiment_directory`, so every component addresses the same
//! run without threading paths around.

use chrono::Local;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tracing::info;

pub const EXPERIMENT_DIRECTORY_KEY: &str = "experiment_directory";

static GLOBALS: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();

fn globals() -> &'static Mutex<HashMap<String, String>> {
    GLOBALS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Read a process-wide value.
pub fn get_global(key: &str) -> Option<String> {
    globals().lock().expect("globals lock").get(key).cloned()
}

/// Write a process-wide value.
pub fn set_global(key: &str, value: impl Into<String>) {
    globals()
        .lock()
        .expect("globals lock")
        .insert(key.to_owned(), value.into());
}

/// Process-wide override for the experiments root (used by embedding hosts
/// and test rigs).
pub const EXPERIMENTS_ROOT_KEY: &str = "experiments_root";

/// Root directory holding all experiments.
pub fn experiments_root() -> PathBuf {
    if let Some(root) = get_global(EXPERIMENTS_ROOT_KEY) {
        return PathBuf::from(root);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("microflow")
        .join("Experiments")
}

/// Directory name for a fresh experiment started now.
pub fn new_experiment_name() -> String {
    format!("Exp_{}", Local::now().format("%Y_%m_%d_%H_%M_%S"))
}

/// The current experiment directory, creating (and registering) a fresh one
/// when none is active. The directory exists on return.
pub fn current_experiment_directory() -> std::io::Result<PathBuf> {
    let name = match get_global(EXPERIMENT_DIRECTORY_KEY) {
        Some(name) => name,
        None => {
            let name = new_experiment_name();
            set_global(EXPERIMENT_DIRECTORY_KEY, name.clone());
            info!(experiment = %name, "started new experiment");
            name
        }
    };
    let dir = experiments_root().join(name);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_round_trip() {
        set_global("test_key", "value-1");
        assert_eq!(get_global("test_key"), Some("value-1".to_owned()));
        set_global("test_key", "value-2");
        assert_eq!(get_global("test_key"), Some("value-2".to_owned()));
        assert_eq!(get_global("missing"), None);
    }

    #[test]
    fn experiment_names_follow_the_layout() {
        let name = new_experiment_name();
        assert!(name.starts_with("Exp_"));
        // Exp_YYYY_MM_DD_HH_MM_SS
        assert_eq!(name.matches('_').count(), 6);
    }
}
