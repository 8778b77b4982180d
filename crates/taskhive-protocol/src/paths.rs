use std::path::{Path, PathBuf};

pub const STATE_DIR_ENV: &str = "TASKHIVE_STATE_DIR";

/// Returns the state directory: `$TASKHIVE_STATE_DIR`, else `.agent-state`
/// relative to the working directory.
pub fn default_state_dir() -> PathBuf {
    match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(".agent-state"),
    }
}

/// Canonical backlog document.
pub fn tasks_path(state_dir: &Path) -> PathBuf {
    state_dir.join("tasks.json")
}

/// Marker announcing a running coordinator and its port.
pub fn marker_path(state_dir: &Path) -> PathBuf {
    state_dir.join(".parallel-mode")
}

pub fn pid_path(state_dir: &Path) -> PathBuf {
    state_dir.join("coordinator.pid")
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join("coordinator.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_state_dir() {
        let dir = Path::new("/tmp/hive");
        assert_eq!(tasks_path(dir), PathBuf::from("/tmp/hive/tasks.json"));
        assert_eq!(marker_path(dir), PathBuf::from("/tmp/hive/.parallel-mode"));
        assert_eq!(pid_path(dir), PathBuf::from("/tmp/hive/coordinator.pid"));
        assert_eq!(config_path(dir), PathBuf::from("/tmp/hive/coordinator.toml"));
    }
}
