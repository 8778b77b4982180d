use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use serde::Deserialize;

use libtaskhive::CoordinatorConfig;
use taskhive_protocol::{DEFAULT_PORT, MAX_BODY_BYTES, paths};

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port; the marker file records the real one.
    pub port: u16,
    pub state_dir: PathBuf,
    pub stale_threshold_secs: u64,
    pub reap_interval_secs: u64,
    pub flush_interval_secs: u64,
    pub max_body_bytes: usize,
    pub read_timeout_secs: u64,
    pub subscriber_queue: usize,
    pub shutdown_grace_secs: u64,
    pub auto_shutdown: bool,
    pub exit_on_complete: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            state_dir: paths::default_state_dir(),
            stale_threshold_secs: 600,
            reap_interval_secs: 60,
            flush_interval_secs: 30,
            max_body_bytes: MAX_BODY_BYTES,
            read_timeout_secs: 30,
            subscriber_queue: 100,
            shutdown_grace_secs: 5,
            auto_shutdown: true,
            exit_on_complete: false,
        }
    }
}

impl ServerConfig {
    /// Load from `config_path`, else `<state_dir>/coordinator.toml` when it
    /// exists, else defaults. An explicit `state_dir` wins over the file.
    pub fn load(config_path: Option<&Path>, state_dir: Option<&Path>) -> Result<Self> {
        let base_dir = state_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(paths::default_state_dir);

        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => {
                let implicit = paths::config_path(&base_dir);
                if implicit.exists() {
                    Self::from_file(&implicit)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(dir) = state_dir {
            config.state_dir = dir.to_path_buf();
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let secs = i64::try_from(self.stale_threshold_secs)
            .context("stale_threshold_secs out of range")?;
        let Some(stale_threshold) = TimeDelta::try_seconds(secs) else {
            bail!("stale_threshold_secs out of range: {secs}");
        };
        Ok(CoordinatorConfig {
            stale_threshold,
            auto_shutdown: self.auto_shutdown,
            subscriber_queue: self.subscriber_queue,
        })
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
