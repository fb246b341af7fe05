use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-level configuration, taken from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// JSON file declaring the snapshot jobs.
    pub jobs_file: PathBuf,
    /// Directory relative hook commands resolve against. Defaults to the
    /// directory containing the jobs file.
    pub hook_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8300),
            jobs_file: std::env::var("JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./jobs.json")),
            hook_dir: std::env::var("HOOK_DIR").map(PathBuf::from).ok(),
        }
    }

    pub fn hook_dir(&self) -> PathBuf {
        self.hook_dir.clone().unwrap_or_else(|| {
            self.jobs_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8300,
            jobs_file: PathBuf::from("./jobs.json"),
            hook_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JobsFile {
    jobs: Vec<JobConfig>,
}

/// One snapshot job: a named filesystem selection plus its snapshotting
/// policy.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Pattern → accept map, `<`-suffixed patterns covering subtrees.
    pub filesystems: BTreeMap<String, bool>,
    pub snapshotting: SnapshottingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshottingConfig {
    /// Mandatory, non-empty; used both in new snapshot names and to select
    /// existing snapshots when aligning to history.
    pub prefix: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub hooks: HookSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HookSettings {
    pub pre: Option<String>,
    pub post: Option<String>,
    #[serde(default = "default_hook_timeout_ms")]
    pub timeout_ms: u64,
    /// If true, a failing pre-hook does not suppress the snapshot.
    #[serde(default)]
    pub keep_on_error: bool,
}

impl HookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_hook_timeout_ms() -> u64 {
    30_000
}

/// Loads and validates the jobs file. Any invalid job fails the whole load;
/// the daemon does not start with a partially valid configuration.
pub fn load_jobs(path: &Path) -> Result<Vec<JobConfig>, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: JobsFile = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = BTreeSet::new();
    for job in &parsed.jobs {
        if !seen.insert(job.name.clone()) {
            return Err(ConfigError::DuplicateJob(job.name.clone()));
        }
        validate_snapshotting(&job.snapshotting)?;
    }
    Ok(parsed.jobs)
}

pub fn validate_snapshotting(config: &SnapshottingConfig) -> Result<(), ConfigError> {
    if config.prefix.is_empty() {
        return Err(ConfigError::EmptyPrefix);
    }
    if crate::zfs::path::validate_entity_name(&config.prefix).is_err() {
        return Err(ConfigError::InvalidPrefix {
            prefix: config.prefix.clone(),
        });
    }
    if config.interval_secs == 0 {
        return Err(ConfigError::NonPositiveInterval);
    }
    Ok(())
}
