//! Typed interface over ZFS: dataset names, filesystem versions, and the
//! operations the daemon needs (`list`, `list -t snapshot`, `snapshot`).
//!
//! The [`ZfsBackend`] trait is the seam between the snapshotter and the host:
//! [`ZfsCli`] drives the real `zfs` binary, [`StaticZfs`] is an in-memory
//! backend for tests.

pub mod path;
pub mod version;

pub use path::DatasetPath;
pub use version::{FilesystemVersion, VersionKind};

use crate::clock::{Clock, SystemClock};
use crate::error::ZfsError;
use crate::filters::{DatasetMapFilter, PrefixVersionFilter};
use crate::zfs::path::validate_entity_name;
use crate::zfs::version::parse_version_spec;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::process::Command;

/// ZFS operations consumed by the snapshotter.
pub trait ZfsBackend: Send + Sync {
    /// All filesystems on the host accepted by `filter`. Ordering is
    /// unspecified.
    fn list_mapping(
        &self,
        filter: &DatasetMapFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DatasetPath>, ZfsError>> + Send + '_>>;

    /// All versions of `dataset` accepted by `filter`.
    fn list_versions(
        &self,
        dataset: &DatasetPath,
        filter: &PrefixVersionFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FilesystemVersion>, ZfsError>> + Send + '_>>;

    /// Creates `dataset@name` atomically at the ZFS level.
    fn snapshot(
        &self,
        dataset: &DatasetPath,
        name: &str,
        recursive: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), ZfsError>> + Send + '_>>;
}

// ── CLI backend ────────────────────────────────────────────────

/// Backend that shells out to the `zfs` binary.
pub struct ZfsCli {
    zfs_binary: String,
}

impl ZfsCli {
    pub fn new() -> Self {
        Self {
            zfs_binary: std::env::var("ZFS_BINARY").unwrap_or_else(|_| "zfs".into()),
        }
    }

    async fn run_zfs(&self, verb: &'static str, args: &[&str]) -> Result<String, ZfsError> {
        let output = Command::new(&self.zfs_binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ZfsError::Spawn {
                binary: self.zfs_binary.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ZfsError::CommandFailed {
                verb,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsBackend for ZfsCli {
    fn list_mapping(
        &self,
        filter: &DatasetMapFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DatasetPath>, ZfsError>> + Send + '_>> {
        let filter = filter.clone();
        Box::pin(async move {
            let out = self
                .run_zfs(
                    "list",
                    &["list", "-H", "-p", "-o", "name", "-t", "filesystem,volume"],
                )
                .await?;
            parse_filesystem_list(&out, &filter)
        })
    }

    fn list_versions(
        &self,
        dataset: &DatasetPath,
        filter: &PrefixVersionFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FilesystemVersion>, ZfsError>> + Send + '_>> {
        let dataset = dataset.to_string();
        let filter = filter.clone();
        Box::pin(async move {
            let out = self
                .run_zfs(
                    "list",
                    &[
                        "list",
                        "-H",
                        "-p",
                        "-o",
                        "name,guid,createtxg,creation",
                        "-r",
                        "-d",
                        "1",
                        "-t",
                        "snapshot,bookmark",
                        &dataset,
                    ],
                )
                .await?;
            parse_version_list(&out, &filter)
        })
    }

    fn snapshot(
        &self,
        dataset: &DatasetPath,
        name: &str,
        recursive: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), ZfsError>> + Send + '_>> {
        let spec = format!("{}@{}", dataset, name);
        let name = name.to_string();
        Box::pin(async move {
            validate_entity_name(&name).map_err(|source| ZfsError::InvalidSnapshotName {
                name: name.clone(),
                source,
            })?;
            let mut args = vec!["snapshot"];
            if recursive {
                args.push("-r");
            }
            args.push(&spec);
            self.run_zfs("snapshot", &args).await?;
            Ok(())
        })
    }
}

fn parse_filesystem_list(
    out: &str,
    filter: &DatasetMapFilter,
) -> Result<Vec<DatasetPath>, ZfsError> {
    let mut fss = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let path = DatasetPath::from_str(line).map_err(|_| ZfsError::Parse {
            line: line.to_string(),
            reason: "invalid dataset name",
        })?;
        if filter.accepts(&path) {
            fss.push(path);
        }
    }
    Ok(fss)
}

fn parse_version_list(
    out: &str,
    filter: &PrefixVersionFilter,
) -> Result<Vec<FilesystemVersion>, ZfsError> {
    let mut versions = Vec::new();
    for line in out.lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let &[spec, guid, create_txg, creation] = fields.as_slice() else {
            return Err(ZfsError::Parse {
                line: line.to_string(),
                reason: "expected 4 tab-separated fields",
            });
        };
        let (_, kind, name) = parse_version_spec(spec)?;
        if !filter.accepts(kind, &name) {
            continue;
        }
        let guid = guid.parse::<u64>().map_err(|_| ZfsError::Parse {
            line: line.to_string(),
            reason: "invalid guid",
        })?;
        let create_txg = create_txg.parse::<u64>().map_err(|_| ZfsError::Parse {
            line: line.to_string(),
            reason: "invalid createtxg",
        })?;
        let creation = creation
            .parse::<i64>()
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| ZfsError::Parse {
                line: line.to_string(),
                reason: "invalid creation timestamp",
            })?;
        versions.push(FilesystemVersion {
            kind,
            name,
            guid,
            create_txg,
            creation,
        });
    }
    Ok(versions)
}

// ── In-memory backend ──────────────────────────────────────────

/// In-memory [`ZfsBackend`] with failure injection, for tests and dry runs.
///
/// Snapshots taken through it are recorded and appended to the dataset's
/// version history with monotonic txg/guid values and `clock`-stamped
/// creation times.
pub struct StaticZfs {
    clock: Arc<dyn Clock>,
    inner: Mutex<StaticState>,
}

#[derive(Default)]
struct StaticState {
    filesystems: Vec<DatasetPath>,
    versions: HashMap<DatasetPath, Vec<FilesystemVersion>>,
    created: Vec<(DatasetPath, String)>,
    fail_snapshot: HashSet<DatasetPath>,
    fail_versions: HashSet<DatasetPath>,
    fail_listing: bool,
    next_txg: u64,
}

impl StaticZfs {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(StaticState {
                next_txg: 1,
                ..StaticState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.inner.lock().expect("static zfs state lock poisoned")
    }

    pub fn add_filesystem(&self, fs: DatasetPath) {
        self.lock().filesystems.push(fs);
    }

    pub fn add_version(&self, fs: &DatasetPath, version: FilesystemVersion) {
        self.lock()
            .versions
            .entry(fs.clone())
            .or_default()
            .push(version);
    }

    /// All `(dataset, name)` pairs created through [`ZfsBackend::snapshot`].
    pub fn created(&self) -> Vec<(DatasetPath, String)> {
        self.lock().created.clone()
    }

    pub fn fail_snapshots_for(&self, fs: DatasetPath) {
        self.lock().fail_snapshot.insert(fs);
    }

    pub fn fail_versions_for(&self, fs: DatasetPath) {
        self.lock().fail_versions.insert(fs);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    fn injected_failure(verb: &'static str) -> ZfsError {
        use std::os::unix::process::ExitStatusExt;
        ZfsError::CommandFailed {
            verb,
            status: std::process::ExitStatus::from_raw(1 << 8),
            stderr: "injected failure".to_string(),
        }
    }
}

impl Default for StaticZfs {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsBackend for StaticZfs {
    fn list_mapping(
        &self,
        filter: &DatasetMapFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DatasetPath>, ZfsError>> + Send + '_>> {
        let result = {
            let state = self.lock();
            if state.fail_listing {
                Err(Self::injected_failure("list"))
            } else {
                Ok(state
                    .filesystems
                    .iter()
                    .filter(|fs| filter.accepts(fs))
                    .cloned()
                    .collect())
            }
        };
        Box::pin(async move { result })
    }

    fn list_versions(
        &self,
        dataset: &DatasetPath,
        filter: &PrefixVersionFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FilesystemVersion>, ZfsError>> + Send + '_>> {
        let result = {
            let state = self.lock();
            if state.fail_versions.contains(dataset) {
                Err(Self::injected_failure("list"))
            } else {
                Ok(state
                    .versions
                    .get(dataset)
                    .map(|vs| {
                        vs.iter()
                            .filter(|v| filter.accepts(v.kind, &v.name))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            }
        };
        Box::pin(async move { result })
    }

    fn snapshot(
        &self,
        dataset: &DatasetPath,
        name: &str,
        _recursive: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), ZfsError>> + Send + '_>> {
        let result = (|| {
            validate_entity_name(name).map_err(|source| ZfsError::InvalidSnapshotName {
                name: name.to_string(),
                source,
            })?;
            let now = self.clock.now();
            let mut state = self.lock();
            if state.fail_snapshot.contains(dataset) {
                return Err(Self::injected_failure("snapshot"));
            }
            let txg = state.next_txg;
            state.next_txg += 1;
            state.created.push((dataset.clone(), name.to_string()));
            state
                .versions
                .entry(dataset.clone())
                .or_default()
                .push(FilesystemVersion {
                    kind: VersionKind::Snapshot,
                    name: name.to_string(),
                    guid: 0xfeed_0000 + txg,
                    create_txg: txg,
                    creation: now,
                });
            Ok(())
        })();
        Box::pin(async move { result })
    }
}
