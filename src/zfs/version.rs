use crate::error::ZfsError;
use crate::zfs::path::DatasetPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two kinds of ZFS filesystem versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    Snapshot,
    Bookmark,
}

impl VersionKind {
    /// The character separating dataset and version name in the absolute form.
    pub fn delimiter(self) -> char {
        match self {
            Self::Snapshot => '@',
            Self::Bookmark => '#',
        }
    }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => f.write_str("snapshot"),
            Self::Bookmark => f.write_str("bookmark"),
        }
    }
}

/// One snapshot or bookmark of a filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemVersion {
    pub kind: VersionKind,

    /// Display name; identification goes through `guid`.
    pub name: String,

    /// Globally unique identifier assigned by ZFS.
    pub guid: u64,

    /// Transaction group of creation. Monotonic within a pool; the primary
    /// chronological sort key.
    pub create_txg: u64,

    pub creation: DateTime<Utc>,
}

impl FilesystemVersion {
    /// `dataset@name` / `dataset#name`.
    pub fn to_abs_path(&self, dataset: &DatasetPath) -> String {
        format!("{}{}{}", dataset, self.kind.delimiter(), self.name)
    }
}

impl fmt::Display for FilesystemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.delimiter(), self.name)
    }
}

/// Splits an absolute version spec (`tank/a@snap` or `tank/a#bm`) into
/// dataset, kind, and version name. A spec containing both delimiters (or
/// neither) is rejected.
pub fn parse_version_spec(spec: &str) -> Result<(DatasetPath, VersionKind, String), ZfsError> {
    let at = spec.find('@');
    let hash = spec.find('#');
    let (idx, kind) = match (at, hash) {
        (Some(i), None) => (i, VersionKind::Snapshot),
        (None, Some(i)) => (i, VersionKind::Bookmark),
        _ => {
            return Err(ZfsError::Parse {
                line: spec.to_string(),
                reason: "expected exactly one of '@' or '#'",
            })
        }
    };
    let (ds, name) = (&spec[..idx], &spec[idx + 1..]);
    if ds.is_empty() || name.is_empty() {
        return Err(ZfsError::Parse {
            line: spec.to_string(),
            reason: "empty dataset or version name",
        });
    }
    let dataset = DatasetPath::from_str(ds).map_err(|_| ZfsError::Parse {
        line: spec.to_string(),
        reason: "invalid dataset name",
    })?;
    Ok((dataset, kind, name.to_string()))
}
