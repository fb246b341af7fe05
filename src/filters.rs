//! Filters restricting which datasets and which filesystem versions a job
//! looks at.

use crate::error::ConfigError;
use crate::zfs::path::DatasetPath;
use crate::zfs::version::VersionKind;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Suffix marking a pattern as matching the whole subtree under the path.
const SUBTREE_SUFFIX: char = '<';

#[derive(Debug, Clone)]
struct FilterRule {
    path: DatasetPath,
    subtree: bool,
    accept: bool,
}

/// Predicate over dataset paths, built from pattern → accept/reject rules.
///
/// A pattern is a dataset path, optionally suffixed with `<` to cover the
/// subtree rooted at the path (the root itself included); without the suffix
/// only the exact path matches. Among matching rules the most specific one
/// wins: longer paths beat shorter ones, and an exact rule beats a subtree
/// rule at the same path. Datasets no rule matches are rejected.
#[derive(Debug, Clone, Default)]
pub struct DatasetMapFilter {
    rules: Vec<FilterRule>,
}

impl DatasetMapFilter {
    /// Builds a filter from `pattern → accept` entries, e.g. from a job's
    /// `filesystems` config map.
    pub fn from_rules(rules: &BTreeMap<String, bool>) -> Result<Self, ConfigError> {
        let mut out = Vec::with_capacity(rules.len());
        for (pattern, accept) in rules {
            let (raw, subtree) = match pattern.strip_suffix(SUBTREE_SUFFIX) {
                Some(stripped) => (stripped, true),
                None => (pattern.as_str(), false),
            };
            let path =
                DatasetPath::from_str(raw).map_err(|source| ConfigError::InvalidFilterPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            out.push(FilterRule {
                path,
                subtree,
                accept: *accept,
            });
        }
        Ok(Self { rules: out })
    }

    pub fn accepts(&self, dataset: &DatasetPath) -> bool {
        self.rules
            .iter()
            .filter(|r| {
                if r.subtree {
                    dataset.has_prefix(&r.path)
                } else {
                    dataset == &r.path
                }
            })
            // longest path wins; exact beats subtree at equal length
            .max_by_key(|r| (r.path.len(), !r.subtree))
            .map(|r| r.accept)
            .unwrap_or(false)
    }
}

/// Predicate over `(kind, name)` version pairs: accepts versions of the
/// wanted kind whose name starts with the configured prefix.
#[derive(Debug, Clone)]
pub struct PrefixVersionFilter {
    kind: VersionKind,
    prefix: String,
}

impl PrefixVersionFilter {
    pub fn snapshots(prefix: &str) -> Self {
        Self {
            kind: VersionKind::Snapshot,
            prefix: prefix.to_string(),
        }
    }

    pub fn new(kind: VersionKind, prefix: &str) -> Self {
        Self {
            kind,
            prefix: prefix.to_string(),
        }
    }

    pub fn accepts(&self, kind: VersionKind, name: &str) -> bool {
        kind == self.kind && name.starts_with(&self.prefix)
    }
}
