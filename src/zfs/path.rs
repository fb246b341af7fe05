use crate::error::PathError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Characters ZFS rejects in dataset and snapshot names.
///
/// Space is intentionally absent: OpenZFS allows it in dataset names.
pub const FORBIDDEN_CHARS: &[char] = &['@', '#', '|', '\t', '<', '>', '*'];

/// A ZFS dataset name as an ordered sequence of `/`-separated components.
///
/// The empty path is legal and means "no dataset". Paths serialize to JSON as
/// an array of components, not as the joined string.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetPath {
    comps: Vec<String>,
}

impl DatasetPath {
    pub fn root() -> Self {
        Self { comps: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    /// Component-wise prefix test. The empty path is a prefix of everything.
    pub fn has_prefix(&self, prefix: &DatasetPath) -> bool {
        if prefix.comps.len() > self.comps.len() {
            return false;
        }
        self.comps
            .iter()
            .zip(prefix.comps.iter())
            .all(|(a, b)| a == b)
    }

    /// Appends all components of `other`.
    pub fn extend(&mut self, other: &DatasetPath) {
        self.comps.extend(other.comps.iter().cloned());
    }

    /// Removes `prefix` from the front if present; otherwise leaves the path
    /// untouched.
    pub fn trim_prefix(&mut self, prefix: &DatasetPath) {
        if !self.has_prefix(prefix) {
            return;
        }
        self.comps.drain(..prefix.comps.len());
    }

    /// Removes up to `n` leading components.
    pub fn trim_components(&mut self, n: usize) {
        let n = n.min(self.comps.len());
        self.comps.drain(..n);
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.comps.join("/"))
    }
}

impl FromStr for DatasetPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        if s.contains(FORBIDDEN_CHARS) {
            return Err(PathError::ForbiddenCharacters);
        }
        let comps: Vec<String> = s.split('/').map(String::from).collect();
        if comps.last().is_some_and(String::is_empty) {
            return Err(PathError::TrailingSlash);
        }
        Ok(Self { comps })
    }
}

/// Validates a snapshot (or bookmark) name component: the forbidden character
/// set plus `/`, which only dataset names may contain.
pub fn validate_entity_name(name: &str) -> Result<(), PathError> {
    if name.contains(FORBIDDEN_CHARS) || name.contains('/') {
        return Err(PathError::ForbiddenCharacters);
    }
    Ok(())
}
