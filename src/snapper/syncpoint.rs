//! Sync-point computation: when should the next snapshot batch start so that
//! the cadence lines up with the snapshots already on disk?

use crate::error::ZfsError;
use crate::filters::PrefixVersionFilter;
use crate::zfs::{DatasetPath, ZfsBackend};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error};

/// Returns the wall-clock time at which the first Planning pass should begin.
///
/// For every filesystem carrying prefixed snapshots, the latest one (by
/// create_txg) proposes `creation + interval`, clamped to `now` when already
/// overdue. The earliest proposal wakes the batch; filesystems without
/// usable history (none, listing error, future-dated clock skew) contribute
/// nothing, and if nothing contributes the answer is `now`. The result is
/// always ≥ `now`.
pub async fn find_sync_point(
    zfs: &dyn ZfsBackend,
    fss: &[DatasetPath],
    prefix: &str,
    interval: Duration,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ZfsError> {
    if fss.is_empty() {
        return Ok(now);
    }

    let filter = PrefixVersionFilter::snapshots(prefix);
    let mut proposals: Vec<(DateTime<Utc>, &DatasetPath)> = Vec::with_capacity(fss.len());

    debug!("examine filesystem snapshot state");
    for fs in fss {
        let mut versions = match zfs.list_versions(fs, &filter).await {
            Ok(versions) => versions,
            Err(err) => {
                error!(fs = %fs, error = %err, "cannot list filesystem versions");
                continue;
            }
        };
        if versions.is_empty() {
            debug!(fs = %fs, prefix = %prefix, "no filesystem versions with prefix");
            continue;
        }

        versions.sort_by_key(|v| v.create_txg);
        let Some(latest) = versions.last() else {
            continue;
        };
        debug!(fs = %fs, creation = %latest.creation, "found latest snapshot");

        let since = now.signed_duration_since(latest.creation);
        if since < Duration::zero() {
            error!(
                fs = %fs,
                snapshot = %latest.name,
                creation = %latest.creation,
                "snapshot is from the future"
            );
            continue;
        }

        let next = if since >= interval {
            now
        } else {
            latest.creation + interval
        };
        proposals.push((next, fs));
    }

    Ok(proposals.into_iter().min().map(|(t, _)| t).unwrap_or(now))
}
