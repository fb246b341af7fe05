//! Job supervision: one snapshotter task plus one notification consumer per
//! configured job.

use crate::clock::{Clock, SystemClock};
use crate::config::JobConfig;
use crate::error::ConfigError;
use crate::filters::DatasetMapFilter;
use crate::snapper::Snapper;
use crate::zfs::ZfsBackend;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One pending event is enough for an edge-triggered consumer.
const NOTIFICATION_CAPACITY: usize = 1;

/// Shared daemon state handed to the status API.
pub struct AppState {
    pub jobs: DashMap<String, Arc<Snapper>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            start_time: Instant::now(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates each job's filter and snapshotting config, then spawns its
/// snapshotter and notification consumer. Any invalid job aborts startup.
/// The returned handles complete once `cancel` fires.
pub fn start_jobs(
    jobs: &[JobConfig],
    hook_dir: &Path,
    zfs: Arc<dyn ZfsBackend>,
    cancel: &CancellationToken,
) -> Result<(Arc<AppState>, Vec<JoinHandle<()>>), ConfigError> {
    let state = Arc::new(AppState::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut tasks = Vec::with_capacity(jobs.len() * 2);

    for job in jobs {
        let fsf = DatasetMapFilter::from_rules(&job.filesystems)?;
        let snapper = Arc::new(Snapper::new(
            &job.name,
            &job.snapshotting,
            fsf,
            hook_dir.to_path_buf(),
            Arc::clone(&zfs),
            Arc::clone(&clock),
        )?);

        let (tx, mut rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let run_snapper = Arc::clone(&snapper);
        let run_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_snapper.run(run_cancel, tx).await;
        }));

        // The replication trigger downstream of this daemon consumes these
        // edge events; here they are surfaced in the log.
        let job_name = job.name.clone();
        tasks.push(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                info!(job = %job_name, "snapshots taken");
            }
            debug!(job = %job_name, "notification consumer stopped");
        }));

        info!(
            job = %job.name,
            prefix = %job.snapshotting.prefix,
            interval_secs = job.snapshotting.interval_secs,
            "job started"
        );
        state.jobs.insert(job.name.clone(), snapper);
    }

    Ok((state, tasks))
}
