//! The per-job snapshotter: a long-lived state machine that aligns itself to
//! existing snapshot history, then takes coordinated snapshots of every
//! filesystem the job owns at a fixed cadence, running optional hooks around
//! each one.
//!
//! The task driving [`Snapper::run`] owns the machine; observers get
//! consistent point-in-time views via [`Snapper::report`]. Every mutation
//! goes through one mutex-guarded updater, so transitions are totally
//! ordered and logged race-free.

pub mod syncpoint;

use crate::clock::Clock;
use crate::config::{HookSettings, SnapshottingConfig};
use crate::error::ConfigError;
use crate::filters::DatasetMapFilter;
use crate::hooks::run_hook;
use crate::snapper::syncpoint::find_sync_point;
use crate::zfs::{DatasetPath, ZfsBackend};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Snapshotter states. `Stopped` is terminal and reached only through
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    SyncUp,
    SyncUpErrWait,
    Planning,
    Snapshotting,
    Waiting,
    ErrorWait,
    Stopped,
}

/// Progress of one filesystem within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapState {
    Pending,
    Started,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapProgress {
    pub state: SnapState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl SnapProgress {
    fn pending() -> Self {
        Self {
            state: SnapState::Pending,
            name: None,
            start_at: None,
            done_at: None,
            err: None,
        }
    }
}

/// Observer view of a snapshotter, taken atomically under its state lock.
#[derive(Debug, Clone, Serialize)]
pub struct SnapperReport {
    pub job: String,
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: Vec<FilesystemProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesystemProgress {
    pub fs: String,
    #[serde(flatten)]
    pub progress: SnapProgress,
}

struct Inner {
    state: State,
    /// Stamped at SyncUp/Planning entry; waits are relative to it.
    last_invocation: Option<DateTime<Utc>>,
    /// Valid while a round is in flight and until the next Planning.
    plan: BTreeMap<DatasetPath, SnapProgress>,
    /// Valid in SyncUp and the wait states.
    sleep_until: Option<DateTime<Utc>>,
    err: Option<String>,
}

/// One job's periodic snapshotter.
pub struct Snapper {
    name: String,
    prefix: String,
    interval: Duration,
    fsf: DatasetMapFilter,
    hooks: HookSettings,
    hook_dir: PathBuf,
    zfs: Arc<dyn ZfsBackend>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Snapper {
    pub fn new(
        name: &str,
        config: &SnapshottingConfig,
        fsf: DatasetMapFilter,
        hook_dir: PathBuf,
        zfs: Arc<dyn ZfsBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        crate::config::validate_snapshotting(config)?;
        Ok(Self {
            name: name.to_string(),
            prefix: config.prefix.clone(),
            interval: Duration::seconds(config.interval_secs as i64),
            fsf,
            hooks: config.hooks.clone(),
            hook_dir,
            zfs,
            clock,
            inner: Mutex::new(Inner {
                state: State::SyncUp,
                last_invocation: None,
                plan: BTreeMap::new(),
                sleep_until: None,
                err: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report(&self) -> SnapperReport {
        self.locked(|inner| SnapperReport {
            job: self.name.clone(),
            state: inner.state,
            sleep_until: inner.sleep_until,
            error: inner.err.clone(),
            progress: inner
                .plan
                .iter()
                .map(|(fs, progress)| FilesystemProgress {
                    fs: fs.to_string(),
                    progress: progress.clone(),
                })
                .collect(),
        })
    }

    /// Drives the state machine until `cancel` fires. Each round's completion
    /// is signalled with a non-blocking send on `snapshots_taken`; a full
    /// channel drops the event with a warning.
    pub async fn run(&self, cancel: CancellationToken, snapshots_taken: mpsc::Sender<()>) {
        debug!(job = %self.name, "snapshotter started");
        loop {
            let pre = self.locked(|inner| inner.state);
            let post = match pre {
                State::SyncUp => self.sync_up(&cancel).await,
                State::Planning => self.plan().await,
                State::Snapshotting => self.snapshot_round(&cancel, &snapshots_taken).await,
                State::SyncUpErrWait | State::Waiting | State::ErrorWait => {
                    self.wait(&cancel).await
                }
                State::Stopped => break,
            };
            debug!(
                job = %self.name,
                transition = %format!("{pre:?} => {post:?}"),
                "state transition"
            );
        }
        debug!(job = %self.name, "snapshotter stopped");
    }

    // ── State functions ────────────────────────────────────────

    async fn sync_up(&self, cancel: &CancellationToken) -> State {
        let now = self.clock.now();
        self.update(|inner| inner.last_invocation = Some(now));
        let fss = match self.zfs.list_mapping(&self.fsf).await {
            Ok(fss) => fss,
            Err(err) => return self.on_err(&err),
        };
        let sync_point =
            match find_sync_point(self.zfs.as_ref(), &fss, &self.prefix, self.interval, now).await
            {
                Ok(sync_point) => sync_point,
                Err(err) => return self.on_err(&err),
            };
        self.update(|inner| inner.sleep_until = Some(sync_point));
        debug!(job = %self.name, sync_point = %sync_point, "waiting for sync point");
        self.sleep_or_stop(sync_point, cancel).await
    }

    async fn plan(&self) -> State {
        let now = self.clock.now();
        self.update(|inner| inner.last_invocation = Some(now));
        match self.zfs.list_mapping(&self.fsf).await {
            Ok(fss) => self.update(|inner| {
                inner.plan = fss
                    .into_iter()
                    .map(|fs| (fs, SnapProgress::pending()))
                    .collect();
                inner.state = State::Snapshotting;
            }),
            Err(err) => self.on_err(&err),
        }
    }

    async fn snapshot_round(
        &self,
        cancel: &CancellationToken,
        snapshots_taken: &mpsc::Sender<()>,
    ) -> State {
        let fss: Vec<DatasetPath> = self.locked(|inner| inner.plan.keys().cloned().collect());

        let mut had_err = false;
        for fs in &fss {
            if !self.snapshot_one(fs, cancel).await {
                had_err = true;
            }
        }

        // Edge-triggered and lossy: the downstream aggregates notifications.
        match snapshots_taken.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                warn!(job = %self.name, "notification channel is full, discarding snapshots-taken event");
            }
            Err(TrySendError::Closed(())) => {
                debug!(job = %self.name, "notification channel closed");
            }
        }

        self.update(|inner| {
            if had_err {
                inner.state = State::ErrorWait;
                inner.err = Some(
                    "one or more snapshots could not be created, check logs for details"
                        .to_string(),
                );
            } else {
                inner.state = State::Waiting;
            }
        })
    }

    /// Pre-hook → snapshot → post-hook for one filesystem. Returns false when
    /// the filesystem ends the round in `Error`.
    async fn snapshot_one(&self, fs: &DatasetPath, cancel: &CancellationToken) -> bool {
        let started_at = self.clock.now();
        let snapname = snapshot_name(&self.prefix, started_at);

        self.update(|inner| {
            if let Some(progress) = inner.plan.get_mut(fs) {
                progress.state = SnapState::Started;
                progress.name = Some(snapname.clone());
                progress.start_at = Some(started_at);
            }
        });

        let mut pre_err = None;
        if let Some(pre) = &self.hooks.pre {
            debug!(job = %self.name, fs = %fs, snap = %snapname, "run pre-snapshot hook");
            let env = hook_env("pre", fs, &snapname);
            if let Err(err) = run_hook(pre, &self.hook_dir, &env, self.hooks.timeout(), cancel).await
            {
                error!(
                    job = %self.name, fs = %fs, snap = %snapname, error = %err,
                    "cannot run pre-snapshot hook"
                );
                pre_err = Some(err.to_string());
            }
        }

        if pre_err.is_some() && !self.hooks.keep_on_error {
            error!(
                job = %self.name, fs = %fs, snap = %snapname,
                "skipping snapshot due to pre-snapshot hook error"
            );
            self.update(|inner| {
                if let Some(progress) = inner.plan.get_mut(fs) {
                    progress.state = SnapState::Error;
                    progress.err = pre_err.clone();
                }
            });
            return false;
        }

        debug!(job = %self.name, fs = %fs, snap = %snapname, "create snapshot");
        let snap_result = self.zfs.snapshot(fs, &snapname, false).await;
        let done_at = self.clock.now();

        match snap_result {
            Ok(()) => {
                if let Some(post) = &self.hooks.post {
                    debug!(job = %self.name, fs = %fs, snap = %snapname, "run post-snapshot hook");
                    let env = hook_env("post", fs, &snapname);
                    if let Err(err) =
                        run_hook(post, &self.hook_dir, &env, self.hooks.timeout(), cancel).await
                    {
                        // logged only; never fails the round
                        error!(
                            job = %self.name, fs = %fs, snap = %snapname, error = %err,
                            "cannot run post-snapshot hook"
                        );
                    }
                }
                self.update(|inner| {
                    if let Some(progress) = inner.plan.get_mut(fs) {
                        progress.state = SnapState::Done;
                        progress.done_at = Some(done_at);
                    }
                });
                true
            }
            Err(err) => {
                error!(
                    job = %self.name, fs = %fs, snap = %snapname, error = %err,
                    "cannot create snapshot"
                );
                self.update(|inner| {
                    if let Some(progress) = inner.plan.get_mut(fs) {
                        progress.state = SnapState::Error;
                        progress.done_at = Some(done_at);
                        progress.err = Some(err.to_string());
                    }
                });
                false
            }
        }
    }

    async fn wait(&self, cancel: &CancellationToken) -> State {
        let (sleep_until, err_wait) = self.locked(|inner| {
            let last = inner.last_invocation.unwrap_or_else(|| self.clock.now());
            let until = last + self.interval;
            inner.sleep_until = Some(until);
            (
                until,
                matches!(inner.state, State::ErrorWait | State::SyncUpErrWait),
            )
        });
        if err_wait {
            error!(job = %self.name, sleep_until = %sleep_until, "enter wait state after error");
        } else {
            debug!(job = %self.name, sleep_until = %sleep_until, "enter wait state");
        }
        self.sleep_or_stop(sleep_until, cancel).await
    }

    // ── Shared transitions ─────────────────────────────────────

    async fn sleep_or_stop(&self, until: DateTime<Utc>, cancel: &CancellationToken) -> State {
        let dur = until
            .signed_duration_since(self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(dur) => self.update(|inner| inner.state = State::Planning),
            () = cancel.cancelled() => self.on_cancelled(),
        }
    }

    fn on_err(&self, err: &dyn std::fmt::Display) -> State {
        self.update(|inner| {
            let pre = inner.state;
            inner.state = match pre {
                State::SyncUp => State::SyncUpErrWait,
                State::Planning | State::Snapshotting => State::ErrorWait,
                other => other,
            };
            inner.err = Some(err.to_string());
            error!(
                job = %self.name,
                error = %err,
                pre_state = ?pre,
                post_state = ?inner.state,
                "snapshotting error"
            );
        })
    }

    fn on_cancelled(&self) -> State {
        self.update(|inner| {
            inner.err = Some("context cancelled".to_string());
            inner.state = State::Stopped;
        })
    }

    // ── Locked state access ────────────────────────────────────

    fn locked<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().expect("snapper state lock poisoned");
        f(&mut inner)
    }

    fn update(&self, f: impl FnOnce(&mut Inner)) -> State {
        self.locked(|inner| {
            f(inner);
            inner.state
        })
    }
}

/// `<prefix><YYYYMMDD>_<HHMMSS>_<milliseconds>` in UTC.
fn snapshot_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}{}", prefix, now.format("%Y%m%d_%H%M%S_%3f"))
}

fn hook_env(hook_type: &str, fs: &DatasetPath, snapname: &str) -> Vec<(String, String)> {
    vec![
        ("ZREPL_HOOKTYPE".to_string(), hook_type.to_string()),
        ("ZREPL_PHASE".to_string(), "Snapshotting".to_string()),
        ("ZREPL_FS".to_string(), fs.to_string()),
        ("ZREPL_SNAPNAME".to_string(), snapname.to_string()),
    ]
}
