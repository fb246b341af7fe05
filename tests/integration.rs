//! End-to-end scenarios for the periodic snapshotter: cold start, alignment
//! to existing history, hook failure policies, partial rounds, cadence, and
//! cancellation. ZFS is replaced by the in-memory backend; hooks are real
//! `/bin/sh` scripts; timer-heavy scenarios run on paused tokio time with a
//! virtual wall clock pinned to it.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zsnapd::clock::Clock;
use zsnapd::config::{HookSettings, SnapshottingConfig};
use zsnapd::filters::DatasetMapFilter;
use zsnapd::snapper::{FilesystemProgress, SnapState, Snapper, SnapperReport, State};
use zsnapd::zfs::{DatasetPath, FilesystemVersion, StaticZfs, VersionKind};

const PREFIX: &str = "zsnap_";

// ── Test support ───────────────────────────────────────────────

/// Wall clock pinned to the tokio clock, so paused-time auto-advance moves
/// wall time too.
struct VirtualClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl VirtualClock {
    fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        self.base
            + ChronoDuration::from_std(self.started.elapsed())
                .unwrap_or_else(|_| ChronoDuration::zero())
    }
}

fn ds(s: &str) -> DatasetPath {
    s.parse().unwrap()
}

fn accept_tank() -> DatasetMapFilter {
    let mut rules = BTreeMap::new();
    rules.insert("tank<".to_string(), true);
    DatasetMapFilter::from_rules(&rules).unwrap()
}

fn snap_version(name: &str, create_txg: u64, creation: DateTime<Utc>) -> FilesystemVersion {
    FilesystemVersion {
        kind: VersionKind::Snapshot,
        name: name.into(),
        guid: create_txg,
        create_txg,
        creation,
    }
}

fn write_hook(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    name.to_string()
}

fn make_snapper(
    zfs: Arc<StaticZfs>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    hooks: HookSettings,
    hook_dir: PathBuf,
) -> Arc<Snapper> {
    Arc::new(
        Snapper::new(
            "itest",
            &SnapshottingConfig {
                prefix: PREFIX.into(),
                interval_secs,
                hooks,
            },
            accept_tank(),
            hook_dir,
            zfs,
            clock,
        )
        .unwrap(),
    )
}

struct Harness {
    snapper: Arc<Snapper>,
    cancel: CancellationToken,
    rx: mpsc::Receiver<()>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn spawn(snapper: Arc<Snapper>) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let task = {
            let snapper = Arc::clone(&snapper);
            let cancel = cancel.clone();
            tokio::spawn(async move { snapper.run(cancel, tx).await })
        };
        Self {
            snapper,
            cancel,
            rx,
            task,
        }
    }

    async fn recv_notification(&mut self) {
        self.recv_notification_within(Duration::from_secs(10)).await;
    }

    /// Paused-time scenarios pass a deadline larger than any virtual sleep
    /// the machine performs, so auto-advance reaches the machine's timer
    /// first.
    async fn recv_notification_within(&mut self, deadline: Duration) {
        tokio::time::timeout(deadline, self.rx.recv())
            .await
            .expect("timed out waiting for snapshots-taken notification")
            .expect("notification channel closed unexpectedly");
    }

    async fn wait_for_state(&self, want: State) {
        for _ in 0..2000 {
            if self.snapper.report().state == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "snapper never reached {want:?}, last state {:?}",
            self.snapper.report().state
        );
    }

    async fn stop(self) -> (SnapperReport, mpsc::Receiver<()>) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("snapper did not stop after cancellation")
            .unwrap();
        (self.snapper.report(), self.rx)
    }
}

fn progress_for<'a>(report: &'a SnapperReport, fs: &str) -> &'a FilesystemProgress {
    report
        .progress
        .iter()
        .find(|p| p.fs == fs)
        .unwrap_or_else(|| panic!("no progress entry for {fs}, report: {report:?}"))
}

fn assert_snapshot_name(name: &str) {
    let suffix = name
        .strip_prefix(PREFIX)
        .unwrap_or_else(|| panic!("{name:?} does not start with {PREFIX:?}"));
    // YYYYMMDD_HHMMSS_mmm
    assert_eq!(suffix.len(), 19, "unexpected suffix {suffix:?}");
    assert_eq!(&suffix[8..9], "_");
    assert_eq!(&suffix[15..16], "_");
    assert!(
        suffix
            .chars()
            .enumerate()
            .all(|(i, c)| matches!(i, 8 | 15) || c.is_ascii_digit()),
        "unexpected suffix {suffix:?}"
    );
}

// ── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn cold_start_without_history_snapshots_immediately() {
    let zfs = Arc::new(StaticZfs::new());
    zfs.add_filesystem(ds("tank/a"));
    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );

    let mut harness = Harness::spawn(snapper);
    harness.recv_notification().await;
    let (report, mut rx) = harness.stop().await;

    let created = zfs.created();
    assert_eq!(created.len(), 1, "expected exactly one snapshot: {created:?}");
    assert_eq!(created[0].0, ds("tank/a"));
    assert_snapshot_name(&created[0].1);

    assert_eq!(report.state, State::Stopped);
    let progress = progress_for(&report, "tank/a");
    assert_eq!(progress.progress.state, SnapState::Done);
    assert!(progress.progress.start_at.is_some());
    assert!(progress.progress.done_at.is_some());

    // exactly one notification was emitted
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn restart_aligns_to_existing_history() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(VirtualClock::new(t0));
    let zfs = Arc::new(StaticZfs::with_clock(clock.clone()));
    let fs = ds("tank/a");
    zfs.add_filesystem(fs.clone());
    zfs.add_version(
        &fs,
        snap_version("zsnap_20240101_113000_000", 7, t0 - ChronoDuration::minutes(30)),
    );

    let snapper = make_snapper(
        Arc::clone(&zfs),
        clock.clone(),
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let mut harness = Harness::spawn(snapper);
    harness
        .recv_notification_within(Duration::from_secs(3 * 3600))
        .await;
    let (report, _rx) = harness.stop().await;

    // the machine slept out the remaining half interval before planning
    let waited = clock.now().signed_duration_since(t0);
    assert!(
        waited >= ChronoDuration::minutes(30),
        "snapshot taken after only {waited}"
    );
    assert!(waited < ChronoDuration::minutes(35), "slept too long: {waited}");

    assert_eq!(zfs.created().len(), 1);
    assert_eq!(report.state, State::Stopped);
}

#[tokio::test]
async fn failing_pre_hook_suppresses_snapshot() {
    let tmp = TempDir::new().unwrap();
    let pre = write_hook(tmp.path(), "pre.sh", "echo refusing >&2; exit 1");

    let zfs = Arc::new(StaticZfs::new());
    zfs.add_filesystem(ds("tank/a"));
    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings {
            pre: Some(pre),
            post: None,
            timeout_ms: 5_000,
            keep_on_error: false,
        },
        tmp.path().to_path_buf(),
    );

    let mut harness = Harness::spawn(snapper);
    harness.recv_notification().await;
    harness.wait_for_state(State::ErrorWait).await;

    let report = harness.snapper.report();
    let progress = progress_for(&report, "tank/a");
    assert_eq!(progress.progress.state, SnapState::Error);
    assert!(progress.progress.err.is_some());
    assert!(zfs.created().is_empty(), "snapshot must be suppressed");
    assert!(report.error.is_some());

    let (report, _rx) = harness.stop().await;
    assert_eq!(report.state, State::Stopped);
}

#[tokio::test]
async fn keep_on_error_still_snapshots_and_runs_post_hook() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("post.ran");
    let pre = write_hook(tmp.path(), "pre.sh", "exit 1");
    let post = write_hook(
        tmp.path(),
        "post.sh",
        &format!("echo \"$ZREPL_SNAPNAME\" > {}", marker.display()),
    );

    let zfs = Arc::new(StaticZfs::new());
    zfs.add_filesystem(ds("tank/a"));
    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings {
            pre: Some(pre),
            post: Some(post),
            timeout_ms: 5_000,
            keep_on_error: true,
        },
        tmp.path().to_path_buf(),
    );

    let mut harness = Harness::spawn(snapper);
    harness.recv_notification().await;
    harness.wait_for_state(State::Waiting).await;

    let created = zfs.created();
    assert_eq!(created.len(), 1, "keep_on_error must not suppress the snapshot");

    let recorded = std::fs::read_to_string(&marker).expect("post hook did not run");
    assert_eq!(recorded.trim(), created[0].1);

    let report = harness.snapper.report();
    assert_eq!(
        progress_for(&report, "tank/a").progress.state,
        SnapState::Done
    );
    harness.stop().await;
}

#[tokio::test]
async fn hanging_pre_hook_is_killed_at_deadline() {
    let tmp = TempDir::new().unwrap();
    let pre = write_hook(tmp.path(), "pre.sh", "sleep 30");

    let zfs = Arc::new(StaticZfs::new());
    zfs.add_filesystem(ds("tank/a"));
    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings {
            pre: Some(pre),
            post: None,
            timeout_ms: 100,
            keep_on_error: false,
        },
        tmp.path().to_path_buf(),
    );

    let start = std::time::Instant::now();
    let mut harness = Harness::spawn(snapper);
    harness.recv_notification().await;
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "hook not killed at deadline: {:?}",
        start.elapsed()
    );

    harness.wait_for_state(State::ErrorWait).await;
    let report = harness.snapper.report();
    let progress = progress_for(&report, "tank/a");
    assert_eq!(progress.progress.state, SnapState::Error);
    assert!(zfs.created().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn partial_failure_marks_only_failed_filesystem() {
    let zfs = Arc::new(StaticZfs::new());
    for name in ["tank/a", "tank/b", "tank/c"] {
        zfs.add_filesystem(ds(name));
    }
    zfs.fail_snapshots_for(ds("tank/b"));

    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let mut harness = Harness::spawn(snapper);
    harness.recv_notification().await;
    harness.wait_for_state(State::ErrorWait).await;

    let report = harness.snapper.report();
    assert_eq!(progress_for(&report, "tank/a").progress.state, SnapState::Done);
    assert_eq!(progress_for(&report, "tank/b").progress.state, SnapState::Error);
    assert_eq!(progress_for(&report, "tank/c").progress.state, SnapState::Done);

    let created: Vec<String> = zfs.created().iter().map(|(fs, _)| fs.to_string()).collect();
    assert_eq!(created, vec!["tank/a".to_string(), "tank/c".to_string()]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rounds_keep_interval_cadence() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(VirtualClock::new(t0));
    let zfs = Arc::new(StaticZfs::with_clock(clock.clone()));
    zfs.add_filesystem(ds("tank/a"));

    let snapper = make_snapper(
        Arc::clone(&zfs),
        clock.clone(),
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let mut harness = Harness::spawn(snapper);

    let mut round_times = Vec::new();
    for _ in 0..3 {
        harness
            .recv_notification_within(Duration::from_secs(3 * 3600))
            .await;
        round_times.push(clock.now());
    }
    harness.stop().await;

    for pair in round_times.windows(2) {
        let delta = pair[1].signed_duration_since(pair[0]);
        assert!(
            delta >= ChronoDuration::seconds(3595),
            "rounds only {delta} apart: {round_times:?}"
        );
    }
    assert_eq!(zfs.created().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn full_notification_channel_does_not_block_rounds() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(VirtualClock::new(t0));
    let zfs = Arc::new(StaticZfs::with_clock(clock.clone()));
    zfs.add_filesystem(ds("tank/a"));

    // 1s interval; the harness never drains the capacity-1 channel
    let snapper = make_snapper(
        Arc::clone(&zfs),
        clock,
        1,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let harness = Harness::spawn(snapper);

    for _ in 0..2000 {
        if zfs.created().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        zfs.created().len() >= 3,
        "rounds stalled on a full notification channel"
    );
    harness.stop().await;
}

#[tokio::test]
async fn listing_failure_enters_sync_up_err_wait_and_cancels_cleanly() {
    let zfs = Arc::new(StaticZfs::new());
    zfs.fail_listing(true);

    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let harness = Harness::spawn(snapper);
    harness.wait_for_state(State::SyncUpErrWait).await;
    assert!(harness.snapper.report().error.is_some());

    let (report, _rx) = harness.stop().await;
    assert_eq!(report.state, State::Stopped);
}

#[tokio::test]
async fn cancellation_during_sync_up_sleep_stops_without_snapshots() {
    let zfs = Arc::new(StaticZfs::new());
    let fs = ds("tank/a");
    zfs.add_filesystem(fs.clone());
    // latest snapshot 30 minutes old with a 1h interval: machine sleeps first
    zfs.add_version(
        &fs,
        snap_version("zsnap_recent", 3, Utc::now() - ChronoDuration::minutes(30)),
    );

    let snapper = make_snapper(
        Arc::clone(&zfs),
        Arc::new(zsnapd::clock::SystemClock),
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let harness = Harness::spawn(snapper);

    for _ in 0..500 {
        if harness.snapper.report().sleep_until.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.snapper.report().sleep_until.is_some());

    let (report, mut rx) = harness.stop().await;
    assert_eq!(report.state, State::Stopped);
    assert!(zfs.created().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn second_round_replans_filesystem_set() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(VirtualClock::new(t0));
    let zfs = Arc::new(StaticZfs::with_clock(clock.clone()));
    zfs.add_filesystem(ds("tank/a"));

    let snapper = make_snapper(
        Arc::clone(&zfs),
        clock,
        3600,
        HookSettings::default(),
        PathBuf::from("."),
    );
    let mut harness = Harness::spawn(snapper);

    harness
        .recv_notification_within(Duration::from_secs(3 * 3600))
        .await;
    // a dataset created between rounds joins the next plan
    zfs.add_filesystem(ds("tank/b"));
    harness
        .recv_notification_within(Duration::from_secs(3 * 3600))
        .await;
    harness.stop().await;

    let second_round: Vec<String> = zfs
        .created()
        .iter()
        .skip(1)
        .map(|(fs, _)| fs.to_string())
        .collect();
    assert_eq!(second_round, vec!["tank/a".to_string(), "tank/b".to_string()]);
}
