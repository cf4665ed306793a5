use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gtfs_rt_harvester::HarvestError;
use gtfs_rt_harvester::clock::{Clock, ManualClock};
use gtfs_rt_harvester::ingest::{ArtifactStatus, HarvestConfig, Harvester, LoopState, TimetablePolicy};
use gtfs_rt_harvester::modes::{ArtifactKind, ModeConfig, ModeTable};
use gtfs_rt_harvester::publish::{SnapshotWriter, stage_artifact, staging_path};
use gtfs_rt_harvester::services::feed_api::{FetchResult, ModeFetcher};
use gtfs_rt_harvester::services::token_api::{TokenGrant, TokenSource};
use gtfs_rt_harvester::token::{Credential, TokenManager};
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(60);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

struct FakeTokens {
    exchanges: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    expires_in: Duration,
}

#[async_trait]
impl TokenSource for FakeTokens {
    async fn exchange(&self) -> gtfs_rt_harvester::error::Result<TokenGrant> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(HarvestError::Auth("token endpoint returned status 401".into()));
        }
        Ok(TokenGrant {
            access_token: format!("token-{n}"),
            token_type: "Bearer".into(),
            expires_in: self.expires_in,
        })
    }
}

/// Stages `"{mode}:{kind}:{call}"` for every request, except for the pairs in `failing`.
struct FakeFetcher {
    modes: ModeTable,
    staging_dir: PathBuf,
    failing: HashSet<(String, ArtifactKind)>,
    calls: Mutex<Vec<(String, ArtifactKind)>>,
    /// Cancel this token while serving the n-th (1-based) call.
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl FakeFetcher {
    fn new(modes: ModeTable, staging_dir: &Path) -> Self {
        Self {
            modes,
            staging_dir: staging_dir.to_path_buf(),
            failing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            cancel_on_call: None,
        }
    }

    fn calls(&self) -> Vec<(String, ArtifactKind)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, mode: &str, kind: ArtifactKind) -> usize {
        self.calls()
            .iter()
            .filter(|(m, k)| m == mode && *k == kind)
            .count()
    }
}

#[async_trait]
impl ModeFetcher for FakeFetcher {
    async fn fetch(
        &self,
        mode_key: &str,
        kind: ArtifactKind,
        credential: &Credential,
    ) -> gtfs_rt_harvester::error::Result<FetchResult> {
        let mode = self
            .modes
            .get(mode_key)
            .ok_or_else(|| HarvestError::InvalidRequest(mode_key.to_string()))?;
        if !mode.supports(kind) {
            return Err(HarvestError::InvalidRequest(format!("{mode_key} {kind}")));
        }
        assert!(credential.access_token().starts_with("token-"));

        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((mode_key.to_string(), kind));
            calls.len()
        };
        if let Some((n, token)) = &self.cancel_on_call
            && *n == call
        {
            token.cancel();
        }

        if self.failing.contains(&(mode_key.to_string(), kind)) {
            return Err(HarvestError::fetch(mode_key, kind, "HTTP 503"));
        }

        let body = format!("{mode_key}:{}:{call}", kind.as_str());
        let path = staging_path(&self.staging_dir, mode_key, kind);
        stage_artifact(&path, body.as_bytes()).await.unwrap();
        Ok(FetchResult {
            mode_key: mode_key.to_string(),
            kind,
            path,
            bytes: body.len() as u64,
            entities: Some(1),
        })
    }
}

struct Rig {
    dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    exchanges: Arc<AtomicUsize>,
    auth_fails: Arc<AtomicBool>,
    fetcher: Arc<FakeFetcher>,
    harvester: Harvester<FakeTokens, FakeFetcher>,
}

fn rig(modes: ModeTable, config: HarvestConfig, tweak: impl FnOnce(&mut FakeFetcher)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let exchanges = Arc::new(AtomicUsize::new(0));
    let auth_fails = Arc::new(AtomicBool::new(false));

    let tokens = TokenManager::new(
        FakeTokens {
            exchanges: exchanges.clone(),
            fail: auth_fails.clone(),
            expires_in: Duration::from_secs(3600),
        },
        clock.clone() as Arc<dyn Clock>,
    );
    let mut fetcher = FakeFetcher::new(modes.clone(), dir.path());
    tweak(&mut fetcher);
    let fetcher = Arc::new(fetcher);

    let harvester = Harvester::new(
        config,
        modes,
        tokens,
        fetcher.clone(),
        SnapshotWriter::new(dir.path()),
        clock.clone(),
    );

    Rig {
        dir,
        clock,
        exchanges,
        auth_fails,
        fetcher,
        harvester,
    }
}

fn read(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name)).ok()
}

#[tokio::test]
async fn one_cycle_publishes_every_supported_artifact() {
    let mut rig = rig(ModeTable::builtin(), HarvestConfig::new(INTERVAL), |_| {});

    let summary = rig.harvester.run_cycle(&CancellationToken::new()).await;

    assert!(summary.auth_error.is_none());
    assert_eq!(summary.published(), 10);
    assert_eq!(summary.failed(), 0);

    let expected = [
        "sydtrains_alerts.pb",
        "sydtrains_stops.pb",
        "sydtrains_pos.pb",
        "sydtrains_tt.zip",
        "lightrail_stops.pb",
        "lightrail_pos.pb",
        "lightrail_tt.zip",
        "ferries_stops.pb",
        "ferries_pos.pb",
        "ferries_tt.zip",
    ];
    for name in expected {
        let content = read(rig.dir.path(), name).unwrap_or_default();
        assert!(!content.is_empty(), "{name} missing or empty");
    }
    assert!(!rig.dir.path().join("ferries_alerts.pb").exists());
    assert!(!rig.dir.path().join("lightrail_alerts.pb").exists());

    // Outcomes come back in mode-table order.
    let modes: Vec<_> = summary.outcomes.iter().map(|o| o.mode_key.as_str()).collect();
    assert_eq!(modes.first(), Some(&"sydtrains"));
    assert_eq!(modes.last(), Some(&"ferries"));

    // No staging leftovers.
    let hidden = std::fs::read_dir(rig.dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
        .count();
    assert_eq!(hidden, 0);
}

#[tokio::test]
async fn token_is_reused_until_inside_margin() {
    // 60 s interval, 300 s margin, tokens valid for 3600 s.
    let mut rig = rig(ModeTable::builtin(), HarvestConfig::new(INTERVAL), |_| {});
    let shutdown = CancellationToken::new();

    // Cycles at t = 0, 60, ..., 3300: expiry (3600) is never before now + 300.
    for _ in 0..=55 {
        rig.harvester.run_cycle(&shutdown).await;
        rig.clock.advance(INTERVAL);
    }
    assert_eq!(rig.exchanges.load(Ordering::SeqCst), 1);

    // t = 3360: 30 s short of the margin, refresh.
    rig.harvester.run_cycle(&shutdown).await;
    assert_eq!(rig.exchanges.load(Ordering::SeqCst), 2);
    assert_eq!(
        rig.harvester.credential().unwrap().access_token(),
        "token-1"
    );
}

#[tokio::test]
async fn timetable_fetched_once_per_wrap_window() {
    let mut config = HarvestConfig::new(INTERVAL);
    config.timetable = TimetablePolicy::EveryCycles(3);
    let mut rig = rig(ModeTable::builtin(), config, |_| {});
    let shutdown = CancellationToken::new();

    let mut timetable_cycles = vec![];
    for cycle in 0..7 {
        let summary = rig.harvester.run_cycle(&shutdown).await;
        if summary.outcome("ferries", ArtifactKind::Timetable).is_some() {
            timetable_cycles.push(cycle);
        }
        rig.clock.advance(INTERVAL);
    }

    assert_eq!(timetable_cycles, [0, 3, 6]);
    assert_eq!(rig.fetcher.count("ferries", ArtifactKind::Timetable), 3);
    assert_eq!(rig.fetcher.count("ferries", ArtifactKind::StopTimes), 7);
    assert_eq!(rig.fetcher.count("sydtrains", ArtifactKind::Alerts), 7);
}

#[tokio::test]
async fn daily_timetable_retries_until_published() {
    let mut config = HarvestConfig::new(INTERVAL);
    config.timetable = TimetablePolicy::Daily;
    let modes = ModeTable::new(vec![ModeConfig::new("ferries").with_timetable()]).unwrap();
    let mut rig = rig(modes, config, |f| {
        f.failing.insert(("ferries".into(), ArtifactKind::Timetable));
    });
    let shutdown = CancellationToken::new();

    rig.harvester.run_cycle(&shutdown).await;
    rig.clock.advance(INTERVAL);
    rig.harvester.run_cycle(&shutdown).await;
    // Failed both times, so it was attempted both times.
    assert_eq!(rig.fetcher.count("ferries", ArtifactKind::Timetable), 2);
}

#[tokio::test]
async fn fetch_error_does_not_block_other_artifacts() {
    let mut rig = rig(ModeTable::builtin(), HarvestConfig::new(INTERVAL), |f| {
        f.failing
            .insert(("lightrail".into(), ArtifactKind::VehiclePositions));
    });

    let summary = rig.harvester.run_cycle(&CancellationToken::new()).await;

    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.published(), 9);
    let failed = summary
        .outcome("lightrail", ArtifactKind::VehiclePositions)
        .unwrap();
    assert!(!failed.is_published());

    let dir = rig.dir.path();
    assert!(!dir.join("lightrail_pos.pb").exists());
    assert!(read(dir, "lightrail_stops.pb").is_some());
    assert!(read(dir, "lightrail_tt.zip").is_some());
    assert!(read(dir, "ferries_pos.pb").is_some());
    assert!(read(dir, "sydtrains_pos.pb").is_some());
}

#[tokio::test]
async fn auth_error_skips_fetches_and_retries_next_tick() {
    let mut rig = rig(ModeTable::builtin(), HarvestConfig::new(INTERVAL), |_| {});
    rig.auth_fails.store(true, Ordering::SeqCst);
    let shutdown = CancellationToken::new();

    let summary = rig.harvester.run_cycle(&shutdown).await;
    assert!(matches!(summary.auth_error, Some(HarvestError::Auth(_))));
    assert!(summary.outcomes.is_empty());
    assert!(rig.fetcher.calls().is_empty());
    assert_eq!(rig.harvester.state(), LoopState::Idle);
    assert_eq!(
        rig.harvester.schedule().next_tick_at,
        t0() + chrono::Duration::seconds(60)
    );

    rig.auth_fails.store(false, Ordering::SeqCst);
    rig.clock.advance(INTERVAL);
    let summary = rig.harvester.run_cycle(&shutdown).await;
    assert!(summary.auth_error.is_none());
    assert_eq!(summary.published(), 7); // no timetable on cycle 1
    assert_eq!(rig.exchanges.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn interrupt_finishes_in_flight_publish_and_stops() {
    let shutdown = CancellationToken::new();
    let modes = ModeTable::new(vec![ModeConfig::new("ferries").with_timetable()]).unwrap();
    let cancel = shutdown.clone();
    let mut rig = rig(modes, HarvestConfig::new(INTERVAL), move |f| {
        f.cancel_on_call = Some((1, cancel));
    });
    std::fs::write(rig.dir.path().join("ferries_pos.pb"), "previous").unwrap();

    let state = rig.harvester.run(shutdown).await;

    assert_eq!(state, LoopState::Stopped);
    assert_eq!(rig.harvester.state(), LoopState::Stopped);
    // The stop-times fetch was in flight and still got published.
    assert_eq!(
        read(rig.dir.path(), "ferries_stops.pb").as_deref(),
        Some("ferries:stop_times:1")
    );
    // Nothing after it was started; the older snapshot is untouched.
    assert_eq!(rig.fetcher.calls().len(), 1);
    assert_eq!(read(rig.dir.path(), "ferries_pos.pb").as_deref(), Some("previous"));
    assert!(!rig.dir.path().join("ferries_tt.zip").exists());
    assert!(!staging_path(rig.dir.path(), "ferries", ArtifactKind::VehiclePositions).exists());
}

#[tokio::test]
async fn run_paces_cycles_on_the_interval() {
    let shutdown = CancellationToken::new();
    let modes = ModeTable::new(vec![ModeConfig::new("ferries").with_timetable()]).unwrap();
    let cancel = shutdown.clone();
    // Cycle 0: stops, pos, tt. Cycles 1 and 2: stops, pos. Stop on the last call.
    let mut rig = rig(modes, HarvestConfig::new(INTERVAL), move |f| {
        f.cancel_on_call = Some((7, cancel));
    });

    rig.harvester.run(shutdown).await;

    assert_eq!(rig.harvester.schedule().cycles_run, 3);
    assert_eq!(rig.clock.now(), t0() + chrono::Duration::seconds(120));
    assert_eq!(
        read(rig.dir.path(), "ferries_pos.pb").as_deref(),
        Some("ferries:vehicle_positions:7")
    );
}

#[tokio::test]
async fn stop_while_waiting_never_starts_a_cycle() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let mut rig = rig(ModeTable::builtin(), HarvestConfig::new(INTERVAL), |_| {});

    let state = rig.harvester.run(shutdown).await;

    assert_eq!(state, LoopState::Stopped);
    assert_eq!(rig.exchanges.load(Ordering::SeqCst), 0);
    assert!(rig.fetcher.calls().is_empty());
}

#[tokio::test]
async fn publish_error_does_not_block_other_artifacts() {
    let mut rig = rig(ModeTable::builtin(), HarvestConfig::new(INTERVAL), |_| {});
    // A non-empty directory cannot be replaced by a rename.
    let blocked = rig.dir.path().join("lightrail_pos.pb");
    std::fs::create_dir(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();

    let summary = rig.harvester.run_cycle(&CancellationToken::new()).await;

    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.published(), 9);
    let failed = summary
        .outcome("lightrail", ArtifactKind::VehiclePositions)
        .unwrap();
    assert!(matches!(
        &failed.status,
        ArtifactStatus::Failed(HarvestError::Io { path, .. }) if *path == blocked
    ));

    let dir = rig.dir.path();
    assert!(blocked.is_dir());
    assert!(!staging_path(dir, "lightrail", ArtifactKind::VehiclePositions).exists());
    assert!(read(dir, "lightrail_stops.pb").is_some());
    assert!(read(dir, "lightrail_tt.zip").is_some());
    assert!(read(dir, "sydtrains_pos.pb").is_some());
    assert!(read(dir, "ferries_pos.pb").is_some());
    assert_eq!(rig.harvester.state(), LoopState::Idle);
}
