mod common;

use common::{smart_app, FakeLauncher, Failure, Script};
use futures::future::join_all;
use matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use zwilling::{PreloaderState, SmartSpawner, SpawnError, Spawner, Strategy};

const TIMEOUT: Duration = Duration::from_secs(30);

fn spawner_with(script: Script, idle_timeout_seconds: Option<u64>) -> (SmartSpawner, FakeLauncher) {
    let launcher = FakeLauncher::new(script);
    let mut app = smart_app("shop");
    app.idle_timeout_seconds = idle_timeout_seconds;
    let spawner =
        SmartSpawner::with_launcher(&app, Arc::new(launcher.clone())).expect("app can duplicate");
    (spawner, launcher)
}

#[tokio::test(start_paused = true)]
async fn cold_concurrent_spawns_share_one_preloader() {
    let (spawner, launcher) = spawner_with(
        Script {
            load_delay: Duration::from_secs(2),
            duplicate_delay: Duration::from_millis(100),
            ..Default::default()
        },
        None,
    );
    assert_eq!(spawner.preloader_state().await, None);

    let (first, second) = tokio::join!(spawner.spawn(TIMEOUT), spawner.spawn(TIMEOUT));
    let first = first.unwrap();
    let second = second.unwrap();
    assert_ne!(first.id(), second.id());
    assert_ne!(first.pid(), second.pid());
    assert_eq!(first.strategy(), Strategy::Duplicated);
    assert_eq!(first.worker.preloader, spawner.preloader_pid().await);

    assert_eq!(launcher.stats.starts(), 1);
    assert_eq!(launcher.stats.duplications(), 2);
    assert_eq!(launcher.stats.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplications_never_overlap() {
    let (spawner, launcher) = spawner_with(
        Script {
            duplicate_delay: Duration::from_millis(50),
            ..Default::default()
        },
        None,
    );
    let results = join_all((0..10).map(|_| spawner.spawn(TIMEOUT))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(launcher.stats.duplications(), 10);
    assert_eq!(launcher.stats.max_in_flight(), 1);
    assert_eq!(launcher.stats.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_preloader_gets_reaped() {
    let (spawner, launcher) = spawner_with(Script::default(), Some(5));
    let handle = spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(handle.strategy(), Strategy::Duplicated);

    sleep(Duration::from_millis(4900)).await;
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));
    assert_eq!(launcher.stats.live(), 1);

    sleep(Duration::from_millis(300)).await;
    assert_matches!(
        spawner.preloader_state().await,
        Some(PreloaderState::Terminated(_))
    );
    assert_eq!(launcher.stats.live(), 0);

    spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(launcher.stats.starts(), 2);
    assert_eq!(launcher.stats.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn each_duplication_resets_the_idle_clock() {
    let (spawner, launcher) = spawner_with(Script::default(), Some(1));
    for _ in 0..5 {
        spawner.spawn(TIMEOUT).await.unwrap();
        sleep(Duration::from_millis(800)).await;
    }
    assert_eq!(launcher.stats.starts(), 1);
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));
}

#[tokio::test(start_paused = true)]
async fn long_duplications_outlast_the_idle_timeout() {
    let (spawner, launcher) = spawner_with(
        Script {
            duplicate_delay: Duration::from_secs(3),
            ..Default::default()
        },
        Some(1),
    );
    spawner.spawn(TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));

    // The reaper ticks several times past the idle timeout while this
    // duplication is busy.
    let started = Instant::now();
    spawner.spawn(TIMEOUT).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(3100));
    assert_eq!(launcher.stats.shutdowns(), 0);
    assert_eq!(launcher.stats.live(), 1);

    sleep(Duration::from_millis(500)).await;
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));

    sleep(Duration::from_millis(1000)).await;
    assert_matches!(
        spawner.preloader_state().await,
        Some(PreloaderState::Terminated(_))
    );
    assert_eq!(launcher.stats.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn spawns_at_the_reap_boundary_succeed() {
    for offset in &[900, 1000, 1050, 1100, 1200] {
        let (spawner, launcher) = spawner_with(Script::default(), Some(1));
        spawner.spawn(TIMEOUT).await.unwrap();
        sleep(Duration::from_millis(*offset)).await;

        let handle = spawner.spawn(TIMEOUT).await;
        assert!(handle.is_ok(), "spawning {}ms after the last one", offset);
        assert!(launcher.stats.starts() <= 2);
        assert_eq!(launcher.stats.max_live(), 1);
        assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));
    }
}

#[tokio::test(start_paused = true)]
async fn crashed_preloader_gets_restarted() {
    let (spawner, launcher) = spawner_with(Script::default(), None);
    spawner.spawn(TIMEOUT).await.unwrap();
    let first_preloader = spawner.preloader_pid().await;

    launcher.crash_all();
    let handle = spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(handle.state(), zwilling::WorkerState::Ready);
    assert_eq!(launcher.stats.starts(), 2);
    assert_eq!(launcher.stats.live(), 1);
    assert_ne!(spawner.preloader_pid().await, first_preloader);
}

#[tokio::test(start_paused = true)]
async fn death_during_duplication_is_retried_once() {
    let (spawner, launcher) = spawner_with(
        Script {
            die_during_duplicate: 1,
            ..Default::default()
        },
        None,
    );
    spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(launcher.stats.starts(), 2);
    assert_eq!(launcher.stats.live(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_death_surfaces_as_a_timeout() {
    let (spawner, launcher) = spawner_with(
        Script {
            die_during_duplicate: 2,
            ..Default::default()
        },
        None,
    );
    assert_matches!(
        spawner.spawn(TIMEOUT).await,
        Err(SpawnError::SpawnTimeout { .. })
    );
    assert_eq!(launcher.stats.starts(), 2);
    assert_eq!(launcher.stats.live(), 0);
    assert_eq!(spawner.preloader_state().await, None);

    // The third preloader behaves.
    spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(launcher.stats.starts(), 3);
}

#[tokio::test(start_paused = true)]
async fn resource_exhaustion_is_not_retried() {
    let (spawner, launcher) = spawner_with(
        Script {
            fail_duplicate: Some(Failure::ResourceExhausted),
            ..Default::default()
        },
        None,
    );
    assert_matches!(
        spawner.spawn(TIMEOUT).await,
        Err(SpawnError::ResourceExhausted { .. })
    );
    assert_eq!(launcher.stats.starts(), 1);
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));
}

#[tokio::test(start_paused = true)]
async fn hook_failures_reach_the_caller() {
    let (spawner, _launcher) = spawner_with(
        Script {
            fail_duplicate: Some(Failure::StartupHook),
            ..Default::default()
        },
        None,
    );
    assert_matches!(
        spawner.spawn(TIMEOUT).await,
        Err(SpawnError::StartupHookError { message }) if message.contains("boom")
    );
}

#[tokio::test(start_paused = true)]
async fn load_failures_leave_no_preloader_behind() {
    let (spawner, launcher) = spawner_with(
        Script {
            fail_load: true,
            ..Default::default()
        },
        None,
    );
    assert_matches!(
        spawner.spawn(TIMEOUT).await,
        Err(SpawnError::LoadError { .. })
    );
    assert_eq!(launcher.stats.live(), 0);

    launcher.script.lock().fail_load = false;
    spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(launcher.stats.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_loads_time_out() {
    let (spawner, launcher) = spawner_with(
        Script {
            load_delay: Duration::from_secs(60),
            ..Default::default()
        },
        None,
    );
    let started = Instant::now();
    assert_matches!(
        spawner.spawn(Duration::from_secs(5)).await,
        Err(SpawnError::SpawnTimeout { timeout }) if timeout == Duration::from_secs(5)
    );
    assert!(started.elapsed() < Duration::from_millis(5100));
    assert_eq!(spawner.preloader_state().await, None);
    assert_eq!(launcher.stats.live(), 0);
    assert_eq!(launcher.stats.kills(), 1);
    assert_eq!(launcher.stats.shutdowns(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeouts_report_what_the_caller_asked_for() {
    let (spawner, _launcher) = spawner_with(
        Script {
            load_delay: Duration::from_secs(2),
            duplicate_delay: Duration::from_secs(10),
            ..Default::default()
        },
        None,
    );
    assert_matches!(
        spawner.spawn(Duration::from_secs(3)).await,
        Err(SpawnError::SpawnTimeout { timeout }) if timeout == Duration::from_secs(3)
    );
}

#[tokio::test(start_paused = true)]
async fn unlimited_timeouts_are_accepted() {
    let (spawner, launcher) = spawner_with(Script::default(), Some(5));
    let handle = spawner.spawn(Duration::MAX).await.unwrap();
    assert_eq!(handle.strategy(), Strategy::Duplicated);
    spawner.spawn(Duration::MAX).await.unwrap();
    assert_eq!(launcher.stats.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_duplications_time_out() {
    let (spawner, _launcher) = spawner_with(
        Script {
            duplicate_delay: Duration::from_secs(10),
            ..Default::default()
        },
        None,
    );
    assert_matches!(
        spawner.spawn(Duration::from_secs(1)).await,
        Err(SpawnError::SpawnTimeout { .. })
    );
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));
    spawner.spawn(TIMEOUT).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_spawns_leave_the_preloader_usable() {
    let (spawner, launcher) = spawner_with(
        Script {
            duplicate_delay: Duration::from_secs(10),
            ..Default::default()
        },
        None,
    );
    let cancelled = tokio::time::timeout(Duration::from_secs(1), spawner.spawn(TIMEOUT)).await;
    assert!(cancelled.is_err());
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Busy(_)));

    spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(launcher.stats.starts(), 1);
    assert_eq!(launcher.stats.max_in_flight(), 1);
    assert_matches!(spawner.preloader_state().await, Some(PreloaderState::Idle(_)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_preloader() {
    let (spawner, launcher) = spawner_with(Script::default(), Some(60));
    spawner.spawn(TIMEOUT).await.unwrap();
    assert_eq!(launcher.stats.live(), 1);

    spawner.shutdown().await;
    assert_eq!(launcher.stats.live(), 0);
    assert_eq!(spawner.preloader_state().await, None);
}

#[test]
fn apps_without_duplication_are_refused() {
    let mut app = smart_app("legacy");
    app.runtime_capabilities.duplication = false;
    assert_matches!(
        SmartSpawner::new(&app).err(),
        Some(SpawnError::DuplicationUnsupported { app }) if app == "legacy"
    );
    assert!(!SmartSpawner::supports_duplication(&app));
}
