//! Hook scripts reaching mock devices through the station bindings.
//!
//! Hooks block on the runtime from the blocking pool, so these tests need a
//! multi-threaded runtime.

mod common;

use common::{mock_session, open_session, scripted_analyzer};
use spectrum_monitor::adapters::MockAdapter;
use spectrum_monitor::automation::ScheduleHooks;
use spectrum_monitor::config::{CalibrationConfig, RelayConfig, TimingConfig};
use spectrum_monitor::core::{display_lock, NullSink};
use spectrum_monitor::instrument::{MotionMachine, PlcController};
use spectrum_monitor::scripting::{HookEngine, HookLimits, StationBindings};
use spectrum_monitor::sequencer::{Registry, Sequencer};
use spectrum_monitor::StationError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;

struct Bench {
    engine: HookEngine,
    sequencer: Arc<Sequencer>,
    plc: Arc<PlcController>,
    analyzer: MockAdapter,
    motor: MockAdapter,
    relay: MockAdapter,
    data_dir: TempDir,
}

async fn bench() -> Bench {
    let (instrument, analyzer) = open_session("instrument", "ADDR1").await;
    scripted_analyzer(&analyzer).await;
    let (motor_session, motor) = open_session("motor", "COM4").await;
    let (relay_session, relay) = open_session("relay", "COM3").await;
    relay.reply("1010000", "DFS chain 1 selected\n").await;
    relay.reply("111", "80\n").await;

    let relay_config = RelayConfig {
        echo_window: Duration::from_millis(60),
        status_window: Duration::from_millis(60),
        ..RelayConfig::default()
    };
    let sequencer = Arc::new(Sequencer::new(Registry::standard(), display_lock()));
    let motion = Arc::new(MotionMachine::new(
        motor_session,
        CalibrationConfig::default(),
        display_lock(),
        Arc::new(NullSink),
        &TimingConfig::default(),
    ));
    let plc = Arc::new(PlcController::new(relay_session, &relay_config));
    let data_dir = tempfile::tempdir().unwrap();

    let engine = HookEngine::with_station(
        HookLimits::default(),
        StationBindings {
            runtime: Handle::current(),
            instrument,
            sequencer: sequencer.clone(),
            motion,
            plc: plc.clone(),
            data_dir: data_dir.path().to_path_buf(),
        },
    );

    Bench {
        engine,
        sequencer,
        plc,
        analyzer,
        motor,
        relay,
        data_dir,
    }
}

fn records_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

const SURVEY: &str = r#"
fn initSchedule() {
    relay().send("DFS_CHAIN1");
    apply(#{ startfreq: 0, stopfreq: 1e9 });
}

fn onSchedule() {
    motor().point(120, -5);
    let stop = instrument().param("stopfreq");
    if stop == "" { throw "stop frequency was never refreshed"; }
    let path = save_trace();
    print(`saved ${path}`);
}
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_init_hook_selects_chain_and_applies() {
    let bench = bench().await;
    let hooks = bench.engine.compile(SURVEY).unwrap();

    hooks.init_schedule().await.unwrap();

    assert_eq!(bench.relay.writes().await, vec!["1010000", "111"]);
    assert_eq!(bench.plc.snapshot().chain, "DFS1");

    let writes = bench.analyzer.writes().await;
    assert_eq!(writes[0], ":SENS:FREQ:START 0");
    assert_eq!(writes[1], ":SENS:FREQ:STOP 1000000000");
    assert!(!bench.sequencer.registry().has_pending().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schedule_hook_points_and_saves_trace() {
    let bench = bench().await;
    let hooks = bench.engine.compile(SURVEY).unwrap();
    hooks.init_schedule().await.unwrap();

    hooks.on_schedule().await.unwrap();
    hooks.on_schedule().await.unwrap();

    assert_eq!(bench.motor.writes().await, vec!["jog abs x 120 y -5"; 2]);

    let records = records_in(bench.data_dir.path());
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|name| name.starts_with("DFS1-") && name.ends_with(".csv")));

    let text = std::fs::read_to_string(bench.data_dir.path().join(&records[0])).unwrap();
    assert!(text.lines().any(|line| line == "Stop Frequency,+1.00000000E+009"));
    assert!(text.lines().any(|line| line == "DATA"));
    assert!(text.lines().any(|line| line == "1000000000,-82.75"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_error_surfaces_as_script_error() {
    let bench = bench().await;
    let hooks = bench
        .engine
        .compile(r#"fn initSchedule() {} fn onSchedule() { motor().point(0, 45); }"#)
        .unwrap();

    let err = hooks.on_schedule().await.unwrap_err();
    assert!(matches!(err, StationError::Script(ref msg) if msg.contains("motor.point")));
    assert!(bench.motor.writes().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_session_fails_hook() {
    let mock = MockAdapter::new("ADDR1");
    let bench = bench().await;
    let engine = HookEngine::with_station(
        HookLimits::default(),
        StationBindings {
            runtime: Handle::current(),
            instrument: mock_session("instrument", &mock),
            sequencer: bench.sequencer.clone(),
            motion: Arc::new(MotionMachine::new(
                mock_session("motor", &MockAdapter::new("COM4")),
                CalibrationConfig::default(),
                display_lock(),
                Arc::new(NullSink),
                &TimingConfig::default(),
            )),
            plc: bench.plc.clone(),
            data_dir: bench.data_dir.path().to_path_buf(),
        },
    );
    let hooks = engine
        .compile(r#"fn initSchedule() { instrument().write(":INIT:IMM"); } fn onSchedule() {}"#)
        .unwrap();

    assert!(matches!(
        hooks.init_schedule().await,
        Err(StationError::Script(_))
    ));
    assert!(records_in(bench.data_dir.path()).is_empty());
}
