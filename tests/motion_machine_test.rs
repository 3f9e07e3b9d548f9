//! Positioner state machine and manual moves against a scripted controller.

mod common;

use common::{mock_session, open_session, scripted_positioner};
use spectrum_monitor::adapters::MockAdapter;
use spectrum_monitor::config::{CalibrationConfig, TimingConfig};
use spectrum_monitor::core::{display_lock, DisplayLock, LoopState, Position, PositionPlot};
use spectrum_monitor::instrument::{Axis, MotionMachine};
use spectrum_monitor::session::Session;
use spectrum_monitor::StationError;
use std::sync::{Arc, Mutex};

struct Fixture {
    machine: MotionMachine,
    plot: DisplayLock<PositionPlot>,
    published: Arc<Mutex<Vec<Position>>>,
}

fn fixture(session: Arc<Session>) -> Fixture {
    let plot = display_lock();
    let published = Arc::new(Mutex::new(Vec::new()));
    let seen = published.clone();
    let machine = MotionMachine::new(
        session,
        CalibrationConfig::default(),
        plot.clone(),
        Arc::new(move |position: Position| seen.lock().unwrap().push(position)),
        &TimingConfig::default(),
    );
    Fixture {
        machine,
        plot,
        published,
    }
}

/// Encoder counts for (0°, 90°) with the default calibration
fn home_counts() -> (i64, i64) {
    let cal = CalibrationConfig::default();
    (cal.x_enc_home, cal.y_enc_home + cal.y_countsperrotation / 4)
}

#[tokio::test]
async fn test_init_enables_drives() {
    let (session, mock) = open_session("motor", "COM4").await;
    let (x, y) = home_counts();
    scripted_positioner(&mock, x, y).await;
    let f = fixture(session);

    f.machine.request(LoopState::Init);
    f.machine.step().await;

    let snapshot = f.machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Loop);
    assert_eq!((snapshot.axis0, snapshot.axis1), (Some(true), Some(true)));
    assert!(snapshot.inputs_enabled);
    assert_eq!(
        mock.writes().await,
        vec!["", "Prog 0", "DRIVE ON X Y", "DRIVE X", "DRIVE Y"]
    );
}

#[tokio::test]
async fn test_drive_that_stays_off_fails_init() {
    let (session, mock) = open_session("motor", "COM4").await;
    mock.respond_with(|command| match command {
        "Prog 0" => Some("P00>".to_string()),
        "DRIVE X" => Some("DRIVE ON".to_string()),
        "DRIVE Y" => Some("DRIVE OFF".to_string()),
        _ => None,
    })
    .await;
    let f = fixture(session);

    f.machine.request(LoopState::Init);
    f.machine.step().await;

    let snapshot = f.machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Idle);
    assert_eq!(snapshot.axis1, Some(false));
}

#[tokio::test]
async fn test_loop_publishes_position() {
    let (session, mock) = open_session("motor", "COM4").await;
    let (x, y) = home_counts();
    scripted_positioner(&mock, x, y).await;
    let f = fixture(session);

    f.machine.request(LoopState::Init);
    f.machine.step().await;
    f.machine.step().await;

    let expected = Position {
        azimuth: 0.0,
        elevation: 90.0,
    };
    assert_eq!(f.machine.snapshot().position, Some(expected));
    assert_eq!(f.plot.lock().await.position, Some(expected));
    assert_eq!(*f.published.lock().unwrap(), vec![expected]);
}

#[tokio::test]
async fn test_garbled_encoder_reply_goes_idle() {
    let (session, mock) = open_session("motor", "COM4").await;
    let (x, y) = home_counts();
    scripted_positioner(&mock, x, y).await;
    let f = fixture(session);
    f.machine.request(LoopState::Init);
    f.machine.step().await;

    mock.reply("PRINT P6144", "12\r\n13\r\n").await;
    f.machine.step().await;

    let snapshot = f.machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Idle);
    assert!(!snapshot.inputs_enabled);
    assert!(f.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cleanup_releases_drives() {
    let (session, mock) = open_session("motor", "COM4").await;
    let (x, y) = home_counts();
    scripted_positioner(&mock, x, y).await;
    let f = fixture(session);
    f.machine.request(LoopState::Init);
    f.machine.step().await;
    mock.clear_writes().await;

    f.machine.request(LoopState::Cleanup);
    f.machine.step().await;

    assert_eq!(f.machine.snapshot().state, LoopState::Idle);
    assert_eq!(
        mock.writes().await,
        vec!["DRIVE OFF X Y", "DRIVE X", "DRIVE Y"]
    );
}

#[tokio::test]
async fn test_cleanup_now_on_closed_session() {
    let mock = MockAdapter::new("COM4");
    let f = fixture(mock_session("motor", &mock));
    f.machine.request(LoopState::Loop);

    f.machine.cleanup_now().await.unwrap();

    assert_eq!(f.machine.snapshot().state, LoopState::Idle);
    assert!(mock.writes().await.is_empty());
}

#[tokio::test]
async fn test_manual_moves() {
    let (session, mock) = open_session("motor", "COM4").await;
    let f = fixture(session);

    f.machine.jog(Axis::Azimuth, 5.0).await.unwrap();
    f.machine.jog(Axis::Elevation, -2.5).await.unwrap();
    f.machine.point(120.0, -5.0).await.unwrap();
    f.machine.park().await.unwrap();
    f.machine.halt().await.unwrap();

    assert_eq!(
        mock.writes().await,
        vec![
            "jog inc x 5",
            "jog inc y -2.5",
            "jog abs x 120 y -5",
            "jog abs x 0 y 0",
            "JOG OFF X Y",
        ]
    );
}

#[tokio::test]
async fn test_point_out_of_range_writes_nothing() {
    let (session, mock) = open_session("motor", "COM4").await;
    let f = fixture(session);

    let err = f.machine.point(90.0, 45.0).await.unwrap_err();
    assert!(matches!(err, StationError::Range { .. }));
    assert!(f.machine.point(400.0, 0.0).await.is_err());
    assert!(mock.writes().await.is_empty());
}

#[tokio::test]
async fn test_request_notifies_only_on_change() {
    let f = fixture(mock_session("motor", &MockAdapter::new("COM4")));
    let mut rx = f.machine.subscribe();
    rx.borrow_and_update();

    f.machine.request(LoopState::Cleanup);
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().state, LoopState::Cleanup);

    f.machine.request(LoopState::Cleanup);
    assert!(!rx.has_changed().unwrap());
}
