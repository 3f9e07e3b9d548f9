//! Measurement state machine driven step by step against a scripted analyzer.

mod common;

use common::{mock_session, open_session, scripted_analyzer};
use spectrum_monitor::adapters::MockAdapter;
use spectrum_monitor::config::TimingConfig;
use spectrum_monitor::core::{display_lock, LoopState};
use spectrum_monitor::instrument::MeasurementMachine;
use spectrum_monitor::sequencer::{Registry, Sequencer};
use spectrum_monitor::session::Session;
use std::sync::Arc;
use tokio::sync::Notify;

fn machine(session: Arc<Session>) -> MeasurementMachine {
    let sequencer = Arc::new(Sequencer::new(Registry::standard(), display_lock()));
    MeasurementMachine::new(session, sequencer, &TimingConfig::default())
}

async fn looping() -> (MeasurementMachine, MockAdapter) {
    let (session, mock) = open_session("instrument", "ADDR1").await;
    scripted_analyzer(&mock).await;
    let machine = machine(session);
    machine.request(LoopState::Init);
    machine.step().await;
    assert_eq!(machine.snapshot().state, LoopState::Loop);
    mock.clear_writes().await;
    (machine, mock)
}

#[tokio::test]
async fn test_init_resets_then_refreshes() {
    let (session, mock) = open_session("instrument", "ADDR1").await;
    scripted_analyzer(&mock).await;
    let machine = machine(session);

    machine.step().await;
    assert_eq!(machine.snapshot().state, LoopState::Idle);
    assert!(mock.writes().await.is_empty());

    machine.request(LoopState::Init);
    machine.step().await;

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Loop);
    assert!(snapshot.inputs_enabled);

    let writes = mock.writes().await;
    assert_eq!(&writes[..4], &["*RST", "*WAI", ":INIT:CONT OFF", ":SYST:ERR:PUP?"]);
    assert_eq!(writes.len(), 4 + 26);
}

#[tokio::test]
async fn test_init_without_session_goes_idle() {
    let mock = MockAdapter::new("ADDR1");
    let machine = machine(mock_session("instrument", &mock));

    machine.request(LoopState::Init);
    machine.step().await;

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Idle);
    assert!(!snapshot.inputs_enabled);
}

#[tokio::test]
async fn test_failed_init_reads_error_queue() {
    let (session, mock) = open_session("instrument", "ADDR1").await;
    scripted_analyzer(&mock).await;
    mock.fail_on("*RST").await;
    let machine = machine(session);

    machine.request(LoopState::Init);
    machine.step().await;

    assert_eq!(machine.snapshot().state, LoopState::Idle);
    assert_eq!(mock.writes().await, vec!["*RST", ":SYST:ERR?"]);
}

#[tokio::test]
async fn test_single_sweep_fires_once() {
    let (machine, mock) = looping().await;

    machine.single_sweep();
    machine.step().await;
    assert!(!machine.snapshot().single);
    assert_eq!(mock.writes().await, vec![":STAT:OPER:COND?", ":INIT:SAN"]);

    mock.clear_writes().await;
    machine.step().await;
    assert!(mock.writes().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_check_and_trigger_share_one_lock() {
    let (session, mock) = open_session("instrument", "ADDR1").await;
    scripted_analyzer(&mock).await;
    let machine = machine(session.clone());
    machine.request(LoopState::Init);
    machine.step().await;
    mock.clear_writes().await;

    let status_read = Arc::new(Notify::new());
    let signal = status_read.clone();
    mock.respond_with(move |command| match command {
        ":STAT:OPER:COND?" => {
            signal.notify_one();
            Some("+0".to_string())
        }
        other if other.ends_with('?') => Some("0".to_string()),
        _ => None,
    })
    .await;

    // Queues for the lock while the status reply is still being read
    let competitor = tokio::spawn({
        let session = session.clone();
        async move {
            status_read.notified().await;
            session.write("*CLS").await
        }
    });

    machine.set_continuous(true);
    machine.step().await;
    competitor.await.unwrap().unwrap();

    assert_eq!(
        mock.writes().await,
        vec![":STAT:OPER:COND?", ":INIT:SAN", "*CLS"]
    );
}

#[tokio::test]
async fn test_busy_instrument_is_not_retriggered() {
    let (machine, mock) = looping().await;
    mock.reply(":STAT:OPER:COND?", "+8").await;

    machine.set_continuous(true);
    machine.step().await;

    assert_eq!(mock.writes().await, vec![":STAT:OPER:COND?"]);
    assert!(machine.snapshot().continuous);
}

#[tokio::test]
async fn test_status_timeout_keeps_looping() {
    let (session, mock) = open_session("instrument", "ADDR1").await;
    scripted_analyzer(&mock).await;
    let machine = machine(session);
    machine.request(LoopState::Init);
    machine.step().await;

    // Silence the status register only
    mock.respond_with(|command| match command {
        ":STAT:OPER:COND?" => None,
        other if other.ends_with('?') => Some("0".to_string()),
        _ => None,
    })
    .await;

    machine.set_continuous(true);
    machine.step().await;

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Loop);
    assert!(!snapshot.continuous);
    assert!(snapshot.inputs_enabled);
}

#[tokio::test]
async fn test_fatal_status_error_goes_idle() {
    let (machine, mock) = looping().await;
    mock.fail_on(":STAT:OPER:COND?").await;

    machine.set_continuous(true);
    machine.step().await;

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.state, LoopState::Idle);
    assert!(!snapshot.continuous);
    assert!(!snapshot.inputs_enabled);
}

#[tokio::test]
async fn test_closed_session_in_loop_goes_idle() {
    let (machine, mock) = looping().await;
    mock.disconnect();
    // The drop surfaces as a connection error on the next status read
    machine.set_continuous(true);
    machine.step().await;

    assert_eq!(machine.snapshot().state, LoopState::Idle);
}

#[tokio::test]
async fn test_request_notifies_only_on_change() {
    let machine = machine(mock_session("instrument", &MockAdapter::new("ADDR1")));
    let mut rx = machine.subscribe();
    rx.borrow_and_update();

    machine.request(LoopState::Init);
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().state, LoopState::Init);

    machine.request(LoopState::Init);
    assert!(!rx.has_changed().unwrap());
}
