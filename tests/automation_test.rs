//! Automation queue and scheduler working together in real time.

use async_trait::async_trait;
use chrono::Local;
use spectrum_monitor::automation::{
    Automation, AutomationState, JobScheduler, ScheduleHooks, SchedulerPolicy,
};
use spectrum_monitor::{AppResult, StationError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct CountingHooks {
    init: AtomicUsize,
    runs: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl ScheduleHooks for CountingHooks {
    async fn init_schedule(&self) -> AppResult<()> {
        self.init.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_schedule(&self) -> AppResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StationError::Script("onSchedule: boom".into()));
        }
        Ok(())
    }
}

struct Running {
    automation: Automation,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    fn start() -> Self {
        let scheduler = Arc::new(JobScheduler::new(SchedulerPolicy::default()));
        let automation = Automation::new(scheduler.clone());
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(rx));
        Self {
            automation,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("scheduler loop did not stop")
            .unwrap();
    }
}

fn in_millis(ms: i64) -> chrono::DateTime<Local> {
    Local::now() + chrono::Duration::milliseconds(ms)
}

#[tokio::test]
async fn test_each_queued_time_runs_once() {
    let running = Running::start();
    let hooks = Arc::new(CountingHooks::default());
    running.automation.enqueue(in_millis(200)).await.unwrap();
    running.automation.enqueue(in_millis(400)).await.unwrap();

    running.automation.start(hooks.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(hooks.init.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.runs.load(Ordering::SeqCst), 2);
    assert!(running.automation.scheduler().jobs().await.is_empty());

    running.automation.stop().await.unwrap();
    assert!(running.automation.queue().await.is_empty());
    running.stop().await;
}

#[tokio::test]
async fn test_times_missed_during_pause_still_run_once_each() {
    let running = Running::start();
    let hooks = Arc::new(CountingHooks::default());
    running.automation.enqueue(in_millis(150)).await.unwrap();
    running.automation.enqueue(in_millis(250)).await.unwrap();
    running.automation.start(hooks.clone()).await.unwrap();

    let scheduler = running.automation.scheduler().clone();
    scheduler.pause();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hooks.runs.load(Ordering::SeqCst), 0);

    scheduler.resume();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hooks.runs.load(Ordering::SeqCst), 2);
    running.stop().await;
}

#[tokio::test]
async fn test_time_queued_long_ago_is_not_run_on_start() {
    let running = Running::start();
    let hooks = Arc::new(CountingHooks::default());
    running
        .automation
        .enqueue(Local::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    running.automation.enqueue(in_millis(200)).await.unwrap();
    running.automation.start(hooks.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hooks.runs.load(Ordering::SeqCst), 1);
    running.stop().await;
}

#[tokio::test]
async fn test_stop_drops_past_and_keeps_future_times() {
    let running = Running::start();
    let hooks = Arc::new(CountingHooks::default());
    let later = Local::now() + chrono::Duration::hours(1);
    running.automation.enqueue(in_millis(100)).await.unwrap();
    running.automation.enqueue(later).await.unwrap();
    running.automation.start(hooks.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    running.automation.stop().await.unwrap();

    let snapshot = running.automation.snapshot();
    assert_eq!(snapshot.state, AutomationState::Idle);
    assert_eq!(snapshot.queued, 1);
    assert_eq!(running.automation.queue().await, vec![later]);
    assert!(running.automation.scheduler().jobs().await.is_empty());
    assert!(running.automation.scheduler().is_paused());
    running.stop().await;
}

#[tokio::test]
async fn test_failing_hook_does_not_cancel_later_runs() {
    let running = Running::start();
    let hooks = Arc::new(CountingHooks {
        fail: true,
        ..CountingHooks::default()
    });
    running.automation.enqueue(in_millis(100)).await.unwrap();
    running.automation.enqueue(in_millis(250)).await.unwrap();
    running.automation.start(hooks.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hooks.runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        running.automation.snapshot().state,
        AutomationState::Active
    );
    running.stop().await;
}

#[tokio::test]
async fn test_range_and_clear_while_idle() {
    let running = Running::start();
    let start = Local::now() + chrono::Duration::hours(1);
    let added = running
        .automation
        .enqueue_range(start, start + chrono::Duration::hours(2), Duration::from_secs(1800))
        .await
        .unwrap();
    assert_eq!(added, 4);
    assert_eq!(running.automation.snapshot().queued, 4);

    running.automation.clear_queue().await.unwrap();
    assert_eq!(running.automation.snapshot().queued, 0);
    running.stop().await;
}
