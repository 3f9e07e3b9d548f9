//! Scheduled automation: a queue of fire times that run user hooks.
//!
//! The queue is editable only while automation is idle. Starting runs `initSchedule`
//! once in its own task and turns every queued time into a one-shot job that runs
//! `onSchedule`. Stopping pauses the scheduler, forgets past times and empties the
//! job store; future times stay queued for the next start.

pub mod queue;
pub mod scheduler;

pub use queue::ScheduleQueue;
pub use scheduler::{JobAction, JobInfo, JobScheduler, SchedulerPolicy, Trigger};

use crate::error::{AppResult, StationError};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

/// User routines run by the scheduler
#[async_trait]
pub trait ScheduleHooks: Send + Sync {
    /// Runs once when automation starts
    async fn init_schedule(&self) -> AppResult<()>;
    /// Runs at every queued time
    async fn on_schedule(&self) -> AppResult<()>;
}

/// Whether scheduled jobs are armed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AutomationState {
    /// Queue editable, no jobs stored
    #[default]
    Idle,
    /// Jobs stored and the scheduler running
    Active,
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationState::Idle => f.write_str("IDLE"),
            AutomationState::Active => f.write_str("ACTIVE"),
        }
    }
}

/// Automation state as seen by the status monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutomationSnapshot {
    /// Idle or active
    pub state: AutomationState,
    /// Times still queued
    pub queued: usize,
}

/// Queue plus scheduler, started and stopped as a unit
pub struct Automation {
    scheduler: Arc<JobScheduler>,
    queue: Mutex<ScheduleQueue>,
    state: watch::Sender<AutomationSnapshot>,
}

impl Automation {
    /// Idle automation driving `scheduler`, which is paused here.
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        scheduler.pause();
        let (state, _) = watch::channel(AutomationSnapshot::default());
        Self {
            scheduler,
            queue: Mutex::new(ScheduleQueue::new()),
            state,
        }
    }

    /// The underlying scheduler
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Current state and queue length
    pub fn snapshot(&self) -> AutomationSnapshot {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<AutomationSnapshot> {
        self.state.subscribe()
    }

    /// Queued times, ascending
    pub async fn queue(&self) -> Vec<DateTime<Local>> {
        self.queue.lock().await.times().to_vec()
    }

    /// Queue one time.
    pub async fn enqueue(&self, at: DateTime<Local>) -> AppResult<()> {
        self.edit(|queue| {
            queue.enqueue(at);
            Ok(())
        })
        .await
    }

    /// Queue `start + k * interval` up to `end`; returns how many were added.
    pub async fn enqueue_range(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        interval: Duration,
    ) -> AppResult<usize> {
        self.edit(|queue| queue.enqueue_range(start, end, interval))
            .await
    }

    /// Empty the queue.
    pub async fn clear_queue(&self) -> AppResult<()> {
        self.edit(|queue| {
            queue.clear();
            Ok(())
        })
        .await
    }

    async fn edit<T>(&self, f: impl FnOnce(&mut ScheduleQueue) -> AppResult<T>) -> AppResult<T> {
        if self.snapshot().state == AutomationState::Active {
            return Err(StationError::Automation(
                "cannot edit queue while automation is active".into(),
            ));
        }
        let mut queue = self.queue.lock().await;
        let result = f(&mut queue)?;
        let queued = queue.len();
        self.state.send_modify(|s| s.queued = queued);
        Ok(result)
    }

    /// Arm one job per queued time and resume the scheduler.
    pub async fn start(&self, hooks: Arc<dyn ScheduleHooks>) -> AppResult<()> {
        if self.snapshot().state == AutomationState::Active {
            return Err(StationError::Automation("automation is already active".into()));
        }
        let queue = self.queue.lock().await;
        if queue.is_empty() {
            return Err(StationError::Automation("automation queue is empty".into()));
        }

        let init = hooks.clone();
        tokio::spawn(async move {
            if let Err(e) = init.init_schedule().await {
                error!(error = %e, "initSchedule failed");
            }
        });

        self.scheduler.pause();
        for at in queue.times() {
            let hooks = hooks.clone();
            let action: JobAction = Arc::new(move || {
                let hooks = hooks.clone();
                Box::pin(async move {
                    if let Err(e) = hooks.on_schedule().await {
                        error!(error = %e, "onSchedule failed");
                    }
                })
            });
            self.scheduler
                .add_job(format!("onSchedule@{}", at.format("%Y-%m-%d %H:%M:%S")), Trigger::Once(*at), action)
                .await;
        }
        self.scheduler.resume();

        let queued = queue.len();
        self.state.send_modify(|s| {
            s.state = AutomationState::Active;
            s.queued = queued;
        });
        info!(jobs = queued, "automation started");
        Ok(())
    }

    /// Pause, forget past times and drop every job. Stopping while idle is a no-op.
    pub async fn stop(&self) -> AppResult<()> {
        if self.snapshot().state == AutomationState::Idle {
            return Ok(());
        }
        self.scheduler.pause();
        let mut queue = self.queue.lock().await;
        let dropped = queue.drop_past(Local::now());
        let removed = self.scheduler.remove_all().await;

        let queued = queue.len();
        self.state.send_modify(|s| {
            s.state = AutomationState::Idle;
            s.queued = queued;
        });
        info!(dropped, removed, remaining = queued, "automation stopped");
        Ok(())
    }

    /// Start when idle, stop when active; returns the new state.
    pub async fn toggle(&self, hooks: Arc<dyn ScheduleHooks>) -> AppResult<AutomationState> {
        match self.snapshot().state {
            AutomationState::Idle => self.start(hooks).await?,
            AutomationState::Active => self.stop().await?,
        }
        Ok(self.snapshot().state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        init: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ScheduleHooks for Counting {
        async fn init_schedule(&self) -> AppResult<()> {
            self.init.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_schedule(&self) -> AppResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn automation() -> Automation {
        Automation::new(Arc::new(JobScheduler::new(SchedulerPolicy::default())))
    }

    #[tokio::test]
    async fn test_start_requires_queue() {
        let automation = automation();
        let err = automation.start(Arc::new(Counting::default())).await.unwrap_err();
        assert!(matches!(err, StationError::Automation(_)));
        assert_eq!(automation.snapshot().state, AutomationState::Idle);
    }

    #[tokio::test]
    async fn test_queue_locked_while_active() {
        let automation = automation();
        let later = Local::now() + chrono::Duration::hours(1);
        automation.enqueue(later).await.unwrap();
        automation.start(Arc::new(Counting::default())).await.unwrap();

        assert!(automation.enqueue(later).await.is_err());
        assert!(automation.clear_queue().await.is_err());
        assert!(automation.start(Arc::new(Counting::default())).await.is_err());
        assert_eq!(automation.scheduler().jobs().await.len(), 1);

        automation.stop().await.unwrap();
        assert!(automation.scheduler().jobs().await.is_empty());
        assert_eq!(automation.snapshot(), AutomationSnapshot { state: AutomationState::Idle, queued: 1 });
    }

    #[tokio::test]
    async fn test_toggle() {
        let automation = automation();
        automation
            .enqueue(Local::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let hooks: Arc<dyn ScheduleHooks> = Arc::new(Counting::default());
        assert_eq!(automation.toggle(hooks.clone()).await.unwrap(), AutomationState::Active);
        assert_eq!(automation.toggle(hooks).await.unwrap(), AutomationState::Idle);
    }
}
