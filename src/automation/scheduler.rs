//! In-process job scheduler with pause/resume, coalescing and instance limits.
//!
//! Jobs live in a store until their trigger is exhausted or they are removed. The run loop
//! sleeps until the earliest fire time (or a wake-up from `add_job`/`resume`), then hands
//! due jobs to a worker pool bounded by a [`Semaphore`].
//!
//! While paused nothing fires. Fire times that pass during a pause are *missed*: with
//! `coalesce` they collapse into a single run on resume, otherwise each one is dispatched.
//! A fire time later than `misfire_grace` is dropped instead of run.
//! A dispatch is skipped when the job already has `max_instances` runs in flight or queued.

use crate::config::AutomationConfig;
use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_WAIT: Duration = Duration::from_secs(1);

/// When a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trigger {
    /// Once at a wall-clock time
    Once(DateTime<Local>),
    /// Every `every`, first at `start + every`
    #[allow(missing_docs)]
    Interval {
        start: DateTime<Local>,
        every: Duration,
    },
}

impl Trigger {
    fn first_fire(&self) -> Option<DateTime<Local>> {
        match *self {
            Trigger::Once(at) => Some(at),
            Trigger::Interval { start, every } => {
                chrono::Duration::from_std(every).ok().map(|step| start + step)
            }
        }
    }

    /// Fire time following `previous`, if any.
    fn next_after(&self, previous: DateTime<Local>) -> Option<DateTime<Local>> {
        match *self {
            Trigger::Once(_) => None,
            Trigger::Interval { every, .. } => chrono::Duration::from_std(every)
                .ok()
                .filter(|step| *step > chrono::Duration::zero())
                .map(|step| previous + step),
        }
    }
}

/// Work run by a job
pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    id: Uuid,
    name: String,
    trigger: Trigger,
    next_run: Option<DateTime<Local>>,
    action: JobAction,
    instances: Arc<AtomicUsize>,
}

/// Read-only view of a stored job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct JobInfo {
    pub id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    pub next_run: Option<DateTime<Local>>,
}

/// Scheduler policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPolicy {
    /// Worker pool size
    pub workers: usize,
    /// Collapse missed fire times into one run
    pub coalesce: bool,
    /// Runs in flight or queued per job
    pub max_instances: usize,
    /// How late a fire time may still run
    pub misfire_grace: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from(&AutomationConfig::default())
    }
}

impl From<&AutomationConfig> for SchedulerPolicy {
    fn from(config: &AutomationConfig) -> Self {
        Self {
            workers: config.thread_max_workers.max(1),
            coalesce: config.coalesce,
            max_instances: config.job_max_instances.max(1),
            misfire_grace: config.misfire_grace,
        }
    }
}

/// Job store and run loop
pub struct JobScheduler {
    policy: SchedulerPolicy,
    jobs: Mutex<Vec<Job>>,
    paused: AtomicBool,
    wake: Notify,
    workers: Arc<Semaphore>,
}

impl JobScheduler {
    /// A paused scheduler with an empty store.
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(policy.workers)),
            policy,
            jobs: Mutex::new(Vec::new()),
            paused: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    /// Policy the scheduler was built with
    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    /// Store a job; returns its id.
    pub async fn add_job(&self, name: impl Into<String>, trigger: Trigger, action: JobAction) -> Uuid {
        let job = Job {
            id: Uuid::new_v4(),
            name: name.into(),
            trigger,
            next_run: trigger.first_fire(),
            action,
            instances: Arc::new(AtomicUsize::new(0)),
        };
        let id = job.id;
        debug!(%id, name = %job.name, next_run = ?job.next_run, "job added");
        self.jobs.lock().await.push(job);
        self.wake.notify_one();
        id
    }

    /// Remove one job; returns whether it was stored.
    pub async fn remove_job(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        before != jobs.len()
    }

    /// Empty the store. Runs already dispatched are not cancelled.
    pub async fn remove_all(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.len();
        jobs.clear();
        removed
    }

    /// Stored jobs
    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .lock()
            .await
            .iter()
            .map(|job| JobInfo {
                id: job.id,
                name: job.name.clone(),
                trigger: job.trigger,
                next_run: job.next_run,
            })
            .collect()
    }

    /// Stop dispatching until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused");
    }

    /// Dispatch again; fire times missed while paused follow the coalesce policy
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        info!("scheduler resumed");
    }

    /// Whether dispatching is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Dispatch everything due at `now` and return the earliest remaining fire time.
    pub async fn tick(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        if self.is_paused() {
            return None;
        }
        let mut due = Vec::new();
        {
            let mut jobs = self.jobs.lock().await;
            for job in jobs.iter_mut() {
                let mut missed = 0usize;
                let mut misfired = 0usize;
                while let Some(at) = job.next_run.filter(|at| *at <= now) {
                    if self.within_grace(at, now) {
                        missed += 1;
                    } else {
                        misfired += 1;
                    }
                    job.next_run = job.trigger.next_after(at);
                }
                if misfired > 0 {
                    warn!(
                        job = %job.name,
                        misfired,
                        grace = ?self.policy.misfire_grace,
                        "run time missed by more than the misfire grace"
                    );
                }
                if missed > 0 {
                    let runs = if self.policy.coalesce { 1 } else { missed };
                    if missed > 1 {
                        debug!(job = %job.name, missed, runs, "missed fire times");
                    }
                    due.push((job.name.clone(), job.action.clone(), job.instances.clone(), runs));
                }
            }
            jobs.retain(|job| job.next_run.is_some());
        }

        for (name, action, instances, runs) in due {
            for _ in 0..runs {
                self.dispatch(&name, action.clone(), instances.clone());
            }
        }

        self.jobs.lock().await.iter().filter_map(|job| job.next_run).min()
    }

    fn within_grace(&self, at: DateTime<Local>, now: DateTime<Local>) -> bool {
        (now - at)
            .to_std()
            .map_or(true, |late| late <= self.policy.misfire_grace)
    }

    fn dispatch(&self, name: &str, action: JobAction, instances: Arc<AtomicUsize>) {
        let running = instances.fetch_add(1, Ordering::SeqCst);
        if running >= self.policy.max_instances {
            instances.fetch_sub(1, Ordering::SeqCst);
            warn!(
                job = %name,
                max_instances = self.policy.max_instances,
                "run skipped: maximum number of running instances reached"
            );
            return;
        }

        let workers = self.workers.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match workers.acquire_owned().await {
                Ok(_permit) => {
                    info!(job = %name, "job started");
                    action().await;
                    debug!(job = %name, "job finished");
                }
                Err(_) => warn!(job = %name, "worker pool closed"),
            }
            instances.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Run the loop until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Local::now();
            let wait = match self.tick(now).await {
                Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO).min(MAX_WAIT),
                None => MAX_WAIT,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.workers.close();
        info!("scheduler loop stopped");
    }
}
