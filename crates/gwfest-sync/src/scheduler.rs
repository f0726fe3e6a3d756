//! Explicitly owned job scheduler with per-job single-instance and misfire rules.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler backend: {0}")]
    Backend(#[from] JobSchedulerError),
    #[error("scheduler was stopped and cannot be restarted")]
    Stopped,
    #[error("invalid trigger for job {job_id}: {reason}")]
    InvalidTrigger { job_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every day at a wall-clock time in `tz`.
    Daily { at: NaiveTime, tz: Tz },
    /// Fixed interval, first firing one period after registration.
    Every(Duration),
    /// Single firing at an absolute instant.
    Once(DateTime<Utc>),
}

impl Trigger {
    /// Most recent instant at or before `now` this trigger was due, if any.
    /// `registered_at` anchors interval triggers.
    pub fn last_due(&self, registered_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Trigger::Daily { at, tz } => {
                let today = now.with_timezone(&tz).date_naive();
                let due_on = |day: chrono::NaiveDate| {
                    tz.from_local_datetime(&day.and_time(at))
                        .earliest()
                        .map(|t| t.with_timezone(&Utc))
                };
                match due_on(today) {
                    Some(due) if due <= now => Some(due),
                    _ => today.checked_sub_days(Days::new(1)).and_then(due_on),
                }
            }
            Trigger::Every(period) => {
                let period = chrono::Duration::from_std(period).ok()?;
                if period <= chrono::Duration::zero() || now < registered_at + period {
                    return None;
                }
                let elapsed = now - registered_at;
                let periods = elapsed.num_milliseconds() / period.num_milliseconds();
                let periods = i32::try_from(periods).ok()?;
                Some(registered_at + period * periods)
            }
            Trigger::Once(at) => (at <= now).then_some(at),
        }
    }
}

/// Misfire admission: a firing later than `misfire_grace` past its due
/// instant is dropped. `None` admits every firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FiringPolicy {
    pub misfire_grace: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Run,
    Misfired { late_by: Duration },
}

impl FiringPolicy {
    pub fn admit(&self, due: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Admission {
        let (Some(grace), Some(due)) = (self.misfire_grace, due) else {
            return Admission::Run;
        };
        let late_by = (now - due).to_std().unwrap_or_default();
        if late_by > grace {
            Admission::Misfired { late_by }
        } else {
            Admission::Run
        }
    }
}

/// Held while a job body runs; clears the per-job flag on drop.
struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
struct RegisteredJob {
    backend_id: Uuid,
    running: Arc<AtomicBool>,
}

struct Inner {
    backend: JobScheduler,
    state: SchedulerState,
    jobs: HashMap<String, RegisteredJob>,
}

/// Wraps [`JobScheduler`] with string job ids, replace-on-add, at most one
/// concurrent execution per id, misfire grace and a non-blocking stop.
#[derive(Clone)]
pub struct CrawlScheduler {
    inner: Arc<Mutex<Inner>>,
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

impl CrawlScheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        let backend = JobScheduler::new().await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                backend,
                state: SchedulerState::Idle,
                jobs: HashMap::new(),
            })),
        })
    }

    pub async fn state(&self) -> SchedulerState {
        self.inner.lock().await.state
    }

    pub async fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registers `handler` under `job_id`, replacing any job already holding
    /// that id. The replacement shares the single-instance flag, so a run of
    /// the old registration still blocks the new one.
    pub async fn add_job<F, Fut>(
        &self,
        job_id: &str,
        trigger: Trigger,
        policy: FiringPolicy,
        handler: F,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;

        let running = match inner.jobs.remove(job_id) {
            Some(previous) => {
                inner.backend.remove(&previous.backend_id).await?;
                debug!(job_id, "replacing existing job registration");
                previous.running
            }
            None => Arc::new(AtomicBool::new(false)),
        };

        let registered_at = Utc::now();
        let handler = Arc::new(handler);
        let run = {
            let running = running.clone();
            let job_id = job_id.to_string();
            move |_uuid: Uuid, _backend: JobScheduler| -> JobFuture {
                let running = running.clone();
                let handler = handler.clone();
                let job_id = job_id.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    if let Admission::Misfired { late_by } =
                        policy.admit(trigger.last_due(registered_at, now), now)
                    {
                        debug!(job_id, late_by_secs = late_by.as_secs(), "misfire beyond grace; skipping");
                        return;
                    }
                    let Some(_guard) = RunningGuard::acquire(&running) else {
                        debug!(job_id, "previous run still active; skipping");
                        return;
                    };
                    handler().await;
                })
            }
        };

        let job = match trigger {
            Trigger::Daily { at, tz } => {
                let cron = format!("{} {} {} * * *", at.second(), at.minute(), at.hour());
                Job::new_async_tz(cron.as_str(), tz, run)?
            }
            Trigger::Every(period) => {
                if period < Duration::from_secs(1) {
                    return Err(SchedulerError::InvalidTrigger {
                        job_id: job_id.to_string(),
                        reason: "interval must be at least one second".into(),
                    });
                }
                Job::new_repeated_async(period, run)?
            }
            Trigger::Once(at) => {
                let delay = (at - registered_at).to_std().unwrap_or_default();
                Job::new_one_shot_async(delay, run)?
            }
        };

        let backend_id = inner.backend.add(job).await?;
        inner.jobs.insert(
            job_id.to_string(),
            RegisteredJob {
                backend_id,
                running,
            },
        );
        info!(job_id, ?trigger, "job registered");
        Ok(backend_id)
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.remove(job_id) {
            Some(job) => {
                inner.backend.remove(&job.backend_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn next_run(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get(job_id) else {
            return Ok(None);
        };
        let mut backend = inner.backend.clone();
        Ok(backend.next_tick_for_job(job.backend_id).await?)
    }

    /// Begins dispatching. Starting a running scheduler is a no-op; a stopped
    /// one cannot be restarted.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SchedulerState::Running => Ok(()),
            SchedulerState::Stopped => Err(SchedulerError::Stopped),
            SchedulerState::Idle => {
                inner.backend.start().await?;
                inner.state = SchedulerState::Running;
                info!(jobs = inner.jobs.len(), "scheduler started");
                Ok(())
            }
        }
    }

    /// Stops dispatching without waiting for in-flight runs. Never fails.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != SchedulerState::Running {
            debug!(state = ?inner.state, "stop requested while not running");
            return;
        }
        if let Err(err) = inner.backend.shutdown().await {
            warn!(error = %err, "scheduler backend shutdown reported an error");
        }
        inner.state = SchedulerState::Stopped;
        info!("scheduler stopped");
    }
}
