//! Timer engine for schedule firings.
//!
//! Wraps a [`JobScheduler`] and owns the mapping from product id to its
//! recurring job. The mapping is a projection of the `Playing` schedule rows
//! and can always be rebuilt from them (see `PriceTrackingService::reconcile`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricetrack_core::CronExpression;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Body of a recurring job, invoked once per tick.
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Callback invoked on every tick of a product's timer.
#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self, product_id: Uuid);
}

/// The cron engine timers are registered with.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn add(&self, cron: &CronExpression, task: JobTask) -> Result<Uuid, JobSchedulerError>;
    async fn remove(&self, job_id: Uuid) -> Result<(), JobSchedulerError>;
    async fn next_tick(&self, job_id: Uuid) -> Result<Option<DateTime<Utc>>, JobSchedulerError>;
    async fn start(&self) -> Result<(), JobSchedulerError>;
    async fn shutdown(&self) -> Result<(), JobSchedulerError>;
}

/// [`JobRunner`] backed by `tokio-cron-scheduler`. Ticks fire in UTC.
pub struct CronJobRunner {
    inner: JobScheduler,
}

impl CronJobRunner {
    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the underlying scheduler cannot be
    /// initialised.
    pub async fn new() -> Result<Self, JobSchedulerError> {
        Ok(Self {
            inner: JobScheduler::new().await?,
        })
    }
}

#[async_trait]
impl JobRunner for CronJobRunner {
    async fn add(&self, cron: &CronExpression, task: JobTask) -> Result<Uuid, JobSchedulerError> {
        let job = Job::new_async(cron.to_job_schedule().as_str(), move |_uuid, _lock| task())?;
        self.inner.add(job).await
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), JobSchedulerError> {
        self.inner.remove(&job_id).await
    }

    async fn next_tick(&self, job_id: Uuid) -> Result<Option<DateTime<Utc>>, JobSchedulerError> {
        let mut inner = self.inner.clone();
        inner.next_tick_for_job(job_id).await
    }

    async fn start(&self) -> Result<(), JobSchedulerError> {
        self.inner.start().await
    }

    async fn shutdown(&self) -> Result<(), JobSchedulerError> {
        let mut inner = self.inner.clone();
        inner.shutdown().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Fired,
    /// A previous firing for the same product was still running.
    Skipped,
    NotRegistered,
}

struct Timer {
    job_id: Uuid,
    cron: CronExpression,
    handler: Arc<dyn TickHandler>,
}

pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    timers: Mutex<HashMap<Uuid, Timer>>,
    /// One firing guard per product, held for the duration of a firing.
    /// Guards outlive timers: a timer registered after a cancel still sees a
    /// firing started by the one it replaced.
    guards: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Scheduler {
    /// Creates the scheduler without starting it. Jobs added before
    /// [`Scheduler::start`] begin ticking once it is called.
    ///
    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the underlying scheduler cannot be
    /// initialised.
    pub async fn new() -> Result<Self, JobSchedulerError> {
        Ok(Self::with_runner(Arc::new(CronJobRunner::new().await?)))
    }

    #[must_use]
    pub fn with_runner(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            timers: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the scheduler fails to start.
    pub async fn start(&self) -> Result<(), JobSchedulerError> {
        self.runner.start().await
    }

    /// Stops all timers. In-flight firings run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the scheduler fails to shut down.
    pub async fn shutdown(&self) -> Result<(), JobSchedulerError> {
        self.runner.shutdown().await?;
        self.timers.lock().await.clear();
        tracing::info!("scheduler: shut down");
        Ok(())
    }

    async fn guard_for(&self, product_id: Uuid) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        Arc::clone(guards.entry(product_id).or_default())
    }

    /// Registers a recurring timer for `product_id`.
    ///
    /// Idempotent: returns `Ok(false)` without touching anything if the
    /// product already has a timer.
    ///
    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the job cannot be created or added.
    pub async fn register(
        &self,
        product_id: Uuid,
        cron: &CronExpression,
        handler: Arc<dyn TickHandler>,
    ) -> Result<bool, JobSchedulerError> {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(&product_id) {
            return Ok(false);
        }

        let running = self.guard_for(product_id).await;
        let task: JobTask = {
            let handler = Arc::clone(&handler);
            Arc::new(move || -> JobFuture {
                let handler = Arc::clone(&handler);
                let running = Arc::clone(&running);
                Box::pin(async move {
                    run_guarded(product_id, &running, handler.as_ref()).await;
                })
            })
        };
        let job_id = self.runner.add(cron, task).await?;

        timers.insert(
            product_id,
            Timer {
                job_id,
                cron: cron.clone(),
                handler,
            },
        );
        tracing::info!(%product_id, cron = %cron, %job_id, "scheduler: timer registered");
        Ok(true)
    }

    /// Removes the product's timer so no future tick fires. A firing that is
    /// already running is left to finish.
    ///
    /// Returns `false` if the product had no timer.
    ///
    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the job cannot be removed from the
    /// underlying scheduler. The timer then stays registered so the cancel
    /// can be retried.
    pub async fn cancel(&self, product_id: Uuid) -> Result<bool, JobSchedulerError> {
        let mut timers = self.timers.lock().await;
        let Some(job_id) = timers.get(&product_id).map(|t| t.job_id) else {
            return Ok(false);
        };
        self.runner.remove(job_id).await?;
        timers.remove(&product_id);
        tracing::info!(%product_id, %job_id, "scheduler: timer cancelled");
        Ok(true)
    }

    /// Runs the product's handler now, under the same no-overlap rule as a
    /// scheduled tick.
    pub async fn trigger(&self, product_id: Uuid) -> TickOutcome {
        let handler = match self.timers.lock().await.get(&product_id) {
            Some(timer) => Arc::clone(&timer.handler),
            None => return TickOutcome::NotRegistered,
        };
        let running = self.guard_for(product_id).await;
        run_guarded(product_id, &running, handler.as_ref()).await
    }

    /// Next tick of the product's timer, if it has one.
    pub async fn next_run(&self, product_id: Uuid) -> Option<DateTime<Utc>> {
        let job_id = self.timers.lock().await.get(&product_id)?.job_id;
        match self.runner.next_tick(job_id).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(%product_id, error = %e, "scheduler: failed to read next tick");
                None
            }
        }
    }

    pub async fn is_registered(&self, product_id: Uuid) -> bool {
        self.timers.lock().await.contains_key(&product_id)
    }

    pub async fn cron_for(&self, product_id: Uuid) -> Option<CronExpression> {
        self.timers
            .lock()
            .await
            .get(&product_id)
            .map(|t| t.cron.clone())
    }

    pub async fn registered_ids(&self) -> Vec<Uuid> {
        self.timers.lock().await.keys().copied().collect()
    }

    /// Adds a recurring job that is not tied to a product, e.g. the
    /// reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns [`JobSchedulerError`] if the job cannot be created or added.
    pub async fn register_maintenance_job<F, Fut>(
        &self,
        name: &'static str,
        cron: &CronExpression,
        task: F,
    ) -> Result<Uuid, JobSchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let job: JobTask = Arc::new(move || -> JobFuture {
            let task = Arc::clone(&task);
            Box::pin(async move {
                tracing::debug!(job = name, "scheduler: maintenance job starting");
                (*task)().await;
            })
        });
        let job_id = self.runner.add(cron, job).await?;
        tracing::info!(job = name, cron = %cron, %job_id, "scheduler: maintenance job registered");
        Ok(job_id)
    }
}

/// Skip policy: a tick that finds the previous firing still running is
/// dropped, not queued.
async fn run_guarded(
    product_id: Uuid,
    running: &Arc<Mutex<()>>,
    handler: &dyn TickHandler,
) -> TickOutcome {
    let Ok(_guard) = Arc::clone(running).try_lock_owned() else {
        tracing::warn!(%product_id, "scheduler: previous firing still running; skipping tick");
        return TickOutcome::Skipped;
    };
    handler.on_tick(product_id).await;
    TickOutcome::Fired
}

/// Real runner whose `add` and `remove` can be made to fail.
#[cfg(test)]
pub(crate) struct FlakyRunner {
    real: CronJobRunner,
    fail_add: std::sync::atomic::AtomicBool,
    fail_remove: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyRunner {
    pub async fn new() -> Self {
        Self {
            real: CronJobRunner::new().await.expect("runner"),
            fail_add: std::sync::atomic::AtomicBool::new(false),
            fail_remove: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_fail_add(&self, fail: bool) {
        self.fail_add.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl JobRunner for FlakyRunner {
    async fn add(&self, cron: &CronExpression, task: JobTask) -> Result<Uuid, JobSchedulerError> {
        if self.fail_add.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(JobSchedulerError::CantAdd);
        }
        self.real.add(cron, task).await
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), JobSchedulerError> {
        if self.fail_remove.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(JobSchedulerError::CantRemove);
        }
        self.real.remove(job_id).await
    }

    async fn next_tick(&self, job_id: Uuid) -> Result<Option<DateTime<Utc>>, JobSchedulerError> {
        self.real.next_tick(job_id).await
    }

    async fn start(&self) -> Result<(), JobSchedulerError> {
        self.real.start().await
    }

    async fn shutdown(&self) -> Result<(), JobSchedulerError> {
        self.real.shutdown().await
    }
}
