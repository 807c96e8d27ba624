//! Job scheduler
//!
//! Cron jobs are entries in the [`CronEngine`]; task jobs are long-running
//! tokio tasks that retry with backoff. Both kinds hold a cancellation
//! token in `active` while they are scheduled, which is what stop, update
//! and remove cancel. Status changes are persisted as they happen:
//!
//! ```text
//! ready -> running -> done
//! running -> backoff -> running        (failed run)
//! running -> fatal                     (task, retry budget spent)
//! any -> stop                          (stop_job)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use oms_core::models::{InstanceStatus, Job, JobStatus, JobType, NewJob, Page, PageData, TaskInstance};
use oms_core::Inventory;
use oms_transport::CallContext;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::cron::{Clock, CronEngine, CronSchedule, SystemClock};
use super::executor::JobExecutor;
use super::logfile::{self, JobLog};
use crate::error::Result;

pub const LOOP_STATUS_ENTRY: &str = "build-in-loop-status";
pub const CLEAR_INSTANCES_ENTRY: &str = "build-in-clear-instances";
pub const LOOP_STATUS_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory holding one sub-directory of logs per job
    pub log_root: PathBuf,
    /// Age after which run history is cleared
    pub retention: Duration,
    pub backoff: BackoffPolicy,
    /// Attempts a task job gets before it turns fatal
    pub max_retries: u32,
}

impl SchedulerConfig {
    pub fn new(log_root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            log_root: log_root.into(),
            retention,
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Token of a scheduled job, tagged so a finished runner only clears itself
#[derive(Clone)]
struct Active {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Inventory>,
    executor: Arc<dyn JobExecutor>,
    engine: CronEngine,
    active: DashMap<i64, Active>,
    logs: DashMap<i64, Arc<JobLog>>,
    generation: AtomicU64,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

fn entry_name(job_id: i64) -> String {
    format!("job-{job_id}")
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Inventory>,
        executor: Arc<dyn JobExecutor>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_clock(store, executor, config, Arc::new(SystemClock), cancel)
    }

    pub fn with_clock(
        store: Arc<dyn Inventory>,
        executor: Arc<dyn JobExecutor>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                engine: CronEngine::new(clock, cancel.child_token()),
                active: DashMap::new(),
                logs: DashMap::new(),
                generation: AtomicU64::new(0),
                config,
                cancel,
            }),
        }
    }

    /// Register the build-in entries and start every persisted job.
    ///
    /// Jobs left `running` by a previous process are reset to `ready`
    /// first. Stopped and fatal jobs stay idle, as do finished tasks.
    pub fn init(&self) -> Result<usize> {
        self.register_builtins()?;

        let mut started = 0;
        for mut job in self.inner.store.list_jobs()? {
            if job.status == JobStatus::Running {
                self.inner.store.update_job_status(job.id, JobStatus::Ready)?;
                job.status = JobStatus::Ready;
            }
            let idle = match job.status {
                JobStatus::Stop | JobStatus::Fatal => true,
                JobStatus::Done => job.job_type == JobType::Task,
                _ => false,
            };
            if idle {
                continue;
            }
            match self.inner.schedule(&job) {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(job_id = job.id, name = %job.name, "failed to schedule job: {}", e),
            }
        }
        tracing::info!(started, "scheduler initialized");
        Ok(started)
    }

    fn register_builtins(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .engine
            .add(LOOP_STATUS_ENTRY, CronSchedule::Every(LOOP_STATUS_INTERVAL), move || {
                let inner = Arc::clone(&inner);
                async move {
                    match inner.executor.refresh_status().await {
                        Ok(up) => tracing::debug!(up, "host status refreshed"),
                        Err(e) => tracing::warn!("host status refresh failed: {}", e),
                    }
                }
            });

        let inner = Arc::clone(&self.inner);
        self.inner
            .engine
            .add(CLEAR_INSTANCES_ENTRY, CronSchedule::parse("@hourly")?, move || {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(e) = inner.clear_instances(None, None) {
                        tracing::warn!("clearing run history failed: {}", e);
                    }
                }
            });
        Ok(())
    }

    /// Validate, persist and start a new job
    pub fn create_job(&self, new: &NewJob) -> Result<Job> {
        check(new)?;
        let job = self.inner.store.insert_job(new)?;
        self.inner.schedule(&job)?;
        tracing::info!(job_id = job.id, name = %job.name, "job created");
        Ok(job)
    }

    /// Replace a job's definition and restart it
    pub fn update_job(&self, id: i64, new: &NewJob) -> Result<Job> {
        check(new)?;
        let old = self.inner.store.get_job(id)?;
        self.inner.unschedule(id);
        if old.name != new.name {
            self.inner.close_log(id);
        }
        self.inner.store.update_job(id, new)?;
        self.inner.store.update_job_status(id, JobStatus::Ready)?;
        let job = self.inner.store.get_job(id)?;
        self.inner.schedule(&job)?;
        Ok(job)
    }

    /// Schedule a job again; stopped, failed or finished jobs become ready
    pub fn start_job(&self, id: i64) -> Result<Job> {
        let mut job = self.inner.store.get_job(id)?;
        if matches!(job.status, JobStatus::Stop | JobStatus::Fatal | JobStatus::Done) {
            self.inner.store.update_job_status(id, JobStatus::Ready)?;
            job.status = JobStatus::Ready;
        }
        if !self.is_active(id) {
            self.inner.schedule(&job)?;
        }
        Ok(job)
    }

    pub fn stop_job(&self, id: i64) -> Result<()> {
        self.inner.store.get_job(id)?;
        self.inner.unschedule(id);
        self.inner.store.update_job_status(id, JobStatus::Stop)?;
        tracing::info!(job_id = id, "job stopped");
        Ok(())
    }

    /// Stop a job and delete its row and logs
    pub async fn remove_job(&self, id: i64) -> Result<()> {
        let job = self.inner.store.get_job(id)?;
        self.inner.unschedule(id);
        self.inner.store.delete_job(id)?;
        if let Some((_, log)) = self.inner.logs.remove(&id) {
            log.close().await;
        }
        let dir = logfile::log_dir(&self.inner.config.log_root, &job.name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %dir.display(), "failed to remove job logs: {}", e),
        }
        tracing::info!(job_id = id, name = %job.name, "job removed");
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Job> {
        Ok(self.inner.store.get_job(id)?)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.inner.store.list_jobs()?)
    }

    pub fn is_active(&self, id: i64) -> bool {
        self.inner.active.contains_key(&id)
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.inner.engine.names()
    }

    pub fn log_path(&self, job: &Job) -> PathBuf {
        logfile::log_path(&self.inner.config.log_root, &job.name)
    }

    pub fn list_instances(&self, job_id: Option<i64>, page: Page) -> Result<PageData<TaskInstance>> {
        Ok(self.inner.store.list_instances(job_id, page.normalized())?)
    }

    /// Delete run history older than `before`, by default the retention window
    pub fn clear_instances(&self, before: Option<chrono::DateTime<Utc>>, job_id: Option<i64>) -> Result<usize> {
        self.inner.clear_instances(before, job_id)
    }

    /// Cancel everything and flush the open logs
    pub async fn shutdown(&self) {
        self.inner.engine.stop();
        for entry in self.inner.active.iter() {
            entry.token.cancel();
        }
        self.inner.active.clear();
        let logs: Vec<Arc<JobLog>> = self.inner.logs.iter().map(|e| Arc::clone(e.value())).collect();
        self.inner.logs.clear();
        for log in logs {
            log.close().await;
        }
    }
}

/// Shape and cron syntax checks done before anything is stored
fn check(new: &NewJob) -> Result<()> {
    new.validate()?;
    if new.job_type == JobType::Cron {
        CronSchedule::parse(&new.spec)?;
    }
    Ok(())
}

impl Inner {
    fn schedule(self: &Arc<Self>, job: &Job) -> Result<()> {
        let active = Active {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            token: self.cancel.child_token(),
        };

        match job.job_type {
            JobType::Cron => {
                let schedule = CronSchedule::parse(&job.spec)?;
                let inner = Arc::clone(self);
                let token = active.token.clone();
                let job_id = job.id;
                if let Some(old) = self.active.insert(job.id, active) {
                    old.token.cancel();
                }
                self.engine.add(&entry_name(job.id), schedule, move || {
                    let inner = Arc::clone(&inner);
                    let token = token.clone();
                    async move { inner.fire_cron(job_id, token).await }
                });
            }
            JobType::Task => {
                let inner = Arc::clone(self);
                let run = active.clone();
                if let Some(old) = self.active.insert(job.id, active) {
                    old.token.cancel();
                }
                tokio::spawn(inner.run_task(job.id, run));
            }
        }
        tracing::debug!(job_id = job.id, kind = %job.job_type, "job scheduled");
        Ok(())
    }

    fn unschedule(&self, job_id: i64) {
        self.engine.remove(&entry_name(job_id));
        if let Some((_, active)) = self.active.remove(&job_id) {
            active.token.cancel();
        }
    }

    fn close_log(&self, job_id: i64) {
        if let Some((_, log)) = self.logs.remove(&job_id) {
            tokio::spawn(async move { log.close().await });
        }
    }

    fn log_for(&self, job: &Job) -> std::io::Result<Arc<JobLog>> {
        if let Some(log) = self.logs.get(&job.id) {
            return Ok(Arc::clone(log.value()));
        }
        let log = Arc::new(JobLog::open(&self.config.log_root, &job.name)?);
        Ok(Arc::clone(self.logs.entry(job.id).or_insert(log).value()))
    }

    fn set_status(&self, job_id: i64, status: JobStatus, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        // a concurrent stop_job may land between the check above and this write
        match self.store.update_job_status_unless_stopped(job_id, status) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job_id, %status, "job stopped, status left alone"),
            Err(e) => tracing::warn!(job_id, %status, "failed to save job status: {}", e),
        }
    }

    fn clear_instances(&self, before: Option<chrono::DateTime<Utc>>, job_id: Option<i64>) -> Result<usize> {
        let before = before.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or_default()
        });
        let removed = self.store.clear_instances(before, job_id)?;
        if removed > 0 {
            tracing::info!(removed, %before, "cleared run history");
        }
        Ok(removed)
    }

    /// One run of `job`, recorded as a task instance. Returns whether it succeeded.
    async fn run_once(&self, job: &Job, token: &CancellationToken) -> bool {
        let log = match self.log_for(job) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(job_id = job.id, "failed to open job log: {}", e);
                return false;
            }
        };
        let instance = match self.store.insert_instance(job.id, Utc::now()) {
            Ok(instance) => Some(instance.id),
            Err(e) => {
                tracing::warn!(job_id = job.id, "failed to record run: {}", e);
                None
            }
        };

        let call = CallContext::with_cancel(token.child_token());
        let result = self.executor.run_job(job, &log, &call).await;
        let status = match &result {
            Ok(()) => InstanceStatus::Done,
            Err(e) => {
                log.error(format!("run failed: {e}"));
                tracing::warn!(job_id = job.id, name = %job.name, "job run failed: {}", e);
                InstanceStatus::Failed
            }
        };
        if let Some(id) = instance {
            if let Err(e) = self.store.finish_instance(id, status) {
                tracing::warn!(job_id = job.id, "failed to finish run record: {}", e);
            }
        }
        result.is_ok()
    }

    async fn fire_cron(self: Arc<Self>, job_id: i64, token: CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        let job = match self.store.get_job(job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id, "cron job vanished: {}", e);
                return;
            }
        };
        self.set_status(job_id, JobStatus::Running, &token);
        let ok = self.run_once(&job, &token).await;
        let next = if ok { JobStatus::Done } else { JobStatus::Backoff };
        self.set_status(job_id, next, &token);
    }

    async fn run_task(self: Arc<Self>, job_id: i64, active: Active) {
        let token = active.token.clone();
        let mut backoff = self.config.backoff.build();
        let max = self.config.max_retries.max(1);
        let mut attempts = 0;

        let outcome = loop {
            if token.is_cancelled() {
                break None;
            }
            let job = match self.store.get_job(job_id) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job_id, "task job vanished: {}", e);
                    break None;
                }
            };

            attempts += 1;
            self.set_status(job_id, JobStatus::Running, &token);
            if self.run_once(&job, &token).await {
                break Some(JobStatus::Done);
            }
            if attempts >= max {
                if let Ok(log) = self.log_for(&job) {
                    log.error(format!("giving up after {attempts} attempts"));
                }
                tracing::error!(job_id, attempts, "task job is fatal");
                break Some(JobStatus::Fatal);
            }

            self.set_status(job_id, JobStatus::Backoff, &token);
            let delay = backoff.next_delay();
            tracing::debug!(job_id, attempt = attempts, ?delay, "task job backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => break None,
            }
        };

        if let Some(status) = outcome {
            self.set_status(job_id, status, &token);
        }
        self.active.remove_if(&job_id, |_, a| a.generation == active.generation);
    }
}
