//! Scheduler behaviour with a scripted executor and paused time

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use oms_core::models::{CmdType, InstanceStatus, Job, JobStatus, JobType, NewHost, NewJob, Page};
use oms_core::{Inventory, SqliteStore};
use oms_server::scheduler::{
    BackoffPolicy, JobExecutor, JobLog, Scheduler, SchedulerConfig, TokioClock, CLEAR_INSTANCES_ENTRY,
    LOOP_STATUS_ENTRY,
};
use oms_server::{Result, ServerError};

struct Scripted {
    runs: AtomicUsize,
    fail: bool,
    /// How long each run takes
    hold: Duration,
}

#[async_trait]
impl JobExecutor for Scripted {
    async fn run_job(&self, job: &Job, log: &JobLog, _call: &oms_transport::CallContext) -> Result<()> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        log.info(format!("{} run {n}", job.name));
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        if self.fail {
            Err(ServerError::Step("exit status 1".into()))
        } else {
            Ok(())
        }
    }

    async fn refresh_status(&self) -> Result<usize> {
        Ok(0)
    }
}

struct Fixture {
    store: Arc<SqliteStore>,
    executor: Arc<Scripted>,
    scheduler: Scheduler,
    host_id: i64,
    _logs: tempfile::TempDir,
}

fn fixture(fail: bool) -> Fixture {
    fixture_with(fail, Duration::ZERO)
}

fn fixture_with(fail: bool, hold: Duration) -> Fixture {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let host = store
        .insert_host(&NewHost {
            name: "web-1".into(),
            addr: "10.0.0.1".into(),
            password: "pw".into(),
            ..Default::default()
        })
        .unwrap();
    let executor = Arc::new(Scripted {
        runs: AtomicUsize::new(0),
        fail,
        hold,
    });
    let logs = tempfile::tempdir().unwrap();
    let mut config = SchedulerConfig::new(logs.path(), Duration::from_secs(7 * 24 * 3600));
    config.backoff = BackoffPolicy {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.0,
    };
    let start: DateTime<Utc> = "2026-01-01T10:00:30Z".parse().unwrap();
    let scheduler = Scheduler::with_clock(
        store.clone(),
        executor.clone(),
        config,
        Arc::new(TokioClock::starting_at(start)),
        CancellationToken::new(),
    );
    Fixture {
        store,
        executor,
        scheduler,
        host_id: host.id,
        _logs: logs,
    }
}

fn cron_job(host_id: i64, spec: &str) -> NewJob {
    NewJob {
        name: "date".into(),
        job_type: JobType::Cron,
        spec: spec.into(),
        cmd: "date".into(),
        cmd_type: CmdType::Cmd,
        cmd_id: None,
        sudo: false,
        host_id,
    }
}

fn task_job(host_id: i64) -> NewJob {
    NewJob {
        name: "migrate".into(),
        job_type: JobType::Task,
        spec: String::new(),
        cmd: "./migrate.sh".into(),
        cmd_type: CmdType::Cmd,
        cmd_id: None,
        sudo: false,
        host_id,
    }
}

#[tokio::test(start_paused = true)]
async fn test_cron_job_fires_each_minute() {
    let f = fixture(false);
    let job = f.scheduler.create_job(&cron_job(f.host_id, "*/1 * * * *")).unwrap();

    tokio::time::sleep(Duration::from_secs(3 * 60)).await;
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 3);

    let stored = f.scheduler.get_job(job.id).unwrap();
    assert!(matches!(stored.status, JobStatus::Done | JobStatus::Running));

    let runs = f.scheduler.list_instances(Some(job.id), Page::default()).unwrap();
    assert_eq!(runs.total, 3);
    assert!(runs.data.iter().all(|r| r.status == InstanceStatus::Done));

    f.scheduler.shutdown().await;
    let log = std::fs::read_to_string(f.scheduler.log_path(&job)).unwrap();
    assert_eq!(log.lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_cron_spec_is_rejected_before_insert() {
    let f = fixture(false);
    let err = f
        .scheduler
        .create_job(&cron_job(f.host_id, "every minute please"))
        .unwrap_err();
    assert!(matches!(err, ServerError::CronSpecInvalid { .. }));
    assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    assert!(f.store.list_jobs().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failing_task_turns_fatal_after_ten_attempts() {
    let f = fixture(true);
    let job = f.scheduler.create_job(&task_job(f.host_id)).unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 10);
    assert_eq!(f.scheduler.get_job(job.id).unwrap().status, JobStatus::Fatal);
    assert!(!f.scheduler.is_active(job.id));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 10);

    let runs = f.scheduler.list_instances(Some(job.id), Page { page_num: 1, page_size: 50 }).unwrap();
    assert_eq!(runs.total, 10);
    assert!(runs.data.iter().all(|r| r.status == InstanceStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_successful_task_runs_once() {
    let f = fixture(false);
    let job = f.scheduler.create_job(&task_job(f.host_id)).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 1);
    assert_eq!(f.scheduler.get_job(job.id).unwrap().status, JobStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn test_init_resets_running_jobs_and_registers_builtins() {
    let f = fixture(false);
    let crashed = f.store.insert_job(&cron_job(f.host_id, "@hourly")).unwrap();
    f.store.update_job_status(crashed.id, JobStatus::Running).unwrap();
    let stopped = f.store.insert_job(&cron_job(f.host_id, "@daily")).unwrap();
    f.store.update_job_status(stopped.id, JobStatus::Stop).unwrap();

    assert_eq!(f.scheduler.init().unwrap(), 1);
    assert_eq!(f.scheduler.get_job(crashed.id).unwrap().status, JobStatus::Ready);
    assert!(f.scheduler.is_active(crashed.id));
    assert!(!f.scheduler.is_active(stopped.id));

    let entries = f.scheduler.entry_names();
    assert!(entries.contains(&LOOP_STATUS_ENTRY.to_string()));
    assert!(entries.contains(&CLEAR_INSTANCES_ENTRY.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_start() {
    let f = fixture(false);
    let job = f.scheduler.create_job(&cron_job(f.host_id, "*/1 * * * *")).unwrap();
    f.scheduler.stop_job(job.id).unwrap();
    assert_eq!(f.scheduler.get_job(job.id).unwrap().status, JobStatus::Stop);

    tokio::time::sleep(Duration::from_secs(3 * 60)).await;
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 0);

    let started = f.scheduler.start_job(job.id).unwrap();
    assert_eq!(started.status, JobStatus::Ready);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remove_deletes_row_and_logs() {
    let f = fixture(false);
    let job = f.scheduler.create_job(&cron_job(f.host_id, "*/1 * * * *")).unwrap();
    tokio::time::sleep(Duration::from_secs(90)).await;
    let log_dir = f.scheduler.log_path(&job).parent().unwrap().to_path_buf();
    assert!(log_dir.exists());

    f.scheduler.remove_job(job.id).await.unwrap();
    assert!(f.store.get_job(job.id).is_err());
    assert!(!log_dir.exists());
    assert!(!f.scheduler.is_active(job.id));
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_run_stays_stopped() {
    let f = fixture_with(false, Duration::from_secs(20));
    let job = f.scheduler.create_job(&cron_job(f.host_id, "*/1 * * * *")).unwrap();

    // fires at 10:01:00 and holds until 10:01:20
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 1);
    assert_eq!(f.scheduler.get_job(job.id).unwrap().status, JobStatus::Running);

    f.scheduler.stop_job(job.id).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(f.scheduler.get_job(job.id).unwrap().status, JobStatus::Stop);
    assert_eq!(f.executor.runs.load(Ordering::SeqCst), 1);
    let runs = f.scheduler.list_instances(Some(job.id), Page::default()).unwrap();
    assert_eq!(runs.total, 1);
}
