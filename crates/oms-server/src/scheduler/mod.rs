//! Cron and task job scheduling with per-job logs

pub mod backoff;
pub mod cron;
pub mod executor;
pub mod logfile;
pub mod runner;
pub mod tail;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use self::cron::{Clock, CronEngine, CronSchedule, SystemClock, TokioClock};
pub use executor::{JobExecutor, SshJobExecutor};
pub use logfile::{JobLog, LineSink, Rotation};
pub use runner::{Scheduler, SchedulerConfig, CLEAR_INSTANCES_ENTRY, LOOP_STATUS_ENTRY};
