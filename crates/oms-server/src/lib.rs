//! oms-server: multi-host SSH operations daemon
//!
//! Runs shell commands and playbooks across groups of hosts, streams file
//! uploads to many hosts at once, schedules cron and task jobs and keeps
//! SSH port forwards alive. The inventory lives in `oms-core`; SSH and
//! SFTP plumbing lives in `oms-transport`.

pub mod api;
pub mod error;
pub mod playbook;
pub mod scheduler;
pub mod ssh;
pub mod state;
pub mod tunnel;

pub use error::{Result, ServerError};
pub use state::AppState;
