//! Inventory store contract
//!
//! The managers only see [`Inventory`]. [`SqliteStore`] is the backend the
//! daemon ships with; tests can swap in any other implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    CommandHistory, Group, GroupMode, Host, InstanceStatus, Job, JobStatus, NewHost, NewJob,
    NewTunnel, Page, PageData, PlayBook, Preload, PrivateKey, QuicklyCommand, Tag, TaskInstance,
    Tunnel,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD surface the core needs from persistence
pub trait Inventory: Send + Sync {
    // hosts
    fn get_host(&self, id: i64, preload: Preload) -> StoreResult<Host>;
    fn list_hosts(&self, preload: Preload) -> StoreResult<Vec<Host>>;
    fn page_hosts(&self, page: Page) -> StoreResult<PageData<Host>>;
    fn insert_host(&self, host: &NewHost) -> StoreResult<Host>;
    fn update_host(&self, id: i64, host: &NewHost) -> StoreResult<Host>;
    fn delete_host(&self, id: i64) -> StoreResult<()>;
    /// Serialized status write; returns whether the stored value changed
    fn update_host_status(&self, id: i64, status: bool) -> StoreResult<bool>;

    // target lookups
    fn hosts_by_tag(&self, tag_id: i64) -> StoreResult<Vec<Host>>;
    fn hosts_by_group(&self, group_id: i64) -> StoreResult<Vec<Host>>;
    /// `*` wildcards over `addr`
    fn hosts_by_glob(&self, pattern: &str) -> StoreResult<Vec<Host>>;
    /// Full scan, regex over `addr`
    fn hosts_by_regex(&self, pattern: &str) -> StoreResult<Vec<Host>>;
    fn hosts_by_addr(&self, addr: &str) -> StoreResult<Vec<Host>>;

    // tags
    fn get_tag(&self, id: i64) -> StoreResult<Tag>;
    fn list_tags(&self) -> StoreResult<Vec<Tag>>;
    fn insert_tag(&self, name: &str) -> StoreResult<Tag>;
    fn delete_tag(&self, id: i64) -> StoreResult<()>;

    // groups
    fn get_group(&self, id: i64) -> StoreResult<Group>;
    fn list_groups(&self) -> StoreResult<Vec<Group>>;
    fn insert_group(&self, name: &str, mode: GroupMode, params: &str) -> StoreResult<Group>;
    fn delete_group(&self, id: i64) -> StoreResult<()>;

    // private keys
    fn get_private_key(&self, id: i64) -> StoreResult<PrivateKey>;
    fn list_private_keys(&self) -> StoreResult<Vec<PrivateKey>>;
    fn insert_private_key(&self, name: &str, key_file: &str, passphrase: &str)
        -> StoreResult<PrivateKey>;
    fn delete_private_key(&self, id: i64) -> StoreResult<()>;

    // tunnels
    fn get_tunnel(&self, id: i64) -> StoreResult<Tunnel>;
    fn list_tunnels(&self) -> StoreResult<Vec<Tunnel>>;
    fn insert_tunnel(&self, tunnel: &NewTunnel) -> StoreResult<Tunnel>;
    fn delete_tunnel(&self, id: i64) -> StoreResult<()>;
    fn update_tunnel_status(&self, id: i64, status: bool, error_msg: &str) -> StoreResult<()>;

    // jobs
    fn get_job(&self, id: i64) -> StoreResult<Job>;
    fn list_jobs(&self) -> StoreResult<Vec<Job>>;
    fn insert_job(&self, job: &NewJob) -> StoreResult<Job>;
    fn update_job(&self, id: i64, job: &NewJob) -> StoreResult<Job>;
    fn delete_job(&self, id: i64) -> StoreResult<()>;
    fn update_job_status(&self, id: i64, status: JobStatus) -> StoreResult<()>;
    /// Like `update_job_status`, but leaves a stopped job alone.
    /// Returns whether the row was written.
    fn update_job_status_unless_stopped(&self, id: i64, status: JobStatus) -> StoreResult<bool>;

    // job run history
    fn insert_instance(&self, job_id: i64, start: DateTime<Utc>) -> StoreResult<TaskInstance>;
    fn finish_instance(&self, id: i64, status: InstanceStatus) -> StoreResult<()>;
    fn list_instances(&self, job_id: Option<i64>, page: Page)
        -> StoreResult<PageData<TaskInstance>>;
    /// Delete runs started before `before`; returns the number removed
    fn clear_instances(&self, before: DateTime<Utc>, job_id: Option<i64>) -> StoreResult<usize>;

    // playbooks
    fn get_playbook(&self, id: i64) -> StoreResult<PlayBook>;
    fn list_playbooks(&self) -> StoreResult<Vec<PlayBook>>;
    fn insert_playbook(&self, name: &str, steps: &str) -> StoreResult<PlayBook>;
    fn update_playbook(&self, id: i64, name: &str, steps: &str) -> StoreResult<PlayBook>;
    fn delete_playbook(&self, id: i64) -> StoreResult<()>;

    // quick commands and history
    fn list_quickly_commands(&self) -> StoreResult<Vec<QuicklyCommand>>;
    fn insert_quickly_command(&self, name: &str, cmd: &str) -> StoreResult<QuicklyCommand>;
    fn delete_quickly_command(&self, id: i64) -> StoreResult<()>;
    /// Insert with `times = 1` or bump the counter, in one transaction
    fn insert_or_update_command_history(&self, cmd: &str) -> StoreResult<CommandHistory>;
    fn search_command_history(&self, keyword: &str, limit: u32)
        -> StoreResult<Vec<CommandHistory>>;
    fn delete_command_history(&self, id: i64) -> StoreResult<()>;
}

/// Translate a `*` glob to a SQL LIKE pattern
pub fn glob_to_like(pattern: &str) -> String {
    pattern.replace('*', "%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_like() {
        assert_eq!(glob_to_like("10.0.*.*"), "10.0.%.%");
        assert_eq!(glob_to_like("web-01"), "web-01");
    }
}
