//! What a job run actually does

use std::sync::Arc;

use async_trait::async_trait;
use oms_core::models::{CmdType, Job, JobType, Preload};
use oms_transport::{CallContext, PtySize};

use super::logfile::JobLog;
use crate::error::{Result, ServerError};
use crate::playbook::Player;
use crate::ssh::SshManager;

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run `job` once, writing its output to `log`
    async fn run_job(&self, job: &Job, log: &JobLog, call: &CallContext) -> Result<()>;

    /// Check every host; returns how many are up
    async fn refresh_status(&self) -> Result<usize>;
}

/// Runs jobs over SSH on the job's host
pub struct SshJobExecutor {
    manager: Arc<SshManager>,
}

impl SshJobExecutor {
    pub fn new(manager: Arc<SshManager>) -> Self {
        Self { manager }
    }
}

/// Cron jobs go through sudo whenever the host has a password;
/// task jobs only when they ask for it
fn sudo_password<'a>(job: &Job, password: &'a str) -> Option<&'a str> {
    if password.is_empty() {
        return None;
    }
    match job.job_type {
        JobType::Cron => Some(password),
        JobType::Task if job.sudo => Some(password),
        JobType::Task => None,
    }
}

#[async_trait]
impl JobExecutor for SshJobExecutor {
    async fn run_job(&self, job: &Job, log: &JobLog, call: &CallContext) -> Result<()> {
        let store = self.manager.store();
        let host = store.get_host(job.host_id, Preload::NONE)?;
        let sudo = sudo_password(job, &host.password);

        match job.cmd_type {
            CmdType::Cmd => {
                let pty = sudo.map(|_| PtySize::default());
                let session = self.manager.open_session(&host, pty).await?;
                let mut sink = log.line_sink();
                let result = session
                    .stream(&job.cmd, sudo, call, |chunk| sink.push(chunk))
                    .await;
                sink.finish();
                Ok(result?)
            }
            CmdType::Player => {
                let playbook_id = job
                    .cmd_id
                    .ok_or_else(|| ServerError::BadRequest(format!("job {} has no playbook", job.id)))?;
                let playbook = store.get_playbook(playbook_id)?;
                let steps = self.manager.parse_steps(&playbook.steps)?;
                let client = self.manager.new_client(&host).await?;

                let mut sink = log.line_sink();
                let result = Player::new(client, &steps)
                    .run(sudo.is_some(), PtySize::default(), call)
                    .await;
                match result {
                    Ok(out) => {
                        sink.push(&out);
                        sink.finish();
                        Ok(())
                    }
                    Err(e) => {
                        sink.push(&e.output);
                        sink.finish();
                        Err(e.source)
                    }
                }
            }
        }
    }

    async fn refresh_status(&self) -> Result<usize> {
        self.manager.refresh_all_status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(job_type: JobType, sudo: bool) -> Job {
        Job {
            id: 1,
            name: "j".into(),
            job_type,
            spec: String::new(),
            cmd: "date".into(),
            cmd_type: CmdType::Cmd,
            cmd_id: None,
            sudo,
            status: oms_core::models::JobStatus::Ready,
            host_id: 1,
        }
    }

    #[test]
    fn test_sudo_rules() {
        assert_eq!(sudo_password(&job(JobType::Cron, false), "pw"), Some("pw"));
        assert_eq!(sudo_password(&job(JobType::Cron, false), ""), None);
        assert_eq!(sudo_password(&job(JobType::Task, false), "pw"), None);
    }

    #[test]
    fn test_task_with_sudo_uses_host_password() {
        assert_eq!(sudo_password(&job(JobType::Task, true), "pw"), Some("pw"));
        assert_eq!(sudo_password(&job(JobType::Task, true), ""), None);
    }
}
