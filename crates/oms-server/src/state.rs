//! Process-wide server state

use std::sync::Arc;

use dashmap::DashMap;
use oms_core::config::ServerConfig;
use oms_core::Inventory;
use oms_transport::Stats;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::playbook::StepRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig, SshJobExecutor};
use crate::ssh::{HostExecutor, SshManager};
use crate::tunnel::TunnelSupervisor;

/// Everything the HTTP handlers and background loops share
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn Inventory>,
    pub ssh: Arc<SshManager>,
    /// Runs fan-out commands; the SSH manager outside of tests
    pub executor: Arc<dyn HostExecutor>,
    pub scheduler: Scheduler,
    pub tunnels: Arc<TunnelSupervisor>,
    /// Last stats sample per host, the base for CPU deltas
    pub stats: DashMap<i64, Stats>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Arc<dyn Inventory>, steps: StepRegistry, cancel: CancellationToken) -> Self {
        let ssh = Arc::new(SshManager::new(Arc::clone(&store), steps));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(SshJobExecutor::new(Arc::clone(&ssh))),
            SchedulerConfig::new(config.tmp_path(), config.app.temp_date),
            cancel.child_token(),
        );
        let tunnels = Arc::new(TunnelSupervisor::new(
            Arc::clone(&store),
            ssh.clone(),
            cancel.child_token(),
        ));
        Self {
            config,
            store,
            executor: ssh.clone(),
            ssh,
            scheduler,
            tunnels,
            stats: DashMap::new(),
            cancel,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn HostExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Load persisted jobs and tunnels and start the background loops
    pub fn start(&self) -> Result<()> {
        self.scheduler.init()?;
        self.tunnels.init()?;
        tokio::spawn(Arc::clone(&self.tunnels).run_sweeper(self.cancel.child_token()));
        tokio::spawn(Arc::clone(self.ssh.uploads()).run_reporter(self.cancel.child_token()));
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.shutdown().await;
        self.tunnels.shutdown();
        self.ssh.shutdown().await;
    }
}
