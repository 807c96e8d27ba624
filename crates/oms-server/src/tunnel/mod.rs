//! Tunnel supervisor
//!
//! Keeps one [`TunnelWorker`] per persisted tunnel and mirrors their live
//! status back into the inventory.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use oms_core::models::{Host, NewTunnel, Preload, Tunnel};
use oms_core::Inventory;
use tokio_util::sync::CancellationToken;

pub use worker::{Dialer, TunnelState, TunnelWorker, HEARTBEAT_INTERVAL, MANAGE_INTERVAL, SUCCESS};

use crate::error::Result;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    tunnel: Tunnel,
    state: Arc<TunnelState>,
    closer: CancellationToken,
}

pub struct TunnelSupervisor {
    store: Arc<dyn Inventory>,
    dialer: Arc<dyn Dialer>,
    tunnels: DashMap<i64, Entry>,
    cancel: CancellationToken,
}

impl TunnelSupervisor {
    pub fn new(store: Arc<dyn Inventory>, dialer: Arc<dyn Dialer>, cancel: CancellationToken) -> Self {
        Self {
            store,
            dialer,
            tunnels: DashMap::new(),
            cancel,
        }
    }

    /// Start every persisted tunnel
    pub fn init(&self) -> Result<usize> {
        let mut started = 0;
        for tunnel in self.store.list_tunnels()? {
            match self.store.get_host(tunnel.host_id, Preload::NONE) {
                Ok(host) => {
                    self.add_tunnel(tunnel, host);
                    started += 1;
                }
                Err(e) => tracing::warn!(tunnel_id = tunnel.id, "tunnel host missing: {}", e),
            }
        }
        tracing::info!(started, "tunnels initialized");
        Ok(started)
    }

    /// Validate, persist and start a tunnel
    pub fn create(&self, new: &NewTunnel) -> Result<Tunnel> {
        new.validate()?;
        let host = self.store.get_host(new.host_id, Preload::NONE)?;
        let tunnel = self.store.insert_tunnel(new)?;
        self.add_tunnel(tunnel.clone(), host);
        Ok(tunnel)
    }

    /// Supervise `tunnel`, replacing any worker with the same id
    pub fn add_tunnel(&self, tunnel: Tunnel, host: Host) {
        let closer = self.cancel.child_token();
        let worker = TunnelWorker::new(tunnel.clone(), host, Arc::clone(&self.dialer), closer.clone());
        let state = worker.state();
        let id = tunnel.id;
        if let Some(old) = self.tunnels.insert(id, Entry { tunnel, state, closer }) {
            old.closer.cancel();
        }
        tokio::spawn(worker.supervise());
        tracing::debug!(tunnel_id = id, "tunnel added");
    }

    /// Stop a tunnel's worker; returns whether it was running
    pub fn remove_tunnel(&self, id: i64) -> bool {
        match self.tunnels.remove(&id) {
            Some((_, entry)) => {
                entry.closer.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop a tunnel and delete its row
    pub fn delete(&self, id: i64) -> Result<()> {
        self.remove_tunnel(id);
        self.store.delete_tunnel(id)?;
        Ok(())
    }

    /// The tunnel with its live status
    pub fn get_tunnel(&self, id: i64) -> Option<Tunnel> {
        self.tunnels.get(&id).map(|e| snapshot(e.value()))
    }

    /// Every persisted tunnel, live status where a worker runs
    pub fn list(&self) -> Result<Vec<Tunnel>> {
        let mut tunnels = self.store.list_tunnels()?;
        for tunnel in &mut tunnels {
            if let Some(live) = self.get_tunnel(tunnel.id) {
                *tunnel = live;
            }
        }
        Ok(tunnels)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Persist live status; stop workers whose row is gone
    pub fn update_tunnel_status(&self) -> usize {
        let ids: Vec<i64> = self.tunnels.iter().map(|e| *e.key()).collect();
        let mut updated = 0;
        for id in ids {
            let Some(live) = self.get_tunnel(id) else { continue };
            match self.store.get_tunnel(id) {
                Ok(_) => match self.store.update_tunnel_status(id, live.status, &live.error_msg) {
                    Ok(()) => updated += 1,
                    Err(e) => tracing::warn!(tunnel_id = id, "failed to save tunnel status: {}", e),
                },
                Err(e) if e.is_not_found() => {
                    tracing::info!(tunnel_id = id, "tunnel row gone, stopping");
                    self.remove_tunnel(id);
                }
                Err(e) => tracing::warn!(tunnel_id = id, "failed to load tunnel: {}", e),
            }
        }
        updated
    }

    /// Run the status sweep until cancelled
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let updated = self.update_tunnel_status();
                    tracing::trace!(updated, "tunnel status sweep");
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("tunnel sweeper shutting down");
                    break;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        for entry in self.tunnels.iter() {
            entry.closer.cancel();
        }
        self.tunnels.clear();
    }
}

fn snapshot(entry: &Entry) -> Tunnel {
    Tunnel {
        status: entry.state.is_open(),
        error_msg: entry.state.error_msg(),
        ..entry.tunnel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oms_core::models::{NewHost, TunnelMode};
    use oms_core::SqliteStore;
    use oms_transport::Client;

    struct Refuse;

    #[async_trait]
    impl Dialer for Refuse {
        async fn dial(&self, _host: &Host) -> Result<Arc<Client>> {
            Err(oms_transport::TransportError::Dial("connection refused".into()).into())
        }
    }

    fn setup() -> (TunnelSupervisor, Arc<SqliteStore>, i64) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let host = store
            .insert_host(&NewHost {
                name: "h".into(),
                addr: "127.0.0.1".into(),
                password: "pw".into(),
                ..Default::default()
            })
            .unwrap();
        let supervisor = TunnelSupervisor::new(store.clone(), Arc::new(Refuse), CancellationToken::new());
        (supervisor, store, host.id)
    }

    fn new_tunnel(host_id: i64) -> NewTunnel {
        NewTunnel {
            mode: TunnelMode::Local,
            source: "127.0.0.1:80".into(),
            destination: "127.0.0.1:9000".into(),
            host_id,
        }
    }

    #[tokio::test]
    async fn test_sweep_persists_live_status() {
        let (supervisor, store, host_id) = setup();
        let tunnel = supervisor.create(&new_tunnel(host_id)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(supervisor.update_tunnel_status(), 1);
        let stored = store.get_tunnel(tunnel.id).unwrap();
        assert!(!stored.status);
        assert!(stored.error_msg.starts_with("dial error"));
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_drops_deleted_rows() {
        let (supervisor, store, host_id) = setup();
        let tunnel = supervisor.create(&new_tunnel(host_id)).unwrap();
        store.delete_tunnel(tunnel.id).unwrap();

        assert_eq!(supervisor.update_tunnel_status(), 0);
        assert!(supervisor.is_empty());
        assert!(supervisor.get_tunnel(tunnel.id).is_none());
    }

    #[tokio::test]
    async fn test_init_and_delete() {
        let (supervisor, store, host_id) = setup();
        store.insert_tunnel(&new_tunnel(host_id)).unwrap();
        let other = store.insert_tunnel(&new_tunnel(host_id)).unwrap();

        assert_eq!(supervisor.init().unwrap(), 2);
        supervisor.delete(other.id).unwrap();
        assert_eq!(supervisor.len(), 1);
        assert_eq!(store.list_tunnels().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let (supervisor, store, host_id) = setup();
        let mut bad = new_tunnel(host_id);
        bad.destination = "nowhere".into();
        assert!(supervisor.create(&bad).is_err());
        assert!(store.list_tunnels().unwrap().is_empty());
    }
}
