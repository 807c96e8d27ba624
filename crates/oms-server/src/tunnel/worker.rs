//! One supervised port forward
//!
//! A worker owns a private SSH connection and a listener. Two tickers
//! drive it: every 5 s a closed worker restarts, every 10 s a heartbeat
//! checks the connection and tears everything down when it stops
//! answering. `is_open` and `error_msg` always describe the latest
//! attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oms_core::models::{split_endpoint, Host, Tunnel, TunnelMode};
use oms_transport::{Client, ForwardedChannel};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ServerError};
use crate::ssh::SshManager;

pub const MANAGE_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const SUCCESS: &str = "success";

/// Opens the worker's private connection
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &Host) -> Result<Arc<Client>>;
}

#[async_trait]
impl Dialer for SshManager {
    async fn dial(&self, host: &Host) -> Result<Arc<Client>> {
        SshManager::dial(self, host).await
    }
}

/// Live status shared with the supervisor
#[derive(Debug)]
pub struct TunnelState {
    is_open: AtomicBool,
    error_msg: RwLock<String>,
}

impl Default for TunnelState {
    fn default() -> Self {
        Self {
            is_open: AtomicBool::new(false),
            error_msg: RwLock::new(SUCCESS.to_string()),
        }
    }
}

impl TunnelState {
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub fn error_msg(&self) -> String {
        self.error_msg.read().clone()
    }

    fn opened(&self) {
        *self.error_msg.write() = SUCCESS.to_string();
        self.is_open.store(true, Ordering::Release);
    }

    fn failed(&self, what: &str, err: impl std::fmt::Display) {
        *self.error_msg.write() = format!("{what}, err: {err}");
        self.is_open.store(false, Ordering::Release);
    }

    /// Record a per-connection failure without closing the listener
    fn note(&self, what: &str, err: impl std::fmt::Display) {
        *self.error_msg.write() = format!("{what}, err: {err}");
    }
}

/// Running connection and listener
struct Live {
    client: Arc<Client>,
    accept: JoinHandle<()>,
    stop: CancellationToken,
}

impl Live {
    async fn shutdown(self, tunnel: &Tunnel) {
        self.stop.cancel();
        if tunnel.mode == TunnelMode::Remote {
            if let Ok((host, port)) = split_endpoint(&tunnel.destination) {
                let _ = self.client.cancel_remote_forward(&host, port).await;
            }
        }
        self.client.close().await;
        let _ = self.accept.await;
    }
}

pub struct TunnelWorker {
    tunnel: Tunnel,
    host: Host,
    dialer: Arc<dyn Dialer>,
    state: Arc<TunnelState>,
    closer: CancellationToken,
}

impl TunnelWorker {
    pub fn new(tunnel: Tunnel, host: Host, dialer: Arc<dyn Dialer>, closer: CancellationToken) -> Self {
        Self {
            tunnel,
            host,
            dialer,
            state: Arc::new(TunnelState::default()),
            closer,
        }
    }

    pub fn state(&self) -> Arc<TunnelState> {
        Arc::clone(&self.state)
    }

    /// Keep the forward up until the closer fires
    pub async fn supervise(self) {
        let mut manage = tokio::time::interval(MANAGE_INTERVAL);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut live: Option<Live> = None;

        loop {
            tokio::select! {
                _ = self.closer.cancelled() => break,
                _ = manage.tick() => {
                    if live.as_ref().is_some_and(|l| l.accept.is_finished()) {
                        if let Some(l) = live.take() {
                            l.shutdown(&self.tunnel).await;
                        }
                    }
                    if live.is_none() {
                        live = self.start().await;
                    }
                }
                _ = heartbeat.tick() => {
                    let Some(l) = live.as_ref() else { continue };
                    if let Err(e) = l.client.keepalive().await {
                        tracing::warn!(tunnel_id = self.tunnel.id, "tunnel heartbeat failed: {}", e);
                        self.state.failed("keepalive error", &e);
                        if let Some(l) = live.take() {
                            l.shutdown(&self.tunnel).await;
                        }
                    }
                }
            }
        }

        if let Some(l) = live.take() {
            l.shutdown(&self.tunnel).await;
        }
        self.state.is_open.store(false, Ordering::Release);
        tracing::info!(tunnel_id = self.tunnel.id, "tunnel closed");
    }

    async fn start(&self) -> Option<Live> {
        let client = match self.dialer.dial(&self.host).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(tunnel_id = self.tunnel.id, host = %self.host.address(), "tunnel dial failed: {}", e);
                self.state.failed("dial error", &e);
                return None;
            }
        };

        let stop = self.closer.child_token();
        let accept = match self.tunnel.mode {
            TunnelMode::Local => self.listen_local(&client, stop.clone()).await,
            TunnelMode::Remote => self.listen_remote(&client, stop.clone()).await,
        };
        match accept {
            Ok(accept) => {
                self.state.opened();
                tracing::info!(
                    tunnel_id = self.tunnel.id,
                    mode = %self.tunnel.mode,
                    source = %self.tunnel.source,
                    destination = %self.tunnel.destination,
                    "tunnel open"
                );
                Some(Live { client, accept, stop })
            }
            Err(e) => {
                self.state.failed("listening error", &e);
                client.close().await;
                None
            }
        }
    }

    /// Listen here, connect to `source` from the remote side
    async fn listen_local(&self, client: &Arc<Client>, stop: CancellationToken) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(&self.tunnel.destination).await?;
        let (src_host, src_port) = split_endpoint(&self.tunnel.source)?;
        let client = Arc::clone(client);
        let state = Arc::clone(&self.state);
        let id = self.tunnel.id;

        Ok(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = stop.cancelled() => break,
                    r = listener.accept() => r,
                };
                let (conn, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(tunnel_id = id, "tunnel accept failed: {}", e);
                        state.failed("listening error", &e);
                        break;
                    }
                };
                let channel = match client
                    .open_direct_tcpip(&src_host, src_port, &peer.ip().to_string(), peer.port())
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::warn!(tunnel_id = id, "tunnel dial to {}:{} failed: {}", src_host, src_port, e);
                        state.note("dial error", &e);
                        continue;
                    }
                };
                tokio::spawn(pipe(conn, channel.into_stream(), stop.clone()));
            }
        }))
    }

    /// Listen on the remote side, connect to `source` from here
    async fn listen_remote(&self, client: &Arc<Client>, stop: CancellationToken) -> Result<JoinHandle<()>> {
        let (bind_host, bind_port) = split_endpoint(&self.tunnel.destination)?;
        let incoming = client.request_remote_forward(&bind_host, bind_port).await?;
        let source = self.tunnel.source.clone();
        let state = Arc::clone(&self.state);
        let id = self.tunnel.id;

        Ok(tokio::spawn(accept_forwarded(id, incoming, source, state, stop)))
    }
}

async fn accept_forwarded(
    id: i64,
    mut incoming: mpsc::Receiver<ForwardedChannel>,
    source: String,
    state: Arc<TunnelState>,
    stop: CancellationToken,
) {
    loop {
        let forwarded = tokio::select! {
            _ = stop.cancelled() => break,
            f = incoming.recv() => f,
        };
        let Some(forwarded) = forwarded else {
            state.failed("listening error", ServerError::Tunnel("remote listener closed".into()));
            break;
        };
        match TcpStream::connect(&source).await {
            Ok(conn) => {
                tracing::trace!(tunnel_id = id, from = %forwarded.originator, "forwarding remote connection");
                tokio::spawn(pipe(conn, forwarded.channel.into_stream(), stop.clone()));
            }
            Err(e) => {
                tracing::warn!(tunnel_id = id, "tunnel dial to {} failed: {}", source, e);
                state.note("dial error", &e);
            }
        }
    }
}

/// Copy both ways until either side closes or the tunnel stops
pub async fn pipe<A, B>(mut a: A, mut b: B, stop: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        r = tokio::io::copy_bidirectional(&mut a, &mut b) => {
            if let Err(e) = r {
                tracing::trace!("tunnel connection ended: {}", e);
            }
        }
        _ = stop.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Refuse;

    #[async_trait]
    impl Dialer for Refuse {
        async fn dial(&self, _host: &Host) -> Result<Arc<Client>> {
            Err(oms_transport::TransportError::Dial("connection refused".into()).into())
        }
    }

    fn tunnel() -> Tunnel {
        Tunnel {
            id: 1,
            mode: TunnelMode::Local,
            source: "127.0.0.1:80".into(),
            destination: "127.0.0.1:0".into(),
            status: false,
            error_msg: String::new(),
            host_id: 1,
        }
    }

    #[test]
    fn test_state_messages() {
        let state = TunnelState::default();
        assert!(!state.is_open());
        assert_eq!(state.error_msg(), "success");

        state.failed("listening error", "address in use");
        assert_eq!(state.error_msg(), "listening error, err: address in use");
        state.opened();
        assert!(state.is_open());
        assert_eq!(state.error_msg(), "success");
        state.note("dial error", "refused");
        assert!(state.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failure_is_retried() {
        let closer = CancellationToken::new();
        let worker = TunnelWorker::new(tunnel(), Host::default(), Arc::new(Refuse), closer.clone());
        let state = worker.state();
        let handle = tokio::spawn(worker.supervise());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!state.is_open());
        assert!(state.error_msg().starts_with("dial error, err: Failed to dial ssh"));

        tokio::time::sleep(MANAGE_INTERVAL * 2).await;
        assert!(!state.is_open());

        closer.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_copies_both_ways() {
        let (mut near, far_a) = tokio::io::duplex(64);
        let (far_b, mut remote) = tokio::io::duplex(64);
        let stop = CancellationToken::new();
        let task = tokio::spawn(pipe(far_a, far_b, stop.clone()));

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        stop.cancel();
        task.await.unwrap();
    }
}
