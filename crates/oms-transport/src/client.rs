//! Authenticated SSH connection to one host

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{self, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::sync::{mpsc, OnceCell, RwLock};

use crate::auth::{auth_methods, method_names, AuthMethod};
use crate::error::{Result, TransportError};
use crate::session::{PtySize, Session};

/// Fixed dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for protocol-level keepalives sent by russh
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Unanswered keepalives before russh drops the connection
pub const KEEPALIVE_MAX: usize = 3;

/// Queue depth for inbound remote-forward connections per bound port
const FORWARD_QUEUE: usize = 64;

/// Connection parameters
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// PEM private key, empty when unused
    pub key_bytes: Vec<u8>,
    pub passphrase: String,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            ..Default::default()
        }
    }

    /// `host:port`, bracketing bare IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn login_user(&self) -> &str {
        if self.user.is_empty() {
            "root"
        } else {
            &self.user
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &(!self.password.is_empty()))
            .field("key", &(!self.key_bytes.is_empty()))
            .finish()
    }
}

/// Connection the server opened back to us for a remote forward
pub struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub originator: String,
}

type ForwardRegistry = Arc<DashMap<u32, mpsc::Sender<ForwardedChannel>>>;

/// russh callback sink for one connection
struct ClientHandler {
    host: String,
    forwards: ForwardRegistry,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    /// Any presented host key is trusted.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        tracing::debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting server host key"
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let originator = format!("{originator_address}:{originator_port}");
        match self.forwards.get(&connected_port) {
            Some(tx) => {
                if tx.try_send(ForwardedChannel { channel, originator }).is_err() {
                    tracing::warn!(
                        host = %self.host,
                        port = connected_port,
                        "remote forward queue full, dropping connection"
                    );
                }
            }
            None => tracing::warn!(
                host = %self.host,
                bind = %format!("{connected_address}:{connected_port}"),
                "forwarded connection for unregistered port"
            ),
        }
        Ok(())
    }
}

/// One established, authenticated connection.
///
/// Cheap to share behind an `Arc`; sessions, SFTP and forwards multiplex
/// over the same transport.
pub struct Client {
    config: ClientConfig,
    handle: RwLock<Handle<ClientHandler>>,
    sftp: OnceCell<SftpSession>,
    forwards: ForwardRegistry,
    closed: AtomicBool,
}

impl Client {
    /// Dial and authenticate
    pub async fn connect(config: ClientConfig) -> Result<Arc<Client>> {
        let methods = auth_methods(&config)?;
        let forwards: ForwardRegistry = Arc::new(DashMap::new());

        let ssh_config = ssh_config();
        let handler = ClientHandler {
            host: config.address(),
            forwards: Arc::clone(&forwards),
        };

        tracing::debug!(host = %config.address(), user = %config.login_user(), "dialing");
        let mut handle = match tokio::time::timeout(
            DIAL_TIMEOUT,
            client::connect(Arc::new(ssh_config), config.address(), handler),
        )
        .await
        {
            Err(_) => return Err(TransportError::DialTimeout(DIAL_TIMEOUT)),
            Ok(Err(e)) => return Err(TransportError::Dial(e.to_string())),
            Ok(Ok(handle)) => handle,
        };

        authenticate(&mut handle, config.login_user(), &methods).await?;
        tracing::info!(host = %config.address(), "ssh connection established");

        Ok(Arc::new(Client {
            config,
            handle: RwLock::new(handle),
            sftp: OnceCell::new(),
            forwards,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `host:port` this client is connected to
    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Closed locally or dropped by the peer
    pub async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.read().await.is_closed()
    }

    pub(crate) async fn open_channel(&self) -> Result<Channel<Msg>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.handle
            .read()
            .await
            .channel_open_session()
            .await
            .map_err(|e| TransportError::SessionOpen(e.to_string()))
    }

    /// Plain session, no terminal
    pub async fn new_session(self: &Arc<Self>) -> Result<Session> {
        let channel = self.open_channel().await?;
        Ok(Session::new(Arc::clone(self), channel, None))
    }

    /// Session with an `xterm` PTY; needed for sudo and shells
    pub async fn new_session_with_pty(self: &Arc<Self>, size: PtySize) -> Result<Session> {
        let channel = self.open_channel().await?;
        Session::with_pty(Arc::clone(self), channel, size).await
    }

    /// Open and immediately close a session to prove the transport is alive
    pub async fn ping(&self) -> Result<()> {
        let channel = self.open_channel().await?;
        let _ = channel.close().await;
        Ok(())
    }

    /// Heartbeat: fails once the transport is gone or stops answering.
    ///
    /// The answering part is the `keepalive@openssh.com` global request
    /// russh sends every [`KEEPALIVE_INTERVAL`]; after [`KEEPALIVE_MAX`]
    /// misses it disconnects, which shows up here as `Closed`. No channel
    /// is opened.
    pub async fn keepalive(&self) -> Result<()> {
        if self.is_closed().await {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Lazily started SFTP subsystem
    pub async fn sftp(&self) -> Result<&SftpSession> {
        self.sftp
            .get_or_try_init(|| async {
                let channel = self.open_channel().await?;
                channel
                    .request_subsystem(true, "sftp")
                    .await
                    .map_err(|e| TransportError::Sftp(format!("subsystem request: {e}")))?;
                let session = SftpSession::new(channel.into_stream()).await?;
                tracing::debug!(host = %self.address(), "sftp subsystem ready");
                Ok::<_, TransportError>(session)
            })
            .await
    }

    /// Channel to `host:port` as seen from the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Result<Channel<Msg>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.handle
            .read()
            .await
            .channel_open_direct_tcpip(host, port.into(), originator, originator_port.into())
            .await
            .map_err(|e| TransportError::SessionOpen(format!("direct-tcpip {host}:{port}: {e}")))
    }

    /// Ask the server to listen on `bind_host:bind_port`; inbound
    /// connections arrive on the returned receiver.
    pub async fn request_remote_forward(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<mpsc::Receiver<ForwardedChannel>> {
        let (tx, rx) = mpsc::channel(FORWARD_QUEUE);
        self.forwards.insert(bind_port.into(), tx);

        let accepted = self
            .handle
            .write()
            .await
            .tcpip_forward(bind_host, bind_port.into())
            .await;
        match accepted {
            Ok(_) => Ok(rx),
            Err(russh::Error::RequestDenied) => {
                self.forwards.remove(&u32::from(bind_port));
                Err(TransportError::SessionOpen(format!(
                    "ssh: tcpip-forward request denied by peer for {bind_host}:{bind_port}"
                )))
            }
            Err(e) => {
                self.forwards.remove(&u32::from(bind_port));
                Err(e.into())
            }
        }
    }

    /// Stop a remote listener started with [`Client::request_remote_forward`]
    pub async fn cancel_remote_forward(&self, bind_host: &str, bind_port: u16) -> Result<()> {
        self.forwards.remove(&u32::from(bind_port));
        if self.is_closed().await {
            return Ok(());
        }
        self.handle
            .read()
            .await
            .cancel_tcpip_forward(bind_host, bind_port.into())
            .await?;
        Ok(())
    }

    /// Disconnect. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.forwards.clear();
        if let Some(sftp) = self.sftp.get() {
            let _ = sftp.close().await;
        }
        let handle = self.handle.read().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(host = %self.address(), "disconnect: {}", e);
        }
        tracing::debug!(host = %self.address(), "ssh connection closed");
    }
}

fn ssh_config() -> client::Config {
    client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    methods: &[AuthMethod],
) -> Result<()> {
    let mut reason = String::from("no authentication methods configured");

    for method in methods {
        let outcome = match method {
            AuthMethod::PublicKey(key) => handle
                .authenticate_publickey(user, Arc::clone(key))
                .await
                .map_err(|e| e.to_string()),
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| e.to_string()),
            AuthMethod::Agent => authenticate_with_agent(handle, user).await,
        };

        match outcome {
            Ok(true) => {
                tracing::debug!(user, method = method.name(), "authenticated");
                return Ok(());
            }
            Ok(false) => reason = format!("{} rejected", method.name()),
            Err(e) => reason = e,
        }
    }

    Err(TransportError::Auth {
        methods: method_names(methods),
        reason,
    })
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> std::result::Result<bool, String> {
    use russh_keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("agent: {e}"))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("agent identities: {e}"))?;

    for key in identities {
        let (returned, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned;
        if let Ok(true) = result {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<ClientHandler>,
    _user: &str,
) -> std::result::Result<bool, String> {
    Err("agent: not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_brackets_ipv6() {
        assert_eq!(ClientConfig::new("10.1.1.1", 22, "u").address(), "10.1.1.1:22");
        assert_eq!(ClientConfig::new("fe80::1", 2222, "u").address(), "[fe80::1]:2222");
        assert_eq!(ClientConfig::new("host.lan", 22, "u").address(), "host.lan:22");
    }

    #[test]
    fn test_login_user_defaults_to_root() {
        assert_eq!(ClientConfig::new("h", 22, "").login_user(), "root");
        assert_eq!(ClientConfig::new("h", 22, "ops").login_user(), "ops");
    }

    #[test]
    fn test_transport_sends_keepalive_requests() {
        let c = ssh_config();
        assert_eq!(c.keepalive_interval, Some(KEEPALIVE_INTERVAL));
        assert_eq!(c.keepalive_max, KEEPALIVE_MAX);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mut c = ClientConfig::new("h", 22, "ops");
        c.password = "hunter2".into();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = ClientConfig::new("127.0.0.1", port, "root");
        config.password = "pw".into();
        match Client::connect(config).await {
            Err(e @ TransportError::Dial(_)) => {
                assert!(e.to_string().starts_with("Failed to dial ssh"))
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
