//! Transport errors

use thiserror::Error;

/// Errors raised while dialing, authenticating or using a connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connect or SSH handshake failed
    #[error("Failed to dial ssh: {0}")]
    Dial(String),

    /// Dial did not finish within the fixed timeout
    #[error("Failed to dial ssh: i/o timeout after {0:?}")]
    DialTimeout(std::time::Duration),

    /// Every offered method was rejected, or one errored
    #[error("ssh: unable to authenticate, attempted methods [{methods}]: {reason}")]
    Auth { methods: String, reason: String },

    /// Private key material could not be decoded
    #[error("invalid private key: {0}")]
    Key(String),

    /// Channel or subsystem could not be opened on a live connection
    #[error("failed to open session: {0}")]
    SessionOpen(String),

    /// Command ran and exited non-zero
    #[error("Process exited with status {code}")]
    Exec { code: u32, output: Vec<u8> },

    /// Caller's deadline or cancel fired first
    #[error("{0}")]
    Cancelled(CancelReason),

    #[error("sftp: {0}")]
    Sftp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed locally or by the peer
    #[error("ssh connection closed")]
    Closed,

    /// Low-level protocol error
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
}

/// Why a cancellable operation stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    DeadlineExceeded,
    Canceled,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => f.write_str("context deadline exceeded"),
            CancelReason::Canceled => f.write_str("context canceled"),
        }
    }
}

impl From<russh_sftp::client::error::Error> for TransportError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        TransportError::Sftp(e.to_string())
    }
}

impl TransportError {
    /// Captured output for failed commands, empty otherwise
    pub fn output(&self) -> &[u8] {
        match self {
            TransportError::Exec { output, .. } => output,
            _ => &[],
        }
    }

    /// Whether the connection itself is unusable after this error
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::SessionOpen(_) | TransportError::Ssh(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
