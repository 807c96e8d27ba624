//! SSH transport for oms
//!
//! An authenticated [`Client`] per host, sessions for one-shot commands,
//! sudo and interactive shells, SFTP file operations, remote metrics and a
//! bounded [`ClientPool`] for reuse.

pub mod auth;
pub mod client;
pub mod context;
pub mod error;
pub mod pool;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod stats;
pub mod sudo;

pub use client::{Client, ClientConfig, ForwardedChannel, DIAL_TIMEOUT};
pub use context::CallContext;
pub use error::{CancelReason, Result, TransportError};
pub use pool::{pool_key, ClientPool, LruCache, PooledClient, DEFAULT_POOL_CAPACITY};
pub use session::{PtySize, Session};
pub use sftp::{parse_upload_path, RemoteFileInfo};
pub use shell::{Shell, ShellEvent};
pub use stats::{get_all_stats, Stats};
