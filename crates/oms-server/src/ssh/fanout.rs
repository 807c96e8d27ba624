//! Parallel dispatch of one command to many hosts
//!
//! One task per host; results come back over a channel sized to the host
//! count and the collector waits for exactly that many. Results are in
//! arrival order, so callers key them by `host_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oms_core::models::Host;
use oms_transport::{CallContext, PtySize, TransportError};
use serde::Serialize;
use tokio::sync::mpsc;

use super::manager::SshManager;
use crate::error::ServerError;
use crate::playbook::{Player, Step};

/// Per-call deadline when the caller does not pick one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What runs on each host
#[derive(Clone)]
pub enum Payload {
    /// A shell command line
    Shell(String),
    /// Built playbook steps, shared by every host
    Player(Arc<Vec<Box<dyn Step>>>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Shell(_) => "shell",
            Payload::Player(_) => "player",
        }
    }
}

#[derive(Clone)]
pub struct Command {
    pub payload: Payload,
    pub sudo: bool,
    pub pty: PtySize,
    pub timeout: Duration,
}

impl Command {
    pub fn shell(cmd: impl Into<String>, sudo: bool) -> Self {
        Self {
            payload: Payload::Shell(cmd.into()),
            sudo,
            pty: PtySize::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn player(steps: Vec<Box<dyn Step>>, sudo: bool) -> Self {
        Self {
            payload: Payload::Player(Arc::new(steps)),
            sudo,
            pty: PtySize::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_pty(mut self, pty: PtySize) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostResult {
    pub host_id: i64,
    #[serde(rename = "hostname")]
    pub host_name: String,
    pub addr: String,
    pub status: bool,
    pub msg: String,
}

impl HostResult {
    fn new(host: &Host, status: bool, msg: String) -> Self {
        Self {
            host_id: host.id,
            host_name: host.name.clone(),
            addr: host.addr.clone(),
            status,
            msg,
        }
    }
}

/// A failed run with whatever output it produced first
#[derive(Debug)]
pub struct ExecFailure {
    pub output: Vec<u8>,
    pub error: ServerError,
}

impl From<ServerError> for ExecFailure {
    fn from(error: ServerError) -> Self {
        Self {
            output: Vec::new(),
            error,
        }
    }
}

impl From<TransportError> for ExecFailure {
    fn from(error: TransportError) -> Self {
        ServerError::from(error).into()
    }
}

impl ExecFailure {
    /// Text reported as the host's `msg`.
    ///
    /// Cancellation reports the reason alone, a non-zero exit reports the
    /// captured output, anything else reports its error after any output.
    /// A playbook failure already carries the failing step's output in
    /// `output`, so the exit's own output is only used when it is empty.
    pub fn message(&self) -> String {
        match &self.error {
            ServerError::Transport(TransportError::Cancelled(reason)) => reason.to_string(),
            ServerError::Transport(e @ TransportError::Exec { .. }) => {
                let out = if self.output.is_empty() { e.output() } else { self.output.as_slice() };
                String::from_utf8_lossy(out).into_owned()
            }
            other if self.output.is_empty() => other.to_string(),
            other => format!("{}{}", String::from_utf8_lossy(&self.output), other),
        }
    }
}

/// Runs a command on a single host
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn execute(&self, host: &Host, command: &Command, call: &CallContext)
        -> Result<Vec<u8>, ExecFailure>;
}

#[async_trait]
impl HostExecutor for SshManager {
    async fn execute(&self, host: &Host, command: &Command, call: &CallContext)
        -> Result<Vec<u8>, ExecFailure> {
        match &command.payload {
            Payload::Shell(cmd) => {
                let session = self.open_session(host, Some(command.pty)).await?;
                let out = if command.sudo {
                    session.sudo_context(cmd, &host.password, call).await?
                } else {
                    session.output_context(cmd, call).await?
                };
                Ok(out)
            }
            Payload::Player(steps) => {
                let client = self.new_client(host).await?;
                Player::new(client, steps)
                    .run(command.sudo, command.pty, call)
                    .await
                    .map_err(|e| ExecFailure {
                        output: e.output,
                        error: e.source,
                    })
            }
        }
    }
}

/// Run `command` on every host in parallel and collect one result per host
pub async fn fan_out(
    executor: Arc<dyn HostExecutor>,
    hosts: Vec<Host>,
    command: Command,
    parent: &CallContext,
) -> Vec<HostResult> {
    let total = hosts.len();
    if total == 0 {
        return Vec::new();
    }

    let command = Arc::new(command);
    let (tx, mut rx) = mpsc::channel(total);
    for host in hosts {
        let tx = tx.clone();
        let executor = Arc::clone(&executor);
        let command = Arc::clone(&command);
        let call = parent.child().timeout(command.timeout);
        tokio::spawn(async move {
            let result = run_one(executor.as_ref(), &host, &command, &call).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(total);
    while results.len() < total {
        match rx.recv().await {
            Some(result) => results.push(result),
            // a worker panicked before reporting
            None => break,
        }
    }
    if results.len() < total {
        tracing::error!(expected = total, got = results.len(), "fan-out lost results");
    }
    results
}

async fn run_one(executor: &dyn HostExecutor, host: &Host, command: &Command, call: &CallContext) -> HostResult {
    let outcome = tokio::select! {
        r = executor.execute(host, command, call) => r,
        reason = call.done() => Err(TransportError::Cancelled(reason).into()),
    };
    match outcome {
        Ok(out) => HostResult::new(host, true, String::from_utf8_lossy(&out).into_owned()),
        Err(failure) => {
            tracing::debug!(host = %host.address(), kind = command.payload.kind(), "run failed: {}", failure.error);
            HostResult::new(host, false, failure.message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Scripted per-host behavior keyed by host name
    struct Scripted {
        outcomes: HashMap<String, Behavior>,
    }

    enum Behavior {
        Echo(&'static str),
        Exit(u32, &'static str),
        Hang,
        Refuse,
    }

    #[async_trait]
    impl HostExecutor for Scripted {
        async fn execute(&self, host: &Host, _command: &Command, _call: &CallContext)
            -> Result<Vec<u8>, ExecFailure> {
            match &self.outcomes[&host.name] {
                Behavior::Echo(out) => Ok(out.as_bytes().to_vec()),
                Behavior::Exit(code, out) => Err(TransportError::Exec {
                    code: *code,
                    output: out.as_bytes().to_vec(),
                }
                .into()),
                Behavior::Hang => std::future::pending().await,
                Behavior::Refuse => Err(TransportError::Dial("connection refused".into()).into()),
            }
        }
    }

    fn host(id: i64, name: &str) -> Host {
        Host {
            id,
            name: name.into(),
            addr: format!("10.0.0.{id}"),
            port: 22,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_host_reports() {
        let executor = Arc::new(Scripted {
            outcomes: HashMap::from([
                ("ok".to_string(), Behavior::Echo("42\n")),
                ("exit".to_string(), Behavior::Exit(1, "boom\n")),
                ("slow".to_string(), Behavior::Hang),
                ("down".to_string(), Behavior::Refuse),
            ]),
        });
        let hosts = vec![host(1, "ok"), host(2, "exit"), host(3, "slow"), host(4, "down")];
        let command = Command::shell("echo 42", false).with_timeout(Duration::from_secs(5));

        let mut results = fan_out(executor, hosts, command, &CallContext::new()).await;
        results.sort_by_key(|r| r.host_id);

        assert_eq!(results.len(), 4);
        assert!(results[0].status);
        assert_eq!(results[0].msg, "42\n");
        assert!(!results[1].status);
        assert_eq!(results[1].msg, "boom\n");
        assert!(!results[2].status);
        assert_eq!(results[2].msg, "context deadline exceeded");
        assert!(!results[3].status);
        assert!(results[3].msg.contains("Failed to dial ssh"));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_workers() {
        let executor = Arc::new(Scripted {
            outcomes: HashMap::from([("slow".to_string(), Behavior::Hang)]),
        });
        let parent = CallContext::new();
        parent.cancel();
        let results = fan_out(executor, vec![host(1, "slow")], Command::shell("x", false), &parent).await;
        assert_eq!(results[0].msg, "context canceled");
    }

    #[test]
    fn test_failure_message_keeps_partial_output() {
        let failure = ExecFailure {
            output: b"[Step      cmd] ==> one\nok\n".to_vec(),
            error: ServerError::Step("remote does not exist: /x".into()),
        };
        assert_eq!(
            failure.message(),
            "[Step      cmd] ==> one\nok\nstep error: remote does not exist: /x"
        );
    }

    #[test]
    fn test_failed_step_output_reported_once() {
        let failure = ExecFailure {
            output: b"[Step      cmd] ==> restart\nboom\n".to_vec(),
            error: TransportError::Exec {
                code: 1,
                output: b"boom\n".to_vec(),
            }
            .into(),
        };
        let msg = failure.message();
        assert_eq!(msg, "[Step      cmd] ==> restart\nboom\n");
        assert_eq!(msg.matches("boom").count(), 1);
    }

    #[tokio::test]
    async fn test_empty_target_set() {
        let executor = Arc::new(Scripted { outcomes: HashMap::new() });
        assert!(fan_out(executor, Vec::new(), Command::shell("x", false), &CallContext::new())
            .await
            .is_empty());
    }
}
