//! One-shot command execution over a session channel

use std::sync::Arc;

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};

use crate::client::Client;
use crate::context::CallContext;
use crate::error::{CancelReason, Result, TransportError};
use crate::shell::Shell;
use crate::sudo::{sudo_command, SudoFilter};

/// Remote directory scripts are staged in
pub const SCRIPT_DIR: &str = "/tmp/script";

/// Exit code reported when the channel closed without an exit status
pub const EXIT_MISSING: u32 = 255;

/// Terminal size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 40 }
    }
}

/// A single session channel; consumed by whatever it runs.
pub struct Session {
    client: Arc<Client>,
    channel: Channel<Msg>,
    pty: Option<PtySize>,
}

impl Session {
    pub(crate) fn new(client: Arc<Client>, channel: Channel<Msg>, pty: Option<PtySize>) -> Self {
        Self {
            client,
            channel,
            pty,
        }
    }

    pub(crate) async fn with_pty(
        client: Arc<Client>,
        channel: Channel<Msg>,
        size: PtySize,
    ) -> Result<Self> {
        channel
            .request_pty(
                false,
                "xterm",
                size.cols,
                size.rows,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, 14400),
                    (Pty::TTY_OP_OSPEED, 14400),
                ],
            )
            .await
            .map_err(|e| TransportError::SessionOpen(format!("request pty: {e}")))?;
        Ok(Self::new(client, channel, Some(size)))
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn pty(&self) -> Option<PtySize> {
        self.pty
    }

    /// Run `cmd`, returning combined stdout and stderr
    pub async fn output(self, cmd: &str) -> Result<Vec<u8>> {
        self.run(cmd, None, &CallContext::new()).await
    }

    /// Like [`Session::output`] but stops early when `ctx` is done
    pub async fn output_context(self, cmd: &str, ctx: &CallContext) -> Result<Vec<u8>> {
        self.run(cmd, None, ctx).await
    }

    /// Run `cmd` through sudo, answering its prompt with `password`
    pub async fn sudo(self, cmd: &str, password: &str) -> Result<Vec<u8>> {
        self.run(cmd, Some(password), &CallContext::new()).await
    }

    pub async fn sudo_context(self, cmd: &str, password: &str, ctx: &CallContext) -> Result<Vec<u8>> {
        self.run(cmd, Some(password), ctx).await
    }

    /// Upload `body` to a temporary file, execute it and remove it.
    ///
    /// With `sudo` set the script runs through [`Session::sudo`] using the
    /// client's password.
    pub async fn run_script(self, body: &str, sudo: bool, ctx: &CallContext) -> Result<Vec<u8>> {
        let path = format!("{SCRIPT_DIR}/{}", uuid::Uuid::new_v4().simple());
        let client = Arc::clone(&self.client);
        client.write_file(body.as_bytes(), &path).await?;

        let cmd = format!("chmod +x {path} && {path}");
        let result = if sudo {
            let password = client.config().password.clone();
            self.run(&cmd, Some(&password), ctx).await
        } else {
            self.run(&cmd, None, ctx).await
        };

        if let Err(e) = client.remove(&path).await {
            tracing::warn!(host = %client.address(), path, "failed to remove script: {}", e);
        }
        result
    }

    /// Start an interactive login shell
    pub async fn shell(self) -> Result<Shell> {
        self.channel
            .request_shell(true)
            .await
            .map_err(|e| TransportError::SessionOpen(format!("request shell: {e}")))?;
        Ok(Shell::spawn(self.channel))
    }

    /// Run `cmd` and hand output chunks to `sink` as they arrive.
    ///
    /// Nothing is buffered, so a non-zero exit carries no output.
    pub async fn stream<F>(
        self,
        cmd: &str,
        sudo: Option<&str>,
        ctx: &CallContext,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) + Send,
    {
        self.exec(cmd, sudo, ctx, &mut sink).await.map(|_| ())
    }

    async fn run(self, cmd: &str, sudo: Option<&str>, ctx: &CallContext) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let result = self
            .exec(cmd, sudo, ctx, &mut |chunk: &[u8]| output.extend_from_slice(chunk))
            .await;
        match result {
            Ok(()) => Ok(output),
            Err(TransportError::Exec { code, .. }) => Err(TransportError::Exec { code, output }),
            Err(e) => Err(e),
        }
    }

    async fn exec(
        mut self,
        cmd: &str,
        sudo: Option<&str>,
        ctx: &CallContext,
        sink: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<()> {
        if let Some(reason) = ctx.err() {
            let _ = self.channel.close().await;
            return Err(TransportError::Cancelled(reason));
        }

        let (command, mut filter) = match sudo {
            Some(password) => (sudo_command(cmd), Some(SudoFilter::new(password))),
            None => (cmd.to_string(), None),
        };
        self.channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| TransportError::SessionOpen(format!("exec: {e}")))?;

        let outcome = tokio::select! {
            r = collect(&mut self.channel, filter.as_mut(), sink) => Outcome::Finished(r),
            reason = ctx.done() => Outcome::Cancelled(reason),
        };

        match outcome {
            Outcome::Cancelled(reason) => {
                let _ = self.channel.close().await;
                Err(TransportError::Cancelled(reason))
            }
            Outcome::Finished(result) => match result? {
                Some(0) => Ok(()),
                Some(code) => Err(TransportError::Exec {
                    code,
                    output: Vec::new(),
                }),
                None => Err(TransportError::Exec {
                    code: EXIT_MISSING,
                    output: Vec::new(),
                }),
            },
        }
    }
}

enum Outcome {
    Finished(Result<Option<u32>>),
    Cancelled(CancelReason),
}

/// Drain a channel into `sink` until it closes; returns the exit status
async fn collect(
    channel: &mut Channel<Msg>,
    mut filter: Option<&mut SudoFilter>,
    sink: &mut (dyn FnMut(&[u8]) + Send),
) -> Result<Option<u32>> {
    let mut code = None;
    let mut scratch = Vec::new();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                match filter.as_deref_mut() {
                    Some(filter) => {
                        let reply = filter.feed(data, &mut scratch);
                        if !scratch.is_empty() {
                            sink(&scratch);
                            scratch.clear();
                        }
                        if let Some(reply) = reply {
                            channel.data(&reply[..]).await.map_err(|_| {
                                TransportError::SessionOpen("failed to write sudo password".into())
                            })?;
                        }
                    }
                    None => sink(data),
                }
            }
            ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status),
            ChannelMsg::Failure => {
                return Err(TransportError::SessionOpen("exec request rejected".into()))
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    if let Some(filter) = filter {
        filter.finish(&mut scratch);
        if !scratch.is_empty() {
            sink(&scratch);
        }
    }
    Ok(code)
}
