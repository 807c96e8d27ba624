//! Interactive shell over a PTY session
//!
//! The channel is owned by a pump task; callers talk to it through
//! bounded queues so input, resizes and output can be driven from
//! different tasks.

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};

const QUEUE: usize = 256;

/// Output from the remote shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(u32),
}

enum ShellInput {
    Data(Bytes),
    Resize { cols: u32, rows: u32 },
    Close,
}

/// Handle to a running shell
pub struct Shell {
    input: mpsc::Sender<ShellInput>,
    events: mpsc::Receiver<ShellEvent>,
    task: JoinHandle<()>,
}

impl Shell {
    pub(crate) fn spawn(channel: Channel<Msg>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(QUEUE);
        let (event_tx, event_rx) = mpsc::channel(QUEUE);
        let task = tokio::spawn(pump(channel, input_rx, event_tx));
        Self {
            input: input_tx,
            events: event_rx,
            task,
        }
    }

    /// Send keystrokes
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.input
            .send(ShellInput::Data(data.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn window_change(&self, rows: u32, cols: u32) -> Result<()> {
        self.input
            .send(ShellInput::Resize { cols, rows })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next output event, `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    /// Discard output until the shell exits
    pub async fn wait(mut self) -> Option<u32> {
        let mut code = None;
        while let Some(event) = self.events.recv().await {
            if let ShellEvent::Exit(c) = event {
                code = Some(c);
            }
        }
        let _ = self.task.await;
        code
    }

    pub async fn close(&self) {
        let _ = self.input.send(ShellInput::Close).await;
    }
}

enum Step {
    Input(Option<ShellInput>),
    Remote(Option<ChannelMsg>),
}

async fn pump(
    mut channel: Channel<Msg>,
    mut input: mpsc::Receiver<ShellInput>,
    events: mpsc::Sender<ShellEvent>,
) {
    loop {
        let step = tokio::select! {
            i = input.recv() => Step::Input(i),
            m = channel.wait() => Step::Remote(m),
        };

        match step {
            Step::Input(Some(ShellInput::Data(data))) => {
                if channel.data(&data[..]).await.is_err() {
                    break;
                }
            }
            Step::Input(Some(ShellInput::Resize { cols, rows })) => {
                if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                    tracing::debug!("window change failed: {}", e);
                }
            }
            Step::Input(Some(ShellInput::Close)) | Step::Input(None) => {
                let _ = channel.eof().await;
                let _ = channel.close().await;
                break;
            }
            Step::Remote(Some(ChannelMsg::Data { data })) => {
                if events.send(ShellEvent::Stdout(Bytes::copy_from_slice(&data))).await.is_err() {
                    break;
                }
            }
            Step::Remote(Some(ChannelMsg::ExtendedData { data, .. })) => {
                if events.send(ShellEvent::Stderr(Bytes::copy_from_slice(&data))).await.is_err() {
                    break;
                }
            }
            Step::Remote(Some(ChannelMsg::ExitStatus { exit_status })) => {
                let _ = events.send(ShellEvent::Exit(exit_status)).await;
            }
            Step::Remote(Some(ChannelMsg::Close)) | Step::Remote(None) => break,
            Step::Remote(Some(_)) => {}
        }
    }
}
