//! WebSocket subscriptions
//!
//! Frames are JSON `{type, data, event}`. `type = "file"` subscribes the
//! socket to upload progress; the same type with `event = "cancel"` drops
//! the subscription. Progress is pushed back as `{type: "file", data: [...]}`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ssh::FileProgress;
use crate::state::AppState;

pub const FILE_TYPE: &str = "file";
pub const CANCEL_EVENT: &str = "cancel";

const SUB_QUEUE: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
}

pub async fn handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let key = uuid::Uuid::new_v4().to_string();
    let (progress_tx, mut progress_rx) = mpsc::channel::<Vec<FileProgress>>(SUB_QUEUE);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(sub = %key, "websocket read failed: {}", e);
                        break;
                    }
                };
                let msg: WsMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(sub = %key, "ignoring malformed frame: {}", e);
                        continue;
                    }
                };
                match (msg.kind.as_str(), msg.event.as_str()) {
                    (FILE_TYPE, CANCEL_EVENT) => {
                        state.ssh.remove_file_list_sub(&key);
                        tracing::debug!(sub = %key, "upload progress unsubscribed");
                    }
                    (FILE_TYPE, _) => {
                        state.ssh.register_file_list_sub(key.clone(), progress_tx.clone());
                        tracing::debug!(sub = %key, "upload progress subscribed");
                    }
                    (other, _) => tracing::debug!(sub = %key, kind = other, "unknown message type"),
                }
            }
            Some(snapshot) = progress_rx.recv() => {
                let frame = WsMessage {
                    kind: FILE_TYPE.to_string(),
                    data: serde_json::to_value(&snapshot).unwrap_or(Value::Null),
                    event: String::new(),
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("failed to encode progress: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    state.ssh.remove_file_list_sub(&key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_shape() {
        let msg: WsMessage = serde_json::from_str(r#"{"type":"file","event":"cancel"}"#).unwrap();
        assert_eq!(msg.kind, "file");
        assert_eq!(msg.event, "cancel");
        assert_eq!(msg.data, Value::Null);

        let out = serde_json::to_value(WsMessage {
            kind: "file".into(),
            data: serde_json::json!([]),
            event: String::new(),
        })
        .unwrap();
        assert_eq!(out, serde_json::json!({"type": "file", "data": []}));
    }
}
