//! A single client's WebSocket connection.
//!
//! The read half runs in its own task and forwards decoded room messages to
//! the server's event channel; the write half stays with the server.

use anyhow::{anyhow, Result};
use collab_core::protocol::{RoomMessage, MAX_MESSAGE_SIZE};
use collab_core::room::ConnectionId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A decoded message from the client.
    Message {
        conn_id: ConnectionId,
        message: RoomMessage,
    },
    /// The connection was closed.
    Closed { conn_id: ConnectionId },
}

/// A WebSocket connection to one client in one room.
pub struct ClientConnection {
    pub conn_id: ConnectionId,
    pub room: String,
    write: SplitSink<WebSocketStream<TcpStream>, Message>,
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap an upgraded stream and spawn its read task.
    pub fn new(
        conn_id: ConnectionId,
        room: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let read_task = tokio::spawn(async move {
            Self::read_loop(conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            room,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: ConnectionId,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from conn-{}", conn_id);
                            break;
                        }
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from conn-{} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match RoomMessage::from_bytes(&data) {
                        Ok(message) => {
                            let _ = event_tx.send(ConnectionEvent::Message { conn_id, message });
                        }
                        Err(e) => warn!("Undecodable message from conn-{}: {}", conn_id, e),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection conn-{} closed", conn_id);
                        }
                        _ => error!("WebSocket error on conn-{}: {}", conn_id, e),
                    }
                    break;
                }
                None => {
                    debug!("Connection conn-{} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send one message as a binary frame.
    pub async fn send(&mut self, message: &RoomMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.write
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| anyhow!("Failed to send {}: {}", message.name(), e))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
