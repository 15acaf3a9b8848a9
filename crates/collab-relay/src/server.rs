//! WebSocket relay server.
//!
//! Accepts connections addressed as `ws://host:port/<room>`, feeds their
//! messages into a `RoomHub` and writes the hub's addressed replies back out.
//! Everything runs on one task; connections only own their read loops.

use crate::connection::{ClientConnection, ConnectionEvent};
use anyhow::Result;
use collab_core::protocol::room_from_path;
use collab_core::room::{ConnectionId, Outgoing, RoomHub};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, warn};

/// WebSocket relay holding every room's shared document.
pub struct RelayServer {
    hub: RoomHub,
    connections: HashMap<ConnectionId, ClientConnection>,
    next_conn_id: ConnectionId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            hub: RoomHub::new(),
            connections: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade a TCP connection and join it to the room named by its path.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let mut path = String::new();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };

        let mut ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without finishing the upgrade.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let room = match room_from_path(&path) {
            Ok(room) => room,
            Err(e) => {
                warn!("Rejecting {} ({}): {}", addr, path, e);
                let _ = ws_stream.close(None).await;
                return;
            }
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        info!("New connection from {} to room {} (conn-{})", addr, room, conn_id);

        let conn = ClientConnection::new(conn_id, room.clone(), ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);

        match self.hub.join(&room, conn_id) {
            Ok(outgoing) => self.deliver(outgoing).await,
            Err(e) => {
                error!("Failed to join conn-{} to {}: {}", conn_id, room, e);
                self.drop_connection(conn_id).await;
            }
        }
    }

    /// Wait for the next connection event.
    pub async fn recv_event(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Route one connection event through the hub.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn_id, message } => {
                debug!("{} from conn-{}", message.name(), conn_id);
                match self.hub.receive(conn_id, message) {
                    Ok(outgoing) => self.deliver(outgoing).await,
                    Err(e) => warn!("Dropping message from conn-{}: {}", conn_id, e),
                }
            }
            ConnectionEvent::Closed { conn_id } => {
                info!("Connection conn-{} closed", conn_id);
                self.connections.remove(&conn_id);
                let outgoing = self.hub.leave(conn_id);
                self.deliver(outgoing).await;
            }
        }
    }

    async fn deliver(&mut self, outgoing: Vec<Outgoing>) {
        let mut failed = Vec::new();
        for Outgoing { to, message } in outgoing {
            let Some(conn) = self.connections.get_mut(&to) else {
                debug!("Dropping {} for unknown conn-{}", message.name(), to);
                continue;
            };
            if let Err(e) = conn.send(&message).await {
                warn!("Failed to send to conn-{}: {}", to, e);
                failed.push(to);
            }
        }

        for conn_id in failed {
            self.drop_connection(conn_id).await;
        }
    }

    async fn drop_connection(&mut self, conn_id: ConnectionId) {
        if let Some(mut conn) = self.connections.remove(&conn_id) {
            conn.close().await;
        }
        let outgoing = self.hub.leave(conn_id);
        // Recursive through `deliver`.
        Box::pin(self.deliver(outgoing)).await;
    }

    /// Run the accept and event loop until the listener fails.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result?;
                    self.accept_connection(stream, addr).await;
                }
                Some(event) = self.recv_event() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.hub.room_count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }
}
