//! End-to-end tests for collab-relay.
//!
//! Runs the relay on a random port and talks to it over real WebSockets
//! with the room protocol.

use std::net::SocketAddr;
use std::time::Duration;

use collab_core::presence::{AwarenessEntry, AwarenessUpdate};
use collab_core::{CellKind, RoomMessage, SharedDocument};
use collab_relay::RelayServer;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Test client speaking raw room messages.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to a room and consume the relay's opening `SyncStep1`.
    async fn join(addr: SocketAddr, room: &str) -> Self {
        let url = format!("ws://{}/{}", addr, room);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        let mut client = Self { ws };

        let opening = client.recv().await;
        assert!(matches!(opening, RoomMessage::SyncStep1 { .. }), "got {:?}", opening);
        client
    }

    async fn recv(&mut self) -> RoomMessage {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return RoomMessage::from_bytes(&data).expect("Undecodable message");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    async fn recv_timeout(&mut self, duration: Duration) -> Option<RoomMessage> {
        timeout(duration, self.recv()).await.ok()
    }

    async fn send(&mut self, message: &RoomMessage) {
        let bytes = message.to_bytes().expect("Failed to encode");
        self.ws
            .send(Message::Binary(bytes.into()))
            .await
            .expect("Failed to send message");
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Start a relay on a random port.
async fn start_relay() -> SocketAddr {
    let listener = RelayServer::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(RelayServer::new().run(listener));
    addr
}

fn awareness(client: u64, clock: u32, state: Option<&str>) -> RoomMessage {
    RoomMessage::Awareness {
        update: AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client,
                clock,
                state: state.map(str::to_string),
            }],
        },
    }
}

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_sync_step1_is_answered() {
    let addr = start_relay().await;
    let mut client = TestClient::join(addr, "demo").await;

    let doc = SharedDocument::new();
    client
        .send(&RoomMessage::SyncStep1 {
            version: doc.encoded_version(),
        })
        .await;

    let reply = client.recv_timeout(WAIT).await.expect("No reply");
    assert!(matches!(reply, RoomMessage::SyncStep2 { .. }), "got {:?}", reply);
    client.close().await;
}

#[tokio::test]
async fn test_updates_fan_out_to_room() {
    let addr = start_relay().await;
    let mut a = TestClient::join(addr, "demo").await;
    let mut b = TestClient::join(addr, "demo").await;

    let doc_a = SharedDocument::new();
    doc_a
        .set(CellKind::Node, "n1", json!({"id": "n1", "shape": "rect"}))
        .unwrap();
    a.send(&RoomMessage::Update {
        update: doc_a.export_snapshot().unwrap(),
    })
    .await;

    let message = b.recv_timeout(WAIT).await.expect("No update relayed");
    let RoomMessage::Update { update } = message else {
        panic!("Expected Update, got {:?}", message);
    };
    let doc_b = SharedDocument::new();
    doc_b.import(&update).unwrap();
    assert!(doc_b.contains(CellKind::Node, "n1"));

    // The sender does not get its own update back.
    assert!(a.recv_timeout(Duration::from_millis(200)).await.is_none());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_late_joiner_pulls_room_state() {
    let addr = start_relay().await;
    let mut a = TestClient::join(addr, "demo").await;

    let doc_a = SharedDocument::new();
    doc_a.set(CellKind::Edge, "e1", json!({"id": "e1"})).unwrap();
    a.send(&RoomMessage::Update {
        update: doc_a.export_snapshot().unwrap(),
    })
    .await;
    // Let the relay apply the update before the next join.
    a.send(&RoomMessage::QueryAwareness).await;
    let _ = a.recv_timeout(WAIT).await;

    let mut b = TestClient::join(addr, "demo").await;
    let doc_b = SharedDocument::new();
    b.send(&RoomMessage::SyncStep1 {
        version: doc_b.encoded_version(),
    })
    .await;

    let RoomMessage::SyncStep2 { update } = b.recv_timeout(WAIT).await.expect("No reply") else {
        panic!("Expected SyncStep2");
    };
    doc_b.import(&update).unwrap();
    assert!(doc_b.contains(CellKind::Edge, "e1"));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let addr = start_relay().await;
    let mut a = TestClient::join(addr, "left").await;
    let mut b = TestClient::join(addr, "right").await;

    a.send(&awareness(1, 0, Some(r#"{"name":"a"}"#))).await;
    assert!(b.recv_timeout(Duration::from_millis(300)).await.is_none());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_awareness_is_tombstoned_on_leave() {
    let addr = start_relay().await;
    let mut a = TestClient::join(addr, "demo").await;
    a.send(&awareness(7, 3, Some(r#"{"name":"a"}"#))).await;
    let mut b = TestClient::join(addr, "demo").await;

    // Delivered on join or relayed, depending on which the relay saw first.
    let live = b.recv_timeout(WAIT).await.expect("No awareness");
    assert_eq!(live, awareness(7, 3, Some(r#"{"name":"a"}"#)));

    a.close().await;
    let message = b.recv_timeout(WAIT).await.expect("No tombstone");
    assert_eq!(message, awareness(7, 3, None));
    b.close().await;
}

#[tokio::test]
async fn test_root_path_joins_default_room() {
    let addr = start_relay().await;
    let mut root = TestClient::join(addr, "").await;
    let mut named = TestClient::join(addr, "x6-demo-room").await;

    root.send(&awareness(9, 0, Some("{}"))).await;
    let message = named.recv_timeout(WAIT).await.expect("Not in the same room");
    assert_eq!(message, awareness(9, 0, Some("{}")));

    root.close().await;
    named.close().await;
}
