#![allow(dead_code)]

use collab_core::{CollabConfig, Collaboration, CollaborationBuilder, Graph, Identity, LoopbackHub, LoopbackTransport};

pub type Session = Collaboration<Graph, LoopbackTransport>;

pub const ROOM: &str = "demo";

/// A synced session joined to `hub`.
pub fn join(hub: &LoopbackHub, name: &str, color: &str) -> Session {
    join_with(hub, name, color, CollabConfig::for_room(ROOM))
}

pub fn join_with(hub: &LoopbackHub, name: &str, color: &str, config: CollabConfig) -> Session {
    let mut session = CollaborationBuilder::new(config)
        .diagram(Graph::new())
        .transport(hub.connect(ROOM).expect("Failed to connect"))
        .identity(Identity {
            name: name.to_string(),
            color: color.to_string(),
        })
        .build()
        .expect("Failed to build session");
    session.poll();
    session
}

/// Poll every session until nothing moves. A few rounds are always enough
/// for the loopback relay.
pub fn settle(sessions: &mut [&mut Session]) {
    for _ in 0..4 {
        for session in sessions.iter_mut() {
            session.poll();
        }
    }
}
