//! collab-core: real-time collaboration for node/edge diagrams over Loro CRDTs.
//!
//! This crate provides:
//! - A two-way bridge between a local diagram and two shared Loro maps
//! - Presence (cursor and identity) over an awareness channel
//! - A soft per-cell operator lock
//! - A sans-IO provider and an in-process room relay for the sync protocol
//!
//! ```
//! use collab_core::ReplicaId;
//!
//! let id = ReplicaId::generate();
//! let parsed: ReplicaId = id.to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

pub mod bridge;
pub mod cell;
pub mod codec;
pub mod collaboration;
pub mod config;
pub mod diagram;
pub mod document;
pub mod events;
pub mod lifecycle;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod replica_id;
pub mod room;
pub mod storage;
pub mod transport;

pub use bridge::GraphBridge;
pub use cell::{Cell, CellData, CellInit, CellKind, Edge, EdgeInit, Endpoint, Node, NodeInit, Operator, Point, Size};
pub use codec::{CellCodec, CodecError, PresentationFilter};
pub use collaboration::{CollabError, Collaboration, CollaborationBuilder};
pub use config::{CollabConfig, ConfigError};
pub use diagram::{Diagram, DiagramEvent, DiagramEventKind, Graph, Viewport};
pub use document::{DocumentError, MapChangeSet, SharedDocument};
pub use events::{EventBus, Origin, Subscription};
pub use lifecycle::{SyncLifecycle, SyncState};
pub use lock::OperatorLock;
pub use presence::{Awareness, PresenceManager, PresencePolicy, PresenceState};
pub use protocol::{ProtocolError, RoomMessage};
pub use provider::{Provider, ProviderEvent};
pub use replica_id::ReplicaId;
pub use room::{ConnectionId, RoomError, RoomHub};
pub use storage::{Identity, IdentityProvider, KeyValueStore, StorageService, StoredIdentity};
pub use transport::{LoopbackHub, LoopbackTransport, Transport, TransportEvent};
