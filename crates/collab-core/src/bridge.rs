//! GraphBridge: routes changes between the local diagram and the shared maps.
//!
//! Outbound, diagram events become map writes through the `CellCodec`.
//! Inbound, map change sets become diagram mutations tagged `Origin::Remote`.
//! Each direction checks the origin once, at the top of its dispatch, and
//! drops what the other direction produced:
//!
//! - diagram events with `Origin::Remote` were caused by the bridge itself
//! - change sets with `Origin::Local` were caused by this replica's writes
//!
//! Remote application merges into existing cells in place so transient
//! local state (selection, an in-flight drag) survives.

use crate::cell::{Cell, CellInit, CellKind, Point, Size};
use crate::codec::CellCodec;
use crate::diagram::{Diagram, DiagramEvent, DiagramEventKind};
use crate::document::{ChangeAction, KeyChange, MapChangeSet, SharedDocument};
use crate::events::{Origin, Subscription};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, warn};

pub struct GraphBridge {
    codec: CellCodec,
    inbox: Rc<RefCell<VecDeque<MapChangeSet>>>,
    subscriptions: Vec<Subscription>,
}

impl GraphBridge {
    /// Start observing the document's maps.
    pub fn attach(doc: &SharedDocument, codec: CellCodec) -> Self {
        let inbox = Rc::new(RefCell::new(VecDeque::new()));
        let inbox_clone = Rc::clone(&inbox);
        let subscription = doc.observe(move |change_set| {
            inbox_clone.borrow_mut().push_back(change_set.clone());
        });

        Self {
            codec,
            inbox,
            subscriptions: vec![subscription],
        }
    }

    pub fn codec(&self) -> &CellCodec {
        &self.codec
    }

    pub fn is_attached(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Stop observing and forget undelivered change sets.
    pub fn detach(&mut self) {
        self.subscriptions.clear();
        self.inbox.borrow_mut().clear();
    }

    /// Publish every cell already in the diagram.
    pub fn sync_initial_state<D: Diagram + ?Sized>(&self, diagram: &D, doc: &SharedDocument) {
        for cell in diagram.cells() {
            self.write_cell(doc, cell);
        }
    }

    // ---- local -> shared ----

    pub fn on_local_cell_added(&self, doc: &SharedDocument, cell: &Cell) {
        self.write_cell(doc, cell);
    }

    pub fn on_local_cell_changed(&self, doc: &SharedDocument, cell: &Cell) {
        self.write_cell(doc, cell);
    }

    pub fn on_local_cell_removed(&self, doc: &SharedDocument, cell: &Cell) {
        if let Err(e) = doc.delete(cell.kind(), cell.id()) {
            warn!("Failed to delete {:?} {}: {}", cell.kind(), cell.id(), e);
        }
    }

    fn write_cell(&self, doc: &SharedDocument, cell: &Cell) {
        let snapshot = match self.codec.encode(cell) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to encode {:?} {}: {}", cell.kind(), cell.id(), e);
                return;
            }
        };

        if doc.get(cell.kind(), cell.id()).as_ref() == Some(&snapshot) {
            return;
        }

        if let Err(e) = doc.set(cell.kind(), cell.id(), snapshot) {
            warn!("Failed to write {:?} {}: {}", cell.kind(), cell.id(), e);
        }
    }

    pub fn dispatch_local(&self, doc: &SharedDocument, event: &DiagramEvent) {
        if event.origin.is_remote() {
            return;
        }

        match event.kind {
            DiagramEventKind::Added => self.on_local_cell_added(doc, &event.cell),
            DiagramEventKind::Changed => self.on_local_cell_changed(doc, &event.cell),
            DiagramEventKind::Removed => self.on_local_cell_removed(doc, &event.cell),
        }
    }

    /// Drain the diagram's events into the maps. Returns how many were drained.
    pub fn process_local<D: Diagram + ?Sized>(&self, diagram: &mut D, doc: &SharedDocument) -> usize {
        let events = diagram.take_events();
        for event in &events {
            self.dispatch_local(doc, event);
        }
        events.len()
    }

    // ---- shared -> local ----

    pub fn dispatch_remote<D: Diagram + ?Sized>(&self, diagram: &mut D, change_set: &MapChangeSet) {
        if change_set.origin.is_local() {
            return;
        }

        for change in &change_set.changes {
            self.on_remote_map_changed(diagram, change_set.kind, change);
        }
    }

    /// Apply queued change sets to the diagram. Returns how many were drained.
    pub fn process_remote<D: Diagram + ?Sized>(&self, diagram: &mut D) -> usize {
        let mut drained = 0;
        loop {
            let Some(change_set) = self.inbox.borrow_mut().pop_front() else {
                break;
            };
            self.dispatch_remote(diagram, &change_set);
            drained += 1;
        }
        drained
    }

    /// Apply one key's change. Failures are logged and leave the diagram as is.
    pub fn on_remote_map_changed<D: Diagram + ?Sized>(
        &self,
        diagram: &mut D,
        kind: CellKind,
        change: &KeyChange,
    ) {
        match (change.action, &change.value) {
            (ChangeAction::Delete, _) => {
                if diagram.remove_cell(&change.key, Origin::Remote).is_none() {
                    debug!("Remote delete of absent cell {}", change.key);
                }
            }
            (_, Some(value)) => self.apply_snapshot(diagram, kind, &change.key, value),
            (action, None) => warn!("Remote {:?} of {} carried no value", action, change.key),
        }
    }

    fn apply_snapshot<D: Diagram + ?Sized>(
        &self,
        diagram: &mut D,
        kind: CellKind,
        key: &str,
        value: &Value,
    ) {
        let snapshot = match self.codec.strip(value.clone()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Skipping remote {:?} {}: {}", kind, key, e);
                return;
            }
        };

        let mut init = match self.codec.decode(kind, snapshot.clone()) {
            Ok(init) => init,
            Err(e) => {
                warn!("Skipping remote {:?} {}: {}", kind, key, e);
                return;
            }
        };

        if let Some(id) = init.id().filter(|id| *id != key) {
            warn!("Remote {:?} snapshot id {} differs from key {}; using key", kind, id, key);
        }
        init.set_id(key);

        match diagram.cell(key) {
            Some(existing) if existing.kind() == kind => {
                if self.codec.encode(existing).ok().as_ref() == Some(&snapshot) {
                    return;
                }
                diagram.update_cell(key, init, Origin::Remote);
            }
            Some(_) => {
                debug!("Remote {:?} {} replaces a cell of the other kind", kind, key);
                diagram.remove_cell(key, Origin::Remote);
                Self::create(diagram, init);
            }
            None => Self::create(diagram, init),
        }
    }

    fn create<D: Diagram + ?Sized>(diagram: &mut D, init: CellInit) {
        match init {
            CellInit::Node(init) => {
                diagram.add_node(init, Origin::Remote);
            }
            CellInit::Edge(init) => {
                diagram.add_edge(init, Origin::Remote);
            }
        }
    }

    // ---- partial geometry writes ----

    /// Move a node. Rejects non-finite coordinates and missing nodes.
    pub fn update_node_position<D: Diagram + ?Sized>(&self, diagram: &mut D, id: &str, x: f64, y: f64) -> bool {
        let position = Point::new(x, y);
        if !position.is_finite() {
            warn!("Rejecting position ({}, {}) for {}", x, y, id);
            return false;
        }
        if diagram.cell(id).and_then(Cell::as_node).is_none() {
            warn!("Rejecting position for missing node {}", id);
            return false;
        }
        diagram.set_position(id, position, Origin::Local)
    }

    /// Resize a node. Rejects negative or non-finite sizes and missing nodes.
    pub fn update_node_size<D: Diagram + ?Sized>(
        &self,
        diagram: &mut D,
        id: &str,
        width: f64,
        height: f64,
    ) -> bool {
        let size = Size::new(width, height);
        if !size.is_valid() {
            warn!("Rejecting size {}x{} for {}", width, height, id);
            return false;
        }
        if diagram.cell(id).and_then(Cell::as_node).is_none() {
            warn!("Rejecting size for missing node {}", id);
            return false;
        }
        diagram.set_size(id, size, Origin::Local)
    }
}

impl Drop for GraphBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{EdgeInit, NodeInit, Operator};
    use crate::diagram::Graph;
    use crate::replica_id::ReplicaId;
    use serde_json::json;

    struct Replica {
        doc: SharedDocument,
        graph: Graph,
        bridge: GraphBridge,
    }

    impl Replica {
        fn new() -> Self {
            let doc = SharedDocument::new();
            let bridge = GraphBridge::attach(&doc, CellCodec::default());
            Self {
                doc,
                graph: Graph::new(),
                bridge,
            }
        }

        fn pump(&mut self) {
            self.bridge.process_remote(&mut self.graph);
            self.bridge.process_local(&mut self.graph, &self.doc);
            // Local writes queue Local change sets; drain them too.
            self.bridge.process_remote(&mut self.graph);
        }
    }

    fn exchange(from: &Replica, to: &mut Replica) {
        to.doc.import(&from.doc.export_snapshot().unwrap()).unwrap();
        to.pump();
    }

    #[test]
    fn test_add_node_writes_exactly_one_entry() {
        let mut replica = Replica::new();
        let writes = Rc::new(RefCell::new(0));
        let writes_clone = Rc::clone(&writes);
        let _sub = replica.doc.observe(move |set| {
            if set.origin.is_local() {
                *writes_clone.borrow_mut() += set.changes.len();
            }
        });

        replica.graph.add_node(NodeInit::new("n1").at(10.0, 10.0), Origin::Local);
        replica.pump();
        replica.pump();

        assert_eq!(*writes.borrow(), 1);
        assert_eq!(replica.doc.len(CellKind::Node), 1);
        assert!(replica.graph.take_events().is_empty());
    }

    #[test]
    fn test_remote_add_creates_cell() {
        let mut a = Replica::new();
        let mut b = Replica::new();

        a.graph.add_node(NodeInit::new("n1").at(10.0, 10.0), Origin::Local);
        a.pump();
        exchange(&a, &mut b);

        let node = b.graph.cell("n1").and_then(Cell::as_node).unwrap();
        assert_eq!(node.position, Point::new(10.0, 10.0));
        // Remote application never writes back.
        assert!(b.doc.get(CellKind::Node, "n1").is_some());
        assert!(b.graph.take_events().is_empty());
    }

    #[test]
    fn test_remote_apply_is_idempotent() {
        let mut replica = Replica::new();
        let change = KeyChange {
            key: "n1".into(),
            action: ChangeAction::Add,
            value: Some(json!({"id": "n1", "position": {"x": 1.0, "y": 2.0}})),
        };

        replica
            .bridge
            .on_remote_map_changed(&mut replica.graph, CellKind::Node, &change);
        let first = replica.graph.cell("n1").cloned();
        replica.graph.take_events();

        replica
            .bridge
            .on_remote_map_changed(&mut replica.graph, CellKind::Node, &change);
        assert_eq!(replica.graph.cell("n1").cloned(), first);
        assert!(replica.graph.take_events().is_empty());
    }

    #[test]
    fn test_remote_update_merges_in_place() {
        let mut replica = Replica::new();
        replica
            .graph
            .add_node(NodeInit::new("n1").at(0.0, 0.0), Origin::Remote);
        replica.graph.select("n1");

        let change = KeyChange {
            key: "n1".into(),
            action: ChangeAction::Update,
            value: Some(json!({"id": "n1", "position": {"x": 5.0, "y": 5.0}})),
        };
        replica
            .bridge
            .on_remote_map_changed(&mut replica.graph, CellKind::Node, &change);

        assert!(replica.graph.is_selected("n1"));
        let node = replica.graph.cell("n1").and_then(Cell::as_node).unwrap();
        assert_eq!(node.position, Point::new(5.0, 5.0));
    }

    #[test]
    fn test_remote_delete_absent_is_noop() {
        let mut replica = Replica::new();
        let change = KeyChange {
            key: "ghost".into(),
            action: ChangeAction::Delete,
            value: None,
        };
        replica
            .bridge
            .on_remote_map_changed(&mut replica.graph, CellKind::Node, &change);
        assert!(replica.graph.is_empty());
    }

    #[test]
    fn test_malformed_key_skipped_siblings_applied() {
        let mut replica = Replica::new();
        let change_set = MapChangeSet {
            kind: CellKind::Node,
            origin: Origin::Remote,
            changes: vec![
                KeyChange {
                    key: "bad".into(),
                    action: ChangeAction::Add,
                    value: Some(json!({"position": "nowhere"})),
                },
                KeyChange {
                    key: "good".into(),
                    action: ChangeAction::Add,
                    value: Some(json!({"id": "good"})),
                },
            ],
        };

        replica.bridge.dispatch_remote(&mut replica.graph, &change_set);
        assert!(replica.graph.cell("bad").is_none());
        assert!(replica.graph.cell("good").is_some());
    }

    #[test]
    fn test_local_change_sets_are_dropped() {
        let mut replica = Replica::new();
        let change_set = MapChangeSet {
            kind: CellKind::Node,
            origin: Origin::Local,
            changes: vec![KeyChange {
                key: "n1".into(),
                action: ChangeAction::Add,
                value: Some(json!({"id": "n1"})),
            }],
        };
        replica.bridge.dispatch_remote(&mut replica.graph, &change_set);
        assert!(replica.graph.is_empty());
    }

    #[test]
    fn test_key_wins_over_snapshot_id() {
        let mut replica = Replica::new();
        let change = KeyChange {
            key: "n1".into(),
            action: ChangeAction::Add,
            value: Some(json!({"id": "other"})),
        };
        replica
            .bridge
            .on_remote_map_changed(&mut replica.graph, CellKind::Node, &change);
        assert!(replica.graph.cell("n1").is_some());
        assert!(replica.graph.cell("other").is_none());
    }

    #[test]
    fn test_edge_with_dangling_endpoints() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        a.graph
            .add_edge(EdgeInit::new("e1").between("n1", "n2"), Origin::Local);
        a.pump();
        exchange(&a, &mut b);

        assert!(b.graph.cell("e1").is_some());
        assert_eq!(b.graph.dangling_edges(), vec!["e1"]);
    }

    #[test]
    fn test_deletion_propagates() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        a.graph.add_node(NodeInit::new("n1"), Origin::Local);
        a.pump();
        exchange(&a, &mut b);
        assert!(b.graph.cell("n1").is_some());

        a.graph.remove_cell("n1", Origin::Local);
        a.pump();
        assert!(!a.doc.contains(CellKind::Node, "n1"));

        exchange(&a, &mut b);
        assert!(b.graph.cell("n1").is_none());
    }

    #[test]
    fn test_operator_marker_travels() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        a.graph.add_node(NodeInit::new("n1"), Origin::Local);
        a.pump();
        exchange(&a, &mut b);

        let mut data = b.graph.cell("n1").unwrap().data().clone();
        data.operator = Some(Operator {
            id: ReplicaId::from(0xb),
            name: "bob".into(),
            color: "#0000ff".into(),
        });
        b.graph.set_data("n1", data, Origin::Local);
        b.pump();
        exchange(&b, &mut a);

        assert_eq!(a.graph.cell("n1").unwrap().operator().unwrap().name, "bob");
    }

    #[test]
    fn test_sync_initial_state() {
        let mut replica = Replica::new();
        replica.graph.add_node(NodeInit::new("n1"), Origin::Remote);
        replica.graph.add_node(NodeInit::new("n2"), Origin::Remote);

        replica.bridge.sync_initial_state(&replica.graph, &replica.doc);
        assert_eq!(replica.doc.len(CellKind::Node), 2);
    }

    #[test]
    fn test_geometry_validation() {
        let mut replica = Replica::new();
        replica.graph.add_node(NodeInit::new("n1").at(1.0, 1.0), Origin::Local);
        let before = replica.graph.cell("n1").cloned();

        assert!(!replica.bridge.update_node_position(&mut replica.graph, "n1", f64::NAN, 0.0));
        assert!(!replica.bridge.update_node_size(&mut replica.graph, "n1", -5.0, 10.0));
        assert!(!replica.bridge.update_node_position(&mut replica.graph, "ghost", 0.0, 0.0));
        assert_eq!(replica.graph.cell("n1").cloned(), before);

        assert!(replica.bridge.update_node_position(&mut replica.graph, "n1", 7.0, 8.0));
    }

    #[test]
    fn test_detach_stops_delivery() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        a.graph.add_node(NodeInit::new("n1"), Origin::Local);
        a.pump();

        b.bridge.detach();
        assert!(!b.bridge.is_attached());
        exchange(&a, &mut b);
        assert!(b.graph.is_empty());
    }
}
