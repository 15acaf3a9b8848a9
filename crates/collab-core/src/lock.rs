//! Operator lock: advisory, data-embedded ownership of a cell.
//!
//! A claim is a plain write of `data.operator`, not a compare-and-swap.
//! Two replicas that both observe an unowned cell can both claim it; the
//! replicated map then keeps one of the two writes on every replica, and
//! the losing replica sees the winner on its next `can_operate`.

use crate::cell::Operator;
use crate::diagram::Diagram;
use crate::events::Origin;
use tracing::debug;

/// The only writer of `operator` markers.
#[derive(Debug, Clone)]
pub struct OperatorLock {
    me: Operator,
}

impl OperatorLock {
    pub fn new(me: Operator) -> Self {
        Self { me }
    }

    /// The marker this replica writes when it claims a cell.
    pub fn operator(&self) -> &Operator {
        &self.me
    }

    fn is_mine(&self, operator: &Operator) -> bool {
        operator.id == self.me.id
    }

    /// Claim the cell if nobody holds it.
    ///
    /// Succeeds without a write if this replica already holds it. Fails for
    /// a cell held by another replica or missing from the diagram.
    pub fn try_acquire<D: Diagram + ?Sized>(&self, diagram: &mut D, id: &str) -> bool {
        let Some(cell) = diagram.cell(id) else {
            debug!("try_acquire: no cell {}", id);
            return false;
        };

        match cell.operator() {
            Some(operator) if self.is_mine(operator) => true,
            Some(operator) => {
                debug!("try_acquire: {} is held by {}", id, operator.id);
                false
            }
            None => {
                let mut data = cell.data().clone();
                data.operator = Some(self.me.clone());
                diagram.set_data(id, data, Origin::Local)
            }
        }
    }

    /// Drop this replica's claim. Another replica's claim is left alone.
    pub fn release<D: Diagram + ?Sized>(&self, diagram: &mut D, id: &str) {
        let Some(cell) = diagram.cell(id) else {
            return;
        };

        match cell.operator() {
            Some(operator) if self.is_mine(operator) => {
                let mut data = cell.data().clone();
                data.operator = None;
                diagram.set_data(id, data, Origin::Local);
            }
            Some(operator) => debug!("release: {} is held by {}", id, operator.id),
            None => {}
        }
    }

    /// Whether this replica may interact with the cell right now.
    ///
    /// Callers re-check before every mutating action instead of caching a grant.
    pub fn can_operate<D: Diagram + ?Sized>(&self, diagram: &D, id: &str) -> bool {
        diagram
            .cell(id)
            .is_some_and(|cell| cell.operator().is_none_or(|operator| self.is_mine(operator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::NodeInit;
    use crate::diagram::{DiagramEventKind, Graph};
    use crate::replica_id::ReplicaId;

    fn operator(id: u64) -> Operator {
        Operator {
            id: ReplicaId::from(id),
            name: format!("user-{:x}", id),
            color: "#00ff00".to_string(),
        }
    }

    fn graph_with_node() -> Graph {
        let mut graph = Graph::new();
        graph.add_node(NodeInit::new("n1"), Origin::Remote);
        graph.take_events();
        graph
    }

    #[test]
    fn test_acquire_free_cell() {
        let mut graph = graph_with_node();
        let lock = OperatorLock::new(operator(0xa));

        assert!(lock.try_acquire(&mut graph, "n1"));
        assert_eq!(graph.cell("n1").unwrap().operator(), Some(&operator(0xa)));
        assert!(lock.can_operate(&graph, "n1"));

        let events = graph.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DiagramEventKind::Changed);
        assert_eq!(events[0].origin, Origin::Local);
    }

    #[test]
    fn test_reacquire_own_claim_does_not_write() {
        let mut graph = graph_with_node();
        let lock = OperatorLock::new(operator(0xa));

        assert!(lock.try_acquire(&mut graph, "n1"));
        graph.take_events();
        assert!(lock.try_acquire(&mut graph, "n1"));
        assert!(graph.take_events().is_empty());
    }

    #[test]
    fn test_denied_when_held_by_other() {
        let mut graph = graph_with_node();
        let a = OperatorLock::new(operator(0xa));
        let b = OperatorLock::new(operator(0xb));

        assert!(a.try_acquire(&mut graph, "n1"));
        graph.take_events();

        assert!(!b.try_acquire(&mut graph, "n1"));
        assert!(!b.can_operate(&graph, "n1"));
        assert!(graph.take_events().is_empty());
    }

    #[test]
    fn test_release_only_own_claim() {
        let mut graph = graph_with_node();
        let a = OperatorLock::new(operator(0xa));
        let b = OperatorLock::new(operator(0xb));

        a.try_acquire(&mut graph, "n1");
        b.release(&mut graph, "n1");
        assert_eq!(graph.cell("n1").unwrap().operator(), Some(&operator(0xa)));

        a.release(&mut graph, "n1");
        assert!(graph.cell("n1").unwrap().operator().is_none());
        assert!(b.can_operate(&graph, "n1"));
    }

    #[test]
    fn test_missing_cell() {
        let mut graph = Graph::new();
        let lock = OperatorLock::new(operator(0xa));
        assert!(!lock.try_acquire(&mut graph, "ghost"));
        assert!(!lock.can_operate(&graph, "ghost"));
        lock.release(&mut graph, "ghost");
    }
}
