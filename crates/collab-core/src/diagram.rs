//! The diagram collaborator and an in-memory implementation.
//!
//! A `Diagram` owns the local cell graph. Every mutation carries an
//! `Origin`, and every effective mutation is recorded as a `DiagramEvent`
//! that the owner drains with `take_events`. Mutations that change nothing
//! record nothing.

use crate::cell::{Cell, CellData, CellDefaults, CellInit, EdgeInit, NodeInit, Point, Size};
use crate::events::Origin;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramEventKind {
    Added,
    Removed,
    Changed,
}

/// A recorded mutation. `cell` is the cell's state after the mutation
/// (before it, for removals).
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramEvent {
    pub kind: DiagramEventKind,
    pub cell: Cell,
    pub origin: Origin,
}

/// Interface the bridge requires from a diagramming canvas.
pub trait Diagram {
    /// Add a node. An init without an id gets a generated one. If a cell
    /// with that id already exists, the init is merged into it instead.
    fn add_node(&mut self, init: NodeInit, origin: Origin) -> Cell;

    fn add_edge(&mut self, init: EdgeInit, origin: Origin) -> Cell;

    /// Merge `init` into an existing cell in place.
    ///
    /// Returns false if the cell is missing or of the other variant.
    fn update_cell(&mut self, id: &str, init: CellInit, origin: Origin) -> bool;

    fn remove_cell(&mut self, id: &str, origin: Origin) -> Option<Cell>;

    fn cell(&self, id: &str) -> Option<&Cell>;

    fn cells(&self) -> Vec<&Cell>;

    /// Replace a cell's data payload.
    fn set_data(&mut self, id: &str, data: CellData, origin: Origin) -> bool;

    fn set_position(&mut self, id: &str, position: Point, origin: Origin) -> bool;

    fn set_size(&mut self, id: &str, size: Size, origin: Origin) -> bool;

    /// Translate a device (client) point into the diagram's local space.
    fn client_to_local(&self, client: Point) -> Point;

    /// Drain recorded events in mutation order.
    fn take_events(&mut self) -> Vec<DiagramEvent>;
}

/// Pan and zoom of the canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub translate: Point,
    pub scale: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            translate: Point::default(),
            scale: 1.0,
        }
    }
}

impl Viewport {
    pub fn client_to_local(&self, client: Point) -> Point {
        let scale = if self.scale.is_normal() { self.scale } else { 1.0 };
        Point::new(
            (client.x - self.translate.x) / scale,
            (client.y - self.translate.y) / scale,
        )
    }
}

/// In-memory diagram.
///
/// Selection is transient local state: it is not part of any cell and is
/// kept across in-place updates.
#[derive(Debug, Default)]
pub struct Graph {
    cells: BTreeMap<String, Cell>,
    defaults: CellDefaults,
    viewport: Viewport,
    selection: BTreeSet<String>,
    events: Vec<DiagramEvent>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: CellDefaults) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Select a cell. Returns false if it does not exist.
    pub fn select(&mut self, id: &str) -> bool {
        if self.cells.contains_key(id) {
            self.selection.insert(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn unselect(&mut self, id: &str) {
        self.selection.remove(id);
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selection.contains(id)
    }

    /// Ids of edges with an endpoint referencing a cell that is not present.
    pub fn dangling_edges(&self) -> Vec<&str> {
        self.cells
            .values()
            .filter_map(Cell::as_edge)
            .filter(|edge| {
                [&edge.source, &edge.target]
                    .into_iter()
                    .filter_map(|end| end.cell_id())
                    .any(|id| !self.cells.contains_key(id))
            })
            .map(|edge| edge.id.as_str())
            .collect()
    }

    fn record(&mut self, kind: DiagramEventKind, cell: Cell, origin: Origin) {
        self.events.push(DiagramEvent { kind, cell, origin });
    }

    fn insert(&mut self, mut init: CellInit, origin: Origin) -> Cell {
        let id = match init.id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        if self.cells.contains_key(&id) {
            init.set_id(id.as_str());
            if self.update_cell(&id, init.clone(), origin) {
                return self.cells[&id].clone();
            }
            // Same id, other variant: the new cell replaces the old one.
            self.remove_cell(&id, origin);
        }

        let cell = init.into_cell(id.clone(), &self.defaults);
        debug!("Adding {:?} {}", cell.kind(), id);
        self.cells.insert(id, cell.clone());
        self.record(DiagramEventKind::Added, cell.clone(), origin);
        cell
    }

    /// Apply `change` to a cell and record an event if anything changed.
    fn modify(&mut self, id: &str, origin: Origin, change: impl FnOnce(&mut Cell) -> bool) -> bool {
        let Some(cell) = self.cells.get_mut(id) else {
            return false;
        };
        let before = cell.clone();
        if !change(cell) {
            return false;
        }
        if *cell != before {
            let after = cell.clone();
            self.record(DiagramEventKind::Changed, after, origin);
        }
        true
    }
}

impl Diagram for Graph {
    fn add_node(&mut self, init: NodeInit, origin: Origin) -> Cell {
        self.insert(CellInit::Node(init), origin)
    }

    fn add_edge(&mut self, init: EdgeInit, origin: Origin) -> Cell {
        self.insert(CellInit::Edge(init), origin)
    }

    fn update_cell(&mut self, id: &str, init: CellInit, origin: Origin) -> bool {
        self.modify(id, origin, |cell| cell.merge(init))
    }

    fn remove_cell(&mut self, id: &str, origin: Origin) -> Option<Cell> {
        let cell = self.cells.remove(id)?;
        self.selection.remove(id);
        debug!("Removing {:?} {}", cell.kind(), id);
        self.record(DiagramEventKind::Removed, cell.clone(), origin);
        Some(cell)
    }

    fn cell(&self, id: &str) -> Option<&Cell> {
        self.cells.get(id)
    }

    fn cells(&self) -> Vec<&Cell> {
        self.cells.values().collect()
    }

    fn set_data(&mut self, id: &str, data: CellData, origin: Origin) -> bool {
        self.modify(id, origin, |cell| {
            *cell.data_mut() = data;
            true
        })
    }

    fn set_position(&mut self, id: &str, position: Point, origin: Origin) -> bool {
        if !position.is_finite() {
            return false;
        }
        self.modify(id, origin, |cell| match cell {
            Cell::Node(node) => {
                node.position = position;
                true
            }
            Cell::Edge(_) => false,
        })
    }

    fn set_size(&mut self, id: &str, size: Size, origin: Origin) -> bool {
        if !size.is_valid() {
            return false;
        }
        self.modify(id, origin, |cell| match cell {
            Cell::Node(node) => {
                node.size = size;
                true
            }
            Cell::Edge(_) => false,
        })
    }

    fn client_to_local(&self, client: Point) -> Point {
        self.viewport.client_to_local(client)
    }

    fn take_events(&mut self) -> Vec<DiagramEvent> {
        std::mem::take(&mut self.events)
    }
}
