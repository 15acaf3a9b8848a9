//! Diagram cell model.
//!
//! A cell is either a node or an edge. `Cell` is the fully materialized form
//! held by a diagram; `NodeInit`/`EdgeInit` carry every field as optional and
//! double as the replicated snapshot shape (camelCase JSON in the same layout
//! the canvas uses for `toJSON`).

use crate::replica_id::ReplicaId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form attribute tree, keyed by selector (`body`, `label`, ...).
pub type Attrs = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Finite and non-negative in both dimensions.
    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width >= 0.0 && self.height >= 0.0
    }
}

/// Advisory ownership tag stored in a cell's data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    /// Replica id of the owner.
    pub id: ReplicaId,
    pub name: String,
    pub color: String,
}

/// A cell's data payload.
///
/// `operator` is owned by the operator lock; every other key is application
/// data carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellData {
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CellData {
    /// Merge `incoming` into `self`: the operator is overwritten, fields are deep-merged.
    pub fn merge(&mut self, incoming: CellData) {
        self.operator = incoming.operator;
        for (key, value) in incoming.fields {
            merge_value(self.fields.entry(key).or_insert(Value::Null), value);
        }
    }
}

/// One end of an edge: another cell (possibly not yet present) or a free point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Cell {
        cell: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<String>,
    },
    Point(Point),
}

impl Endpoint {
    pub fn cell(id: impl Into<String>) -> Self {
        Endpoint::Cell {
            cell: id.into(),
            port: None,
        }
    }

    /// The referenced cell id, if this endpoint is attached to a cell.
    pub fn cell_id(&self) -> Option<&str> {
        match self {
            Endpoint::Cell { cell, .. } => Some(cell),
            Endpoint::Point(_) => None,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Point(Point::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub shape: String,
    pub position: Point,
    pub size: Size,
    pub attrs: Attrs,
    pub z_index: Option<i64>,
    pub data: CellData,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: String,
    pub shape: String,
    pub source: Endpoint,
    pub target: Endpoint,
    pub vertices: Vec<Point>,
    pub labels: Vec<Value>,
    pub attrs: Attrs,
    pub z_index: Option<i64>,
    pub data: CellData,
    pub extra: Map<String, Value>,
}

/// Which replicated map a cell variant lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CellKind {
    Node,
    Edge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Node(Node),
    Edge(Edge),
}

impl Cell {
    pub fn id(&self) -> &str {
        match self {
            Cell::Node(node) => &node.id,
            Cell::Edge(edge) => &edge.id,
        }
    }

    pub fn kind(&self) -> CellKind {
        match self {
            Cell::Node(_) => CellKind::Node,
            Cell::Edge(_) => CellKind::Edge,
        }
    }

    pub fn data(&self) -> &CellData {
        match self {
            Cell::Node(node) => &node.data,
            Cell::Edge(edge) => &edge.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut CellData {
        match self {
            Cell::Node(node) => &mut node.data,
            Cell::Edge(edge) => &mut edge.data,
        }
    }

    pub fn operator(&self) -> Option<&Operator> {
        self.data().operator.as_ref()
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Cell::Node(node) => Some(node),
            Cell::Edge(_) => None,
        }
    }

    pub fn as_edge(&self) -> Option<&Edge> {
        match self {
            Cell::Edge(edge) => Some(edge),
            Cell::Node(_) => None,
        }
    }

    /// Fully-populated init form of this cell.
    pub fn to_init(&self) -> CellInit {
        match self {
            Cell::Node(node) => CellInit::Node(NodeInit::from(node)),
            Cell::Edge(edge) => CellInit::Edge(EdgeInit::from(edge)),
        }
    }

    /// Merge an init of the same variant into this cell in place.
    ///
    /// Returns false (and leaves the cell untouched) on a variant mismatch.
    pub fn merge(&mut self, init: CellInit) -> bool {
        match (self, init) {
            (Cell::Node(node), CellInit::Node(init)) => {
                node.merge(init);
                true
            }
            (Cell::Edge(edge), CellInit::Edge(init)) => {
                edge.merge(init);
                true
            }
            _ => false,
        }
    }
}

/// Fallbacks used when an init omits geometry or shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CellDefaults {
    pub node_shape: String,
    pub node_size: Size,
    pub edge_shape: String,
}

impl Default for CellDefaults {
    fn default() -> Self {
        Self {
            node_shape: "rect".to_string(),
            node_size: Size::new(100.0, 40.0),
            edge_shape: "edge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attrs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CellData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeInit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Point::new(x, y));
        self
    }

    pub fn sized(mut self, width: f64, height: f64) -> Self {
        self.size = Some(Size::new(width, height));
        self
    }

    pub fn shape(mut self, shape: impl Into<String>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn data(mut self, data: CellData) -> Self {
        self.data = Some(data);
        self
    }

    /// Materialize into a node, filling gaps from `defaults`.
    ///
    /// The caller supplies the id; an id in the init is ignored.
    pub fn into_node(self, id: String, defaults: &CellDefaults) -> Node {
        Node {
            id,
            shape: self.shape.unwrap_or_else(|| defaults.node_shape.clone()),
            position: self.position.unwrap_or_default(),
            size: self.size.unwrap_or(defaults.node_size),
            attrs: self.attrs.unwrap_or_default(),
            z_index: self.z_index,
            data: self.data.unwrap_or_default(),
            extra: self.extra,
        }
    }
}

impl From<&Node> for NodeInit {
    fn from(node: &Node) -> Self {
        Self {
            id: Some(node.id.clone()),
            shape: Some(node.shape.clone()),
            position: Some(node.position),
            size: Some(node.size),
            attrs: Some(node.attrs.clone()),
            z_index: node.z_index,
            data: Some(node.data.clone()),
            extra: node.extra.clone(),
        }
    }
}

impl Node {
    /// Merge semantics follow the canvas's `prop()`: present scalars
    /// overwrite, attribute trees and data deep-merge, absent fields are kept.
    pub fn merge(&mut self, init: NodeInit) {
        if let Some(shape) = init.shape {
            self.shape = shape;
        }
        if let Some(position) = init.position {
            self.position = position;
        }
        if let Some(size) = init.size {
            self.size = size;
        }
        if let Some(attrs) = init.attrs {
            merge_map(&mut self.attrs, attrs);
        }
        if init.z_index.is_some() {
            self.z_index = init.z_index;
        }
        if let Some(data) = init.data {
            self.data.merge(data);
        }
        merge_map(&mut self.extra, init.extra);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertices: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attrs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CellData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EdgeInit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source = Some(Endpoint::cell(source));
        self.target = Some(Endpoint::cell(target));
        self
    }

    pub fn into_edge(self, id: String, defaults: &CellDefaults) -> Edge {
        Edge {
            id,
            shape: self.shape.unwrap_or_else(|| defaults.edge_shape.clone()),
            source: self.source.unwrap_or_default(),
            target: self.target.unwrap_or_default(),
            vertices: self.vertices.unwrap_or_default(),
            labels: self.labels.unwrap_or_default(),
            attrs: self.attrs.unwrap_or_default(),
            z_index: self.z_index,
            data: self.data.unwrap_or_default(),
            extra: self.extra,
        }
    }
}

impl From<&Edge> for EdgeInit {
    fn from(edge: &Edge) -> Self {
        Self {
            id: Some(edge.id.clone()),
            shape: Some(edge.shape.clone()),
            source: Some(edge.source.clone()),
            target: Some(edge.target.clone()),
            vertices: Some(edge.vertices.clone()),
            labels: Some(edge.labels.clone()),
            attrs: Some(edge.attrs.clone()),
            z_index: edge.z_index,
            data: Some(edge.data.clone()),
            extra: edge.extra.clone(),
        }
    }
}

impl Edge {
    pub fn merge(&mut self, init: EdgeInit) {
        if let Some(shape) = init.shape {
            self.shape = shape;
        }
        if let Some(source) = init.source {
            self.source = source;
        }
        if let Some(target) = init.target {
            self.target = target;
        }
        if let Some(vertices) = init.vertices {
            self.vertices = vertices;
        }
        if let Some(labels) = init.labels {
            self.labels = labels;
        }
        if let Some(attrs) = init.attrs {
            merge_map(&mut self.attrs, attrs);
        }
        if init.z_index.is_some() {
            self.z_index = init.z_index;
        }
        if let Some(data) = init.data {
            self.data.merge(data);
        }
        merge_map(&mut self.extra, init.extra);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellInit {
    Node(NodeInit),
    Edge(EdgeInit),
}

impl CellInit {
    pub fn kind(&self) -> CellKind {
        match self {
            CellInit::Node(_) => CellKind::Node,
            CellInit::Edge(_) => CellKind::Edge,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            CellInit::Node(init) => init.id.as_deref(),
            CellInit::Edge(init) => init.id.as_deref(),
        }
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = Some(id.into());
        match self {
            CellInit::Node(init) => init.id = id,
            CellInit::Edge(init) => init.id = id,
        }
    }

    pub fn into_cell(self, id: String, defaults: &CellDefaults) -> Cell {
        match self {
            CellInit::Node(init) => Cell::Node(init.into_node(id, defaults)),
            CellInit::Edge(init) => Cell::Edge(init.into_edge(id, defaults)),
        }
    }
}

fn merge_map(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        merge_value(target.entry(key).or_insert(Value::Null), value);
    }
}

/// Objects merge key by key; anything else overwrites.
fn merge_value(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => merge_map(target, source),
        (target, source) => *target = source,
    }
}
