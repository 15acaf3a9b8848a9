//! CellCodec: pure mapping between cells and their replicated snapshots.
//!
//! Snapshots are plain JSON values. Presentation-only fields (hover tools,
//! cursors, highlight filters, lock dimming) are derived locally by each
//! replica and are stripped before a snapshot is published or applied.

use crate::cell::{Cell, CellInit, CellKind, EdgeInit, NodeInit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Snapshot is not an object")]
    NotAnObject,

    #[error("Malformed {kind:?} snapshot: {source}")]
    Malformed {
        kind: CellKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Which fields of a snapshot never leave (or enter) a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresentationFilter {
    /// Top-level snapshot fields.
    pub fields: Vec<String>,
    /// Properties removed from every selector of `attrs` (and its `style` object).
    pub attr_props: Vec<String>,
}

impl Default for PresentationFilter {
    fn default() -> Self {
        Self {
            fields: vec!["tools".to_string()],
            attr_props: vec![
                "cursor".to_string(),
                "filter".to_string(),
                "opacity".to_string(),
            ],
        }
    }
}

impl PresentationFilter {
    /// A filter that strips nothing.
    pub fn none() -> Self {
        Self {
            fields: Vec::new(),
            attr_props: Vec::new(),
        }
    }

    fn strip(&self, snapshot: &mut Map<String, Value>) {
        for field in &self.fields {
            snapshot.remove(field);
        }
        if self.attr_props.is_empty() {
            return;
        }
        if let Some(Value::Object(attrs)) = snapshot.get_mut("attrs") {
            for selector in attrs.values_mut() {
                if let Value::Object(props) = selector {
                    self.strip_props(props);
                    if let Some(Value::Object(style)) = props.get_mut("style") {
                        self.strip_props(style);
                    }
                }
            }
        }
    }

    fn strip_props(&self, props: &mut Map<String, Value>) {
        for prop in &self.attr_props {
            props.remove(prop);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CellCodec {
    filter: PresentationFilter,
}

impl CellCodec {
    pub fn new(filter: PresentationFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &PresentationFilter {
        &self.filter
    }

    /// Full snapshot of a cell with presentation fields stripped.
    pub fn encode(&self, cell: &Cell) -> Result<Value> {
        let value = match cell.to_init() {
            CellInit::Node(init) => serde_json::to_value(init)?,
            CellInit::Edge(init) => serde_json::to_value(init)?,
        };
        self.strip(value)
    }

    /// Parse a snapshot of the given kind. Absent fields stay `None` so the
    /// diagram can apply its own defaults.
    pub fn decode(&self, kind: CellKind, snapshot: Value) -> Result<CellInit> {
        let snapshot = self.strip(snapshot)?;
        let init = match kind {
            CellKind::Node => CellInit::Node(
                serde_json::from_value::<NodeInit>(snapshot)
                    .map_err(|source| CodecError::Malformed { kind, source })?,
            ),
            CellKind::Edge => CellInit::Edge(
                serde_json::from_value::<EdgeInit>(snapshot)
                    .map_err(|source| CodecError::Malformed { kind, source })?,
            ),
        };
        Ok(init)
    }

    /// Remove presentation-only fields from a snapshot.
    pub fn strip(&self, snapshot: Value) -> Result<Value> {
        match snapshot {
            Value::Object(mut map) => {
                self.filter.strip(&mut map);
                Ok(Value::Object(map))
            }
            _ => Err(CodecError::NotAnObject),
        }
    }
}
