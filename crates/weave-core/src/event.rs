//! Change events and delta projections dispatched once per transaction.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{Out, SharedRef};

/// Formatting / attribute map attached to text runs and retain spans.
pub type Attrs = serde_json::Map<String, Value>;

/// One step of the path from a root type down to an event target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(String),
    Index(u64),
}

/// Text change projection: the retain/insert/delete(/attribute) sequence
/// consumed by rich-text editors and by undo inversion.
#[derive(Debug, Clone, PartialEq)]
pub enum TextDelta {
    Retain {
        len: u64,
        attributes: Option<Attrs>,
    },
    Insert {
        text: String,
        attributes: Option<Attrs>,
    },
    InsertEmbed {
        value: Value,
        attributes: Option<Attrs>,
    },
    Delete {
        len: u64,
    },
}

/// Sequence change projection for arrays and XML child lists.
#[derive(Debug, Clone, PartialEq)]
pub enum ListDelta {
    Retain { len: u64 },
    Insert { values: Vec<Out> },
    Delete { len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Add,
    Update,
    Delete,
}

/// Change of one map key or XML attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryChange {
    pub action: EntryAction,
    pub old_value: Option<Out>,
    pub new_value: Option<Out>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextEvent {
    pub target: SharedRef,
    pub path: Vec<PathStep>,
    pub delta: Vec<TextDelta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayEvent {
    pub target: SharedRef,
    pub path: Vec<PathStep>,
    pub delta: Vec<ListDelta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent {
    pub target: SharedRef,
    pub path: Vec<PathStep>,
    pub keys: HashMap<String, EntryChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlEvent {
    pub target: SharedRef,
    pub path: Vec<PathStep>,
    pub children: Vec<ListDelta>,
    pub attributes: HashMap<String, EntryChange>,
}

/// Event fired for one mutated shared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Text(TextEvent),
    Array(ArrayEvent),
    Map(MapEvent),
    Xml(XmlEvent),
}

impl Event {
    pub fn target(&self) -> &SharedRef {
        match self {
            Event::Text(e) => &e.target,
            Event::Array(e) => &e.target,
            Event::Map(e) => &e.target,
            Event::Xml(e) => &e.target,
        }
    }

    /// Path from the root type down to the target.
    pub fn path(&self) -> &[PathStep] {
        match self {
            Event::Text(e) => &e.path,
            Event::Array(e) => &e.path,
            Event::Map(e) => &e.path,
            Event::Xml(e) => &e.path,
        }
    }
}
