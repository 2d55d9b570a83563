//! Shared type handles and the input/output value model.
//!
//! Handles are lightweight keys into the owning document: reads borrow
//! the [`Doc`], mutations go through an open [`Transaction`]. A handle
//! whose type no longer lives in a document fails with a detached-type
//! error instead of operating on stale data.

mod array;
mod map;
mod text;
mod xml;

pub use array::ArrayRef;
pub use map::MapRef;
pub use text::TextRef;
pub use xml::{TreeWalker, XmlElementRef, XmlFragmentRef, XmlTextRef};

pub(crate) use map::map_set;
pub(crate) use text::{text_format, text_insert};

use serde_json::Value;

use crate::doc::{Doc, DocError};
use crate::store::{Content, Item, TypeDescriptor, TypeKey, TypeKind, TypeNode};
use crate::transaction::Transaction;

/// Any attached shared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SharedRef {
    Text(TextRef),
    Array(ArrayRef),
    Map(MapRef),
    XmlElement(XmlElementRef),
    XmlFragment(XmlFragmentRef),
    XmlText(XmlTextRef),
}

impl SharedRef {
    pub(crate) fn from_key_kind(key: TypeKey, kind: TypeKind) -> Self {
        match kind {
            TypeKind::Text => SharedRef::Text(TextRef { key }),
            TypeKind::Array => SharedRef::Array(ArrayRef { key }),
            TypeKind::Map => SharedRef::Map(MapRef { key }),
            TypeKind::XmlElement => SharedRef::XmlElement(XmlElementRef { key }),
            TypeKind::XmlFragment => SharedRef::XmlFragment(XmlFragmentRef { key }),
            TypeKind::XmlText => SharedRef::XmlText(XmlTextRef { key }),
        }
    }

    pub(crate) fn key(&self) -> &TypeKey {
        match self {
            SharedRef::Text(r) => &r.key,
            SharedRef::Array(r) => &r.key,
            SharedRef::Map(r) => &r.key,
            SharedRef::XmlElement(r) => &r.key,
            SharedRef::XmlFragment(r) => &r.key,
            SharedRef::XmlText(r) => &r.key,
        }
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            SharedRef::Text(_) => TypeKind::Text,
            SharedRef::Array(_) => TypeKind::Array,
            SharedRef::Map(_) => TypeKind::Map,
            SharedRef::XmlElement(_) => TypeKind::XmlElement,
            SharedRef::XmlFragment(_) => TypeKind::XmlFragment,
            SharedRef::XmlText(_) => TypeKind::XmlText,
        }
    }

    /// JSON projection of the referenced type.
    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        match self {
            SharedRef::Text(r) => r.to_json(doc),
            SharedRef::Array(r) => r.to_json(doc),
            SharedRef::Map(r) => r.to_json(doc),
            SharedRef::XmlElement(r) => r.to_json(doc),
            SharedRef::XmlFragment(r) => r.to_json(doc),
            SharedRef::XmlText(r) => r.to_json(doc),
        }
    }
}

macro_rules! shared_ref_from {
    ($ref_ty:ident => $variant:ident) => {
        impl From<$ref_ty> for SharedRef {
            fn from(r: $ref_ty) -> Self {
                SharedRef::$variant(r)
            }
        }
        impl From<&$ref_ty> for SharedRef {
            fn from(r: &$ref_ty) -> Self {
                SharedRef::$variant(r.clone())
            }
        }
    };
}

shared_ref_from!(TextRef => Text);
shared_ref_from!(ArrayRef => Array);
shared_ref_from!(MapRef => Map);
shared_ref_from!(XmlElementRef => XmlElement);
shared_ref_from!(XmlFragmentRef => XmlFragment);
shared_ref_from!(XmlTextRef => XmlText);

impl From<&SharedRef> for SharedRef {
    fn from(r: &SharedRef) -> Self {
        r.clone()
    }
}

/// Value read out of a shared type: a plain JSON value or a handle to an
/// embedded shared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Out {
    Json(Value),
    Shared(SharedRef),
}

impl Out {
    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        match self {
            Out::Json(value) => Ok(value.clone()),
            Out::Shared(shared) => shared.to_json(doc),
        }
    }

    pub fn as_shared(&self) -> Option<&SharedRef> {
        match self {
            Out::Shared(shared) => Some(shared),
            Out::Json(_) => None,
        }
    }
}

/// Not-yet-attached text content, freely mutable until inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrelimText(pub String);

/// Not-yet-attached array content.
#[derive(Debug, Clone, Default)]
pub struct PrelimArray(pub Vec<In>);

/// Not-yet-attached map content (insertion-ordered pairs).
#[derive(Debug, Clone, Default)]
pub struct PrelimMap(pub Vec<(String, In)>);

/// Not-yet-attached XML element.
#[derive(Debug, Clone, Default)]
pub struct PrelimXmlElement {
    pub name: String,
    pub attributes: Vec<(String, In)>,
    pub children: Vec<XmlIn>,
}

impl PrelimXmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Not-yet-attached XML fragment.
#[derive(Debug, Clone, Default)]
pub struct PrelimXmlFragment(pub Vec<XmlIn>);

/// Not-yet-attached XML text run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrelimXmlText(pub String);

/// A node inserted into an XML child list.
#[derive(Debug, Clone)]
pub enum XmlIn {
    Element(PrelimXmlElement),
    Fragment(PrelimXmlFragment),
    Text(PrelimXmlText),
}

/// Value written into a shared type: a plain JSON value or a prelim
/// shared type that materializes on insertion.
#[derive(Debug, Clone)]
pub enum In {
    Json(Value),
    Text(PrelimText),
    Array(PrelimArray),
    Map(PrelimMap),
    XmlElement(PrelimXmlElement),
    XmlFragment(PrelimXmlFragment),
    XmlText(PrelimXmlText),
}

impl From<Value> for In {
    fn from(value: Value) -> Self {
        In::Json(value)
    }
}

impl From<&str> for In {
    fn from(value: &str) -> Self {
        In::Json(Value::String(value.to_string()))
    }
}

impl From<String> for In {
    fn from(value: String) -> Self {
        In::Json(Value::String(value))
    }
}

impl From<bool> for In {
    fn from(value: bool) -> Self {
        In::Json(Value::Bool(value))
    }
}

impl From<i64> for In {
    fn from(value: i64) -> Self {
        In::Json(Value::from(value))
    }
}

impl From<f64> for In {
    fn from(value: f64) -> Self {
        In::Json(Value::from(value))
    }
}

impl From<PrelimText> for In {
    fn from(value: PrelimText) -> Self {
        In::Text(value)
    }
}

impl From<PrelimArray> for In {
    fn from(value: PrelimArray) -> Self {
        In::Array(value)
    }
}

impl From<PrelimMap> for In {
    fn from(value: PrelimMap) -> Self {
        In::Map(value)
    }
}

impl From<XmlIn> for In {
    fn from(value: XmlIn) -> Self {
        match value {
            XmlIn::Element(e) => In::XmlElement(e),
            XmlIn::Fragment(f) => In::XmlFragment(f),
            XmlIn::Text(t) => In::XmlText(t),
        }
    }
}

pub(crate) fn descriptor_for(value: &In) -> Option<TypeDescriptor> {
    let (kind, node_name) = match value {
        In::Json(_) => return None,
        In::Text(_) => (TypeKind::Text, None),
        In::Array(_) => (TypeKind::Array, None),
        In::Map(_) => (TypeKind::Map, None),
        In::XmlElement(e) => (TypeKind::XmlElement, Some(e.name.clone())),
        In::XmlFragment(_) => (TypeKind::XmlFragment, None),
        In::XmlText(_) => (TypeKind::XmlText, None),
    };
    Some(TypeDescriptor { kind, node_name })
}

/// Attachment check shared by every read accessor.
pub(crate) fn require_node<'a>(doc: &'a Doc, key: &TypeKey) -> Result<&'a TypeNode, DocError> {
    doc.store.node(key).ok_or(DocError::DetachedType)
}

/// Output values carried by one item.
pub(crate) fn outs_of_item(item: &Item) -> Vec<Out> {
    match &item.content {
        Content::Values(values) => values.iter().cloned().map(Out::Json).collect(),
        Content::Embed(value) => vec![Out::Json(value.clone())],
        Content::Str(s) => vec![Out::Json(Value::String(s.clone()))],
        Content::Type(desc) => vec![Out::Shared(SharedRef::from_key_kind(
            TypeKey::Nested(item.id),
            desc.kind,
        ))],
        Content::Format { .. } | Content::Gc(_) => Vec::new(),
    }
}

/// Inserts a batch of input values into a sequence at a live index,
/// grouping adjacent JSON values into one run and materializing prelim
/// shared types in the same transaction.
pub(crate) fn seq_insert(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    index: u64,
    values: Vec<In>,
) -> Result<(), DocError> {
    if values.is_empty() {
        return Ok(());
    }
    let mut batch: Vec<Content> = Vec::new();
    let mut prelims: Vec<(usize, In)> = Vec::new();
    for value in values {
        match value {
            In::Json(json) => match batch.last_mut() {
                Some(Content::Values(run)) => run.push(json),
                _ => batch.push(Content::Values(vec![json])),
            },
            prelim => {
                if let Some(desc) = descriptor_for(&prelim) {
                    prelims.push((batch.len(), prelim));
                    batch.push(Content::Type(desc));
                }
            }
        }
    }
    let ids = txn.insert_content(key, index, batch)?;
    for (slot, prelim) in prelims {
        materialize(txn, TypeKey::Nested(ids[slot]), prelim)?;
    }
    Ok(())
}

/// Fills a freshly created nested type with its prelim content.
pub(crate) fn materialize(
    txn: &mut Transaction<'_>,
    key: TypeKey,
    prelim: In,
) -> Result<(), DocError> {
    match prelim {
        In::Json(_) => Ok(()),
        In::Text(text) => text_insert(txn, &key, 0, &text.0, None),
        In::XmlText(text) => text_insert(txn, &key, 0, &text.0, None),
        In::Array(array) => seq_insert(txn, &key, 0, array.0),
        In::Map(map) => {
            for (sub, value) in map.0 {
                map_set(txn, &key, &sub, value)?;
            }
            Ok(())
        }
        In::XmlElement(element) => {
            for (name, value) in element.attributes {
                map_set(txn, &key, &name, value)?;
            }
            seq_insert(
                txn,
                &key,
                0,
                element.children.into_iter().map(In::from).collect(),
            )
        }
        In::XmlFragment(fragment) => seq_insert(
            txn,
            &key,
            0,
            fragment.0.into_iter().map(In::from).collect(),
        ),
    }
}
