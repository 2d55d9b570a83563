//! Shared XML tree: fragments, elements and formatted text nodes.
//!
//! An element is composition, not inheritance: it holds an attribute map
//! and an ordered child sequence, both backed by the same item store as
//! every other shared type.

use serde_json::Value;

use crate::doc::{Doc, DocError};
use crate::event::{Attrs, TextDelta};
use crate::store::{apply_attr, Content, TypeKey};
use crate::transaction::Transaction;

use super::map::map_set;
use super::text::{text_apply_delta, text_format, text_insert, text_insert_embed, text_string};
use super::{outs_of_item, require_node, seq_insert, In, Out, SharedRef, XmlIn};

/// Handle to an XML fragment: an ordered list of XML nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XmlFragmentRef {
    pub(crate) key: TypeKey,
}

/// Handle to an XML element: a named node with attributes and children.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XmlElementRef {
    pub(crate) key: TypeKey,
}

/// Handle to an XML text node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XmlTextRef {
    pub(crate) key: TypeKey,
}

/// Live child nodes of an XML parent, in document order.
fn xml_children(doc: &Doc, key: &TypeKey) -> Result<Vec<SharedRef>, DocError> {
    let node = require_node(doc, key)?;
    let mut out = Vec::new();
    for item in node.seq.iter().filter(|item| !item.deleted) {
        if let Content::Type(_) = &item.content {
            out.extend(outs_of_item(item).into_iter().filter_map(|o| match o {
                Out::Shared(shared) => Some(shared),
                Out::Json(_) => None,
            }));
        }
    }
    Ok(out)
}

fn xml_get(doc: &Doc, key: &TypeKey, index: u64) -> Result<Option<SharedRef>, DocError> {
    Ok(xml_children(doc, key)?.into_iter().nth(index as usize))
}

fn xml_insert(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    index: u64,
    nodes: Vec<XmlIn>,
) -> Result<(), DocError> {
    seq_insert(txn, key, index, nodes.into_iter().map(In::from).collect())
}

fn xml_insert_after(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    reference: Option<&SharedRef>,
    nodes: Vec<XmlIn>,
) -> Result<(), DocError> {
    let index = match reference {
        None => 0,
        Some(shared) => {
            let node = require_node(txn.doc(), key)?;
            let TypeKey::Nested(id) = shared.key() else {
                return Err(DocError::DetachedType);
            };
            let mut count = 0u64;
            let mut found = None;
            for item in &node.seq {
                if item.contains(*id) {
                    found = Some(count + u64::from(!item.deleted));
                    break;
                }
                count += item.visible_len();
            }
            found.ok_or(DocError::DetachedType)?
        }
    };
    xml_insert(txn, key, index, nodes)
}

/// Previous/next live sibling of a nested XML node.
fn xml_sibling(
    doc: &Doc,
    key: &TypeKey,
    forward: bool,
) -> Result<Option<SharedRef>, DocError> {
    let TypeKey::Nested(id) = key else {
        return Ok(None);
    };
    let node = require_node(doc, key)?;
    let Some(parent) = node.parent.clone() else {
        return Ok(None);
    };
    let parent_node = require_node(doc, &parent)?;
    let mut prev: Option<SharedRef> = None;
    let mut take_next = false;
    for item in parent_node.seq.iter() {
        let shared = match &item.content {
            Content::Type(_) if !item.deleted => {
                outs_of_item(item).into_iter().find_map(|o| match o {
                    Out::Shared(s) => Some(s),
                    Out::Json(_) => None,
                })
            }
            _ => None,
        };
        if item.contains(*id) {
            if forward {
                take_next = true;
                continue;
            }
            return Ok(prev);
        }
        if take_next {
            if shared.is_some() {
                return Ok(shared);
            }
            continue;
        }
        if shared.is_some() {
            prev = shared;
        }
    }
    Ok(None)
}

/// Lazy, restartable depth-first walk over the descendants of an XML
/// node, yielding those matching the filter. The walker borrows the
/// document, so structural mutation mid-walk is excluded by construction.
pub struct TreeWalker<'doc, F>
where
    F: Fn(&SharedRef) -> bool,
{
    doc: &'doc Doc,
    stack: Vec<SharedRef>,
    filter: F,
}

impl<'doc, F> TreeWalker<'doc, F>
where
    F: Fn(&SharedRef) -> bool,
{
    fn new(doc: &'doc Doc, root: &TypeKey, filter: F) -> Result<Self, DocError> {
        let mut stack = xml_children(doc, root)?;
        stack.reverse();
        Ok(Self { doc, stack, filter })
    }
}

impl<'doc, F> Iterator for TreeWalker<'doc, F>
where
    F: Fn(&SharedRef) -> bool,
{
    type Item = SharedRef;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if matches!(
                node,
                SharedRef::XmlElement(_) | SharedRef::XmlFragment(_)
            ) {
                if let Ok(mut children) = xml_children(self.doc, node.key()) {
                    children.reverse();
                    self.stack.append(&mut children);
                }
            }
            if (self.filter)(&node) {
                return Some(node);
            }
        }
        None
    }
}

fn attr_value_string(doc: &Doc, value: &Out) -> Result<String, DocError> {
    Ok(match value.to_json(doc)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Depth-first XML serialization.
pub(crate) fn xml_to_string(doc: &Doc, node: &SharedRef) -> Result<String, DocError> {
    let mut out = String::new();
    write_xml(doc, node, &mut out)?;
    Ok(out)
}

fn write_xml(doc: &Doc, node: &SharedRef, out: &mut String) -> Result<(), DocError> {
    match node {
        SharedRef::XmlFragment(fragment) => {
            for child in xml_children(doc, &fragment.key)? {
                write_xml(doc, &child, out)?;
            }
        }
        SharedRef::XmlElement(element) => {
            let name = require_node(doc, &element.key)?
                .node_name
                .clone()
                .unwrap_or_default();
            out.push('<');
            out.push_str(&name);
            let node = require_node(doc, &element.key)?;
            for key in node.live_keys() {
                if let Some(value) = node
                    .winner(key)
                    .and_then(|item| outs_of_item(item).into_iter().next())
                {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&attr_value_string(doc, &value)?);
                    out.push('"');
                }
            }
            out.push('>');
            for child in xml_children(doc, &element.key)? {
                write_xml(doc, &child, out)?;
            }
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
        }
        SharedRef::XmlText(text) => {
            out.push_str(&xml_text_to_string(doc, &text.key)?);
        }
        other => {
            out.push_str(&attr_value_string(doc, &Out::Shared(other.clone()))?);
        }
    }
    Ok(())
}

/// Renders formatting attributes as nested tags: a scalar attribute value
/// becomes a bare tag, an object becomes a tag with attributes.
fn xml_text_to_string(doc: &Doc, key: &TypeKey) -> Result<String, DocError> {
    let node = require_node(doc, key)?;
    let mut out = String::new();
    let mut attrs = Attrs::new();
    let mut open: Vec<String> = Vec::new();
    for item in &node.seq {
        match &item.content {
            Content::Format { key: name, value } => {
                if !item.deleted {
                    apply_attr(&mut attrs, name, value);
                }
            }
            Content::Str(text) if !item.deleted => {
                let mut wanted: Vec<&String> = attrs.keys().collect();
                wanted.sort();
                let wanted: Vec<String> = wanted.into_iter().cloned().collect();
                if wanted != open {
                    for tag in open.iter().rev() {
                        out.push_str("</");
                        out.push_str(tag);
                        out.push('>');
                    }
                    for tag in &wanted {
                        out.push('<');
                        out.push_str(tag);
                        if let Some(Value::Object(object)) = attrs.get(tag) {
                            let mut keys: Vec<&String> = object.keys().collect();
                            keys.sort();
                            for k in keys {
                                out.push(' ');
                                out.push_str(k);
                                out.push_str("=\"");
                                match &object[k] {
                                    Value::String(s) => out.push_str(s),
                                    other => out.push_str(&other.to_string()),
                                }
                                out.push('"');
                            }
                        }
                        out.push('>');
                    }
                    open = wanted;
                }
                out.push_str(text);
            }
            _ => {}
        }
    }
    for tag in open.iter().rev() {
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
    Ok(out)
}

impl XmlFragmentRef {
    pub fn len(&self, doc: &Doc) -> Result<u64, DocError> {
        Ok(require_node(doc, &self.key)?.live_len())
    }

    pub fn is_empty(&self, doc: &Doc) -> Result<bool, DocError> {
        Ok(self.len(doc)? == 0)
    }

    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        nodes: Vec<XmlIn>,
    ) -> Result<(), DocError> {
        xml_insert(txn, &self.key, index, nodes)
    }

    /// Inserts after a reference child; `None` prepends.
    pub fn insert_after(
        &self,
        txn: &mut Transaction<'_>,
        reference: Option<&SharedRef>,
        nodes: Vec<XmlIn>,
    ) -> Result<(), DocError> {
        xml_insert_after(txn, &self.key, reference, nodes)
    }

    pub fn push(&self, txn: &mut Transaction<'_>, nodes: Vec<XmlIn>) -> Result<(), DocError> {
        let len = require_node(txn.doc(), &self.key)?.live_len();
        xml_insert(txn, &self.key, len, nodes)
    }

    pub fn unshift(&self, txn: &mut Transaction<'_>, nodes: Vec<XmlIn>) -> Result<(), DocError> {
        xml_insert(txn, &self.key, 0, nodes)
    }

    pub fn delete(&self, txn: &mut Transaction<'_>, index: u64, len: u64) -> Result<(), DocError> {
        txn.delete_seq(&self.key, index, len)
    }

    pub fn get(&self, doc: &Doc, index: u64) -> Result<Option<SharedRef>, DocError> {
        xml_get(doc, &self.key, index)
    }

    pub fn first_child(&self, doc: &Doc) -> Result<Option<SharedRef>, DocError> {
        self.get(doc, 0)
    }

    pub fn children(&self, doc: &Doc) -> Result<Vec<SharedRef>, DocError> {
        xml_children(doc, &self.key)
    }

    /// Walks all descendants matching `filter`, depth first.
    pub fn tree_walker<'doc, F>(
        &self,
        doc: &'doc Doc,
        filter: F,
    ) -> Result<TreeWalker<'doc, F>, DocError>
    where
        F: Fn(&SharedRef) -> bool,
    {
        TreeWalker::new(doc, &self.key, filter)
    }

    pub fn to_string(&self, doc: &Doc) -> Result<String, DocError> {
        xml_to_string(doc, &SharedRef::XmlFragment(self.clone()))
    }

    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        Ok(Value::String(self.to_string(doc)?))
    }
}

impl XmlElementRef {
    /// The element's tag name.
    pub fn node_name(&self, doc: &Doc) -> Result<String, DocError> {
        Ok(require_node(doc, &self.key)?
            .node_name
            .clone()
            .unwrap_or_default())
    }

    pub fn len(&self, doc: &Doc) -> Result<u64, DocError> {
        Ok(require_node(doc, &self.key)?.live_len())
    }

    pub fn is_empty(&self, doc: &Doc) -> Result<bool, DocError> {
        Ok(self.len(doc)? == 0)
    }

    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        nodes: Vec<XmlIn>,
    ) -> Result<(), DocError> {
        xml_insert(txn, &self.key, index, nodes)
    }

    pub fn insert_after(
        &self,
        txn: &mut Transaction<'_>,
        reference: Option<&SharedRef>,
        nodes: Vec<XmlIn>,
    ) -> Result<(), DocError> {
        xml_insert_after(txn, &self.key, reference, nodes)
    }

    pub fn push(&self, txn: &mut Transaction<'_>, nodes: Vec<XmlIn>) -> Result<(), DocError> {
        let len = require_node(txn.doc(), &self.key)?.live_len();
        xml_insert(txn, &self.key, len, nodes)
    }

    pub fn unshift(&self, txn: &mut Transaction<'_>, nodes: Vec<XmlIn>) -> Result<(), DocError> {
        xml_insert(txn, &self.key, 0, nodes)
    }

    pub fn delete(&self, txn: &mut Transaction<'_>, index: u64, len: u64) -> Result<(), DocError> {
        txn.delete_seq(&self.key, index, len)
    }

    pub fn get(&self, doc: &Doc, index: u64) -> Result<Option<SharedRef>, DocError> {
        xml_get(doc, &self.key, index)
    }

    pub fn first_child(&self, doc: &Doc) -> Result<Option<SharedRef>, DocError> {
        self.get(doc, 0)
    }

    pub fn children(&self, doc: &Doc) -> Result<Vec<SharedRef>, DocError> {
        xml_children(doc, &self.key)
    }

    pub fn prev_sibling(&self, doc: &Doc) -> Result<Option<SharedRef>, DocError> {
        xml_sibling(doc, &self.key, false)
    }

    pub fn next_sibling(&self, doc: &Doc) -> Result<Option<SharedRef>, DocError> {
        xml_sibling(doc, &self.key, true)
    }

    /// Sets an attribute; values may be scalars or shared types.
    pub fn insert_attribute(
        &self,
        txn: &mut Transaction<'_>,
        name: &str,
        value: impl Into<In>,
    ) -> Result<(), DocError> {
        map_set(txn, &self.key, name, value.into())
    }

    pub fn remove_attribute(&self, txn: &mut Transaction<'_>, name: &str) -> Result<(), DocError> {
        txn.map_remove(&self.key, name)
    }

    pub fn get_attribute(&self, doc: &Doc, name: &str) -> Result<Option<Out>, DocError> {
        let node = require_node(doc, &self.key)?;
        Ok(node
            .winner(name)
            .and_then(|item| outs_of_item(item).into_iter().next()))
    }

    /// Sorted live attributes.
    pub fn attributes(&self, doc: &Doc) -> Result<Vec<(String, Out)>, DocError> {
        let node = require_node(doc, &self.key)?;
        let mut out = Vec::new();
        for key in node.live_keys() {
            if let Some(value) = node
                .winner(key)
                .and_then(|item| outs_of_item(item).into_iter().next())
            {
                out.push((key.clone(), value));
            }
        }
        Ok(out)
    }

    pub fn tree_walker<'doc, F>(
        &self,
        doc: &'doc Doc,
        filter: F,
    ) -> Result<TreeWalker<'doc, F>, DocError>
    where
        F: Fn(&SharedRef) -> bool,
    {
        TreeWalker::new(doc, &self.key, filter)
    }

    pub fn to_string(&self, doc: &Doc) -> Result<String, DocError> {
        xml_to_string(doc, &SharedRef::XmlElement(self.clone()))
    }

    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        Ok(Value::String(self.to_string(doc)?))
    }
}

impl XmlTextRef {
    pub fn len(&self, doc: &Doc) -> Result<u64, DocError> {
        Ok(require_node(doc, &self.key)?.live_len())
    }

    pub fn is_empty(&self, doc: &Doc) -> Result<bool, DocError> {
        Ok(self.len(doc)? == 0)
    }

    pub fn get_string(&self, doc: &Doc) -> Result<String, DocError> {
        text_string(doc, &self.key)
    }

    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        text: &str,
    ) -> Result<(), DocError> {
        text_insert(txn, &self.key, index, text, None)
    }

    pub fn insert_with_attributes(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        text: &str,
        attrs: Attrs,
    ) -> Result<(), DocError> {
        text_insert(txn, &self.key, index, text, Some(attrs))
    }

    pub fn insert_embed(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        value: Value,
    ) -> Result<(), DocError> {
        text_insert_embed(txn, &self.key, index, value)
    }

    pub fn format(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        len: u64,
        attrs: Attrs,
    ) -> Result<(), DocError> {
        text_format(txn, &self.key, index, len, attrs)
    }

    pub fn delete(&self, txn: &mut Transaction<'_>, index: u64, len: u64) -> Result<(), DocError> {
        txn.delete_seq(&self.key, index, len)
    }

    pub fn apply_delta(
        &self,
        txn: &mut Transaction<'_>,
        delta: &[TextDelta],
    ) -> Result<(), DocError> {
        text_apply_delta(txn, &self.key, delta)
    }

    pub fn prev_sibling(&self, doc: &Doc) -> Result<Option<SharedRef>, DocError> {
        xml_sibling(doc, &self.key, false)
    }

    pub fn next_sibling(&self, doc: &Doc) -> Result<Option<SharedRef>, DocError> {
        xml_sibling(doc, &self.key, true)
    }

    /// XML rendering with formatting attributes as nested tags.
    pub fn to_string(&self, doc: &Doc) -> Result<String, DocError> {
        xml_text_to_string(doc, &self.key)
    }

    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        Ok(Value::String(self.to_string(doc)?))
    }
}
