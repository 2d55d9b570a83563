//! Shared text: character runs with optional formatting attributes.
//!
//! Formatting is expressed with boundary marker items: assigning an
//! attribute over a range inserts a marker carrying the new value at the
//! range start and a marker restoring the previous value at the range
//! end. The delta projection reads attribution back out of the markers.

use serde_json::Value;

use crate::doc::{Doc, DocError};
use crate::event::{Attrs, TextDelta};
use crate::store::{apply_attr, Content, TypeKey};
use crate::transaction::Transaction;

use super::require_node;

/// Handle to a shared text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextRef {
    pub(crate) key: TypeKey,
}

impl TextRef {
    /// Length in characters, counted over live content only.
    pub fn len(&self, doc: &Doc) -> Result<u64, DocError> {
        Ok(require_node(doc, &self.key)?.live_len())
    }

    pub fn is_empty(&self, doc: &Doc) -> Result<bool, DocError> {
        Ok(self.len(doc)? == 0)
    }

    /// The current string content.
    pub fn get_string(&self, doc: &Doc) -> Result<String, DocError> {
        text_string(doc, &self.key)
    }

    /// Projects the current content as a delta of insert operations with
    /// their formatting attributes.
    pub fn to_delta(&self, doc: &Doc) -> Result<Vec<TextDelta>, DocError> {
        text_to_delta(doc, &self.key)
    }

    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        Ok(Value::String(self.get_string(doc)?))
    }

    /// Inserts `text` at `index`; indices beyond the length append.
    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        text: &str,
    ) -> Result<(), DocError> {
        text_insert(txn, &self.key, index, text, None)
    }

    /// Inserts `text` carrying the given formatting attributes.
    pub fn insert_with_attributes(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        text: &str,
        attrs: Attrs,
    ) -> Result<(), DocError> {
        text_insert(txn, &self.key, index, text, Some(attrs))
    }

    /// Inserts an embedded value occupying one index position.
    pub fn insert_embed(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        value: Value,
    ) -> Result<(), DocError> {
        text_insert_embed(txn, &self.key, index, value)
    }

    /// Assigns formatting attributes to a range; a null attribute value
    /// clears that attribute.
    pub fn format(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        len: u64,
        attrs: Attrs,
    ) -> Result<(), DocError> {
        text_format(txn, &self.key, index, len, attrs)
    }

    /// Deletes `len` characters starting at `index`; overlap with
    /// already-deleted content trims silently.
    pub fn delete(&self, txn: &mut Transaction<'_>, index: u64, len: u64) -> Result<(), DocError> {
        txn.delete_seq(&self.key, index, len)
    }

    /// Applies a retain/insert/delete delta against the current state.
    pub fn apply_delta(
        &self,
        txn: &mut Transaction<'_>,
        delta: &[TextDelta],
    ) -> Result<(), DocError> {
        text_apply_delta(txn, &self.key, delta)
    }
}

pub(crate) fn text_string(doc: &Doc, key: &TypeKey) -> Result<String, DocError> {
    let node = require_node(doc, key)?;
    let mut out = String::new();
    for item in node.seq.iter().filter(|item| !item.deleted) {
        if let Content::Str(s) = &item.content {
            out.push_str(s);
        }
    }
    Ok(out)
}

pub(crate) fn text_insert(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    index: u64,
    text: &str,
    attrs: Option<Attrs>,
) -> Result<(), DocError> {
    if text.is_empty() {
        return Ok(());
    }
    txn.require_attached(key)?;
    match attrs {
        None => {
            txn.insert_content(key, index, vec![Content::Str(text.to_string())])?;
            Ok(())
        }
        Some(attrs) => {
            let total = require_node(txn.doc(), key)?.live_len();
            let index = index.min(total);
            let current = txn.doc().store.active_attrs_at(key, index);
            let mut contents = Vec::new();
            let mut restores = Vec::new();
            for (name, value) in &attrs {
                let existing = current.get(name).cloned().unwrap_or(Value::Null);
                if existing != *value {
                    contents.push(Content::Format {
                        key: name.clone(),
                        value: value.clone(),
                    });
                    restores.push(Content::Format {
                        key: name.clone(),
                        value: existing,
                    });
                }
            }
            contents.push(Content::Str(text.to_string()));
            contents.extend(restores);
            txn.insert_content(key, index, contents)?;
            Ok(())
        }
    }
}

pub(crate) fn text_insert_embed(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    index: u64,
    value: Value,
) -> Result<(), DocError> {
    txn.require_attached(key)?;
    txn.insert_content(key, index, vec![Content::Embed(value)])?;
    Ok(())
}

pub(crate) fn text_format(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    index: u64,
    len: u64,
    attrs: Attrs,
) -> Result<(), DocError> {
    txn.require_attached(key)?;
    let total = require_node(txn.doc(), key)?.live_len();
    let index = index.min(total);
    let len = len.min(total - index);
    if len == 0 || attrs.is_empty() {
        return Ok(());
    }
    let start_attrs = txn.doc().store.active_attrs_at(key, index);
    let end_attrs = txn.doc().store.active_attrs_at(key, index + len);
    // Markers do not occupy index positions, so inserting the start
    // marker leaves the end boundary where it was.
    for (name, value) in &attrs {
        let at_start = start_attrs.get(name).cloned().unwrap_or(Value::Null);
        if at_start != *value {
            txn.insert_content(
                key,
                index,
                vec![Content::Format {
                    key: name.clone(),
                    value: value.clone(),
                }],
            )?;
        }
        let at_end = end_attrs.get(name).cloned().unwrap_or(Value::Null);
        if at_end != *value {
            txn.insert_content(
                key,
                index + len,
                vec![Content::Format {
                    key: name.clone(),
                    value: at_end,
                }],
            )?;
        }
    }
    Ok(())
}

pub(crate) fn text_to_delta(doc: &Doc, key: &TypeKey) -> Result<Vec<TextDelta>, DocError> {
    let node = require_node(doc, key)?;
    let mut ops: Vec<TextDelta> = Vec::new();
    let mut attrs = Attrs::new();
    for item in &node.seq {
        match &item.content {
            Content::Format { key: name, value } => {
                if !item.deleted {
                    apply_attr(&mut attrs, name, value);
                }
            }
            Content::Str(text) if !item.deleted => {
                let attributes = if attrs.is_empty() {
                    None
                } else {
                    Some(attrs.clone())
                };
                match ops.last_mut() {
                    Some(TextDelta::Insert {
                        text: prev,
                        attributes: prev_attrs,
                    }) if *prev_attrs == attributes => prev.push_str(text),
                    _ => ops.push(TextDelta::Insert {
                        text: text.clone(),
                        attributes,
                    }),
                }
            }
            Content::Embed(value) if !item.deleted => {
                let attributes = if attrs.is_empty() {
                    None
                } else {
                    Some(attrs.clone())
                };
                ops.push(TextDelta::InsertEmbed {
                    value: value.clone(),
                    attributes,
                });
            }
            _ => {}
        }
    }
    Ok(ops)
}

pub(crate) fn text_apply_delta(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    delta: &[TextDelta],
) -> Result<(), DocError> {
    let mut pos = 0u64;
    for op in delta {
        match op {
            TextDelta::Retain { len, attributes } => {
                if let Some(attrs) = attributes {
                    text_format(txn, key, pos, *len, attrs.clone())?;
                }
                pos += len;
            }
            TextDelta::Insert { text, attributes } => {
                text_insert(txn, key, pos, text, attributes.clone())?;
                pos += text.chars().count() as u64;
            }
            TextDelta::InsertEmbed { value, .. } => {
                text_insert_embed(txn, key, pos, value.clone())?;
                pos += 1;
            }
            TextDelta::Delete { len } => {
                txn.delete_seq(key, pos, *len)?;
            }
        }
    }
    Ok(())
}
