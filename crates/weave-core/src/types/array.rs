//! Shared array: a sequence of JSON values and embedded shared types.

use serde_json::Value;

use crate::doc::{Doc, DocError};
use crate::store::{Content, TypeKey};
use crate::transaction::Transaction;

use super::{outs_of_item, require_node, seq_insert, In, Out};

/// Handle to a shared array.
///
/// Index resolution walks live items and is O(n); no auxiliary position
/// cache is maintained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayRef {
    pub(crate) key: TypeKey,
}

impl ArrayRef {
    /// Number of live elements.
    pub fn len(&self, doc: &Doc) -> Result<u64, DocError> {
        Ok(require_node(doc, &self.key)?.live_len())
    }

    pub fn is_empty(&self, doc: &Doc) -> Result<bool, DocError> {
        Ok(self.len(doc)? == 0)
    }

    /// Inserts values at `index`; indices beyond the length append.
    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u64,
        values: Vec<In>,
    ) -> Result<(), DocError> {
        seq_insert(txn, &self.key, index, values)
    }

    /// Appends values at the end.
    pub fn push(&self, txn: &mut Transaction<'_>, values: Vec<In>) -> Result<(), DocError> {
        let len = require_node(txn.doc(), &self.key)?.live_len();
        seq_insert(txn, &self.key, len, values)
    }

    /// Prepends values at the beginning.
    pub fn unshift(&self, txn: &mut Transaction<'_>, values: Vec<In>) -> Result<(), DocError> {
        seq_insert(txn, &self.key, 0, values)
    }

    /// Deletes `len` elements starting at `index`.
    pub fn delete(&self, txn: &mut Transaction<'_>, index: u64, len: u64) -> Result<(), DocError> {
        txn.delete_seq(&self.key, index, len)
    }

    /// The element at `index`, if any.
    pub fn get(&self, doc: &Doc, index: u64) -> Result<Option<Out>, DocError> {
        let node = require_node(doc, &self.key)?;
        let mut remaining = index;
        for item in &node.seq {
            let vis = item.visible_len();
            if vis == 0 {
                continue;
            }
            if remaining < vis {
                let out = match &item.content {
                    Content::Values(values) => {
                        values.get(remaining as usize).cloned().map(Out::Json)
                    }
                    _ => outs_of_item(item).into_iter().next(),
                };
                return Ok(out);
            }
            remaining -= vis;
        }
        Ok(None)
    }

    /// All live elements in order.
    pub fn to_array(&self, doc: &Doc) -> Result<Vec<Out>, DocError> {
        let node = require_node(doc, &self.key)?;
        let mut out = Vec::new();
        for item in node.seq.iter().filter(|item| !item.deleted) {
            out.extend(outs_of_item(item));
        }
        Ok(out)
    }

    /// JSON projection of every element.
    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        let values = self
            .to_array(doc)?
            .iter()
            .map(|out| out.to_json(doc))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(values))
    }
}
