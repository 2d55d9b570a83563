//! Shared map: last-writer-wins value slots with preserved history.
//!
//! `set` creates a new entry superseding (but not deleting) the prior
//! entry for the key; reads resolve the highest-identifier live entry.
//! Concurrent writes to one key therefore converge without wall-clock
//! time entering the picture.

use serde_json::Value;

use crate::doc::{Doc, DocError};
use crate::store::{Content, TypeKey};
use crate::transaction::Transaction;

use super::{descriptor_for, materialize, outs_of_item, require_node, In, Out};

/// Handle to a shared map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapRef {
    pub(crate) key: TypeKey,
}

impl MapRef {
    /// Number of keys with a live value.
    pub fn len(&self, doc: &Doc) -> Result<u64, DocError> {
        Ok(require_node(doc, &self.key)?.live_keys().len() as u64)
    }

    pub fn is_empty(&self, doc: &Doc) -> Result<bool, DocError> {
        Ok(self.len(doc)? == 0)
    }

    /// Adds or updates an entry.
    pub fn set(
        &self,
        txn: &mut Transaction<'_>,
        key: &str,
        value: impl Into<In>,
    ) -> Result<(), DocError> {
        map_set(txn, &self.key, key, value.into())
    }

    /// The live value for a key, if any.
    pub fn get(&self, doc: &Doc, key: &str) -> Result<Option<Out>, DocError> {
        let node = require_node(doc, &self.key)?;
        Ok(node
            .winner(key)
            .and_then(|item| outs_of_item(item).into_iter().next()))
    }

    pub fn contains_key(&self, doc: &Doc, key: &str) -> Result<bool, DocError> {
        Ok(require_node(doc, &self.key)?.winner(key).is_some())
    }

    /// Removes an entry, returning the value it held.
    pub fn remove(
        &self,
        txn: &mut Transaction<'_>,
        key: &str,
    ) -> Result<Option<Out>, DocError> {
        let old = {
            let node = require_node(txn.doc(), &self.key)?;
            node.winner(key)
                .and_then(|item| outs_of_item(item).into_iter().next())
        };
        txn.map_remove(&self.key, key)?;
        Ok(old)
    }

    /// Removes every entry.
    pub fn clear(&self, txn: &mut Transaction<'_>) -> Result<(), DocError> {
        let keys: Vec<String> = {
            let node = require_node(txn.doc(), &self.key)?;
            node.live_keys().into_iter().cloned().collect()
        };
        for key in keys {
            txn.map_remove(&self.key, &key)?;
        }
        Ok(())
    }

    /// Sorted live keys.
    pub fn keys(&self, doc: &Doc) -> Result<Vec<String>, DocError> {
        Ok(require_node(doc, &self.key)?
            .live_keys()
            .into_iter()
            .cloned()
            .collect())
    }

    /// Sorted live `(key, value)` pairs.
    pub fn entries(&self, doc: &Doc) -> Result<Vec<(String, Out)>, DocError> {
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

    /// JSON projection with deterministically sorted keys.
    pub fn to_json(&self, doc: &Doc) -> Result<Value, DocError> {
        let mut object = serde_json::Map::new();
        for (key, value) in self.entries(doc)? {
            object.insert(key, value.to_json(doc)?);
        }
        Ok(Value::Object(object))
    }
}

pub(crate) fn map_set(
    txn: &mut Transaction<'_>,
    key: &TypeKey,
    sub: &str,
    value: In,
) -> Result<(), DocError> {
    match value {
        In::Json(json) => {
            txn.map_set_content(key, sub, Content::Values(vec![json]))?;
            Ok(())
        }
        prelim => {
            let Some(desc) = descriptor_for(&prelim) else {
                return Ok(());
            };
            let id = txn.map_set_content(key, sub, Content::Type(desc))?;
            materialize(txn, TypeKey::Nested(id), prelim)
        }
    }
}
