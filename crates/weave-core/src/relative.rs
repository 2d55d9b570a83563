//! Replica-independent position references.
//!
//! A relative position anchors to a concrete item id instead of a numeric
//! index, so it keeps pointing at the same content while other replicas
//! edit the sequence. Decoding against a later document state recomputes
//! the current absolute index; an anchor that no longer resolves yields
//! `None`, which is a routine outcome of concurrent deletion and never an
//! error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::doc::{Doc, DocError};
use crate::id::Id;
use crate::store::TypeKey;
use crate::types::SharedRef;
use crate::update::{read_vu57, write_vu57};

/// Current relative position format version.
pub const POSITION_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("relative position payload truncated")]
    Truncated,
    #[error("unsupported relative position version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid utf-8 in relative position")]
    InvalidUtf8,
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("trailing bytes after relative position")]
    TrailingBytes,
}

/// A position anchored to an item id inside one shared type.
///
/// `assoc >= 0` binds to the content at the anchored boundary, `assoc <
/// 0` to the content immediately before it; an absent anchor encodes the
/// type edge (start for `assoc < 0`, end otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativePosition {
    pub(crate) scope: TypeKey,
    pub(crate) item: Option<Id>,
    pub assoc: i32,
}

/// Result of resolving a relative position against a document state.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsolutePosition {
    pub target: SharedRef,
    pub index: u64,
    pub assoc: i32,
}

impl RelativePosition {
    /// Anchors the live index `index` of `target`. Only edits at or
    /// before the anchor itself can shift the index it later resolves to.
    pub fn from_type_index(
        doc: &Doc,
        target: &SharedRef,
        index: u64,
        assoc: i32,
    ) -> Result<Self, DocError> {
        let key = target.key();
        let node = doc.store.node(key).ok_or(DocError::DetachedType)?;
        let item = if assoc < 0 {
            if index == 0 {
                None
            } else {
                id_at_index(node, index - 1)
            }
        } else {
            id_at_index(node, index)
        };
        Ok(Self {
            scope: key.clone(),
            item,
            assoc,
        })
    }

    /// Recomputes the current absolute index of the anchor, or `None`
    /// when the anchor (or its type) no longer resolves.
    pub fn resolve(&self, doc: &Doc) -> Option<AbsolutePosition> {
        let node = doc.store.node(&self.scope)?;
        let target = SharedRef::from_key_kind(self.scope.clone(), node.kind);
        let index = match self.item {
            None => {
                if self.assoc < 0 {
                    0
                } else {
                    node.live_len()
                }
            }
            Some(anchor) => {
                let mut count = 0u64;
                let mut resolved = None;
                for item in &node.seq {
                    if item.contains(anchor) {
                        resolved = if item.deleted || !item.countable() {
                            // The anchored content is gone; the position
                            // collapses onto the surrounding gap.
                            Some(count)
                        } else {
                            let offset = anchor.clock - item.id.clock;
                            Some(count + offset + u64::from(self.assoc < 0))
                        };
                        break;
                    }
                    count += item.visible_len();
                }
                resolved?
            }
        };
        Some(AbsolutePosition {
            target,
            index,
            assoc: self.assoc,
        })
    }

    /// Compact self-describing binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![POSITION_FORMAT_VERSION];
        let mut flags = 0u8;
        if self.item.is_some() {
            flags |= FLAG_ITEM;
        }
        if self.assoc < 0 {
            flags |= FLAG_ASSOC_NEG;
        }
        if matches!(self.scope, TypeKey::Nested(_)) {
            flags |= FLAG_SCOPE_NESTED;
        }
        out.push(flags);
        match &self.scope {
            TypeKey::Root(name) => {
                write_vu57(&mut out, name.len() as u64);
                out.extend_from_slice(name.as_bytes());
            }
            TypeKey::Nested(id) => {
                write_vu57(&mut out, id.client);
                write_vu57(&mut out, id.clock);
            }
        }
        if let Some(item) = self.item {
            write_vu57(&mut out, item.client);
            write_vu57(&mut out, item.clock);
        }
        write_vu57(&mut out, self.assoc.unsigned_abs() as u64);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, PositionError> {
        let version = *data.first().ok_or(PositionError::Truncated)?;
        if version != POSITION_FORMAT_VERSION {
            return Err(PositionError::UnsupportedVersion(version));
        }
        let flags = *data.get(1).ok_or(PositionError::Truncated)?;
        let mut pos = 2usize;
        let scope = if flags & FLAG_SCOPE_NESTED != 0 {
            let client = read_vu57(data, &mut pos).map_err(|_| PositionError::Truncated)?;
            let clock = read_vu57(data, &mut pos).map_err(|_| PositionError::Truncated)?;
            TypeKey::Nested(Id::new(client, clock))
        } else {
            let len = read_vu57(data, &mut pos).map_err(|_| PositionError::Truncated)? as usize;
            let end = pos.checked_add(len).ok_or(PositionError::Truncated)?;
            let bytes = data.get(pos..end).ok_or(PositionError::Truncated)?;
            pos = end;
            TypeKey::Root(
                String::from_utf8(bytes.to_vec()).map_err(|_| PositionError::InvalidUtf8)?,
            )
        };
        let item = if flags & FLAG_ITEM != 0 {
            let client = read_vu57(data, &mut pos).map_err(|_| PositionError::Truncated)?;
            let clock = read_vu57(data, &mut pos).map_err(|_| PositionError::Truncated)?;
            Some(Id::new(client, clock))
        } else {
            None
        };
        let magnitude = read_vu57(data, &mut pos).map_err(|_| PositionError::Truncated)? as i32;
        let assoc = if flags & FLAG_ASSOC_NEG != 0 {
            -magnitude
        } else {
            magnitude
        };
        if pos != data.len() {
            return Err(PositionError::TrailingBytes);
        }
        Ok(Self { scope, item, assoc })
    }

    /// String-safe form for JSON or text transports.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.encode())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, PositionError> {
        Self::decode(&BASE64.decode(encoded)?)
    }
}

const FLAG_ITEM: u8 = 0b001;
const FLAG_ASSOC_NEG: u8 = 0b010;
const FLAG_SCOPE_NESTED: u8 = 0b100;

/// Id of the live countable unit at `index`, if the index is in range.
fn id_at_index(node: &crate::store::TypeNode, index: u64) -> Option<Id> {
    let mut remaining = index;
    for item in &node.seq {
        let vis = item.visible_len();
        if vis == 0 {
            continue;
        }
        if remaining < vis {
            return Some(Id::new(item.id.client, item.id.clock + remaining));
        }
        remaining -= vis;
    }
    None
}
