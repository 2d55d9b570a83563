//! Binary update payloads.
//!
//! An update is a versioned, length-prefixed blob carrying newly created
//! items and a delete set. Ids, lengths and tags use the compact `vu57`
//! var-int layout; embedded JSON values are CBOR. The format is
//! self-describing: `decode(encode(u)) == u` for any update.

use serde_json::Value;
use thiserror::Error;

use crate::id::{Id, IdRange};
use crate::store::{Content, TypeDescriptor, TypeKind, WireItem, WireParent};

/// Current update payload format version.
pub const UPDATE_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update payload truncated")]
    UnexpectedEof,
    #[error("unsupported update format version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown content tag: {0}")]
    UnknownContentTag(u8),
    #[error("unknown type kind tag: {0}")]
    UnknownTypeKind(u8),
    #[error("invalid utf-8 in update")]
    InvalidUtf8,
    #[error("invalid cbor value in update")]
    InvalidCbor,
    #[error("value not representable as cbor")]
    ValueEncode,
    #[error("trailing bytes after update body")]
    TrailingBytes,
}

/// Decoded form of one update payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Update {
    pub(crate) items: Vec<WireItem>,
    pub(crate) deletes: Vec<IdRange>,
}

pub(crate) fn write_vu57(out: &mut Vec<u8>, mut value: u64) {
    for _ in 0..7 {
        let mut b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(b);
            return;
        }
        b |= 0x80;
        out.push(b);
    }
    out.push((value & 0xff) as u8);
}

pub(crate) fn read_vu57(data: &[u8], pos: &mut usize) -> Result<u64, UpdateError> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    for i in 0..8 {
        let b = *data.get(*pos).ok_or(UpdateError::UnexpectedEof)?;
        *pos += 1;
        if i < 7 {
            let part = (b & 0x7f) as u64;
            result |= part.checked_shl(shift).ok_or(UpdateError::UnexpectedEof)?;
            if (b & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        } else {
            result |= (b as u64)
                .checked_shl(49)
                .ok_or(UpdateError::UnexpectedEof)?;
            return Ok(result);
        }
    }
    Err(UpdateError::UnexpectedEof)
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_vu57(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn read_string(data: &[u8], pos: &mut usize) -> Result<String, UpdateError> {
    let len = read_vu57(data, pos)? as usize;
    let end = pos.checked_add(len).ok_or(UpdateError::UnexpectedEof)?;
    let bytes = data.get(*pos..end).ok_or(UpdateError::UnexpectedEof)?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|_| UpdateError::InvalidUtf8)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), UpdateError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|_| UpdateError::ValueEncode)?;
    write_vu57(out, buf.len() as u64);
    out.extend_from_slice(&buf);
    Ok(())
}

fn read_value(data: &[u8], pos: &mut usize) -> Result<Value, UpdateError> {
    let len = read_vu57(data, pos)? as usize;
    let end = pos.checked_add(len).ok_or(UpdateError::UnexpectedEof)?;
    let bytes = data.get(*pos..end).ok_or(UpdateError::UnexpectedEof)?;
    *pos = end;
    ciborium::de::from_reader(bytes).map_err(|_| UpdateError::InvalidCbor)
}

fn write_id(out: &mut Vec<u8>, id: Id) {
    write_vu57(out, id.client);
    write_vu57(out, id.clock);
}

fn read_id(data: &[u8], pos: &mut usize) -> Result<Id, UpdateError> {
    let client = read_vu57(data, pos)?;
    let clock = read_vu57(data, pos)?;
    Ok(Id::new(client, clock))
}

fn kind_tag(kind: TypeKind) -> u8 {
    match kind {
        TypeKind::Text => 0,
        TypeKind::Array => 1,
        TypeKind::Map => 2,
        TypeKind::XmlElement => 3,
        TypeKind::XmlFragment => 4,
        TypeKind::XmlText => 5,
    }
}

fn kind_from_tag(tag: u8) -> Result<TypeKind, UpdateError> {
    Ok(match tag {
        0 => TypeKind::Text,
        1 => TypeKind::Array,
        2 => TypeKind::Map,
        3 => TypeKind::XmlElement,
        4 => TypeKind::XmlFragment,
        5 => TypeKind::XmlText,
        other => return Err(UpdateError::UnknownTypeKind(other)),
    })
}

const FLAG_ORIGIN: u8 = 0b0001;
const FLAG_RIGHT_ORIGIN: u8 = 0b0010;
const FLAG_PARENT_NESTED: u8 = 0b0100;
const FLAG_PARENT_SUB: u8 = 0b1000;

const CONTENT_STR: u8 = 0;
const CONTENT_VALUES: u8 = 1;
const CONTENT_EMBED: u8 = 2;
const CONTENT_FORMAT: u8 = 3;
const CONTENT_TYPE: u8 = 4;
const CONTENT_GC: u8 = 5;

fn write_content(out: &mut Vec<u8>, content: &Content) -> Result<(), UpdateError> {
    match content {
        Content::Str(s) => {
            out.push(CONTENT_STR);
            write_string(out, s);
        }
        Content::Values(values) => {
            out.push(CONTENT_VALUES);
            write_vu57(out, values.len() as u64);
            for value in values {
                write_value(out, value)?;
            }
        }
        Content::Embed(value) => {
            out.push(CONTENT_EMBED);
            write_value(out, value)?;
        }
        Content::Format { key, value } => {
            out.push(CONTENT_FORMAT);
            write_string(out, key);
            write_value(out, value)?;
        }
        Content::Type(desc) => {
            out.push(CONTENT_TYPE);
            out.push(kind_tag(desc.kind));
            match &desc.node_name {
                Some(name) => {
                    out.push(1);
                    write_string(out, name);
                }
                None => out.push(0),
            }
        }
        Content::Gc(len) => {
            out.push(CONTENT_GC);
            write_vu57(out, *len);
        }
    }
    Ok(())
}

fn read_content(data: &[u8], pos: &mut usize) -> Result<Content, UpdateError> {
    let tag = *data.get(*pos).ok_or(UpdateError::UnexpectedEof)?;
    *pos += 1;
    Ok(match tag {
        CONTENT_STR => Content::Str(read_string(data, pos)?),
        CONTENT_VALUES => {
            let count = read_vu57(data, pos)? as usize;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(read_value(data, pos)?);
            }
            Content::Values(values)
        }
        CONTENT_EMBED => Content::Embed(read_value(data, pos)?),
        CONTENT_FORMAT => Content::Format {
            key: read_string(data, pos)?,
            value: read_value(data, pos)?,
        },
        CONTENT_TYPE => {
            let kind = kind_from_tag(*data.get(*pos).ok_or(UpdateError::UnexpectedEof)?)?;
            *pos += 1;
            let has_name = *data.get(*pos).ok_or(UpdateError::UnexpectedEof)?;
            *pos += 1;
            let node_name = if has_name != 0 {
                Some(read_string(data, pos)?)
            } else {
                None
            };
            Content::Type(TypeDescriptor { kind, node_name })
        }
        CONTENT_GC => Content::Gc(read_vu57(data, pos)?),
        other => return Err(UpdateError::UnknownContentTag(other)),
    })
}

fn write_item(out: &mut Vec<u8>, item: &WireItem) -> Result<(), UpdateError> {
    write_id(out, item.id);
    let mut flags = 0u8;
    if item.origin.is_some() {
        flags |= FLAG_ORIGIN;
    }
    if item.right_origin.is_some() {
        flags |= FLAG_RIGHT_ORIGIN;
    }
    if matches!(item.parent, WireParent::Nested(_)) {
        flags |= FLAG_PARENT_NESTED;
    }
    if item.parent_sub.is_some() {
        flags |= FLAG_PARENT_SUB;
    }
    out.push(flags);
    if let Some(origin) = item.origin {
        write_id(out, origin);
    }
    if let Some(right) = item.right_origin {
        write_id(out, right);
    }
    match &item.parent {
        WireParent::Root { name, kind } => {
            out.push(kind_tag(*kind));
            write_string(out, name);
        }
        WireParent::Nested(id) => write_id(out, *id),
    }
    if let Some(sub) = &item.parent_sub {
        write_string(out, sub);
    }
    write_content(out, &item.content)
}

fn read_item(data: &[u8], pos: &mut usize) -> Result<WireItem, UpdateError> {
    let id = read_id(data, pos)?;
    let flags = *data.get(*pos).ok_or(UpdateError::UnexpectedEof)?;
    *pos += 1;
    let origin = if flags & FLAG_ORIGIN != 0 {
        Some(read_id(data, pos)?)
    } else {
        None
    };
    let right_origin = if flags & FLAG_RIGHT_ORIGIN != 0 {
        Some(read_id(data, pos)?)
    } else {
        None
    };
    let parent = if flags & FLAG_PARENT_NESTED != 0 {
        WireParent::Nested(read_id(data, pos)?)
    } else {
        let kind = kind_from_tag(*data.get(*pos).ok_or(UpdateError::UnexpectedEof)?)?;
        *pos += 1;
        WireParent::Root {
            name: read_string(data, pos)?,
            kind,
        }
    };
    let parent_sub = if flags & FLAG_PARENT_SUB != 0 {
        Some(read_string(data, pos)?)
    } else {
        None
    };
    let content = read_content(data, pos)?;
    Ok(WireItem {
        id,
        origin,
        right_origin,
        parent,
        parent_sub,
        content,
    })
}

pub(crate) fn encode_update(update: &Update) -> Result<Vec<u8>, UpdateError> {
    let mut body = Vec::with_capacity(64);
    write_vu57(&mut body, update.items.len() as u64);
    for item in &update.items {
        write_item(&mut body, item)?;
    }
    write_vu57(&mut body, update.deletes.len() as u64);
    for range in &update.deletes {
        write_vu57(&mut body, range.client);
        write_vu57(&mut body, range.clock);
        write_vu57(&mut body, range.len);
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    out.push(UPDATE_FORMAT_VERSION);
    write_vu57(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    Ok(out)
}

pub(crate) fn decode_update(data: &[u8]) -> Result<Update, UpdateError> {
    let version = *data.first().ok_or(UpdateError::UnexpectedEof)?;
    if version != UPDATE_FORMAT_VERSION {
        return Err(UpdateError::UnsupportedVersion(version));
    }
    let mut pos = 1usize;
    let body_len = read_vu57(data, &mut pos)? as usize;
    let body_end = pos.checked_add(body_len).ok_or(UpdateError::UnexpectedEof)?;
    if body_end > data.len() {
        return Err(UpdateError::UnexpectedEof);
    }
    if body_end < data.len() {
        return Err(UpdateError::TrailingBytes);
    }

    let item_count = read_vu57(data, &mut pos)? as usize;
    let mut items = Vec::with_capacity(item_count.min(4096));
    for _ in 0..item_count {
        items.push(read_item(data, &mut pos)?);
    }
    let delete_count = read_vu57(data, &mut pos)? as usize;
    let mut deletes = Vec::with_capacity(delete_count.min(4096));
    for _ in 0..delete_count {
        let client = read_vu57(data, &mut pos)?;
        let clock = read_vu57(data, &mut pos)?;
        let len = read_vu57(data, &mut pos)?;
        deletes.push(IdRange::new(client, clock, len));
    }
    if pos != body_end {
        return Err(UpdateError::TrailingBytes);
    }
    Ok(Update { items, deletes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,8}".prop_map(Value::String),
        ]
    }

    fn id_strategy() -> impl Strategy<Value = Id> {
        (65_536u64..200_000, 0u64..4096).prop_map(|(client, clock)| Id::new(client, clock))
    }

    fn kind_strategy() -> impl Strategy<Value = TypeKind> {
        prop_oneof![
            Just(TypeKind::Text),
            Just(TypeKind::Array),
            Just(TypeKind::Map),
            Just(TypeKind::XmlElement),
            Just(TypeKind::XmlFragment),
            Just(TypeKind::XmlText),
        ]
    }

    fn content_strategy() -> impl Strategy<Value = Content> {
        prop_oneof![
            "[a-z ]{1,12}".prop_map(Content::Str),
            prop::collection::vec(value_strategy(), 1..4).prop_map(Content::Values),
            value_strategy().prop_map(Content::Embed),
            ("[a-z]{1,6}", value_strategy())
                .prop_map(|(key, value)| Content::Format { key, value }),
            (kind_strategy(), prop::option::of("[a-z]{1,6}".prop_map(String::from))).prop_map(
                |(kind, node_name)| Content::Type(TypeDescriptor { kind, node_name })
            ),
            (1u64..64).prop_map(Content::Gc),
        ]
    }

    fn parent_strategy() -> impl Strategy<Value = WireParent> {
        prop_oneof![
            ("[a-z]{1,6}", kind_strategy())
                .prop_map(|(name, kind)| WireParent::Root { name, kind }),
            id_strategy().prop_map(WireParent::Nested),
        ]
    }

    fn item_strategy() -> impl Strategy<Value = WireItem> {
        (
            id_strategy(),
            prop::option::of(id_strategy()),
            prop::option::of(id_strategy()),
            parent_strategy(),
            prop::option::of("[a-z]{1,6}".prop_map(String::from)),
            content_strategy(),
        )
            .prop_map(
                |(id, origin, right_origin, parent, parent_sub, content)| WireItem {
                    id,
                    origin,
                    right_origin,
                    parent,
                    parent_sub,
                    content,
                },
            )
    }

    fn update_strategy() -> impl Strategy<Value = Update> {
        (
            prop::collection::vec(item_strategy(), 0..8),
            prop::collection::vec(
                (65_536u64..200_000, 0u64..4096, 1u64..64)
                    .prop_map(|(client, clock, len)| IdRange::new(client, clock, len)),
                0..4,
            ),
        )
            .prop_map(|(items, deletes)| Update { items, deletes })
    }

    proptest! {
        #[test]
        fn update_round_trips(update in update_strategy()) {
            let bytes = encode_update(&update).unwrap();
            let decoded = decode_update(&bytes).unwrap();
            prop_assert_eq!(decoded, update);
        }

        #[test]
        fn truncation_is_detected(update in update_strategy(), cut in 1usize..16) {
            let bytes = encode_update(&update).unwrap();
            if cut < bytes.len() {
                let truncated = &bytes[..bytes.len() - cut];
                prop_assert!(decode_update(truncated).is_err());
            }
        }
    }

    #[test]
    fn version_and_trailing_bytes_are_rejected() {
        let empty = Update {
            items: Vec::new(),
            deletes: Vec::new(),
        };
        let mut bytes = encode_update(&empty).unwrap();
        assert!(decode_update(&bytes).is_ok());

        bytes.push(0);
        assert!(matches!(
            decode_update(&bytes),
            Err(UpdateError::TrailingBytes)
        ));

        let mut wrong_version = encode_update(&empty).unwrap();
        wrong_version[0] = 9;
        assert!(matches!(
            decode_update(&wrong_version),
            Err(UpdateError::UnsupportedVersion(9))
        ));
    }
}
