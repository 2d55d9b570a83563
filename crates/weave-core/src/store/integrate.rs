//! Remote item integration: dual-origin (YATA) conflict resolution over
//! the per-type item sequences.
//!
//! Integration is associative, commutative and idempotent over the item
//! multiset: duplicates are dropped via the observed clock ranges,
//! partially observed runs are trimmed to their unseen suffix, and items
//! with missing causal prerequisites are handed back as pending.

use std::collections::HashSet;

use thiserror::Error;

use crate::id::{Id, IdRange};

use super::{Content, Item, Store, TypeKey, WireItem, WireParent};

#[derive(Debug, Error)]
pub(crate) enum IntegrationError {
    #[error(
        "item {item_client}.{item_clock} references origin {origin_client}.{origin_clock} that resolves to no content"
    )]
    UnresolvableOrigin {
        item_client: u64,
        item_clock: u64,
        origin_client: u64,
        origin_clock: u64,
    },
    #[error("item {client}.{clock} has inverted origin bounds")]
    InvertedBounds { client: u64, clock: u64 },
    #[error("root type '{name}' already exists with a different kind")]
    RootKindMismatch { name: String },
}

/// Outcome of integrating one wire item.
#[derive(Debug)]
pub(crate) enum Integrated {
    Seq {
        key: TypeKey,
        range: IdRange,
    },
    MapEntry {
        key: TypeKey,
        sub: String,
        range: IdRange,
    },
    /// Already known in full; nothing to do.
    Deduplicated,
    /// Causal prerequisites missing; retry once more context arrives.
    Pending(WireItem),
}

pub(crate) fn integrate_wire_item(
    store: &mut Store,
    mut wire: WireItem,
) -> Result<Integrated, IntegrationError> {
    let span = wire.content.len();
    if span == 0 {
        return Ok(Integrated::Deduplicated);
    }

    // Duplicate and partial-duplicate suppression.
    let covered = store
        .observed
        .covered_prefix(wire.id.client, wire.id.clock, span);
    if covered >= span {
        return Ok(Integrated::Deduplicated);
    }
    if covered > 0 {
        let right = wire.content.split(covered);
        wire.content = right;
        wire.id = Id::new(wire.id.client, wire.id.clock + covered);
        wire.origin = Some(Id::new(wire.id.client, wire.id.clock - 1));
    }

    // Items from one client form a gap-free sequence; a clock jump means
    // an earlier update has not arrived yet.
    if wire.id.clock > store.observed.next_clock(wire.id.client) {
        return Ok(Integrated::Pending(wire));
    }

    // Resolve the parent type node.
    let key = match &wire.parent {
        WireParent::Root { name, kind } => store
            .get_or_create_root(name, *kind)
            .map_err(|_| IntegrationError::RootKindMismatch { name: name.clone() })?,
        WireParent::Nested(id) => {
            let key = TypeKey::Nested(*id);
            if !store.types.contains_key(&key) {
                if store.observed.contains(*id) {
                    return Err(IntegrationError::UnresolvableOrigin {
                        item_client: wire.id.client,
                        item_clock: wire.id.clock,
                        origin_client: id.client,
                        origin_clock: id.clock,
                    });
                }
                return Ok(Integrated::Pending(wire));
            }
            key
        }
    };

    // Map entries carry no origins; the per-key history resolves order.
    if let Some(sub) = wire.parent_sub.clone() {
        let deleted = matches!(wire.content, Content::Gc(_));
        let mut item = Item::new(wire.id, None, None, wire.content);
        item.deleted = deleted;
        let range = IdRange::new(item.id.client, item.id.clock, item.len());
        store.map_insert(&key, &sub, item);
        return Ok(Integrated::MapEntry { key, sub, range });
    }

    // Resolve and normalize the left bound: after this the origin id is
    // the last id of some item.
    let left_idx = match wire.origin {
        None => None,
        Some(origin) => match store.find_seq_location(&key, origin) {
            Some((idx, offset)) => {
                let node = store.node_mut(&key).ok_or(IntegrationError::InvertedBounds {
                    client: wire.id.client,
                    clock: wire.id.clock,
                })?;
                if offset + 1 < node.seq[idx].len() {
                    let right = node.seq[idx].split(offset + 1);
                    node.seq.insert(idx + 1, right);
                }
                Some(idx)
            }
            None => {
                if store.observed.contains(origin) {
                    return Err(IntegrationError::UnresolvableOrigin {
                        item_client: wire.id.client,
                        item_clock: wire.id.clock,
                        origin_client: origin.client,
                        origin_clock: origin.clock,
                    });
                }
                return Ok(Integrated::Pending(wire));
            }
        },
    };

    // Resolve and normalize the right bound: the right origin id becomes
    // the first id of some item.
    let right_idx = match wire.right_origin {
        None => None,
        Some(right) => match store.find_seq_location(&key, right) {
            Some((idx, offset)) => {
                if offset > 0 {
                    let node =
                        store
                            .node_mut(&key)
                            .ok_or(IntegrationError::InvertedBounds {
                                client: wire.id.client,
                                clock: wire.id.clock,
                            })?;
                    let split = node.seq[idx].split(offset);
                    node.seq.insert(idx + 1, split);
                    Some(idx + 1)
                } else {
                    Some(idx)
                }
            }
            None => {
                if store.observed.contains(right) {
                    return Err(IntegrationError::UnresolvableOrigin {
                        item_client: wire.id.client,
                        item_clock: wire.id.clock,
                        origin_client: right.client,
                        origin_clock: right.clock,
                    });
                }
                return Ok(Integrated::Pending(wire));
            }
        },
    };

    if let (Some(l), Some(r)) = (left_idx, right_idx) {
        if r <= l {
            return Err(IntegrationError::InvertedBounds {
                client: wire.id.client,
                clock: wire.id.clock,
            });
        }
    }

    let pos = {
        let node = store.node(&key).ok_or(IntegrationError::InvertedBounds {
            client: wire.id.client,
            clock: wire.id.clock,
        })?;
        yata_position(&node.seq, left_idx, right_idx, &wire)
    };

    let deleted = matches!(wire.content, Content::Gc(_));
    let mut item = Item::new(wire.id, wire.origin, wire.right_origin, wire.content);
    item.deleted = deleted;
    let range = IdRange::new(item.id.client, item.id.clock, item.len());
    store.splice_seq(&key, pos, item);
    Ok(Integrated::Seq { key, range })
}

/// The YATA conflict scan: walks the concurrent region between the two
/// origin bounds and decides the final insertion index.
///
/// For siblings sharing our exact origin the client id decides (lower
/// client stays left). An item whose origin lies inside the scanned
/// region belongs to a sibling's subtree: it moves us right only when
/// that subtree's root has already been passed.
fn yata_position(
    seq: &[Item],
    left_idx: Option<usize>,
    right_idx: Option<usize>,
    wire: &WireItem,
) -> usize {
    let mut left = left_idx;
    let mut o = left_idx.map(|i| i + 1).unwrap_or(0);
    let end = right_idx.unwrap_or(seq.len());
    let mut conflicting: HashSet<usize> = HashSet::new();
    let mut before_origin: HashSet<usize> = HashSet::new();

    while o < end {
        before_origin.insert(o);
        conflicting.insert(o);
        let existing = &seq[o];
        if existing.origin == wire.origin {
            if existing.id.client < wire.id.client {
                left = Some(o);
                conflicting.clear();
            } else if existing.right_origin == wire.right_origin {
                break;
            }
        } else {
            let origin_item = existing
                .origin
                .and_then(|oo| seq.iter().position(|it| it.contains(oo)));
            match origin_item {
                Some(idx) if before_origin.contains(&idx) => {
                    if !conflicting.contains(&idx) {
                        left = Some(o);
                        conflicting.clear();
                    }
                }
                _ => break,
            }
        }
        o += 1;
    }

    left.map(|i| i + 1).unwrap_or(0)
}
