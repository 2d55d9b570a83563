//! The item store: per-type sequences and key histories of content
//! fragments, plus the remote bookkeeping (observed clocks, pending
//! buffers) needed for order-independent convergence.

mod integrate;
mod item;

pub(crate) use integrate::{integrate_wire_item, Integrated};
pub(crate) use item::{Content, Item, TypeDescriptor};
pub use item::TypeKind;

use std::collections::HashMap;

use serde_json::Value;

use crate::event::{Attrs, PathStep};
use crate::id::{cmp_clock_client, Id, IdRange, ObservedClocks};

/// Key of a type node: a named root or a nested type identified by the
/// item that embeds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TypeKey {
    Root(String),
    Nested(Id),
}

/// Parent reference carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WireParent {
    Root { name: String, kind: TypeKind },
    Nested(Id),
}

/// One decoded item as carried inside an update payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireItem {
    pub(crate) id: Id,
    pub(crate) origin: Option<Id>,
    pub(crate) right_origin: Option<Id>,
    pub(crate) parent: WireParent,
    pub(crate) parent_sub: Option<String>,
    pub(crate) content: Content,
}

/// Record of one deleted content span, captured for events, update
/// emission and undo restoration.
#[derive(Debug, Clone)]
pub(crate) struct DeletedSpan {
    pub(crate) parent: TypeKey,
    pub(crate) parent_sub: Option<String>,
    pub(crate) range: IdRange,
    pub(crate) content: Content,
    /// Formatting attributes active over the span at deletion time.
    pub(crate) attributes: Option<Attrs>,
}

/// One shared type: a sequence of items plus a key-history map. Text,
/// arrays and XML child lists use `seq`; map entries and XML element
/// attributes use `map`. XML elements use both.
#[derive(Debug, Clone)]
pub(crate) struct TypeNode {
    pub(crate) kind: TypeKind,
    pub(crate) node_name: Option<String>,
    /// Non-owning back-reference to the parent type.
    pub(crate) parent: Option<TypeKey>,
    pub(crate) seq: Vec<Item>,
    pub(crate) map: HashMap<String, Vec<Item>>,
}

impl TypeNode {
    pub(crate) fn new(kind: TypeKind, node_name: Option<String>, parent: Option<TypeKey>) -> Self {
        Self {
            kind,
            node_name,
            parent,
            seq: Vec::new(),
            map: HashMap::new(),
        }
    }

    /// Number of live countable units in the sequence.
    pub(crate) fn live_len(&self) -> u64 {
        self.seq.iter().map(Item::visible_len).sum()
    }

    /// Highest-identifier live entry for a map key.
    pub(crate) fn winner(&self, sub: &str) -> Option<&Item> {
        self.map
            .get(sub)?
            .iter()
            .filter(|item| !item.deleted)
            .max_by(|a, b| cmp_clock_client(a.id, b.id))
    }

    /// Keys with at least one live entry, sorted for deterministic
    /// projections.
    pub(crate) fn live_keys(&self) -> Vec<&String> {
        let mut keys: Vec<&String> = self
            .map
            .iter()
            .filter(|(_, items)| items.iter().any(|item| !item.deleted))
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys
    }
}

/// Applies one formatting assignment to an attribute set; a null value
/// clears the key.
pub(crate) fn apply_attr(attrs: &mut Attrs, key: &str, value: &Value) {
    if value.is_null() {
        attrs.shift_remove(key);
    } else {
        attrs.insert(key.to_string(), value.clone());
    }
}

/// Document-wide storage of type nodes plus remote bookkeeping.
#[derive(Debug, Default, Clone)]
pub(crate) struct Store {
    pub(crate) types: HashMap<TypeKey, TypeNode>,
    pub(crate) observed: ObservedClocks,
    /// Remote items whose causal prerequisites have not arrived yet.
    pub(crate) pending_items: Vec<WireItem>,
    /// Remote delete ranges referencing ids not yet observed.
    pub(crate) pending_deletes: Vec<IdRange>,
    pub(crate) gc: bool,
}

impl Store {
    pub(crate) fn new(gc: bool) -> Self {
        Self {
            gc,
            ..Self::default()
        }
    }

    /// Looks up or creates a named root node. An existing root with a
    /// different kind is reported back to the caller.
    pub(crate) fn get_or_create_root(
        &mut self,
        name: &str,
        kind: TypeKind,
    ) -> Result<TypeKey, TypeKind> {
        let key = TypeKey::Root(name.to_string());
        match self.types.get(&key) {
            Some(node) if node.kind == kind => Ok(key),
            Some(node) => Err(node.kind),
            None => {
                self.types.insert(key.clone(), TypeNode::new(kind, None, None));
                Ok(key)
            }
        }
    }

    pub(crate) fn node(&self, key: &TypeKey) -> Option<&TypeNode> {
        self.types.get(key)
    }

    pub(crate) fn node_mut(&mut self, key: &TypeKey) -> Option<&mut TypeNode> {
        self.types.get_mut(key)
    }

    /// Registers nested type nodes carried by an item's content.
    fn register_content(&mut self, parent: &TypeKey, item: &Item) {
        if let Content::Type(desc) = &item.content {
            self.types.insert(
                TypeKey::Nested(item.id),
                TypeNode::new(desc.kind, desc.node_name.clone(), Some(parent.clone())),
            );
        }
    }

    /// Raw sequence insertion at a known position.
    pub(crate) fn splice_seq(&mut self, key: &TypeKey, pos: usize, item: Item) {
        self.register_content(key, &item);
        self.observed
            .observe(item.id.client, item.id.clock, item.len());
        if let Some(node) = self.types.get_mut(key) {
            node.seq.insert(pos, item);
        }
    }

    /// Appends a map entry to the key's history.
    pub(crate) fn map_insert(&mut self, key: &TypeKey, sub: &str, item: Item) {
        self.register_content(key, &item);
        self.observed
            .observe(item.id.client, item.id.clock, item.len());
        if let Some(node) = self.types.get_mut(key) {
            node.map.entry(sub.to_string()).or_default().push(item);
        }
    }

    /// Resolves a live index to a concrete insertion boundary, splitting
    /// a run when the boundary falls inside it. Indices beyond the live
    /// length clamp to append. Returns `(position, origin, right_origin)`.
    pub(crate) fn seq_boundary(
        &mut self,
        key: &TypeKey,
        index: u64,
    ) -> (usize, Option<Id>, Option<Id>) {
        let Some(node) = self.types.get_mut(key) else {
            return (0, None, None);
        };
        let mut remaining = index;
        let mut i = 0;
        let (mut pos, mut origin) = loop {
            if i >= node.seq.len() {
                break (node.seq.len(), node.seq.last().map(Item::last_id));
            }
            let vis = node.seq[i].visible_len();
            if remaining == 0 {
                let origin = if i == 0 {
                    None
                } else {
                    Some(node.seq[i - 1].last_id())
                };
                break (i, origin);
            }
            if remaining < vis {
                let right_half = node.seq[i].split(remaining);
                node.seq.insert(i + 1, right_half);
                break (i + 1, Some(node.seq[i].last_id()));
            }
            remaining -= vis;
            i += 1;
            if remaining == 0 && vis > 0 {
                break (i, Some(node.seq[i - 1].last_id()));
            }
        };
        // Insertions land after formatting markers sitting at the
        // boundary, so inserted content adopts the attributes active at
        // the index.
        while pos < node.seq.len() && !node.seq[pos].countable() {
            origin = Some(node.seq[pos].last_id());
            pos += 1;
        }
        let right = node.seq.get(pos).map(|item| item.id);
        (pos, origin, right)
    }

    /// Formatting attributes active at a live index (all live markers
    /// strictly before the boundary).
    pub(crate) fn active_attrs_at(&self, key: &TypeKey, index: u64) -> Attrs {
        let mut attrs = Attrs::new();
        let Some(node) = self.types.get(key) else {
            return attrs;
        };
        let mut remaining = index;
        for item in &node.seq {
            if let Content::Format { key: k, value } = &item.content {
                if !item.deleted {
                    apply_attr(&mut attrs, k, value);
                }
                continue;
            }
            let vis = item.visible_len();
            if remaining == 0 {
                break;
            }
            if remaining < vis {
                break;
            }
            remaining -= vis;
        }
        attrs
    }

    /// Marks `len` live countable units deleted starting at `index`,
    /// splitting run boundaries. Deletion past the live end trims
    /// silently. Already-deleted content is skipped, never an error.
    pub(crate) fn delete_seq_range(
        &mut self,
        key: &TypeKey,
        index: u64,
        len: u64,
    ) -> Vec<DeletedSpan> {
        let mut spans = Vec::new();
        let Some(node) = self.types.get_mut(key) else {
            return spans;
        };
        let mut attrs = Attrs::new();
        let mut skip = index;
        let mut remaining = len;
        let mut i = 0;
        while i < node.seq.len() && remaining > 0 {
            if let Content::Format { key: k, value } = &node.seq[i].content {
                if !node.seq[i].deleted {
                    let (k, value) = (k.clone(), value.clone());
                    apply_attr(&mut attrs, &k, &value);
                }
                i += 1;
                continue;
            }
            let vis = node.seq[i].visible_len();
            if vis == 0 {
                i += 1;
                continue;
            }
            if skip >= vis {
                skip -= vis;
                i += 1;
                continue;
            }
            if skip > 0 {
                let right = node.seq[i].split(skip);
                node.seq.insert(i + 1, right);
                skip = 0;
                i += 1;
                continue;
            }
            let take = vis.min(remaining);
            if take < vis {
                let right = node.seq[i].split(take);
                node.seq.insert(i + 1, right);
            }
            let item = &mut node.seq[i];
            item.deleted = true;
            let capture_attrs = match item.content {
                Content::Str(_) | Content::Embed(_) if !attrs.is_empty() => Some(attrs.clone()),
                _ => None,
            };
            spans.push(DeletedSpan {
                parent: key.clone(),
                parent_sub: None,
                range: IdRange::new(item.id.client, item.id.clock, item.len()),
                content: item.content.clone(),
                attributes: capture_attrs,
            });
            remaining -= take;
            i += 1;
        }
        spans
    }

    /// Tombstones all live entries of a map key.
    pub(crate) fn delete_map_key(&mut self, key: &TypeKey, sub: &str) -> Vec<DeletedSpan> {
        let mut spans = Vec::new();
        let Some(node) = self.types.get_mut(key) else {
            return spans;
        };
        if let Some(items) = node.map.get_mut(sub) {
            for item in items.iter_mut().filter(|item| !item.deleted) {
                item.deleted = true;
                spans.push(DeletedSpan {
                    parent: key.clone(),
                    parent_sub: Some(sub.to_string()),
                    range: IdRange::new(item.id.client, item.id.clock, item.len()),
                    content: item.content.clone(),
                    attributes: None,
                });
            }
        }
        spans
    }

    /// Applies a remote delete range to whatever items it covers.
    /// Returns the spans actually tombstoned now plus the sub-ranges
    /// whose items are entirely unknown (parked pending by the caller).
    pub(crate) fn delete_id_range(
        &mut self,
        range: IdRange,
    ) -> (Vec<DeletedSpan>, Vec<IdRange>) {
        let leftover = self.observed.unobserved_parts(range);
        let mut spans = Vec::new();
        let keys: Vec<TypeKey> = self.types.keys().cloned().collect();
        for key in keys {
            let Some(node) = self.types.get_mut(&key) else {
                continue;
            };
            let mut i = 0;
            while i < node.seq.len() {
                let item = &node.seq[i];
                let start = item.id.clock;
                let end = start + item.len();
                let overlaps = item.id.client == range.client
                    && start < range.end()
                    && end > range.clock;
                if !overlaps || item.deleted {
                    i += 1;
                    continue;
                }
                let ostart = range.clock.max(start);
                let oend = range.end().min(end);
                if ostart > start {
                    let right = node.seq[i].split(ostart - start);
                    node.seq.insert(i + 1, right);
                    i += 1;
                    continue;
                }
                if oend < end {
                    let right = node.seq[i].split(oend - start);
                    node.seq.insert(i + 1, right);
                }
                let item = &mut node.seq[i];
                item.deleted = true;
                spans.push(DeletedSpan {
                    parent: key.clone(),
                    parent_sub: None,
                    range: IdRange::new(item.id.client, item.id.clock, item.len()),
                    content: item.content.clone(),
                    attributes: None,
                });
                i += 1;
            }
            let subs: Vec<String> = node.map.keys().cloned().collect();
            for sub in subs {
                let Some(items) = self.types.get_mut(&key).and_then(|n| n.map.get_mut(&sub))
                else {
                    continue;
                };
                for item in items.iter_mut() {
                    if !item.deleted
                        && item.id.client == range.client
                        && item.id.clock >= range.clock
                        && item.id.clock < range.end()
                    {
                        item.deleted = true;
                        spans.push(DeletedSpan {
                            parent: key.clone(),
                            parent_sub: Some(sub.clone()),
                            range: IdRange::new(item.id.client, item.id.clock, item.len()),
                            content: item.content.clone(),
                            attributes: None,
                        });
                    }
                }
            }
        }
        (spans, leftover)
    }

    /// Locates the sequence item containing `id` within one type.
    pub(crate) fn find_seq_location(&self, key: &TypeKey, id: Id) -> Option<(usize, u64)> {
        let node = self.types.get(key)?;
        let idx = node.seq.iter().position(|item| item.contains(id))?;
        Some((idx, id.clock - node.seq[idx].id.clock))
    }

    /// Drops the payload of garbage-collectable tombstones in a span.
    /// Embedded type items keep their content so nested nodes stay
    /// resolvable; ids are always retained.
    pub(crate) fn collect_span(&mut self, span: &DeletedSpan) {
        let Some(node) = self.types.get_mut(&span.parent) else {
            return;
        };
        let items: &mut [Item] = match &span.parent_sub {
            Some(sub) => match node.map.get_mut(sub) {
                Some(items) => items,
                None => return,
            },
            None => &mut node.seq,
        };
        for item in items.iter_mut() {
            if item.deleted
                && item.id.client == span.range.client
                && item.id.clock >= span.range.clock
                && item.id.clock < span.range.end()
                && !matches!(item.content, Content::Type(_) | Content::Gc(_))
            {
                item.content = Content::Gc(item.len());
            }
        }
    }

    /// Wire parent reference for a type key.
    pub(crate) fn wire_parent(&self, key: &TypeKey) -> WireParent {
        match key {
            TypeKey::Root(name) => WireParent::Root {
                name: name.clone(),
                kind: self
                    .types
                    .get(key)
                    .map(|node| node.kind)
                    .unwrap_or(TypeKind::Map),
            },
            TypeKey::Nested(id) => WireParent::Nested(*id),
        }
    }

    fn wire_from_item(&self, key: &TypeKey, sub: Option<&String>, item: &Item) -> WireItem {
        WireItem {
            id: item.id,
            origin: item.origin,
            right_origin: item.right_origin,
            parent: self.wire_parent(key),
            parent_sub: sub.cloned(),
            content: item.content.clone(),
        }
    }

    /// Collects the wire form of items created inside an id range of one
    /// type (the range may span several items after splits).
    pub(crate) fn wire_items_in_range(
        &self,
        key: &TypeKey,
        sub: Option<&String>,
        range: IdRange,
        out: &mut Vec<WireItem>,
    ) {
        let Some(node) = self.types.get(key) else {
            return;
        };
        match sub {
            Some(sub_key) => {
                if let Some(items) = node.map.get(sub_key) {
                    for item in items {
                        if range.contains(item.id) {
                            out.push(self.wire_from_item(key, sub, item));
                        }
                    }
                }
            }
            None => {
                for item in &node.seq {
                    if range.contains(item.id) {
                        out.push(self.wire_from_item(key, sub, item));
                    }
                }
            }
        }
    }

    /// Every item in the store in wire form, for full-state export.
    pub(crate) fn all_wire_items(&self) -> Vec<WireItem> {
        let mut out = Vec::new();
        for (key, node) in &self.types {
            for item in &node.seq {
                out.push(self.wire_from_item(key, None, item));
            }
            for (sub, items) in &node.map {
                for item in items {
                    out.push(self.wire_from_item(key, Some(sub), item));
                }
            }
        }
        out
    }

    /// Id ranges of every tombstone, for full-state export.
    pub(crate) fn all_tombstones(&self) -> Vec<IdRange> {
        let mut out = Vec::new();
        for node in self.types.values() {
            for item in node.seq.iter().filter(|item| item.deleted) {
                out.push(IdRange::new(item.id.client, item.id.clock, item.len()));
            }
            for items in node.map.values() {
                for item in items.iter().filter(|item| item.deleted) {
                    out.push(IdRange::new(item.id.client, item.id.clock, item.len()));
                }
            }
        }
        out
    }

    /// Chain of ancestors for a type, closest first.
    pub(crate) fn ancestors(&self, key: &TypeKey) -> Vec<TypeKey> {
        let mut out = Vec::new();
        let mut cur = key.clone();
        while let Some(parent) = self.types.get(&cur).and_then(|node| node.parent.clone()) {
            out.push(parent.clone());
            cur = parent;
        }
        out
    }

    /// Path from the root type down to (excluding) the given type.
    pub(crate) fn path_of(&self, key: &TypeKey) -> Vec<PathStep> {
        let mut steps = Vec::new();
        let mut cur = key.clone();
        while let TypeKey::Nested(id) = cur.clone() {
            let Some(parent) = self.types.get(&cur).and_then(|node| node.parent.clone()) else {
                break;
            };
            let Some(pnode) = self.types.get(&parent) else {
                break;
            };
            if let Some((sub, _)) = pnode
                .map
                .iter()
                .find(|(_, items)| items.iter().any(|item| item.contains(id)))
            {
                steps.push(PathStep::Key(sub.clone()));
            } else {
                let mut idx = 0u64;
                for item in &pnode.seq {
                    if item.contains(id) {
                        break;
                    }
                    idx += item.visible_len();
                }
                steps.push(PathStep::Index(idx));
            }
            cur = parent;
        }
        steps.reverse();
        steps
    }
}
