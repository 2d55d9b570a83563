//! Transactions: atomic mutation batches, per-type delta computation and
//! synchronous observer dispatch.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::doc::{Doc, DocError};
use crate::event::{
    ArrayEvent, Attrs, EntryAction, EntryChange, Event, ListDelta, MapEvent, TextDelta, TextEvent,
    XmlEvent,
};
use crate::id::{cmp_clock_client, Id, IdRange};
use crate::store::{
    apply_attr, integrate_wire_item, Content, DeletedSpan, Integrated, Item, TypeKey, TypeKind,
    TypeNode, WireItem,
};
use crate::types::{outs_of_item, SharedRef};
use crate::undo;
use crate::update::{encode_update, Update};

/// Caller-supplied token identifying the source of a transaction.
/// Observers receive it with every event, so a transport layer can mark
/// remote updates and suppress its own echo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Origin {
    #[default]
    None,
    Token(String),
    /// Transactions produced by an undo manager replaying inverses.
    Undo(u64),
}

impl From<&str> for Origin {
    fn from(token: &str) -> Self {
        Origin::Token(token.to_string())
    }
}

impl From<String> for Origin {
    fn from(token: String) -> Self {
        Origin::Token(token)
    }
}

/// Provenance handed to observers alongside each event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub origin: Origin,
    /// `false` when the batch stems from a remote update.
    pub local: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct CreatedRecord {
    pub(crate) key: TypeKey,
    pub(crate) sub: Option<String>,
    pub(crate) range: IdRange,
}

/// An open mutation batch. All mutations issued through one transaction
/// share a single observer firing round and a single emitted update.
pub struct Transaction<'doc> {
    pub(crate) doc: &'doc mut Doc,
    origin: Origin,
    local: bool,
    pub(crate) created: Vec<CreatedRecord>,
    pub(crate) deleted: Vec<DeletedSpan>,
    changed_order: Vec<TypeKey>,
    changed_subs: HashMap<TypeKey, BTreeSet<String>>,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn begin(doc: &'doc mut Doc, origin: Origin, local: bool) -> Self {
        Self {
            doc,
            origin,
            local,
            created: Vec::new(),
            deleted: Vec::new(),
            changed_order: Vec::new(),
            changed_subs: HashMap::new(),
        }
    }

    /// Read access to the document mid-transaction.
    pub fn doc(&self) -> &Doc {
        self.doc
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    fn touch(&mut self, key: &TypeKey) {
        if !self.changed_order.contains(key) {
            self.changed_order.push(key.clone());
        }
    }

    fn touch_sub(&mut self, key: &TypeKey, sub: &str) {
        self.touch(key);
        self.changed_subs
            .entry(key.clone())
            .or_default()
            .insert(sub.to_string());
    }

    pub(crate) fn require_attached(&self, key: &TypeKey) -> Result<(), DocError> {
        if self.doc.store.node(key).is_none() {
            return Err(DocError::DetachedType);
        }
        Ok(())
    }

    pub(crate) fn alloc_id(&self) -> Id {
        let client = self.doc.client_id();
        Id::new(client, self.doc.store.observed.next_clock(client))
    }

    /// Inserts a batch of content runs at a live index; returns the id of
    /// each created item. Indices beyond the live length clamp to append.
    pub(crate) fn insert_content(
        &mut self,
        key: &TypeKey,
        index: u64,
        contents: Vec<Content>,
    ) -> Result<Vec<Id>, DocError> {
        self.require_attached(key)?;
        let (mut pos, mut origin, right) = self.doc.store.seq_boundary(key, index);
        let mut ids = Vec::with_capacity(contents.len());
        for content in contents {
            let id = self.alloc_id();
            let len = content.len();
            let item = Item::new(id, origin, right, content);
            self.doc.store.splice_seq(key, pos, item);
            self.record_created(key.clone(), None, IdRange::new(id.client, id.clock, len));
            origin = Some(Id::new(id.client, id.clock + len - 1));
            pos += 1;
            ids.push(id);
        }
        Ok(ids)
    }

    pub(crate) fn delete_seq(
        &mut self,
        key: &TypeKey,
        index: u64,
        len: u64,
    ) -> Result<(), DocError> {
        self.require_attached(key)?;
        let spans = self.doc.store.delete_seq_range(key, index, len);
        self.record_deleted(spans);
        Ok(())
    }

    pub(crate) fn map_set_content(
        &mut self,
        key: &TypeKey,
        sub: &str,
        content: Content,
    ) -> Result<Id, DocError> {
        self.require_attached(key)?;
        let id = self.alloc_id();
        let len = content.len();
        let item = Item::new(id, None, None, content);
        self.doc.store.map_insert(key, sub, item);
        self.record_created(
            key.clone(),
            Some(sub.to_string()),
            IdRange::new(id.client, id.clock, len),
        );
        Ok(id)
    }

    pub(crate) fn map_remove(&mut self, key: &TypeKey, sub: &str) -> Result<(), DocError> {
        self.require_attached(key)?;
        let spans = self.doc.store.delete_map_key(key, sub);
        self.record_deleted(spans);
        Ok(())
    }

    pub(crate) fn record_created(&mut self, key: TypeKey, sub: Option<String>, range: IdRange) {
        match &sub {
            Some(s) => self.touch_sub(&key, s),
            None => self.touch(&key),
        }
        self.created.push(CreatedRecord { key, sub, range });
    }

    pub(crate) fn record_deleted(&mut self, spans: Vec<DeletedSpan>) {
        for span in spans {
            match &span.parent_sub {
                Some(sub) => {
                    let sub = sub.clone();
                    self.touch_sub(&span.parent, &sub);
                }
                None => self.touch(&span.parent),
            }
            self.deleted.push(span);
        }
    }

    /// Integrates one locally constructed wire item (undo restoration).
    /// Returns whether the item actually landed.
    pub(crate) fn integrate_local(&mut self, wire: WireItem) -> Result<bool, DocError> {
        match integrate_wire_item(&mut self.doc.store, wire) {
            Ok(Integrated::Seq { key, range }) => {
                self.record_created(key, None, range);
                Ok(true)
            }
            Ok(Integrated::MapEntry {
                key, sub, range, ..
            }) => {
                self.record_created(key, Some(sub), range);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => Err(DocError::CorruptUpdate(err.to_string())),
        }
    }

    /// Integrates a decoded remote update. Items whose causal context is
    /// missing are parked and retried as later updates fill the gaps; a
    /// structurally unresolvable item aborts with an error (the caller
    /// restores the pre-update snapshot).
    pub(crate) fn integrate_update(&mut self, update: Update) -> Result<(), DocError> {
        let mut work: Vec<WireItem> = update.items;
        work.extend(std::mem::take(&mut self.doc.store.pending_items));
        loop {
            let mut still_pending = Vec::new();
            let mut progress = false;
            for wire in work.drain(..) {
                match integrate_wire_item(&mut self.doc.store, wire)
                    .map_err(|err| DocError::CorruptUpdate(err.to_string()))?
                {
                    Integrated::Pending(w) => still_pending.push(w),
                    Integrated::Deduplicated => {}
                    Integrated::Seq { key, range } => {
                        self.record_created(key, None, range);
                        progress = true;
                    }
                    Integrated::MapEntry {
                        key, sub, range, ..
                    } => {
                        self.record_created(key, Some(sub), range);
                        progress = true;
                    }
                }
            }
            if still_pending.is_empty() || !progress {
                if !still_pending.is_empty() {
                    debug!(
                        count = still_pending.len(),
                        "parked remote items awaiting missing context"
                    );
                }
                self.doc.store.pending_items = still_pending;
                break;
            }
            work = still_pending;
        }

        let mut deletes: Vec<IdRange> = update.deletes;
        deletes.extend(std::mem::take(&mut self.doc.store.pending_deletes));
        for range in deletes {
            let (spans, leftover) = self.doc.store.delete_id_range(range);
            self.record_deleted(spans);
            self.doc.store.pending_deletes.extend(leftover);
        }
        Ok(())
    }

    pub(crate) fn commit(mut self) {
        let info = TransactionInfo {
            origin: self.origin.clone(),
            local: self.local,
        };
        let events = self.build_events();
        self.dispatch_shallow(&events, &info);
        self.dispatch_deep(&events, &info);
        self.doc.fire_after_transaction(&info);
        self.emit_update();
        undo::capture_transaction(self.doc, &self.origin, &self.created, &self.deleted);
        self.run_gc();
    }

    fn created_ranges(&self, key: &TypeKey, sub: Option<&str>) -> Vec<IdRange> {
        self.created
            .iter()
            .filter(|rec| &rec.key == key && rec.sub.as_deref() == sub)
            .map(|rec| rec.range)
            .collect()
    }

    fn deleted_ranges(&self, key: &TypeKey, sub: Option<&str>) -> Vec<IdRange> {
        self.deleted
            .iter()
            .filter(|span| &span.parent == key && span.parent_sub.as_deref() == sub)
            .map(|span| span.range)
            .collect()
    }

    fn build_events(&self) -> Vec<Event> {
        let store = &self.doc.store;
        let mut events = Vec::new();
        for key in &self.changed_order {
            let Some(node) = store.node(key) else {
                continue;
            };
            let target = SharedRef::from_key_kind(key.clone(), node.kind);
            let path = store.path_of(key);
            let created = self.created_ranges(key, None);
            let deleted = self.deleted_ranges(key, None);
            let event = match node.kind {
                TypeKind::Text | TypeKind::XmlText => Event::Text(TextEvent {
                    target,
                    path,
                    delta: build_text_delta(node, &created, &deleted),
                }),
                TypeKind::Array => Event::Array(ArrayEvent {
                    target,
                    path,
                    delta: build_list_delta(node, &created, &deleted),
                }),
                TypeKind::Map => Event::Map(MapEvent {
                    target,
                    path,
                    keys: self.build_entry_changes(key, node),
                }),
                TypeKind::XmlElement | TypeKind::XmlFragment => Event::Xml(XmlEvent {
                    target,
                    path,
                    children: build_list_delta(node, &created, &deleted),
                    attributes: self.build_entry_changes(key, node),
                }),
            };
            events.push(event);
        }
        events
    }

    fn build_entry_changes(&self, key: &TypeKey, node: &TypeNode) -> HashMap<String, EntryChange> {
        let mut out = HashMap::new();
        let Some(subs) = self.changed_subs.get(key) else {
            return out;
        };
        for sub in subs {
            let created = self.created_ranges(key, Some(sub));
            let deleted = self.deleted_ranges(key, Some(sub));
            let prev = node.map.get(sub).and_then(|items| {
                items
                    .iter()
                    .filter(|item| !covered(&created, item.id))
                    .filter(|item| !item.deleted || covered(&deleted, item.id))
                    .max_by(|a, b| cmp_clock_client(a.id, b.id))
            });
            let cur = node.winner(sub);
            let prev_id = prev.map(|item| item.id);
            let cur_id = cur.map(|item| item.id);
            if prev_id == cur_id {
                continue;
            }
            let old_value = prev.and_then(|item| outs_of_item(item).into_iter().next());
            let new_value = cur.and_then(|item| outs_of_item(item).into_iter().next());
            let action = match (prev_id, cur_id) {
                (None, Some(_)) => EntryAction::Add,
                (Some(_), Some(_)) => EntryAction::Update,
                (Some(_), None) => EntryAction::Delete,
                (None, None) => continue,
            };
            out.insert(
                sub.clone(),
                EntryChange {
                    action,
                    old_value,
                    new_value,
                },
            );
        }
        out
    }

    fn dispatch_shallow(&mut self, events: &[Event], info: &TransactionInfo) {
        for event in events {
            let key = event.target().key().clone();
            if let Some(mut callbacks) = self.doc.observers.type_observers.remove(&key) {
                for (_, callback) in callbacks.iter_mut() {
                    if catch_unwind(AssertUnwindSafe(|| callback(event, info))).is_err() {
                        warn!("type observer panicked; remaining observers still dispatched");
                    }
                }
                self.doc.observers.type_observers.insert(key, callbacks);
            }
        }
    }

    fn dispatch_deep(&mut self, events: &[Event], info: &TransactionInfo) {
        if events.is_empty() || self.doc.observers.deep_observers.is_empty() {
            return;
        }
        // Collect, per deep-observed type, the ordered events fired on it
        // or any of its descendants; dispatch deepest ancestors first.
        let mut targets: Vec<(usize, TypeKey, Vec<Event>)> = Vec::new();
        {
            let store = &self.doc.store;
            for key in self.doc.observers.deep_observers.keys() {
                let selected: Vec<Event> = events
                    .iter()
                    .filter(|event| {
                        let target = event.target().key();
                        target == key || store.ancestors(target).contains(key)
                    })
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    continue;
                }
                let depth = store.ancestors(key).len();
                targets.push((depth, key.clone(), selected));
            }
        }
        targets.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, key, selected) in targets {
            if let Some(mut callbacks) = self.doc.observers.deep_observers.remove(&key) {
                for (_, callback) in callbacks.iter_mut() {
                    if catch_unwind(AssertUnwindSafe(|| callback(&selected, info))).is_err() {
                        warn!("deep observer panicked; remaining observers still dispatched");
                    }
                }
                self.doc.observers.deep_observers.insert(key, callbacks);
            }
        }
    }

    fn emit_update(&mut self) {
        if self.created.is_empty() && self.deleted.is_empty() {
            return;
        }
        if self.doc.observers.update_hooks.is_empty() {
            return;
        }
        let mut items = Vec::new();
        for rec in &self.created {
            self.doc
                .store
                .wire_items_in_range(&rec.key, rec.sub.as_ref(), rec.range, &mut items);
        }
        let deletes = merge_ranges(self.deleted.iter().map(|span| span.range));
        let update = Update { items, deletes };
        match encode_update(&update) {
            Ok(payload) => {
                let origin = self.origin.clone();
                self.doc.fire_update(&payload, &origin);
            }
            Err(err) => warn!(%err, "failed to encode update payload"),
        }
    }

    fn run_gc(&mut self) {
        if !self.doc.store.gc {
            return;
        }
        let protected: Vec<bool> = self
            .deleted
            .iter()
            .map(|span| undo::protects(&self.doc.undo, &self.doc.store, &span.parent))
            .collect();
        for (span, protected) in self.deleted.iter().zip(protected) {
            if !protected {
                self.doc.store.collect_span(span);
            }
        }
    }
}

pub(crate) fn covered(ranges: &[IdRange], id: Id) -> bool {
    ranges.iter().any(|range| range.contains(id))
}

/// Sorts and merges contiguous delete ranges per client.
pub(crate) fn merge_ranges(ranges: impl Iterator<Item = IdRange>) -> Vec<IdRange> {
    let mut all: Vec<IdRange> = ranges.collect();
    all.sort_by_key(|r| (r.client, r.clock));
    let mut merged: Vec<IdRange> = Vec::with_capacity(all.len());
    for range in all {
        match merged.last_mut() {
            Some(last) if last.client == range.client && range.clock <= last.end() => {
                let end = last.end().max(range.end());
                last.len = end - last.clock;
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Computes the difference between two attribute states as a delta
/// attribute map (removed keys become explicit nulls).
fn attr_diff(old: &Attrs, new: &Attrs) -> Option<Attrs> {
    let mut diff = Attrs::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.insert(key.clone(), serde_json::Value::Null);
        }
    }
    if diff.is_empty() {
        None
    } else {
        Some(diff)
    }
}

fn push_text_op(ops: &mut Vec<TextDelta>, op: TextDelta) {
    match (ops.last_mut(), &op) {
        (
            Some(TextDelta::Retain { len, attributes }),
            TextDelta::Retain {
                len: add,
                attributes: new_attrs,
            },
        ) if attributes == new_attrs => {
            *len += add;
        }
        (
            Some(TextDelta::Insert { text, attributes }),
            TextDelta::Insert {
                text: more,
                attributes: new_attrs,
            },
        ) if attributes == new_attrs => {
            text.push_str(more);
        }
        (Some(TextDelta::Delete { len }), TextDelta::Delete { len: add }) => {
            *len += add;
        }
        _ => ops.push(op),
    }
}

/// One ordered walk over a text sequence classifying created, deleted and
/// retained spans, with formatting attribution threaded through.
fn build_text_delta(node: &TypeNode, created: &[IdRange], deleted: &[IdRange]) -> Vec<TextDelta> {
    let mut ops: Vec<TextDelta> = Vec::new();
    let mut cur = Attrs::new();
    let mut old = Attrs::new();
    for item in &node.seq {
        let is_created = covered(created, item.id);
        let is_del_txn = covered(deleted, item.id);
        match &item.content {
            Content::Format { key, value } => {
                if !item.deleted {
                    apply_attr(&mut cur, key, value);
                }
                let was_live_before = !is_created && (!item.deleted || is_del_txn);
                if was_live_before {
                    apply_attr(&mut old, key, value);
                }
            }
            content => {
                if is_created && !item.deleted {
                    let attributes = if cur.is_empty() {
                        None
                    } else {
                        Some(cur.clone())
                    };
                    match content {
                        Content::Str(text) => push_text_op(
                            &mut ops,
                            TextDelta::Insert {
                                text: text.clone(),
                                attributes,
                            },
                        ),
                        Content::Embed(value) => push_text_op(
                            &mut ops,
                            TextDelta::InsertEmbed {
                                value: value.clone(),
                                attributes,
                            },
                        ),
                        _ => {}
                    }
                } else if is_created && item.deleted {
                    // created and deleted within the same batch: invisible
                } else if item.deleted && is_del_txn {
                    push_text_op(&mut ops, TextDelta::Delete { len: item.len() });
                } else if !item.deleted {
                    push_text_op(
                        &mut ops,
                        TextDelta::Retain {
                            len: item.visible_len(),
                            attributes: attr_diff(&old, &cur),
                        },
                    );
                }
            }
        }
    }
    while matches!(
        ops.last(),
        Some(TextDelta::Retain {
            attributes: None,
            ..
        })
    ) {
        ops.pop();
    }
    ops
}

fn push_list_op(ops: &mut Vec<ListDelta>, op: ListDelta) {
    match (ops.last_mut(), op) {
        (Some(ListDelta::Retain { len }), ListDelta::Retain { len: add }) => *len += add,
        (Some(ListDelta::Delete { len }), ListDelta::Delete { len: add }) => *len += add,
        (Some(ListDelta::Insert { values }), ListDelta::Insert { values: mut more }) => {
            values.append(&mut more);
        }
        (_, op) => ops.push(op),
    }
}

fn build_list_delta(node: &TypeNode, created: &[IdRange], deleted: &[IdRange]) -> Vec<ListDelta> {
    let mut ops: Vec<ListDelta> = Vec::new();
    for item in &node.seq {
        if !item.countable() {
            continue;
        }
        let is_created = covered(created, item.id);
        let is_del_txn = covered(deleted, item.id);
        if is_created && !item.deleted {
            push_list_op(
                &mut ops,
                ListDelta::Insert {
                    values: outs_of_item(item),
                },
            );
        } else if is_created && item.deleted {
            // net-zero within the batch
        } else if item.deleted && is_del_txn {
            push_list_op(&mut ops, ListDelta::Delete { len: item.len() });
        } else if !item.deleted {
            push_list_op(
                &mut ops,
                ListDelta::Retain {
                    len: item.visible_len(),
                },
            );
        }
    }
    while matches!(ops.last(), Some(ListDelta::Retain { .. })) {
        ops.pop();
    }
    ops
}
