//! Selective undo/redo: captures invertible stack items from tracked
//! transactions and replays inverse operations.
//!
//! Managers live inside the document registry and are driven through a
//! small copyable handle, keeping ownership acyclic: the document owns
//! the manager state, callers only hold an id.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::warn;

use crate::doc::{Doc, DocError, SubscriptionId};
use crate::id::{cmp_clock_client, IdRange};
use crate::store::{Content, DeletedSpan, Store, TypeKey, WireItem};
use crate::transaction::{CreatedRecord, Origin, Transaction};
use crate::types::{text_format, SharedRef};

/// Information handed to a delete filter about one deleted span.
#[derive(Debug, Clone)]
pub struct DeletedItem {
    pub parent: SharedRef,
    pub len: u64,
    /// JSON preview of the deleted content.
    pub content: Value,
}

type DeleteFilterFn = Box<dyn Fn(&DeletedItem) -> bool>;
type AddedCallback = Box<dyn FnMut(&mut StackItem, StackKind, &Origin)>;
type PoppedCallback = Box<dyn FnMut(&StackItem, StackKind, &Origin)>;

/// Construction options for an undo manager.
pub struct UndoOptions {
    /// Captures closer together than this merge into one stack item,
    /// producing typing-session granularity instead of per-keystroke undo.
    pub capture_timeout: Duration,
    /// Origins whose transactions are captured. Empty tracks only
    /// transactions carrying the default origin.
    pub tracked_origins: HashSet<Origin>,
    /// Excludes specific deleted content from being restorable.
    pub delete_filter: Option<DeleteFilterFn>,
}

impl Default for UndoOptions {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_millis(500),
            tracked_origins: HashSet::new(),
            delete_filter: None,
        }
    }
}

/// Which stack an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Undo,
    Redo,
}

/// One invertible capture: the ranges a transaction inserted and the
/// content it deleted, plus an open meta map for caller context (cursor
/// positions and the like).
#[derive(Debug, Clone)]
pub struct StackItem {
    pub(crate) insertions: Vec<(TypeKey, IdRange)>,
    pub(crate) deletions: Vec<DeletedSpan>,
    pub meta: HashMap<String, Value>,
}

impl StackItem {
    fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty()
    }
}

/// Handle to an undo manager registered on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UndoManagerRef {
    pub(crate) id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayState {
    Idle,
    Undoing,
    Redoing,
}

pub(crate) struct ManagerState {
    scope: Vec<TypeKey>,
    options: UndoOptions,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    last_capture: Option<Instant>,
    capture_stopped: bool,
    state: ReplayState,
    added_callbacks: Vec<(SubscriptionId, AddedCallback)>,
    popped_callbacks: Vec<(SubscriptionId, PoppedCallback)>,
}

#[derive(Default)]
pub(crate) struct UndoRegistry {
    pub(crate) managers: HashMap<u64, ManagerState>,
    next_id: u64,
}

impl UndoRegistry {
    pub(crate) fn remove_subscription(&mut self, id: SubscriptionId) -> bool {
        for manager in self.managers.values_mut() {
            if let Some(pos) = manager
                .added_callbacks
                .iter()
                .position(|(sid, _)| *sid == id)
            {
                manager.added_callbacks.remove(pos);
                return true;
            }
            if let Some(pos) = manager
                .popped_callbacks
                .iter()
                .position(|(sid, _)| *sid == id)
            {
                manager.popped_callbacks.remove(pos);
                return true;
            }
        }
        false
    }
}

/// Whether any manager's scope covers the type (gc exemption for content
/// an undo stack may restore).
pub(crate) fn protects(registry: &UndoRegistry, store: &Store, key: &TypeKey) -> bool {
    if registry.managers.is_empty() {
        return false;
    }
    let mut chain = vec![key.clone()];
    chain.extend(store.ancestors(key));
    registry
        .managers
        .values()
        .any(|manager| chain.iter().any(|k| manager.scope.contains(k)))
}

fn in_scope(store: &Store, scope: &[TypeKey], key: &TypeKey) -> bool {
    if scope.contains(key) {
        return true;
    }
    store.ancestors(key).iter().any(|k| scope.contains(k))
}

fn content_preview(content: &Content) -> Value {
    match content {
        Content::Str(s) => Value::String(s.clone()),
        Content::Values(values) => Value::Array(values.clone()),
        Content::Embed(value) => value.clone(),
        _ => Value::Null,
    }
}

fn tracks(tracked: &HashSet<Origin>, origin: &Origin) -> bool {
    if tracked.is_empty() {
        matches!(origin, Origin::None)
    } else {
        tracked.contains(origin)
    }
}

fn build_stack_item(
    store: &Store,
    scope: &[TypeKey],
    delete_filter: Option<&DeleteFilterFn>,
    created: &[CreatedRecord],
    deleted: &[DeletedSpan],
) -> StackItem {
    let insertions = created
        .iter()
        .filter(|rec| in_scope(store, scope, &rec.key))
        .map(|rec| (rec.key.clone(), rec.range))
        .collect();
    let deletions = deleted
        .iter()
        .filter(|span| in_scope(store, scope, &span.parent))
        .filter(|span| match delete_filter {
            None => true,
            Some(filter) => match store.node(&span.parent) {
                Some(node) => filter(&DeletedItem {
                    parent: SharedRef::from_key_kind(span.parent.clone(), node.kind),
                    len: span.range.len,
                    content: content_preview(&span.content),
                }),
                None => true,
            },
        })
        .cloned()
        .collect();
    StackItem {
        insertions,
        deletions,
        meta: HashMap::new(),
    }
}

/// Called at the end of every committed transaction.
pub(crate) fn capture_transaction(
    doc: &mut Doc,
    origin: &Origin,
    created: &[CreatedRecord],
    deleted: &[DeletedSpan],
) {
    if doc.undo.managers.is_empty() || (created.is_empty() && deleted.is_empty()) {
        return;
    }
    let store = &doc.store;
    for (id, manager) in doc.undo.managers.iter_mut() {
        if matches!(origin, Origin::Undo(src) if src == id) {
            // This manager's own replay: the transaction's changes are
            // exactly the inverse to push onto the opposite stack.
            let (target_kind, push_redo) = match manager.state {
                ReplayState::Undoing => (StackKind::Redo, true),
                ReplayState::Redoing => (StackKind::Undo, false),
                ReplayState::Idle => continue,
            };
            let mut item = build_stack_item(
                store,
                &manager.scope,
                manager.options.delete_filter.as_ref(),
                created,
                deleted,
            );
            if item.is_empty() {
                continue;
            }
            for (_, callback) in manager.added_callbacks.iter_mut() {
                if catch_unwind(AssertUnwindSafe(|| callback(&mut item, target_kind, origin)))
                    .is_err()
                {
                    warn!("stack-item-added callback panicked");
                }
            }
            if push_redo {
                manager.redo_stack.push(item);
            } else {
                manager.undo_stack.push(item);
            }
            continue;
        }

        if !tracks(&manager.options.tracked_origins, origin) {
            continue;
        }
        let mut item = build_stack_item(
            store,
            &manager.scope,
            manager.options.delete_filter.as_ref(),
            created,
            deleted,
        );
        if item.is_empty() {
            continue;
        }
        // A fresh user action invalidates everything redoable.
        manager.redo_stack.clear();
        let now = Instant::now();
        let merge = !manager.capture_stopped
            && !manager.undo_stack.is_empty()
            && manager
                .last_capture
                .is_some_and(|t| now.duration_since(t) < manager.options.capture_timeout);
        manager.capture_stopped = false;
        manager.last_capture = Some(now);
        if let (true, Some(top)) = (merge, manager.undo_stack.last_mut()) {
            top.insertions.append(&mut item.insertions);
            top.deletions.append(&mut item.deletions);
            for (_, callback) in manager.added_callbacks.iter_mut() {
                if catch_unwind(AssertUnwindSafe(|| callback(top, StackKind::Undo, origin)))
                    .is_err()
                {
                    warn!("stack-item-added callback panicked");
                }
            }
        } else {
            for (_, callback) in manager.added_callbacks.iter_mut() {
                if catch_unwind(AssertUnwindSafe(|| {
                    callback(&mut item, StackKind::Undo, origin)
                }))
                .is_err()
                {
                    warn!("stack-item-added callback panicked");
                }
            }
            manager.undo_stack.push(item);
        }
    }
}

fn live_index_of(store: &Store, key: &TypeKey, id: crate::id::Id) -> Option<u64> {
    let node = store.node(key)?;
    let mut count = 0u64;
    for item in &node.seq {
        if item.contains(id) {
            return Some(count);
        }
        count += item.visible_len();
    }
    None
}

/// Replays the inverse of a captured stack item inside an open
/// transaction; returns how many operations actually applied.
fn apply_inverse(txn: &mut Transaction<'_>, item: &StackItem) -> Result<usize, DocError> {
    let mut applied = 0usize;

    // Inserted content is taken back by deletion.
    for (key, range) in &item.insertions {
        if txn.doc().store.node(key).is_none() {
            continue;
        }
        let (spans, _) = txn.doc.store.delete_id_range(*range);
        if !spans.is_empty() {
            applied += spans.len();
            txn.record_deleted(spans);
        }
    }

    // Deleted content is restored by re-inserting fresh items with the
    // original content, anchored at the tombstone position.
    for span in &item.deletions {
        match &span.parent_sub {
            Some(sub) => {
                let Some(node) = txn.doc().store.node(&span.parent) else {
                    continue;
                };
                // Restore only when the deleted entry would still be the
                // newest for its key; a newer live entry supersedes it.
                let superseded = node.winner(sub).is_some_and(|winner| {
                    cmp_clock_client(winner.id, span.range.start_id()).is_gt()
                });
                if superseded {
                    continue;
                }
                txn.map_set_content(&span.parent, sub, span.content.clone())?;
                applied += 1;
            }
            None => {
                let anchor = span.range.start_id();
                let Some((idx, _)) = txn.doc().store.find_seq_location(&span.parent, anchor)
                else {
                    continue;
                };
                let node = txn.doc().store.node(&span.parent).ok_or(DocError::DetachedType)?;
                if !node.seq[idx].deleted {
                    // Already restored by a concurrent undo.
                    continue;
                }
                let origin = if idx == 0 {
                    None
                } else {
                    Some(node.seq[idx - 1].last_id())
                };
                let id = txn.alloc_id();
                let wire = WireItem {
                    id,
                    origin,
                    right_origin: Some(anchor),
                    parent: txn.doc().store.wire_parent(&span.parent),
                    parent_sub: None,
                    content: span.content.clone(),
                };
                if txn.integrate_local(wire)? {
                    applied += 1;
                    if let Some(attrs) = &span.attributes {
                        if !attrs.is_empty() {
                            if let Some(index) = live_index_of(&txn.doc().store, &span.parent, id)
                            {
                                text_format(
                                    txn,
                                    &span.parent,
                                    index,
                                    span.content.len(),
                                    attrs.clone(),
                                )?;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(applied)
}

fn perform(doc: &mut Doc, handle: &UndoManagerRef, kind: StackKind) -> Result<bool, DocError> {
    loop {
        let item = {
            let manager = doc
                .undo
                .managers
                .get_mut(&handle.id)
                .ok_or(DocError::UnknownUndoManager)?;
            manager.state = match kind {
                StackKind::Undo => ReplayState::Undoing,
                StackKind::Redo => ReplayState::Redoing,
            };
            let stack = match kind {
                StackKind::Undo => &mut manager.undo_stack,
                StackKind::Redo => &mut manager.redo_stack,
            };
            match stack.pop() {
                Some(item) => item,
                None => {
                    manager.state = ReplayState::Idle;
                    return Ok(false);
                }
            }
        };

        let origin = Origin::Undo(handle.id);
        let result = doc.transact_with(origin.clone(), |txn| apply_inverse(txn, &item));
        let mut callbacks = match doc.undo.managers.get_mut(&handle.id) {
            Some(manager) => {
                manager.state = ReplayState::Idle;
                std::mem::take(&mut manager.popped_callbacks)
            }
            None => Vec::new(),
        };
        for (_, callback) in callbacks.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| callback(&item, kind, &origin))).is_err() {
                warn!("stack-item-popped callback panicked");
            }
        }
        if let Some(manager) = doc.undo.managers.get_mut(&handle.id) {
            manager.popped_callbacks = callbacks;
        }
        let applied = result?;
        if applied > 0 {
            return Ok(true);
        }
        // Every operation of this item was superseded by other clients;
        // fall through to the next stack entry.
    }
}

impl Doc {
    /// Registers an undo manager over a scope of shared types
    /// (descendants included).
    pub fn create_undo_manager(
        &mut self,
        scope: &[SharedRef],
        options: UndoOptions,
    ) -> UndoManagerRef {
        self.undo.next_id += 1;
        let id = self.undo.next_id;
        let state = ManagerState {
            scope: scope.iter().map(|shared| shared.key().clone()).collect(),
            options,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            last_capture: None,
            capture_stopped: false,
            state: ReplayState::Idle,
            added_callbacks: Vec::new(),
            popped_callbacks: Vec::new(),
        };
        self.undo.managers.insert(id, state);
        UndoManagerRef { id }
    }

    /// Undoes the most recent captured stack item. Returns whether any
    /// inverse operation applied.
    pub fn undo(&mut self, manager: &UndoManagerRef) -> Result<bool, DocError> {
        perform(self, manager, StackKind::Undo)
    }

    /// Reapplies the most recently undone stack item.
    pub fn redo(&mut self, manager: &UndoManagerRef) -> Result<bool, DocError> {
        perform(self, manager, StackKind::Redo)
    }

    pub fn can_undo(&self, manager: &UndoManagerRef) -> bool {
        self.undo
            .managers
            .get(&manager.id)
            .is_some_and(|m| !m.undo_stack.is_empty())
    }

    pub fn can_redo(&self, manager: &UndoManagerRef) -> bool {
        self.undo
            .managers
            .get(&manager.id)
            .is_some_and(|m| !m.redo_stack.is_empty())
    }

    /// Ensures the next capture starts a fresh stack item regardless of
    /// the capture timeout.
    pub fn stop_capturing(&mut self, manager: &UndoManagerRef) -> Result<(), DocError> {
        let state = self
            .undo
            .managers
            .get_mut(&manager.id)
            .ok_or(DocError::UnknownUndoManager)?;
        state.capture_stopped = true;
        Ok(())
    }

    /// Drops every captured operation from both stacks.
    pub fn undo_clear(&mut self, manager: &UndoManagerRef) -> Result<(), DocError> {
        let state = self
            .undo
            .managers
            .get_mut(&manager.id)
            .ok_or(DocError::UnknownUndoManager)?;
        state.undo_stack.clear();
        state.redo_stack.clear();
        state.last_capture = None;
        Ok(())
    }

    /// Fired when a stack item is pushed or merged; the callback may
    /// attach context to the item's meta map.
    pub fn on_stack_item_added<F>(
        &mut self,
        manager: &UndoManagerRef,
        callback: F,
    ) -> Result<SubscriptionId, DocError>
    where
        F: FnMut(&mut StackItem, StackKind, &Origin) + 'static,
    {
        let id = {
            self.observers.next_subscription += 1;
            self.observers.next_subscription
        };
        let state = self
            .undo
            .managers
            .get_mut(&manager.id)
            .ok_or(DocError::UnknownUndoManager)?;
        state.added_callbacks.push((id, Box::new(callback)));
        Ok(id)
    }

    /// Fired when a stack item is consumed by undo or redo.
    pub fn on_stack_item_popped<F>(
        &mut self,
        manager: &UndoManagerRef,
        callback: F,
    ) -> Result<SubscriptionId, DocError>
    where
        F: FnMut(&StackItem, StackKind, &Origin) + 'static,
    {
        let id = {
            self.observers.next_subscription += 1;
            self.observers.next_subscription
        };
        let state = self
            .undo
            .managers
            .get_mut(&manager.id)
            .ok_or(DocError::UnknownUndoManager)?;
        state.popped_callbacks.push((id, Box::new(callback)));
        Ok(id)
    }
}
