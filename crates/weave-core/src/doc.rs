//! The shared document: client identity, root type registry, transaction
//! entry points and lifecycle hooks.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

use crate::event::Event;
use crate::id::ClientId;
use crate::store::{Store, TypeKind};
use crate::transaction::{Origin, Transaction, TransactionInfo};
use crate::types::{ArrayRef, MapRef, SharedRef, TextRef, XmlFragmentRef};
use crate::undo::UndoRegistry;
use crate::update::{decode_update, encode_update, Update, UpdateError};
use crate::{generate_client_id, is_valid_client_id};

/// Handle returned by every observer registration; pass to
/// [`Doc::unobserve`] to remove the callback.
pub type SubscriptionId = u64;

#[derive(Debug, Error)]
pub enum DocError {
    /// A remote update was structurally unresolvable and has been
    /// rejected atomically; the document is unchanged.
    #[error("corrupt update rejected: {0}")]
    CorruptUpdate(String),
    #[error(transparent)]
    Codec(#[from] UpdateError),
    /// Mutation attempted through a handle whose type is no longer part
    /// of a live document.
    #[error("type is not attached to a live document")]
    DetachedType,
    #[error("root type '{name}' already instantiated as {existing:?}")]
    RootKindMismatch { name: String, existing: TypeKind },
    #[error("unknown undo manager handle")]
    UnknownUndoManager,
}

/// Construction options for [`Doc`].
#[derive(Debug, Clone)]
pub struct DocOptions {
    /// Explicit client id; a random valid id is generated when absent.
    pub client_id: Option<ClientId>,
    /// Whether tombstone payloads are garbage collected.
    pub gc: bool,
}

impl Default for DocOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            gc: true,
        }
    }
}

type TypeCallback = Box<dyn FnMut(&Event, &TransactionInfo)>;
type DeepCallback = Box<dyn FnMut(&[Event], &TransactionInfo)>;
type UpdateCallback = Box<dyn FnMut(&[u8], &Origin)>;
type TxnHook = Box<dyn FnMut(&TransactionInfo)>;

#[derive(Default)]
pub(crate) struct Observers {
    pub(crate) next_subscription: SubscriptionId,
    pub(crate) type_observers: HashMap<crate::store::TypeKey, Vec<(SubscriptionId, TypeCallback)>>,
    pub(crate) deep_observers: HashMap<crate::store::TypeKey, Vec<(SubscriptionId, DeepCallback)>>,
    pub(crate) update_hooks: Vec<(SubscriptionId, UpdateCallback)>,
    pub(crate) before_txn: Vec<(SubscriptionId, TxnHook)>,
    pub(crate) after_txn: Vec<(SubscriptionId, TxnHook)>,
}

impl Observers {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_subscription += 1;
        self.next_subscription
    }
}

/// A collaborative shared document.
///
/// Owns the item store, the per-client logical clock state and every
/// attached shared type. All mutation happens through transactions; all
/// local mutations and remote update integrations must be serialized by
/// the caller (the document provides no internal locking).
pub struct Doc {
    client: ClientId,
    pub(crate) store: Store,
    pub(crate) observers: Observers,
    pub(crate) undo: UndoRegistry,
    pub(crate) destroyed: bool,
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl Doc {
    pub fn new() -> Self {
        Self::with_options(DocOptions::default())
    }

    pub fn with_options(options: DocOptions) -> Self {
        let client = match options.client_id {
            Some(id) if is_valid_client_id(id) => id,
            _ => generate_client_id(),
        };
        Self {
            client,
            store: Store::new(options.gc),
            observers: Observers::default(),
            undo: UndoRegistry::default(),
            destroyed: false,
        }
    }

    /// The unique id identifying this replica session.
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn gc(&self) -> bool {
        self.store.gc
    }

    pub fn set_gc(&mut self, gc: bool) {
        self.store.gc = gc;
    }

    /// Releases every shared type, observer and undo manager. Handles
    /// into this document subsequently fail with a detached-type error.
    pub fn destroy(&mut self) {
        let gc = self.store.gc;
        self.store = Store::new(gc);
        self.observers = Observers::default();
        self.undo = UndoRegistry::default();
        self.destroyed = true;
    }

    fn root(&mut self, name: &str, kind: TypeKind) -> Result<crate::store::TypeKey, DocError> {
        if self.destroyed {
            return Err(DocError::DetachedType);
        }
        self.store
            .get_or_create_root(name, kind)
            .map_err(|existing| DocError::RootKindMismatch {
                name: name.to_string(),
                existing,
            })
    }

    /// Defines (or fetches) a named root shared text.
    pub fn get_text(&mut self, name: &str) -> Result<TextRef, DocError> {
        Ok(TextRef {
            key: self.root(name, TypeKind::Text)?,
        })
    }

    /// Defines (or fetches) a named root shared array.
    pub fn get_array(&mut self, name: &str) -> Result<ArrayRef, DocError> {
        Ok(ArrayRef {
            key: self.root(name, TypeKind::Array)?,
        })
    }

    /// Defines (or fetches) a named root shared map.
    pub fn get_map(&mut self, name: &str) -> Result<MapRef, DocError> {
        Ok(MapRef {
            key: self.root(name, TypeKind::Map)?,
        })
    }

    /// Defines (or fetches) a named root XML fragment.
    pub fn get_xml_fragment(&mut self, name: &str) -> Result<XmlFragmentRef, DocError> {
        Ok(XmlFragmentRef {
            key: self.root(name, TypeKind::XmlFragment)?,
        })
    }

    /// Runs `f` inside one transaction with the default origin.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        self.transact_with(Origin::None, f)
    }

    /// Runs `f` inside one transaction. Every mutation issued through the
    /// transaction is observed atomically: per-type and deep observers
    /// fire exactly once after the closure returns.
    pub fn transact_with<R>(
        &mut self,
        origin: Origin,
        f: impl FnOnce(&mut Transaction) -> R,
    ) -> R {
        let info = TransactionInfo {
            origin: origin.clone(),
            local: true,
        };
        self.fire_before_transaction(&info);
        let mut txn = Transaction::begin(self, origin, true);
        let result = f(&mut txn);
        txn.commit();
        result
    }

    /// Integrates a binary update produced by another replica (or an
    /// earlier session). The update is applied in full or not at all:
    /// a structurally corrupt payload leaves the document unchanged.
    ///
    /// `origin` is handed to observers so local echo can be suppressed.
    pub fn apply_update(&mut self, data: &[u8], origin: Origin) -> Result<(), DocError> {
        if self.destroyed {
            return Err(DocError::DetachedType);
        }
        let update = decode_update(data)?;
        let snapshot = self.store.clone();
        let info = TransactionInfo {
            origin: origin.clone(),
            local: false,
        };
        self.fire_before_transaction(&info);
        let mut txn = Transaction::begin(self, origin, false);
        match txn.integrate_update(update) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(err) => {
                drop(txn);
                self.store = snapshot;
                Err(err)
            }
        }
    }

    /// Serializes the entire current state (including tombstone ranges)
    /// as one update payload, suitable for bootstrapping a new replica.
    pub fn encode_state_as_update(&self) -> Result<Vec<u8>, DocError> {
        let update = Update {
            items: self.store.all_wire_items(),
            deletes: self.store.all_tombstones(),
        };
        Ok(encode_update(&update)?)
    }

    /// Registers a shallow observer on one shared type.
    pub fn observe<T, F>(&mut self, target: T, callback: F) -> SubscriptionId
    where
        T: Into<SharedRef>,
        F: FnMut(&Event, &TransactionInfo) + 'static,
    {
        let key = target.into().key().clone();
        let id = self.observers.next_id();
        self.observers
            .type_observers
            .entry(key)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Registers a deep observer: invoked with the ordered list of every
    /// event fired on the target or any of its descendants.
    pub fn observe_deep<T, F>(&mut self, target: T, callback: F) -> SubscriptionId
    where
        T: Into<SharedRef>,
        F: FnMut(&[Event], &TransactionInfo) + 'static,
    {
        let key = target.into().key().clone();
        let id = self.observers.next_id();
        self.observers
            .deep_observers
            .entry(key)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Registers an update hook: fired after observer dispatch whenever a
    /// transaction produced new items or deletions to propagate.
    pub fn on_update<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&[u8], &Origin) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.update_hooks.push((id, Box::new(callback)));
        id
    }

    pub fn on_before_transaction<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&TransactionInfo) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.before_txn.push((id, Box::new(callback)));
        id
    }

    pub fn on_after_transaction<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&TransactionInfo) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.after_txn.push((id, Box::new(callback)));
        id
    }

    /// Removes a previously registered callback. Returns `false` when the
    /// subscription is unknown.
    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        let obs = &mut self.observers;
        for list in obs.type_observers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        for list in obs.deep_observers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        if let Some(pos) = obs.update_hooks.iter().position(|(sid, _)| *sid == id) {
            obs.update_hooks.remove(pos);
            return true;
        }
        if let Some(pos) = obs.before_txn.iter().position(|(sid, _)| *sid == id) {
            obs.before_txn.remove(pos);
            return true;
        }
        if let Some(pos) = obs.after_txn.iter().position(|(sid, _)| *sid == id) {
            obs.after_txn.remove(pos);
            return true;
        }
        self.undo.remove_subscription(id)
    }

    pub(crate) fn fire_before_transaction(&mut self, info: &TransactionInfo) {
        let mut hooks = std::mem::take(&mut self.observers.before_txn);
        for (_, hook) in hooks.iter_mut() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(info))).is_err() {
                warn!("before-transaction hook panicked; continuing");
            }
        }
        let mut current = std::mem::take(&mut self.observers.before_txn);
        hooks.append(&mut current);
        self.observers.before_txn = hooks;
    }

    pub(crate) fn fire_after_transaction(&mut self, info: &TransactionInfo) {
        let mut hooks = std::mem::take(&mut self.observers.after_txn);
        for (_, hook) in hooks.iter_mut() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(info))).is_err() {
                warn!("after-transaction hook panicked; continuing");
            }
        }
        let mut current = std::mem::take(&mut self.observers.after_txn);
        hooks.append(&mut current);
        self.observers.after_txn = hooks;
    }

    pub(crate) fn fire_update(&mut self, payload: &[u8], origin: &Origin) {
        let mut hooks = std::mem::take(&mut self.observers.update_hooks);
        for (_, hook) in hooks.iter_mut() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(payload, origin)))
                .is_err()
            {
                warn!("update hook panicked; continuing");
            }
        }
        let mut current = std::mem::take(&mut self.observers.update_hooks);
        hooks.append(&mut current);
        self.observers.update_hooks = hooks;
    }
}
