//! Core primitives for weave: a conflict-free replicated document engine.
//!
//! A [`Doc`] owns a set of named shared types (text, arrays, maps and
//! XML trees) backed by one item store. Concurrent edits on independent
//! replicas converge to an identical state once their binary update
//! payloads have been exchanged, regardless of delivery order.

pub mod doc;
pub mod event;
pub mod relative;
pub mod types;
pub mod undo;
pub mod update;

pub mod id;
pub(crate) mod store;
mod transaction;

pub use doc::{Doc, DocError, DocOptions, SubscriptionId};
pub use event::{
    ArrayEvent, Attrs, EntryAction, EntryChange, Event, ListDelta, MapEvent, PathStep, TextDelta,
    TextEvent, XmlEvent,
};
pub use id::{ClientId, Clock, Id};
pub use relative::{AbsolutePosition, PositionError, RelativePosition};
pub use store::TypeKind;
pub use transaction::{Origin, Transaction, TransactionInfo};
pub use types::{
    ArrayRef, In, MapRef, Out, PrelimArray, PrelimMap, PrelimText, PrelimXmlElement,
    PrelimXmlFragment, PrelimXmlText, SharedRef, TextRef, TreeWalker, XmlElementRef,
    XmlFragmentRef, XmlIn, XmlTextRef,
};
pub use undo::{DeletedItem, StackItem, StackKind, UndoManagerRef, UndoOptions};
pub use update::UpdateError;

use rand::Rng;

/// Minimum valid client id for weave logical clocks.
pub const MIN_CLIENT_ID: u64 = 65_536;

/// Returns `true` when the provided client id is valid.
pub fn is_valid_client_id(client: u64) -> bool {
    client >= MIN_CLIENT_ID
}

/// Generates a random client id for a new replica session.
pub fn generate_client_id() -> u64 {
    let mut rng = rand::thread_rng();
    rng.gen_range(MIN_CLIENT_ID..=i64::MAX as u64)
}

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
