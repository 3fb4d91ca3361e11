//! In-memory Nostr event store with live queries.
//!
//! Events arrive from untrusted sources (relays, local caches) through
//! [`EventStore::add`] and are deduplicated, indexed, and versioned:
//! only the newest event per replaceable or addressable address is
//! authoritative, while older versions stay available as history. Every
//! mutation fans out as a [`StoreNotice`], which powers the live
//! [`EventStore::filters`]/[`EventStore::updated`]/[`EventStore::removed`]
//! streams and the shared [`Model`] layer. A bounded store evicts its
//! least-recently-used events, except those pinned by claims.
//!
//! ```
//! use monstr::{Event, EventStore, Filter, Tag};
//!
//! let store = EventStore::unbounded();
//! let event = Event {
//!     id: "a".repeat(64),
//!     pubkey: "b".repeat(64),
//!     kind: 1,
//!     created_at: 1_700_000_000,
//!     tags: vec![Tag(vec!["t".into(), "news".into()])],
//!     content: "hello".into(),
//!     sig: String::new(),
//! };
//! let stored = store.add(event).expect("valid event");
//! let found = store.get_timeline(&[Filter::new().tag("t", ["news"])]);
//! assert!(found[0].same(&stored));
//! ```
//!
//! Signature verification, relay transport, and event construction are
//! deliberately out of scope; the store trusts its callers to have
//! validated signatures and only checks structural validity.

pub mod claims;
pub mod error;
pub mod event;
pub mod filter;
pub mod model;
pub mod set;
pub mod store;
pub mod timeline;

pub use claims::{ClaimTable, Claimant};
pub use error::StoreError;
pub use event::{
    kind_is_addressable, kind_is_ephemeral, kind_is_replaceable, replaceable_address, Event, Tag,
};
pub use filter::Filter;
pub use model::{Model, ModelStream};
pub use set::{EventSet, InsertOutcome, StoredEvent};
pub use store::{ClaimGuard, EventStore, StoreNotice};
pub use timeline::TimelineModel;
