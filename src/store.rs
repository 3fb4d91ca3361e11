//! Shared event store with broadcast change notifications.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::claims::Claimant;
use crate::error::StoreError;
use crate::event::Event;
use crate::filter::Filter;
use crate::model;
use crate::set::{EventSet, InsertOutcome, StoredEvent};

/// Notices are buffered per subscriber; a consumer that falls further
/// behind than this observes a lag error, never reordered notices.
const NOTICE_BUFFER: usize = 1024;

/// One change to the store's contents, delivered to every subscriber in
/// mutation order over a single broadcast channel.
#[derive(Debug, Clone)]
pub enum StoreNotice {
    /// A new event entered the store.
    Inserted(StoredEvent),
    /// A stored event changed: a newer replaceable version took over its
    /// address, or a collaborator rewrote an annotation and asked for a
    /// re-broadcast.
    Updated(StoredEvent),
    /// An event left the store, by explicit remove or by eviction.
    Removed(StoredEvent),
}

impl StoreNotice {
    /// The event this notice is about.
    pub fn event(&self) -> &StoredEvent {
        match self {
            StoreNotice::Inserted(ev) | StoreNotice::Updated(ev) | StoreNotice::Removed(ev) => ev,
        }
    }
}

/// In-memory event store shared across tasks.
///
/// Wraps one [`EventSet`] behind a lock and fans every mutation out as a
/// [`StoreNotice`]. Mutations are synchronous critical sections; the
/// notice is queued before the mutating call returns and subscribers see
/// it on their next poll, never inline, so notification handlers can
/// safely mutate the store again.
#[derive(Debug)]
pub struct EventStore {
    inner: Mutex<EventSet>,
    notices: broadcast::Sender<StoreNotice>,
    pub(crate) models: model::Registry,
}

impl EventStore {
    /// Store evicting past `capacity` resident events.
    pub fn new(capacity: usize) -> Self {
        Self::with_set(EventSet::new(capacity))
    }

    /// Store that never evicts.
    pub fn unbounded() -> Self {
        Self::with_set(EventSet::unbounded())
    }

    fn with_set(set: EventSet) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        EventStore {
            inner: Mutex::new(set),
            notices,
            models: model::Registry::new(),
        }
    }

    /// Feed one event into the store.
    ///
    /// Returns the canonical stored handle, or `None` for events failing
    /// the validity predicate. Re-adding a stored event returns the
    /// existing handle and emits nothing. A replaceable version that
    /// supersedes the current head is announced as `Updated` against its
    /// address for subscriber continuity; any other new event is
    /// announced as `Inserted`. Evicted events are announced as
    /// `Removed`. Never fails.
    pub fn add(&self, event: Event) -> Option<StoredEvent> {
        // Notices are queued while the lock is held so their order always
        // equals mutation order; delivery still happens at the
        // subscribers' next poll, never inline.
        let mut set = self.inner.lock();
        match set.insert(event) {
            InsertOutcome::Rejected => {
                warn!("dropping malformed event at store boundary");
                None
            }
            InsertOutcome::Duplicate(stored) => Some(stored),
            InsertOutcome::Inserted {
                stored,
                superseded,
                evicted,
            } => {
                let notice = if superseded.is_some() {
                    StoreNotice::Updated(stored.clone())
                } else {
                    StoreNotice::Inserted(stored.clone())
                };
                let _ = self.notices.send(notice);
                for ev in evicted {
                    let _ = self.notices.send(StoreNotice::Removed(ev));
                }
                Some(stored)
            }
        }
    }

    /// Remove an event by id, emitting `Removed`. Claims never block an
    /// explicit remove; holders re-check existence. False if absent.
    pub fn remove(&self, id: &str) -> bool {
        let mut set = self.inner.lock();
        match set.remove(id) {
            Some(stored) => {
                let _ = self.notices.send(StoreNotice::Removed(stored));
                true
            }
            None => false,
        }
    }

    /// Re-announce a stored event, e.g. after a collaborator attached an
    /// annotation. Touches recency, changes no index, and emits exactly
    /// one `Updated`. False if the event is no longer stored.
    pub fn update(&self, event: &StoredEvent) -> bool {
        let mut set = self.inner.lock();
        if !set.touch(&event.id) {
            return false;
        }
        let _ = self.notices.send(StoreNotice::Updated(event.clone()));
        true
    }

    pub fn has_event(&self, id: &str) -> bool {
        self.inner.lock().has_event(id)
    }

    pub fn get_event(&self, id: &str) -> Option<StoredEvent> {
        self.inner.lock().get_event(id)
    }

    pub fn has_replaceable(
        &self,
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.lock().has_replaceable(kind, pubkey, identifier)
    }

    /// Authoritative version for `(kind, pubkey, identifier)`; errors on
    /// kinds outside the replaceable/addressable ranges.
    pub fn get_replaceable(
        &self,
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<Option<StoredEvent>, StoreError> {
        self.inner.lock().get_replaceable(kind, pubkey, identifier)
    }

    /// All retained versions, newest first.
    pub fn replaceable_history(
        &self,
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner
            .lock()
            .replaceable_history(kind, pubkey, identifier)
    }

    /// Events currently matching any of `filters`, unordered.
    pub fn get_by_filters(&self, filters: &[Filter]) -> Vec<StoredEvent> {
        self.inner.lock().get_by_filters(filters)
    }

    /// Events currently matching any of `filters`, newest first.
    pub fn get_timeline(&self, filters: &[Filter]) -> Vec<StoredEvent> {
        self.inner.lock().get_timeline(filters)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Raw notice channel, one total order for all mutations.
    pub fn notices(&self) -> broadcast::Receiver<StoreNotice> {
        self.notices.subscribe()
    }

    /// Pin an event against eviction. False if it is not stored.
    pub fn claim(&self, event: &StoredEvent, claimant: Claimant) -> bool {
        self.inner.lock().claim(&event.id, claimant)
    }

    pub fn is_claimed(&self, event: &StoredEvent) -> bool {
        self.inner.lock().is_claimed(&event.id)
    }

    pub fn remove_claim(&self, event: &StoredEvent, claimant: Claimant) -> bool {
        self.inner.lock().remove_claim(&event.id, claimant)
    }

    pub fn clear_claims(&self, event: &StoredEvent) -> bool {
        self.inner.lock().clear_claims(&event.id)
    }

    pub(crate) fn remove_claim_by_id(&self, id: &str, claimant: Claimant) -> bool {
        self.inner.lock().remove_claim(id, claimant)
    }

    /// Claim `event` for the lifetime of the returned guard; the claim is
    /// released on drop, so async computations cannot leak pins.
    pub fn claim_guard(self: &Arc<Self>, event: &StoredEvent) -> ClaimGuard {
        let claimant = Claimant::unique();
        self.inner.lock().claim(&event.id, claimant);
        ClaimGuard {
            store: self.clone(),
            id: event.id.clone(),
            claimant,
        }
    }

    /// Live query: yields every currently matching event (newest first),
    /// then every later-arriving match, each event at most once. The
    /// notice subscription is opened before the snapshot so no insert can
    /// fall between the two.
    pub fn filters(
        self: &Arc<Self>,
        filters: Vec<Filter>,
    ) -> impl Stream<Item = StoredEvent> + Send + 'static {
        let store = self.clone();
        // Subscribe now, not at first poll, so nothing added after this
        // call can be missed; the snapshot dedups against the live tail.
        let mut rx = self.notices();
        stream! {
            let mut seen: HashSet<String> = HashSet::new();
            for stored in store.get_timeline(&filters) {
                seen.insert(stored.id.clone());
                yield stored;
            }
            loop {
                match rx.recv().await {
                    Ok(StoreNotice::Inserted(stored)) | Ok(StoreNotice::Updated(stored)) => {
                        if Filter::matches_any(&filters, stored.event())
                            && seen.insert(stored.id.clone())
                        {
                            yield stored;
                        }
                    }
                    Ok(StoreNotice::Removed(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Stream that fires each time the event with `id` is re-announced
    /// via [`EventStore::update`] or superseded by a newer replaceable
    /// version at the same address.
    ///
    /// Matching is by versioning address, so a subscriber holding a
    /// replaceable event keeps seeing the living version as replacements
    /// arrive instead of going silent when its exact id is superseded.
    pub fn updated(
        self: &Arc<Self>,
        id: impl Into<String>,
    ) -> impl Stream<Item = StoredEvent> + Send + 'static {
        let id = id.into();
        let address = self
            .get_event(&id)
            .map(|ev| ev.address().to_string())
            .unwrap_or_else(|| id.clone());
        let mut rx = self.notices();
        stream! {
            loop {
                match rx.recv().await {
                    Ok(StoreNotice::Updated(stored))
                        if stored.id == id || stored.address() == address =>
                    {
                        yield stored;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Stream that fires once when the event with `id` is removed or
    /// evicted, then ends.
    pub fn removed(
        self: &Arc<Self>,
        id: impl Into<String>,
    ) -> impl Stream<Item = StoredEvent> + Send + 'static {
        let id = id.into();
        let mut rx = self.notices();
        stream! {
            loop {
                match rx.recv().await {
                    Ok(StoreNotice::Removed(stored)) if stored.id == id => {
                        yield stored;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// RAII claim: pins one event until dropped.
#[derive(Debug)]
pub struct ClaimGuard {
    store: Arc<EventStore>,
    id: String,
    claimant: Claimant,
}

impl ClaimGuard {
    /// Id of the claimed event.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.store.remove_claim_by_id(&self.id, self.claimant);
    }
}
