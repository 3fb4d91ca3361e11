//! Canonical event handles and the bounded, indexed event collection.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace};

use crate::claims::{ClaimTable, Claimant};
use crate::error::StoreError;
use crate::event::{kind_is_addressable, kind_is_replaceable, replaceable_address, Event};
use crate::filter::Filter;

/// Canonical handle to an event held by a set.
///
/// The set interns events by id: inserting a structurally equal copy of a
/// stored event hands back the original, so two handles to "the same
/// event" always share one allocation and [`StoredEvent::same`] can
/// compare by identity. Derived values (storage address, indexable tag
/// set) are computed once per stored event, and an open annotation map
/// lets collaborators attach parsed or decrypted side-data without
/// touching the signed fields.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    inner: Arc<StoredInner>,
}

#[derive(Debug)]
struct StoredInner {
    event: Event,
    address: OnceLock<String>,
    indexable: OnceLock<HashSet<String>>,
    annotations: RwLock<HashMap<String, Value>>,
}

impl StoredEvent {
    fn new(event: Event) -> Self {
        StoredEvent {
            inner: Arc::new(StoredInner {
                event,
                address: OnceLock::new(),
                indexable: OnceLock::new(),
                annotations: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The wrapped protocol event.
    pub fn event(&self) -> &Event {
        &self.inner.event
    }

    /// Identity comparison: true iff both handles point at the same
    /// stored object, not merely structurally equal events.
    pub fn same(&self, other: &StoredEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Versioning address, computed once (see [`Event::address`]).
    pub fn address(&self) -> &str {
        self.inner
            .address
            .get_or_init(|| self.inner.event.address())
    }

    /// Cached `"<letter>:<value>"` tag set consulted by filter matching.
    pub fn indexable_tags(&self) -> &HashSet<String> {
        self.inner
            .indexable
            .get_or_init(|| self.inner.event.indexable_tags())
    }

    /// Read a side annotation previously attached under `key`.
    pub fn annotation(&self, key: &str) -> Option<Value> {
        self.inner.annotations.read().get(key).cloned()
    }

    /// Attach or overwrite a side annotation. Annotations never alter the
    /// signed payload; call `EventStore::update` afterwards if other
    /// subscribers should recompute.
    pub fn set_annotation(&self, key: impl Into<String>, value: Value) {
        self.inner.annotations.write().insert(key.into(), value);
    }

    /// Remove a side annotation, returning its previous value.
    pub fn clear_annotation(&self, key: &str) -> Option<Value> {
        self.inner.annotations.write().remove(key)
    }
}

impl Deref for StoredEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.inner.event
    }
}

/// Result of [`EventSet::insert`].
#[derive(Debug)]
pub enum InsertOutcome {
    /// The object failed the validity predicate; nothing was stored.
    Rejected,
    /// An event with this id was already present; the canonical handle is
    /// returned and no index changed.
    Duplicate(StoredEvent),
    /// The event was newly stored.
    Inserted {
        /// Canonical handle for the new event.
        stored: StoredEvent,
        /// Previous authoritative version at the same address, present
        /// when the new event superseded it as the newest.
        superseded: Option<StoredEvent>,
        /// Events dropped to stay within capacity, coldest first.
        evicted: Vec<StoredEvent>,
    },
}

/// Bounded, indexed, in-memory event collection.
///
/// This is the building block behind `EventStore` and is usable on its
/// own as a scratch collection. It keeps one canonical handle per event
/// id, secondary indices by kind, author, and single-letter tag, the full
/// version history per replaceable address, and an LRU recency order used
/// for eviction. Reads and claims count as recency touches; claimed
/// events are never eviction candidates, so a set whose residents are all
/// claimed grows past its capacity instead of evicting.
#[derive(Debug)]
pub struct EventSet {
    capacity: Option<usize>,
    events: HashMap<String, StoredEvent>,
    /// Recency order; the LRU end holds the coldest id.
    order: LruCache<String, ()>,
    /// Versions per replaceable address, newest first.
    by_address: HashMap<String, Vec<StoredEvent>>,
    by_kind: HashMap<u32, HashSet<String>>,
    by_author: HashMap<String, HashSet<String>>,
    /// `"letter:value"` -> ids carrying that tag.
    by_tag: HashMap<String, HashSet<String>>,
    claims: ClaimTable,
}

/// Newest first; equal timestamps break toward the lexicographically
/// smaller id so the authoritative version is deterministic.
fn version_order(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

impl EventSet {
    /// A set evicting its least-recently-used unclaimed event once more
    /// than `capacity` events are resident.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::unbounded()
        }
    }

    /// A set that never evicts.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            events: HashMap::new(),
            order: LruCache::unbounded(),
            by_address: HashMap::new(),
            by_kind: HashMap::new(),
            by_author: HashMap::new(),
            by_tag: HashMap::new(),
            claims: ClaimTable::new(),
        }
    }

    /// Number of resident events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Configured capacity, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Insert an event, deduplicating by id and resolving replaceable
    /// versions. Invalid events are rejected without error.
    pub fn insert(&mut self, event: Event) -> InsertOutcome {
        if !event.is_valid() {
            return InsertOutcome::Rejected;
        }
        if let Some(existing) = self.events.get(&event.id) {
            let existing = existing.clone();
            self.touch(&existing.id);
            return InsertOutcome::Duplicate(existing);
        }

        let stored = StoredEvent::new(event);
        let id = stored.id.clone();
        self.events.insert(id.clone(), stored.clone());
        self.order.put(id.clone(), ());
        self.by_kind.entry(stored.kind).or_default().insert(id.clone());
        self.by_author
            .entry(stored.pubkey.clone())
            .or_default()
            .insert(id.clone());
        for tag in stored.indexable_tags() {
            self.by_tag.entry(tag.clone()).or_default().insert(id.clone());
        }

        let superseded = if stored.is_replaceable() {
            self.insert_version(&stored)
        } else {
            None
        };

        let evicted = self.evict_over_capacity(&id);
        trace!(id = %stored.id, kind = stored.kind, "stored event");
        InsertOutcome::Inserted {
            stored,
            superseded,
            evicted,
        }
    }

    /// Add a replaceable event to its address history, returning the old
    /// authoritative version if the new event superseded it.
    fn insert_version(&mut self, stored: &StoredEvent) -> Option<StoredEvent> {
        let history = self
            .by_address
            .entry(stored.address().to_string())
            .or_default();
        let old_head = history.first().cloned();
        let at = history
            .binary_search_by(|v| version_order(v.event(), stored.event()))
            .unwrap_or_else(|i| i);
        history.insert(at, stored.clone());
        match old_head {
            Some(old) if history.first().map(|h| h.same(stored)).unwrap_or(false) => Some(old),
            _ => None,
        }
    }

    /// Remove an event by id. Removal always wins over claims: any claims
    /// on the event are cleared and holders must re-check existence.
    /// Returns the removed handle, `None` if the id was never stored.
    pub fn remove(&mut self, id: &str) -> Option<StoredEvent> {
        let stored = self.events.remove(id)?;
        self.unindex(&stored);
        self.claims.clear_claims(id);
        debug!(id = %stored.id, "removed event");
        Some(stored)
    }

    fn unindex(&mut self, stored: &StoredEvent) {
        self.order.pop(&stored.id);
        if let Some(set) = self.by_kind.get_mut(&stored.kind) {
            set.remove(&stored.id);
            if set.is_empty() {
                self.by_kind.remove(&stored.kind);
            }
        }
        if let Some(set) = self.by_author.get_mut(&stored.pubkey) {
            set.remove(&stored.id);
            if set.is_empty() {
                self.by_author.remove(&stored.pubkey);
            }
        }
        for tag in stored.indexable_tags() {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&stored.id);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if stored.is_replaceable() {
            if let Some(history) = self.by_address.get_mut(stored.address()) {
                history.retain(|v| !v.same(stored));
                if history.is_empty() {
                    self.by_address.remove(stored.address());
                }
            }
        }
    }

    /// Evict least-recently-used unclaimed events until within capacity.
    /// The event that triggered the eviction is never its own victim.
    fn evict_over_capacity(&mut self, protect: &str) -> Vec<StoredEvent> {
        let Some(capacity) = self.capacity else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while self.events.len() > capacity {
            // The recency iterator runs hottest first; the last unclaimed
            // entry is the coldest candidate.
            let victim = self
                .order
                .iter()
                .map(|(id, _)| id)
                .filter(|id| id.as_str() != protect && !self.claims.is_claimed(id))
                .last()
                .cloned();
            let Some(id) = victim else {
                // Everything else resident is claimed; grow past capacity.
                break;
            };
            if let Some(stored) = self.events.remove(&id) {
                self.unindex(&stored);
                debug!(id = %stored.id, "evicted event");
                evicted.push(stored);
            }
        }
        evicted
    }

    /// Promote an event to most recently used.
    pub fn touch(&mut self, id: &str) -> bool {
        if self.events.contains_key(id) {
            self.order.put(id.to_string(), ());
            true
        } else {
            false
        }
    }

    pub fn has_event(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    /// Fetch by id; counts as a recency touch.
    pub fn get_event(&mut self, id: &str) -> Option<StoredEvent> {
        let stored = self.events.get(id)?.clone();
        self.order.put(stored.id.clone(), ());
        Some(stored)
    }

    fn replaceable_key(
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<String, StoreError> {
        if kind_is_replaceable(kind) {
            Ok(replaceable_address(kind, pubkey, None))
        } else if kind_is_addressable(kind) {
            Ok(replaceable_address(kind, pubkey, identifier))
        } else {
            Err(StoreError::NotReplaceable(kind))
        }
    }

    /// Whether any version exists for `(kind, pubkey, identifier)`.
    /// Errors on kinds outside the replaceable/addressable ranges.
    pub fn has_replaceable(
        &self,
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<bool, StoreError> {
        let key = Self::replaceable_key(kind, pubkey, identifier)?;
        Ok(self.by_address.contains_key(&key))
    }

    /// The authoritative (newest) version for `(kind, pubkey, identifier)`;
    /// counts as a recency touch. Errors on non-replaceable kinds.
    pub fn get_replaceable(
        &mut self,
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<Option<StoredEvent>, StoreError> {
        let key = Self::replaceable_key(kind, pubkey, identifier)?;
        let head = self
            .by_address
            .get(&key)
            .and_then(|history| history.first())
            .cloned();
        if let Some(stored) = &head {
            self.order.put(stored.id.clone(), ());
        }
        Ok(head)
    }

    /// All retained versions for `(kind, pubkey, identifier)`, newest
    /// first. Errors on non-replaceable kinds.
    pub fn replaceable_history(
        &self,
        kind: u32,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let key = Self::replaceable_key(kind, pubkey, identifier)?;
        Ok(self.by_address.get(&key).cloned().unwrap_or_default())
    }

    /// Candidate ids for one filter, narrowed through the cheapest
    /// available index before full predicate evaluation.
    fn candidates(&self, filter: &Filter) -> Vec<String> {
        if let Some(ids) = &filter.ids {
            return ids
                .iter()
                .filter(|id| self.events.contains_key(*id))
                .cloned()
                .collect();
        }
        let mut sets: Vec<HashSet<String>> = Vec::new();
        if let Some(kinds) = &filter.kinds {
            let mut ids = HashSet::new();
            for kind in kinds {
                if let Some(set) = self.by_kind.get(kind) {
                    ids.extend(set.iter().cloned());
                }
            }
            sets.push(ids);
        }
        if let Some(authors) = &filter.authors {
            let mut ids = HashSet::new();
            for author in authors {
                if let Some(set) = self.by_author.get(author) {
                    ids.extend(set.iter().cloned());
                }
            }
            sets.push(ids);
        }
        for (name, values) in &filter.tags {
            let mut ids = HashSet::new();
            for value in values {
                if let Some(set) = self.by_tag.get(&format!("{}:{}", name, value)) {
                    ids.extend(set.iter().cloned());
                }
            }
            sets.push(ids);
        }
        if sets.is_empty() {
            // Unindexed filter (time window only): scan everything.
            return self.events.keys().cloned().collect();
        }
        let mut iter = sets.into_iter();
        let mut ids = iter.next().unwrap_or_default();
        for set in iter {
            ids.retain(|id| set.contains(id));
        }
        ids.into_iter().collect()
    }

    /// Events matching any of `filters` (OR semantics), deduplicated,
    /// in no particular order. Per-filter `limit`s are honored newest
    /// first before the union. Matches count as recency touches.
    pub fn get_by_filters(&mut self, filters: &[Filter]) -> Vec<StoredEvent> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut found = Vec::new();
        for filter in filters {
            let mut matches: Vec<StoredEvent> = self
                .candidates(filter)
                .into_iter()
                .filter_map(|id| self.events.get(&id).cloned())
                .filter(|stored| filter.matches_with_tags(stored.event(), stored.indexable_tags()))
                .collect();
            matches.sort_by(|a, b| version_order(a.event(), b.event()));
            if let Some(limit) = filter.limit {
                matches.truncate(limit);
            }
            for stored in matches {
                if seen.insert(stored.id.clone()) {
                    found.push(stored);
                }
            }
        }
        for stored in &found {
            self.order.put(stored.id.clone(), ());
        }
        found
    }

    /// Matching events as a timeline: newest first, capped by the merged
    /// filter limit when every filter carries one.
    pub fn get_timeline(&mut self, filters: &[Filter]) -> Vec<StoredEvent> {
        let mut timeline = self.get_by_filters(filters);
        timeline.sort_by(|a, b| version_order(a.event(), b.event()));
        if let Some(limit) = Filter::merge(filters).limit {
            timeline.truncate(limit);
        }
        timeline
    }

    /// Pin an event against eviction; also a recency touch.
    pub fn claim(&mut self, id: &str, claimant: Claimant) -> bool {
        if !self.events.contains_key(id) {
            return false;
        }
        self.order.put(id.to_string(), ());
        self.claims.claim(id, claimant)
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.claims.is_claimed(id)
    }

    pub fn remove_claim(&mut self, id: &str, claimant: Claimant) -> bool {
        self.claims.remove_claim(id, claimant)
    }

    pub fn clear_claims(&mut self, id: &str) -> bool {
        self.claims.clear_claims(id)
    }
}

impl Default for EventSet {
    fn default() -> Self {
        Self::unbounded()
    }
}
