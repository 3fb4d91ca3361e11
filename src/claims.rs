//! Advisory claims that pin events against eviction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Token identifying one claim holder, e.g. a live subscription or an
/// async computation that must not lose its events mid-flight.
///
/// Tokens are cheap `Copy` values minted from a process-wide counter, so
/// distinct holders can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claimant(u64);

impl Claimant {
    /// Mint a fresh, process-unique claimant token.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Claimant(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Multimap from event id to the set of claimants currently pinning it.
///
/// Claims are advisory within a single process: they make an event
/// ineligible for LRU eviction while at least one claimant holds it, and
/// nothing more. An explicit remove still deletes a claimed event; claim
/// holders are expected to re-check existence.
#[derive(Debug, Default)]
pub struct ClaimTable {
    claims: HashMap<String, HashSet<Claimant>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim. Returns false if this claimant already held one on
    /// the same event.
    pub fn claim(&mut self, id: &str, claimant: Claimant) -> bool {
        self.claims.entry(id.to_string()).or_default().insert(claimant)
    }

    /// An event is claimed while its claimant set is non-empty.
    pub fn is_claimed(&self, id: &str) -> bool {
        self.claims.get(id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Release one claimant's claim. Returns false if no such claim existed.
    pub fn remove_claim(&mut self, id: &str, claimant: Claimant) -> bool {
        let Some(set) = self.claims.get_mut(id) else {
            return false;
        };
        let removed = set.remove(&claimant);
        if set.is_empty() {
            self.claims.remove(id);
        }
        removed
    }

    /// Drop every claim on an event, e.g. when it is removed outright.
    pub fn clear_claims(&mut self, id: &str) -> bool {
        self.claims.remove(id).is_some()
    }
}
