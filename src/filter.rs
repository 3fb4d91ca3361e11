//! Filter predicate engine for selecting events.

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Map, Value};

use crate::event::Event;

/// A single Nostr filter: `ids`/`kinds`/`authors`/`#x` tag values plus a
/// `since`/`until` time window. A present field constrains matches; an
/// absent field matches everything. An array of filters combines with OR
/// semantics via [`Filter::matches_any`].
///
/// `limit` never affects matching; it caps how many events a query
/// returns, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Exact event IDs to match.
    pub ids: Option<Vec<String>>,
    /// Kind numbers to match.
    pub kinds: Option<Vec<u32>>,
    /// Author public keys to match.
    pub authors: Option<Vec<String>>,
    /// Tag-value constraints keyed by tag name, from `#<name>` filter keys.
    /// Only single-letter names can ever match, since only those are
    /// indexed on events.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Minimum `created_at`, inclusive.
    pub since: Option<u64>,
    /// Maximum `created_at`, inclusive.
    pub until: Option<u64>,
    /// Maximum number of events a query should return.
    pub limit: Option<usize>,
}

impl Filter {
    /// Filter that matches every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain to the given event IDs.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Constrain to the given kinds.
    pub fn kinds<I: IntoIterator<Item = u32>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Constrain to the given authors.
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Require at least one of `values` under the `#<name>` tag key.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Require `created_at >= since`.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Require `created_at <= until`.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Cap query results at `limit` events.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate this filter against one event.
    pub fn matches(&self, event: &Event) -> bool {
        self.matches_with_tags(event, &event.indexable_tags())
    }

    /// Evaluate against an event whose indexable tag set has already been
    /// computed, so a query over many filters pays the tag scan once.
    pub fn matches_with_tags(&self, event: &Event, indexable: &HashSet<String>) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = values
                .iter()
                .any(|v| indexable.contains(&format!("{}:{}", name, v)));
            if !hit {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }

    /// OR across a filter array: true iff any filter matches.
    pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
        let indexable = event.indexable_tags();
        filters.iter().any(|f| f.matches_with_tags(event, &indexable))
    }

    /// Merge filters into one wide enough to cover every input, used to
    /// collapse overlapping subscriptions into a single request.
    ///
    /// Array fields are unioned. Bounds keep the loosest value: `since` is
    /// the minimum, `until` the maximum, `limit` the maximum, and any
    /// input without a bound leaves the merged filter unbounded there, so
    /// the merge never excludes an event one of the inputs would accept.
    pub fn merge<'a, I: IntoIterator<Item = &'a Filter>>(filters: I) -> Filter {
        let mut merged = Filter::default();
        let mut first = true;
        for f in filters {
            merged.ids = union_opt(merged.ids.take(), &f.ids, first);
            merged.kinds = union_opt(merged.kinds.take(), &f.kinds, first);
            merged.authors = union_opt(merged.authors.take(), &f.authors, first);
            for (name, values) in &f.tags {
                let slot = merged.tags.entry(name.clone()).or_default();
                for v in values {
                    if !slot.contains(v) {
                        slot.push(v.clone());
                    }
                }
            }
            merged.since = bound_opt(merged.since, f.since, first, std::cmp::min);
            merged.until = bound_opt(merged.until, f.until, first, std::cmp::max);
            merged.limit = bound_opt(merged.limit, f.limit, first, std::cmp::max);
            first = false;
        }
        merged
    }

    /// Build a `Filter` from a NIP-01 filter JSON object. Unknown keys and
    /// malformed entries are skipped, matching how relays treat filters.
    pub fn from_value(val: &Value) -> Self {
        let ids = string_array(val.get("ids"));
        let authors = string_array(val.get("authors"));
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if let Some(name) = key.strip_prefix('#') {
                    if let Some(values) = string_array(Some(v)) {
                        tags.insert(name.to_string(), values);
                    }
                }
            }
        }
        let since = val.get("since").and_then(|v| v.as_u64());
        let until = val.get("until").and_then(|v| v.as_u64());
        let limit = val
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        Filter {
            ids,
            kinds,
            authors,
            tags,
            since,
            until,
            limit,
        }
    }

    /// Serialize back to the NIP-01 filter object shape.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), json!(ids));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), json!(kinds));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), json!(authors));
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{}", name), json!(values));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), json!(since));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), json!(until));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), json!(limit));
        }
        Value::Object(obj)
    }
}

/// Union two optional lists; `None` on either side of a non-first merge
/// means "unconstrained" and wins.
fn union_opt<T: Clone + PartialEq>(
    acc: Option<Vec<T>>,
    next: &Option<Vec<T>>,
    first: bool,
) -> Option<Vec<T>> {
    if first {
        return next.clone();
    }
    match (acc, next) {
        (Some(mut acc), Some(next)) => {
            for v in next {
                if !acc.contains(v) {
                    acc.push(v.clone());
                }
            }
            Some(acc)
        }
        _ => None,
    }
}

/// Combine two optional bounds with `pick`; an absent bound stays absent.
fn bound_opt<T>(acc: Option<T>, next: Option<T>, first: bool, pick: fn(T, T) -> T) -> Option<T> {
    if first {
        return next;
    }
    match (acc, next) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        _ => None,
    }
}

fn string_array(val: Option<&Value>) -> Option<Vec<String>> {
    val.and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn event(kind: u32, created_at: u64, tags: Vec<Tag>) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            kind,
            created_at,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::new().matches(&event(1, 10, vec![])));
    }

    #[test]
    fn ids_kinds_authors() {
        let ev = event(1, 10, vec![]);
        assert!(Filter::new().ids([ev.id.clone()]).matches(&ev));
        assert!(!Filter::new().ids(["c".repeat(64)]).matches(&ev));
        assert!(Filter::new().kinds([1, 7]).matches(&ev));
        assert!(!Filter::new().kinds([0]).matches(&ev));
        assert!(Filter::new().authors([ev.pubkey.clone()]).matches(&ev));
        assert!(!Filter::new().authors(["c".repeat(64)]).matches(&ev));
    }

    #[test]
    fn tag_filter_round_trip() {
        let ev = event(1, 10, vec![Tag(vec!["t".into(), "nostr".into()])]);
        assert!(Filter::new().tag("t", ["nostr"]).matches(&ev));
        assert!(!Filter::new().tag("t", ["other"]).matches(&ev));
        // Any one requested value suffices.
        assert!(Filter::new().tag("t", ["other", "nostr"]).matches(&ev));
    }

    #[test]
    fn multi_letter_tag_names_never_match() {
        let ev = event(1, 10, vec![Tag(vec!["xy".into(), "v".into()])]);
        assert!(!Filter::new().tag("xy", ["v"]).matches(&ev));
    }

    #[test]
    fn since_until_window() {
        let ev = event(1, 10, vec![]);
        assert!(Filter::new().since(10).matches(&ev));
        assert!(!Filter::new().since(11).matches(&ev));
        assert!(Filter::new().until(10).matches(&ev));
        assert!(!Filter::new().until(9).matches(&ev));
    }

    #[test]
    fn filter_array_is_or() {
        let filters = [Filter::new().kinds([1]), Filter::new().kinds([7])];
        assert!(Filter::matches_any(&filters, &event(1, 10, vec![])));
        assert!(Filter::matches_any(&filters, &event(7, 10, vec![])));
        assert!(!Filter::matches_any(&filters, &event(2, 10, vec![])));
    }

    #[test]
    fn merge_unions_and_widens() {
        let a = Filter::new()
            .kinds([1])
            .authors(["p1"])
            .tag("t", ["x"])
            .since(10)
            .until(20)
            .limit(5);
        let b = Filter::new()
            .kinds([7])
            .authors(["p2"])
            .tag("t", ["y"])
            .since(5)
            .until(30)
            .limit(10);
        let merged = Filter::merge([&a, &b]);
        assert_eq!(merged.kinds.as_ref().unwrap(), &vec![1, 7]);
        assert_eq!(
            merged.authors.as_ref().unwrap(),
            &vec!["p1".to_string(), "p2".to_string()]
        );
        assert_eq!(merged.tags["t"], vec!["x".to_string(), "y".to_string()]);
        assert_eq!(merged.since, Some(5));
        assert_eq!(merged.until, Some(30));
        assert_eq!(merged.limit, Some(10));
    }

    #[test]
    fn merge_drops_bounds_missing_from_any_input() {
        let bounded = Filter::new().kinds([1]).since(10).limit(5);
        let open = Filter::new();
        let merged = Filter::merge([&bounded, &open]);
        assert_eq!(merged.kinds, None);
        assert_eq!(merged.since, None);
        assert_eq!(merged.limit, None);
    }

    #[test]
    fn merge_dedups_union_values() {
        let a = Filter::new().kinds([1, 2]).authors(["p1"]);
        let b = Filter::new().kinds([2, 3]).authors(["p1"]);
        let merged = Filter::merge([&a, &b]);
        assert_eq!(merged.kinds.as_ref().unwrap(), &vec![1, 2, 3]);
        assert_eq!(merged.authors.as_ref().unwrap(), &vec!["p1".to_string()]);
    }

    #[test]
    fn json_round_trip() {
        let val = serde_json::json!({
            "ids": ["aa"],
            "authors": ["p1", "p2"],
            "kinds": [1, 30023],
            "#d": ["slug"],
            "#t": ["news", "essay"],
            "since": 1,
            "until": 2,
            "limit": 3
        });
        let f = Filter::from_value(&val);
        assert_eq!(f.ids.as_ref().unwrap(), &vec!["aa".to_string()]);
        assert_eq!(f.kinds.as_ref().unwrap(), &vec![1, 30023]);
        assert_eq!(f.tags["d"], vec!["slug".to_string()]);
        assert_eq!(f.tags["t"], vec!["news".to_string(), "essay".to_string()]);
        assert_eq!(f.since, Some(1));
        assert_eq!(f.until, Some(2));
        assert_eq!(f.limit, Some(3));
        assert_eq!(Filter::from_value(&f.to_value()), f);
    }

    #[test]
    fn from_value_skips_malformed_entries() {
        let val = serde_json::json!({
            "kinds": [1, "x", 2],
            "authors": "not-an-array",
            "since": "oops"
        });
        let f = Filter::from_value(&val);
        assert_eq!(f.kinds.as_ref().unwrap(), &vec![1, 2]);
        assert!(f.authors.is_none());
        assert!(f.since.is_none());
    }
}
