//! Nostr event model and kind classification.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for addressable events
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved. For
/// example, a `["t", "news"]` tag from the protocol is represented as
/// `Tag(vec!["t".into(), "news".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Tag value, i.e. the second element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event as received from relays and local caches.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "npub...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["d", "slug"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
///
/// Events are immutable once constructed; derived state lives in the
/// store's side caches, never in these fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash, verified upstream.
    pub sig: String,
}

/// Replaceable kinds: a single living copy per `(kind, pubkey)`.
pub fn kind_is_replaceable(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Ephemeral kinds: relays do not retain these, a client cache may.
pub fn kind_is_ephemeral(kind: u32) -> bool {
    (20_000..30_000).contains(&kind)
}

/// Addressable kinds: a single living copy per `(kind, pubkey, identifier)`.
pub fn kind_is_addressable(kind: u32) -> bool {
    (30_000..40_000).contains(&kind)
}

/// Build the storage address shared by all versions of a replaceable or
/// addressable event. Pass `None` as identifier for plain replaceable kinds.
pub fn replaceable_address(kind: u32, pubkey: &str, identifier: Option<&str>) -> String {
    format!("{}:{}:{}", kind, pubkey, identifier.unwrap_or_default())
}

impl Event {
    /// Structural validity check applied at the store boundary.
    ///
    /// An object qualifies as an event only if `id` and `pubkey` are
    /// 64-char hex strings and `created_at` is positive. Signature
    /// verification is the transport layer's concern and is not repeated
    /// here.
    pub fn is_valid(&self) -> bool {
        is_hex64(&self.id) && is_hex64(&self.pubkey) && self.created_at > 0
    }

    /// Value of the first `d` tag, the identifier of addressable events.
    pub fn identifier(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(|t| t.value())
    }

    /// The key under which this event is versioned.
    ///
    /// Regular and ephemeral events are keyed by their `id`; replaceable
    /// events share `kind:pubkey:` and addressable events
    /// `kind:pubkey:identifier`, so newer versions supersede older ones at
    /// the same address. A missing `d` tag on an addressable event is
    /// treated as the empty identifier, matching relay behavior.
    pub fn address(&self) -> String {
        if kind_is_replaceable(self.kind) {
            replaceable_address(self.kind, &self.pubkey, None)
        } else if kind_is_addressable(self.kind) {
            replaceable_address(self.kind, &self.pubkey, self.identifier())
        } else {
            self.id.clone()
        }
    }

    /// Whether this event's kind participates in replaceable versioning.
    pub fn is_replaceable(&self) -> bool {
        kind_is_replaceable(self.kind) || kind_is_addressable(self.kind)
    }

    /// `"<letter>:<value>"` pairs for every single-letter tag, the set the
    /// filter engine consults for `#x` predicates. Multi-letter tag names
    /// are deliberately absent, so they are not filterable.
    pub fn indexable_tags(&self) -> HashSet<String> {
        self.tags
            .iter()
            .filter(|t| t.name().map(|n| n.chars().count() == 1).unwrap_or(false))
            .filter_map(|t| Some(format!("{}:{}", t.name()?, t.value()?)))
            .collect()
    }
}

/// True for 64-character hex strings.
fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex64(fill: char) -> String {
        std::iter::repeat(fill).take(64).collect()
    }

    fn event(kind: u32, tags: Vec<Tag>) -> Event {
        Event {
            id: hex64('a'),
            pubkey: hex64('b'),
            kind,
            created_at: 1,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn kind_ranges() {
        assert!(kind_is_replaceable(0));
        assert!(kind_is_replaceable(3));
        assert!(kind_is_replaceable(10002));
        assert!(!kind_is_replaceable(1));
        assert!(!kind_is_replaceable(20000));
        assert!(kind_is_ephemeral(22242));
        assert!(!kind_is_ephemeral(30023));
        assert!(kind_is_addressable(30023));
        assert!(!kind_is_addressable(40000));
    }

    #[test]
    fn validity_checks_hex_and_timestamp() {
        let ev = event(1, vec![]);
        assert!(ev.is_valid());

        let mut short = ev.clone();
        short.id = "abcd".into();
        assert!(!short.is_valid());

        let mut not_hex = ev.clone();
        not_hex.pubkey = hex64('z');
        assert!(!not_hex.is_valid());

        let mut epoch = ev;
        epoch.created_at = 0;
        assert!(!epoch.is_valid());
    }

    #[test]
    fn identifier_takes_first_d_tag() {
        let ev = event(
            30023,
            vec![
                Tag(vec!["t".into(), "news".into()]),
                Tag(vec!["d".into(), "slug".into()]),
                Tag(vec!["d".into(), "other".into()]),
            ],
        );
        assert_eq!(ev.identifier(), Some("slug"));
    }

    #[test]
    fn address_per_kind_class() {
        let regular = event(1, vec![]);
        assert_eq!(regular.address(), regular.id);

        let replaceable = event(0, vec![]);
        assert_eq!(replaceable.address(), format!("0:{}:", replaceable.pubkey));

        let addressable = event(30023, vec![Tag(vec!["d".into(), "slug".into()])]);
        assert_eq!(
            addressable.address(),
            format!("30023:{}:slug", addressable.pubkey)
        );

        // A missing d tag collapses to the empty identifier.
        let bare = event(30023, vec![]);
        assert_eq!(bare.address(), format!("30023:{}:", bare.pubkey));

        let ephemeral = event(22242, vec![]);
        assert_eq!(ephemeral.address(), ephemeral.id);
    }

    #[test]
    fn indexable_tags_single_letter_only() {
        let ev = event(
            1,
            vec![
                Tag(vec!["t".into(), "nostr".into()]),
                Tag(vec!["e".into(), hex64('c')]),
                Tag(vec!["expiration".into(), "123".into()]),
                Tag(vec!["t".into()]),
            ],
        );
        let tags = ev.indexable_tags();
        assert!(tags.contains("t:nostr"));
        assert!(tags.contains(&format!("e:{}", hex64('c'))));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn wire_round_trip() {
        let json = serde_json::json!({
            "id": hex64('a'),
            "pubkey": hex64('b'),
            "kind": 30023,
            "created_at": 1700000000u64,
            "tags": [["d", "slug"], ["t", "news"]],
            "content": "hello",
            "sig": "00",
        });
        let ev: Event = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(ev.kind, 30023);
        assert_eq!(ev.identifier(), Some("slug"));
        assert_eq!(serde_json::to_value(&ev).unwrap(), json);
    }
}
