//! Roster of known peers and the records exchanged in `presence` messages.
//!
//! Records are merged field by field: a field that is present in an incoming record
//! replaces the stored one, a missing field leaves it alone. There is no forwarding,
//! so the roster only converges when every participant is directly connected to
//! every other one.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::internal::data_types::{now_millis, PeerId};

pub const ROOM_CODE_LEN: usize = 6;
const ROOM_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ANONYMOUS: &str = "Anonymous";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl Default for PeerStatus {
    fn default() -> Self {
        PeerStatus::Online
    }
}

impl std::str::FromStr for PeerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PeerStatus::Online),
            "away" => Ok(PeerStatus::Away),
            "busy" => Ok(PeerStatus::Busy),
            "offline" => Ok(PeerStatus::Offline),
            other => anyhow::bail!("unknown status: {}", other),
        }
    }
}

/// A peer's self-reported identity/status snapshot. Every field but `id` is optional
/// on the wire so that partial records only touch what they carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// absent leaves the receiver's value alone, `null` clears it
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub room_code: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PeerStatus>,
    /// last seen, ms since epoch. 0 when the sender did not stamp the record
    #[serde(default, rename = "ts")]
    pub last_seen: u64,
}

impl RosterEntry {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            label: None,
            room_code: None,
            status: None,
            last_seen: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_status(mut self, status: PeerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_room_code(mut self, code: impl Into<String>) -> Self {
        self.room_code = Some(Some(code.into()));
        self
    }

    pub fn room_code(&self) -> Option<&str> {
        self.room_code.as_ref().and_then(|c| c.as_deref())
    }

    pub fn seen_at(mut self, ts: u64) -> Self {
        self.last_seen = ts;
        self
    }

    /// overwrites every field `other` carries. returns true if anything changed
    fn absorb(&mut self, other: RosterEntry, received_at: u64) -> bool {
        let before = self.clone();
        if other.label.is_some() {
            self.label = other.label;
        }
        if other.room_code.is_some() {
            self.room_code = other.room_code;
        }
        if other.status.is_some() {
            self.status = other.status;
        }
        let seen = if other.last_seen == 0 {
            received_at
        } else {
            other.last_seen
        };
        self.last_seen = self.last_seen.max(seen);
        *self != before
    }
}

// distinguishes a missing key from an explicit null
mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// the locally held set of presence records, keyed by peer id
#[derive(Default, Debug)]
pub struct Roster {
    entries: BTreeMap<PeerId, RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, incoming: impl IntoIterator<Item = RosterEntry>) -> bool {
        self.merge_at(incoming, now_millis())
    }

    /// merges each record into the roster. `received_at` stamps records that carry no
    /// timestamp of their own. returns true if the roster changed
    pub fn merge_at(
        &mut self,
        incoming: impl IntoIterator<Item = RosterEntry>,
        received_at: u64,
    ) -> bool {
        let mut changed = false;
        for entry in incoming {
            if entry.id.is_empty() {
                log::warn!("dropping roster entry without an id");
                continue;
            }
            let slot = self
                .entries
                .entry(entry.id.clone())
                .or_insert_with(|| RosterEntry::new(entry.id.clone()));
            changed |= slot.absorb(entry, received_at);
        }
        changed
    }

    /// applies a status-update from `peer`, creating a minimal entry if needed
    pub fn update_status(&mut self, peer: &PeerId, status: PeerStatus, ts: u64) -> bool {
        self.merge_at([RosterEntry::new(peer.clone()).with_status(status).seen_at(ts)], ts)
    }

    /// replaces the record wholesale. used for the local peer's own entry
    pub fn upsert(&mut self, entry: RosterEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, peer: &PeerId) -> Option<&RosterEntry> {
        self.entries.get(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<RosterEntry> {
        self.entries.remove(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RosterEntry> {
        self.entries.values().cloned().collect()
    }
}

/// what the local peer says about itself
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProfile {
    pub label: String,
    pub room_code: Option<String>,
    pub status: PeerStatus,
}

impl LocalProfile {
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            ANONYMOUS
        } else {
            &self.label
        }
    }

    pub fn to_entry(&self, id: &PeerId) -> RosterEntry {
        RosterEntry {
            id: id.clone(),
            label: Some(self.display_label().to_string()),
            room_code: Some(self.room_code.clone()),
            status: Some(self.status),
            last_seen: now_millis(),
        }
    }
}

/// a 6 character code from A-Z0-9. no uniqueness guarantee
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_CHARS[rng.gen_range(0..ROOM_CODE_CHARS.len())] as char)
        .collect()
}

/// trims and upper-cases user input. None for blank input
pub fn normalize_room_code(input: &str) -> Option<String> {
    let code = input.trim().to_ascii_uppercase();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> PeerId {
        "X".into()
    }

    #[test]
    fn partial_records_merge_field_by_field() {
        let mut roster = Roster::new();
        roster.merge_at([RosterEntry::new(x()).with_status(PeerStatus::Away)], 10);
        roster.merge_at([RosterEntry::new(x()).with_label("Bob")], 20);

        let e = roster.get(&x()).unwrap();
        assert_eq!(e.status, Some(PeerStatus::Away));
        assert_eq!(e.label.as_deref(), Some("Bob"));
        assert_eq!(e.last_seen, 20);
    }

    #[test]
    fn cleared_room_code_reaches_other_peers() {
        let mut profile = LocalProfile {
            label: "Bob".into(),
            room_code: Some("ABC123".into()),
            status: PeerStatus::Online,
        };
        let mut remote = Roster::new();
        let wire = serde_json::to_string(&profile.to_entry(&x())).unwrap();
        remote.merge_at([serde_json::from_str::<RosterEntry>(&wire).unwrap()], 10);
        assert_eq!(remote.get(&x()).unwrap().room_code(), Some("ABC123"));

        profile.room_code = None;
        let wire = serde_json::to_value(profile.to_entry(&x())).unwrap();
        assert_eq!(wire["roomCode"], serde_json::Value::Null);
        assert!(wire.as_object().unwrap().contains_key("roomCode"));
        assert!(remote.merge_at([serde_json::from_value::<RosterEntry>(wire).unwrap()], 20));
        let e = remote.get(&x()).unwrap();
        assert_eq!(e.room_code(), None);
        assert_eq!(e.label.as_deref(), Some("Bob"));

        // a record without the key leaves the code alone
        remote.merge_at([RosterEntry::new(x()).with_room_code("QWE123")], 30);
        let partial: RosterEntry = serde_json::from_str(r#"{"id":"X","status":"away"}"#).unwrap();
        assert_eq!(partial.room_code, None);
        remote.merge_at([partial], 40);
        assert_eq!(remote.get(&x()).unwrap().room_code(), Some("QWE123"));
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let a = RosterEntry::new("A".into()).with_label("Ann").seen_at(5);
        let b = RosterEntry::new("B".into())
            .with_status(PeerStatus::Busy)
            .seen_at(7);

        let mut first = Roster::new();
        first.merge_at([a.clone(), b.clone()], 100);
        first.merge_at([b.clone()], 100);

        let mut second = Roster::new();
        second.merge_at([b, a], 100);

        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn remerging_the_same_record_changes_nothing() {
        let mut roster = Roster::new();
        let e = RosterEntry::new(x()).with_label("Bob").seen_at(3);
        assert!(roster.merge_at([e.clone()], 50));
        assert!(!roster.merge_at([e], 50));
    }

    #[test]
    fn last_seen_never_goes_backwards() {
        let mut roster = Roster::new();
        roster.merge_at([RosterEntry::new(x()).seen_at(30)], 0);
        roster.merge_at([RosterEntry::new(x()).with_label("old").seen_at(10)], 0);
        let e = roster.get(&x()).unwrap();
        assert_eq!(e.last_seen, 30);
        // fields still follow the last value received
        assert_eq!(e.label.as_deref(), Some("old"));
    }

    #[test]
    fn status_update_only_touches_status() {
        let mut roster = Roster::new();
        roster.merge_at(
            [RosterEntry::new(x())
                .with_label("Bob")
                .with_room_code("ABC123")
                .with_status(PeerStatus::Online)],
            1,
        );
        assert!(roster.update_status(&x(), PeerStatus::Busy, 2));
        let e = roster.get(&x()).unwrap();
        assert_eq!(e.status, Some(PeerStatus::Busy));
        assert_eq!(e.label.as_deref(), Some("Bob"));
        assert_eq!(e.room_code(), Some("ABC123"));
    }

    #[test]
    fn status_update_from_unknown_peer_creates_entry() {
        let mut roster = Roster::new();
        roster.update_status(&x(), PeerStatus::Away, 9);
        assert_eq!(roster.get(&x()).unwrap().status, Some(PeerStatus::Away));
    }

    #[test]
    fn entry_without_id_is_dropped() {
        let mut roster = Roster::new();
        assert!(!roster.merge_at([RosterEntry::new("".into()).with_label("?")], 1));
        assert!(roster.is_empty());
    }

    #[test]
    fn wire_format_uses_short_names() {
        let e = RosterEntry::new(x())
            .with_label("Bob")
            .with_room_code("QWE123")
            .seen_at(42);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "X", "label": "Bob", "roomCode": "QWE123", "ts": 42})
        );
        let partial: RosterEntry = serde_json::from_str(r#"{"id":"X","status":"away"}"#).unwrap();
        assert_eq!(partial.status, Some(PeerStatus::Away));
        assert_eq!(partial.label, None);
        assert_eq!(partial.last_seen, 0);
    }

    #[test]
    fn room_codes_are_six_uppercase_alphanumerics() {
        for _ in 0..50 {
            let code = generate_room_code();
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn normalizes_room_code_input() {
        assert_eq!(normalize_room_code("  ab12cd "), Some("AB12CD".to_string()));
        assert_eq!(normalize_room_code("   "), None);
    }

    #[test]
    fn blank_label_is_anonymous() {
        let profile = LocalProfile::default();
        let entry = profile.to_entry(&"me".into());
        assert_eq!(entry.label.as_deref(), Some("Anonymous"));
        assert_eq!(entry.status, Some(PeerStatus::Online));
    }

    #[test]
    fn parses_status() {
        assert_eq!("Away".parse::<PeerStatus>().unwrap(), PeerStatus::Away);
        assert!("idle".parse::<PeerStatus>().is_err());
    }
}
