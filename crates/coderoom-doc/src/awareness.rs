//! Awareness - ephemeral per-connection presence (cursor and identity).
//!
//! Each connection writes only its own entry, so entries never have more
//! than one writer. Updates carry a per-entry clock and only the fields
//! that changed; a receiver keeps the highest clock it has seen for each
//! entry. Entries that stop refreshing are swept after an inactivity window.

use crate::identity::Identity;
use coderoom_core::{now_millis, ConnectionId, Observers, SubscriptionId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, trace};

/// Inactivity window after which a silent entry is dropped.
pub const DEFAULT_EXPIRY_MS: u64 = 30_000;

/// A cursor position, with an optional selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Character offset of the caret.
    pub position: usize,
    /// Selected range `(start, end)`, `start <= end`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<(usize, usize)>,
}

impl CursorState {
    pub fn at(position: usize) -> Self {
        Self {
            position,
            selection: None,
        }
    }

    /// Selection from `anchor` to `head`; the caret sits at `head`.
    pub fn with_selection(anchor: usize, head: usize) -> Self {
        Self {
            position: head,
            selection: Some((anchor.min(head), anchor.max(head))),
        }
    }

    pub fn has_selection(&self) -> bool {
        matches!(self.selection, Some((start, end)) if start != end)
    }

    /// The same cursor with every offset limited to `len`.
    pub fn clamped(&self, len: usize) -> Self {
        Self {
            position: self.position.min(len),
            selection: self
                .selection
                .map(|(start, end)| (start.min(len), end.min(len))),
        }
    }
}

/// Change to the cursor field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorUpdate {
    Moved(CursorState),
    Cleared,
}

/// An identity together with the time it was claimed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaim {
    pub identity: Identity,
    pub claimed_at: u64,
}

/// The fields carried by one awareness update; `None` means unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityClaim>,
}

impl PresenceFields {
    pub fn cursor(cursor: Option<CursorState>) -> Self {
        Self {
            cursor: Some(match cursor {
                Some(cursor) => CursorUpdate::Moved(cursor),
                None => CursorUpdate::Cleared,
            }),
            identity: None,
        }
    }

    pub fn identity(identity: Identity, claimed_at: u64) -> Self {
        Self {
            cursor: None,
            identity: Some(IdentityClaim {
                identity,
                claimed_at,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_none() && self.identity.is_none()
    }
}

/// An update to one connection's entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessDelta {
    pub connection_id: ConnectionId,
    pub clock: u64,
    #[serde(default)]
    pub fields: PresenceFields,
}

/// Presence of one connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub clock: u64,
    pub cursor: Option<CursorState>,
    pub identity: Option<Identity>,
    pub claimed_at: u64,
    /// Local receipt time of the last update, in milliseconds.
    #[serde(skip)]
    pub last_seen: u64,
}

impl PresenceEntry {
    fn new(connection_id: ConnectionId, now: u64) -> Self {
        Self {
            connection_id,
            clock: 0,
            cursor: None,
            identity: None,
            claimed_at: 0,
            last_seen: now,
        }
    }

    fn apply(&mut self, fields: &PresenceFields) {
        match fields.cursor {
            Some(CursorUpdate::Moved(cursor)) => self.cursor = Some(cursor),
            Some(CursorUpdate::Cleared) => self.cursor = None,
            None => {}
        }
        if let Some(claim) = &fields.identity {
            self.identity = Some(claim.identity.clone());
            self.claimed_at = claim.claimed_at;
        }
    }

    pub fn is_expired(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > window_ms
    }

    /// The whole entry as one update.
    pub fn to_delta(&self) -> AwarenessDelta {
        AwarenessDelta {
            connection_id: self.connection_id.clone(),
            clock: self.clock,
            fields: PresenceFields {
                cursor: Some(match self.cursor {
                    Some(cursor) => CursorUpdate::Moved(cursor),
                    None => CursorUpdate::Cleared,
                }),
                identity: self.identity.clone().map(|identity| IdentityClaim {
                    identity,
                    claimed_at: self.claimed_at,
                }),
            },
        }
    }

    /// Earlier claims win; ties go to the smaller connection id.
    fn claim_precedes(&self, other: &PresenceEntry) -> bool {
        (self.claimed_at, &self.connection_id) < (other.claimed_at, &other.connection_id)
    }
}

/// Notification emitted when the awareness map changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AwarenessChange {
    Added(ConnectionId),
    Updated(ConnectionId),
    Removed(ConnectionId),
}

/// The awareness map of one room as seen by one connection.
#[derive(Debug)]
pub struct AwarenessTracker {
    local: ConnectionId,
    entries: BTreeMap<ConnectionId, PresenceEntry>,
    expiry_ms: u64,
    observers: Observers<AwarenessChange>,
}

impl AwarenessTracker {
    /// A tracker owning the entry of `local`.
    pub fn new(local: ConnectionId) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(local.clone(), PresenceEntry::new(local.clone(), now_millis()));
        Self {
            local,
            entries,
            expiry_ms: DEFAULT_EXPIRY_MS,
            observers: Observers::new(),
        }
    }

    /// A tracker that only mirrors other connections (used by the server).
    pub fn relay() -> Self {
        Self {
            local: ConnectionId::new(""),
            entries: BTreeMap::new(),
            expiry_ms: DEFAULT_EXPIRY_MS,
            observers: Observers::new(),
        }
    }

    pub fn with_expiry(mut self, expiry_ms: u64) -> Self {
        self.expiry_ms = expiry_ms;
        self
    }

    pub fn expiry_ms(&self) -> u64 {
        self.expiry_ms
    }

    pub fn local_id(&self) -> &ConnectionId {
        &self.local
    }

    pub fn local_entry(&self) -> Option<&PresenceEntry> {
        self.entries.get(&self.local)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&PresenceEntry> {
        self.entries.get(connection_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PresenceEntry> + '_ {
        self.entries.values()
    }

    pub fn remote_entries(&self) -> impl Iterator<Item = &PresenceEntry> + '_ {
        self.entries
            .values()
            .filter(move |entry| entry.connection_id != self.local)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry as a full-state update, for newcomers.
    pub fn snapshot(&self) -> Vec<AwarenessDelta> {
        self.entries.values().map(PresenceEntry::to_delta).collect()
    }

    pub fn on_change<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&AwarenessChange) + Send + 'static,
    {
        self.observers.subscribe(handler)
    }

    pub fn off_change(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // === Local entry ===

    /// Update the local entry and return the update to broadcast.
    pub fn set_local(&mut self, fields: PresenceFields) -> AwarenessDelta {
        self.set_local_at(fields, now_millis())
    }

    pub fn set_local_at(&mut self, fields: PresenceFields, now: u64) -> AwarenessDelta {
        let local = self.local.clone();
        let entry = self
            .entries
            .entry(local.clone())
            .or_insert_with(|| PresenceEntry::new(local.clone(), now));
        entry.clock += 1;
        entry.last_seen = now;
        entry.apply(&fields);
        let delta = AwarenessDelta {
            connection_id: local.clone(),
            clock: entry.clock,
            fields,
        };
        self.observers.notify(&AwarenessChange::Updated(local));
        delta
    }

    pub fn set_cursor(&mut self, cursor: Option<CursorState>) -> AwarenessDelta {
        self.set_local(PresenceFields::cursor(cursor))
    }

    /// Refresh the local entry without changing any field.
    pub fn heartbeat(&mut self) -> AwarenessDelta {
        self.set_local(PresenceFields::default())
    }

    /// The local entry as a full-state update.
    pub fn local_state(&self) -> Option<AwarenessDelta> {
        self.local_entry().map(PresenceEntry::to_delta)
    }

    /// Names held by live entries other than the local one.
    pub fn names_in_use(&self, now: u64) -> HashSet<&str> {
        self.remote_entries()
            .filter(|entry| !entry.is_expired(now, self.expiry_ms))
            .filter_map(|entry| entry.identity.as_ref())
            .filter(|identity| !identity.is_anonymous())
            .map(|identity| identity.name.as_str())
            .collect()
    }

    /// Optimistically claim a free identity from the palette.
    pub fn claim_identity(&mut self) -> AwarenessDelta {
        self.claim_identity_with(&mut rand::thread_rng(), now_millis())
    }

    pub fn claim_identity_with<R: Rng + ?Sized>(&mut self, rng: &mut R, now: u64) -> AwarenessDelta {
        let identity = Identity::choose(&self.names_in_use(now), rng);
        debug!(connection = %self.local, name = %identity.name, "Claiming identity");
        self.set_local_at(PresenceFields::identity(identity, now), now)
    }

    /// Move the local entry to a new connection id, keeping its fields.
    ///
    /// Returns the full state to announce under the new id.
    pub fn rebind(&mut self, local: ConnectionId) -> AwarenessDelta {
        let now = now_millis();
        let previous = self.entries.remove(&self.local);
        if previous.is_some() {
            self.observers
                .notify(&AwarenessChange::Removed(self.local.clone()));
        }
        let mut entry = PresenceEntry::new(local.clone(), now);
        if let Some(previous) = previous {
            entry.cursor = previous.cursor;
            entry.identity = previous.identity;
            entry.claimed_at = previous.claimed_at;
        }
        entry.clock = 1;
        let delta = entry.to_delta();
        self.entries.insert(local.clone(), entry);
        self.local = local.clone();
        self.observers.notify(&AwarenessChange::Added(local));
        delta
    }

    // === Remote entries ===

    /// Merge an update from another connection.
    ///
    /// Returns a reselection update when the local identity claim lost a
    /// collision with this entry.
    pub fn apply_remote(&mut self, delta: &AwarenessDelta) -> Option<AwarenessDelta> {
        self.apply_remote_at(delta, now_millis())
    }

    pub fn apply_remote_at(&mut self, delta: &AwarenessDelta, now: u64) -> Option<AwarenessDelta> {
        let id = &delta.connection_id;
        if *id == self.local {
            return None;
        }

        let change = match self.entries.get_mut(id) {
            Some(entry) => {
                if delta.clock <= entry.clock {
                    trace!(connection = %id, clock = delta.clock, "Stale awareness update ignored");
                    return None;
                }
                entry.apply(&delta.fields);
                entry.clock = delta.clock;
                entry.last_seen = now;
                AwarenessChange::Updated(id.clone())
            }
            None => {
                let mut entry = PresenceEntry::new(id.clone(), now);
                entry.apply(&delta.fields);
                entry.clock = delta.clock;
                self.entries.insert(id.clone(), entry);
                AwarenessChange::Added(id.clone())
            }
        };
        self.observers.notify(&change);

        if delta.fields.identity.is_some() && self.lost_claim_to(id) {
            debug!(connection = %self.local, winner = %id, "Identity collision, reselecting");
            return Some(self.claim_identity_with(&mut rand::thread_rng(), now));
        }
        None
    }

    fn lost_claim_to(&self, other: &ConnectionId) -> bool {
        let (Some(local), Some(remote)) = (self.local_entry(), self.entries.get(other)) else {
            return false;
        };
        match (&local.identity, &remote.identity) {
            (Some(mine), Some(theirs)) => {
                !mine.is_anonymous() && mine.name == theirs.name && remote.claim_precedes(local)
            }
            _ => false,
        }
    }

    /// Drop an entry after an explicit leave notice.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> bool {
        if *connection_id == self.local {
            return false;
        }
        let removed = self.entries.remove(connection_id).is_some();
        if removed {
            self.observers
                .notify(&AwarenessChange::Removed(connection_id.clone()));
        }
        removed
    }

    /// Sweep entries silent for longer than the inactivity window.
    pub fn expire(&mut self) -> Vec<ConnectionId> {
        self.expire_at(now_millis())
    }

    pub fn expire_at(&mut self, now: u64) -> Vec<ConnectionId> {
        let expired: Vec<ConnectionId> = self
            .remote_entries()
            .filter(|entry| entry.is_expired(now, self.expiry_ms))
            .map(|entry| entry.connection_id.clone())
            .collect();
        for id in &expired {
            debug!(connection = %id, "Presence entry expired");
            self.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PALETTE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn claim(connection: &str, clock: u64, name: &str, claimed_at: u64) -> AwarenessDelta {
        AwarenessDelta {
            connection_id: conn(connection),
            clock,
            fields: PresenceFields::identity(Identity::new(name, "#FFFFFF"), claimed_at),
        }
    }

    #[test]
    fn test_cursor_selection() {
        let cursor = CursorState::with_selection(10, 4);
        assert_eq!(cursor.position, 4);
        assert_eq!(cursor.selection, Some((4, 10)));
        assert!(cursor.has_selection());
        assert!(!CursorState::at(3).has_selection());
        assert_eq!(cursor.clamped(6).selection, Some((4, 6)));
    }

    #[test]
    fn test_set_local_carries_changed_fields_only() {
        let mut tracker = AwarenessTracker::new(conn("a"));
        let delta = tracker.set_cursor(Some(CursorState::at(3)));
        assert_eq!(delta.clock, 1);
        assert!(delta.fields.identity.is_none());
        assert_eq!(delta.fields.cursor, Some(CursorUpdate::Moved(CursorState::at(3))));

        let beat = tracker.heartbeat();
        assert_eq!(beat.clock, 2);
        assert!(beat.fields.is_empty());
        assert_eq!(tracker.local_entry().unwrap().cursor, Some(CursorState::at(3)));
    }

    #[test]
    fn test_remote_updates_merge_by_clock() {
        let mut tracker = AwarenessTracker::new(conn("a"));
        let moved = |clock, position| AwarenessDelta {
            connection_id: conn("b"),
            clock,
            fields: PresenceFields::cursor(Some(CursorState::at(position))),
        };

        tracker.apply_remote_at(&moved(2, 5), 100);
        tracker.apply_remote_at(&moved(1, 9), 200);
        let entry = tracker.get(&conn("b")).unwrap();
        assert_eq!(entry.cursor, Some(CursorState::at(5)));
        assert_eq!(entry.last_seen, 100);

        tracker.apply_remote_at(&moved(3, 7), 300);
        assert_eq!(tracker.get(&conn("b")).unwrap().cursor, Some(CursorState::at(7)));
    }

    #[test]
    fn test_local_echo_is_ignored() {
        let mut tracker = AwarenessTracker::new(conn("a"));
        tracker.set_cursor(Some(CursorState::at(1)));
        let echo = AwarenessDelta {
            connection_id: conn("a"),
            clock: 99,
            fields: PresenceFields::cursor(None),
        };
        assert!(tracker.apply_remote_at(&echo, 0).is_none());
        assert_eq!(tracker.local_entry().unwrap().clock, 1);
    }

    #[test]
    fn test_expire_removes_silent_entries() {
        let mut tracker = AwarenessTracker::new(conn("a")).with_expiry(1_000);
        tracker.apply_remote_at(&claim("b", 1, "Hootsie", 10), 10_000);
        tracker.apply_remote_at(&claim("c", 1, "Pompaws", 10), 10_500);

        assert!(tracker.expire_at(11_000).is_empty());
        assert_eq!(tracker.expire_at(11_200), vec![conn("b")]);
        assert!(tracker.get(&conn("b")).is_none());
        assert!(tracker.get(&conn("c")).is_some());
        // The local entry never expires.
        assert!(tracker.local_entry().is_some());
    }

    #[test]
    fn test_remove_on_leave() {
        let mut tracker = AwarenessTracker::new(conn("a"));
        tracker.apply_remote_at(&claim("b", 1, "Hootsie", 10), 10);
        assert!(tracker.remove(&conn("b")));
        assert!(!tracker.remove(&conn("b")));
        assert!(!tracker.remove(&conn("a")));
    }

    #[test]
    fn test_change_notifications() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = AwarenessTracker::new(conn("a"));
        let sink = seen.clone();
        tracker.on_change(move |change| sink.lock().unwrap().push(change.clone()));

        tracker.apply_remote_at(&claim("b", 1, "Hootsie", 10), 10);
        tracker.apply_remote_at(&claim("b", 2, "Hootsie", 10), 20);
        tracker.remove(&conn("b"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                AwarenessChange::Added(conn("b")),
                AwarenessChange::Updated(conn("b")),
                AwarenessChange::Removed(conn("b")),
            ]
        );
    }

    #[test]
    fn test_claim_excludes_names_in_use() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tracker = AwarenessTracker::new(conn("a"));
        for (i, (name, _)) in PALETTE.iter().enumerate().skip(1) {
            tracker.apply_remote_at(&claim(&format!("peer-{i}"), 1, name, 5), 100);
        }
        let delta = tracker.claim_identity_with(&mut rng, 100);
        let claimed = delta.fields.identity.unwrap();
        assert_eq!(claimed.identity.name, PALETTE[0].0);
        assert_eq!(claimed.claimed_at, 100);
    }

    #[test]
    fn test_exhausted_palette_claims_anonymous() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tracker = AwarenessTracker::new(conn("a"));
        for (i, (name, _)) in PALETTE.iter().enumerate() {
            tracker.apply_remote_at(&claim(&format!("peer-{i}"), 1, name, 5), 100);
        }
        let delta = tracker.claim_identity_with(&mut rng, 100);
        assert!(delta.fields.identity.unwrap().identity.is_anonymous());
    }

    #[test]
    fn test_later_claimant_reselects() {
        let mut tracker = AwarenessTracker::new(conn("b"));
        tracker.set_local_at(
            PresenceFields::identity(Identity::new("Hootsie", "#9AD1D4"), 200),
            200,
        );

        let reselect = tracker
            .apply_remote_at(&claim("a", 1, "Hootsie", 100), 250)
            .expect("earlier claim wins");
        let renamed = reselect.fields.identity.unwrap().identity;
        assert_ne!(renamed.name, "Hootsie");
        assert_eq!(tracker.local_entry().unwrap().identity, Some(renamed));
    }

    #[test]
    fn test_earlier_claimant_keeps_name() {
        let mut tracker = AwarenessTracker::new(conn("a"));
        tracker.set_local_at(
            PresenceFields::identity(Identity::new("Hootsie", "#9AD1D4"), 100),
            100,
        );
        assert!(tracker
            .apply_remote_at(&claim("b", 1, "Hootsie", 200), 250)
            .is_none());

        // Equal claim times fall back to the connection id.
        let mut tracker = AwarenessTracker::new(conn("b"));
        tracker.set_local_at(
            PresenceFields::identity(Identity::new("Hootsie", "#9AD1D4"), 100),
            100,
        );
        assert!(tracker
            .apply_remote_at(&claim("a", 1, "Hootsie", 100), 250)
            .is_some());
    }

    #[test]
    fn test_rebind_keeps_fields() {
        let mut tracker = AwarenessTracker::new(conn("old"));
        tracker.set_local_at(
            PresenceFields::identity(Identity::new("Hootsie", "#9AD1D4"), 100),
            100,
        );
        tracker.set_cursor(Some(CursorState::at(4)));

        let delta = tracker.rebind(conn("new"));
        assert_eq!(delta.connection_id, conn("new"));
        assert!(tracker.get(&conn("old")).is_none());
        let entry = tracker.local_entry().unwrap();
        assert_eq!(entry.cursor, Some(CursorState::at(4)));
        assert_eq!(entry.identity.as_ref().unwrap().name, "Hootsie");
    }

    #[test]
    fn test_relay_snapshot_lists_remote_entries() {
        let mut relay = AwarenessTracker::relay();
        relay.apply_remote_at(&claim("a", 1, "Hootsie", 10), 10);
        relay.apply_remote_at(&claim("b", 1, "Pompaws", 10), 10);
        let snapshot = relay.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].connection_id, conn("a"));

        let mut peer = AwarenessTracker::new(conn("c"));
        for delta in &snapshot {
            peer.apply_remote_at(delta, 10);
        }
        assert_eq!(peer.get(&conn("b")).unwrap().identity.as_ref().unwrap().name, "Pompaws");
    }

    #[test]
    fn test_delta_wire_format() {
        let delta = AwarenessDelta {
            connection_id: conn("a"),
            clock: 2,
            fields: PresenceFields::cursor(Some(CursorState::at(3))),
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["connectionId"], "a");
        assert_eq!(json["fields"]["cursor"]["moved"]["position"], 3);
        assert!(json["fields"].get("identity").is_none());
    }
}
