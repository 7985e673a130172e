//! Replicated text - a collaborative character sequence based on RGA.
//!
//! Every character is an item identified by the operation that inserted it
//! and placed relative to the item it was typed after (its origin), never
//! by a raw offset. Deletes leave tombstones so operations still in flight
//! keep a stable reference.
//!
//! Concurrent inserts after the same origin are ordered by their priority
//! `(lamport, replica)`, higher first. A causally later insert always has a
//! higher lamport value than everything its author had seen, so it lands
//! directly after its origin; truly concurrent inserts with equal lamport
//! values fall back to the greater replica id.

use crate::delta::{
    push_change, ChangeOrigin, LocalEdit, MergeOutcome, MergeSummary, TextChange, TextDelta,
};
use crate::error::{DocError, Result};
use crate::op::Operation;
use coderoom_core::{Lattice, Observers, OpId, ReplicaId, StateVector, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

/// One character of the sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: OpId,
    pub origin: Option<OpId>,
    pub lamport: u64,
    pub value: char,
    /// Deletes that tombstoned this item; empty means visible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_by: Vec<OpId>,
}

impl Item {
    pub fn is_visible(&self) -> bool {
        self.deleted_by.is_empty()
    }

    fn outranks(&self, lamport: u64, replica: &ReplicaId) -> bool {
        (self.lamport, &self.id.replica) > (lamport, replica)
    }
}

/// Full state of a document: the item sequence plus anything still buffered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub items: Vec<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffered: Vec<Operation>,
    pub state_vector: StateVector,
}

impl DocumentSnapshot {
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter(|item| item.is_visible())
            .map(|item| item.value)
            .collect()
    }

    /// Replayable history: inserts in document order, then deletes, then
    /// buffered operations.
    pub fn operations(&self) -> Vec<Operation> {
        history(&self.items, self.buffered.iter(), &StateVector::new())
    }
}

/// Operations not covered by `known`, in an order a receiver can apply
/// without buffering.
fn history<'a>(
    items: &[Item],
    buffered: impl Iterator<Item = &'a Operation>,
    known: &StateVector,
) -> Vec<Operation> {
    let mut ops: Vec<Operation> = items
        .iter()
        .filter(|item| !known.covers(&item.id))
        .map(|item| Operation::Insert {
            id: item.id.clone(),
            origin: item.origin.clone(),
            lamport: item.lamport,
            value: item.value,
        })
        .collect();

    let mut deletes: Vec<Operation> = items
        .iter()
        .flat_map(|item| {
            item.deleted_by.iter().map(move |id| Operation::Delete {
                id: id.clone(),
                target: item.id.clone(),
            })
        })
        .filter(|op| !known.covers(op.id()))
        .collect();
    deletes.sort_by(|a, b| a.id().cmp(b.id()));
    ops.extend(deletes);

    let mut pending: Vec<Operation> = buffered
        .filter(|op| !known.covers(op.id()))
        .cloned()
        .collect();
    pending.sort_by(|a, b| a.id().cmp(b.id()));
    ops.extend(pending);
    ops
}

/// A replicated text document for one room, as seen by one replica.
///
/// Merge is idempotent and commutative: replicas that received the same
/// operations hold the same text, whatever the delivery order.
#[derive(Debug)]
pub struct ReplicatedText {
    replica: ReplicaId,
    /// Last sequence number this replica originated.
    seq: u64,
    /// Highest lamport value seen.
    clock: u64,
    items: Vec<Item>,
    /// Ids of integrated inserts.
    known: HashSet<OpId>,
    /// Ids of every delete received, integrated or not.
    deletions: HashSet<OpId>,
    visible: usize,
    /// Contiguous prefix of received operations per replica.
    state: StateVector,
    /// Received operations beyond the contiguous prefix.
    ahead: BTreeSet<OpId>,
    /// Inserts waiting for their origin, keyed by the missing id.
    pending_inserts: HashMap<OpId, Vec<Operation>>,
    /// Deletes waiting for their target, keyed by the missing id.
    pending_deletes: HashMap<OpId, Vec<Operation>>,
    /// Local operations not yet handed to the transport.
    outbox: Vec<Operation>,
    observers: Observers<TextDelta>,
}

impl ReplicatedText {
    pub fn new(replica: impl Into<ReplicaId>) -> Self {
        Self {
            replica: replica.into(),
            seq: 0,
            clock: 0,
            items: Vec::new(),
            known: HashSet::new(),
            deletions: HashSet::new(),
            visible: 0,
            state: StateVector::new(),
            ahead: BTreeSet::new(),
            pending_inserts: HashMap::new(),
            pending_deletes: HashMap::new(),
            outbox: Vec::new(),
            observers: Observers::new(),
        }
    }

    /// Rebuild a replica from a snapshot taken anywhere in the room.
    pub fn from_snapshot(replica: impl Into<ReplicaId>, snapshot: &DocumentSnapshot) -> Result<Self> {
        let mut doc = Self::new(replica);
        for op in snapshot.operations() {
            doc.merge(op)?;
        }
        Ok(doc)
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Adopt a different replica id (e.g. one assigned by the server).
    ///
    /// Only valid before this replica originated any operation.
    pub fn set_replica(&mut self, replica: ReplicaId) -> Result<()> {
        if self.seq > 0 && replica != self.replica {
            return Err(DocError::MalformedOperation(format!(
                "replica {} already originated operations",
                self.replica
            )));
        }
        self.seq = self.state.get(&replica);
        self.replica = replica;
        Ok(())
    }

    /// Last sequence number this replica originated.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    pub fn text(&self) -> String {
        self.chars().collect()
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.items
            .iter()
            .filter(|item| item.is_visible())
            .map(|item| item.value)
    }

    pub fn tombstone_count(&self) -> usize {
        self.items.len() - self.visible
    }

    /// Operations held back for a missing dependency.
    pub fn buffered_count(&self) -> usize {
        self.pending_inserts.values().map(Vec::len).sum::<usize>()
            + self.pending_deletes.values().map(Vec::len).sum::<usize>()
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Id of the visible character at `position`.
    pub fn id_at(&self, position: usize) -> Option<OpId> {
        self.items
            .iter()
            .filter(|item| item.is_visible())
            .nth(position)
            .map(|item| item.id.clone())
    }

    /// Visible position of an item; a tombstone maps to where it used to be.
    pub fn position_of(&self, id: &OpId) -> Option<usize> {
        let index = self.index_of(id)?;
        Some(self.visible_before(index))
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&TextDelta) + Send + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // === Local editing ===

    /// Apply an edit originated here and return the new visible text.
    pub fn apply_local(&mut self, edit: LocalEdit) -> String {
        let mut changes = Vec::new();
        match edit {
            LocalEdit::Insert { position, text } => {
                self.insert_local(position, &text, &mut changes)
            }
            LocalEdit::Delete { position, len } => self.delete_local(position, len, &mut changes),
            LocalEdit::Replace {
                position,
                len,
                text,
            } => {
                self.delete_local(position, len, &mut changes);
                self.insert_local(position, &text, &mut changes);
            }
        }
        if !changes.is_empty() {
            self.observers
                .notify(&TextDelta::new(ChangeOrigin::Local, changes));
        }
        self.text()
    }

    pub fn insert(&mut self, position: usize, text: &str) -> String {
        self.apply_local(LocalEdit::Insert {
            position,
            text: text.to_string(),
        })
    }

    pub fn delete(&mut self, position: usize, len: usize) -> String {
        self.apply_local(LocalEdit::Delete { position, len })
    }

    /// Drain local operations not yet handed to the transport.
    pub fn take_pending(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn next_id(&mut self) -> OpId {
        self.seq += 1;
        OpId {
            replica: self.replica.clone(),
            seq: self.seq,
        }
    }

    fn insert_local(&mut self, position: usize, text: &str, changes: &mut Vec<TextChange>) {
        let position = position.min(self.visible);
        let mut origin = match position {
            0 => None,
            _ => self.id_at(position - 1),
        };
        for value in text.chars() {
            let id = self.next_id();
            self.clock += 1;
            let op = Operation::Insert {
                id: id.clone(),
                origin: origin.take(),
                lamport: self.clock,
                value,
            };
            self.record(&op);
            self.integrate(op.clone(), changes);
            self.outbox.push(op);
            origin = Some(id);
        }
    }

    fn delete_local(&mut self, position: usize, len: usize, changes: &mut Vec<TextChange>) {
        let start = position.min(self.visible);
        let end = start.saturating_add(len).min(self.visible);
        let targets: Vec<OpId> = self
            .items
            .iter()
            .filter(|item| item.is_visible())
            .skip(start)
            .take(end - start)
            .map(|item| item.id.clone())
            .collect();
        for target in targets {
            let id = self.next_id();
            let op = Operation::Delete {
                id: id.clone(),
                target: target.clone(),
            };
            self.record(&op);
            self.tombstone(id, &target, changes);
            self.outbox.push(op);
        }
    }

    // === Remote merging ===

    /// Merge an operation received from another replica.
    pub fn merge(&mut self, op: Operation) -> Result<MergeOutcome> {
        if let Err(err) = op.validate() {
            warn!(replica = %self.replica, error = %err, "Rejecting malformed operation");
            return Err(err);
        }
        if self.has_seen(op.id()) {
            trace!(op = %op.id(), "Duplicate operation ignored");
            return Ok(MergeOutcome::Duplicate);
        }

        if let Some(dep) = op.dependency().filter(|dep| self.deletions.contains(*dep)) {
            let err = DocError::MalformedOperation(format!(
                "operation {} depends on delete {dep}",
                op.id()
            ));
            warn!(replica = %self.replica, error = %err, "Rejecting malformed operation");
            return Err(err);
        }

        let author = op.replica().clone();
        self.record(&op);
        if !op.is_insert() {
            self.discard_waiting_on(op.id());
        }

        if let Some(missing) = self.missing_dependency(&op) {
            debug!(op = %op.id(), missing = %missing, "Buffering operation until its dependency arrives");
            let queue = if op.is_insert() {
                &mut self.pending_inserts
            } else {
                &mut self.pending_deletes
            };
            queue.entry(missing).or_default().push(op);
            return Ok(MergeOutcome::Buffered);
        }

        let mut changes = Vec::new();
        self.integrate(op, &mut changes);
        let delta = TextDelta::new(ChangeOrigin::Remote(author), changes);
        if !delta.is_empty() {
            self.observers.notify(&delta);
        }
        Ok(MergeOutcome::Applied(delta))
    }

    /// Decode and merge an operation received as JSON.
    pub fn merge_encoded(&mut self, bytes: &[u8]) -> Result<MergeOutcome> {
        let op = match Operation::decode(bytes) {
            Ok(op) => op,
            Err(err) => {
                warn!(replica = %self.replica, error = %err, "Dropping undecodable operation");
                return Err(err);
            }
        };
        self.merge(op)
    }

    /// Merge a batch; malformed operations are skipped and counted.
    pub fn merge_all(&mut self, ops: impl IntoIterator<Item = Operation>) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for op in ops {
            match self.merge(op) {
                Ok(MergeOutcome::Applied(_)) => summary.applied += 1,
                Ok(MergeOutcome::Buffered) => summary.buffered += 1,
                Ok(MergeOutcome::Duplicate) => summary.duplicates += 1,
                Err(_) => summary.rejected += 1,
            }
        }
        summary
    }

    fn has_seen(&self, id: &OpId) -> bool {
        self.state.covers(id) || self.ahead.contains(id)
    }

    /// Note receipt of an operation and advance the clocks.
    fn record(&mut self, op: &Operation) {
        let id = op.id();
        self.clock = self.clock.max(op.lamport());
        if !op.is_insert() {
            self.deletions.insert(id.clone());
        }
        if id.replica == self.replica {
            self.seq = self.seq.max(id.seq);
        }

        if id.seq != self.state.get(&id.replica) + 1 {
            self.ahead.insert(id.clone());
            return;
        }
        let mut seq = id.seq;
        loop {
            let next = OpId {
                replica: id.replica.clone(),
                seq: seq + 1,
            };
            if !self.ahead.remove(&next) {
                break;
            }
            seq += 1;
        }
        self.state.set(id.replica.clone(), seq);
    }

    /// Drop buffered operations that can never be released because they
    /// wait on a delete, along with whatever waits on them.
    fn discard_waiting_on(&mut self, delete: &OpId) {
        let mut dead = vec![delete.clone()];
        let mut discarded = 0;
        while let Some(id) = dead.pop() {
            if let Some(waiting) = self.pending_inserts.remove(&id) {
                discarded += waiting.len();
                dead.extend(waiting.iter().map(|op| op.id().clone()));
            }
            if let Some(waiting) = self.pending_deletes.remove(&id) {
                discarded += waiting.len();
            }
        }
        if discarded > 0 {
            warn!(replica = %self.replica, delete = %delete, discarded, "Discarding operations anchored on a delete");
        }
    }

    fn missing_dependency(&self, op: &Operation) -> Option<OpId> {
        op.dependency()
            .filter(|dep| !self.known.contains(*dep))
            .cloned()
    }

    /// Apply a ready operation and everything it unblocks.
    fn integrate(&mut self, op: Operation, changes: &mut Vec<TextChange>) {
        let mut ready = VecDeque::from([op]);
        while let Some(op) = ready.pop_front() {
            match op {
                Operation::Insert {
                    id,
                    origin,
                    lamport,
                    value,
                } => {
                    let released = id.clone();
                    self.place(
                        Item {
                            id,
                            origin,
                            lamport,
                            value,
                            deleted_by: Vec::new(),
                        },
                        changes,
                    );
                    if let Some(waiting) = self.pending_inserts.remove(&released) {
                        ready.extend(waiting);
                    }
                    if let Some(waiting) = self.pending_deletes.remove(&released) {
                        ready.extend(waiting);
                    }
                }
                Operation::Delete { id, target } => self.tombstone(id, &target, changes),
            }
        }
    }

    fn place(&mut self, item: Item, changes: &mut Vec<TextChange>) {
        let mut index = item
            .origin
            .as_ref()
            .and_then(|origin| self.index_of(origin))
            .map_or(0, |i| i + 1);
        while index < self.items.len() && self.items[index].outranks(item.lamport, &item.id.replica)
        {
            index += 1;
        }

        push_change(
            changes,
            TextChange::Insert {
                index: self.visible_before(index),
                text: item.value.to_string(),
            },
        );
        self.known.insert(item.id.clone());
        self.items.insert(index, item);
        self.visible += 1;
    }

    fn tombstone(&mut self, id: OpId, target: &OpId, changes: &mut Vec<TextChange>) {
        let Some(index) = self.index_of(target) else {
            return;
        };
        let position = self.visible_before(index);
        let item = &mut self.items[index];
        let was_visible = item.is_visible();
        if !item.deleted_by.contains(&id) {
            item.deleted_by.push(id);
        }
        if was_visible {
            self.visible -= 1;
            push_change(
                changes,
                TextChange::Delete {
                    index: position,
                    len: 1,
                },
            );
        }
    }

    fn index_of(&self, id: &OpId) -> Option<usize> {
        if !self.known.contains(id) {
            return None;
        }
        self.items.iter().position(|item| &item.id == id)
    }

    fn visible_before(&self, index: usize) -> usize {
        self.items[..index]
            .iter()
            .filter(|item| item.is_visible())
            .count()
    }

    // === Resynchronization ===

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            items: self.items.clone(),
            buffered: self.buffered_ops().cloned().collect(),
            state_vector: self.state.clone(),
        }
    }

    /// Operations a peer summarized by `known` has not seen.
    pub fn diff_since(&self, known: &StateVector) -> Vec<Operation> {
        history(&self.items, self.buffered_ops(), known)
    }

    fn buffered_ops(&self) -> impl Iterator<Item = &Operation> {
        self.pending_inserts
            .values()
            .chain(self.pending_deletes.values())
            .flatten()
    }
}

impl Clone for ReplicatedText {
    /// Subscribers are not carried over to the clone.
    fn clone(&self) -> Self {
        Self {
            replica: self.replica.clone(),
            seq: self.seq,
            clock: self.clock,
            items: self.items.clone(),
            known: self.known.clone(),
            deletions: self.deletions.clone(),
            visible: self.visible,
            state: self.state.clone(),
            ahead: self.ahead.clone(),
            pending_inserts: self.pending_inserts.clone(),
            pending_deletes: self.pending_deletes.clone(),
            outbox: self.outbox.clone(),
            observers: Observers::new(),
        }
    }
}

impl PartialEq for ReplicatedText {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
            && self.ahead == other.ahead
            && self.items.len() == other.items.len()
            && self.text() == other.text()
    }
}

impl Eq for ReplicatedText {}

impl Lattice for ReplicatedText {
    fn bottom() -> Self {
        Self::new(ReplicaId::generate())
    }

    fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge_all(other.diff_since(&self.state));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sync(from: &ReplicatedText, to: &mut ReplicatedText) {
        to.merge_all(from.diff_since(&to.state_vector()));
    }

    #[test]
    fn test_basic_insert() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "Hello");
        assert_eq!(doc.text(), "Hello");
        assert_eq!(doc.len(), 5);
        assert_eq!(doc.seq(), 5);
    }

    #[test]
    fn test_insert_in_middle() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "Helo");
        assert_eq!(doc.insert(2, "l"), "Hello");
    }

    #[test]
    fn test_positions_are_clamped() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(10, "abc");
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.delete(2, 100), "ab");
        assert_eq!(doc.delete(7, 1), "ab");
    }

    #[test]
    fn test_delete_leaves_tombstones() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "Hello World");
        doc.delete(5, 6);
        assert_eq!(doc.text(), "Hello");
        assert_eq!(doc.tombstone_count(), 6);
        // Deletes consume sequence numbers too.
        assert_eq!(doc.seq(), 17);
    }

    #[test]
    fn test_replace() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "Hello World");
        let text = doc.apply_local(LocalEdit::Replace {
            position: 6,
            len: 5,
            text: "Rust".into(),
        });
        assert_eq!(text, "Hello Rust");
    }

    #[test]
    fn test_take_pending_drains_local_ops() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "ab");
        doc.delete(0, 1);
        let ops = doc.take_pending();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].id(), &OpId::new("r1", 1));
        assert_eq!(ops[2].id(), &OpId::new("r1", 3));
        assert!(!doc.has_pending());
    }

    #[test]
    fn test_concurrent_insert_at_same_position() {
        let mut a = ReplicatedText::new("A");
        let mut b = ReplicatedText::new("B");
        a.insert(0, "x");
        b.insert(0, "y");

        let from_a = a.take_pending();
        let from_b = b.take_pending();
        a.merge_all(from_b);
        b.merge_all(from_a);

        assert_eq!(a.text(), b.text());
        assert_eq!(a.text(), "yx");
    }

    #[test]
    fn test_causal_insert_lands_after_origin() {
        let mut a = ReplicatedText::new("z");
        a.insert(0, "ac");
        let mut b = ReplicatedText::new("a");
        sync(&a, &mut b);
        // "a" has a smaller replica id but a later lamport value.
        b.insert(1, "b");
        sync(&b, &mut a);
        assert_eq!(a.text(), "abc");
        assert_eq!(b.text(), "abc");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = ReplicatedText::new("r1");
        a.insert(0, "abc");
        let ops = a.take_pending();

        let mut b = ReplicatedText::new("r2");
        b.merge_all(ops.clone());
        let summary = b.merge_all(ops);
        assert_eq!(summary.duplicates, 3);
        assert_eq!(summary.applied, 0);
        assert_eq!(b.text(), "abc");
    }

    #[test]
    fn test_delete_before_insert_is_buffered() {
        let mut a = ReplicatedText::new("r1");
        a.insert(0, "ab");
        a.delete(0, 1);
        let ops = a.take_pending();

        let mut b = ReplicatedText::new("r2");
        assert_eq!(b.merge(ops[2].clone()).unwrap(), MergeOutcome::Buffered);
        assert_eq!(b.buffered_count(), 1);
        assert_eq!(b.merge(ops[1].clone()).unwrap(), MergeOutcome::Buffered);

        let outcome = b.merge(ops[0].clone()).unwrap();
        assert!(outcome.is_applied());
        assert_eq!(b.text(), "b");
        assert_eq!(b.buffered_count(), 0);
        assert_eq!(b.state_vector().get(&ReplicaId::new("r1")), 3);
    }

    #[test]
    fn test_malformed_operation_does_not_touch_state() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "abc");
        let bad = Operation::Delete {
            id: OpId::new("r2", 0),
            target: OpId::new("r1", 1),
        };
        assert!(doc.merge(bad).is_err());
        assert!(doc.merge_encoded(b"{\"kind\":\"insert\"}").is_err());
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.state_vector().get(&ReplicaId::new("r2")), 0);
    }

    #[test]
    fn test_diff_since_returns_only_missing() {
        let mut a = ReplicatedText::new("r1");
        a.insert(0, "abc");
        let mut b = ReplicatedText::new("r2");
        sync(&a, &mut b);

        a.insert(3, "de");
        let missing = a.diff_since(&b.state_vector());
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].id(), &OpId::new("r1", 4));

        b.merge_all(missing);
        assert_eq!(b.text(), "abcde");
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut a = ReplicatedText::new("r1");
        a.insert(0, "Hello World");
        a.delete(0, 6);

        let snapshot = a.snapshot();
        assert_eq!(snapshot.text(), "World");
        let b = ReplicatedText::from_snapshot("r2", &snapshot).unwrap();
        assert_eq!(b.text(), "World");
        assert_eq!(b.state_vector(), a.state_vector());
    }

    #[test]
    fn test_own_history_advances_counter() {
        let mut a = ReplicatedText::new("r1");
        a.insert(0, "abc");
        let snapshot = a.snapshot();

        let mut again = ReplicatedText::from_snapshot("r1", &snapshot).unwrap();
        assert_eq!(again.seq(), 3);
        again.insert(3, "d");
        assert_eq!(again.take_pending()[0].id(), &OpId::new("r1", 4));
    }

    #[test]
    fn test_subscribers_receive_deltas() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut doc = ReplicatedText::new("r1");
        let sink = seen.clone();
        let id = doc.subscribe(move |delta| sink.lock().unwrap().push(delta.clone()));

        doc.insert(0, "hi");
        doc.delete(0, 1);
        assert!(doc.unsubscribe(id));
        doc.insert(0, "ignored");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0].changes,
            vec![TextChange::Insert {
                index: 0,
                text: "hi".into()
            }]
        );
        assert_eq!(seen[1].changes, vec![TextChange::Delete { index: 0, len: 1 }]);
    }

    #[test]
    fn test_remote_delta_replays_onto_text() {
        let mut a = ReplicatedText::new("r1");
        let mut b = ReplicatedText::new("r2");
        a.insert(0, "hello");
        sync(&a, &mut b);
        let before = b.text();

        a.insert(5, " world");
        a.delete(0, 1);
        let mut combined = before.clone();
        for op in a.take_pending().into_iter().skip(5) {
            if let MergeOutcome::Applied(delta) = b.merge(op).unwrap() {
                assert_eq!(delta.origin, ChangeOrigin::Remote(ReplicaId::new("r1")));
                combined = delta.apply_to(&combined);
            }
        }
        assert_eq!(combined, "ello world");
        assert_eq!(b.text(), combined);
    }

    #[test]
    fn test_position_of_tombstone() {
        let mut doc = ReplicatedText::new("r1");
        doc.insert(0, "abc");
        let id = doc.id_at(1).unwrap();
        doc.delete(1, 1);
        assert_eq!(doc.position_of(&id), Some(1));
        assert_eq!(doc.id_at(1), Some(OpId::new("r1", 3)));
    }

    #[test]
    fn test_insert_anchored_on_a_delete_is_rejected() {
        let mut a = ReplicatedText::new("r1");
        a.insert(0, "ab");
        a.delete(0, 1);
        let ops = a.take_pending();
        let forged = Operation::Insert {
            id: OpId::new("r2", 1),
            origin: Some(OpId::new("r1", 3)),
            lamport: 9,
            value: 'x',
        };

        let err = a.merge(forged.clone()).unwrap_err();
        assert!(matches!(err, DocError::MalformedOperation(_)));
        assert_eq!(a.text(), "b");
        assert_eq!(a.buffered_count(), 0);

        // Arriving before the delete, it is buffered and then discarded.
        let mut b = ReplicatedText::new("r3");
        assert!(matches!(b.merge(forged), Ok(MergeOutcome::Buffered)));
        let follower = Operation::Delete {
            id: OpId::new("r2", 2),
            target: OpId::new("r2", 1),
        };
        assert!(matches!(b.merge(follower), Ok(MergeOutcome::Buffered)));
        assert_eq!(b.buffered_count(), 2);
        b.merge_all(ops);
        assert_eq!(b.text(), "b");
        assert_eq!(b.buffered_count(), 0);
        assert!(b.diff_since(&StateVector::new()).iter().all(|op| op.replica().as_str() == "r1"));
    }

    #[test]
    fn test_lattice_join() {
        let mut a = ReplicatedText::new("r1");
        let mut b = ReplicatedText::new("r2");
        a.insert(0, "Hello");
        b.insert(0, "World");

        let ab = a.join(&b);
        let ba = b.join(&a);
        assert_eq!(ab.text(), ba.text());
        assert_eq!(ab, ba);
        assert_eq!(ab.join(&ab), ab);
    }

    #[test]
    fn test_set_replica_before_editing() {
        let mut doc = ReplicatedText::new("temp");
        doc.set_replica(ReplicaId::new("assigned")).unwrap();
        doc.insert(0, "a");
        assert_eq!(doc.take_pending()[0].replica().as_str(), "assigned");
        assert!(doc.set_replica(ReplicaId::new("other")).is_err());
    }
}
