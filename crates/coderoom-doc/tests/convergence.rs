//! Convergence tests for the replicated text
//!
//! Replicas must hold identical text once they have received the same set of
//! operations, whatever order those operations arrived in, and however many
//! times each was delivered.

use coderoom_core::{Lattice, OpId, ReplicaId, StateVector};
use coderoom_doc::{LocalEdit, MergeOutcome, Operation, ReplicatedText};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Clone, Debug)]
enum Step {
    Insert { replica: usize, position: usize, text: String },
    Delete { replica: usize, position: usize, len: usize },
    Sync { from: usize, to: usize },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0usize..3, 0usize..30, "[a-z]{1,4}")
            .prop_map(|(replica, position, text)| Step::Insert { replica, position, text }),
        1 => (0usize..3, 0usize..30, 1usize..4)
            .prop_map(|(replica, position, len)| Step::Delete { replica, position, len }),
        1 => (0usize..3, 0usize..3).prop_map(|(from, to)| Step::Sync { from, to }),
    ]
}

/// Run a script against three replicas, returning them and every operation
/// any of them originated.
fn run(script: &[Step]) -> (Vec<ReplicatedText>, Vec<Operation>) {
    let mut replicas: Vec<ReplicatedText> = ["r0", "r1", "r2"]
        .into_iter()
        .map(|id| ReplicatedText::new(id))
        .collect();
    let mut log = Vec::new();

    for step in script {
        match step {
            Step::Insert { replica, position, text } => {
                replicas[*replica].apply_local(LocalEdit::Insert {
                    position: *position,
                    text: text.clone(),
                });
                log.extend(replicas[*replica].take_pending());
            }
            Step::Delete { replica, position, len } => {
                replicas[*replica].apply_local(LocalEdit::Delete {
                    position: *position,
                    len: *len,
                });
                log.extend(replicas[*replica].take_pending());
            }
            Step::Sync { from, to } if from != to => {
                let known = replicas[*to].state_vector();
                let missing = replicas[*from].diff_since(&known);
                replicas[*to].merge_all(missing);
            }
            Step::Sync { .. } => {}
        }
    }
    (replicas, log)
}

fn full_sync(replicas: &mut [ReplicatedText]) {
    for _ in 0..2 {
        for from in 0..replicas.len() {
            for to in 0..replicas.len() {
                if from != to {
                    let missing = replicas[from].diff_since(&replicas[to].state_vector());
                    replicas[to].merge_all(missing);
                }
            }
        }
    }
}

// ============================================================================
// Delivery order
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn shuffled_delivery_converges(
        script in prop::collection::vec(step_strategy(), 1..40),
        seed in any::<u64>(),
    ) {
        let (mut replicas, log) = run(&script);
        full_sync(&mut replicas);
        let expected = replicas[0].text();
        prop_assert_eq!(&replicas[1].text(), &expected);
        prop_assert_eq!(&replicas[2].text(), &expected);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut shuffled = log.clone();
        shuffled.shuffle(&mut rng);

        let mut late = ReplicatedText::new("late");
        late.merge_all(shuffled);
        prop_assert_eq!(late.buffered_count(), 0);
        prop_assert_eq!(late.text(), expected);
        prop_assert_eq!(late.state_vector(), replicas[0].state_vector());
    }

    #[test]
    fn duplicate_delivery_is_harmless(
        script in prop::collection::vec(step_strategy(), 1..30),
        seed in any::<u64>(),
    ) {
        let (mut replicas, log) = run(&script);
        full_sync(&mut replicas);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut doubled: Vec<Operation> = log.iter().chain(log.iter()).cloned().collect();
        doubled.shuffle(&mut rng);

        let mut doc = ReplicatedText::new("late");
        let summary = doc.merge_all(doubled);
        prop_assert_eq!(summary.duplicates, log.len());
        prop_assert_eq!(doc.text(), replicas[0].text());
    }

    #[test]
    fn join_is_commutative_and_idempotent(
        script in prop::collection::vec(step_strategy(), 1..30),
    ) {
        let (replicas, _) = run(&script);
        let ab = replicas[0].join(&replicas[1]);
        let ba = replicas[1].join(&replicas[0]);
        prop_assert_eq!(ab.text(), ba.text());
        prop_assert_eq!(ab.join(&ab).text(), ab.text());

        let left = ab.join(&replicas[2]);
        let right = replicas[0].join(&replicas[1].join(&replicas[2]));
        prop_assert_eq!(left.text(), right.text());
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_concurrent_inserts_at_start_converge() {
    let mut a = ReplicatedText::new("A");
    let mut b = ReplicatedText::new("B");
    a.insert(0, "x");
    b.insert(0, "y");

    let from_a = a.take_pending();
    let from_b = b.take_pending();
    for op in from_b {
        a.merge(op).unwrap();
    }
    for op in from_a {
        b.merge(op).unwrap();
    }

    assert_eq!(a.text(), b.text());
    assert_eq!(a.text(), "yx");
}

#[test]
fn test_stale_state_vector_receives_only_missing_ops() {
    let mut server = ReplicatedText::new("server");
    let mut client = ReplicatedText::new("client");

    client.insert(0, "hello");
    server.merge_all(client.take_pending());
    let stale = client.state_vector();

    // Client goes away; others keep editing.
    let mut other = ReplicatedText::new("other");
    other.merge_all(server.diff_since(&StateVector::new()));
    other.insert(5, " world");
    other.delete(0, 1);
    server.merge_all(other.take_pending());

    let missing = server.diff_since(&stale);
    assert_eq!(missing.len(), 7);
    assert!(missing
        .iter()
        .all(|op| op.replica() == &ReplicaId::new("other")));

    client.merge_all(missing);
    assert_eq!(client.text(), "ello world");
    assert_eq!(client.text(), server.text());
}

#[test]
fn test_brand_new_room_has_empty_snapshot() {
    let doc = ReplicatedText::new("server");
    let snapshot = doc.snapshot();
    assert!(snapshot.items.is_empty());
    assert!(snapshot.operations().is_empty());
    assert_eq!(snapshot.text(), "");
}

#[test]
fn test_insert_after_deleted_origin() {
    let mut a = ReplicatedText::new("a");
    let mut b = ReplicatedText::new("b");
    a.insert(0, "abc");
    b.merge_all(a.take_pending());

    // a deletes "b" while b types after it.
    a.delete(1, 1);
    b.insert(2, "X");

    let from_a = a.take_pending();
    let from_b = b.take_pending();
    a.merge_all(from_b);
    b.merge_all(from_a);

    assert_eq!(a.text(), "aXc");
    assert_eq!(b.text(), "aXc");
}

#[test]
fn test_chain_released_in_one_merge() {
    let mut a = ReplicatedText::new("a");
    a.insert(0, "abcd");
    let mut ops = a.take_pending();
    ops.reverse();

    let mut b = ReplicatedText::new("b");
    let mut outcomes: Vec<MergeOutcome> = ops.into_iter().map(|op| b.merge(op).unwrap()).collect();
    let last = outcomes.pop().unwrap();
    assert!(outcomes.iter().all(|o| *o == MergeOutcome::Buffered));
    match last {
        MergeOutcome::Applied(delta) => assert_eq!(delta.apply_to(""), "abcd"),
        other => panic!("expected applied, got {other:?}"),
    }
    assert_eq!(b.position_of(&OpId::new("a", 4)), Some(3));
}
