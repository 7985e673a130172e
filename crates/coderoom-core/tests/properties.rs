//! Lattice laws for the state vector.
//!
//!  - Commutativity: a ⊔ b = b ⊔ a
//!  - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//!  - Idempotence:  a ⊔ a = a
//!  - Bottom is identity: a ⊔ ⊥ = a

use coderoom_core::lattice::Lattice;
use coderoom_core::state_vector::StateVector;
use proptest::prelude::*;

fn state_vector_strategy() -> impl Strategy<Value = StateVector> {
    prop::collection::btree_map("[a-d]", 0u64..50, 0..4)
        .prop_map(|entries| StateVector::from_entries(entries))
}

proptest! {
    #[test]
    fn state_vector_join_is_commutative(
        a in state_vector_strategy(),
        b in state_vector_strategy()
    ) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn state_vector_join_is_associative(
        a in state_vector_strategy(),
        b in state_vector_strategy(),
        c in state_vector_strategy()
    ) {
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn state_vector_join_is_idempotent(a in state_vector_strategy()) {
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn state_vector_bottom_is_identity(a in state_vector_strategy()) {
        prop_assert_eq!(a.join(&StateVector::bottom()), a.clone());
        prop_assert_eq!(StateVector::bottom().join(&a), a);
    }

    #[test]
    fn join_dominates_both_inputs(
        a in state_vector_strategy(),
        b in state_vector_strategy()
    ) {
        let joined = a.join(&b);
        prop_assert!(joined.dominates(&a));
        prop_assert!(joined.dominates(&b));
        prop_assert!(a.leq(&joined));
    }

    #[test]
    fn nothing_missing_after_join(
        a in state_vector_strategy(),
        b in state_vector_strategy()
    ) {
        prop_assert!(a.missing_from(&a.join(&b)).is_empty());
    }
}
