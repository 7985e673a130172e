//! # coderoom-core
//!
//! Shared building blocks for the Coderoom crates:
//!
//! - [`ids`] - replica, operation, connection and room identifiers
//! - [`state_vector`] - per-replica "highest contiguous counter seen" summaries
//! - [`lattice`] - the join-semilattice trait convergent types implement
//! - [`observer`] - a small publish registry for change notifications

pub mod ids;
pub mod lattice;
pub mod observer;
pub mod state_vector;

pub use ids::{ConnectionId, OpId, ReplicaId, RoomId};
pub use lattice::Lattice;
pub use observer::{Observers, SubscriptionId};
pub use state_vector::StateVector;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
