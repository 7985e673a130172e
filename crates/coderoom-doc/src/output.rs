//! The room's run output: the code snapshot last executed by anyone in the
//! room, shown to every participant.
//!
//! A run replaces the whole snapshot, so the output is a last-writer-wins
//! register rather than a text sequence. Writes are ordered by a lamport
//! clock with the replica id breaking ties; clearing is a write of the empty
//! snapshot.

use coderoom_core::ReplicaId;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// One write to the run output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputUpdate {
    /// Executed source; empty once cleared.
    pub code: String,
    pub clock: u64,
    pub replica: ReplicaId,
}

impl OutputUpdate {
    fn supersedes(&self, other: &OutputUpdate) -> bool {
        (self.clock, &self.replica) > (other.clock, &other.replica)
    }

    pub fn is_cleared(&self) -> bool {
        self.code.is_empty()
    }
}

/// One replica's view of the run output.
#[derive(Clone, Debug)]
pub struct SharedOutput {
    replica: ReplicaId,
    clock: u64,
    current: Option<OutputUpdate>,
}

impl SharedOutput {
    pub fn new(replica: impl Into<ReplicaId>) -> Self {
        Self {
            replica: replica.into(),
            clock: 0,
            current: None,
        }
    }

    /// Writes made after this carry the new replica id.
    pub fn set_replica(&mut self, replica: ReplicaId) {
        self.replica = replica;
    }

    /// Publish `code` as the latest run. Returns the update to send.
    pub fn run(&mut self, code: impl Into<String>) -> OutputUpdate {
        self.clock += 1;
        let update = OutputUpdate {
            code: code.into(),
            clock: self.clock,
            replica: self.replica.clone(),
        };
        self.current = Some(update.clone());
        update
    }

    pub fn clear(&mut self) -> OutputUpdate {
        self.run(String::new())
    }

    /// Merge a remote write. Returns `true` when it replaced the output.
    pub fn apply_remote(&mut self, update: &OutputUpdate) -> bool {
        self.clock = self.clock.max(update.clock);
        let newer = self
            .current
            .as_ref()
            .map_or(true, |current| update.supersedes(current));
        if newer {
            self.current = Some(update.clone());
        } else {
            trace!(clock = update.clock, replica = %update.replica, "Stale output update ignored");
        }
        newer
    }

    /// The executed snapshot, empty when nothing has run or it was cleared.
    pub fn code(&self) -> &str {
        self.current.as_ref().map_or("", |update| update.code.as_str())
    }

    /// The winning write, for handing to a late joiner.
    pub fn state(&self) -> Option<&OutputUpdate> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_and_clear() {
        let mut output = SharedOutput::new("r1");
        assert_eq!(output.code(), "");
        assert!(output.state().is_none());

        let update = output.run("console.log(1)");
        assert_eq!(update.clock, 1);
        assert_eq!(output.code(), "console.log(1)");

        let cleared = output.clear();
        assert!(cleared.is_cleared());
        assert_eq!(cleared.clock, 2);
        assert_eq!(output.code(), "");
    }

    #[test]
    fn test_concurrent_runs_converge() {
        let mut a = SharedOutput::new("alice");
        let mut b = SharedOutput::new("bob");
        let from_a = a.run("a()");
        let from_b = b.run("b()");

        // Same clock: the larger replica id wins on both sides.
        assert!(a.apply_remote(&from_b));
        assert!(!b.apply_remote(&from_a));
        assert_eq!(a.code(), b.code());
        assert_eq!(a.code(), "b()");

        // A later clear from alice beats bob's run.
        let clear = a.clear();
        assert!(b.apply_remote(&clear));
        assert_eq!(b.code(), "");
        assert!(!b.apply_remote(&from_b));
    }

    #[test]
    fn test_wire_shape() {
        let update = OutputUpdate {
            code: "x".into(),
            clock: 3,
            replica: ReplicaId::new("r1"),
        };
        let json: serde_json::Value = serde_json::to_value(&update).unwrap();
        assert_eq!(json["code"], "x");
        assert_eq!(json["clock"], 3);
        assert_eq!(json["replica"], "r1");
    }
}
