//! Operations exchanged between replicas of a document.

use crate::error::{DocError, Result};
use coderoom_core::{OpId, ReplicaId};
use serde::{Deserialize, Serialize};

/// An immutable edit originated by one replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Insert `value` immediately after `origin` (`None` = document start).
    Insert {
        id: OpId,
        origin: Option<OpId>,
        /// Lamport timestamp used to order siblings sharing an origin.
        lamport: u64,
        value: char,
    },
    /// Tombstone the character inserted by `target`.
    Delete { id: OpId, target: OpId },
}

impl Operation {
    pub fn id(&self) -> &OpId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => id,
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.id().replica
    }

    pub fn lamport(&self) -> u64 {
        match self {
            Operation::Insert { lamport, .. } => *lamport,
            Operation::Delete { .. } => 0,
        }
    }

    /// The operation that must be integrated before this one can apply.
    pub fn dependency(&self) -> Option<&OpId> {
        match self {
            Operation::Insert { origin, .. } => origin.as_ref(),
            Operation::Delete { target, .. } => Some(target),
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }

    /// Structural checks performed before an operation touches any state.
    pub fn validate(&self) -> Result<()> {
        let id = self.id();
        if id.replica.is_empty() || id.seq == 0 {
            return Err(DocError::MalformedOperation(format!(
                "missing operation id ({id})"
            )));
        }
        match self {
            Operation::Insert { origin, lamport, .. } => {
                if let Some(origin) = origin {
                    if origin == id {
                        return Err(DocError::MalformedOperation(format!(
                            "insert {id} references itself"
                        )));
                    }
                    if origin.replica.is_empty() || origin.seq == 0 {
                        return Err(DocError::MalformedOperation(format!(
                            "insert {id} has an invalid origin"
                        )));
                    }
                }
                if *lamport == 0 {
                    return Err(DocError::MalformedOperation(format!(
                        "insert {id} carries no lamport timestamp"
                    )));
                }
            }
            Operation::Delete { target, .. } => {
                if target == id || target.replica.is_empty() || target.seq == 0 {
                    return Err(DocError::MalformedOperation(format!(
                        "delete {id} has an invalid target"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decode and validate an operation received as JSON.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let op: Operation = serde_json::from_slice(bytes)
            .map_err(|e| DocError::MalformedOperation(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
