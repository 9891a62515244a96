//! The tagged `Operation` variant exchanged between replicas, and the
//! outcome of applying one remotely.

use serde::{Deserialize, Serialize};

use super::char_node::CharNode;
use super::id::SiteId;
use super::position::Position;

/// An operation produced locally and delivered to remote replicas, or
/// received from a remote replica for application. Validated at the
/// codec boundary before it ever reaches the CRDT.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Insert { node: CharNode, origin: SiteId },
    Delete { id: Position, origin: SiteId },
}

impl Operation {
    pub fn origin(&self) -> &SiteId {
        match self {
            Operation::Insert { origin, .. } => origin,
            Operation::Delete { origin, .. } => origin,
        }
    }
}

/// Outcome of `SequenceCRDT::apply_remote`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The operation mutated the sequence.
    Applied,
    /// An insert whose id already exists; a no-op, not an error.
    Duplicate,
    /// A delete whose target has not yet been inserted; buffered.
    Deferred,
    /// The operation was structurally invalid (e.g. a delete for a
    /// sentinel id).
    Invalid(String),
}
