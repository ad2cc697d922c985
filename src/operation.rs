use crate::{Error, ReplicaId, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Identity of a single operation: (era, lamport, replica, seq).
///
/// `era` increments on non-recoverable resets. Cross-replica ordering is
/// lexicographic on (era, lamport); `seq` counts this replica's operations and
/// is only used for buffer slicing against the checkpoint, never for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub era: u32,
    pub lamport: u64,
    pub replica: ReplicaId,
    pub seq: u64,
}

impl OperationId {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            era: 0,
            lamport: 0,
            replica,
            seq: 0,
        }
    }

    /// Advance the clock for an operation about to execute locally. Called
    /// exactly once per local operation; the result is strictly greater than
    /// its predecessor.
    pub fn next(&mut self) -> OperationId {
        self.lamport += 1;
        self.seq += 1;
        *self
    }

    /// Reconcile the local lamport clock against an observed remote value.
    /// Adopts the remote value if the local clock is behind, otherwise ticks,
    /// so the local clock never falls behind a clock it has observed.
    pub fn sync_lamport(&mut self, remote: u64) -> u64 {
        if self.lamport < remote {
            self.lamport = remote;
        } else {
            self.lamport += 1;
        }
        self.lamport
    }

    /// Ordering by (era, lamport) only. Used for deterministic display and
    /// debugging; merge correctness never depends on it.
    pub fn compare(a: &OperationId, b: &OperationId) -> Ordering {
        (a.era, a.lamport).cmp(&(b.era, b.lamport))
    }
}

/// Closed set of operation kinds. Payloads dispatch on the tag and must
/// reject kinds they do not understand with a `TypeMismatch` error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationBody {
    /// Commutative counter delta.
    IncreaseBy { delta: i64 },
    /// Transaction marker delimiting an atomic group. `num_ops` counts the
    /// member operations that follow the marker contiguously.
    Transaction {
        tag: String,
        marker: Uuid,
        num_ops: u32,
    },
    /// Full payload state, bincode-encoded by the payload that produced it.
    Snapshot { state: Vec<u8> },
}

impl OperationBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperationBody::IncreaseBy { .. } => "increase_by",
            OperationBody::Transaction { .. } => "transaction",
            OperationBody::Snapshot { .. } => "snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub body: OperationBody,
}

impl Operation {
    pub fn new(id: OperationId, body: OperationBody) -> Self {
        Self { id, body }
    }

    pub fn is_transaction_marker(&self) -> bool {
        matches!(self.body, OperationBody::Transaction { .. })
    }
}

/// Split a flat operation sequence into atomic groups. A transaction marker
/// consumes itself plus its declared member count of followers; any other
/// operation is its own singleton group. Applied identically to received
/// packs and to in-memory operation lists.
pub fn group_operations(ops: &[Operation]) -> Result<Vec<&[Operation]>> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < ops.len() {
        if let OperationBody::Transaction { num_ops, .. } = &ops[i].body {
            let n = *num_ops as usize;
            if i + 1 + n > ops.len() {
                return Err(Error::TransactionValidation {
                    reason: format!(
                        "marker declares {} member(s) but only {} operation(s) follow it",
                        n,
                        ops.len() - i - 1
                    ),
                });
            }
            groups.push(&ops[i..=i + n]);
            i += 1 + n;
        } else {
            groups.push(&ops[i..=i]);
            i += 1;
        }
    }
    Ok(groups)
}
