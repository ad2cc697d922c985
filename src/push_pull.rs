use crate::datatype::StateOfDatatype;
use crate::operation::Operation;
use crate::{DatatypeId, DatatypeKind, ReplicaId};
use serde::{Deserialize, Serialize};

/// Synchronization progress for one datatype.
///
/// `sseq` is the highest relay sequence this replica has observed across all
/// replicas of the datatype; `cseq` is the highest of this replica's own
/// operation sequence numbers the relay has acknowledged. `cseq <= sseq`
/// always, and both only grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckPoint {
    pub sseq: u64,
    pub cseq: u64,
}

impl CheckPoint {
    pub fn new(sseq: u64, cseq: u64) -> Self {
        Self { sseq, cseq }
    }

    /// Element-wise max merge. Checkpoints never move backwards.
    pub fn merge(&mut self, other: &CheckPoint) {
        self.sseq = self.sseq.max(other.sseq);
        self.cseq = self.cseq.max(other.cseq);
    }
}

/// Bit-flag option set of a push-pull pack. Exactly the bits matching the
/// datatype's lifecycle state are set on outgoing packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushPullOptions(pub u32);

impl PushPullOptions {
    pub const NORMAL: PushPullOptions = PushPullOptions(0);
    pub const CREATE: PushPullOptions = PushPullOptions(1);
    pub const SUBSCRIBE: PushPullOptions = PushPullOptions(1 << 1);
    pub const UNSUBSCRIBE: PushPullOptions = PushPullOptions(1 << 2);
    pub const DELETE: PushPullOptions = PushPullOptions(1 << 3);
    pub const SNAPSHOT: PushPullOptions = PushPullOptions(1 << 4);
    pub const ERROR: PushPullOptions = PushPullOptions(1 << 5);

    #[must_use]
    pub fn with(self, other: PushPullOptions) -> PushPullOptions {
        PushPullOptions(self.0 | other.0)
    }

    pub fn contains(self, other: PushPullOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Derive the pending bits from the lifecycle state of the sender.
    pub fn for_state(state: StateOfDatatype) -> PushPullOptions {
        match state {
            StateOfDatatype::DueToCreate => Self::CREATE,
            StateOfDatatype::DueToSubscribe => Self::SUBSCRIBE,
            StateOfDatatype::DueToSubscribeCreate => Self::SUBSCRIBE.with(Self::CREATE),
            StateOfDatatype::DueToUnsubscribe => Self::UNSUBSCRIBE,
            _ => Self::NORMAL,
        }
    }
}

/// The unit exchanged with the relay for one datatype: checkpoint state plus
/// the buffered operations not yet acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullPack {
    pub id: DatatypeId,
    pub key: String,
    pub kind: DatatypeKind,
    pub checkpoint: CheckPoint,
    pub era: u32,
    pub option: PushPullOptions,
    pub operations: Vec<Operation>,
}

/// Request/reply envelope, keyed by a client-assigned exchange sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullRequest {
    pub client: ReplicaId,
    pub seq: u64,
    pub packs: Vec<PushPullPack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullResponse {
    pub seq: u64,
    pub packs: Vec<PushPullPack>,
}

/// Delivered over the notification channel when the relay observes a newer
/// sseq for a datatype. The receiver decides whether to re-sync by comparing
/// against its local checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncNotification {
    pub key: String,
    pub id: DatatypeId,
    pub sseq: u64,
}
