use crate::datatype::BaseDatatype;
use crate::operation::{Operation, OperationBody};
use crate::push_pull::{CheckPoint, PushPullOptions, PushPullPack};
use crate::{DatatypeKind, ReplicaId};

/// Wraps the base datatype with the synchronization checkpoint and the
/// outgoing operation log, and translates between the two and the relay's
/// push-pull packs.
#[derive(Debug)]
pub(crate) struct WiredDatatype {
    pub(crate) base: BaseDatatype,
    pub(crate) checkpoint: CheckPoint,
    /// Append-only log of locally committed operations, tagged by their
    /// `OperationId.seq`. Acknowledged entries are excluded from outgoing
    /// packs by cseq arithmetic, never physically truncated, so rollback
    /// replay can still reference them.
    buffer: Vec<Operation>,
    pending_delete: bool,
}

impl WiredDatatype {
    pub fn new(key: impl Into<String>, kind: DatatypeKind, replica: ReplicaId) -> Self {
        Self {
            base: BaseDatatype::new(key, kind, replica),
            checkpoint: CheckPoint::default(),
            buffer: Vec::new(),
            pending_delete: false,
        }
    }

    /// Append a committed local batch to the outgoing log.
    pub fn deliver(&mut self, ops: &[Operation]) {
        self.buffer.extend_from_slice(ops);
    }

    pub fn request_delete(&mut self) {
        self.pending_delete = true;
    }

    /// Does the relay hold operations this replica has not pulled yet?
    pub fn needs_sync(&self, notified_sseq: u64) -> bool {
        notified_sseq > self.checkpoint.sseq
    }

    /// Build the outgoing pack: unacknowledged buffered operations plus a
    /// proposed cseq of `cseq + included`.
    pub fn create_push_pull_pack(&self) -> PushPullPack {
        let operations: Vec<Operation> = self
            .buffer
            .iter()
            .filter(|op| op.id.seq > self.checkpoint.cseq)
            .cloned()
            .collect();
        let mut option = PushPullOptions::for_state(self.base.state());
        if self.pending_delete {
            option = option.with(PushPullOptions::DELETE);
        }
        if operations
            .iter()
            .any(|op| matches!(op.body, OperationBody::Snapshot { .. }))
        {
            option = option.with(PushPullOptions::SNAPSHOT);
        }
        PushPullPack {
            id: self.base.id(),
            key: self.base.key().to_string(),
            kind: self.base.kind(),
            checkpoint: CheckPoint::new(
                self.checkpoint.sseq,
                self.checkpoint.cseq + operations.len() as u64,
            ),
            era: self.base.era(),
            option,
            operations,
        }
    }

    /// Count of genuinely new operations in a reply pack: the relay's sseq
    /// advance minus the portion that acknowledges this replica's own pushes.
    pub fn pulled_count(&self, pack: &PushPullPack) -> usize {
        let advance = pack.checkpoint.sseq.saturating_sub(self.checkpoint.sseq);
        let acked = pack.checkpoint.cseq.saturating_sub(self.checkpoint.cseq);
        usize::try_from(advance.saturating_sub(acked)).unwrap_or(usize::MAX)
    }

    /// Drop the leading echoed entries (operations this replica pushed and
    /// the relay bounced back) and return the genuinely new remainder.
    pub fn dedup<'a>(&self, pack: &'a PushPullPack) -> &'a [Operation] {
        let pulled = self.pulled_count(pack);
        if pack.operations.len() > pulled {
            let skip = pack.operations.len() - pulled;
            tracing::debug!(
                key = self.base.key(),
                skip,
                total = pack.operations.len(),
                "dropping echoed operations"
            );
            &pack.operations[skip..]
        } else {
            &pack.operations
        }
    }

    pub fn merge_checkpoint(&mut self, remote: &CheckPoint) {
        self.checkpoint.merge(remote);
    }
}
