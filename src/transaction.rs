use crate::datatype::{Payload, StateOfDatatype};
use crate::operation::{group_operations, Operation, OperationBody, OperationId};
use crate::push_pull::{CheckPoint, PushPullOptions, PushPullPack};
use crate::registry::SyncedDatatype;
use crate::wired::WiredDatatype;
use crate::{DatatypeId, DatatypeKind, Error, ReplicaId, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Wraps a wired datatype with a mutual-exclusion discipline, a rollback
/// snapshot and an operation buffer, turning local calls and received
/// operation groups into atomic, lockable transactions.
///
/// The mutex is the sole serialization point for a datatype instance: at most
/// one transaction, local or remote, mutates the payload and the outgoing log
/// at any time. A transaction context carries both a monotonic token and the
/// mutex guard itself, so re-entrant helpers inside an open user transaction
/// operate on the open context instead of re-locking.
#[derive(Debug)]
pub struct TransactionDatatype<P: Payload> {
    state: Mutex<TxnState<P>>,
    next_token: AtomicU64,
}

#[derive(Debug)]
struct TxnState<P: Payload> {
    wired: WiredDatatype,
    payload: P,
    active_token: Option<u64>,
    /// Payload state at the last point rollback can restore to directly.
    good_snapshot: P::Snapshot,
    /// Operation clock at the last successful commit.
    good_op_id: OperationId,
    /// Operations committed since `good_snapshot`, replayed during rollback.
    replay_ops: Vec<Operation>,
}

/// One active transaction. Exclusively owned for its lifetime; holding it
/// holds the datatype lock.
#[derive(Debug)]
pub struct TransactionContext<'a, P: Payload> {
    state: MutexGuard<'a, TxnState<P>>,
    token: u64,
    ops: Vec<Operation>,
    has_marker: bool,
    failed: bool,
}

impl<P: Payload> TransactionContext<'_, P> {
    /// Execute an operation produced at this replica: assign the next
    /// operation id, run the payload's local handler, buffer the operation
    /// for outgoing delivery.
    ///
    /// A handler failure poisons the whole transaction, even if the caller
    /// swallows the returned error, so a rollback always retracts the
    /// operation id the failed operation consumed.
    pub(crate) fn execute_local(&mut self, body: OperationBody) -> Result<()> {
        let id = self.state.wired.base.next_operation_id();
        let op = Operation::new(id, body);
        if let Err(e) = self.state.payload.execute_local(&op) {
            self.failed = true;
            return Err(e);
        }
        self.ops.push(op);
        Ok(())
    }

    pub(crate) fn payload(&self) -> &P {
        &self.state.payload
    }
}

impl<P: Payload> TransactionDatatype<P> {
    pub(crate) fn new(
        key: impl Into<String>,
        kind: DatatypeKind,
        replica: ReplicaId,
        payload: P,
    ) -> Self {
        let wired = WiredDatatype::new(key, kind, replica);
        let good_snapshot = payload.snapshot();
        let good_op_id = wired.base.operation_id();
        Self {
            state: Mutex::new(TxnState {
                wired,
                payload,
                active_token: None,
                good_snapshot,
                good_op_id,
                replay_ops: Vec::new(),
            }),
            next_token: AtomicU64::new(0),
        }
    }

    /// Open a transaction: take the lock, mint a token and, for user
    /// transactions, synthesize a marker operation with a fresh unique id.
    /// The marker's member count is stamped at commit time.
    fn begin_transaction(&self, tag: &str, with_marker: bool) -> Result<TransactionContext<'_, P>> {
        let mut state = self.state.lock();
        state.wired.base.ensure_writable("begin transaction")?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        state.active_token = Some(token);
        tracing::debug!(key = state.wired.base.key(), token, tag, "transaction begin");
        let mut ctx = TransactionContext {
            state,
            token,
            ops: Vec::new(),
            has_marker: false,
            failed: false,
        };
        if with_marker {
            let id = ctx.state.wired.base.next_operation_id();
            ctx.ops.push(Operation::new(
                id,
                OperationBody::Transaction {
                    tag: tag.to_string(),
                    marker: Uuid::new_v4(),
                    num_ops: 0,
                },
            ));
            ctx.has_marker = true;
        }
        Ok(ctx)
    }

    /// Close a transaction. Only the currently active context is accepted.
    /// On success the marker is stamped with the final member count and the
    /// batch goes to the replay list and the outgoing log. On failure the
    /// payload is rolled back. The lock is released and the active token
    /// cleared on every path.
    fn end_transaction(&self, ctx: TransactionContext<'_, P>) -> Result<()> {
        let TransactionContext {
            mut state,
            token,
            mut ops,
            has_marker,
            failed,
        } = ctx;
        if state.active_token != Some(token) {
            return Err(Error::TransactionValidation {
                reason: "context is not the active transaction".to_string(),
            });
        }
        let result = if failed {
            tracing::warn!(key = state.wired.base.key(), token, "transaction failed, rolling back");
            rollback(&mut state)
        } else {
            if has_marker {
                if ops.len() == 1 {
                    // Empty user transaction: retract the marker and its
                    // clock tick so the outgoing sequence stays gapless.
                    let good_op_id = state.good_op_id;
                    state.wired.base.set_operation_id(good_op_id);
                    ops.clear();
                } else {
                    let members = u32::try_from(ops.len() - 1).unwrap_or(u32::MAX);
                    if let OperationBody::Transaction { num_ops, .. } = &mut ops[0].body {
                        *num_ops = members;
                    }
                }
            }
            if !ops.is_empty() {
                state.replay_ops.extend(ops.iter().cloned());
                state.wired.deliver(&ops);
            }
            state.good_op_id = state.wired.base.operation_id();
            tracing::debug!(key = state.wired.base.key(), token, ops = ops.len(), "transaction committed");
            Ok(())
        };
        state.active_token = None;
        result
    }

    /// Run `f` inside a transaction. Any error from `f`, or any operation
    /// failure inside it, marks the transaction failed and triggers rollback
    /// before the error is surfaced. Rollback failures take precedence: they
    /// mean the payload is indeterminate.
    pub(crate) fn run_transaction<R>(
        &self,
        tag: &str,
        with_marker: bool,
        f: impl FnOnce(&mut TransactionContext<'_, P>) -> Result<R>,
    ) -> Result<R> {
        let mut ctx = self.begin_transaction(tag, with_marker)?;
        match f(&mut ctx) {
            Ok(value) if !ctx.failed => {
                self.end_transaction(ctx)?;
                Ok(value)
            }
            Ok(_) => {
                // An operation failed but the closure swallowed the error.
                self.end_transaction(ctx)?;
                Err(Error::TransactionValidation {
                    reason: "transaction poisoned by a failed operation".to_string(),
                })
            }
            Err(e) => {
                ctx.failed = true;
                self.end_transaction(ctx)?;
                Err(e)
            }
        }
    }

    /// Apply one atomic group of received operations under the datatype lock.
    pub fn execute_remote_transaction(&self, ops: &[Operation]) -> Result<()> {
        let mut state = self.state.lock();
        apply_remote_group(&mut state, ops)
    }

    pub(crate) fn request_create(&self) -> Result<()> {
        self.state.lock().wired.base.request_create()
    }

    pub(crate) fn request_subscribe(&self) -> Result<()> {
        self.state.lock().wired.base.request_subscribe()
    }

    pub(crate) fn request_subscribe_or_create(&self) -> Result<()> {
        self.state.lock().wired.base.request_subscribe_or_create()
    }

    pub(crate) fn with_payload<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.state.lock().payload)
    }

    pub fn operation_id(&self) -> OperationId {
        self.state.lock().wired.base.operation_id()
    }

    pub fn checkpoint(&self) -> CheckPoint {
        self.state.lock().wired.checkpoint
    }
}

/// Restore the payload to the last known-good snapshot and replay every
/// committed operation since, all or nothing. If replay itself fails the
/// pre-rollback state is reinstated and the failure escalated: the payload is
/// then indeterminate relative to the engine's bookkeeping.
fn rollback<P: Payload>(state: &mut TxnState<P>) -> Result<()> {
    let redo_snapshot = state.payload.snapshot();
    let redo_op_id = state.wired.base.operation_id();
    state.payload.restore(state.good_snapshot.clone());
    for i in 0..state.replay_ops.len() {
        if state.replay_ops[i].is_transaction_marker() {
            continue;
        }
        let op = state.replay_ops[i].clone();
        if let Err(e) = state.payload.execute_local(&op) {
            state.payload.restore(redo_snapshot);
            state.wired.base.set_operation_id(redo_op_id);
            return Err(Error::RollbackFailed {
                reason: e.to_string(),
            });
        }
    }
    let good_op_id = state.good_op_id;
    state.wired.base.set_operation_id(good_op_id);
    state.good_snapshot = state.payload.snapshot();
    state.replay_ops.clear();
    tracing::debug!(key = state.wired.base.key(), "rollback complete");
    Ok(())
}

/// Validate and apply one received group: a multi-operation group must open
/// with a marker whose declared member count matches, and the whole group is
/// applied under one lock hold so it can never interleave with a local
/// transaction.
fn apply_remote_group<P: Payload>(state: &mut TxnState<P>, ops: &[Operation]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    if ops.len() > 1 {
        match &ops[0].body {
            OperationBody::Transaction { num_ops, .. } if *num_ops as usize == ops.len() - 1 => {}
            OperationBody::Transaction { num_ops, .. } => {
                return Err(Error::TransactionValidation {
                    reason: format!(
                        "marker declares {} member(s), group carries {}",
                        num_ops,
                        ops.len() - 1
                    ),
                });
            }
            _ => {
                return Err(Error::TransactionValidation {
                    reason: "multi-operation group without a leading marker".to_string(),
                });
            }
        }
    }
    for op in ops {
        state.wired.base.sync_lamport(op.id.lamport);
        if !op.is_transaction_marker() {
            state.payload.execute_remote(op)?;
        }
    }
    state.replay_ops.extend(ops.iter().cloned());
    state.good_op_id = state.wired.base.operation_id();
    Ok(())
}

impl<P: Payload> SyncedDatatype for TransactionDatatype<P> {
    fn key(&self) -> String {
        self.state.lock().wired.base.key().to_string()
    }

    fn kind(&self) -> DatatypeKind {
        self.state.lock().wired.base.kind()
    }

    fn id(&self) -> DatatypeId {
        self.state.lock().wired.base.id()
    }

    fn state_of(&self) -> StateOfDatatype {
        self.state.lock().wired.base.state()
    }

    fn create_push_pull_pack(&self) -> PushPullPack {
        self.state.lock().wired.create_push_pull_pack()
    }

    /// Reconcile a reply pack, in order: deduplicate echoed operations,
    /// apply the surviving groups through the remote path, then commit the
    /// checkpoint merge and any lifecycle transition. A failing group
    /// rewinds the groups applied before it, and the checkpoint is only
    /// merged once every group applied, so a failed exchange leaves the
    /// engine exactly as it was and the same pack can be retried wholesale.
    fn apply_push_pull_pack(&self, pack: PushPullPack) -> Result<()> {
        let mut state = self.state.lock();
        if pack.option.contains(PushPullOptions::ERROR) {
            return Err(Error::PushPullAborted { key: pack.key });
        }
        if state.wired.base.state().is_terminal() {
            return Err(Error::InvalidState {
                state: state.wired.base.state(),
                operation: "apply push-pull pack",
            });
        }

        let surviving: Vec<Operation> = state.wired.dedup(&pack).to_vec();
        let groups = group_operations(&surviving)?;
        tracing::debug!(
            key = %pack.key,
            received = pack.operations.len(),
            surviving = surviving.len(),
            groups = groups.len(),
            "applying push-pull pack"
        );
        let rewind_snapshot = state.payload.snapshot();
        let rewind_op_id = state.wired.base.operation_id();
        let rewind_replay = state.replay_ops.len();
        let rewind_good_op_id = state.good_op_id;
        for group in &groups {
            if let Err(e) = apply_remote_group(&mut state, group) {
                state.payload.restore(rewind_snapshot);
                state.wired.base.set_operation_id(rewind_op_id);
                state.replay_ops.truncate(rewind_replay);
                state.good_op_id = rewind_good_op_id;
                return Err(e);
            }
        }

        state.wired.merge_checkpoint(&pack.checkpoint);
        if state.wired.base.state().is_due_to_attach() {
            state.wired.base.to_subscribed(pack.id, pack.era);
        }
        if pack.option.contains(PushPullOptions::DELETE) {
            state.wired.base.to_deleted();
        } else if pack.option.contains(PushPullOptions::UNSUBSCRIBE)
            && state.wired.base.state() == StateOfDatatype::DueToUnsubscribe
        {
            state.wired.base.to_unsubscribed();
        }
        Ok(())
    }

    fn needs_sync(&self, notified_sseq: u64) -> bool {
        self.state.lock().wired.needs_sync(notified_sseq)
    }

    fn request_unsubscribe(&self) -> Result<()> {
        self.state.lock().wired.base.request_unsubscribe()
    }

    fn request_delete(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.wired.base.ensure_writable("request delete")?;
        state.wired.request_delete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterState;

    fn counter_datatype() -> TransactionDatatype<CounterState> {
        TransactionDatatype::new(
            "tests/counter",
            DatatypeKind::Counter,
            ReplicaId::new(),
            CounterState::default(),
        )
    }

    fn value(dt: &TransactionDatatype<CounterState>) -> i64 {
        dt.with_payload(CounterState::value)
    }

    fn remote_increase(replica: ReplicaId, lamport: u64, seq: u64, delta: i64) -> Operation {
        Operation::new(
            OperationId {
                era: 0,
                lamport,
                replica,
                seq,
            },
            OperationBody::IncreaseBy { delta },
        )
    }

    #[test]
    fn test_implicit_transaction_executes_and_buffers() {
        let dt = counter_datatype();
        dt.run_transaction("", false, |ctx| {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 5 })
        })
        .unwrap();
        assert_eq!(value(&dt), 5);

        let pack = dt.create_push_pull_pack();
        assert_eq!(pack.operations.len(), 1);
        assert_eq!(pack.checkpoint.cseq, 1);
    }

    #[test]
    fn test_user_transaction_stamps_marker() {
        let dt = counter_datatype();
        dt.run_transaction("batch", true, |ctx| {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 1 })?;
            ctx.execute_local(OperationBody::IncreaseBy { delta: 2 })?;
            Ok(())
        })
        .unwrap();
        assert_eq!(value(&dt), 3);

        let pack = dt.create_push_pull_pack();
        assert_eq!(pack.operations.len(), 3);
        match &pack.operations[0].body {
            OperationBody::Transaction { tag, num_ops, .. } => {
                assert_eq!(tag, "batch");
                assert_eq!(*num_ops, 2);
            }
            other => panic!("expected leading marker, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_user_transaction_emits_nothing() {
        let dt = counter_datatype();
        let before = dt.operation_id();
        dt.run_transaction("noop", true, |_ctx| Ok(())).unwrap();
        assert_eq!(dt.operation_id(), before);
        assert!(dt.create_push_pull_pack().operations.is_empty());
    }

    #[test]
    fn test_failed_transaction_rolls_back_value_and_clock() {
        let dt = counter_datatype();
        dt.run_transaction("", false, |ctx| {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 7 })
        })
        .unwrap();
        let committed_op_id = dt.operation_id();

        let err = dt.run_transaction("failing", true, |ctx| -> Result<()> {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 100 })?;
            Err(Error::Other(anyhow::anyhow!("application rejected")))
        });
        assert!(err.is_err());

        // Exactly the pre-transaction state, value for value.
        assert_eq!(value(&dt), 7);
        assert_eq!(dt.operation_id(), committed_op_id);
        // And nothing from the failed transaction leaks into the outgoing log.
        let pack = dt.create_push_pull_pack();
        assert_eq!(pack.operations.len(), 1);
    }

    #[test]
    fn test_rollback_replays_committed_history() {
        let dt = counter_datatype();
        for delta in [1, 2, 3] {
            dt.run_transaction("", false, |ctx| {
                ctx.execute_local(OperationBody::IncreaseBy { delta })
            })
            .unwrap();
        }
        let _ = dt.run_transaction("fail", true, |ctx| -> Result<()> {
            ctx.execute_local(OperationBody::IncreaseBy { delta: -100 })?;
            Err(Error::Other(anyhow::anyhow!("no")))
        });
        // All three committed operations survive the rollback replay.
        assert_eq!(value(&dt), 6);
    }

    #[test]
    fn test_poisoned_transaction_fails_even_if_error_swallowed() {
        let dt = counter_datatype();
        let result = dt.run_transaction("swallow", true, |ctx| {
            // Counters do not understand raw snapshot garbage.
            let _ = ctx.execute_local(OperationBody::Snapshot {
                state: vec![0xff],
            });
            Ok(())
        });
        assert!(matches!(result, Err(Error::TransactionValidation { .. })));
        assert_eq!(value(&dt), 0);
    }

    #[test]
    fn test_remote_group_applies_and_syncs_clock() {
        let dt = counter_datatype();
        let other = ReplicaId::new();
        dt.execute_remote_transaction(&[remote_increase(other, 41, 1, 4)])
            .unwrap();
        assert_eq!(value(&dt), 4);
        // Local clock adopted the observed remote lamport.
        assert!(dt.operation_id().lamport >= 41);
        // Remote operations are not buffered for resend.
        assert!(dt.create_push_pull_pack().operations.is_empty());
    }

    #[test]
    fn test_remote_group_count_mismatch_rejected() {
        let dt = counter_datatype();
        let other = ReplicaId::new();
        let marker = Operation::new(
            OperationId {
                era: 0,
                lamport: 1,
                replica: other,
                seq: 1,
            },
            OperationBody::Transaction {
                tag: "t".to_string(),
                marker: Uuid::new_v4(),
                num_ops: 3,
            },
        );
        let ops = vec![
            marker,
            remote_increase(other, 2, 2, 1),
            remote_increase(other, 3, 3, 1),
        ];
        let err = dt.execute_remote_transaction(&ops).unwrap_err();
        assert!(matches!(err, Error::TransactionValidation { .. }));
    }

    #[test]
    fn test_remote_group_without_marker_rejected() {
        let dt = counter_datatype();
        let other = ReplicaId::new();
        let ops = vec![
            remote_increase(other, 1, 1, 1),
            remote_increase(other, 2, 2, 1),
        ];
        let err = dt.execute_remote_transaction(&ops).unwrap_err();
        assert!(matches!(err, Error::TransactionValidation { .. }));
    }

    #[test]
    fn test_local_rollback_preserves_applied_remote_operations() {
        let dt = counter_datatype();
        let other = ReplicaId::new();
        dt.execute_remote_transaction(&[remote_increase(other, 1, 1, 10)])
            .unwrap();
        let _ = dt.run_transaction("fail", true, |ctx| -> Result<()> {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 5 })?;
            Err(Error::Other(anyhow::anyhow!("no")))
        });
        assert_eq!(value(&dt), 10);
    }

    #[test]
    fn test_apply_push_pull_pack_dedups_and_commits() {
        let dt = counter_datatype();
        dt.request_create().unwrap();
        let me = dt.operation_id().replica;

        // Push one local operation, then receive a reply that echoes it
        // followed by two foreign operations.
        dt.run_transaction("", false, |ctx| {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 1 })
        })
        .unwrap();
        let sent = dt.create_push_pull_pack();
        assert_eq!(sent.operations.len(), 1);

        let other = ReplicaId::new();
        let relay_id = DatatypeId::new();
        let reply = PushPullPack {
            id: relay_id,
            key: "tests/counter".to_string(),
            kind: DatatypeKind::Counter,
            checkpoint: CheckPoint::new(3, 1),
            era: 0,
            option: PushPullOptions::NORMAL,
            operations: vec![
                sent.operations[0].clone(),
                remote_increase(other, 5, 1, 10),
                remote_increase(other, 6, 2, 100),
            ],
        };
        dt.apply_push_pull_pack(reply).unwrap();

        // Own echo dropped, both foreign deltas applied exactly once.
        assert_eq!(value(&dt), 111);
        assert_eq!(dt.checkpoint(), CheckPoint::new(3, 1));
        assert_eq!(dt.state_of(), StateOfDatatype::Subscribed);
        assert_eq!(SyncedDatatype::id(&dt), relay_id);
        assert_eq!(dt.operation_id().replica, me);
    }

    #[test]
    fn test_reapplying_same_pack_is_idempotent() {
        let dt = counter_datatype();
        dt.request_subscribe().unwrap();
        let other = ReplicaId::new();
        let reply = PushPullPack {
            id: DatatypeId::new(),
            key: "tests/counter".to_string(),
            kind: DatatypeKind::Counter,
            checkpoint: CheckPoint::new(2, 0),
            era: 0,
            option: PushPullOptions::NORMAL,
            operations: vec![
                remote_increase(other, 1, 1, 1),
                remote_increase(other, 2, 2, 1),
            ],
        };
        dt.apply_push_pull_pack(reply.clone()).unwrap();
        assert_eq!(value(&dt), 2);
        // Duplicate delivery: checkpoint math classifies everything as known.
        dt.apply_push_pull_pack(reply).unwrap();
        assert_eq!(value(&dt), 2);
        assert_eq!(dt.checkpoint(), CheckPoint::new(2, 0));
    }

    #[test]
    fn test_error_pack_leaves_state_untouched() {
        let dt = counter_datatype();
        dt.request_create().unwrap();
        let before = dt.checkpoint();
        let reply = PushPullPack {
            id: DatatypeId::new(),
            key: "tests/counter".to_string(),
            kind: DatatypeKind::Counter,
            checkpoint: CheckPoint::new(9, 9),
            era: 0,
            option: PushPullOptions::ERROR,
            operations: Vec::new(),
        };
        let err = dt.apply_push_pull_pack(reply).unwrap_err();
        assert!(matches!(err, Error::PushPullAborted { .. }));
        assert_eq!(dt.checkpoint(), before);
        assert_eq!(dt.state_of(), StateOfDatatype::DueToCreate);
    }

    #[test]
    fn test_invalid_group_leaves_checkpoint_untouched() {
        let dt = counter_datatype();
        dt.request_subscribe().unwrap();
        let other = ReplicaId::new();
        let marker = Operation::new(
            OperationId {
                era: 0,
                lamport: 1,
                replica: other,
                seq: 1,
            },
            OperationBody::Transaction {
                tag: "t".to_string(),
                marker: Uuid::new_v4(),
                num_ops: 5,
            },
        );
        let reply = PushPullPack {
            id: DatatypeId::new(),
            key: "tests/counter".to_string(),
            kind: DatatypeKind::Counter,
            checkpoint: CheckPoint::new(2, 0),
            era: 0,
            option: PushPullOptions::NORMAL,
            operations: vec![marker, remote_increase(other, 2, 2, 1)],
        };
        let err = dt.apply_push_pull_pack(reply).unwrap_err();
        assert!(matches!(err, Error::TransactionValidation { .. }));
        assert_eq!(dt.checkpoint(), CheckPoint::default());
        assert_eq!(value(&dt), 0);
        // Still awaiting the relay: the failed pack must not subscribe us.
        assert_eq!(dt.state_of(), StateOfDatatype::DueToSubscribe);
    }

    #[test]
    fn test_failed_group_rewinds_earlier_groups() {
        let dt = counter_datatype();
        dt.request_subscribe().unwrap();
        let other = ReplicaId::new();
        let before_op_id = dt.operation_id();
        // A good singleton group followed by a snapshot group whose bytes do
        // not decode: the second group fails after the first has applied.
        let reply = PushPullPack {
            id: DatatypeId::new(),
            key: "tests/counter".to_string(),
            kind: DatatypeKind::Counter,
            checkpoint: CheckPoint::new(2, 0),
            era: 0,
            option: PushPullOptions::NORMAL,
            operations: vec![
                remote_increase(other, 1, 1, 1),
                Operation::new(
                    OperationId {
                        era: 0,
                        lamport: 2,
                        replica: other,
                        seq: 2,
                    },
                    OperationBody::Snapshot { state: vec![0xff] },
                ),
            ],
        };
        let err = dt.apply_push_pull_pack(reply.clone()).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        // The group applied before the failure is rewound with it.
        assert_eq!(value(&dt), 0);
        assert_eq!(dt.operation_id(), before_op_id);
        assert_eq!(dt.checkpoint(), CheckPoint::default());
        // Retrying the identical pack never duplicates the first group.
        let _ = dt.apply_push_pull_pack(reply);
        assert_eq!(value(&dt), 0);
    }

    #[test]
    fn test_operations_rejected_after_delete_ack() {
        let dt = counter_datatype();
        dt.request_create().unwrap();
        let reply = PushPullPack {
            id: DatatypeId::new(),
            key: "tests/counter".to_string(),
            kind: DatatypeKind::Counter,
            checkpoint: CheckPoint::default(),
            era: 0,
            option: PushPullOptions::DELETE,
            operations: Vec::new(),
        };
        dt.apply_push_pull_pack(reply).unwrap();
        assert_eq!(dt.state_of(), StateOfDatatype::Deleted);

        let err = dt.run_transaction("", false, |ctx| {
            ctx.execute_local(OperationBody::IncreaseBy { delta: 1 })
        });
        assert!(matches!(err, Err(Error::InvalidState { .. })));
    }
}
