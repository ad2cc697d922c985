use crate::datatype::Payload;
use crate::operation::{Operation, OperationBody};
use crate::transaction::{TransactionContext, TransactionDatatype};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counter CRDT payload: a signed integer with commutative deltas. Local and
/// remote execution perform the identical addition, which is what lets the
/// engine reconcile replicas without any conflict resolution of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    value: i64,
}

impl CounterState {
    pub fn value(&self) -> i64 {
        self.value
    }

    fn apply(&mut self, op: &Operation) -> Result<()> {
        match &op.body {
            OperationBody::IncreaseBy { delta } => {
                self.value = self.value.wrapping_add(*delta);
                Ok(())
            }
            OperationBody::Snapshot { state } => self.apply_snapshot(state),
            other => Err(Error::TypeMismatch {
                payload: "counter",
                kind: other.kind_name().to_string(),
            }),
        }
    }
}

impl Payload for CounterState {
    type Snapshot = i64;

    fn execute_local(&mut self, op: &Operation) -> Result<()> {
        self.apply(op)
    }

    fn execute_remote(&mut self, op: &Operation) -> Result<()> {
        self.apply(op)
    }

    fn snapshot(&self) -> i64 {
        self.value
    }

    fn restore(&mut self, snapshot: i64) {
        self.value = snapshot;
    }

    fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.value)?)
    }

    fn apply_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        self.value = bincode::deserialize(bytes)?;
        Ok(())
    }
}

/// User-facing counter handle. Cloning shares the underlying datatype.
#[derive(Clone, Debug)]
pub struct Counter {
    core: Arc<TransactionDatatype<CounterState>>,
}

impl Counter {
    pub(crate) fn from_core(core: Arc<TransactionDatatype<CounterState>>) -> Self {
        Self { core }
    }

    pub fn get(&self) -> i64 {
        self.core.with_payload(CounterState::value)
    }

    /// Current sync progress against the relay.
    pub fn checkpoint(&self) -> crate::push_pull::CheckPoint {
        self.core.checkpoint()
    }

    pub fn state_of(&self) -> crate::datatype::StateOfDatatype {
        use crate::registry::SyncedDatatype;
        self.core.state_of()
    }

    pub fn increase(&self) -> Result<i64> {
        self.increase_by(1)
    }

    /// Add `delta` and return the new value. Runs as an implicit
    /// single-operation transaction.
    pub fn increase_by(&self, delta: i64) -> Result<i64> {
        self.core.run_transaction("", false, |ctx| {
            ctx.execute_local(OperationBody::IncreaseBy { delta })?;
            Ok(ctx.payload().value())
        })
    }

    /// Batch several operations atomically. If `f` returns an error the
    /// whole batch is rolled back and nothing reaches the relay.
    ///
    /// All reads and writes inside `f` must go through the passed view. The
    /// view operates on the already-open transaction; calling this handle's
    /// own methods from inside `f` re-locks the datatype and deadlocks,
    /// since the datatype mutex is not re-entrant.
    pub fn transaction(
        &self,
        tag: &str,
        f: impl FnOnce(&mut CounterTransaction<'_, '_>) -> Result<()>,
    ) -> Result<()> {
        self.core.run_transaction(tag, true, |ctx| {
            let mut view = CounterTransaction { ctx };
            f(&mut view)
        })
    }
}

/// Transaction-scoped view of a counter, bound to the open context so nested
/// calls execute inside the same transaction instead of re-locking.
pub struct CounterTransaction<'a, 'b> {
    ctx: &'a mut TransactionContext<'b, CounterState>,
}

impl CounterTransaction<'_, '_> {
    pub fn get(&self) -> i64 {
        self.ctx.payload().value()
    }

    pub fn increase(&mut self) -> Result<i64> {
        self.increase_by(1)
    }

    pub fn increase_by(&mut self, delta: i64) -> Result<i64> {
        self.ctx
            .execute_local(OperationBody::IncreaseBy { delta })?;
        Ok(self.ctx.payload().value())
    }
}
