use crate::operation::{Operation, OperationId};
use crate::{DatatypeId, DatatypeKind, Error, ReplicaId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a datatype instance.
///
/// `LocallyExisted` on instantiation, a "due to" state once the caller has
/// requested creation or subscription, `Subscribed` after the first
/// successful sync reply. `Unsubscribed` and `Deleted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateOfDatatype {
    LocallyExisted,
    DueToCreate,
    DueToSubscribe,
    DueToSubscribeCreate,
    Subscribed,
    DueToUnsubscribe,
    Unsubscribed,
    Deleted,
}

impl StateOfDatatype {
    /// Waiting for the relay to acknowledge a create/subscribe request.
    pub fn is_due_to_attach(self) -> bool {
        matches!(
            self,
            StateOfDatatype::DueToCreate
                | StateOfDatatype::DueToSubscribe
                | StateOfDatatype::DueToSubscribeCreate
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StateOfDatatype::Unsubscribed | StateOfDatatype::Deleted)
    }
}

impl fmt::Display for StateOfDatatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Per-instance identity, declared kind, lifecycle state and operation clock,
/// shared by every datatype.
#[derive(Debug, Clone)]
pub struct BaseDatatype {
    key: String,
    id: DatatypeId,
    kind: DatatypeKind,
    state: StateOfDatatype,
    op_id: OperationId,
}

impl BaseDatatype {
    pub fn new(key: impl Into<String>, kind: DatatypeKind, replica: ReplicaId) -> Self {
        Self {
            key: key.into(),
            id: DatatypeId::new(),
            kind,
            state: StateOfDatatype::LocallyExisted,
            op_id: OperationId::new(replica),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> DatatypeId {
        self.id
    }

    pub fn kind(&self) -> DatatypeKind {
        self.kind
    }

    pub fn state(&self) -> StateOfDatatype {
        self.state
    }

    pub fn operation_id(&self) -> OperationId {
        self.op_id
    }

    pub fn set_operation_id(&mut self, op_id: OperationId) {
        self.op_id = op_id;
    }

    pub fn era(&self) -> u32 {
        self.op_id.era
    }

    pub fn next_operation_id(&mut self) -> OperationId {
        self.op_id.next()
    }

    pub fn sync_lamport(&mut self, remote: u64) -> u64 {
        self.op_id.sync_lamport(remote)
    }

    /// No operation may be created against a terminal datatype.
    pub fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::InvalidState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn request_attach(&mut self, target: StateOfDatatype) -> Result<()> {
        if self.state != StateOfDatatype::LocallyExisted {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "request attach",
            });
        }
        self.state = target;
        Ok(())
    }

    /// Caller requests creation with no prior relay knowledge.
    pub fn request_create(&mut self) -> Result<()> {
        self.request_attach(StateOfDatatype::DueToCreate)
    }

    /// Caller requests subscription to an existing relay-side datatype.
    pub fn request_subscribe(&mut self) -> Result<()> {
        self.request_attach(StateOfDatatype::DueToSubscribe)
    }

    /// Caller subscribes if the key exists at the relay, creates otherwise.
    pub fn request_subscribe_or_create(&mut self) -> Result<()> {
        self.request_attach(StateOfDatatype::DueToSubscribeCreate)
    }

    pub fn request_unsubscribe(&mut self) -> Result<()> {
        if self.state != StateOfDatatype::Subscribed {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "request unsubscribe",
            });
        }
        self.state = StateOfDatatype::DueToUnsubscribe;
        Ok(())
    }

    /// First successful sync reply: adopt the relay-assigned id, exactly once.
    pub fn to_subscribed(&mut self, relay_id: DatatypeId, relay_era: u32) {
        debug_assert!(self.state.is_due_to_attach());
        self.id = relay_id;
        if relay_era > self.op_id.era {
            self.op_id.era = relay_era;
        }
        self.state = StateOfDatatype::Subscribed;
        tracing::debug!(key = %self.key, id = ?self.id, "datatype subscribed");
    }

    pub fn to_unsubscribed(&mut self) {
        self.state = StateOfDatatype::Unsubscribed;
    }

    pub fn to_deleted(&mut self) {
        self.state = StateOfDatatype::Deleted;
    }
}

/// The capability a CRDT payload exposes to the engine. Local and remote
/// handlers must be semantically identical for commutative payloads; that
/// order-independence is what makes reconciliation safe without conflict
/// resolution in the engine.
pub trait Payload: Send + 'static {
    /// Opaque rollback value. The engine only clones and swaps it.
    type Snapshot: Clone + Send + fmt::Debug;

    fn execute_local(&mut self, op: &Operation) -> Result<()>;
    fn execute_remote(&mut self, op: &Operation) -> Result<()>;

    fn snapshot(&self) -> Self::Snapshot;
    fn restore(&mut self, snapshot: Self::Snapshot);

    /// Wire form of the full state, for snapshot operations.
    fn snapshot_bytes(&self) -> Result<Vec<u8>>;
    fn apply_snapshot(&mut self, bytes: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaseDatatype {
        BaseDatatype::new("k", DatatypeKind::Counter, ReplicaId::new())
    }

    #[test]
    fn test_attach_transitions_from_locally_existed() {
        let mut b = base();
        assert_eq!(b.state(), StateOfDatatype::LocallyExisted);
        b.request_create().unwrap();
        assert_eq!(b.state(), StateOfDatatype::DueToCreate);

        let mut b = base();
        b.request_subscribe_or_create().unwrap();
        assert_eq!(b.state(), StateOfDatatype::DueToSubscribeCreate);
    }

    #[test]
    fn test_double_attach_rejected() {
        let mut b = base();
        b.request_create().unwrap();
        let err = b.request_subscribe().unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_relay_id_adopted_on_subscribe() {
        let mut b = base();
        let placeholder = b.id();
        b.request_create().unwrap();
        let relay_id = DatatypeId::new();
        b.to_subscribed(relay_id, 0);
        assert_eq!(b.state(), StateOfDatatype::Subscribed);
        assert_eq!(b.id(), relay_id);
        assert_ne!(b.id(), placeholder);
    }

    #[test]
    fn test_unsubscribe_path() {
        let mut b = base();
        b.request_subscribe().unwrap();
        b.to_subscribed(DatatypeId::new(), 0);
        b.request_unsubscribe().unwrap();
        assert_eq!(b.state(), StateOfDatatype::DueToUnsubscribe);
        b.to_unsubscribed();
        assert!(b.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_operations() {
        let mut b = base();
        b.request_create().unwrap();
        b.to_subscribed(DatatypeId::new(), 0);
        b.to_deleted();
        let err = b.ensure_writable("increase").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: StateOfDatatype::Deleted,
                ..
            }
        ));
    }

    #[test]
    fn test_unsubscribe_requires_subscribed() {
        let mut b = base();
        let err = b.request_unsubscribe().unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
