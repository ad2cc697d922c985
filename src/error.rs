use crate::datatype::StateOfDatatype;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failure during sync exchange: {reason}")]
    Connection { reason: String },

    #[error("Transaction validation failed: {reason}")]
    TransactionValidation { reason: String },

    #[error("Operation rejected in state {state:?}: {operation}")]
    InvalidState {
        state: StateOfDatatype,
        operation: &'static str,
    },

    #[error("Operation kind not understood by {payload} payload: {kind}")]
    TypeMismatch { payload: &'static str, kind: String },

    #[error("Rollback failed, payload state is indeterminate: {reason}")]
    RollbackFailed { reason: String },

    #[error("Datatype already attached for key {key:?}")]
    DuplicateKey { key: String },

    #[error("No datatype attached for key {key:?}")]
    DatatypeNotFound { key: String },

    #[error("Relay aborted push-pull for key {key:?}")]
    PushPullAborted { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
