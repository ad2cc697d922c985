#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod client;
pub mod counter;
pub mod datatype;
pub mod error;
pub mod operation;
pub mod push_pull;
pub mod registry;
pub mod transaction;
pub mod transport;
mod wired;

pub mod test_utils;

pub use client::Client;
pub use counter::Counter;
pub use error::{Error, Result};

/// Identifies one replica (client process). Generated once and attached to
/// every operation the replica produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ReplicaId(pub uuid::Uuid);

impl ReplicaId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one datatype instance. A locally generated placeholder until the
/// relay acknowledges creation or subscription, authoritative afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DatatypeId(pub uuid::Uuid);

impl DatatypeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DatatypeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Declared kind of a datatype, carried in every push-pull pack so the relay
/// can reject kind mismatches between replicas sharing a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DatatypeKind {
    Counter,
}
