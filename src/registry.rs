use crate::datatype::StateOfDatatype;
use crate::push_pull::PushPullPack;
use crate::{DatatypeId, DatatypeKind, Error, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Object-safe facade over a transaction datatype, as seen by the client's
/// sync flow and the registry.
pub trait SyncedDatatype: Send + Sync {
    fn key(&self) -> String;
    fn kind(&self) -> DatatypeKind;
    fn id(&self) -> DatatypeId;
    fn state_of(&self) -> StateOfDatatype;
    fn create_push_pull_pack(&self) -> PushPullPack;
    fn apply_push_pull_pack(&self, pack: PushPullPack) -> Result<()>;
    fn needs_sync(&self, notified_sseq: u64) -> bool;
    fn request_unsubscribe(&self) -> Result<()>;
    fn request_delete(&self) -> Result<()>;
}

/// Which datatype instances exist locally, by key. Consulted before creating
/// duplicates; the sync flow iterates it.
#[derive(Default)]
pub struct DatatypeRegistry {
    items: DashMap<String, Arc<dyn SyncedDatatype>>,
}

impl DatatypeRegistry {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn SyncedDatatype>> {
        self.items.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn register(&self, datatype: Arc<dyn SyncedDatatype>) -> Result<()> {
        let key = datatype.key();
        match self.items.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::DuplicateKey { key }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(datatype);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, key: &str) -> Option<Arc<dyn SyncedDatatype>> {
        self.items.remove(key).map(|(_, datatype)| datatype)
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
