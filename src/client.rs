use crate::counter::{Counter, CounterState};
use crate::push_pull::{PushPullRequest, SyncNotification};
use crate::registry::{DatatypeRegistry, SyncedDatatype};
use crate::transaction::TransactionDatatype;
use crate::transport::SyncTransport;
use crate::{DatatypeKind, Error, ReplicaId, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum AttachMode {
    Create,
    Subscribe,
    SubscribeOrCreate,
}

/// One replica: a unique identity, the datatypes attached locally, and the
/// transport used to reconcile them with the relay.
///
/// Application calls go straight to the datatype handles; the client only
/// drives the push-pull flow, which is expected to run on a dedicated task
/// separate from application call sites.
pub struct Client {
    replica: ReplicaId,
    alias: String,
    transport: Arc<dyn SyncTransport>,
    registry: DatatypeRegistry,
    exchange_seq: AtomicU64,
}

impl Client {
    pub fn new(alias: impl Into<String>, transport: Arc<dyn SyncTransport>) -> Self {
        let alias = alias.into();
        let replica = ReplicaId::new();
        tracing::info!(%alias, ?replica, "client created");
        Self {
            replica,
            alias,
            transport,
            registry: DatatypeRegistry::new(),
            exchange_seq: AtomicU64::new(0),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Create a counter the relay does not know about yet. Local operations
    /// are allowed immediately; the next sync registers it at the relay.
    pub fn create_counter(&self, key: &str) -> Result<Counter> {
        self.attach_counter(key, AttachMode::Create)
    }

    /// Subscribe to a counter that already exists at the relay.
    pub fn subscribe_counter(&self, key: &str) -> Result<Counter> {
        self.attach_counter(key, AttachMode::Subscribe)
    }

    /// Subscribe if the key exists at the relay, create it otherwise.
    pub fn subscribe_or_create_counter(&self, key: &str) -> Result<Counter> {
        self.attach_counter(key, AttachMode::SubscribeOrCreate)
    }

    fn attach_counter(&self, key: &str, mode: AttachMode) -> Result<Counter> {
        if self.registry.get(key).is_some() {
            return Err(Error::DuplicateKey {
                key: key.to_string(),
            });
        }
        let core = Arc::new(TransactionDatatype::new(
            key,
            DatatypeKind::Counter,
            self.replica,
            CounterState::default(),
        ));
        match mode {
            AttachMode::Create => core.request_create()?,
            AttachMode::Subscribe => core.request_subscribe()?,
            AttachMode::SubscribeOrCreate => core.request_subscribe_or_create()?,
        }
        self.registry.register(core.clone())?;
        tracing::info!(alias = %self.alias, key, ?mode, "counter attached");
        Ok(Counter::from_core(core))
    }

    /// One push-pull exchange for a single datatype.
    pub async fn sync(&self, key: &str) -> Result<()> {
        let datatype = self.registry.get(key).ok_or_else(|| Error::DatatypeNotFound {
            key: key.to_string(),
        })?;
        self.sync_datatype(&datatype).await
    }

    /// Push-pull every attached datatype.
    pub async fn sync_all(&self) -> Result<()> {
        for key in self.registry.keys() {
            if let Some(datatype) = self.registry.get(&key) {
                self.sync_datatype(&datatype).await?;
            }
        }
        Ok(())
    }

    /// Opportunistic re-sync on a relay notification. Skipped when the local
    /// checkpoint already covers the notified sseq.
    pub async fn handle_notification(&self, notification: &SyncNotification) -> Result<()> {
        let Some(datatype) = self.registry.get(&notification.key) else {
            return Ok(());
        };
        if !datatype.needs_sync(notification.sseq) {
            tracing::debug!(key = %notification.key, sseq = notification.sseq, "notification already covered");
            return Ok(());
        }
        self.sync_datatype(&datatype).await
    }

    /// Stop receiving this datatype; finalized by the relay's acknowledgment.
    pub async fn unsubscribe(&self, key: &str) -> Result<()> {
        let datatype = self.registry.get(key).ok_or_else(|| Error::DatatypeNotFound {
            key: key.to_string(),
        })?;
        datatype.request_unsubscribe()?;
        self.sync_datatype(&datatype).await
    }

    /// Remove the datatype at the relay for every replica.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let datatype = self.registry.get(key).ok_or_else(|| Error::DatatypeNotFound {
            key: key.to_string(),
        })?;
        datatype.request_delete()?;
        self.sync_datatype(&datatype).await
    }

    async fn sync_datatype(&self, datatype: &Arc<dyn SyncedDatatype>) -> Result<()> {
        let pack = datatype.create_push_pull_pack();
        let request = PushPullRequest {
            client: self.replica,
            seq: self.exchange_seq.fetch_add(1, Ordering::Relaxed) + 1,
            packs: vec![pack],
        };
        tracing::debug!(alias = %self.alias, seq = request.seq, "push-pull exchange");
        let response = self.transport.exchange(request).await?;
        for pack in response.packs {
            datatype.apply_push_pull_pack(pack)?;
        }
        if datatype.state_of().is_terminal() {
            self.registry.deregister(&datatype.key());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_pull::PushPullResponse;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct UnreachableRelay;

    #[async_trait]
    impl SyncTransport for UnreachableRelay {
        async fn exchange(&self, _request: PushPullRequest) -> Result<PushPullResponse> {
            Err(Error::Connection {
                reason: "unreachable".to_string(),
            })
        }
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let client = Client::new("a", Arc::new(UnreachableRelay));
        client.create_counter("k").unwrap();
        let err = client.subscribe_counter("k").unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_sync_of_unknown_key_fails() {
        let client = Client::new("a", Arc::new(UnreachableRelay));
        let err = client.sync("nope").await.unwrap_err();
        assert!(matches!(err, Error::DatatypeNotFound { .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_changes_nothing() {
        let client = Client::new("a", Arc::new(UnreachableRelay));
        let counter = client.create_counter("k").unwrap();
        counter.increase_by(3).unwrap();

        let err = client.sync("k").await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        // Value, state and the unacknowledged buffer are all intact.
        assert_eq!(counter.get(), 3);
        let pack = client.registry.get("k").unwrap().create_push_pull_pack();
        assert_eq!(pack.operations.len(), 1);
    }
}
