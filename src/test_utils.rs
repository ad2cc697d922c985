//! An in-process relay good enough to exercise the full push-pull flow in
//! tests: a totally ordered operation log per key, checkpoint bookkeeping per
//! replica, and a notification fan-out channel.

use crate::client::Client;
use crate::operation::Operation;
use crate::push_pull::{
    CheckPoint, PushPullOptions, PushPullPack, PushPullRequest, PushPullResponse,
    SyncNotification,
};
use crate::transport::SyncTransport;
use crate::{DatatypeId, DatatypeKind, ReplicaId, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct RelayDatatype {
    id: DatatypeId,
    kind: DatatypeKind,
    era: u32,
    log: Vec<Operation>,
    deleted: bool,
}

impl RelayDatatype {
    fn acked_seq(&self, replica: ReplicaId) -> u64 {
        self.log
            .iter()
            .filter(|op| op.id.replica == replica)
            .map(|op| op.id.seq)
            .max()
            .unwrap_or(0)
    }
}

/// Single-process relay. The log index is the global sequence: the nth
/// appended operation has sseq n (1-based), so `log.len()` is the current
/// sseq of the datatype.
#[derive(Debug, Default)]
pub struct InMemoryRelay {
    datatypes: Mutex<HashMap<String, RelayDatatype>>,
    listeners: Mutex<Vec<(ReplicaId, mpsc::UnboundedSender<SyncNotification>)>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification listener for one replica. The relay never
    /// notifies a replica about exchanges it performed itself.
    pub fn subscribe_notifications(
        &self,
        replica: ReplicaId,
    ) -> mpsc::UnboundedReceiver<SyncNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push((replica, tx));
        rx
    }

    pub fn contains(&self, key: &str) -> bool {
        self.datatypes
            .lock()
            .get(key)
            .is_some_and(|d| !d.deleted)
    }

    pub fn log_len(&self, key: &str) -> usize {
        self.datatypes.lock().get(key).map_or(0, |d| d.log.len())
    }

    fn error_reply(pack: &PushPullPack) -> PushPullPack {
        PushPullPack {
            id: pack.id,
            key: pack.key.clone(),
            kind: pack.kind,
            checkpoint: pack.checkpoint,
            era: pack.era,
            option: pack.option.with(PushPullOptions::ERROR),
            operations: Vec::new(),
        }
    }

    fn process_pack(
        &self,
        client: ReplicaId,
        pack: &PushPullPack,
    ) -> (PushPullPack, Option<SyncNotification>) {
        let mut datatypes = self.datatypes.lock();
        let option = pack.option;

        if option.contains(PushPullOptions::DELETE) {
            let Some(existing) = datatypes.get_mut(&pack.key) else {
                return (Self::error_reply(pack), None);
            };
            existing.deleted = true;
            existing.log.clear();
            let reply = PushPullPack {
                id: existing.id,
                key: pack.key.clone(),
                kind: existing.kind,
                checkpoint: pack.checkpoint,
                era: existing.era,
                option: PushPullOptions::DELETE,
                operations: Vec::new(),
            };
            tracing::debug!(key = %pack.key, "relay: datatype deleted");
            return (reply, None);
        }

        match datatypes.get(&pack.key) {
            Some(existing) if existing.deleted => {
                // Tombstone: attach attempts fail, live replicas learn of the
                // deletion through the echoed bit.
                if option.contains(PushPullOptions::CREATE)
                    || option.contains(PushPullOptions::SUBSCRIBE)
                {
                    return (Self::error_reply(pack), None);
                }
                let reply = PushPullPack {
                    id: existing.id,
                    key: pack.key.clone(),
                    kind: existing.kind,
                    checkpoint: pack.checkpoint,
                    era: existing.era,
                    option: PushPullOptions::DELETE,
                    operations: Vec::new(),
                };
                return (reply, None);
            }
            Some(existing) => {
                if existing.kind != pack.kind {
                    return (Self::error_reply(pack), None);
                }
                // Create of an existing key only succeeds when paired with
                // subscribe.
                if option.contains(PushPullOptions::CREATE)
                    && !option.contains(PushPullOptions::SUBSCRIBE)
                {
                    return (Self::error_reply(pack), None);
                }
            }
            None => {
                if !option.contains(PushPullOptions::CREATE) {
                    return (Self::error_reply(pack), None);
                }
                // The creator's locally generated id becomes authoritative.
                datatypes.insert(
                    pack.key.clone(),
                    RelayDatatype {
                        id: pack.id,
                        kind: pack.kind,
                        era: pack.era,
                        log: Vec::new(),
                        deleted: false,
                    },
                );
                tracing::debug!(key = %pack.key, "relay: datatype created");
            }
        }

        let datatype = datatypes
            .get_mut(&pack.key)
            .expect("entry exists after attach resolution");

        // Push: append only operations past what this replica already has
        // acknowledged, so a re-sent pack is idempotent.
        let acked = datatype.acked_seq(client);
        let mut pushed = 0usize;
        for op in &pack.operations {
            if op.id.seq > acked {
                datatype.log.push(op.clone());
                pushed += 1;
            }
        }

        // Pull: everything past the client's observed sseq, the client's own
        // echoes ordered first so its dedup can drop a leading run.
        let base = usize::try_from(pack.checkpoint.sseq)
            .unwrap_or(usize::MAX)
            .min(datatype.log.len());
        let mut own = Vec::new();
        let mut foreign = Vec::new();
        for op in &datatype.log[base..] {
            if op.id.replica == client {
                own.push(op.clone());
            } else {
                foreign.push(op.clone());
            }
        }
        own.extend(foreign);

        let checkpoint = CheckPoint::new(datatype.log.len() as u64, datatype.acked_seq(client));
        let reply = PushPullPack {
            id: datatype.id,
            key: pack.key.clone(),
            kind: datatype.kind,
            checkpoint,
            era: datatype.era,
            option,
            operations: own,
        };
        let notification = (pushed > 0).then(|| SyncNotification {
            key: pack.key.clone(),
            id: datatype.id,
            sseq: datatype.log.len() as u64,
        });
        (reply, notification)
    }

    fn notify(&self, source: ReplicaId, notifications: &[SyncNotification]) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|(replica, tx)| {
            if *replica == source {
                return true;
            }
            for n in notifications {
                if tx.send(n.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }
}

#[async_trait]
impl SyncTransport for InMemoryRelay {
    async fn exchange(&self, request: PushPullRequest) -> Result<PushPullResponse> {
        let mut packs = Vec::with_capacity(request.packs.len());
        let mut notifications = Vec::new();
        for pack in &request.packs {
            let (reply, notification) = self.process_pack(request.client, pack);
            packs.push(reply);
            notifications.extend(notification);
        }
        self.notify(request.client, &notifications);
        Ok(PushPullResponse {
            seq: request.seq,
            packs,
        })
    }
}

/// Relay plus two clients wired to it, the usual convergence-test fixture.
pub fn two_client_cluster() -> (Arc<InMemoryRelay>, Client, Client) {
    let relay = Arc::new(InMemoryRelay::new());
    let a = Client::new("a", relay.clone());
    let b = Client::new("b", relay.clone());
    (relay, a, b)
}
