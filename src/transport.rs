use crate::push_pull::{PushPullRequest, PushPullResponse};
use crate::Result;
use async_trait::async_trait;

/// The outbound sync exchange. One request carries this client's packs; the
/// reply carries the relay's reconciled packs for the same datatypes.
///
/// A transport error means "no state change occurred": the engine applies
/// nothing and the same packs may be re-sent later.
#[async_trait]
pub trait SyncTransport: Send + Sync + std::fmt::Debug {
    async fn exchange(&self, request: PushPullRequest) -> Result<PushPullResponse>;
}
