use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::ClientError;
use crate::handlers::HeadUpdateHandler;
use crate::types::DomainType;

/// The contract every backend implements.
///
/// Callers are written once against this trait and handed whichever backend
/// matches the node they are talking to. All parameter resolvers are
/// potentially blocking on first use: the value is fetched from the node,
/// bounded by the service timeout, and cached for the lifetime of the
/// service. Subsequent calls are served from the cache without I/O.
#[async_trait]
pub trait Eth2Client: Send + Sync {
    /// Static name of the backend implementation. No I/O.
    fn name(&self) -> &'static str;

    /// The upstream address this service was configured with. No I/O.
    fn address(&self) -> &str;

    /// The time the chain started.
    async fn genesis_time(&self) -> Result<DateTime<Utc>, ClientError>;

    /// The root of the validator registry at genesis.
    async fn genesis_validators_root(&self) -> Result<B256, ClientError>;

    /// The wall-clock length of a slot.
    async fn slot_duration(&self) -> Result<Duration, ClientError>;

    async fn slots_per_epoch(&self) -> Result<u64, ClientError>;

    async fn far_future_epoch(&self) -> Result<u64, ClientError>;

    async fn target_aggregators_per_committee(&self) -> Result<u64, ClientError>;

    async fn beacon_attester_domain(&self) -> Result<DomainType, ClientError>;

    async fn beacon_proposer_domain(&self) -> Result<DomainType, ClientError>;

    async fn randao_domain(&self) -> Result<DomainType, ClientError>;

    async fn deposit_domain(&self) -> Result<DomainType, ClientError>;

    async fn voluntary_exit_domain(&self) -> Result<DomainType, ClientError>;

    async fn selection_proof_domain(&self) -> Result<DomainType, ClientError>;

    async fn aggregate_and_proof_domain(&self) -> Result<DomainType, ClientError>;

    /// Registers a handler for beacon chain head updates. Handlers stay
    /// subscribed until the service shuts down; there is no individual
    /// unsubscribe.
    fn subscribe_head_updates(&self, handler: Arc<dyn HeadUpdateHandler>);
}
