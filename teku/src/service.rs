use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::eyre;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn, Instrument, Span};
use url::Url;

use eth2_client::params;
use eth2_client::{
    CachedValue, ClientError, DomainType, Eth2Client, HandlerRegistry, HeadUpdate,
    HeadUpdateHandler,
};

const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(12);
const FALLBACK_SLOTS_PER_EPOCH: u64 = 32;

/// Ethereum 2 client service backed by a Teku node's HTTP API.
pub struct Service {
    pub(crate) inner: Arc<Inner>,
}

impl Service {
    pub fn builder() -> crate::Builder {
        crate::Builder::new()
    }
}

pub(crate) struct Inner {
    address: String,
    base: Url,
    http: reqwest::Client,
    handlers: HandlerRegistry,
    pub(crate) cancel: CancellationToken,
    poller_started: AtomicBool,
    span: Span,

    genesis_time: CachedValue<DateTime<Utc>>,
    genesis_validators_root: CachedValue<B256>,
    slot_duration: CachedValue<Duration>,
    slots_per_epoch: CachedValue<u64>,
    far_future_epoch: CachedValue<u64>,
    target_aggregators_per_committee: CachedValue<u64>,
    beacon_attester_domain: CachedValue<DomainType>,
    beacon_proposer_domain: CachedValue<DomainType>,
    randao_domain: CachedValue<DomainType>,
    deposit_domain: CachedValue<DomainType>,
    voluntary_exit_domain: CachedValue<DomainType>,
    selection_proof_domain: CachedValue<DomainType>,
    aggregate_and_proof_domain: CachedValue<DomainType>,
}

impl Inner {
    pub(crate) fn new(
        address: String,
        base: Url,
        http: reqwest::Client,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            address,
            base,
            http,
            handlers: HandlerRegistry::new(),
            cancel,
            poller_started: AtomicBool::new(false),
            span,
            genesis_time: CachedValue::new(),
            genesis_validators_root: CachedValue::new(),
            slot_duration: CachedValue::new(),
            slots_per_epoch: CachedValue::new(),
            far_future_epoch: CachedValue::new(),
            target_aggregators_per_committee: CachedValue::new(),
            beacon_attester_domain: CachedValue::new(),
            beacon_proposer_domain: CachedValue::new(),
            randao_domain: CachedValue::new(),
            deposit_domain: CachedValue::new(),
            voluntary_exit_domain: CachedValue::new(),
            selection_proof_domain: CachedValue::new(),
            aggregate_and_proof_domain: CachedValue::new(),
        }
    }

    pub(crate) fn spawn_teardown_watcher(self: Arc<Self>) {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                self.cancel.cancelled().await;
                trace!(target: "eth2_client::teku", "context cancelled; closing service");
                self.close();
            }
            .instrument(span),
        );
    }

    fn close(&self) {
        self.handlers.clear();
    }

    async fn get_json<T: DeserializeOwned>(&self, route: &str) -> Result<T, ClientError> {
        let url = self
            .base
            .join(route)
            .map_err(|err| ClientError::UpstreamUnavailable(eyre!("invalid route {route}: {err}")))?;
        trace!(target: "eth2_client::teku", %url, "requesting");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ClientError::UpstreamUnavailable(err.into()))?
            .error_for_status()
            .map_err(|err| ClientError::UpstreamUnavailable(err.into()))?;
        response
            .json()
            .await
            .map_err(|err| ClientError::UpstreamUnavailable(err.into()))
    }

    /// Fetches the node's spec map. Not cached itself; each parameter slot
    /// re-requests it on a miss so that malformed entries can be retried.
    async fn spec(&self) -> Result<HashMap<String, String>, ClientError> {
        let response: SpecResponse = self.get_json("eth/v1/config/spec").await?;
        Ok(response.data)
    }

    async fn genesis(&self) -> Result<GenesisData, ClientError> {
        let response: GenesisResponse = self.get_json("eth/v1/beacon/genesis").await?;
        Ok(response.data)
    }

    pub(crate) async fn genesis_time(&self) -> Result<DateTime<Utc>, ClientError> {
        self.genesis_time
            .get_or_fetch(|| async {
                let genesis = self.genesis().await?;
                let seconds: i64 =
                    genesis
                        .genesis_time
                        .parse()
                        .map_err(|err: std::num::ParseIntError| ClientError::ConfigFormat {
                            key: "genesis_time",
                            value: genesis.genesis_time.clone(),
                            reason: err.to_string(),
                        })?;
                DateTime::from_timestamp(seconds, 0).ok_or(ClientError::ConfigFormat {
                    key: "genesis_time",
                    value: genesis.genesis_time.clone(),
                    reason: "timestamp out of range".to_string(),
                })
            })
            .await
    }

    async fn genesis_validators_root(&self) -> Result<B256, ClientError> {
        self.genesis_validators_root
            .get_or_fetch(|| async {
                let genesis = self.genesis().await?;
                root_from_hex("genesis_validators_root", &genesis.genesis_validators_root)
            })
            .await
    }

    async fn slot_duration(&self) -> Result<Duration, ClientError> {
        self.slot_duration
            .get_or_fetch(|| async {
                let spec = self.spec().await?;
                params::u64_value(&spec, "SECONDS_PER_SLOT").map(Duration::from_secs)
            })
            .await
    }

    async fn slots_per_epoch(&self) -> Result<u64, ClientError> {
        self.slots_per_epoch
            .get_or_fetch(|| async {
                let spec = self.spec().await?;
                params::u64_value(&spec, "SLOTS_PER_EPOCH")
            })
            .await
    }

    async fn far_future_epoch(&self) -> Result<u64, ClientError> {
        self.far_future_epoch
            .get_or_fetch(|| async {
                let spec = self.spec().await?;
                params::u64_value(&spec, "FAR_FUTURE_EPOCH")
            })
            .await
    }

    async fn target_aggregators_per_committee(&self) -> Result<u64, ClientError> {
        self.target_aggregators_per_committee
            .get_or_fetch(|| async {
                let spec = self.spec().await?;
                params::u64_value(&spec, "TARGET_AGGREGATORS_PER_COMMITTEE")
            })
            .await
    }

    async fn domain(
        &self,
        slot: &CachedValue<DomainType>,
        key: &'static str,
    ) -> Result<DomainType, ClientError> {
        slot.get_or_fetch(|| async {
            let spec = self.spec().await?;
            params::domain_value(&spec, key)
        })
        .await
    }

    fn start_head_poller(self: Arc<Self>) {
        if self.poller_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = self.span.clone();
        tokio::spawn(
            async move {
                self.poll_head().await;
            }
            .instrument(span),
        );
    }

    /// Polls the head header once per slot and notifies subscribers when
    /// the head root moves. Runs until the service is cancelled.
    async fn poll_head(&self) {
        let interval = self
            .slot_duration()
            .await
            .unwrap_or(FALLBACK_POLL_INTERVAL);
        let slots_per_epoch = self
            .slots_per_epoch()
            .await
            .unwrap_or(FALLBACK_SLOTS_PER_EPOCH);

        let mut ticker = tokio::time::interval(interval);
        let mut last: Option<(u64, B256)> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    trace!(target: "eth2_client::teku", "head poller stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let head = match self.head_header().await {
                Ok(head) => head,
                Err(err) => {
                    warn!(target: "eth2_client::teku", %err, "failed to fetch head header");
                    continue;
                }
            };
            if last.map(|(_, root)| root == head.block_root).unwrap_or(false) {
                continue;
            }

            let epoch_transition = last
                .map(|(slot, _)| head.slot / slots_per_epoch > slot / slots_per_epoch)
                .unwrap_or(false);
            last = Some((head.slot, head.block_root));

            self.handlers
                .notify(&HeadUpdate {
                    slot: head.slot,
                    block_root: head.block_root,
                    state_root: Some(head.state_root),
                    epoch_transition,
                })
                .await;
        }
    }

    async fn head_header(&self) -> Result<HeadHeader, ClientError> {
        let response: HeadersResponse = self.get_json("eth/v1/beacon/headers/head").await?;
        let message = response.data.header.message;
        let slot = message
            .slot
            .parse()
            .map_err(|err: std::num::ParseIntError| ClientError::ConfigFormat {
                key: "slot",
                value: message.slot.clone(),
                reason: err.to_string(),
            })?;
        Ok(HeadHeader {
            slot,
            block_root: root_from_hex("root", &response.data.root)?,
            state_root: root_from_hex("state_root", &message.state_root)?,
        })
    }
}

fn root_from_hex(key: &'static str, value: &str) -> Result<B256, ClientError> {
    let bytes = hex::decode(value.strip_prefix("0x").unwrap_or(value)).map_err(|err| {
        ClientError::ConfigFormat {
            key,
            value: value.to_string(),
            reason: err.to_string(),
        }
    })?;
    if bytes.len() != B256::len_bytes() {
        return Err(ClientError::ConfigFormat {
            key,
            value: value.to_string(),
            reason: format!("expected {} bytes, got {}", B256::len_bytes(), bytes.len()),
        });
    }
    Ok(B256::from_slice(&bytes))
}

struct HeadHeader {
    slot: u64,
    block_root: B256,
    state_root: B256,
}

#[async_trait]
impl Eth2Client for Service {
    fn name(&self) -> &'static str {
        "Teku (HTTP)"
    }

    fn address(&self) -> &str {
        &self.inner.address
    }

    async fn genesis_time(&self) -> Result<DateTime<Utc>, ClientError> {
        self.inner.genesis_time().await
    }

    async fn genesis_validators_root(&self) -> Result<B256, ClientError> {
        self.inner.genesis_validators_root().await
    }

    async fn slot_duration(&self) -> Result<Duration, ClientError> {
        self.inner.slot_duration().await
    }

    async fn slots_per_epoch(&self) -> Result<u64, ClientError> {
        self.inner.slots_per_epoch().await
    }

    async fn far_future_epoch(&self) -> Result<u64, ClientError> {
        self.inner.far_future_epoch().await
    }

    async fn target_aggregators_per_committee(&self) -> Result<u64, ClientError> {
        self.inner.target_aggregators_per_committee().await
    }

    async fn beacon_attester_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.beacon_attester_domain, "DOMAIN_BEACON_ATTESTER")
            .await
    }

    async fn beacon_proposer_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.beacon_proposer_domain, "DOMAIN_BEACON_PROPOSER")
            .await
    }

    async fn randao_domain(&self) -> Result<DomainType, ClientError> {
        self.inner.domain(&self.inner.randao_domain, "DOMAIN_RANDAO").await
    }

    async fn deposit_domain(&self) -> Result<DomainType, ClientError> {
        self.inner.domain(&self.inner.deposit_domain, "DOMAIN_DEPOSIT").await
    }

    async fn voluntary_exit_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.voluntary_exit_domain, "DOMAIN_VOLUNTARY_EXIT")
            .await
    }

    async fn selection_proof_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.selection_proof_domain, "DOMAIN_SELECTION_PROOF")
            .await
    }

    async fn aggregate_and_proof_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.aggregate_and_proof_domain, "DOMAIN_AGGREGATE_AND_PROOF")
            .await
    }

    fn subscribe_head_updates(&self, handler: Arc<dyn HeadUpdateHandler>) {
        self.inner.handlers.subscribe(handler);
        self.inner.clone().start_head_poller();
    }
}

#[derive(Debug, Deserialize)]
struct GenesisResponse {
    data: GenesisData,
}

#[derive(Debug, Deserialize)]
struct GenesisData {
    genesis_time: String,
    genesis_validators_root: String,
}

#[derive(Debug, Deserialize)]
struct SpecResponse {
    data: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HeadersResponse {
    data: HeadersData,
}

#[derive(Debug, Deserialize)]
struct HeadersData {
    root: String,
    header: SignedBeaconBlockHeader,
}

#[derive(Debug, Deserialize)]
struct SignedBeaconBlockHeader {
    message: BeaconBlockHeader,
}

#[derive(Debug, Deserialize)]
struct BeaconBlockHeader {
    slot: String,
    state_root: String,
}
