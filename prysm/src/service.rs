use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
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

/// Poll cadence used when the chain's slot duration cannot be resolved.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(12);
const FALLBACK_SLOTS_PER_EPOCH: u64 = 32;

/// Ethereum 2 client service backed by a Prysm node's gRPC gateway.
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

    // One slot per immutable parameter. Each stays empty until first
    // resolved and is never invalidated afterwards.
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

    /// Watches the cancellation token and tears the service down when it
    /// fires. Teardown is best-effort and safe to trigger repeatedly.
    pub(crate) fn spawn_teardown_watcher(self: Arc<Self>) {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                self.cancel.cancelled().await;
                trace!(target: "eth2_client::prysm", "context cancelled; closing service");
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
        trace!(target: "eth2_client::prysm", %url, "requesting");
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

    /// Fetches the node's full configuration map. Callers pick out single
    /// entries; the map itself is deliberately not cached so that a bad
    /// entry can be retried on a later call.
    async fn beacon_config(&self) -> Result<HashMap<String, String>, ClientError> {
        let response: ConfigResponse = self.get_json("eth/v1alpha1/beacon/config").await?;
        Ok(response.config)
    }

    async fn genesis(&self) -> Result<GenesisResponse, ClientError> {
        self.get_json("eth/v1alpha1/node/genesis").await
    }

    pub(crate) async fn genesis_time(&self) -> Result<DateTime<Utc>, ClientError> {
        self.genesis_time
            .get_or_fetch(|| async {
                let genesis = self.genesis().await?;
                DateTime::parse_from_rfc3339(&genesis.genesis_time)
                    .map(|time| time.with_timezone(&Utc))
                    .map_err(|err| ClientError::ConfigFormat {
                        key: "genesisTime",
                        value: genesis.genesis_time.clone(),
                        reason: err.to_string(),
                    })
            })
            .await
    }

    async fn genesis_validators_root(&self) -> Result<B256, ClientError> {
        self.genesis_validators_root
            .get_or_fetch(|| async {
                let genesis = self.genesis().await?;
                root_from_base64("genesisValidatorsRoot", &genesis.genesis_validators_root)
            })
            .await
    }

    async fn slot_duration(&self) -> Result<Duration, ClientError> {
        self.slot_duration
            .get_or_fetch(|| async {
                let config = self.beacon_config().await?;
                params::u64_value(&config, "SecondsPerSlot").map(Duration::from_secs)
            })
            .await
    }

    async fn slots_per_epoch(&self) -> Result<u64, ClientError> {
        self.slots_per_epoch
            .get_or_fetch(|| async {
                let config = self.beacon_config().await?;
                params::u64_value(&config, "SlotsPerEpoch")
            })
            .await
    }

    async fn far_future_epoch(&self) -> Result<u64, ClientError> {
        self.far_future_epoch
            .get_or_fetch(|| async {
                let config = self.beacon_config().await?;
                params::u64_value(&config, "FarFutureEpoch")
            })
            .await
    }

    async fn target_aggregators_per_committee(&self) -> Result<u64, ClientError> {
        self.target_aggregators_per_committee
            .get_or_fetch(|| async {
                let config = self.beacon_config().await?;
                params::u64_value(&config, "TargetAggregatorsPerCommittee")
            })
            .await
    }

    async fn domain(
        &self,
        slot: &CachedValue<DomainType>,
        key: &'static str,
    ) -> Result<DomainType, ClientError> {
        slot.get_or_fetch(|| async {
            let config = self.beacon_config().await?;
            params::domain_value(&config, key)
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

    /// Polls the chain head once per slot and notifies subscribers whenever
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
                    trace!(target: "eth2_client::prysm", "head poller stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let head = match self.chain_head().await {
                Ok(head) => head,
                Err(err) => {
                    warn!(target: "eth2_client::prysm", %err, "failed to fetch chain head");
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
                    state_root: None,
                    epoch_transition,
                })
                .await;
        }
    }

    async fn chain_head(&self) -> Result<ChainHead, ClientError> {
        let response: ChainHeadResponse = self.get_json("eth/v1alpha1/beacon/chainhead").await?;
        let slot = response
            .head_slot
            .parse()
            .map_err(|err: std::num::ParseIntError| ClientError::ConfigFormat {
                key: "headSlot",
                value: response.head_slot.clone(),
                reason: err.to_string(),
            })?;
        let block_root = root_from_base64("headBlockRoot", &response.head_block_root)?;
        Ok(ChainHead { slot, block_root })
    }
}

fn root_from_base64(key: &'static str, value: &str) -> Result<B256, ClientError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|err| ClientError::ConfigFormat {
            key,
            value: value.to_string(),
            reason: err.to_string(),
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

struct ChainHead {
    slot: u64,
    block_root: B256,
}

#[async_trait]
impl Eth2Client for Service {
    fn name(&self) -> &'static str {
        "Prysm (gRPC gateway)"
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
            .domain(&self.inner.beacon_attester_domain, "DomainBeaconAttester")
            .await
    }

    async fn beacon_proposer_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.beacon_proposer_domain, "DomainBeaconProposer")
            .await
    }

    async fn randao_domain(&self) -> Result<DomainType, ClientError> {
        self.inner.domain(&self.inner.randao_domain, "DomainRandao").await
    }

    async fn deposit_domain(&self) -> Result<DomainType, ClientError> {
        self.inner.domain(&self.inner.deposit_domain, "DomainDeposit").await
    }

    async fn voluntary_exit_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.voluntary_exit_domain, "DomainVoluntaryExit")
            .await
    }

    async fn selection_proof_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.selection_proof_domain, "DomainSelectionProof")
            .await
    }

    async fn aggregate_and_proof_domain(&self) -> Result<DomainType, ClientError> {
        self.inner
            .domain(&self.inner.aggregate_and_proof_domain, "DomainAggregateAndProof")
            .await
    }

    fn subscribe_head_updates(&self, handler: Arc<dyn HeadUpdateHandler>) {
        self.inner.handlers.subscribe(handler);
        self.inner.clone().start_head_poller();
    }
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    config: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenesisResponse {
    genesis_time: String,
    genesis_validators_root: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainHeadResponse {
    head_slot: String,
    head_block_root: String,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use alloy::primitives::B256;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use chrono::{TimeZone, Utc};
    use futures::future::join_all;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use eth2_client::{ClientError, DomainType, Eth2Client, HeadUpdate, HeadUpdateHandler};

    use crate::{Builder, Service};

    fn config_entries() -> serde_json::Value {
        json!({
            "DomainBeaconAttester": "0x01000000",
            "DomainBeaconProposer": "0x00000000",
            "DomainRandao": "0x02000000",
            "DomainDeposit": "0x03000000",
            "DomainVoluntaryExit": "0x04000000",
            "DomainSelectionProof": "0x05000000",
            "DomainAggregateAndProof": "0x06000000",
            "SecondsPerSlot": "12",
            "SlotsPerEpoch": "32",
            "FarFutureEpoch": "18446744073709551615",
            "TargetAggregatorsPerCommittee": "16",
        })
    }

    fn genesis_body() -> serde_json::Value {
        json!({
            "genesisTime": "2020-12-01T12:00:23Z",
            "genesisValidatorsRoot": STANDARD.encode([0x42u8; 32]),
        })
    }

    async fn mount_genesis(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/eth/v1alpha1/node/genesis"))
            .respond_with(ResponseTemplate::new(200).set_body_json(genesis_body()))
            .mount(server)
            .await;
    }

    async fn mount_config(server: &MockServer, entries: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/eth/v1alpha1/beacon/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "config": entries })))
            .mount(server)
            .await;
    }

    async fn service_for(server: &MockServer) -> Service {
        Builder::new()
            .address(&server.uri())
            .timeout(Duration::from_secs(2))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn builder_requires_address() {
        let err = Builder::new()
            .timeout(Duration::from_secs(2))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn builder_rejects_zero_timeout() {
        let err = Builder::new()
            .address("localhost:4000")
            .timeout(Duration::ZERO)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn unreachable_node_fails_construction() {
        let err = Builder::new()
            .address("localhost:1")
            .timeout(Duration::from_millis(500))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn reports_name_and_address() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;

        let service = service_for(&server).await;
        assert_eq!(service.name(), "Prysm (gRPC gateway)");
        assert_eq!(service.address(), server.uri());
    }

    #[tokio::test]
    async fn resolves_genesis_values() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;

        let service = service_for(&server).await;
        assert_eq!(
            service.genesis_time().await.unwrap(),
            Utc.with_ymd_and_hms(2020, 12, 1, 12, 0, 23).unwrap()
        );
        assert_eq!(
            service.genesis_validators_root().await.unwrap(),
            B256::repeat_byte(0x42)
        );
    }

    #[tokio::test]
    async fn concurrent_domain_resolution_fetches_config_once() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;
        Mock::given(method("GET"))
            .and(path("/eth/v1alpha1/beacon/config"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "config": config_entries() })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let service = service_for(&server).await;
        let results = join_all((0..8).map(|_| service.randao_domain())).await;
        for result in results {
            assert_eq!(result.unwrap(), DomainType([0x02, 0x00, 0x00, 0x00]));
        }
        // A later call is served from the slot as well.
        assert_eq!(
            service.randao_domain().await.unwrap(),
            DomainType([0x02, 0x00, 0x00, 0x00])
        );
    }

    #[tokio::test]
    async fn cached_values_survive_an_upstream_outage() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;
        mount_config(&server, config_entries()).await;

        let service = service_for(&server).await;
        assert_eq!(
            service.slot_duration().await.unwrap(),
            Duration::from_secs(12)
        );

        // Drop every route; cached parameters keep resolving while
        // unresolved ones now fail.
        server.reset().await;
        assert_eq!(
            service.slot_duration().await.unwrap(),
            Duration::from_secs(12)
        );
        assert!(matches!(
            service.slots_per_epoch().await.unwrap_err(),
            ClientError::UpstreamUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn failed_resolution_retries_on_next_call() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;

        let service = service_for(&server).await;
        // No config route mounted yet: resolution fails and nothing is
        // cached.
        assert!(matches!(
            service.slots_per_epoch().await.unwrap_err(),
            ClientError::UpstreamUnavailable(_)
        ));

        mount_config(&server, config_entries()).await;
        assert_eq!(service.slots_per_epoch().await.unwrap(), 32);
    }

    #[tokio::test]
    async fn missing_key_is_distinct_from_malformed_value() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;
        mount_config(
            &server,
            json!({
                "DomainDeposit": "0x030000",
                "SecondsPerSlot": "12",
            }),
        )
        .await;

        let service = service_for(&server).await;
        assert!(matches!(
            service.randao_domain().await.unwrap_err(),
            ClientError::MissingKey("DomainRandao")
        ));
        assert!(matches!(
            service.deposit_domain().await.unwrap_err(),
            ClientError::ConfigFormat {
                key: "DomainDeposit",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resolves_all_scalar_parameters() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;
        mount_config(&server, config_entries()).await;

        let service = service_for(&server).await;
        assert_eq!(service.slots_per_epoch().await.unwrap(), 32);
        assert_eq!(service.far_future_epoch().await.unwrap(), u64::MAX);
        assert_eq!(
            service.target_aggregators_per_committee().await.unwrap(),
            16
        );
        assert_eq!(
            service.beacon_attester_domain().await.unwrap(),
            DomainType([0x01, 0x00, 0x00, 0x00])
        );
        assert_eq!(
            service.beacon_proposer_domain().await.unwrap(),
            DomainType([0x00, 0x00, 0x00, 0x00])
        );
        assert_eq!(
            service.aggregate_and_proof_domain().await.unwrap(),
            DomainType([0x06, 0x00, 0x00, 0x00])
        );
    }

    struct Recorder {
        updates: Mutex<Vec<HeadUpdate>>,
    }

    #[async_trait]
    impl HeadUpdateHandler for Recorder {
        async fn on_head_update(&self, update: HeadUpdate) {
            self.updates.lock().unwrap().push(update);
        }
    }

    /// Serves a head whose slot and root advance on every poll.
    struct AdvancingHead(AtomicU64);

    impl Respond for AdvancingHead {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let slot = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            let mut root = [0u8; 32];
            root[..8].copy_from_slice(&slot.to_be_bytes());
            ResponseTemplate::new(200).set_body_json(json!({
                "headSlot": slot.to_string(),
                "headBlockRoot": STANDARD.encode(root),
            }))
        }
    }

    #[tokio::test]
    async fn head_updates_flow_until_cancelled() {
        let server = MockServer::start().await;
        mount_genesis(&server).await;
        mount_config(
            &server,
            json!({
                "SecondsPerSlot": "1",
                "SlotsPerEpoch": "2",
            }),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/eth/v1alpha1/beacon/chainhead"))
            .respond_with(AdvancingHead(AtomicU64::new(0)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let service = Builder::new()
            .address(&server.uri())
            .timeout(Duration::from_secs(2))
            .cancel_token(cancel.clone())
            .build()
            .await
            .unwrap();

        let recorder = Arc::new(Recorder {
            updates: Mutex::new(Vec::new()),
        });
        service.subscribe_head_updates(recorder.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let seen = recorder.updates.lock().unwrap().clone();
        assert!(seen.len() >= 2, "expected at least two updates, got {seen:?}");
        assert_eq!(seen[0].slot, 1);
        assert!(!seen[0].epoch_transition);
        assert_eq!(seen[1].slot, 2);
        // Slot 2 starts a new epoch with two slots per epoch.
        assert!(seen[1].epoch_transition);
        assert!(seen.iter().all(|update| update.state_root.is_none()));

        // The poller is gone; no further deliveries happen even though the
        // mocked head keeps advancing.
        let settled = recorder.updates.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(recorder.updates.lock().unwrap().len(), settled);
    }
}
