use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Level, Span};
use url::Url;

use eth2_client::ClientError;

use crate::service::Inner;
use crate::Service;

/// Builder for Teku-backed [`Service`] instances.
///
/// `address` and `timeout` are required. Construction probes the node for
/// its genesis time before returning, so a builder never hands out a
/// service that cannot reach its node.
#[derive(Default)]
pub struct Builder {
    address: Option<String>,
    timeout: Option<Duration>,
    log_level: Option<Level>,
    cancel_token: Option<CancellationToken>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The address of the node's HTTP API, with or without a scheme.
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Bound applied to every request made to the node.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Ties the service lifetime to `token`; cancelling it tears the
    /// service down.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub async fn build(self) -> Result<Service, ClientError> {
        let address = self
            .address
            .filter(|address| !address.is_empty())
            .ok_or_else(|| ClientError::InvalidOptions("no address specified".to_string()))?;
        let timeout = self
            .timeout
            .ok_or_else(|| ClientError::InvalidOptions("no timeout specified".to_string()))?;
        if timeout.is_zero() {
            return Err(ClientError::InvalidOptions(
                "timeout must be greater than zero".to_string(),
            ));
        }

        let base = if address.starts_with("http") {
            address.clone()
        } else {
            format!("http://{address}")
        };
        let base = Url::parse(&base).map_err(|err| {
            ClientError::InvalidOptions(format!("invalid address {address:?}: {err}"))
        })?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|err| ClientError::InvalidOptions(err.to_string()))?;

        let span = service_span(self.log_level.unwrap_or(Level::INFO), &address);
        let cancel = self.cancel_token.unwrap_or_default();
        let inner = Arc::new(Inner::new(address, base, http, cancel, span));

        // Confirm the node is reachable before handing the service out.
        inner
            .genesis_time()
            .await
            .map_err(|err| ClientError::ConnectionError(err.into()))?;

        inner.clone().spawn_teardown_watcher();

        Ok(Service { inner })
    }
}

fn service_span(level: Level, address: &str) -> Span {
    if level == Level::TRACE {
        tracing::trace_span!("teku", %address)
    } else if level == Level::DEBUG {
        tracing::debug_span!("teku", %address)
    } else if level == Level::WARN {
        tracing::warn_span!("teku", %address)
    } else if level == Level::ERROR {
        tracing::error_span!("teku", %address)
    } else {
        tracing::info_span!("teku", %address)
    }
}
