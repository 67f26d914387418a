use eyre::Report;
use thiserror::Error;

/// Errors surfaced by backend services.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Construction options were missing or malformed. Checked before any
    /// network I/O happens.
    #[error("invalid client options: {0}")]
    InvalidOptions(String),

    /// The reachability probe during construction failed; no service
    /// instance is returned.
    #[error("failed to confirm node connection: {0}")]
    ConnectionError(Report),

    /// The node's configuration has no entry under the requested key.
    #[error("configuration did not provide a value for {0}")]
    MissingKey(&'static str),

    /// The entry exists but could not be decoded into the expected shape.
    #[error("failed to parse value {value:?} for {key}: {reason}")]
    ConfigFormat {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The request to the node failed at the transport level. Transient;
    /// nothing is cached and the caller may retry.
    #[error("upstream request failed: {0}")]
    UpstreamUnavailable(Report),
}
