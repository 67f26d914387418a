//! Client for Teku beacon nodes, speaking the standard beacon HTTP API.
//!
//! Teku reports chain constants through typed JSON endpoints: genesis
//! values under `/eth/v1/beacon/genesis` and the spec map under
//! `/eth/v1/config/spec` (UPPER_SNAKE keys, string-encoded values).

mod builder;
mod service;

pub use builder::Builder;
pub use service::Service;
