//! A client for Ethereum 2 beacon nodes.
//!
//! Every supported node implementation is driven through the [`Eth2Client`]
//! contract, so code written against the trait works unchanged whichever
//! backend it is handed. Backends live in their own crates
//! (`eth2-client-prysm`, `eth2-client-teku`) and share the building blocks
//! defined here: the write-once parameter cache, the configuration-value
//! parser, and the head update handler registry.

pub mod cache;
pub mod errors;
pub mod handlers;
pub mod params;
pub mod types;

mod client;

pub use cache::CachedValue;
pub use client::Eth2Client;
pub use errors::ClientError;
pub use handlers::{HandlerRegistry, HeadUpdateHandler};
pub use types::{DomainType, HeadUpdate};
