//! Client for Prysm beacon nodes.
//!
//! Prysm exposes its v1alpha1 gRPC API through a JSON gateway; this backend
//! drives that gateway. Chain configuration arrives as a single
//! loosely-typed string map (`GetBeaconConfig`), so every constant is
//! decoded from its string form on first use and cached.

mod builder;
mod service;

pub use builder::Builder;
pub use service::Service;
