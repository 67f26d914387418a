//! Write-once caching for chain parameters that never change for the
//! lifetime of a connection.

use std::future::Future;

use tokio::sync::RwLock;

use crate::errors::ClientError;

/// A slot holding one immutable chain parameter.
///
/// The slot starts empty and moves to populated exactly once; once a value
/// is stored it is served to every caller without further I/O. Chain
/// constants are read on every signing-domain computation but only need to
/// be fetched once per process, so the slot trades one round trip for the
/// lifetime of the service.
pub struct CachedValue<T> {
    slot: RwLock<Option<T>>,
}

impl<T> CachedValue<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }
}

impl<T: Clone> CachedValue<T> {
    /// Returns the cached value, running `fetch` first if the slot is empty.
    ///
    /// The fetch executes while the write half of the slot is held, so at
    /// most one fetch per slot is in flight at any time; concurrent callers
    /// block until the slot settles and then observe the identical stored
    /// value. A failed fetch leaves the slot empty, so a later call retries
    /// rather than caching the failure.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        if let Some(value) = self.slot.read().await.as_ref() {
            return Ok(value.clone());
        }

        let mut slot = self.slot.write().await;
        if let Some(value) = slot.as_ref() {
            return Ok(value.clone());
        }

        let value = fetch().await?;
        *slot = Some(value.clone());
        Ok(value)
    }
}

impl<T> Default for CachedValue<T> {
    fn default() -> Self {
        Self::new()
    }
}
