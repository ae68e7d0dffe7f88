use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use foldhash::fast::RandomState;

use crate::{
    Endpoint, Identity,
    error::{Error, ErrorKind, Result},
};

/// Resolves adapter ids of indirect references to endpoints.
#[async_trait]
pub trait Locator: Send + Sync {
    /// # Errors
    async fn resolve(&self, adapter_id: &str) -> Result<Vec<Endpoint>>;
}

struct CachedEndpoints {
    endpoints: Vec<Endpoint>,
    resolved_at: Instant,
}

struct LocatorInfo {
    identity: Identity,
    locator: Arc<dyn Locator>,
    table: dashmap::DashMap<String, CachedEndpoints, RandomState>,
}

/// A locator together with its adapter lookup cache.
///
/// Handles compare by the locator identity.
#[derive(Clone)]
pub struct LocatorHandle(Arc<LocatorInfo>);

impl LocatorHandle {
    pub fn new(identity: Identity, locator: Arc<dyn Locator>) -> Self {
        Self(Arc::new(LocatorInfo {
            identity,
            locator,
            table: dashmap::DashMap::default(),
        }))
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.0.identity
    }

    /// Endpoints of `adapter_id`, from the cache when the entry is younger
    /// than `cache_timeout_ms`. `-1` accepts any age, `0` always asks the
    /// locator.
    ///
    /// # Errors
    ///
    /// Fails with `LocatorFailed` when the lookup fails and `NoEndpoint`
    /// when the adapter has no endpoints.
    pub async fn endpoints(&self, adapter_id: &str, cache_timeout_ms: i32) -> Result<Vec<Endpoint>> {
        if cache_timeout_ms != 0
            && let Some(entry) = self.0.table.get(adapter_id)
        {
            let fresh = u64::try_from(cache_timeout_ms).map_or(true, |ttl| {
                entry.resolved_at.elapsed() <= Duration::from_millis(ttl)
            });
            if fresh {
                tracing::trace!("locator cache hit for adapter `{adapter_id}`");
                return Ok(entry.endpoints.clone());
            }
        }

        let endpoints = self.0.locator.resolve(adapter_id).await.map_err(|e| {
            Error::new(
                ErrorKind::LocatorFailed,
                format!("cannot resolve adapter `{adapter_id}`: {e}"),
            )
        })?;
        if endpoints.is_empty() {
            return Err(Error::new(
                ErrorKind::NoEndpoint,
                format!("adapter `{adapter_id}` has no endpoints"),
            ));
        }
        tracing::debug!(
            "locator {} resolved adapter `{adapter_id}` to {} endpoint(s)",
            self.0.identity,
            endpoints.len()
        );
        self.0.table.insert(
            adapter_id.to_string(),
            CachedEndpoints {
                endpoints: endpoints.clone(),
                resolved_at: Instant::now(),
            },
        );
        Ok(endpoints)
    }

    /// Forgets the cached endpoints of `adapter_id`.
    pub fn clear_cache(&self, adapter_id: &str) {
        if self.0.table.remove(adapter_id).is_some() {
            tracing::debug!("cleared locator cache for adapter `{adapter_id}`");
        }
    }
}

impl std::fmt::Debug for LocatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LocatorHandle").field(&self.0.identity).finish()
    }
}

impl PartialEq for LocatorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity == other.0.identity
    }
}

impl Eq for LocatorHandle {}

impl PartialOrd for LocatorHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LocatorHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.identity.cmp(&other.0.identity)
    }
}

impl std::hash::Hash for LocatorHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.identity.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLocator {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Locator for CountingLocator {
        async fn resolve(&self, adapter_id: &str) -> Result<Vec<Endpoint>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match adapter_id {
                "PrinterAdapter" => Ok(vec![Endpoint::tcp("localhost", 10000)]),
                "Empty" => Ok(vec![]),
                _ => Err(Error::kind(ErrorKind::ObjectNotExist)),
            }
        }
    }

    fn handle() -> (Arc<CountingLocator>, LocatorHandle) {
        let locator = Arc::new(CountingLocator::default());
        let handle = LocatorHandle::new("IceGrid/Locator".parse().unwrap(), locator.clone());
        (locator, handle)
    }

    #[tokio::test]
    async fn test_locator_cache() {
        let (locator, handle) = handle();
        handle.endpoints("PrinterAdapter", -1).await.unwrap();
        handle.endpoints("PrinterAdapter", -1).await.unwrap();
        assert_eq!(locator.lookups.load(Ordering::SeqCst), 1);

        handle.endpoints("PrinterAdapter", 0).await.unwrap();
        assert_eq!(locator.lookups.load(Ordering::SeqCst), 2);

        handle.clear_cache("PrinterAdapter");
        handle.endpoints("PrinterAdapter", 60_000).await.unwrap();
        assert_eq!(locator.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_locator_cache_expiry() {
        let (locator, handle) = handle();
        handle.endpoints("PrinterAdapter", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.endpoints("PrinterAdapter", 10).await.unwrap();
        assert_eq!(locator.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_locator_errors() {
        let (locator, handle) = handle();
        let err = handle.endpoints("Missing", -1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LocatorFailed);
        let err = handle.endpoints("Empty", -1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoEndpoint);

        // failures are not cached
        handle.endpoints("Empty", -1).await.unwrap_err();
        assert_eq!(locator.lookups.load(Ordering::SeqCst), 3);
    }
}
