use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::{
    Endpoint, Identity,
    error::{Error, ErrorKind, Result},
};

/// Routing service that forwards requests of clients behind it.
#[async_trait]
pub trait Router: Send + Sync {
    /// Endpoints clients connect to instead of the target's own.
    ///
    /// # Errors
    async fn client_endpoints(&self) -> Result<Vec<Endpoint>>;
}

struct RouterInfo {
    identity: Identity,
    router: Arc<dyn Router>,
    endpoints: ArcSwapOption<Vec<Endpoint>>,
}

/// A router together with its cached client endpoints.
///
/// Handles compare by the router identity.
#[derive(Clone)]
pub struct RouterHandle(Arc<RouterInfo>);

impl RouterHandle {
    pub fn new(identity: Identity, router: Arc<dyn Router>) -> Self {
        Self(Arc::new(RouterInfo {
            identity,
            router,
            endpoints: ArcSwapOption::empty(),
        }))
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.0.identity
    }

    /// # Errors
    ///
    /// Fails with `RouterFailed` when the router cannot be reached and
    /// `NoEndpoint` when it has no client endpoints.
    pub async fn client_endpoints(&self) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = self.0.endpoints.load_full() {
            return Ok(endpoints.as_ref().clone());
        }

        let endpoints = self.0.router.client_endpoints().await.map_err(|e| {
            Error::new(
                ErrorKind::RouterFailed,
                format!("cannot get client endpoints of router {}: {e}", self.0.identity),
            )
        })?;
        if endpoints.is_empty() {
            return Err(Error::new(
                ErrorKind::NoEndpoint,
                format!("router {} has no client endpoints", self.0.identity),
            ));
        }
        self.0.endpoints.store(Some(Arc::new(endpoints.clone())));
        Ok(endpoints)
    }

    pub fn clear_cache(&self) {
        self.0.endpoints.store(None);
    }
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RouterHandle").field(&self.0.identity).finish()
    }
}

impl PartialEq for RouterHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity == other.0.identity
    }
}

impl Eq for RouterHandle {}

impl PartialOrd for RouterHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RouterHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.identity.cmp(&other.0.identity)
    }
}

impl std::hash::Hash for RouterHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.identity.hash(state);
    }
}
