use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    BoundedRetryPolicy, ConnectionPool, Connector, Identity, LocatorHandle, ObjectPrx, Reference,
    RetryPolicy, RouterHandle, RuntimeConfig,
    error::{Error, ErrorKind, Result},
};

/// Process-wide state shared by every proxy created from it.
pub struct Runtime {
    config: RuntimeConfig,
    retry_policy: Arc<dyn RetryPolicy>,
    pool: ConnectionPool,
    default_locator: Option<LocatorHandle>,
    default_router: Option<RouterHandle>,
    destroyed: CancellationToken,
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    connector: Arc<dyn Connector>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    default_locator: Option<LocatorHandle>,
    default_router: Option<RouterHandle>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default [`BoundedRetryPolicy`].
    #[must_use]
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Locator installed on every proxy created by the runtime.
    #[must_use]
    pub fn default_locator(mut self, locator: LocatorHandle) -> Self {
        self.default_locator = Some(locator);
        self
    }

    /// Router installed on every proxy created by the runtime.
    #[must_use]
    pub fn default_router(mut self, router: RouterHandle) -> Self {
        self.default_router = Some(router);
        self
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` when the config does not validate.
    pub fn build(self) -> Result<Arc<Runtime>> {
        self.config.validate()?;
        let destroyed = CancellationToken::new();
        let retry_policy = self.retry_policy.unwrap_or_else(|| {
            Arc::new(BoundedRetryPolicy::new(
                self.config.clone(),
                destroyed.clone(),
            ))
        });
        Ok(Arc::new(Runtime {
            config: self.config,
            retry_policy,
            pool: ConnectionPool::new(self.connector),
            default_locator: self.default_locator,
            default_router: self.default_router,
            destroyed,
        }))
    }
}

impl Runtime {
    #[must_use]
    pub fn builder(connector: Arc<dyn Connector>) -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            connector,
            retry_policy: None,
            default_locator: None,
            default_router: None,
        }
    }

    /// # Errors
    pub fn create(config: RuntimeConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        Self::builder(connector).config(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// A reference to `identity` carrying the runtime defaults.
    ///
    /// # Errors
    pub fn reference(&self, identity: Identity) -> Result<Reference> {
        Ok(self.with_defaults(Reference::new(identity, &self.config)?))
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` or `IllegalIdentity` on a malformed string.
    pub fn string_to_proxy(self: &Arc<Self>, s: &str) -> Result<ObjectPrx> {
        let reference = self.with_defaults(Reference::parse(s, &self.config)?);
        Ok(self.proxy(reference))
    }

    #[must_use]
    pub fn proxy(self: &Arc<Self>, reference: Reference) -> ObjectPrx {
        ObjectPrx::new(Arc::clone(self), Arc::new(reference))
    }

    fn with_defaults(&self, reference: Reference) -> Reference {
        let reference = Arc::new(reference)
            .change_locator(self.default_locator.clone())
            .change_router(self.default_router.clone());
        Arc::unwrap_or_clone(reference)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    pub(crate) fn destroyed(&self) -> &CancellationToken {
        &self.destroyed
    }

    /// # Errors
    ///
    /// Fails with `RuntimeDestroyed` once [`Runtime::destroy`] was called.
    pub fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::new(
                ErrorKind::RuntimeDestroyed,
                "runtime is destroyed".to_string(),
            ));
        }
        Ok(())
    }

    /// Stops retries and in-flight waits, then closes every connection.
    pub async fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        tracing::info!("destroying runtime");
        self.destroyed.cancel();
        self.pool.close_all().await;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("retry_policy", &self.retry_policy)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
