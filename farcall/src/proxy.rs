use std::{
    cmp::Ordering,
    sync::{Arc, OnceLock},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    BatchRequestQueue, Connection, Context, EncodingVersion, Endpoint, EndpointSelection,
    HandlerCell, Identity, Invocation, InvocationMode, LocatorHandle, OperationMode, Payload,
    Reference, RequestHandler, RouterHandle, Runtime,
    error::{Error, ErrorKind, Result},
};

const PING: &str = "_ping";
const IDS: &str = "_ids";
const ID: &str = "_id";
const IS_A: &str = "_is_a";
const FLUSH_BATCH_REQUESTS: &str = "flush_batch_requests";

struct ProxyState {
    runtime: Arc<Runtime>,
    reference: Arc<Reference>,
    handler: HandlerCell,
    batch: OnceLock<BatchRequestQueue>,
}

/// Untyped proxy to a remote object.
///
/// Cloning shares the cached request handler and batch queue. Every
/// `with_*`/`as_*` call that changes the reference yields an independent
/// proxy with its own.
#[derive(Clone)]
pub struct ObjectPrx(Arc<ProxyState>);

impl ObjectPrx {
    pub(crate) fn new(runtime: Arc<Runtime>, reference: Arc<Reference>) -> Self {
        Self(Arc::new(ProxyState {
            runtime,
            reference,
            handler: HandlerCell::default(),
            batch: OnceLock::new(),
        }))
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.0.runtime
    }

    #[must_use]
    pub fn reference(&self) -> &Arc<Reference> {
        &self.0.reference
    }

    /// True when both are clones of the same proxy.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    fn derive(&self, reference: Arc<Reference>) -> Self {
        if Arc::ptr_eq(&reference, &self.0.reference) {
            self.clone()
        } else {
            Self::new(Arc::clone(&self.0.runtime), reference)
        }
    }

    /// The cached handler, or a fresh pending one. With connection caching
    /// on, the first handler installed wins and concurrent callers share it.
    #[must_use]
    pub fn request_handler(&self) -> Arc<RequestHandler> {
        let cache = self.0.reference.cache_connection();
        if cache && let Some(handler) = self.0.handler.get() {
            return handler;
        }
        let handler = RequestHandler::pending(Arc::clone(&self.0.reference));
        if cache {
            self.0.handler.install(handler)
        } else {
            handler
        }
    }

    #[must_use]
    pub fn cached_request_handler(&self) -> Option<Arc<RequestHandler>> {
        self.0.handler.get()
    }

    /// Replaces `previous` with `current` unless another handler was
    /// installed in between. Passing `None` invalidates the cache.
    pub fn update_request_handler(
        &self,
        previous: &Arc<RequestHandler>,
        current: Option<Arc<RequestHandler>>,
    ) -> bool {
        if !self.0.reference.cache_connection() {
            return false;
        }
        let invalidate = current.is_none();
        let updated = self.0.handler.update(previous, current);
        if updated && invalidate {
            tracing::debug!("invalidated request handler of {}", self.0.reference);
        }
        updated
    }

    pub(crate) fn batch_queue(&self) -> &BatchRequestQueue {
        self.0.batch.get_or_init(BatchRequestQueue::default)
    }

    /// Starts an invocation of `operation` that can be customized before
    /// it is sent.
    #[must_use]
    pub fn request(&self, operation: &str, mode: OperationMode) -> Invocation {
        Invocation::new(self.clone(), operation, mode)
    }

    /// Encodes operation parameters the way this proxy's runtime sends them.
    ///
    /// # Errors
    pub fn encode_params<P: Serialize + ?Sized>(&self, params: &P) -> Result<Payload> {
        Payload::encode(params, self.0.runtime.config().use_msgpack)
    }

    /// Invokes `operation` with already encoded parameters.
    ///
    /// Returns whether the server completed normally, and the encoded
    /// result or user exception.
    ///
    /// # Errors
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Payload,
        context: Option<Context>,
    ) -> Result<(bool, Payload)> {
        let mut invocation = self.request(operation, mode);
        if let Some(context) = context {
            invocation = invocation.context(context);
        }
        Ok(invocation.invoke(params).await?.into_parts())
    }

    /// Encodes `params`, invokes `operation` and decodes the result.
    ///
    /// # Errors
    ///
    /// Fails with `TwowayOnly` before any I/O when `twoway_only` is set and
    /// the proxy is not two-way.
    pub async fn invoke_typed<P, T>(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &P,
        twoway_only: bool,
    ) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if twoway_only && !self.0.reference.mode().is_twoway() {
            return Err(Error::twoway_only(operation));
        }
        let params = self
            .encode_params(params)
            .map_err(|e| e.with_operation(operation))?;
        let reply = self.request(operation, mode).invoke(params).await?;
        reply.decode().map_err(|e| e.with_operation(operation))
    }

    async fn flush(&self) -> Result<()> {
        let Some(queue) = self.0.batch.get() else {
            return Ok(());
        };
        let batch = queue.swap();
        if batch.is_empty() {
            return Ok(());
        }

        let count = batch.count();
        let result = async {
            let frame = batch.to_frame()?;
            // failures to connect are handled by the invocation itself
            let (handler, connection) = self
                .request(FLUSH_BATCH_REQUESTS, OperationMode::Normal)
                .connect_handler()
                .await?;
            if let Err(e) = connection.send(frame).await {
                self.update_request_handler(&handler, None);
                self.0.runtime.pool().remove(&connection).await;
                return Err(e);
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!("flushed {count} batch request(s) of {}", self.0.reference);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("discarding {count} batch request(s) of {}: {e}", self.0.reference);
                Err(e.with_operation(FLUSH_BATCH_REQUESTS))
            }
        }
    }
}

impl std::fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0.reference, f)
    }
}

impl std::fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectPrx({})", self.0.reference)
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.0.reference == other.0.reference
    }
}

impl Eq for ObjectPrx {}

impl PartialOrd for ObjectPrx {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectPrx {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.reference.cmp(&other.0.reference)
    }
}

impl std::hash::Hash for ObjectPrx {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.reference.hash(state);
    }
}

/// Typed proxy surface shared by [`ObjectPrx`] and generated proxies.
///
/// Every `with_*` and `as_*` method keeps the concrete proxy type and
/// returns a clone of the receiver when nothing changes.
#[allow(async_fn_in_trait)]
pub trait Prx: Clone + Send + Sync + Sized + 'static {
    /// Type id of the remote interface.
    const TYPE_ID: &'static str;

    fn from_object(object: ObjectPrx) -> Self;

    fn object(&self) -> &ObjectPrx;

    #[must_use]
    fn reference(&self) -> &Arc<Reference> {
        self.object().reference()
    }

    #[must_use]
    fn runtime(&self) -> &Arc<Runtime> {
        self.object().runtime()
    }

    #[must_use]
    fn identity(&self) -> &Identity {
        self.reference().identity()
    }

    #[must_use]
    fn facet(&self) -> &str {
        self.reference().facet()
    }

    #[must_use]
    fn adapter_id(&self) -> &str {
        self.reference().adapter_id()
    }

    #[must_use]
    fn endpoints(&self) -> &[Endpoint] {
        self.reference().endpoints()
    }

    #[must_use]
    fn mode(&self) -> InvocationMode {
        self.reference().mode()
    }

    #[must_use]
    fn is_twoway(&self) -> bool {
        self.mode() == InvocationMode::Twoway
    }

    #[must_use]
    fn is_oneway(&self) -> bool {
        self.mode() == InvocationMode::Oneway
    }

    #[must_use]
    fn is_batch_oneway(&self) -> bool {
        self.mode() == InvocationMode::BatchOneway
    }

    #[must_use]
    fn is_datagram(&self) -> bool {
        self.mode() == InvocationMode::Datagram
    }

    #[must_use]
    fn is_batch_datagram(&self) -> bool {
        self.mode() == InvocationMode::BatchDatagram
    }

    #[must_use]
    fn is_secure(&self) -> bool {
        self.reference().secure()
    }

    #[must_use]
    fn is_prefer_secure(&self) -> bool {
        self.reference().prefer_secure()
    }

    #[must_use]
    fn encoding(&self) -> EncodingVersion {
        self.reference().encoding()
    }

    #[must_use]
    fn context(&self) -> &Context {
        self.reference().context()
    }

    #[must_use]
    fn invocation_timeout(&self) -> i32 {
        self.reference().invocation_timeout()
    }

    #[must_use]
    fn locator_cache_timeout(&self) -> i32 {
        self.reference().locator_cache_timeout()
    }

    #[must_use]
    fn timeout(&self) -> Option<i32> {
        self.reference().timeout()
    }

    #[must_use]
    fn connection_id(&self) -> &str {
        self.reference().connection_id()
    }

    #[must_use]
    fn compress(&self) -> Option<bool> {
        self.reference().compress()
    }

    #[must_use]
    fn is_connection_cached(&self) -> bool {
        self.reference().cache_connection()
    }

    #[must_use]
    fn endpoint_selection(&self) -> EndpointSelection {
        self.reference().endpoint_selection()
    }

    #[must_use]
    fn is_collocation_optimized(&self) -> bool {
        self.reference().collocation_optimized()
    }

    #[must_use]
    fn router(&self) -> Option<&RouterHandle> {
        self.reference().router()
    }

    #[must_use]
    fn locator(&self) -> Option<&LocatorHandle> {
        self.reference().locator()
    }

    #[must_use]
    fn derive(&self, reference: Arc<Reference>) -> Self {
        Self::from_object(self.object().derive(reference))
    }

    /// # Errors
    fn with_identity(&self, identity: Identity) -> Result<Self> {
        Ok(self.derive(self.reference().change_identity(identity)?))
    }

    #[must_use]
    fn with_facet(&self, facet: &str) -> Self {
        self.derive(self.reference().change_facet(facet))
    }

    #[must_use]
    fn with_adapter_id(&self, adapter_id: &str) -> Self {
        self.derive(self.reference().change_adapter_id(adapter_id))
    }

    #[must_use]
    fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.derive(self.reference().change_endpoints(endpoints))
    }

    #[must_use]
    fn with_mode(&self, mode: InvocationMode) -> Self {
        self.derive(self.reference().change_mode(mode))
    }

    #[must_use]
    fn as_twoway(&self) -> Self {
        self.with_mode(InvocationMode::Twoway)
    }

    #[must_use]
    fn as_oneway(&self) -> Self {
        self.with_mode(InvocationMode::Oneway)
    }

    #[must_use]
    fn as_batch_oneway(&self) -> Self {
        self.with_mode(InvocationMode::BatchOneway)
    }

    #[must_use]
    fn as_datagram(&self) -> Self {
        self.with_mode(InvocationMode::Datagram)
    }

    #[must_use]
    fn as_batch_datagram(&self) -> Self {
        self.with_mode(InvocationMode::BatchDatagram)
    }

    #[must_use]
    fn with_secure(&self, secure: bool) -> Self {
        self.derive(self.reference().change_secure(secure))
    }

    #[must_use]
    fn with_prefer_secure(&self, prefer_secure: bool) -> Self {
        self.derive(self.reference().change_prefer_secure(prefer_secure))
    }

    #[must_use]
    fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        self.derive(self.reference().change_encoding(encoding))
    }

    #[must_use]
    fn with_context(&self, context: Context) -> Self {
        self.derive(self.reference().change_context(context))
    }

    /// # Errors
    fn with_invocation_timeout(&self, timeout: i32) -> Result<Self> {
        Ok(self.derive(self.reference().change_invocation_timeout(timeout)?))
    }

    /// # Errors
    fn with_locator_cache_timeout(&self, timeout: i32) -> Result<Self> {
        Ok(self.derive(self.reference().change_locator_cache_timeout(timeout)?))
    }

    /// # Errors
    fn with_timeout(&self, timeout: i32) -> Result<Self> {
        Ok(self.derive(self.reference().change_timeout(timeout)?))
    }

    #[must_use]
    fn with_connection_id(&self, connection_id: &str) -> Self {
        self.derive(self.reference().change_connection_id(connection_id))
    }

    #[must_use]
    fn with_compress(&self, compress: bool) -> Self {
        self.derive(self.reference().change_compress(compress))
    }

    #[must_use]
    fn with_connection_cached(&self, cached: bool) -> Self {
        self.derive(self.reference().change_cache_connection(cached))
    }

    #[must_use]
    fn with_endpoint_selection(&self, selection: EndpointSelection) -> Self {
        self.derive(self.reference().change_endpoint_selection(selection))
    }

    #[must_use]
    fn with_collocation_optimized(&self, optimized: bool) -> Self {
        self.derive(self.reference().change_collocation_optimized(optimized))
    }

    #[must_use]
    fn with_router(&self, router: Option<RouterHandle>) -> Self {
        self.derive(self.reference().change_router(router))
    }

    #[must_use]
    fn with_locator(&self, locator: Option<LocatorHandle>) -> Self {
        self.derive(self.reference().change_locator(locator))
    }

    /// Checks that the object exists. Works in every mode.
    ///
    /// # Errors
    async fn ping(&self) -> Result<()> {
        self.object()
            .invoke_typed(PING, OperationMode::Idempotent, &(), false)
            .await
    }

    /// # Errors
    async fn ids(&self) -> Result<Vec<String>> {
        self.object()
            .invoke_typed(IDS, OperationMode::Idempotent, &(), true)
            .await
    }

    /// Most derived type id of the object.
    ///
    /// # Errors
    async fn id(&self) -> Result<String> {
        self.object()
            .invoke_typed(ID, OperationMode::Idempotent, &(), true)
            .await
    }

    /// # Errors
    async fn is_a(&self, type_id: &str) -> Result<bool> {
        self.object()
            .invoke_typed(IS_A, OperationMode::Idempotent, type_id, true)
            .await
    }

    /// Asks the object whether it implements `T`.
    ///
    /// # Errors
    async fn checked_cast<T: Prx>(&self) -> Result<Option<T>> {
        if self.is_a(T::TYPE_ID).await? {
            Ok(Some(T::from_object(self.object().clone())))
        } else {
            Ok(None)
        }
    }

    /// Like [`Prx::checked_cast`] on `facet`. A missing facet yields `None`.
    ///
    /// # Errors
    async fn checked_cast_facet<T: Prx>(&self, facet: &str) -> Result<Option<T>> {
        let object = self.object().with_facet(facet);
        match object.is_a(T::TYPE_ID).await {
            Ok(true) => Ok(Some(T::from_object(object))),
            Ok(false) => Ok(None),
            Err(e) if e.kind == ErrorKind::FacetNotExist => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reinterprets the proxy as `T` without contacting the object.
    #[must_use]
    fn unchecked_cast<T: Prx>(&self) -> T {
        T::from_object(self.object().clone())
    }

    /// The connection requests are sent over, connecting if needed.
    ///
    /// # Errors
    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        let connection = self
            .object()
            .request("connection", OperationMode::Idempotent)
            .connect()
            .await?;
        Ok(Arc::clone(connection.connection()))
    }

    /// The connection of the cached request handler, without connecting.
    #[must_use]
    fn cached_connection(&self) -> Option<Arc<dyn Connection>> {
        self.object()
            .cached_request_handler()
            .and_then(|handler| handler.cached_connection())
            .map(|connection| Arc::clone(connection.connection()))
    }

    /// Sends all queued batch requests as one frame. Does nothing when the
    /// queue is empty. On failure the queued requests are discarded.
    ///
    /// # Errors
    async fn flush_batch_requests(&self) -> Result<()> {
        self.object().flush().await
    }

    #[must_use]
    fn batch_request_count(&self) -> usize {
        self.object().0.batch.get().map_or(0, BatchRequestQueue::len)
    }
}

impl Prx for ObjectPrx {
    const TYPE_ID: &'static str = "::Object";

    fn from_object(object: ObjectPrx) -> Self {
        object
    }

    fn object(&self) -> &ObjectPrx {
        self
    }
}

/// Compares proxies by identity only.
#[must_use]
pub fn proxy_identity_eq(a: &impl Prx, b: &impl Prx) -> bool {
    a.identity() == b.identity()
}

#[must_use]
pub fn proxy_identity_cmp(a: &impl Prx, b: &impl Prx) -> Ordering {
    a.identity().cmp(b.identity())
}

/// Compares proxies by identity, then facet.
#[must_use]
pub fn proxy_identity_and_facet_eq(a: &impl Prx, b: &impl Prx) -> bool {
    a.identity() == b.identity() && a.facet() == b.facet()
}

#[must_use]
pub fn proxy_identity_and_facet_cmp(a: &impl Prx, b: &impl Prx) -> Ordering {
    a.identity()
        .cmp(b.identity())
        .then_with(|| a.facet().cmp(b.facet()))
}
