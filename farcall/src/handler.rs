use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::OnceCell;

use crate::{Endpoint, PooledConnection, Reference, Result, Runtime};

enum HandlerState {
    /// Connection establishment has not finished. Concurrent callers share
    /// the one attempt in flight.
    Pending(OnceCell<PooledConnection>),
    Connected(PooledConnection),
}

/// Sends requests of one reference over one connection.
///
/// A handler starts out pending and is replaced in the proxy's cache by a
/// connected one once the connection is up.
pub struct RequestHandler {
    reference: Arc<Reference>,
    state: HandlerState,
}

impl RequestHandler {
    #[must_use]
    pub fn pending(reference: Arc<Reference>) -> Arc<Self> {
        Arc::new(Self {
            reference,
            state: HandlerState::Pending(OnceCell::new()),
        })
    }

    #[must_use]
    pub fn connected(reference: Arc<Reference>, connection: PooledConnection) -> Arc<Self> {
        Arc::new(Self {
            reference,
            state: HandlerState::Connected(connection),
        })
    }

    #[must_use]
    pub fn reference(&self) -> &Arc<Reference> {
        &self.reference
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, HandlerState::Pending(_))
    }

    /// Resolves endpoints and connects, or returns the established connection.
    /// Endpoints in `failed` are tried last.
    ///
    /// # Errors
    pub async fn connection(&self, runtime: &Runtime, failed: &[Endpoint]) -> Result<PooledConnection> {
        match &self.state {
            HandlerState::Connected(connection) => Ok(connection.clone()),
            HandlerState::Pending(cell) => cell
                .get_or_try_init(|| async {
                    let endpoints = self.reference.resolve_endpoints().await?;
                    let mut endpoints = self.reference.filter_endpoints(&endpoints)?;
                    endpoints.sort_by_key(|e| failed.contains(e));
                    runtime
                        .pool()
                        .acquire(
                            &endpoints,
                            self.reference.connection_id(),
                            runtime.config().connect_timeout_ms,
                        )
                        .await
                })
                .await
                .cloned(),
        }
    }

    /// The connection, if establishment already finished.
    #[must_use]
    pub fn cached_connection(&self) -> Option<PooledConnection> {
        match &self.state {
            HandlerState::Connected(connection) => Some(connection.clone()),
            HandlerState::Pending(cell) => cell.get().cloned(),
        }
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("reference", &self.reference.to_string())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Lock-free slot for the handler a proxy caches.
#[derive(Default)]
pub struct HandlerCell(ArcSwapOption<RequestHandler>);

impl HandlerCell {
    #[must_use]
    pub fn get(&self) -> Option<Arc<RequestHandler>> {
        self.0.load_full()
    }

    /// Installs `handler` unless another one is already cached, and returns
    /// whichever handler ends up installed.
    pub fn install(&self, handler: Arc<RequestHandler>) -> Arc<RequestHandler> {
        let empty: Option<Arc<RequestHandler>> = None;
        let previous = self.0.compare_and_swap(&empty, Some(Arc::clone(&handler)));
        match &*previous {
            Some(existing) => Arc::clone(existing),
            None => handler,
        }
    }

    /// Replaces `previous` by `current` if `previous` is still installed.
    pub fn update(&self, previous: &Arc<RequestHandler>, current: Option<Arc<RequestHandler>>) -> bool {
        let expected = Some(Arc::clone(previous));
        let found = self.0.compare_and_swap(&expected, current);
        (*found).as_ref().is_some_and(|h| Arc::ptr_eq(h, previous))
    }
}

impl std::fmt::Debug for HandlerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HandlerCell").field(&self.get()).finish()
    }
}
