use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Endpoint, Result, Waiter};

/// An established connection to one endpoint.
///
/// Inbound frames are handed to the [`Waiter`] passed at connect time.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    fn endpoint(&self) -> &Endpoint;

    /// Writes one frame. `Ok` means the frame left the process and the
    /// server may act on it.
    ///
    /// # Errors
    async fn send(&self, frame: Bytes) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Closes the connection and fails the requests still waiting on it.
    async fn close(&self);
}

/// Opens connections for the runtime.
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    async fn connect(&self, endpoint: &Endpoint, waiter: Arc<Waiter>) -> Result<Arc<dyn Connection>>;
}
