use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use foldhash::fast::RandomState;
use tokio::sync::{OnceCell, RwLock};

use crate::{
    Connection, Connector, Endpoint, Receiver, Waiter,
    error::{Error, ErrorKind, Result},
};

/// A pooled connection and the waiter its replies are posted to.
#[derive(Clone, Debug)]
pub struct PooledConnection {
    connection: Arc<dyn Connection>,
    waiter: Arc<Waiter>,
}

impl PooledConnection {
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        self.connection.endpoint()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub(crate) fn alloc(&self) -> (u64, Receiver) {
        self.waiter.alloc()
    }

    /// # Errors
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.connection.send(frame).await
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ConnectionKey {
    endpoint: Endpoint,
    connection_id: String,
}

type ConnectionCell = Arc<OnceCell<PooledConnection>>;

/// Connections shared by every proxy of a runtime, keyed by endpoint and
/// connection id.
///
/// The map lock is never held while connecting: concurrent acquires of
/// one key share a cell and wait on it, other keys are not blocked.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connection_map: RwLock<HashMap<ConnectionKey, ConnectionCell, RandomState>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection_map: RwLock::default(),
        }
    }

    /// Returns a connection to the first reachable endpoint, in order.
    ///
    /// `default_timeout` applies to endpoints without their own timeout.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last endpoint tried.
    pub async fn acquire(
        &self,
        endpoints: &[Endpoint],
        connection_id: &str,
        default_timeout: i32,
    ) -> Result<PooledConnection> {
        let mut last_error = None;
        for endpoint in endpoints {
            match self.acquire_one(endpoint, connection_id, default_timeout).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::debug!("connect to {endpoint} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::new(ErrorKind::NoEndpoint, "no endpoint to connect to".to_string())
        }))
    }

    async fn acquire_one(
        &self,
        endpoint: &Endpoint,
        connection_id: &str,
        default_timeout: i32,
    ) -> Result<PooledConnection> {
        let key = ConnectionKey {
            endpoint: endpoint.clone(),
            connection_id: connection_id.to_string(),
        };
        let cell = self.cell(key).await;
        cell.get_or_try_init(|| self.connect(endpoint, default_timeout))
            .await
            .cloned()
    }

    /// The cell of `key`, replacing one whose connection was closed.
    async fn cell(&self, key: ConnectionKey) -> ConnectionCell {
        let usable = |cell: &ConnectionCell| cell.get().is_none_or(|c| !c.is_closed());

        // Check if the cell is already in the map.
        if let Ok(connection_map) = self.connection_map.try_read()
            && let Some(cell) = connection_map.get(&key)
            && usable(cell)
        {
            return Arc::clone(cell);
        }

        // If not, insert a fresh one.
        let mut connection_map = self.connection_map.write().await;
        let cell = connection_map.entry(key).or_default();
        if !usable(cell) {
            *cell = ConnectionCell::default();
        }
        Arc::clone(cell)
    }

    async fn connect(&self, endpoint: &Endpoint, default_timeout: i32) -> Result<PooledConnection> {
        let timeout = if endpoint.timeout == -1 {
            default_timeout
        } else {
            endpoint.timeout
        };
        let waiter = Arc::new(Waiter::default());
        let connect = self.connector.connect(endpoint, Arc::clone(&waiter));
        let connection = match u64::try_from(timeout) {
            Ok(ms) => tokio::time::timeout(Duration::from_millis(ms), connect)
                .await
                .map_err(|_| {
                    Error::new(
                        ErrorKind::ConnectTimeout,
                        format!("connect to {endpoint} timed out after {ms}ms"),
                    )
                })??,
            Err(_) => connect.await?,
        };
        tracing::debug!("connected to {endpoint}");
        Ok(PooledConnection { connection, waiter })
    }

    /// Drops `connection` from the pool so the next acquire reconnects.
    /// Requests already in flight on it are left to the transport.
    pub async fn remove(&self, connection: &PooledConnection) {
        let mut connection_map = self.connection_map.write().await;
        connection_map.retain(|_, cell| {
            cell.get()
                .is_none_or(|c| !Arc::ptr_eq(&c.connection, &connection.connection))
        });
    }

    pub async fn close_all(&self) {
        let cells: Vec<_> = self.connection_map.write().await.drain().collect();
        for (_, cell) in cells {
            if let Some(connection) = cell.get() {
                connection.connection.close().await;
            }
        }
    }

    /// Number of established connections.
    pub async fn len(&self) -> usize {
        self.connection_map
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockConnector;

    #[tokio::test]
    async fn test_acquire_reuses_connection() {
        let connector = MockConnector::echo();
        let pool = ConnectionPool::new(Arc::new(connector.clone()));
        let endpoint = Endpoint::tcp("localhost", 10000);

        let a = pool.acquire(&[endpoint.clone()], "", -1).await.unwrap();
        let b = pool.acquire(&[endpoint.clone()], "", -1).await.unwrap();
        assert!(Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(connector.connects(), 1);

        let c = pool.acquire(&[endpoint.clone()], "other", -1).await.unwrap();
        assert!(!Arc::ptr_eq(a.connection(), c.connection()));
        assert_eq!(connector.connects(), 2);
        assert_eq!(pool.len().await, 2);

        a.connection().close().await;
        let d = pool.acquire(&[endpoint], "", -1).await.unwrap();
        assert!(!Arc::ptr_eq(a.connection(), d.connection()));
        assert_eq!(connector.connects(), 3);

        pool.close_all().await;
        assert_eq!(pool.len().await, 0);
        assert!(d.is_closed());
    }

    #[tokio::test]
    async fn test_acquire_fails_over() {
        let connector = MockConnector::echo();
        let down = Endpoint::tcp("down", 1);
        let up = Endpoint::tcp("up", 2);
        connector.refuse(&down);
        let pool = ConnectionPool::new(Arc::new(connector.clone()));

        let connection = pool.acquire(&[down.clone(), up.clone()], "", -1).await.unwrap();
        assert_eq!(connection.endpoint(), &up);

        let err = pool.acquire(&[down], "", -1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionRefused);

        let err = pool.acquire(&[], "", -1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoEndpoint);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = MockConnector::echo();
        let slow = Endpoint::tcp("slow", 1);
        connector.delay_connect(&slow, Duration::from_secs(5));
        let pool = ConnectionPool::new(Arc::new(connector));

        let err = pool.acquire(&[slow.with_timeout(20)], "", -1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectTimeout);
        let err = pool.acquire(&[slow], "", 20).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectTimeout);
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_block_others() {
        let connector = MockConnector::echo();
        let slow = Endpoint::tcp("slow", 1);
        let fast = Endpoint::tcp("fast", 2);
        connector.delay_connect(&slow, Duration::from_millis(500));
        let pool = ConnectionPool::new(Arc::new(connector.clone()));

        let slow_endpoints = [slow.clone()];
        let (slow_connection, elapsed) = tokio::join!(pool.acquire(&slow_endpoints, "", -1), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let start = std::time::Instant::now();
            pool.acquire(&[fast], "", -1).await.unwrap();
            start.elapsed()
        });
        assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
        assert_eq!(slow_connection.unwrap().endpoint(), &slow);

        // concurrent acquires of one key share the connect
        let shared = [Endpoint::tcp("shared", 3)];
        let (a, b) = tokio::join!(pool.acquire(&shared, "", -1), pool.acquire(&shared, "", -1));
        assert!(Arc::ptr_eq(a.unwrap().connection(), b.unwrap().connection()));
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_remove_forces_reconnect() {
        let connector = MockConnector::echo();
        let endpoint = Endpoint::tcp("localhost", 10000);
        let pool = ConnectionPool::new(Arc::new(connector.clone()));

        let a = pool.acquire(&[endpoint.clone()], "", -1).await.unwrap();
        pool.remove(&a).await;
        assert_eq!(pool.len().await, 0);
        assert!(!a.is_closed());

        let b = pool.acquire(&[endpoint], "", -1).await.unwrap();
        assert!(!Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(connector.connects(), 2);
    }
}
