#![forbid(unsafe_code)]

extern crate self as farcall;

pub use farcall_macro::interface;

mod error;
pub use error::{Error, ErrorClass, ErrorKind, Result};

mod config;
pub use config::{CONNECTION_TIMEOUT, INFINITE_TIMEOUT, RuntimeConfig};

mod identity;
pub use identity::Identity;

mod endpoint;
pub use endpoint::{Endpoint, Protocol};

mod reference;
pub use reference::{Context, EncodingVersion, EndpointSelection, InvocationMode, Reference};

mod locator;
pub use locator::{Locator, LocatorHandle};

mod router;
pub use router::{Router, RouterHandle};

mod payload;
pub use payload::Payload;

pub mod msg;
pub use msg::{Message, MsgFlags, MsgMeta, OperationMode, ReplyStatus};

mod waiter;
pub use waiter::{Waiter, WaiterCleaner};

mod receiver;
pub use receiver::Receiver;

mod transport;
pub use transport::{Connection, Connector};

mod connection_pool;
pub use connection_pool::{ConnectionPool, PooledConnection};

mod handler;
pub use handler::{HandlerCell, RequestHandler};

mod batch;
pub use batch::{Batch, BatchRequestQueue};

mod retry;
pub use retry::{BoundedRetryPolicy, NoRetryPolicy, RetryDecision, RetryPolicy, is_retry_eligible};

mod runtime;
pub use runtime::{Runtime, RuntimeBuilder};

mod invocation;
pub use invocation::{Invocation, Reply};

mod proxy;
pub use proxy::{
    ObjectPrx, Prx, proxy_identity_and_facet_cmp, proxy_identity_and_facet_eq, proxy_identity_cmp,
    proxy_identity_eq,
};

pub mod mock_transport;
pub use mock_transport::{MockConnector, MockOutcome, MockRequest};
