#![forbid(unsafe_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use farcall::{
    Context, Endpoint, EndpointSelection, Error, ErrorKind, Locator, LocatorHandle, MockConnector,
    MockOutcome, OperationMode, Payload, Prx, ReplyStatus, Router, RouterHandle, Runtime,
    RuntimeConfig,
};
use tokio_util::sync::CancellationToken;

const PRINTER: &str = "printer:tcp -h 127.0.0.1 -p 10000";

fn runtime(connector: &MockConnector) -> Arc<Runtime> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::create(RuntimeConfig::default(), Arc::new(connector.clone())).unwrap()
}

fn ok() -> MockOutcome {
    MockOutcome::Reply(ReplyStatus::Ok, Payload::Empty)
}

#[tokio::test]
async fn test_ping_retried_after_graceful_close() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::LoseConnection(Error::kind(ErrorKind::ConnectionClosed))
        } else {
            ok()
        }
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    proxy.ping().await.unwrap();
    assert_eq!(connector.requests().len(), 2);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_normal_operation_retried_after_graceful_close() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::LoseConnection(Error::kind(ErrorKind::ConnectionClosed))
        } else {
            ok()
        }
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    let (ok, _) = proxy
        .invoke("print_string", OperationMode::Normal, Payload::Empty, None)
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(connector.requests().len(), 2);
}

#[tokio::test]
async fn test_reset_after_send_not_retried() {
    let connector = MockConnector::new(|_| {
        MockOutcome::LoseConnection(Error::kind(ErrorKind::ConnectionReset))
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    let err = proxy
        .invoke("print_string", OperationMode::Normal, Payload::Empty, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionReset);
    assert_eq!(err.attempts, 1);
    assert_eq!(err.operation.as_deref(), Some("print_string"));
    assert_eq!(connector.requests().len(), 1);
}

#[tokio::test]
async fn test_reset_after_send_retried_when_idempotent() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::LoseConnection(Error::kind(ErrorKind::ConnectionReset))
        } else {
            ok()
        }
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    proxy
        .invoke("queue_len", OperationMode::Idempotent, Payload::Empty, None)
        .await
        .unwrap();
    assert_eq!(connector.requests().len(), 2);
}

#[tokio::test]
async fn test_failure_before_send_retried() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::FailSend(Error::kind(ErrorKind::ConnectionReset))
        } else {
            ok()
        }
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    proxy
        .invoke("print_string", OperationMode::Normal, Payload::Empty, None)
        .await
        .unwrap();
    assert_eq!(connector.requests().len(), 2);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_failed_endpoint_tried_last() {
    let connector = MockConnector::new(|req| {
        if req.endpoint.host == "a" {
            MockOutcome::Reject(Error::kind(ErrorKind::ConnectionReset))
        } else {
            ok()
        }
    });
    let proxy = runtime(&connector)
        .string_to_proxy("printer:tcp -h a -p 1:tcp -h b -p 2")
        .unwrap()
        .with_endpoint_selection(EndpointSelection::Ordered);

    proxy
        .invoke("print_string", OperationMode::Normal, Payload::Empty, None)
        .await
        .unwrap();
    let requests = connector.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].endpoint.host, "a");
    assert_eq!(requests[1].endpoint.host, "b");
    assert_eq!(connector.connects(), 2);

    // the handler now sticks to b
    proxy.ping().await.unwrap();
    assert_eq!(connector.requests()[2].endpoint.host, "b");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_failed_connection_leaves_pool() {
    let connector =
        MockConnector::new(|_| MockOutcome::Reject(Error::kind(ErrorKind::ConnectionReset)));
    let config: RuntimeConfig = serde_json::from_str(r#"{"max_retry_attempts": 2}"#).unwrap();
    let runtime = Runtime::create(config, Arc::new(connector.clone())).unwrap();
    let proxy = runtime.string_to_proxy(PRINTER).unwrap();

    let err = proxy
        .invoke("print_string", OperationMode::Normal, Payload::Empty, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionReset);
    assert_eq!(err.attempts, 3);
    assert_eq!(connector.connects(), 3);
}

#[tokio::test]
async fn test_slow_endpoint_does_not_block_other_proxies() {
    let connector = MockConnector::echo();
    connector.delay_connect(&Endpoint::tcp("slow", 1), Duration::from_millis(500));
    let runtime = runtime(&connector);
    let slow = runtime.string_to_proxy("printer:tcp -h slow -p 1").unwrap();
    let fast = runtime.string_to_proxy("scanner:tcp -h fast -p 2").unwrap();

    let (slow, elapsed) = tokio::join!(slow.ping(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = std::time::Instant::now();
        fast.ping().await.unwrap();
        start.elapsed()
    });
    slow.unwrap();
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let connector = MockConnector::new(|_| {
        MockOutcome::LoseConnection(Error::kind(ErrorKind::ConnectionClosed))
    });
    let config: RuntimeConfig = serde_json::from_str(r#"{"max_retry_attempts": 2}"#).unwrap();
    let runtime = Runtime::create(config, Arc::new(connector.clone())).unwrap();
    let proxy = runtime.string_to_proxy(PRINTER).unwrap();

    let err = proxy.ping().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    assert_eq!(err.attempts, 3);
    assert_eq!(connector.requests().len(), 3);
}

#[tokio::test]
async fn test_user_exception_not_retried() {
    let connector = MockConnector::new(|req| {
        let jammed = Error::new(ErrorKind::UserException("::Demo::Jammed".into()), "paper".into());
        MockOutcome::Reply(
            ReplyStatus::UserException,
            Payload::encode(&jammed, req.meta.use_msgpack()).unwrap(),
        )
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    let err = proxy
        .invoke_typed::<_, ()>("print_string", OperationMode::Idempotent, "hello", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UserException("::Demo::Jammed".into()));
    assert_eq!(err.msg, "paper");

    let (ok, payload) = proxy
        .invoke("print_string", OperationMode::Idempotent, Payload::Empty, None)
        .await
        .unwrap();
    assert!(!ok);
    assert!(!payload.is_empty());
    assert_eq!(connector.requests().len(), 2);
}

#[tokio::test]
async fn test_operation_not_exist_not_retried() {
    let connector =
        MockConnector::new(|_| MockOutcome::Reply(ReplyStatus::OperationNotExist, Payload::Empty));
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    let err = proxy.ping().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::OperationNotExist);
    assert_eq!(err.attempts, 1);
    // the connection stays usable
    assert!(proxy.cached_connection().is_some());
}

#[tokio::test]
async fn test_object_not_exist_retried() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::Reply(ReplyStatus::ObjectNotExist, Payload::Empty)
        } else {
            ok()
        }
    });
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    proxy
        .invoke("print_string", OperationMode::Normal, Payload::Empty, None)
        .await
        .unwrap();
    assert_eq!(connector.requests().len(), 2);
}

#[tokio::test]
async fn test_invocation_timeout() {
    let connector = MockConnector::new(|_| MockOutcome::Silent);
    let proxy = runtime(&connector)
        .string_to_proxy(PRINTER)
        .unwrap()
        .with_invocation_timeout(50)
        .unwrap();

    let err = proxy.ping().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvocationTimeout);
    assert_eq!(err.attempts, 1);
    assert_eq!(connector.requests().len(), 1);
}

#[tokio::test]
async fn test_cancellation() {
    let connector = MockConnector::new(|_| MockOutcome::Silent);
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };
    let err = proxy
        .request("print_string", OperationMode::Idempotent)
        .cancellation(token)
        .invoke(Payload::Empty)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(connector.requests().len(), 1);
}

#[tokio::test]
async fn test_twoway_only_fails_before_io() {
    let connector = MockConnector::echo();
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    for oneway in [proxy.as_oneway(), proxy.as_batch_oneway(), proxy.as_datagram()] {
        assert_eq!(oneway.ids().await.unwrap_err().kind, ErrorKind::TwowayOnly);
        assert_eq!(oneway.id().await.unwrap_err().kind, ErrorKind::TwowayOnly);
        let err = oneway.is_a("::Demo::Printer").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TwowayOnly);
        assert_eq!(err.operation.as_deref(), Some("_is_a"));
    }
    assert_eq!(connector.connects(), 0);
    assert_eq!(connector.sends(), 0);
}

#[tokio::test]
async fn test_oneway_ping() {
    let connector = MockConnector::echo();
    let proxy = runtime(&connector)
        .string_to_proxy(PRINTER)
        .unwrap()
        .as_oneway();

    proxy.ping().await.unwrap();
    let requests = connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].meta.request_id, 0);
    assert_eq!(requests[0].meta.operation, "_ping");
}

#[tokio::test]
async fn test_datagram_ping() {
    let connector = MockConnector::new(|_| MockOutcome::Silent);
    let proxy = runtime(&connector)
        .string_to_proxy("printer:tcp -h 127.0.0.1 -p 10000:udp -h 127.0.0.1 -p 10001")
        .unwrap()
        .as_datagram();

    proxy.ping().await.unwrap();
    let requests = connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].endpoint.port, 10001);
    assert!(requests[0].endpoint.is_datagram());
    assert_eq!(requests[0].meta.request_id, 0);
    assert_eq!(requests[0].meta.operation, "_ping");

    let err = proxy.id().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TwowayOnly);

    // no datagram endpoint to send to
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap().as_datagram();
    let err = proxy.ping().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoEndpoint);
    assert_eq!(connector.requests().len(), 1);
}

#[tokio::test]
async fn test_concurrent_resolution_shares_handler() {
    let connector = MockConnector::echo();
    let slow = Endpoint::tcp("127.0.0.1", 10000);
    connector.delay_connect(&slow, Duration::from_millis(20));
    let proxy = runtime(&connector).string_to_proxy(PRINTER).unwrap();

    let results = futures_util::future::join_all((0..8).map(|_| proxy.ping())).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.requests().len(), 8);

    let handler = proxy.cached_request_handler().unwrap();
    assert!(!handler.is_pending());
    assert!(proxy.cached_connection().is_some());
}

#[tokio::test]
async fn test_connection_not_cached() {
    let connector = MockConnector::echo();
    let proxy = runtime(&connector)
        .string_to_proxy(PRINTER)
        .unwrap()
        .with_connection_cached(false);

    proxy.ping().await.unwrap();
    proxy.ping().await.unwrap();
    assert!(proxy.cached_request_handler().is_none());
    // the runtime's pool still shares the connection
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_explicit_context_replaces_proxy_context() {
    let connector = MockConnector::echo();
    let proxy = runtime(&connector)
        .string_to_proxy(PRINTER)
        .unwrap()
        .with_context(Context::from([("tray".to_string(), "1".to_string())]));

    proxy.ping().await.unwrap();
    let explicit = Context::from([("color".to_string(), "mono".to_string())]);
    proxy
        .request("print_string", OperationMode::Normal)
        .context(explicit.clone())
        .invoke(Payload::Empty)
        .await
        .unwrap();

    let requests = connector.requests();
    assert_eq!(requests[0].meta.context, *proxy.context());
    assert_eq!(requests[1].meta.context, explicit);
}

#[tokio::test]
async fn test_connection_retrieval() {
    let connector = MockConnector::echo();
    let down = Endpoint::tcp("10.0.0.1", 10000);
    connector.refuse(&down);
    let proxy = runtime(&connector)
        .string_to_proxy("printer:tcp -h 10.0.0.1 -p 10000:tcp -h 10.0.0.2 -p 10000")
        .unwrap();

    assert!(proxy.cached_connection().is_none());
    let connection = proxy.connection().await.unwrap();
    assert_eq!(connection.endpoint().host, "10.0.0.2");
    assert_eq!(connector.sends(), 0);
    assert!(proxy.cached_connection().is_some());
}

#[tokio::test]
async fn test_runtime_destroyed() {
    let connector = MockConnector::echo();
    let runtime = runtime(&connector);
    let proxy = runtime.string_to_proxy(PRINTER).unwrap();
    proxy.ping().await.unwrap();

    runtime.destroy().await;
    let err = proxy.ping().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeDestroyed);
    assert_eq!(err.attempts, 1);
    assert_eq!(connector.requests().len(), 1);
}

#[derive(Default)]
struct CountingLocator {
    lookups: AtomicUsize,
}

#[async_trait::async_trait]
impl Locator for CountingLocator {
    async fn resolve(&self, _: &str) -> farcall::Result<Vec<Endpoint>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Endpoint::tcp("127.0.0.1", 10000)])
    }
}

#[tokio::test]
async fn test_locator_cache_cleared_before_retry() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::Reply(ReplyStatus::ObjectNotExist, Payload::Empty)
        } else {
            ok()
        }
    });
    let locator = Arc::new(CountingLocator::default());
    let handle = LocatorHandle::new("IceGrid/Locator".parse().unwrap(), locator.clone());
    let runtime = Runtime::builder(Arc::new(connector.clone()))
        .default_locator(handle.clone())
        .build()
        .unwrap();
    let proxy = runtime.string_to_proxy("printer @ PrinterAdapter").unwrap();
    assert_eq!(proxy.locator(), Some(&handle));

    proxy.ping().await.unwrap();
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(connector.requests().len(), 2);

    proxy.ping().await.unwrap();
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct CountingRouter {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Router for CountingRouter {
    async fn client_endpoints(&self) -> farcall::Result<Vec<Endpoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Endpoint::tcp("router", 4063)])
    }
}

#[tokio::test]
async fn test_router_cache_cleared_before_retry() {
    let connector = MockConnector::new(|req| {
        if req.index == 0 {
            MockOutcome::Reply(ReplyStatus::ObjectNotExist, Payload::Empty)
        } else {
            ok()
        }
    });
    let router = Arc::new(CountingRouter::default());
    let handle = RouterHandle::new("Glacier2/router".parse().unwrap(), router.clone());
    let runtime = Runtime::builder(Arc::new(connector.clone()))
        .default_router(handle)
        .build()
        .unwrap();
    let proxy = runtime.string_to_proxy(PRINTER).unwrap();

    proxy.ping().await.unwrap();
    assert_eq!(router.calls.load(Ordering::SeqCst), 2);
    assert!(connector.requests().iter().all(|req| req.endpoint.port == 4063));

    proxy.ping().await.unwrap();
    assert_eq!(router.calls.load(Ordering::SeqCst), 2);
}
