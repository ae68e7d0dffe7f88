//! In-process transport for tests and demos.
//!
//! Every frame sent over a [`MockConnection`] is decoded and each request
//! in it is handed to a responder closure that scripts the peer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use foldhash::fast::RandomState;
use parking_lot::Mutex;

use crate::{
    Connection, Connector, Endpoint, Message, MsgMeta, Payload, ReplyStatus, Waiter,
    error::{Error, ErrorKind, Result},
    msg::{encode_frame, parse_frame},
};

/// A request as seen by the scripted peer.
#[derive(Clone, Debug)]
pub struct MockRequest {
    /// Position among all requests the connector has seen, from 0.
    pub index: usize,
    pub endpoint: Endpoint,
    pub meta: MsgMeta,
    pub payload: Payload,
}

#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// Answer with `status` if the request expects a reply.
    Reply(ReplyStatus, Payload),
    /// Refuse the write and mark the connection closed.
    FailSend(Error),
    /// Refuse the write but leave the connection open.
    Reject(Error),
    /// Accept the write, then lose the connection with `error`.
    LoseConnection(Error),
    /// Accept the write and never answer.
    Silent,
}

enum ConnectBehavior {
    Refuse,
    Delay(Duration),
}

type Responder = dyn Fn(&MockRequest) -> MockOutcome + Send + Sync;

struct MockState {
    responder: Box<Responder>,
    connects: AtomicUsize,
    frames: Mutex<Vec<Bytes>>,
    requests: Mutex<Vec<MockRequest>>,
    behaviors: dashmap::DashMap<Endpoint, ConnectBehavior, RandomState>,
}

#[derive(Clone)]
pub struct MockConnector(Arc<MockState>);

impl MockConnector {
    pub fn new(responder: impl Fn(&MockRequest) -> MockOutcome + Send + Sync + 'static) -> Self {
        Self(Arc::new(MockState {
            responder: Box::new(responder),
            connects: AtomicUsize::default(),
            frames: Mutex::default(),
            requests: Mutex::default(),
            behaviors: dashmap::DashMap::default(),
        }))
    }

    /// A peer that answers every request with its own parameters.
    #[must_use]
    pub fn echo() -> Self {
        Self::new(|req| MockOutcome::Reply(ReplyStatus::Ok, req.payload.clone()))
    }

    /// Connects to `endpoint` fail with `ConnectionRefused`.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.0.behaviors.insert(endpoint.clone(), ConnectBehavior::Refuse);
    }

    /// Connects to `endpoint` take `delay` before succeeding.
    pub fn delay_connect(&self, endpoint: &Endpoint, delay: Duration) {
        self.0
            .behaviors
            .insert(endpoint.clone(), ConnectBehavior::Delay(delay));
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.0.connects.load(Ordering::SeqCst)
    }

    /// Number of frames written, whether or not the write succeeded.
    #[must_use]
    pub fn sends(&self) -> usize {
        self.0.frames.lock().len()
    }

    #[must_use]
    pub fn frames(&self) -> Vec<Bytes> {
        self.0.frames.lock().clone()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<MockRequest> {
        self.0.requests.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint, waiter: Arc<Waiter>) -> Result<Arc<dyn Connection>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        let delay = match self.0.behaviors.get(endpoint).as_deref() {
            Some(ConnectBehavior::Refuse) => {
                return Err(Error::new(
                    ErrorKind::ConnectionRefused,
                    format!("{endpoint} refused the connection"),
                ));
            }
            Some(ConnectBehavior::Delay(delay)) => Some(*delay),
            None => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(MockConnection {
            endpoint: endpoint.clone(),
            waiter,
            closed: AtomicBool::default(),
            state: Arc::clone(&self.0),
        }))
    }
}

pub struct MockConnection {
    endpoint: Endpoint,
    waiter: Arc<Waiter>,
    closed: AtomicBool,
    state: Arc<MockState>,
}

impl MockConnection {
    fn lose(&self, error: Error) {
        self.closed.store(true, Ordering::SeqCst);
        self.waiter.fail_all(error);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::new(
                ErrorKind::SendFailed,
                format!("connection to {} is closed", self.endpoint),
            ));
        }
        self.state.frames.lock().push(frame.clone());
        let messages =
            parse_frame(frame).map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;

        let mut replies = Vec::new();
        let mut lost = None;
        for Message { meta, payload } in messages {
            let request = {
                let mut requests = self.state.requests.lock();
                let request = MockRequest {
                    index: requests.len(),
                    endpoint: self.endpoint.clone(),
                    meta,
                    payload,
                };
                requests.push(request.clone());
                request
            };
            match (self.state.responder)(&request) {
                MockOutcome::Reply(status, payload) => {
                    if request.meta.request_id != 0 {
                        let reply = Message::reply(
                            request.meta.request_id,
                            status,
                            payload,
                            request.meta.use_msgpack(),
                        );
                        replies.push(reply.to_chunk()?);
                    }
                }
                MockOutcome::FailSend(error) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(error);
                }
                MockOutcome::Reject(error) => return Err(error),
                MockOutcome::LoseConnection(error) => {
                    lost = Some(error);
                    break;
                }
                MockOutcome::Silent => {}
            }
        }

        if !replies.is_empty() {
            self.waiter.post_frame(encode_frame(&replies)?)?;
        }
        if let Some(error) = lost {
            self.lose(error);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.lose(Error::new(
            ErrorKind::ConnectionClosed,
            format!("connection to {} closed locally", self.endpoint),
        ));
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}
