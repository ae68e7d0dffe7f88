use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    Context, Endpoint, Message, MsgFlags, MsgMeta, ObjectPrx, OperationMode, Payload,
    PooledConnection, Receiver, Reference, ReplyStatus, RequestHandler, RetryDecision,
    config::{CONNECTION_TIMEOUT, INFINITE_TIMEOUT},
    error::{Error, ErrorClass, ErrorKind, Result},
    msg::encode_frame,
    retry::is_retry_eligible,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InvocationState {
    Created,
    Resolving,
    Sending,
    AwaitingReply,
    /// Handed to the transport, no reply expected.
    Sent,
    Succeeded,
    UserFailed,
    LocalFailed,
    Retrying,
    Propagated,
}

/// Answer of the server, or the implicit answer of a request that expects none.
#[derive(Debug, Clone)]
pub struct Reply {
    ok: bool,
    payload: Payload,
    use_msgpack: bool,
}

impl Reply {
    fn none() -> Self {
        Self {
            ok: true,
            payload: Payload::Empty,
            use_msgpack: false,
        }
    }

    /// False when the server raised a user exception.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn into_parts(self) -> (bool, Payload) {
        (self.ok, self.payload)
    }

    /// Decodes the result, or the user exception as an error.
    ///
    /// # Errors
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.ok {
            return self.payload.decode(self.use_msgpack);
        }
        let mut error: Error = self.payload.decode(self.use_msgpack)?;
        if !matches!(error.kind, ErrorKind::UserException(_)) {
            error.kind = ErrorKind::UserException(format!("{:?}", error.kind));
        }
        Err(error)
    }
}

struct Completed {
    handler: Arc<RequestHandler>,
    connection: PooledConnection,
    reply: Reply,
}

struct Failure {
    error: Error,
    sent: bool,
    handler: Option<Arc<RequestHandler>>,
    connection: Option<PooledConnection>,
}

impl Failure {
    fn unsent(error: Error, handler: Option<&Arc<RequestHandler>>) -> Self {
        Self {
            error,
            sent: false,
            handler: handler.cloned(),
            connection: None,
        }
    }

    fn on(mut self, connection: &PooledConnection) -> Self {
        self.connection = Some(connection.clone());
        self
    }
}

/// One logical call through a proxy, across all of its attempts.
pub struct Invocation {
    proxy: ObjectPrx,
    operation: String,
    mode: OperationMode,
    context: Option<Context>,
    cancel: CancellationToken,
    state: InvocationState,
    attempts: u32,
    /// Endpoints whose connection failed, tried last on later attempts.
    failed: Vec<Endpoint>,
}

impl Invocation {
    pub(crate) fn new(proxy: ObjectPrx, operation: &str, mode: OperationMode) -> Self {
        Self {
            proxy,
            operation: operation.to_string(),
            mode,
            context: None,
            cancel: CancellationToken::new(),
            state: InvocationState::Created,
            attempts: 0,
            failed: Vec::new(),
        }
    }

    /// Sends `context` instead of the proxy's context.
    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Abandons the call with `Cancelled` once `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sends the request and waits for the reply according to the proxy's
    /// mode. Batch-mode requests are only queued.
    ///
    /// # Errors
    ///
    /// The error of the last attempt, tagged with the operation name and the
    /// number of attempts made.
    pub async fn invoke(mut self, params: Payload) -> Result<Reply> {
        let reference = Arc::clone(self.proxy.reference());
        if reference.mode().is_batch() {
            self.proxy
                .runtime()
                .check_alive()
                .and_then(|()| self.encode(&reference, 0, &params, MsgFlags::IsBatch))
                .map_err(|e| e.with_operation(&self.operation))
                .map(|chunk| self.proxy.batch_queue().enqueue(chunk))?;
            self.transition(InvocationState::Sent);
            return Ok(Reply::none());
        }
        self.run(Some(&params)).await.map(|completed| completed.reply)
    }

    /// Establishes the proxy's connection without sending anything.
    ///
    /// # Errors
    pub async fn connect(self) -> Result<PooledConnection> {
        self.connect_handler().await.map(|(_, connection)| connection)
    }

    /// Like [`Invocation::connect`], also returning the handler the
    /// connection was obtained through.
    pub(crate) async fn connect_handler(mut self) -> Result<(Arc<RequestHandler>, PooledConnection)> {
        self.run(None)
            .await
            .map(|completed| (completed.handler, completed.connection))
    }

    async fn run(&mut self, params: Option<&Payload>) -> Result<Completed> {
        loop {
            self.attempts += 1;
            self.transition(InvocationState::Resolving);
            let failure = match self.attempt(params).await {
                Ok(completed) => return Ok(completed),
                Err(failure) => failure,
            };

            self.transition(InvocationState::LocalFailed);
            let error = match self.handle_failure(failure).await {
                Ok(backoff) => {
                    self.transition(InvocationState::Retrying);
                    if backoff.is_zero() {
                        continue;
                    }
                    let runtime = self.proxy.runtime();
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => continue,
                        () = runtime.destroyed().cancelled() => Error::kind(ErrorKind::RuntimeDestroyed),
                        () = self.cancel.cancelled() => Error::kind(ErrorKind::Cancelled),
                    }
                }
                Err(error) => error,
            };
            self.transition(InvocationState::Propagated);
            return Err(error
                .with_operation(&self.operation)
                .with_attempts(self.attempts));
        }
    }

    async fn attempt(&mut self, params: Option<&Payload>) -> std::result::Result<Completed, Failure> {
        let runtime = Arc::clone(self.proxy.runtime());
        runtime.check_alive().map_err(|e| Failure::unsent(e, None))?;
        if self.cancel.is_cancelled() {
            return Err(Failure::unsent(Error::kind(ErrorKind::Cancelled), None));
        }

        let handler = self.proxy.request_handler();
        let connection = tokio::select! {
            r = handler.connection(&runtime, &self.failed) => r,
            () = self.cancel.cancelled() => Err(Error::kind(ErrorKind::Cancelled)),
        };
        let connection = connection.map_err(|e| Failure::unsent(e, Some(&handler)))?;
        let handler = if handler.is_pending() {
            let connected =
                RequestHandler::connected(Arc::clone(handler.reference()), connection.clone());
            if self
                .proxy
                .update_request_handler(&handler, Some(Arc::clone(&connected)))
            {
                connected
            } else {
                handler
            }
        } else {
            handler
        };

        let Some(params) = params else {
            return Ok(Completed {
                handler,
                connection,
                reply: Reply::none(),
            });
        };

        self.transition(InvocationState::Sending);
        let reference = Arc::clone(handler.reference());
        let twoway = reference.mode().is_twoway();
        let (request_id, receiver) = if twoway {
            connection.alloc()
        } else {
            (0, Receiver::None)
        };
        let mut flags = MsgFlags::empty();
        if connection.endpoint().compress {
            flags |= MsgFlags::Compress;
        }
        let frame = self
            .encode(&reference, request_id, params, flags)
            .and_then(|chunk| encode_frame(&[chunk]))
            .map_err(|e| Failure::unsent(e, Some(&handler)))?;
        connection
            .send(frame)
            .await
            .map_err(|e| Failure::unsent(e, Some(&handler)).on(&connection))?;

        if !twoway {
            self.transition(InvocationState::Sent);
            return Ok(Completed {
                handler,
                connection,
                reply: Reply::none(),
            });
        }

        self.transition(InvocationState::AwaitingReply);
        let sent = |error| Failure {
            error,
            sent: true,
            handler: Some(Arc::clone(&handler)),
            connection: Some(connection.clone()),
        };
        let msg = self
            .wait(receiver, &reference, connection.endpoint())
            .await
            .map_err(sent)?;
        if let Some(error) = msg.meta.status.into_error(&msg.meta) {
            return Err(sent(error));
        }
        let reply = Reply {
            ok: msg.meta.status == ReplyStatus::Ok,
            use_msgpack: msg.meta.use_msgpack(),
            payload: msg.payload,
        };
        self.transition(if reply.ok {
            InvocationState::Succeeded
        } else {
            InvocationState::UserFailed
        });
        Ok(Completed {
            handler,
            connection,
            reply,
        })
    }

    async fn wait(&self, receiver: Receiver, reference: &Reference, endpoint: &Endpoint) -> Result<Message> {
        let runtime = self.proxy.runtime();
        let timeout = reply_timeout(reference, endpoint, runtime.config().connect_timeout_ms);
        let recv = async move {
            match timeout {
                Some(duration) => tokio::time::timeout(duration, receiver.recv())
                    .await
                    .map_err(|_| {
                        Error::new(
                            ErrorKind::InvocationTimeout,
                            format!("no reply within {duration:?}"),
                        )
                    })?,
                None => receiver.recv().await,
            }
        };
        tokio::select! {
            biased;
            () = runtime.destroyed().cancelled() => Err(Error::kind(ErrorKind::RuntimeDestroyed)),
            () = self.cancel.cancelled() => Err(Error::kind(ErrorKind::Cancelled)),
            r = recv => r,
        }
    }

    /// Backoff before the next attempt, or the error to propagate.
    ///
    /// A connection that failed at the transport level leaves the pool and
    /// its endpoint moves to the back of later attempts. It is not closed:
    /// other requests in flight on it keep their own outcome.
    async fn handle_failure(&mut self, failure: Failure) -> Result<Duration> {
        let Failure {
            error,
            sent,
            handler,
            connection,
        } = failure;
        tracing::debug!(
            "`{}` attempt {} failed (sent: {sent}): {error}",
            self.operation,
            self.attempts
        );

        if error.class() != ErrorClass::RemoteFailure
            && let Some(handler) = &handler
        {
            self.proxy.update_request_handler(handler, None);
        }
        if error.class() == ErrorClass::TransportFailure
            && let Some(connection) = connection
        {
            self.proxy.runtime().pool().remove(&connection).await;
            if !self.failed.contains(connection.endpoint()) {
                self.failed.push(connection.endpoint().clone());
            }
        }
        if !is_retry_eligible(&error.kind, sent, self.mode) {
            return Err(error);
        }

        let reference = self.proxy.reference();
        if let Some(router) = reference.router() {
            router.clear_cache();
        } else if reference.is_indirect()
            && let Some(locator) = reference.locator()
        {
            locator.clear_cache(reference.adapter_id());
        }

        match self
            .proxy
            .runtime()
            .retry_policy()
            .should_retry(&error, self.attempts)
        {
            RetryDecision::Retry(backoff) => {
                tracing::warn!(
                    "retrying `{}` after {error} (attempt {})",
                    self.operation,
                    self.attempts + 1
                );
                Ok(backoff)
            }
            RetryDecision::Deny => Err(error),
        }
    }

    fn encode(
        &self,
        reference: &Reference,
        request_id: u64,
        params: &Payload,
        extra_flags: MsgFlags,
    ) -> Result<Bytes> {
        let mut flags = MsgFlags::IsReq | extra_flags;
        flags.set(
            MsgFlags::UseMessagePack,
            self.proxy.runtime().config().use_msgpack,
        );
        if reference.compress() == Some(true) {
            flags |= MsgFlags::Compress;
        }
        let meta = MsgMeta {
            flags,
            request_id,
            identity: reference.identity().clone(),
            facet: reference.facet().to_string(),
            operation: self.operation.clone(),
            mode: self.mode,
            context: self
                .context
                .clone()
                .unwrap_or_else(|| reference.context().clone()),
            encoding: reference.encoding(),
            status: ReplyStatus::Ok,
        };
        Message::new(meta, params.clone()).to_chunk()
    }

    fn transition(&mut self, state: InvocationState) {
        tracing::trace!(
            "`{}` attempt {}: {:?} -> {:?}",
            self.operation,
            self.attempts,
            self.state,
            state
        );
        self.state = state;
    }
}

/// How long a two-way attempt waits for its reply, `None` for no limit.
fn reply_timeout(reference: &Reference, endpoint: &Endpoint, default_connect_timeout: i32) -> Option<Duration> {
    let timeout = match reference.invocation_timeout() {
        CONNECTION_TIMEOUT if endpoint.timeout == INFINITE_TIMEOUT => default_connect_timeout,
        CONNECTION_TIMEOUT => endpoint.timeout,
        timeout => timeout,
    };
    u64::try_from(timeout).ok().map(Duration::from_millis)
}
