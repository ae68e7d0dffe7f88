use foldhash::fast::RandomState;
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::oneshot;

use crate::{
    Error, Message, Receiver, Result,
    msg::parse_frame,
};

/// Correlates outstanding two-way requests of one connection with replies.
///
/// Transports hand every inbound frame to [`Waiter::post_frame`] and report
/// connection loss with [`Waiter::fail_all`].
#[derive(Default)]
pub struct Waiter {
    index: AtomicU64,
    id_map: dashmap::DashMap<u64, oneshot::Sender<Result<Message>>, RandomState>,
    failed: OnceLock<Error>,
}

/// Removes the waiter entry of a request that stopped waiting.
pub struct WaiterCleaner {
    waiter: Arc<Waiter>,
    request_id: u64,
}

impl Drop for WaiterCleaner {
    fn drop(&mut self) {
        self.waiter.remove(self.request_id);
    }
}

impl Waiter {
    /// Allocates a request id, never 0, and the receiver for its reply.
    pub fn alloc(self: &Arc<Self>) -> (u64, Receiver) {
        let request_id = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.id_map.insert(request_id, tx);
        // fail_all sets `failed` before draining, so one of the two sees this entry.
        if let Some(error) = self.failed.get() {
            self.post(request_id, Err(error.clone()));
        }
        (
            request_id,
            Receiver::OneShotRx(
                rx,
                WaiterCleaner {
                    waiter: Arc::clone(self),
                    request_id,
                },
            ),
        )
    }

    pub fn post(&self, request_id: u64, result: Result<Message>) {
        if let Some((_, tx)) = self.id_map.remove(&request_id) {
            let _ = tx.send(result);
        } else {
            tracing::warn!("Waiter post failed for request_id: {}", request_id);
        }
    }

    /// Dispatches every reply contained in an inbound frame.
    ///
    /// # Errors
    ///
    /// Fails when the frame cannot be parsed. Replies before the damaged
    /// part are not delivered either.
    pub fn post_frame(&self, frame: bytes::Bytes) -> Result<()> {
        for msg in parse_frame(frame)? {
            if msg.meta.is_rsp() {
                self.post(msg.meta.request_id, Ok(msg));
            } else {
                tracing::warn!(
                    "ignoring inbound request `{}` on a client connection",
                    msg.meta.operation
                );
            }
        }
        Ok(())
    }

    /// Fails every outstanding and future request with `error`.
    pub fn fail_all(&self, error: Error) {
        let error = self.failed.get_or_init(|| error).clone();
        let ids: Vec<u64> = self.id_map.iter().map(|entry| *entry.key()).collect();
        for request_id in ids {
            if let Some((_, tx)) = self.id_map.remove(&request_id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    #[must_use]
    pub fn contains_request_id(&self, request_id: u64) -> bool {
        self.id_map.contains_key(&request_id)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.id_map.len()
    }

    fn remove(&self, request_id: u64) {
        self.id_map.remove(&request_id);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.pending())
            .field("failed", &self.failed.get())
            .finish()
    }
}
