use bytes::Bytes;
use parking_lot::Mutex;

use crate::{Result, msg::encode_frame};

#[derive(Default)]
struct QueueState {
    chunks: Vec<Bytes>,
    size: usize,
}

/// Encoded batch-mode requests of one proxy, waiting for a flush.
///
/// Enqueueing never touches the network.
#[derive(Default)]
pub struct BatchRequestQueue {
    state: Mutex<QueueState>,
}

impl BatchRequestQueue {
    pub fn enqueue(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.size += chunk.len();
        state.chunks.push(chunk);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded size of the queued requests in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Takes everything queued so far. Requests enqueued afterwards belong
    /// to the next flush.
    #[must_use]
    pub fn swap(&self) -> Batch {
        let state = std::mem::take(&mut *self.state.lock());
        Batch {
            chunks: state.chunks,
        }
    }
}

impl std::fmt::Debug for BatchRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRequestQueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Snapshot taken from a [`BatchRequestQueue`], sent as one frame.
#[derive(Debug)]
pub struct Batch {
    chunks: Vec<Bytes>,
}

impl Batch {
    #[must_use]
    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// # Errors
    pub fn to_frame(&self) -> Result<Bytes> {
        encode_frame(&self.chunks)
    }
}
