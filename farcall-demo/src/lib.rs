use std::sync::atomic::{AtomicU64, Ordering};

use farcall::{Error, ErrorKind, MockOutcome, MockRequest, Payload, Prx, ReplyStatus, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
    pub text: String,
    pub copies: u32,
}

#[farcall::interface("::Demo::Printer")]
pub trait Printer {
    async fn print(&self, job: &Job) -> Result<()>;

    #[idempotent]
    async fn queue_len(&self) -> Result<u64>;
}

/// In-process stand-in for a printer server, answering over the mock
/// transport.
#[derive(Debug, Default)]
pub struct ScriptedPrinter {
    printed: AtomicU64,
    /// Drop the connection on every n-th request, 0 for never.
    pub drop_every: usize,
}

impl ScriptedPrinter {
    #[must_use]
    pub fn new(drop_every: usize) -> Self {
        Self {
            drop_every,
            ..Default::default()
        }
    }

    pub fn respond(&self, req: &MockRequest) -> MockOutcome {
        if self.drop_every != 0 && (req.index + 1) % self.drop_every == 0 {
            return MockOutcome::LoseConnection(Error::new(
                ErrorKind::ConnectionClosed,
                "printer restarted".to_string(),
            ));
        }
        match self.handle(req) {
            Ok(payload) => MockOutcome::Reply(ReplyStatus::Ok, payload),
            Err(e) if e.kind == ErrorKind::OperationNotExist => {
                MockOutcome::Reply(ReplyStatus::OperationNotExist, Payload::Empty)
            }
            Err(e) => match Payload::encode(&e, req.meta.use_msgpack()) {
                Ok(payload) => MockOutcome::Reply(ReplyStatus::UserException, payload),
                Err(_) => MockOutcome::Reply(ReplyStatus::UnknownException, Payload::Empty),
            },
        }
    }

    fn handle(&self, req: &MockRequest) -> Result<Payload> {
        let msgpack = req.meta.use_msgpack();
        match req.meta.operation.as_str() {
            "_ping" => Ok(Payload::Empty),
            "_is_a" => {
                let type_id: String = req.payload.decode(msgpack)?;
                let is_a = type_id == PrinterPrx::TYPE_ID || type_id == "::Object";
                Payload::encode(&is_a, msgpack)
            }
            "print" => {
                let job: Job = req.payload.decode(msgpack)?;
                if job.copies == 0 {
                    return Err(Error::new(
                        ErrorKind::UserException("::Demo::NoCopies".to_string()),
                        format!("nothing to print for {:?}", job.text),
                    ));
                }
                tracing::info!("printing {:?} x{}", job.text, job.copies);
                self.printed.fetch_add(u64::from(job.copies), Ordering::AcqRel);
                Ok(Payload::Empty)
            }
            "queue_len" => Payload::encode(&self.printed.load(Ordering::Acquire), msgpack),
            _ => Err(Error::kind(ErrorKind::OperationNotExist)),
        }
    }
}
