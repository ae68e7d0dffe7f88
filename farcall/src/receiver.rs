use tokio::sync::oneshot;

use crate::{Error, ErrorKind, Message, Result, WaiterCleaner};

/// Pending reply of a request.
pub enum Receiver {
    /// No reply is expected.
    None,
    OneShotRx(oneshot::Receiver<Result<Message>>, WaiterCleaner),
}

impl Receiver {
    /// # Errors
    pub async fn recv(self) -> Result<Message> {
        match self {
            Receiver::None => Err(Error::new(
                ErrorKind::InvalidArgument,
                "no reply is expected".to_string(),
            )),
            Receiver::OneShotRx(rx, _cleaner) => rx
                .await
                .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?,
        }
    }
}
