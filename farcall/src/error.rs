use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    IllegalIdentity,
    TwowayOnly,
    SerializeFailed,
    DeserializeFailed,
    NoEndpoint,
    ConnectFailed,
    ConnectTimeout,
    ConnectionRefused,
    ConnectionReset,
    /// The peer closed the connection in an orderly way. Every request
    /// outstanding on that connection is safe to reissue.
    ConnectionClosed,
    SendFailed,
    RecvFailed,
    LocatorFailed,
    RouterFailed,
    RuntimeDestroyed,
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
    UnknownException,
    UserException(String),
    InvocationTimeout,
    Cancelled,
    #[serde(untagged)]
    Unknown(String),
}

/// Coarse classification of an [`ErrorKind`], the only input besides
/// `(sent, mode)` that the retry decision looks at.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TransportFailure,
    TargetNotFound,
    RemoteFailure,
    ArgumentError,
    ModeError,
    CancelledError,
}

impl ErrorKind {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::InvalidArgument | ErrorKind::IllegalIdentity | ErrorKind::SerializeFailed => {
                ErrorClass::ArgumentError
            }
            ErrorKind::TwowayOnly => ErrorClass::ModeError,
            ErrorKind::NoEndpoint
            | ErrorKind::ConnectFailed
            | ErrorKind::ConnectTimeout
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionClosed
            | ErrorKind::SendFailed
            | ErrorKind::RecvFailed
            | ErrorKind::LocatorFailed
            | ErrorKind::RouterFailed
            | ErrorKind::RuntimeDestroyed => ErrorClass::TransportFailure,
            ErrorKind::ObjectNotExist | ErrorKind::FacetNotExist => ErrorClass::TargetNotFound,
            ErrorKind::OperationNotExist
            | ErrorKind::UnknownException
            | ErrorKind::UserException(_)
            | ErrorKind::DeserializeFailed
            | ErrorKind::Unknown(_) => ErrorClass::RemoteFailure,
            ErrorKind::InvocationTimeout | ErrorKind::Cancelled => ErrorClass::CancelledError,
        }
    }

    /// Orderly server-initiated close.
    #[must_use]
    pub fn is_graceful_close(&self) -> bool {
        matches!(self, ErrorKind::ConnectionClosed)
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
    /// Operation that was being invoked when the error surfaced.
    #[serde(default)]
    pub operation: Option<String>,
    /// Number of transport attempts made by the invocation.
    #[serde(default)]
    pub attempts: u32,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self {
            kind,
            msg,
            operation: None,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self::new(kind, String::default())
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn twoway_only(operation: &str) -> Self {
        Self::new(
            ErrorKind::TwowayOnly,
            format!("`{operation}` can only be called with a twoway proxy"),
        )
        .with_operation(operation)
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        let kind = match value.kind() {
            std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                ErrorKind::ConnectionReset
            }
            std::io::ErrorKind::TimedOut => ErrorKind::ConnectTimeout,
            std::io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionClosed,
            _ => ErrorKind::RecvFailed,
        };
        Self::new(kind, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        // encoders map their failures to `SerializeFailed` explicitly.
        Self::new(ErrorKind::DeserializeFailed, value.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::new(ErrorKind::SerializeFailed, value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::new(ErrorKind::DeserializeFailed, value.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)?;
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)?;
        }
        if let Some(operation) = &self.operation {
            write!(f, " (operation `{operation}`")?;
            if self.attempts > 0 {
                write!(f, ", {} attempt(s)", self.attempts)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
