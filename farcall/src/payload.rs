use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, ErrorKind, Result};

/// Encoded parameters or results of one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    Empty,
    Encoded(Bytes),
}

impl Payload {
    /// Encodes `value` as MessagePack or JSON.
    ///
    /// # Errors
    ///
    /// Fails with `SerializeFailed`, which is never retried.
    pub fn encode<P: Serialize + ?Sized>(value: &P, use_msgpack: bool) -> Result<Self> {
        let bytes = if use_msgpack {
            rmp_serde::to_vec_named(value)?
        } else {
            serde_json::to_vec(value)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?
        };
        Ok(Payload::Encoded(bytes.into()))
    }

    /// Decodes the payload. An empty payload decodes as null, so `()` and
    /// `Option<T>` results need no bytes on the wire.
    ///
    /// # Errors
    pub fn decode<T: DeserializeOwned>(&self, use_msgpack: bool) -> Result<T> {
        if self.is_empty() {
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else if use_msgpack {
            Ok(rmp_serde::from_slice(self)?)
        } else {
            Ok(serde_json::from_slice(self)?)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Encoded(bytes) => bytes,
        }
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Encoded(value)
    }
}

impl From<BytesMut> for Payload {
    fn from(value: BytesMut) -> Self {
        Payload::Encoded(value.freeze())
    }
}

impl From<Payload> for Bytes {
    fn from(value: Payload) -> Self {
        match value {
            Payload::Empty => Bytes::new(),
            Payload::Encoded(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_codec() {
        for use_msgpack in [true, false] {
            let payload = Payload::encode("hello", use_msgpack).unwrap();
            assert!(!payload.is_empty());
            let text: String = payload.decode(use_msgpack).unwrap();
            assert_eq!(text, "hello");
        }

        let unit: () = Payload::Empty.decode(true).unwrap();
        assert_eq!(unit, ());
        let none: Option<u32> = Payload::Empty.decode(false).unwrap();
        assert_eq!(none, None);

        let err = Payload::encode("x", false)
            .unwrap()
            .decode::<u32>(false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);
    }
}
