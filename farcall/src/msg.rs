use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    Context, EncodingVersion, Identity, Payload,
    error::{Error, ErrorKind, Result},
};

pub(crate) const MAGIC_NUM: u32 = u32::from_be_bytes(*b"FRCL");
/// Upper bound for one frame, batches included.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

const S: usize = std::mem::size_of::<u32>();

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MsgFlags(u8);

bitflags! {
    impl MsgFlags: u8 {
        const IsReq = 1;
        const IsRsp = 2;
        /// Meta and payload are MessagePack instead of JSON.
        const UseMessagePack = 4;
        /// Request was queued and flushed as part of a batch.
        const IsBatch = 8;
        /// Peer may compress the payload on this connection.
        const Compress = 16;
    }
}

/// Whether re-executing an operation on the server is harmless.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq, Hash,
)]
pub enum OperationMode {
    #[default]
    Normal,
    Idempotent,
}

#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq, Hash,
)]
pub enum ReplyStatus {
    #[default]
    Ok,
    UserException,
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
    UnknownException,
}

impl ReplyStatus {
    /// Error for statuses that are not an application-level outcome.
    #[must_use]
    pub fn into_error(self, meta: &MsgMeta) -> Option<Error> {
        let kind = match self {
            ReplyStatus::Ok | ReplyStatus::UserException => return None,
            ReplyStatus::ObjectNotExist => ErrorKind::ObjectNotExist,
            ReplyStatus::FacetNotExist => ErrorKind::FacetNotExist,
            ReplyStatus::OperationNotExist => ErrorKind::OperationNotExist,
            ReplyStatus::UnknownException => ErrorKind::UnknownException,
        };
        Some(Error::new(
            kind,
            format!("reply {self:?} for request {}", meta.request_id),
        ))
    }
}

/// Header of every request and reply.
///
/// Replies only fill `flags`, `request_id` and `status`.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MsgMeta {
    pub flags: MsgFlags,
    /// Correlates replies with requests, 0 when no reply is expected.
    pub request_id: u64,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub facet: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub mode: OperationMode,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub encoding: EncodingVersion,
    #[serde(default)]
    pub status: ReplyStatus,
}

impl MsgMeta {
    #[must_use]
    pub fn is_req(&self) -> bool {
        self.flags.contains(MsgFlags::IsReq)
    }

    #[must_use]
    pub fn is_rsp(&self) -> bool {
        self.flags.contains(MsgFlags::IsRsp)
    }

    #[must_use]
    pub fn use_msgpack(&self) -> bool {
        self.flags.contains(MsgFlags::UseMessagePack)
    }
}

/// One request or reply.
///
/// A frame on the wire carries one or more messages:
///
/// ```text
/// | magic u32 | count u32 | chunk ... |
/// chunk: | chunk_len u32 | meta_len u32 | meta | payload |
/// ```
///
/// All integers are big-endian. `chunk_len` covers everything after itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    pub meta: MsgMeta,
    pub payload: Payload,
}

impl Message {
    #[must_use]
    pub fn new(meta: MsgMeta, payload: Payload) -> Self {
        Self { meta, payload }
    }

    #[must_use]
    pub fn reply(request_id: u64, status: ReplyStatus, payload: Payload, use_msgpack: bool) -> Self {
        let mut flags = MsgFlags::IsRsp;
        flags.set(MsgFlags::UseMessagePack, use_msgpack);
        Self::new(
            MsgMeta {
                flags,
                request_id,
                status,
                ..Default::default()
            },
            payload,
        )
    }

    /// Encodes this message as a frame chunk, ready to be queued or framed.
    ///
    /// # Errors
    pub fn to_chunk(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        buf.put_u32(0);
        buf.put_u32(0);
        let mut writer = buf.writer();
        if self.meta.use_msgpack() {
            rmp_serde::encode::write_named(&mut writer, &self.meta)?;
        } else {
            serde_json::to_writer(&mut writer, &self.meta)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;
        }
        let mut buf = writer.into_inner();
        let meta_len = u32::try_from(buf.len() - 2 * S)?;
        buf.extend_from_slice(&self.payload);
        let chunk_len = u32::try_from(buf.len() - S)?;
        buf[..S].copy_from_slice(&chunk_len.to_be_bytes());
        buf[S..2 * S].copy_from_slice(&meta_len.to_be_bytes());
        Ok(buf.freeze())
    }

    /// # Errors
    pub fn to_frame(&self) -> Result<Bytes> {
        encode_frame(&[self.to_chunk()?])
    }

    fn parse_chunk(mut chunk: Bytes) -> Result<Self> {
        if chunk.len() < S {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid chunk length: {}", chunk.len()),
            ));
        }
        let meta_len = chunk.get_u32() as usize;
        if meta_len == 0 || meta_len > chunk.len() {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid meta length: {meta_len}, chunk length: {}", chunk.len()),
            ));
        }
        let meta_bytes = chunk.split_to(meta_len);
        let meta: MsgMeta = if meta_bytes[0] == b'{' {
            serde_json::from_slice(&meta_bytes)?
        } else {
            rmp_serde::from_slice(&meta_bytes)?
        };
        let payload = if chunk.is_empty() {
            Payload::Empty
        } else {
            Payload::Encoded(chunk)
        };
        Ok(Self { meta, payload })
    }
}

/// Wraps already encoded chunks into a single frame.
///
/// # Errors
///
/// Fails when the frame would exceed [`MAX_FRAME_SIZE`].
pub fn encode_frame(chunks: &[Bytes]) -> Result<Bytes> {
    let size = 2 * S + chunks.iter().map(Bytes::len).sum::<usize>();
    if size > MAX_FRAME_SIZE {
        return Err(Error::new(
            ErrorKind::SerializeFailed,
            format!("frame is too long: {size}"),
        ));
    }
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(MAGIC_NUM);
    buf.put_u32(u32::try_from(chunks.len())?);
    for chunk in chunks {
        buf.extend_from_slice(chunk);
    }
    Ok(buf.freeze())
}

/// Splits a frame into its messages, in order.
///
/// # Errors
pub fn parse_frame(mut frame: Bytes) -> Result<Vec<Message>> {
    if frame.len() < 2 * S {
        return Err(Error::new(
            ErrorKind::DeserializeFailed,
            format!("invalid frame length: {}", frame.len()),
        ));
    }
    let magic = frame.get_u32();
    if magic != MAGIC_NUM {
        return Err(Error::new(
            ErrorKind::DeserializeFailed,
            format!("invalid magic number: {magic:#x}"),
        ));
    }
    let count = frame.get_u32() as usize;
    let mut messages = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if frame.len() < S {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("frame truncated after {} messages", messages.len()),
            ));
        }
        let chunk_len = frame.get_u32() as usize;
        if chunk_len > frame.len() {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid chunk length: {chunk_len}, remaining: {}", frame.len()),
            ));
        }
        messages.push(Message::parse_chunk(frame.split_to(chunk_len))?);
    }
    if !frame.is_empty() {
        return Err(Error::new(
            ErrorKind::DeserializeFailed,
            format!("{} trailing bytes in frame", frame.len()),
        ));
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(operation: &str, use_msgpack: bool) -> Message {
        let mut flags = MsgFlags::IsReq;
        flags.set(MsgFlags::UseMessagePack, use_msgpack);
        Message::new(
            MsgMeta {
                flags,
                request_id: 7,
                identity: "printer".parse().unwrap(),
                operation: operation.into(),
                mode: OperationMode::Idempotent,
                ..Default::default()
            },
            Payload::encode("hello", use_msgpack).unwrap(),
        )
    }

    #[test]
    fn test_frame_single_message() {
        for use_msgpack in [true, false] {
            let msg = request("print_string", use_msgpack);
            let frame = msg.to_frame().unwrap();
            let parsed = parse_frame(frame).unwrap();
            assert_eq!(parsed, vec![msg]);
        }
    }

    #[test]
    fn test_frame_batch_keeps_order() {
        let chunks: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|op| request(op, true).to_chunk().unwrap())
            .collect();
        let parsed = parse_frame(encode_frame(&chunks).unwrap()).unwrap();
        let ops: Vec<_> = parsed.iter().map(|m| m.meta.operation.as_str()).collect();
        assert_eq!(ops, ["a", "b", "c"]);
    }

    #[test]
    fn test_reply_without_payload() {
        let reply = Message::reply(3, ReplyStatus::ObjectNotExist, Payload::Empty, true);
        let parsed = parse_frame(reply.to_frame().unwrap()).unwrap().remove(0);
        assert!(parsed.meta.is_rsp());
        assert!(parsed.payload.is_empty());
        let err = parsed.meta.status.into_error(&parsed.meta).unwrap();
        assert_eq!(err.kind, ErrorKind::ObjectNotExist);
        assert!(ReplyStatus::UserException.into_error(&parsed.meta).is_none());
    }

    #[test]
    fn test_parse_invalid_frame() {
        assert!(parse_frame(Bytes::from_static(b"FRC")).is_err());
        assert!(parse_frame(Bytes::from_static(b"RUA!\0\0\0\0")).is_err());
        let mut truncated = BytesMut::new();
        truncated.put_u32(MAGIC_NUM);
        truncated.put_u32(2);
        truncated.extend_from_slice(&request("a", false).to_chunk().unwrap());
        assert!(parse_frame(truncated.freeze()).is_err());
    }
}
