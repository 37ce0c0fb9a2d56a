//! Peer protocol codec.
//!
//! Binary serialization for replication requests and responses using a
//! simple length-prefixed format suitable for TCP streaming. One request is
//! answered by exactly one response on the same connection.
//!
//! # Wire Format
//!
//! Each frame is:
//! - 4 bytes: body length (u32 little-endian, not including header)
//! - 1 byte: message type tag
//! - N bytes: message-specific body
//!
//! Messages inside a body use the shared [`Message`] encoding, so every
//! field (identifier, topic, partition, offset, key, producer, payload)
//! crosses the wire unchanged.
//!
//! # Message Types
//!
//! Requests:
//! - 1: `Replicate` (u32 count, then messages)
//! - 2: `GetRange` (topic, partition, from, has-to flag, to)
//! - 3: `Ping`
//!
//! Responses:
//! - 64: `Ack` (applied, duplicates)
//! - 65: `Batch` (u32 count, then messages)
//! - 66: `Pong`
//! - 127: `Error` (u32 length + UTF-8 message)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use courier_core::{Limits, Message, MessageDecodeError, MessageEncodeError, Offset, PartitionId};
use thiserror::Error;

/// Maximum frame body size.
pub const MAX_FRAME_SIZE: u32 = Limits::new().max_frame_bytes;

/// Frame header: length prefix.
const HEADER_SIZE: usize = 4;

/// Bytes of a batch body before its messages: tag and count.
pub const BATCH_OVERHEAD: usize = 1 + 4;

/// Message type tags.
const TAG_REPLICATE: u8 = 1;
const TAG_GET_RANGE: u8 = 2;
const TAG_PING: u8 = 3;
const TAG_ACK: u8 = 64;
const TAG_BATCH: u8 = 65;
const TAG_PONG: u8 = 66;
const TAG_ERROR: u8 = 127;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: u32,
    },

    /// Unknown message type tag.
    #[error("unknown message type: {tag}")]
    UnknownMessageType {
        /// The unknown tag value.
        tag: u8,
    },

    /// Insufficient data to decode a frame.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in field {field}")]
    InvalidUtf8 {
        /// The field being decoded.
        field: &'static str,
    },

    /// An embedded message failed to decode.
    #[error("invalid message: {0}")]
    Message(#[from] MessageDecodeError),

    /// A message or string field does not fit the encoding.
    #[error("unencodable field: {0}")]
    Encode(#[from] MessageEncodeError),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Counts returned for a replicated batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicateAck {
    /// Messages written.
    pub applied: u32,
    /// Messages whose offset was already occupied.
    pub duplicates: u32,
}

/// A request sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Apply these messages at their original offsets.
    Replicate(Vec<Message>),
    /// Return stored messages with `from <= offset < to`.
    GetRange {
        /// Topic.
        topic: String,
        /// Partition.
        partition: PartitionId,
        /// First offset, inclusive.
        from: Offset,
        /// End offset, exclusive. `None` reads to the local end.
        to: Option<Offset>,
    },
    /// Reachability probe.
    Ping,
}

/// A peer's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer to `Replicate`.
    Ack(ReplicateAck),
    /// Answer to `GetRange`.
    Batch(Vec<Message>),
    /// Answer to `Ping`.
    Pong,
    /// The peer failed to serve the request.
    Error {
        /// Error description.
        message: String,
    },
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// Encodes a request into a frame.
///
/// # Errors
/// Returns an error if the frame is too large.
pub fn encode_request(request: &Request) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32_le(0);

    match request {
        Request::Replicate(batch) => {
            buf.put_u8(TAG_REPLICATE);
            encode_batch(&mut buf, batch)?;
        }
        Request::GetRange {
            topic,
            partition,
            from,
            to,
        } => {
            buf.put_u8(TAG_GET_RANGE);
            put_str16(&mut buf, "topic", topic)?;
            buf.put_u32_le(partition.get());
            buf.put_u64_le(from.get());
            buf.put_u8(u8::from(to.is_some()));
            buf.put_u64_le(to.map_or(0, Offset::get));
        }
        Request::Ping => buf.put_u8(TAG_PING),
    }

    finish_frame(buf)
}

/// Decodes a request from a buffer holding at least one full frame.
///
/// Returns the request and the number of bytes consumed.
///
/// # Errors
/// Returns `InsufficientData` if the frame is incomplete, or another error
/// if it is malformed.
pub fn decode_request(data: &[u8]) -> CodecResult<(Request, usize)> {
    let (tag, mut body, consumed) = split_frame(data)?;
    let request = match tag {
        TAG_REPLICATE => Request::Replicate(decode_batch(&mut body)?),
        TAG_GET_RANGE => {
            let topic = get_str16(&mut body, "topic")?;
            ensure(&body, 4 + 8 + 1 + 8)?;
            let partition = PartitionId::new(body.get_u32_le());
            let from = Offset::new(body.get_u64_le());
            let has_to = body.get_u8() != 0;
            let to = body.get_u64_le();
            Request::GetRange {
                topic,
                partition,
                from,
                to: has_to.then(|| Offset::new(to)),
            }
        }
        TAG_PING => Request::Ping,
        tag => return Err(CodecError::UnknownMessageType { tag }),
    };
    Ok((request, consumed))
}

// -----------------------------------------------------------------------------
// Responses
// -----------------------------------------------------------------------------

/// Encodes a response into a frame.
///
/// # Errors
/// Returns an error if the frame is too large.
#[allow(clippy::cast_possible_truncation)] // Error text is short.
pub fn encode_response(response: &Response) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32_le(0);

    match response {
        Response::Ack(ack) => {
            buf.put_u8(TAG_ACK);
            buf.put_u32_le(ack.applied);
            buf.put_u32_le(ack.duplicates);
        }
        Response::Batch(batch) => {
            buf.put_u8(TAG_BATCH);
            encode_batch(&mut buf, batch)?;
        }
        Response::Pong => buf.put_u8(TAG_PONG),
        Response::Error { message } => {
            buf.put_u8(TAG_ERROR);
            buf.put_u32_le(message.len() as u32);
            buf.put_slice(message.as_bytes());
        }
    }

    finish_frame(buf)
}

/// Decodes a response from a buffer holding at least one full frame.
///
/// # Errors
/// Returns `InsufficientData` if the frame is incomplete, or another error
/// if it is malformed.
pub fn decode_response(data: &[u8]) -> CodecResult<(Response, usize)> {
    let (tag, mut body, consumed) = split_frame(data)?;
    let response = match tag {
        TAG_ACK => {
            ensure(&body, 8)?;
            Response::Ack(ReplicateAck {
                applied: body.get_u32_le(),
                duplicates: body.get_u32_le(),
            })
        }
        TAG_BATCH => Response::Batch(decode_batch(&mut body)?),
        TAG_PONG => Response::Pong,
        TAG_ERROR => {
            ensure(&body, 4)?;
            let len = body.get_u32_le() as usize;
            ensure(&body, len)?;
            let message = std::str::from_utf8(&body[..len])
                .map_err(|_| CodecError::InvalidUtf8 { field: "error" })?
                .to_string();
            Response::Error { message }
        }
        tag => return Err(CodecError::UnknownMessageType { tag }),
    };
    Ok((response, consumed))
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn finish_frame(mut buf: BytesMut) -> CodecResult<Bytes> {
    // Length excludes the 4-byte header.
    let len = buf.len() - HEADER_SIZE;
    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // Bounded by MAX_FRAME_SIZE.
    let len = len as u32;
    buf[0..HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
    Ok(buf.freeze())
}

/// Splits one frame off `data`, returning (tag, body, bytes consumed).
fn split_frame(data: &[u8]) -> CodecResult<(u8, &[u8], usize)> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::InsufficientData {
            need: HEADER_SIZE,
            have: data.len(),
        });
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len == 0 {
        return Err(CodecError::InsufficientData { need: 1, have: 0 });
    }

    let total_len = HEADER_SIZE + len;
    if data.len() < total_len {
        return Err(CodecError::InsufficientData {
            need: total_len,
            have: data.len(),
        });
    }
    Ok((data[HEADER_SIZE], &data[HEADER_SIZE + 1..total_len], total_len))
}

#[allow(clippy::cast_possible_truncation)] // Batch size bounded by limits.
fn encode_batch(buf: &mut BytesMut, batch: &[Message]) -> CodecResult<()> {
    buf.put_u32_le(batch.len() as u32);
    for message in batch {
        message.encode(buf)?;
    }
    Ok(())
}

fn decode_batch(body: &mut &[u8]) -> CodecResult<Vec<Message>> {
    ensure(body, 4)?;
    let count = body.get_u32_le() as usize;
    // Each message needs well over 16 bytes; cap the preallocation.
    let mut batch = Vec::with_capacity(count.min(body.len() / 16));
    for _ in 0..count {
        batch.push(Message::decode(body)?);
    }
    Ok(batch)
}

fn put_str16(buf: &mut BytesMut, field: &'static str, value: &str) -> CodecResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| MessageEncodeError::FieldTooLong {
        field,
        len: value.len(),
        max: u16::MAX.into(),
    })?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_str16(body: &mut &[u8], field: &'static str) -> CodecResult<String> {
    ensure(body, 2)?;
    let len = usize::from(body.get_u16_le());
    ensure(body, len)?;
    let value = std::str::from_utf8(&body[..len])
        .map_err(|_| CodecError::InvalidUtf8 { field })?
        .to_string();
    body.advance(len);
    Ok(value)
}

const fn ensure(body: &[u8], need: usize) -> CodecResult<()> {
    if body.len() < need {
        return Err(CodecError::InsufficientData {
            need,
            have: body.len(),
        });
    }
    Ok(())
}
