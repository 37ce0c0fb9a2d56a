//! The message record shared by topics, queues and replication.
//!
//! A message is copied, never mutated, once it has been appended. The same
//! binary encoding is used for durable values and for the peer wire protocol,
//! so identifier, topic, partition, offset, key, producer and payload bytes
//! survive replication exactly.
//!
//! # Encoding
//!
//! All integers little-endian:
//!
//! ```text
//! id:        16 bytes
//! topic:     u16 length + UTF-8
//! partition: u32
//! offset:    u64
//! key:       u32 length + UTF-8
//! producer:  u16 length + UTF-8
//! payload:   u32 length + bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::types::{MessageId, Offset, PartitionId, PartitionKey};

/// Fixed-size portion of an encoded message.
const FIXED_SIZE: usize = 16 + 2 + 4 + 8 + 4 + 2 + 4;

/// A single message in a partition log or queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique identifier, nil until first stored.
    pub id: MessageId,
    /// Topic (or queue) name.
    pub topic: String,
    /// Partition index. Always 0 for queue messages.
    pub partition: PartitionId,
    /// Offset within the partition, assigned by the log store.
    pub offset: Offset,
    /// Producer key used for partition selection.
    pub key: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// Identity of the producer.
    pub producer: String,
}

impl Message {
    /// Creates an unassigned message for a topic partition.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: PartitionId,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
        producer: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::nil(),
            topic: topic.into(),
            partition,
            offset: Offset::default(),
            key: key.into(),
            payload: payload.into(),
            producer: producer.into(),
        }
    }

    /// Creates an unassigned message destined for a queue.
    #[must_use]
    pub fn for_queue(
        queue: impl Into<String>,
        payload: impl Into<Bytes>,
        producer: impl Into<String>,
    ) -> Self {
        Self::new(queue, PartitionId::new(0), String::new(), payload, producer)
    }

    /// Sets the identifier.
    #[must_use]
    pub const fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Sets the offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    /// Returns the (topic, partition) this message belongs to.
    #[must_use]
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.clone(), self.partition)
    }

    /// Assigns a fresh identifier if none is set and returns the identifier.
    pub fn ensure_id(&mut self) -> MessageId {
        if self.id.is_nil() {
            self.id = MessageId::generate();
        }
        self.id
    }

    /// Validates the message against limits.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the payload, key, producer or topic is
    /// too large.
    pub fn validate(&self, limits: &Limits) -> Result<()> {
        if self.payload.len() > limits.max_payload_bytes as usize {
            return Err(Error::InvalidArgument {
                name: "payload",
                reason: format!(
                    "{} bytes exceeds limit of {}",
                    self.payload.len(),
                    limits.max_payload_bytes
                ),
            });
        }
        if self.key.len() > limits.max_key_bytes as usize {
            return Err(Error::InvalidArgument {
                name: "key",
                reason: format!(
                    "{} bytes exceeds limit of {}",
                    self.key.len(),
                    limits.max_key_bytes
                ),
            });
        }
        if self.producer.len() > limits.max_producer_bytes as usize {
            return Err(Error::InvalidArgument {
                name: "producer",
                reason: format!(
                    "{} bytes exceeds limit of {}",
                    self.producer.len(),
                    limits.max_producer_bytes
                ),
            });
        }
        if self.topic.len() > limits.max_name_bytes as usize {
            return Err(Error::InvalidArgument {
                name: "topic",
                reason: format!(
                    "{} bytes exceeds limit of {}",
                    self.topic.len(),
                    limits.max_name_bytes
                ),
            });
        }
        Ok(())
    }

    /// Returns the encoded size in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        FIXED_SIZE + self.topic.len() + self.key.len() + self.producer.len() + self.payload.len()
    }

    /// Encodes the message to bytes.
    ///
    /// Nothing is written if a field does not fit its length prefix.
    ///
    /// # Errors
    /// Returns `FieldTooLong` for a topic or producer over 65535 bytes, or a
    /// key or payload over `u32::MAX` bytes.
    pub fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), MessageEncodeError> {
        let topic_len = u16::try_from(self.topic.len())
            .map_err(|_| MessageEncodeError::too_long("topic", self.topic.len(), u16::MAX.into()))?;
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| MessageEncodeError::too_long("key", self.key.len(), u32::MAX as usize))?;
        let producer_len = u16::try_from(self.producer.len()).map_err(|_| {
            MessageEncodeError::too_long("producer", self.producer.len(), u16::MAX.into())
        })?;
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| {
            MessageEncodeError::too_long("payload", self.payload.len(), u32::MAX as usize)
        })?;

        buf.reserve(self.encoded_size());
        buf.put_slice(self.id.as_bytes());
        buf.put_u16_le(topic_len);
        buf.put_slice(self.topic.as_bytes());
        buf.put_u32_le(self.partition.get());
        buf.put_u64_le(self.offset.get());
        buf.put_u32_le(key_len);
        buf.put_slice(self.key.as_bytes());
        buf.put_u16_le(producer_len);
        buf.put_slice(self.producer.as_bytes());
        buf.put_u32_le(payload_len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encodes the message into a freshly allocated buffer.
    ///
    /// # Errors
    /// Returns `FieldTooLong` as [`encode`](Self::encode) does.
    pub fn to_bytes(&self) -> std::result::Result<Bytes, MessageEncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes a message from bytes, advancing the buffer past it.
    ///
    /// # Errors
    /// Returns an error if the buffer is truncated or a string is not UTF-8.
    pub fn decode(buf: &mut impl Buf) -> std::result::Result<Self, MessageDecodeError> {
        if buf.remaining() < 16 {
            return Err(MessageDecodeError::Truncated { field: "id" });
        }
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);

        let topic = read_string(buf, "topic", LenWidth::U16)?;
        if buf.remaining() < 4 + 8 {
            return Err(MessageDecodeError::Truncated { field: "offset" });
        }
        let partition = PartitionId::new(buf.get_u32_le());
        let offset = Offset::new(buf.get_u64_le());
        let key = read_string(buf, "key", LenWidth::U32)?;
        let producer = read_string(buf, "producer", LenWidth::U16)?;

        if buf.remaining() < 4 {
            return Err(MessageDecodeError::Truncated { field: "payload" });
        }
        let payload_len = buf.get_u32_le() as usize;
        if buf.remaining() < payload_len {
            return Err(MessageDecodeError::Truncated { field: "payload" });
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Self {
            id: MessageId::from_bytes(id),
            topic,
            partition,
            offset,
            key,
            payload,
            producer,
        })
    }
}

/// Errors from encoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageEncodeError {
    /// A field is longer than its length prefix can describe.
    #[error("field {field} is {len} bytes, max {max}")]
    FieldTooLong {
        /// The field being encoded.
        field: &'static str,
        /// Its length in bytes.
        len: usize,
        /// The largest length the prefix holds.
        max: usize,
    },
}

impl MessageEncodeError {
    const fn too_long(field: &'static str, len: usize, max: usize) -> Self {
        Self::FieldTooLong { field, len, max }
    }
}

impl From<MessageEncodeError> for Error {
    fn from(err: MessageEncodeError) -> Self {
        let MessageEncodeError::FieldTooLong { field, .. } = err;
        Self::InvalidArgument {
            name: field,
            reason: err.to_string(),
        }
    }
}

/// Errors from decoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageDecodeError {
    /// The buffer ended before a field was complete.
    #[error("message truncated in field {field}")]
    Truncated {
        /// The field being decoded.
        field: &'static str,
    },

    /// A string field was not valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// The field being decoded.
        field: &'static str,
    },
}

#[derive(Clone, Copy)]
enum LenWidth {
    U16,
    U32,
}

fn read_string(
    buf: &mut impl Buf,
    field: &'static str,
    width: LenWidth,
) -> std::result::Result<String, MessageDecodeError> {
    let len = match width {
        LenWidth::U16 if buf.remaining() >= 2 => usize::from(buf.get_u16_le()),
        LenWidth::U32 if buf.remaining() >= 4 => buf.get_u32_le() as usize,
        _ => return Err(MessageDecodeError::Truncated { field }),
    };
    if buf.remaining() < len {
        return Err(MessageDecodeError::Truncated { field });
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MessageDecodeError::InvalidUtf8 { field })
}
