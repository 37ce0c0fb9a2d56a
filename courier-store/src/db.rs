//! Keyspace handle shared by the log, queue and catalog stores.
//!
//! Everything lives in one transactional fjall partition. Write transactions
//! are serialized by the engine, so every multi-key update (message plus HWM,
//! pending pop plus in-flight insert) commits atomically or not at all.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use courier_core::{Error, Message, Result};
use fjall::{
    Config, PartitionCreateOptions, PersistMode, Slice, TxKeyspace, TxPartitionHandle,
    WriteTransaction,
};
use tracing::info;

/// Name of the single fjall partition holding all Courier keys.
pub const PARTITION_NAME: &str = "courier";

/// Format version prefixed to every stored message value.
pub const FORMAT_VERSION: u8 = 1;

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the keyspace.
    pub path: PathBuf,
    /// Journal fsync interval in milliseconds. `None` leaves it to the engine.
    pub fsync_ms: Option<u16>,
}

impl StoreConfig {
    /// Creates a configuration for the given directory.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fsync_ms: None,
        }
    }

    /// Sets the journal fsync interval.
    #[must_use]
    pub const fn with_fsync_ms(mut self, fsync_ms: u16) -> Self {
        self.fsync_ms = Some(fsync_ms);
        self
    }
}

/// Handle to the durable keyspace. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    keyspace: TxKeyspace,
    partition: TxPartitionHandle,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("partition", &PARTITION_NAME)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) the keyspace described by `config`.
    ///
    /// # Errors
    /// Returns `Storage` if the engine cannot open the directory.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let keyspace = Config::new(&config.path)
            .fsync_ms(config.fsync_ms)
            .open_transactional()
            .map_err(|e| Error::storage("open", e))?;
        let partition = keyspace
            .open_partition(PARTITION_NAME, PartitionCreateOptions::default())
            .map_err(|e| Error::storage("open", e))?;

        info!(path = %config.path.display(), "Store opened");
        Ok(Self {
            keyspace,
            partition,
        })
    }

    /// Opens a store at `path` with default settings.
    ///
    /// # Errors
    /// Returns `Storage` if the engine cannot open the directory.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig::new(path.as_ref()))
    }

    /// Flushes the journal to disk.
    ///
    /// # Errors
    /// Returns `Storage` if the sync fails.
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| Error::storage("persist", e))
    }

    pub(crate) fn write_tx(&self) -> WriteTransaction {
        self.keyspace.write_tx()
    }

    pub(crate) const fn partition(&self) -> &TxPartitionHandle {
        &self.partition
    }

    /// Reads a single key outside any write transaction.
    pub(crate) fn get(&self, operation: &'static str, key: &str) -> Result<Option<Slice>> {
        self.keyspace
            .read_tx()
            .get(&self.partition, key)
            .map_err(|e| Error::storage(operation, e))
    }

    /// Collects every key/value pair under `prefix`, in key order.
    pub(crate) fn scan_prefix(
        &self,
        operation: &'static str,
        prefix: &str,
    ) -> Result<Vec<(Slice, Slice)>> {
        self.keyspace
            .read_tx()
            .prefix(&self.partition, prefix)
            .map(|kv| kv.map_err(|e| Error::storage(operation, e)))
            .collect()
    }

    /// Collects up to `limit` pairs in `[start, end)`, in key order, while
    /// their values total at most `max_bytes`. The first pair is always
    /// returned, whatever its size.
    pub(crate) fn scan_range(
        &self,
        operation: &'static str,
        start: &str,
        end: &str,
        limit: usize,
        max_bytes: usize,
    ) -> Result<Vec<(Slice, Slice)>> {
        let mut pairs = Vec::new();
        let mut bytes = 0usize;
        for kv in self
            .keyspace
            .read_tx()
            .range(&self.partition, start..end)
            .take(limit)
        {
            let (key, value) = kv.map_err(|e| Error::storage(operation, e))?;
            bytes = bytes.saturating_add(value.len());
            if bytes > max_bytes && !pairs.is_empty() {
                break;
            }
            pairs.push((key, value));
        }
        Ok(pairs)
    }
}

// -----------------------------------------------------------------------------
// Value encoding
// -----------------------------------------------------------------------------

/// Encodes a message as a versioned value.
///
/// Fails with `InvalidArgument` before anything is written if a field does
/// not fit the encoding.
pub(crate) fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let body = message.to_bytes()?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a versioned message value.
pub(crate) fn decode_message(operation: &'static str, value: &[u8]) -> Result<Message> {
    match value.split_first() {
        Some((&FORMAT_VERSION, body)) => {
            let mut buf = Bytes::copy_from_slice(body);
            Message::decode(&mut buf).map_err(|e| Error::storage(operation, e))
        }
        Some((version, _)) => Err(Error::Storage {
            operation,
            message: format!("unsupported message format version {version}"),
        }),
        None => Err(Error::Storage {
            operation,
            message: "empty message value".to_string(),
        }),
    }
}

/// Encodes a counter as 8 big-endian bytes.
pub(crate) fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes an 8-byte big-endian counter.
pub(crate) fn decode_u64(operation: &'static str, value: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = value.try_into().map_err(|_| Error::Storage {
        operation,
        message: format!("expected 8-byte counter, found {} bytes", value.len()),
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{MessageId, Offset, PartitionId};

    #[test]
    fn test_message_value_roundtrip() {
        let message = Message::new("t", PartitionId::new(1), "k", "v", "p")
            .with_id(MessageId::generate())
            .with_offset(Offset::new(9));
        let value = encode_message(&message).unwrap();
        assert_eq!(value[0], FORMAT_VERSION);
        assert_eq!(decode_message("test", &value).unwrap(), message);
    }

    #[test]
    fn test_unencodable_message_rejected() {
        let message = Message::new("t", PartitionId::new(0), "k", "v", "p".repeat(70_000));
        let err = encode_message(&message).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "producer", .. }));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = decode_message("test", &[99, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(decode_message("test", &[]).is_err());
    }

    #[test]
    fn test_counter_roundtrip() {
        assert_eq!(decode_u64("test", &encode_u64(42)).unwrap(), 42);
        assert!(decode_u64("test", &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_open_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&StoreConfig::new(dir.path()).with_fsync_ms(100)).unwrap();
        assert!(store.get("test", "missing").unwrap().is_none());
        store.persist().unwrap();
    }
}
