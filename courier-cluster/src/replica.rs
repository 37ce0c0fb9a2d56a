//! Inbound replica apply service.
//!
//! Applies batches replicated by peers and serves range reads for catch-up.
//! It is a pure applier: nothing it writes is broadcast onward.

use courier_core::{Error, Limits, Message, Offset, PartitionId, Result};
use courier_store::{AppendOutcome, LogStore};
use tracing::{debug, warn};

use crate::codec::{ReplicateAck, Request, Response, BATCH_OVERHEAD, MAX_FRAME_SIZE};

/// Serves the peer protocol against the local log.
#[derive(Debug, Clone)]
pub struct ReplicaService {
    log: LogStore,
    limits: Limits,
}

impl ReplicaService {
    /// Creates a service over `log`.
    #[must_use]
    pub const fn new(log: LogStore, limits: Limits) -> Self {
        Self { log, limits }
    }

    /// Applies each message at its original offset.
    ///
    /// # Errors
    /// - `InvalidArgument` if the batch exceeds the batch limit.
    /// - `Storage` if a write fails. Messages before the failure stay applied.
    pub fn replicate(&self, batch: &[Message]) -> Result<ReplicateAck> {
        if batch.len() > self.limits.max_batch_messages as usize {
            return Err(Error::InvalidArgument {
                name: "batch",
                reason: format!(
                    "{} messages exceeds limit of {}",
                    batch.len(),
                    self.limits.max_batch_messages
                ),
            });
        }

        let mut ack = ReplicateAck::default();
        for message in batch {
            match self.log.append_at_offset(message)? {
                AppendOutcome::Applied => ack.applied += 1,
                AppendOutcome::Duplicate => ack.duplicates += 1,
            }
        }
        debug!(
            applied = ack.applied,
            duplicates = ack.duplicates,
            "Applied replicated batch"
        );
        Ok(ack)
    }

    /// Returns locally stored messages with `from <= offset < to`.
    ///
    /// An unbounded `to` reads to the local end, capped at the range limit.
    /// The batch also stops short once it would no longer fit one response
    /// frame, but always holds at least one message when any is stored, so
    /// a caller resumes from the last offset returned.
    ///
    /// # Errors
    /// Returns `Storage` if the read fails.
    pub fn get_range(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
    ) -> Result<Vec<Message>> {
        let cap = self.limits.max_range_messages as usize;
        let max = to.map_or(cap, |to| {
            usize::try_from(to.get().saturating_sub(from.get()))
                .unwrap_or(cap)
                .min(cap)
        });
        self.log
            .read_range_within(topic, partition, from, to, max, self.max_batch_bytes())
    }

    /// Bytes of messages one `Batch` frame can carry.
    fn max_batch_bytes(&self) -> usize {
        let frame = self.limits.max_frame_bytes.min(MAX_FRAME_SIZE) as usize;
        frame.saturating_sub(BATCH_OVERHEAD)
    }

    /// Dispatches one protocol request.
    #[must_use]
    pub fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Replicate(batch) => self.replicate(&batch).map(Response::Ack),
            Request::GetRange {
                topic,
                partition,
                from,
                to,
            } => self
                .get_range(&topic, partition, from, to)
                .map(Response::Batch),
            Request::Ping => Ok(Response::Pong),
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "Replica request failed");
            Response::Error {
                message: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use courier_core::MessageId;
    use courier_store::{HwmIndex, Store};

    fn open() -> (tempfile::TempDir, ReplicaService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).unwrap();
        let log = LogStore::new(store, Arc::new(HwmIndex::new()));
        (dir, ReplicaService::new(log, Limits::default()))
    }

    fn message(offset: u64) -> Message {
        Message::new("t", PartitionId::new(0), "k", format!("m{offset}"), "p")
            .with_id(MessageId::generate())
            .with_offset(Offset::new(offset))
    }

    #[test]
    fn test_replicate_counts_duplicates() {
        let (_dir, replica) = open();
        let batch = vec![message(0), message(1)];
        assert_eq!(
            replica.replicate(&batch).unwrap(),
            ReplicateAck {
                applied: 2,
                duplicates: 0
            }
        );
        assert_eq!(
            replica.replicate(&batch).unwrap(),
            ReplicateAck {
                applied: 0,
                duplicates: 2
            }
        );
    }

    #[test]
    fn test_get_range_bounded_and_unbounded() {
        let (_dir, replica) = open();
        let batch: Vec<Message> = (0..5).map(message).collect();
        replica.replicate(&batch).unwrap();

        let p = PartitionId::new(0);
        let bounded = replica
            .get_range("t", p, Offset::new(1), Some(Offset::new(3)))
            .unwrap();
        assert_eq!(bounded, batch[1..3].to_vec());

        let unbounded = replica.get_range("t", p, Offset::new(2), None).unwrap();
        assert_eq!(unbounded, batch[2..].to_vec());
    }

    #[test]
    fn test_get_range_fits_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).unwrap();
        let log = LogStore::new(store, Arc::new(HwmIndex::new()));
        let mut limits = Limits::default();
        limits.max_frame_bytes = 4096;
        let replica = ReplicaService::new(log, limits);

        let batch: Vec<Message> = (0..10)
            .map(|i| Message {
                payload: vec![7u8; 1000].into(),
                ..message(i)
            })
            .collect();
        replica.replicate(&batch).unwrap();

        let page = replica
            .get_range("t", PartitionId::new(0), Offset::new(0), None)
            .unwrap();
        // Each stored record is 1044 bytes, so three fit.
        assert_eq!(page, batch[..3].to_vec());
        let encoded = crate::codec::encode_response(&Response::Batch(page)).unwrap();
        assert!(encoded.len() <= 4096 + 4);

        let rest = replica
            .get_range("t", PartitionId::new(0), Offset::new(3), None)
            .unwrap();
        assert_eq!(rest[0].offset, Offset::new(3));
    }

    #[test]
    fn test_replicate_rejects_last_offset() {
        let (_dir, replica) = open();
        let response = replica.handle(Request::Replicate(vec![message(u64::MAX)]));
        assert!(matches!(response, Response::Error { ref message } if message.contains("offset")));
        assert!(replica
            .get_range("t", PartitionId::new(0), Offset::new(0), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).unwrap();
        let log = LogStore::new(store, Arc::new(HwmIndex::new()));
        let mut limits = Limits::default();
        limits.max_batch_messages = 1;
        let replica = ReplicaService::new(log, limits);

        let response = replica.handle(Request::Replicate(vec![message(0), message(1)]));
        assert!(matches!(response, Response::Error { .. }));
    }

    #[test]
    fn test_handle_ping() {
        let (_dir, replica) = open();
        assert_eq!(replica.handle(Request::Ping), Response::Pong);
    }
}
