//! Durable work queues with in-flight tracking and timed redelivery.
//!
//! A queue message is always exactly one of:
//! - **pending**: `q:{queue}:{generation}`, FIFO by generation,
//! - **in-flight**: `f:{queue}:{id}` (expiry) plus `b:{queue}:{id}` (body),
//! - **gone**: acknowledged, or expired and moved back to pending.
//!
//! Every transition is a single transaction. The store materializes a queue
//! implicitly on first enqueue; callers that need an existence check consult
//! the catalog.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use courier_core::{Error, Message, MessageId, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{decode_message, decode_u64, encode_message, encode_u64, Store};
use crate::keys;

/// Payload substituted on redelivery under [`RedeliveryPayload::Placeholder`].
pub const PLACEHOLDER_PAYLOAD: &[u8] = b"expired";

/// What a redelivered message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedeliveryPayload {
    /// The original payload, unchanged.
    #[default]
    Preserve,
    /// The bytes `expired`. Reproduces a historical lossy behavior for
    /// compatibility testing only.
    Placeholder,
}

/// Queue timing and redelivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a dequeued message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// How often the redelivery sweep runs.
    pub sweep_interval: Duration,
    /// Payload policy for redelivered messages.
    pub redelivery_payload: RedeliveryPayload,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            redelivery_payload: RedeliveryPayload::Preserve,
        }
    }
}

impl QueueConfig {
    /// Sets the visibility timeout.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the redelivery payload policy.
    #[must_use]
    pub const fn with_redelivery_payload(mut self, policy: RedeliveryPayload) -> Self {
        self.redelivery_payload = policy;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if either duration is zero.
    pub fn validate(&self) -> Result<()> {
        if self.visibility_timeout.is_zero() {
            return Err(Error::InvalidArgument {
                name: "visibility_timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidArgument {
                name: "sweep_interval",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Returns the current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Durable at-least-once queues.
#[derive(Debug, Clone)]
pub struct QueueStore {
    store: Store,
    config: QueueConfig,
}

impl QueueStore {
    /// Creates a queue store over `store`.
    #[must_use]
    pub const fn new(store: Store, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Returns the queue configuration.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends `message` to the pending tail of `queue`.
    ///
    /// Assigns an identifier if absent and returns it.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the message cannot be encoded, or
    /// `Storage` if the transaction fails.
    pub fn enqueue(&self, queue: &str, mut message: Message) -> Result<MessageId> {
        let id = message.ensure_id();
        let value = encode_message(&message)?;
        let generation_key = keys::generation(queue);

        let mut tx = self.store.write_tx();
        let generation = tx
            .get(self.store.partition(), &generation_key)
            .map_err(|e| Error::storage("enqueue", e))?
            .map(|v| decode_u64("enqueue", &v))
            .transpose()?
            .unwrap_or(0);
        tx.insert(
            self.store.partition(),
            keys::pending(queue, generation),
            value,
        );
        tx.insert(
            self.store.partition(),
            generation_key.as_str(),
            encode_u64(generation + 1),
        );
        tx.commit().map_err(|e| Error::storage("enqueue", e))?;

        debug!(queue, id = %id, generation, "Enqueued message");
        Ok(id)
    }

    /// Pops the pending head of `queue` and marks it in-flight.
    ///
    /// Returns `None` (not an error) if nothing is pending.
    ///
    /// # Errors
    /// Returns `Storage` if the transaction fails.
    pub fn dequeue(&self, queue: &str) -> Result<Option<Message>> {
        self.dequeue_at(queue, now_millis())
    }

    /// [`dequeue`](Self::dequeue) with an explicit clock reading.
    ///
    /// # Errors
    /// Returns `Storage` if the transaction fails.
    pub fn dequeue_at(&self, queue: &str, now_ms: u64) -> Result<Option<Message>> {
        let mut tx = self.store.write_tx();
        let head = tx
            .prefix(self.store.partition(), keys::pending_prefix(queue))
            .next()
            .transpose()
            .map_err(|e| Error::storage("dequeue", e))?;
        let Some((key, value)) = head else {
            return Ok(None);
        };

        let message = decode_message("dequeue", &value)?;
        let expiry = now_ms.saturating_add(visibility_millis(&self.config));

        tx.remove(self.store.partition(), key);
        tx.insert(
            self.store.partition(),
            keys::inflight_expiry(queue, message.id),
            encode_u64(expiry),
        );
        tx.insert(
            self.store.partition(),
            keys::inflight_body(queue, message.id),
            value,
        );
        tx.commit().map_err(|e| Error::storage("dequeue", e))?;

        debug!(queue, id = %message.id, expiry, "Dequeued message");
        Ok(Some(message))
    }

    /// Acknowledges an in-flight message. Unknown ids succeed.
    ///
    /// # Errors
    /// Returns `Storage` if the transaction fails.
    pub fn ack(&self, queue: &str, id: MessageId) -> Result<()> {
        let mut tx = self.store.write_tx();
        tx.remove(self.store.partition(), keys::inflight_expiry(queue, id));
        tx.remove(self.store.partition(), keys::inflight_body(queue, id));
        tx.commit().map_err(|e| Error::storage("ack", e))?;
        debug!(queue, id = %id, "Acknowledged message");
        Ok(())
    }

    /// Moves every expired in-flight message back to pending.
    ///
    /// # Errors
    /// Returns `Storage` if the transaction fails.
    pub fn requeue_expired(&self) -> Result<usize> {
        self.requeue_expired_at(now_millis())
    }

    /// [`requeue_expired`](Self::requeue_expired) with an explicit clock
    /// reading. An entry expires once `now_ms` is past its expiry. Returns the
    /// number of messages redelivered.
    ///
    /// # Errors
    /// Returns `Storage` if the transaction fails.
    pub fn requeue_expired_at(&self, now_ms: u64) -> Result<usize> {
        let mut tx = self.store.write_tx();
        let inflight = tx
            .prefix(self.store.partition(), keys::INFLIGHT_PREFIX)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::storage("requeue", e))?;

        let mut generations: HashMap<String, u64> = HashMap::new();
        let mut requeued = 0;

        for (key, value) in inflight {
            let Some((queue, id)) = keys::parse_inflight(&key) else {
                warn!(key = %String::from_utf8_lossy(&key), "Dropping malformed in-flight key");
                tx.remove(self.store.partition(), key);
                continue;
            };
            let expiry = match decode_u64("requeue", &value) {
                Ok(expiry) => expiry,
                Err(e) => {
                    warn!(queue = %queue, id = %id, error = %e, "Dropping malformed in-flight expiry");
                    tx.remove(self.store.partition(), key);
                    continue;
                }
            };
            if now_ms <= expiry {
                continue;
            }

            let body_key = keys::inflight_body(&queue, id);
            let mut message = match tx
                .get(self.store.partition(), &body_key)
                .map_err(|e| Error::storage("requeue", e))?
            {
                Some(body) => decode_message("requeue", &body)?,
                None => Message::for_queue(queue.as_str(), Bytes::new(), String::new()).with_id(id),
            };
            if self.config.redelivery_payload == RedeliveryPayload::Placeholder {
                message.payload = Bytes::from_static(PLACEHOLDER_PAYLOAD);
            }

            let generation = match generations.get(&queue) {
                Some(generation) => *generation,
                None => tx
                    .get(self.store.partition(), keys::generation(&queue))
                    .map_err(|e| Error::storage("requeue", e))?
                    .map(|v| decode_u64("requeue", &v))
                    .transpose()?
                    .unwrap_or(0),
            };
            tx.insert(
                self.store.partition(),
                keys::pending(&queue, generation),
                encode_message(&message)?,
            );
            tx.insert(
                self.store.partition(),
                keys::generation(&queue),
                encode_u64(generation + 1),
            );
            tx.remove(self.store.partition(), key);
            tx.remove(self.store.partition(), body_key);
            generations.insert(queue, generation + 1);
            requeued += 1;
        }

        tx.commit().map_err(|e| Error::storage("requeue", e))?;
        Ok(requeued)
    }

    /// Returns the number of pending messages in `queue`.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn pending_len(&self, queue: &str) -> Result<usize> {
        Ok(self
            .store
            .scan_prefix("pending_len", &keys::pending_prefix(queue))?
            .len())
    }

    /// Returns the number of in-flight messages in `queue`.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn in_flight_len(&self, queue: &str) -> Result<usize> {
        Ok(self
            .store
            .scan_prefix("in_flight_len", &keys::inflight_prefix(queue))?
            .len())
    }

    /// Spawns the periodic redelivery sweep.
    ///
    /// Runs every `sweep_interval` until `shutdown_rx` fires or its sender is
    /// dropped. Each sweep runs on the blocking pool since it scans every
    /// in-flight key in one transaction. Sweep failures are logged and
    /// retried on the next tick.
    pub fn spawn_requeue_loop(&self, mut shutdown_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let queues = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(queues.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Requeue loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let sweeper = queues.clone();
                        match tokio::task::spawn_blocking(move || sweeper.requeue_expired()).await {
                            Ok(Ok(0)) => {}
                            Ok(Ok(count)) => info!(count, "Redelivered expired messages"),
                            Ok(Err(e)) => warn!(error = %e, "Requeue sweep failed"),
                            Err(e) => warn!(error = %e, "Requeue sweep task panicked"),
                        }
                    }
                }
            }
        })
    }
}

fn visibility_millis(config: &QueueConfig) -> u64 {
    u64::try_from(config.visibility_timeout.as_millis()).unwrap_or(u64::MAX)
}
