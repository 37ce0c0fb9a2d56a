//! TCP transport for the peer protocol.
//!
//! # Design
//!
//! - **Outbound**: a [`PeerClient`] per peer keeps one cached connection and
//!   performs strictly sequential request/response exchanges on it. Any I/O,
//!   codec or timeout failure drops the connection; the next call reconnects.
//! - **Inbound**: a [`ReplicaServer`] accepts connections and serves each on
//!   its own task, answering every request frame with one response frame.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use courier_core::NodeId;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{
    decode_request, decode_response, encode_request, encode_response, CodecError, Request,
    Response,
};
use crate::config::ClusterTiming;
use crate::replica::ReplicaService;

/// Initial read buffer size (64 KB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind to address.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to connect to peer.
    #[error("failed to connect to peer {peer} at {addr}: {source}")]
    ConnectFailed {
        /// The peer node ID.
        peer: NodeId,
        /// The peer address.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The exchange did not complete in time.
    #[error("request to peer {peer} timed out after {timeout:?}")]
    Timeout {
        /// The peer node ID.
        peer: NodeId,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The peer closed the connection mid-exchange.
    #[error("connection to peer {peer} closed")]
    Closed {
        /// The peer node ID.
        peer: NodeId,
    },

    /// The peer answered with an error.
    #[error("peer {peer} returned error: {message}")]
    Remote {
        /// The peer node ID.
        peer: NodeId,
        /// Error description from the peer.
        message: String,
    },

    /// The peer answered with the wrong response type.
    #[error("unexpected response from peer {peer}")]
    UnexpectedResponse {
        /// The peer node ID.
        peer: NodeId,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for courier_core::Error {
    fn from(e: TransportError) -> Self {
        let peer = match &e {
            TransportError::ConnectFailed { peer, .. }
            | TransportError::Timeout { peer, .. }
            | TransportError::Closed { peer }
            | TransportError::Remote { peer, .. }
            | TransportError::UnexpectedResponse { peer } => peer.to_string(),
            TransportError::BindFailed { addr, .. } => addr.clone(),
            TransportError::Codec(_) | TransportError::Io(_) => "unknown".to_string(),
        };
        Self::Replication {
            peer,
            message: e.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// Outbound connection to one peer.
#[derive(Debug)]
pub struct PeerClient {
    peer_id: NodeId,
    addr: String,
    timing: ClusterTiming,
    stream: Mutex<Option<TcpStream>>,
}

impl PeerClient {
    /// Creates a client. No connection is made until the first call.
    #[must_use]
    pub fn new(peer_id: NodeId, addr: impl Into<String>, timing: ClusterTiming) -> Self {
        Self {
            peer_id,
            addr: addr.into(),
            timing,
            stream: Mutex::new(None),
        }
    }

    /// Returns the peer's node ID.
    #[must_use]
    pub const fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    /// Returns the peer's address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends `request` and waits for the response, bounded by the request
    /// timeout. `Response::Error` is surfaced as `TransportError::Remote`.
    ///
    /// # Errors
    /// Returns an error if connecting, sending, receiving or decoding fails.
    pub async fn call(&self, request: &Request) -> TransportResult<Response> {
        self.call_with_timeout(request, self.timing.request_timeout)
            .await
    }

    /// Like [`call`](Self::call) with an explicit timeout.
    ///
    /// # Errors
    /// Returns an error if connecting, sending, receiving or decoding fails.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn call_with_timeout(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> TransportResult<Response> {
        let encoded = encode_request(request)?;

        let mut guard = self.stream.lock().await;
        let result = tokio::time::timeout(timeout, async {
            if guard.is_none() {
                let stream =
                    connect_to_peer(&self.peer_id, &self.addr, self.timing.connect_timeout)
                        .await?;
                debug!(peer = %self.peer_id, addr = %self.addr, "Connected to peer");
                *guard = Some(stream);
            }
            match guard.as_mut() {
                Some(stream) => exchange(stream, &encoded, &self.peer_id).await,
                None => Err(TransportError::Closed {
                    peer: self.peer_id.clone(),
                }),
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                peer: self.peer_id.clone(),
                timeout,
            })
        });

        match result {
            Ok(Response::Error { message }) => Err(TransportError::Remote {
                peer: self.peer_id.clone(),
                message,
            }),
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream may hold a half-read frame.
                *guard = None;
                Err(e)
            }
        }
    }
}

/// Writes one request frame and reads one response frame.
async fn exchange(
    stream: &mut TcpStream,
    encoded: &[u8],
    peer: &NodeId,
) -> TransportResult<Response> {
    stream.write_all(encoded).await?;
    stream.flush().await?;

    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        match decode_response(&buffer) {
            Ok((response, _)) => return Ok(response),
            Err(CodecError::InsufficientData { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        let bytes_read = stream.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            return Err(TransportError::Closed { peer: peer.clone() });
        }
    }
}

/// Connects to a peer with timeout.
///
/// The address is resolved at connection time to support hostnames.
async fn connect_to_peer(
    peer: &NodeId,
    addr: &str,
    timeout: Duration,
) -> TransportResult<TcpStream> {
    let connect_future = async {
        let mut addrs = tokio::net::lookup_host(addr).await?;
        let resolved = addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {addr}"),
            )
        })?;
        TcpStream::connect(resolved).await
    };

    match tokio::time::timeout(timeout, connect_future).await {
        Ok(Ok(stream)) => {
            // Disable Nagle's algorithm for lower latency.
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(TransportError::ConnectFailed {
            peer: peer.clone(),
            addr: addr.to_string(),
            source: e,
        }),
        Err(_) => Err(TransportError::ConnectFailed {
            peer: peer.clone(),
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

// -----------------------------------------------------------------------------
// Server
// -----------------------------------------------------------------------------

/// Inbound peer protocol listener.
#[derive(Debug)]
pub struct ReplicaServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ReplicaServer {
    /// Binds to `addr` (`host:port`, resolved first).
    ///
    /// # Errors
    /// Returns `BindFailed` if resolution or binding fails.
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let bind_failed = |source| TransportError::BindFailed {
            addr: addr.to_string(),
            source,
        };
        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(bind_failed)?
            .next()
            .ok_or_else(|| {
                bind_failed(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses found for {addr}"),
                ))
            })?;

        // Bind the listener with SO_REUSEADDR to allow quick restarts.
        let listener = create_reusable_listener(resolved).map_err(bind_failed)?;
        let local_addr = listener.local_addr().map_err(bind_failed)?;
        info!(addr = %local_addr, "Replica server listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop. It exits when `shutdown_rx` fires or its
    /// sender is dropped; in-progress connections finish on their own.
    pub fn spawn(
        self,
        service: ReplicaService,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(addr = %self.local_addr, "Replica server shutting down");
                        break;
                    }
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer_addr = %peer_addr, "Accepted connection");
                            let service = service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, service).await {
                                    debug!(peer_addr = %peer_addr, error = %e, "Connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        })
    }
}

/// Answers request frames on one connection until the peer disconnects.
async fn serve_connection(mut stream: TcpStream, service: ReplicaService) -> TransportResult<()> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            debug!("Connection closed by peer");
            return Ok(());
        }

        // Serve every complete frame in the buffer.
        while !buffer.is_empty() {
            match decode_request(&buffer) {
                Ok((request, consumed)) => {
                    let _ = buffer.split_to(consumed);
                    let response = handle_blocking(&service, request).await;
                    let encoded = match encode_response(&response) {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode response");
                            encode_response(&Response::Error {
                                message: e.to_string(),
                            })?
                        }
                    };
                    stream.write_all(&encoded).await?;
                    stream.flush().await?;
                }
                Err(CodecError::InsufficientData { .. }) => break,
                Err(e) => {
                    error!(error = %e, "Failed to decode request");
                    return Err(e.into());
                }
            }
        }

        // Prevent buffer from growing unbounded.
        if buffer.is_empty() && buffer.capacity() > READ_BUFFER_SIZE * 4 {
            buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        }
    }
}

/// Runs one request on the blocking pool, since it commits fjall
/// transactions.
async fn handle_blocking(service: &ReplicaService, request: Request) -> Response {
    let service = service.clone();
    tokio::task::spawn_blocking(move || service.handle(request))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Replica request task failed");
            Response::Error {
                message: e.to_string(),
            }
        })
}

/// Create a TCP listener with `SO_REUSEADDR` enabled.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use courier_core::{Limits, Message, MessageId, Offset, PartitionId};
    use courier_store::{HwmIndex, LogStore, Store};

    async fn start_server() -> (tempfile::TempDir, SocketAddr, mpsc::Sender<()>, JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).unwrap();
        let log = LogStore::new(store, Arc::new(HwmIndex::new()));
        let service = ReplicaService::new(log, Limits::default());

        let server = ReplicaServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = server.spawn(service, shutdown_rx);
        (dir, addr, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let (_dir, addr, shutdown_tx, handle) = start_server().await;
        let client = PeerClient::new(
            NodeId::new("n1"),
            addr.to_string(),
            ClusterTiming::fast_for_testing(),
        );
        assert_eq!(client.call(&Request::Ping).await.unwrap(), Response::Pong);
        // The cached connection is reused.
        assert_eq!(client.call(&Request::Ping).await.unwrap(), Response::Pong);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_replicate_then_get_range_over_tcp() {
        let (_dir, addr, _shutdown_tx, _handle) = start_server().await;
        let client = PeerClient::new(
            NodeId::new("n1"),
            addr.to_string(),
            ClusterTiming::fast_for_testing(),
        );

        let message = Message::new("t", PartitionId::new(0), "k", vec![0u8, 1, 255], "p")
            .with_id(MessageId::generate())
            .with_offset(Offset::new(0));
        let ack = client
            .call(&Request::Replicate(vec![message.clone()]))
            .await
            .unwrap();
        assert!(matches!(ack, Response::Ack(a) if a.applied == 1));

        let range = client
            .call(&Request::GetRange {
                topic: "t".to_string(),
                partition: PartitionId::new(0),
                from: Offset::new(0),
                to: None,
            })
            .await
            .unwrap();
        assert_eq!(range, Response::Batch(vec![message]));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = PeerClient::new(
            NodeId::new("n2"),
            addr.to_string(),
            ClusterTiming::fast_for_testing(),
        );
        let err = client.call(&Request::Ping).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectFailed { .. } | TransportError::Timeout { .. }
        ));
        let core: courier_core::Error = err.into();
        assert!(matches!(core, courier_core::Error::Replication { ref peer, .. } if peer == "n2"));
    }
}
