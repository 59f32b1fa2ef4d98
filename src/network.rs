//! Point-to-point messaging between named nodes
//!
//! Async TCP with length-prefixed bincode frames. Delivery is best-effort:
//! a send that cannot connect is reported to the caller and otherwise
//! forgotten; the commit protocol's timeout/retry policy owns liveness.
//!
//! Replies travel back on the requesting stream, so a participant only ever
//! listens; it never needs the coordinator's address.

use crate::message::CommitMessage;
use crate::types::NodeId;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Handler invoked for each inbound message; a `Some` return is written
/// back to the peer on the same stream. Handlers may block (file I/O,
/// fsync, the operator oracle), so they run on blocking threads.
pub type MessageHandler = Arc<dyn Fn(CommitMessage) -> Option<CommitMessage> + Send + Sync>;

/// Configuration for the messaging layer
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for connection attempts
    pub connect_timeout: Duration,
    /// How long a request waits for its peer's reply. Must cover the
    /// participant's handler, operator oracle included.
    pub request_timeout: Duration,
    /// Upper bound on a single frame; oversized frames are dropped
    pub max_frame_len: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_frame_len: 64 * 1024 * 1024,
        }
    }
}

/// The process's endpoint: a peer address book plus a listener.
pub struct Network {
    local_id: NodeId,
    config: NetworkConfig,
    peers: DashMap<NodeId, SocketAddr>,
}

impl Network {
    pub fn new(local_id: impl Into<NodeId>, config: NetworkConfig) -> Arc<Self> {
        Arc::new(Network {
            local_id: local_id.into(),
            config,
            peers: DashMap::new(),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Register a peer's address.
    pub fn add_peer(&self, node_id: impl Into<NodeId>, addr: SocketAddr) {
        self.peers.insert(node_id.into(), addr);
    }

    fn peer_addr(&self, node_id: &str) -> Result<SocketAddr, String> {
        self.peers
            .get(node_id)
            .map(|a| *a)
            .ok_or_else(|| format!("unknown peer: {}", node_id))
    }

    /// Bind `addr` and serve inbound messages with `handler` until the
    /// process exits. Returns the bound address (port 0 resolves here).
    pub async fn start_listener(
        self: &Arc<Self>,
        addr: SocketAddr,
        handler: MessageHandler,
    ) -> Result<SocketAddr, String> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("failed to bind {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("failed to read bound address: {}", e))?;
        debug!(node = %self.local_id, addr = %local_addr, "listening");

        let network = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let network = Arc::clone(&network);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) =
                                network.serve_connection(stream, handler).await
                            {
                                debug!(peer = %peer_addr, error = %e, "connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn serve_connection(
        &self,
        mut stream: TcpStream,
        handler: MessageHandler,
    ) -> Result<(), String> {
        loop {
            let msg = match self.read_frame(&mut stream).await? {
                Some(msg) => msg,
                None => return Ok(()),
            };

            let handler = Arc::clone(&handler);
            let reply = tokio::task::spawn_blocking(move || handler(msg))
                .await
                .map_err(|e| format!("handler panicked: {}", e))?;

            if let Some(reply) = reply {
                self.write_frame(&mut stream, &reply).await?;
            }
        }
    }

    /// Send a message and wait for the peer's optional reply on the same
    /// stream. `Ok(None)` means the peer handled the message without
    /// replying (or closed the stream first).
    pub async fn request(
        &self,
        receiver: &str,
        message: CommitMessage,
    ) -> Result<Option<CommitMessage>, String> {
        let addr = self.peer_addr(receiver)?;

        let mut stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| format!("connection timeout to {} ({})", receiver, addr))?
        .map_err(|e| format!("failed to connect to {} ({}): {}", receiver, addr, e))?;

        self.write_frame(&mut stream, &message).await?;

        match tokio::time::timeout(
            self.config.request_timeout,
            self.read_frame(&mut stream),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!("reply timeout from {}", receiver)),
        }
    }

    /// Fire-and-forget send; any reply from the peer is discarded.
    pub async fn send(&self, receiver: &str, message: CommitMessage) -> Result<(), String> {
        let addr = self.peer_addr(receiver)?;
        let mut stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| format!("connection timeout to {} ({})", receiver, addr))?
        .map_err(|e| format!("failed to connect to {} ({}): {}", receiver, addr, e))?;
        self.write_frame(&mut stream, &message).await
    }

    async fn write_frame(
        &self,
        stream: &mut TcpStream,
        message: &CommitMessage,
    ) -> Result<(), String> {
        let bytes = message.to_bytes()?;
        let len = bytes.len() as u32;
        stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| format!("failed to write frame header: {}", e))?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| format!("failed to write frame: {}", e))?;
        stream
            .flush()
            .await
            .map_err(|e| format!("failed to flush frame: {}", e))
    }

    /// Read one frame; `Ok(None)` on clean EOF before a header.
    async fn read_frame(
        &self,
        stream: &mut TcpStream,
    ) -> Result<Option<CommitMessage>, String> {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(format!("failed to read frame header: {}", e)),
        }

        let len = u32::from_le_bytes(len_bytes);
        if len > self.config.max_frame_len {
            return Err(format!("frame of {} bytes exceeds limit", len));
        }

        let mut bytes = vec![0u8; len as usize];
        stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| format!("failed to read frame: {}", e))?;

        match CommitMessage::from_bytes(&bytes) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!(error = %e, "dropping corrupt inbound message");
                Ok(None)
            }
        }
    }
}
