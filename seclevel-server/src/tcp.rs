//! TCP transport.
//!
//! Each message travels on its own connection as one frame:
//! `[u8 id_len][sender id][u32 BE payload_len][payload]`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

use seclevel_core::identity::MAX_IDENTITY_LEN;
use seclevel_core::{DeviceIdentity, SecLevelError, SecLevelResult};

use crate::service::{SecurityLevelService, WeakService};
use crate::transport::{SendFailure, Transport};

/// Encode one frame.
pub fn encode_frame(sender: &DeviceIdentity, payload: &[u8]) -> Vec<u8> {
    let id = sender.as_bytes();
    let mut frame = Vec::with_capacity(1 + id.len() + 4 + payload.len());
    frame.push(id.len() as u8);
    frame.extend_from_slice(id);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read one frame; `None` on a clean end of stream.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: usize,
) -> SecLevelResult<Option<(DeviceIdentity, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let id_len = match reader.read_u8().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SecLevelError::Transport(format!("read error: {}", e))),
    };
    if id_len == 0 || id_len > MAX_IDENTITY_LEN {
        return Err(SecLevelError::Malformed(format!("bad sender id length {}", id_len)));
    }

    let mut id = vec![0u8; id_len];
    reader
        .read_exact(&mut id)
        .await
        .map_err(|e| SecLevelError::Transport(format!("read error: {}", e)))?;
    let sender = DeviceIdentity::new(&id)?;

    let len = reader
        .read_u32()
        .await
        .map_err(|e| SecLevelError::Transport(format!("read error: {}", e)))? as usize;
    if len > max_payload {
        return Err(SecLevelError::Malformed(format!(
            "message too large: {} > {}",
            len, max_payload
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| SecLevelError::Transport(format!("read error: {}", e)))?;
    Ok(Some((sender, payload)))
}

/// Transport over plain TCP to a static peer table.
pub struct TcpTransport {
    identity: DeviceIdentity,
    peers: HashMap<DeviceIdentity, SocketAddr>,
    runtime: Handle,
    service: RwLock<WeakService>,
    max_message_len: usize,
    ready: AtomicBool,
}

impl TcpTransport {
    /// Create a transport; it is not ready until [`run`](Self::run) binds.
    pub fn new(
        identity: DeviceIdentity,
        peers: HashMap<DeviceIdentity, SocketAddr>,
        runtime: Handle,
        max_message_len: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            peers,
            runtime,
            service: RwLock::new(WeakService::default()),
            max_message_len,
            ready: AtomicBool::new(false),
        })
    }

    /// Deliver inbound messages and send results to `service`.
    pub fn attach(&self, service: &SecurityLevelService) {
        *self.service.write().unwrap_or_else(PoisonError::into_inner) = service.downgrade();
    }

    fn service(&self) -> Option<SecurityLevelService> {
        self.service
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// Accept inbound connections until the listener fails.
    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr) -> SecLevelResult<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| SecLevelError::Transport(format!("failed to bind {}: {}", bind_addr, e)))?;
        self.ready.store(true, Ordering::Release);
        tracing::info!("listening on {}", bind_addr);

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SecLevelError::Transport(format!("accept failed: {}", e)))?;
            tracing::debug!("connection from {}", addr);

            let transport = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = transport.handle_connection(stream).await {
                    tracing::warn!("connection error from {}: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> SecLevelResult<()> {
        while let Some((sender, payload)) = read_frame(&mut stream, self.max_message_len).await? {
            let Some(service) = self.service() else {
                tracing::debug!("no service attached, dropping frame");
                continue;
            };
            // handlers take blocking locks
            let delivered = tokio::task::spawn_blocking(move || {
                service.on_peer_message(&sender, &payload)
            })
            .await
            .map_err(|e| SecLevelError::Transport(format!("dispatch failed: {}", e)))?;
            if let Err(e) = delivered {
                tracing::debug!(device = %sender.short(), "message not processed: {}", e);
            }
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn self_identity(&self) -> Option<DeviceIdentity> {
        Some(self.identity)
    }

    fn is_peer_online(&self, identity: &DeviceIdentity) -> bool {
        self.peers.contains_key(identity)
    }

    fn send(
        &self,
        transaction_id: u32,
        identity: &DeviceIdentity,
        bytes: &[u8],
    ) -> Result<(), SendFailure> {
        if !self.is_ready() {
            return Err(SendFailure::NotReady);
        }
        let addr = *self.peers.get(identity).ok_or(SendFailure::SessionOpen)?;
        let frame = encode_frame(&self.identity, bytes);
        let peer = *identity;
        let transport = TransportRef {
            service: self.service.read().unwrap_or_else(PoisonError::into_inner).clone(),
            runtime: self.runtime.clone(),
        };

        self.runtime.spawn(async move {
            let mut stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(device = %peer.short(), "connect to {} failed: {}", addr, e);
                    transport.report(transaction_id, peer, SendFailure::SessionOpen);
                    return;
                }
            };
            let written = match stream.write_all(&frame).await {
                Ok(()) => stream.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!(device = %peer.short(), "write to {} failed: {}", addr, e);
                transport.report(transaction_id, peer, SendFailure::Delivery);
            }
        });
        Ok(())
    }
}

/// What a detached send task needs to report a late failure.
struct TransportRef {
    service: WeakService,
    runtime: Handle,
}

impl TransportRef {
    fn report(&self, transaction_id: u32, peer: DeviceIdentity, failure: SendFailure) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        self.runtime.spawn_blocking(move || {
            if let Err(e) = service.on_send_result(&peer, transaction_id, failure) {
                tracing::debug!(device = %peer.short(), "send result dropped: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let sender = DeviceIdentity::new(b"node-a").unwrap();
        let frame = encode_frame(&sender, b"hello\0");
        assert_eq!(frame[0], 6);
        assert_eq!(&frame[7..11], &6u32.to_be_bytes());

        let mut reader = frame.as_slice();
        let (id, payload) = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(id, sender);
        assert_eq!(payload, b"hello\0");
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let sender = DeviceIdentity::new(b"node-a").unwrap();
        let frame = encode_frame(&sender, &[b'x'; 64]);
        let mut reader = frame.as_slice();
        assert!(matches!(
            read_frame(&mut reader, 16).await,
            Err(SecLevelError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn zero_length_sender_rejected() {
        let frame = [0u8, 0, 0, 0, 0];
        let mut reader = &frame[..];
        assert!(read_frame(&mut reader, 16).await.is_err());
    }

    #[tokio::test]
    async fn unknown_peer_is_session_failure() {
        let transport = TcpTransport::new(
            DeviceIdentity::new(b"node-a").unwrap(),
            HashMap::new(),
            Handle::current(),
            1024,
        );
        transport.ready.store(true, Ordering::Release);
        let peer = DeviceIdentity::new(b"node-b").unwrap();

        assert!(!transport.is_peer_online(&peer));
        assert_eq!(transport.send(1, &peer, b"x"), Err(SendFailure::SessionOpen));
    }

    #[tokio::test]
    async fn not_ready_before_bind() {
        let peer = DeviceIdentity::new(b"node-b").unwrap();
        let transport = TcpTransport::new(
            DeviceIdentity::new(b"node-a").unwrap(),
            HashMap::from([(peer, SocketAddr::from(([127, 0, 0, 1], 1)))]),
            Handle::current(),
            1024,
        );
        assert_eq!(transport.send(1, &peer, b"x"), Err(SendFailure::NotReady));
    }
}
