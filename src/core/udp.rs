//! UDP relay
//!
//! One bound socket per rule. Every datagram received is counted, framed as
//! `[u16 BE length][payload]` and forwarded to the upstream from the same
//! socket. There is no reply path.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::registry::SessionRegistry;
use crate::error::{ForwardError, Result};
use crate::logger::log;

/// Length prefix size of a forwarded frame
pub const FRAME_HEADER_LEN: usize = 2;

/// Receive buffer size; holds any UDP payload without truncation
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Frame a datagram payload with its big-endian length
///
/// Returns `None` if the payload does not fit the 16-bit length prefix.
pub fn frame_datagram(payload: &[u8]) -> Option<Bytes> {
    let len = u16::try_from(payload.len()).ok()?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u16(len);
    frame.put_slice(payload);
    Some(frame.freeze())
}

/// Resolve `host:port` once, preferring the local socket's address family
pub async fn resolve_upstream(upstream: &str, local: &SocketAddr) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(upstream)
        .await
        .map_err(|e| ForwardError::Resolve(format!("{}: {}", upstream, e)))?
        .collect();

    candidates
        .iter()
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| ForwardError::Resolve(format!("{}: no addresses", upstream)))
}

/// Datagram forwarder for one rule
pub struct UdpRelay {
    pub socket: Arc<UdpSocket>,
    pub upstream: SocketAddr,
    /// Rule key, for logs
    pub rule: String,
    pub registry: Arc<SessionRegistry>,
    /// Forwarding tasks, awaited on teardown
    pub tracker: TaskTracker,
}

impl UdpRelay {
    /// Receive and forward until cancelled or the socket fails
    pub async fn run(self, token: CancellationToken) -> io::Result<()> {
        // Relay buffers are sized for TCP chunks, datagrams need the full range
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        loop {
            let (n, peer) = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf[..]) => received?,
            };

            if n == 0 {
                log::debug!(rule = %self.rule, peer = %peer, "Empty datagram, dropped");
                continue;
            }
            if !self.registry.add_bytes(n as u64) {
                return Ok(());
            }

            let Some(frame) = frame_datagram(&buf[..n]) else {
                log::warn!(rule = %self.rule, peer = %peer, len = n, "Datagram too large to frame, dropped");
                continue;
            };
            log::debug!(rule = %self.rule, peer = %peer, len = n, "Datagram relayed");

            let socket = Arc::clone(&self.socket);
            let upstream = self.upstream;
            let rule = self.rule.clone();
            self.tracker.spawn(async move {
                if let Err(e) = socket.send_to(&frame, upstream).await {
                    log::warn!(rule = %rule, upstream = %upstream, error = %e, "Forward datagram failed");
                }
            });
        }
    }
}
