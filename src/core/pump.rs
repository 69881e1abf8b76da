//! TCP session pump
//!
//! One session per accepted client: dial the upstream, then run two copy
//! loops (client->upstream, upstream->client) that account every read in the
//! rule's registry. Both directions share one close handle, a child of the
//! rule's cancellation token.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::buffer_pool::BufferPool;
use super::registry::{unix_now, SessionLink, SessionRegistry};
use crate::logger::log;

/// TCP keepalive interval for client connections
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Per-rule state shared by every session of the rule
pub struct PumpContext {
    /// Rule key, for logs
    pub rule: String,
    /// Upstream `host:port`
    pub upstream: String,
    pub registry: Arc<SessionRegistry>,
    pub pool: Arc<BufferPool>,
    pub tcp_nodelay: bool,
}

/// How one direction of a session ended
#[derive(Debug)]
pub enum CopyOutcome {
    /// Source reached end of stream; the half-close was forwarded
    Eof,
    /// Session force-closed, or the rule is tearing down
    Closed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// Copy `src` into `dst` until end of stream, failure or close
///
/// Every non-empty read upserts `link.forward` and adds to the rule's byte
/// counter before the chunk is written. Read or write failure force-closes
/// the session and deletes both directional records.
pub async fn copy_bytes<R, W>(
    mut src: R,
    mut dst: W,
    link: &SessionLink,
    handle: &CancellationToken,
    registry: &SessionRegistry,
    pool: &Arc<BufferPool>,
) -> CopyOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();

    loop {
        let read = tokio::select! {
            biased;
            _ = handle.cancelled() => return CopyOutcome::Closed,
            read = src.read(&mut buf[..]) => read,
        };

        let n = match read {
            Ok(0) => {
                // Half-close only; the opposite direction keeps draining
                let _ = dst.shutdown().await;
                return CopyOutcome::Eof;
            }
            Ok(n) => n,
            Err(e) => {
                registry.close_session(link, handle);
                return CopyOutcome::ReadFailed(e);
            }
        };

        if !registry.record_read(&link.forward, handle, n as u64, unix_now()) {
            return CopyOutcome::Closed;
        }

        let written = tokio::select! {
            biased;
            _ = handle.cancelled() => return CopyOutcome::Closed,
            written = dst.write_all(&buf[..n]) => written,
        };

        if let Err(e) = written {
            registry.close_session(link, handle);
            return CopyOutcome::WriteFailed(e);
        }
    }
}

fn tune_client(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

fn log_outcome(rule: &str, link: &SessionLink, outcome: &CopyOutcome) {
    match outcome {
        CopyOutcome::ReadFailed(e) => log::session_error(rule, &link.forward, "read", e),
        CopyOutcome::WriteFailed(e) => log::session_error(rule, &link.forward, "write", e),
        CopyOutcome::Eof => log::session(rule, &link.forward, "eof"),
        CopyOutcome::Closed => log::session(rule, &link.forward, "closed"),
    }
}

/// Relay one accepted client connection until both directions finish
pub async fn run_session(
    client: TcpStream,
    client_addr: SocketAddr,
    ctx: Arc<PumpContext>,
    rule_token: CancellationToken,
) {
    tune_client(&client, ctx.tcp_nodelay);

    let dialed = tokio::select! {
        biased;
        _ = rule_token.cancelled() => return,
        dialed = TcpStream::connect(&ctx.upstream) => dialed,
    };
    let upstream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!(
                rule = %ctx.rule,
                peer = %client_addr,
                upstream = %ctx.upstream,
                error = %e,
                "Dial upstream failed, dropping client"
            );
            return;
        }
    };
    let upstream_addr = match upstream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::warn!(rule = %ctx.rule, peer = %client_addr, error = %e, "Upstream vanished after dial");
            return;
        }
    };
    if ctx.tcp_nodelay {
        let _ = upstream.set_nodelay(true);
    }

    let handle = rule_token.child_token();
    let up_link = SessionLink::new(client_addr, upstream_addr);
    let down_link = up_link.reversed();
    log::session(&ctx.rule, &up_link.forward, "open");

    // Both ends are closed and both records gone however the session ends
    let _cleanup = scopeguard::guard((), |_| {
        handle.cancel();
        ctx.registry.remove_session(&up_link);
    });

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let (up, down) = tokio::join!(
        copy_bytes(
            client_read,
            upstream_write,
            &up_link,
            &handle,
            &ctx.registry,
            &ctx.pool
        ),
        copy_bytes(
            upstream_read,
            client_write,
            &down_link,
            &handle,
            &ctx.registry,
            &ctx.pool
        ),
    );

    log_outcome(&ctx.rule, &up_link, &up);
    log_outcome(&ctx.rule, &down_link, &down);
}
