//! Rule runtime: bind, accept loop and teardown
//!
//! A runtime owns one rule's socket, registry, stats loop and in-flight
//! session tasks. Bind failures are returned to the caller before the rule
//! runs. Whatever ends the accept loop, the same teardown runs exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::control::{ControlBus, Subscription};
use super::forwarder::Forwarder;
use super::pump::{run_session, PumpContext};
use super::registry::{unix_now, SessionRegistry};
use super::rule::{ForwardingRule, Protocol, RuleId, RuleKey};
use super::stats::StatsLoop;
use super::udp::{resolve_upstream, UdpRelay};
use crate::error::{ForwardError, Result};
use crate::logger::log;

enum Endpoint {
    Tcp(TcpListener),
    Udp {
        socket: Arc<UdpSocket>,
        upstream: SocketAddr,
    },
}

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
fn bind_tcp(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let to_bind_error = |source: io::Error| ForwardError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(SockProtocol::TCP),
    )
    .map_err(to_bind_error)?;
    socket.set_reuse_address(true).map_err(to_bind_error)?;
    socket.set_nonblocking(true).map_err(to_bind_error)?;
    socket.bind(&addr.into()).map_err(to_bind_error)?;
    socket.listen(backlog).map_err(to_bind_error)?;

    TcpListener::from_std(socket.into()).map_err(to_bind_error)
}

async fn bind_udp(addr: SocketAddr, upstream: &str) -> Result<Endpoint> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| ForwardError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let upstream = resolve_upstream(upstream, &addr).await?;
    Ok(Endpoint::Udp {
        socket: Arc::new(socket),
        upstream,
    })
}

/// Accept errors that only concern the connection being accepted
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Releases the rule's resources exactly once
struct Teardown {
    done: AtomicBool,
    token: CancellationToken,
    registry: Arc<SessionRegistry>,
    bus: ControlBus,
    subscription: Subscription,
}

impl Teardown {
    /// Cancel the rule scope and force-close every session
    fn close(&self) -> usize {
        self.token.cancel();
        self.registry.close_all()
    }

    /// Give the rule key back; returns false if already finished
    fn finish(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close();
        self.bus.release(&self.subscription);
        true
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A bound rule, ready to run
pub struct RuleRuntime {
    forwarder: Arc<Forwarder>,
    rule: ForwardingRule,
    key: RuleKey,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    teardown: Teardown,
}

impl RuleRuntime {
    /// Claim the rule key and bind the rule's socket
    ///
    /// Fails with `ReservedPort` for the administration port, `RuleActive`
    /// if another runtime owns the key, `Bind` or `Resolve` otherwise. On
    /// failure the key is released again.
    pub async fn bind(forwarder: Arc<Forwarder>, rule: ForwardingRule) -> Result<Self> {
        let key = rule.key();
        if rule.protocol == Protocol::Tcp && forwarder.config.admin_port == Some(rule.local_port) {
            return Err(ForwardError::ReservedPort(rule.local_port));
        }

        let subscription = forwarder
            .bus
            .subscribe(key.clone())
            .ok_or_else(|| ForwardError::RuleActive(key.to_string()))?;
        let registry = Arc::new(SessionRegistry::for_rule(&rule));
        // Releases the key if anything below fails
        let teardown = Teardown {
            done: AtomicBool::new(false),
            token: subscription.token().clone(),
            registry: Arc::clone(&registry),
            bus: forwarder.bus.clone(),
            subscription,
        };

        let addr = SocketAddr::new(forwarder.config.listen_ip, rule.local_port);
        let endpoint = match rule.protocol {
            Protocol::Tcp => Endpoint::Tcp(bind_tcp(addr, forwarder.config.tcp_backlog)?),
            Protocol::Udp => bind_udp(addr, &rule.upstream()).await?,
        };
        let local_addr = match &endpoint {
            Endpoint::Tcp(listener) => listener.local_addr()?,
            Endpoint::Udp { socket, .. } => socket.local_addr()?,
        };

        Ok(Self {
            forwarder,
            rule,
            key,
            endpoint,
            local_addr,
            registry,
            teardown,
        })
    }

    /// Bind, then run on a new task
    pub async fn start(forwarder: Arc<Forwarder>, rule: ForwardingRule) -> Result<RuleHandle> {
        let runtime = Self::bind(forwarder, rule).await?;
        let handle = RuleHandle {
            rule_id: runtime.rule.id,
            key: runtime.key.clone(),
            local_addr: runtime.local_addr,
            registry: Arc::clone(&runtime.registry),
            join: tokio::spawn(runtime.run()),
        };
        Ok(handle)
    }

    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve until stopped, then tear down
    ///
    /// When this returns the socket is closed, every session task has
    /// finished and the registry is empty.
    pub async fn run(self) {
        let RuleRuntime {
            forwarder,
            rule,
            key,
            endpoint,
            local_addr,
            registry,
            teardown,
        } = self;
        let label = key.to_string();
        let token = teardown.token.clone();
        let tracker = TaskTracker::new();

        log::info!(
            rule = %label,
            id = rule.id,
            local = %local_addr,
            upstream = %rule.upstream(),
            out_time_secs = rule.out_time_secs,
            "Rule started"
        );

        let stats = StatsLoop {
            rule_id: rule.id,
            rule: label.clone(),
            registry: Arc::clone(&registry),
            store: Arc::clone(&forwarder.store),
            interval: forwarder.config.stats_interval,
        };

        let serve = async {
            match &endpoint {
                Endpoint::Tcp(listener) => {
                    let ctx = Arc::new(PumpContext {
                        rule: label.clone(),
                        upstream: rule.upstream(),
                        registry: Arc::clone(&registry),
                        pool: Arc::clone(&forwarder.pool),
                        tcp_nodelay: forwarder.config.tcp_nodelay,
                    });
                    accept_loop(listener, ctx, &token, &tracker).await
                }
                Endpoint::Udp { socket, upstream } => {
                    let relay = UdpRelay {
                        socket: Arc::clone(socket),
                        upstream: *upstream,
                        rule: label.clone(),
                        registry: Arc::clone(&registry),
                        tracker: tracker.clone(),
                    };
                    relay.run(token.clone()).await
                }
            }
        };

        let result = tokio::select! {
            result = serve => result,
            _ = stats.run(token.clone()) => Ok(()),
        };
        if let Err(e) = result {
            log::error!(rule = %label, error = %e, "Rule socket failed, stopping rule");
        }

        drop(endpoint);
        let closed = teardown.close();
        tracker.close();
        tracker.wait().await;
        // Persist whatever the last interval counted
        stats.tick_once(unix_now());
        teardown.finish();

        log::info!(rule = %label, closed_sessions = closed, "Rule stopped");
    }
}

async fn accept_loop(
    listener: &TcpListener,
    ctx: Arc<PumpContext>,
    token: &CancellationToken,
    tracker: &TaskTracker,
) -> io::Result<()> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracker.spawn(run_session(
                    stream,
                    peer,
                    Arc::clone(&ctx),
                    token.clone(),
                ));
            }
            Err(e) if is_transient_accept_error(&e) => {
                log::debug!(rule = %ctx.rule, error = %e, "Accept failed, continuing");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Handle to a running rule
pub struct RuleHandle {
    rule_id: RuleId,
    key: RuleKey,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    join: JoinHandle<()>,
}

impl RuleHandle {
    /// Id of the rule this runtime serves
    pub fn rule_id(&self) -> RuleId {
        self.rule_id
    }

    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    /// Address the rule is bound on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the runtime to finish tearing down
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            log::error!(rule = %self.key, error = %e, "Rule task failed");
        }
    }
}
