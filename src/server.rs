use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::conn;
use crate::error::ServerError;
use crate::events::{EventBus, Reachability, ReadyInfo, ServerEvent, SubscriberId, Subscription};
use crate::gateway::GatewayMapper;

/// Maximum time a connection may stay silent before the server drops it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Tunables the original kept as constants. `bind_addr = None` auto-detects
/// the machine's local IPv4 address.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub idle_timeout: Duration,
    pub bind_addr: Option<Ipv4Addr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            bind_addr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Starting,
    Listening,
    Stopping,
    Stopped,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Starting => "starting",
            State::Listening => "listening",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        }
    }
}

struct Inner {
    state: State,
    /// Port handed to the mapper, recorded before the mapping attempt so
    /// removal is tried even when creation only partially succeeded.
    mapped_port: Option<u16>,
    local_addr: Option<SocketAddr>,
}

/// The embedded control server: owns the listener, spawns one handler task
/// per connection, fans inbound messages out to subscribers, and keeps the
/// gateway port mapping alive for exactly as long as it is listening.
///
/// Explicitly constructed and explicitly owned; share it with `Arc` where
/// several components need it. Lifecycle is one-shot:
/// `Idle -> Starting -> Listening -> Stopping -> Stopped`, with [`start`]
/// valid only from `Idle` and [`stop`] idempotent.
///
/// [`start`]: ControlServer::start
/// [`stop`]: ControlServer::stop
pub struct ControlServer {
    mapper: Box<dyn GatewayMapper>,
    config: ServerConfig,
    events: EventBus,
    shutdown: watch::Sender<bool>,
    inner: Mutex<Inner>,
}

impl ControlServer {
    pub fn new(mapper: Box<dyn GatewayMapper>) -> Self {
        Self::with_config(mapper, ServerConfig::default())
    }

    pub fn with_config(mapper: Box<dyn GatewayMapper>, config: ServerConfig) -> Self {
        Self {
            mapper,
            config,
            events: EventBus::new(),
            shutdown: watch::channel(false).0,
            inner: Mutex::new(Inner {
                state: State::Idle,
                mapped_port: None,
                local_addr: None,
            }),
        }
    }

    /// Register for [`ServerEvent`]s. Subscribing before [`start`] guarantees
    /// the ready event is seen.
    ///
    /// [`start`]: ControlServer::start
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.events.unsubscribe(id);
    }

    /// The bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().local_addr
    }

    /// Open the gateway mapping, bind, and begin accepting connections.
    /// Returns the actual bound address (the port may differ from `port`
    /// when asked for port 0).
    ///
    /// Does not block on connections: the accept loop runs as its own task.
    /// A gateway failure is not fatal; it is reported in the ready event's
    /// [`Reachability`] and the server listens locally regardless.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ServerError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Idle {
                return Err(ServerError::InvalidState(inner.state.name()));
            }
            inner.state = State::Starting;
            inner.mapped_port = Some(port);
        }

        let bind_ip = match self.config.bind_addr {
            Some(ip) => ip,
            None => resolve_local_ipv4().unwrap_or_else(|e| {
                warn!(error = %e, "could not detect a local IPv4 address, using loopback");
                Ipv4Addr::LOCALHOST
            }),
        };

        let reachability = match self.mapper.open_mapping(bind_ip, port).await {
            Ok(external_ip) => {
                info!(external = %external_ip, port, "gateway mapping established");
                Reachability::External(SocketAddr::new(external_ip, port))
            }
            Err(e) => {
                warn!(error = %e, "gateway mapping failed, listening locally only");
                Reachability::LocalOnly {
                    reason: e.to_string(),
                }
            }
        };

        let listener = match TcpListener::bind((bind_ip, port)).await {
            Ok(l) => l,
            Err(e) => {
                // Half-open is not a state we stay in: unmap whatever the
                // gateway may have registered and land in Stopped.
                if let Err(close_err) = self.mapper.close_mapping(port).await {
                    debug!(error = %close_err, "unmapping after failed bind");
                }
                self.inner.lock().unwrap().state = State::Stopped;
                return Err(ServerError::Bind(e));
            }
        };
        let local = listener.local_addr().map_err(ServerError::Bind)?;

        let events = self.events.clone();
        let shutdown = self.shutdown.subscribe();
        let idle_timeout = self.config.idle_timeout;
        tokio::spawn(accept_loop(listener, events, shutdown, idle_timeout));

        {
            let mut inner = self.inner.lock().unwrap();
            // A racing stop() may have won while we were binding; the accept
            // loop sees the shutdown flag and exits on its own in that case.
            if inner.state == State::Starting {
                inner.state = State::Listening;
                inner.local_addr = Some(local);
            }
        }

        info!(%local, "server listening");
        self.events.emit(ServerEvent::Ready(ReadyInfo {
            local,
            reachability,
        }));

        Ok(local)
    }

    /// Stop accepting, cancel every in-flight handler, remove the gateway
    /// mapping, and clear all subscriptions. Safe to call from any task and
    /// a no-op when already stopped.
    pub async fn stop(&self) {
        let mapped_port = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                State::Stopping | State::Stopped => return,
                _ => {}
            }
            inner.state = State::Stopping;
            inner.local_addr = None;
            inner.mapped_port.take()
        };

        // Errs when no receivers are alive; nothing to cancel then, so the
        // result is deliberately ignored.
        let _ = self.shutdown.send(true);

        // Best effort: the gateway may already be unreachable, and the
        // process is shutting down regardless.
        if let Some(port) = mapped_port {
            if let Err(e) = self.mapper.close_mapping(port).await {
                warn!(error = %e, port, "could not remove gateway mapping");
            }
        }

        self.events.clear();
        self.inner.lock().unwrap().state = State::Stopped;
        info!("server stopped");
    }
}

/// Accept until the shutdown signal fires. Each connection gets its own
/// fire-and-forget handler task; handler failures never reach this loop.
async fn accept_loop(
    listener: TcpListener,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
    idle_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = conn::shutdown_signalled(&mut shutdown) => break,

            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let events = events.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn::handle(socket, peer, events, shutdown, idle_timeout).await {
                                debug!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    // Transient (out of fds, peer reset mid-accept, ...):
                    // keep the server alive.
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    // Dropping the listener here releases the socket.
    debug!("accept loop ended");
}

/// The machine's outward-facing IPv4 address, found with a routing-table
/// probe: connecting a UDP socket sends no packets but pins the source
/// address the OS would use.
fn resolve_local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(io::Error::other("routing probe returned an IPv6 address")),
    }
}
