//! Accept loop and connection accounting.
//!
//! Per-IP and global caps are enforced before any protocol work: the
//! reservation happens under a short counter lock (never across I/O), so
//! racing accepts from one address can never push it past the cap. Rejected
//! sockets get a bare `421` and are closed without ever becoming sessions.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use mailforge_common::{Signal, internal};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinSet,
};

use crate::{
    connection::Connection,
    error::ListenerError,
    session::{Session, SessionConfig},
};

/// Connection caps. Zero disables the respective cap.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_per_ip: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_per_ip: 10,
        }
    }
}

/// Why a reservation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    GlobalCap,
    PerIpCap,
}

/// Live connection counters. The per-IP map is touched only under its shard
/// entry, making reserve/release atomic with respect to each other.
#[derive(Debug, Default)]
pub struct ConnectionGauge {
    global: AtomicUsize,
    per_ip: DashMap<IpAddr, usize>,
}

impl ConnectionGauge {
    #[must_use]
    pub fn active(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_for(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map_or(0, |count| *count)
    }

    fn try_reserve(
        self: &Arc<Self>,
        ip: IpAddr,
        limits: ConnectionLimits,
    ) -> Result<ConnectionPermit, Rejection> {
        // Global cap first: optimistic increment, undone on rejection.
        let global = self.global.fetch_add(1, Ordering::SeqCst);
        if limits.max_connections > 0 && global >= limits.max_connections {
            self.global.fetch_sub(1, Ordering::SeqCst);
            return Err(Rejection::GlobalCap);
        }

        // Per-IP count mutated under the entry guard, so two racing accepts
        // from one address serialise here and cannot both pass the cap.
        {
            let mut entry = self.per_ip.entry(ip).or_insert(0);
            if limits.max_per_ip > 0 && *entry >= limits.max_per_ip {
                drop(entry);
                self.global.fetch_sub(1, Ordering::SeqCst);
                return Err(Rejection::PerIpCap);
            }
            *entry += 1;
        }

        Ok(ConnectionPermit {
            gauge: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        self.global.fetch_sub(1, Ordering::SeqCst);
        self.per_ip.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// RAII reservation of one connection slot. Dropping it releases both
/// counters, whichever way the session ends.
#[derive(Debug)]
pub struct ConnectionPermit {
    gauge: Arc<ConnectionGauge>,
    ip: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.gauge.release(self.ip);
    }
}

/// One TCP listener endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub socket: SocketAddr,
    /// Perform the TLS handshake immediately on accept instead of
    /// advertising STARTTLS.
    pub implicit_tls: bool,
}

impl From<SocketAddr> for Endpoint {
    fn from(socket: SocketAddr) -> Self {
        Self {
            socket,
            implicit_tls: false,
        }
    }
}

/// The accept loop plus connection accounting for one endpoint.
pub struct SmtpListener {
    endpoint: Endpoint,
    limits: ConnectionLimits,
    gauge: Arc<ConnectionGauge>,
    config: Arc<SessionConfig>,
    drain_timeout: Duration,
}

impl SmtpListener {
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        limits: ConnectionLimits,
        gauge: Arc<ConnectionGauge>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            endpoint,
            limits,
            gauge,
            config,
            drain_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    #[must_use]
    pub fn gauge(&self) -> Arc<ConnectionGauge> {
        Arc::clone(&self.gauge)
    }

    /// Bind and serve until shutdown. Two-phase teardown: stop accepting,
    /// drain live sessions up to the timeout, then abort the rest.
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Sender<Signal>,
    ) -> Result<(), ListenerError> {
        let listener =
            TcpListener::bind(self.endpoint.socket)
                .await
                .map_err(|source| ListenerError::Bind {
                    addr: self.endpoint.socket,
                    source,
                })?;

        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener (lets tests bind port 0 first).
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        shutdown: tokio::sync::broadcast::Sender<Signal>,
    ) -> Result<(), ListenerError> {
        let local = listener.local_addr()?;
        internal!(level = INFO, "serving SMTP on {local}");

        let acceptor = if self.endpoint.implicit_tls {
            let tls = self.config.tls.as_ref().ok_or_else(|| {
                ListenerError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "implicit TLS endpoint without TLS configuration",
                ))
            })?;
            Some(Connection::<TcpStream>::acceptor(tls)?)
        } else {
            None
        };

        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut signal = shutdown.subscribe();

        loop {
            tokio::select! {
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(level = INFO, "listener {local} draining sessions");
                        break;
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.dispatch(stream, peer, acceptor.clone(), &mut sessions, &shutdown);
                }
            }
        }

        // Phase two: let live sessions finish, then force the stragglers.
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            internal!(level = WARN, "drain timeout reached, aborting remaining sessions");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        Ok(())
    }

    fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
        sessions: &mut JoinSet<()>,
        shutdown: &tokio::sync::broadcast::Sender<Signal>,
    ) {
        tracing::debug!("connection received from {peer}");

        let permit = match self.gauge.try_reserve(peer.ip(), self.limits) {
            Ok(permit) => permit,
            Err(rejection) => {
                let text: &[u8] = match rejection {
                    Rejection::PerIpCap => {
                        b"421 too many connections from your address\r\n"
                    }
                    Rejection::GlobalCap => b"421 too many connections\r\n",
                };
                sessions.spawn(async move {
                    let mut stream = stream;
                    let _ = stream.write_all(text).await;
                    let _ = stream.shutdown().await;
                });
                return;
            }
        };

        let config = Arc::clone(&self.config);
        let signal = shutdown.subscribe();

        sessions.spawn(async move {
            let _permit = permit;

            let session = if let Some(acceptor) = acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => Session::create_tls(tls_stream, peer, config),
                    Err(err) => {
                        internal!(level = ERROR, "implicit TLS handshake failed: {err}");
                        return;
                    }
                }
            } else {
                Session::create(stream, peer, config)
            };

            if let Err(err) = session.run(signal).await {
                internal!(level = ERROR, "session error: {err}");
            }
        });
    }
}
