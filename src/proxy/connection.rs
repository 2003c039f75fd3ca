//! Per-connection state
//!
//! One [`Connection`] covers a client's full lifecycle from accept to
//! teardown. Connections live in the reactor's registry and nowhere else;
//! stage tasks (handshake, lookup, local connect, relay) refer to them only
//! by [`ConnId`] through the events they send back.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_openssl::SslStream;

use super::relay::{RelayOutcome, ShutdownMode};

/// Stable identifier of a connection in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle states
///
/// The terminal "destroyed" state is implicit: a destroyed connection is
/// simply absent from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// TLS handshake in progress, 60s timeout armed
    SslConnecting,
    /// Reverse lookup of the client address in flight
    HostnameLookup,
    /// Connecting to the rendezvous socket and sending the identity line
    LocalConnecting,
    /// Relaying bytes in both directions
    Established,
    /// Reads disabled, flushing whatever remains before teardown
    ShuttingDown,
}

/// Why a TLS handshake did not complete
#[derive(Debug)]
pub enum HandshakeFailure {
    /// The fixed handshake timeout expired
    TimedOut,
    /// The handshake itself failed
    Failed(String),
}

/// Completion events delivered to the reactor's dispatch loop
///
/// Events carry the streams produced by the stage that just finished, so
/// ownership moves through the state machine instead of being shared.
pub enum Event {
    HandshakeDone {
        id: ConnId,
        result: Result<Box<SslStream<TcpStream>>, HandshakeFailure>,
    },
    Resolved {
        id: ConnId,
        hostname: Option<String>,
    },
    LocalConnected {
        id: ConnId,
        result: io::Result<UnixStream>,
    },
    RelayClosed {
        id: ConnId,
        outcome: RelayOutcome,
    },
}

/// One accepted client connection
pub struct Connection {
    pub(crate) state: ConnState,
    remote_addr: SocketAddr,
    remote_host: Option<String>,
    remote_ip: Option<String>,
    /// TLS stream parked between handshake completion and relay start
    pub(crate) remote_stream: Option<Box<SslStream<TcpStream>>>,
    /// In-flight reverse lookup, cancellable
    pub(crate) pending_lookup: Option<AbortHandle>,
    /// Current stage task (handshake, local connect, or relay)
    pub(crate) pending_stage: Option<AbortHandle>,
    /// Control channel into a running relay
    pub(crate) relay_ctl: Option<watch::Sender<Option<ShutdownMode>>>,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            state: ConnState::SslConnecting,
            remote_addr,
            remote_host: None,
            remote_ip: None,
            remote_stream: None,
            pending_lookup: None,
            pending_stage: None,
            relay_ctl: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Record the resolved identity. Write-once: both fields are set here and
    /// never change again. A failed or timed-out lookup passes `None` and
    /// falls back to the numeric address for the hostname.
    pub fn set_identity(&mut self, hostname: Option<String>) {
        if self.remote_ip.is_some() {
            return;
        }
        let ip = self.remote_addr.ip().to_string();
        self.remote_host = Some(hostname.unwrap_or_else(|| ip.clone()));
        self.remote_ip = Some(ip);
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    /// The identity line sent to the rendezvous peer before any relayed bytes.
    ///
    /// Never empty: both fields fall back to the numeric address.
    pub fn identity_line(&self) -> String {
        let numeric;
        let ip = match self.remote_ip.as_deref() {
            Some(ip) => ip,
            None => {
                numeric = self.remote_addr.ip().to_string();
                &numeric
            }
        };
        let host = self.remote_host.as_deref().unwrap_or(ip);
        format!("{}^{}\r\n", ip, host)
    }
}
