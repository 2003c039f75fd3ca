//! Reactor event loop
//!
//! Single-threaded, readiness-driven dispatcher that owns the TLS listener,
//! the connection registry, and every timer. All registry mutation happens
//! here, one event at a time, run to completion; stage tasks only perform
//! I/O and report back over the event channel. No locks anywhere.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use openssl::ssl::{Ssl, SslAcceptor};
use openssl::x509::X509VerifyResult;
use socket2::TcpKeepalive;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{Result, WorkerError};
use crate::config::WorkerConfig;

use super::connection::{ConnId, ConnState, Connection, Event, HandshakeFailure};
use super::creds;
use super::relay::{self, RelayOutcome, ShutdownMode};
use super::resolver;

/// Fixed time budget for completing a TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long shutdown waits for relays to flush before forcing teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Injects shutdown requests into the reactor loop
///
/// Signal handlers and the parent monitor hold one of these; the request is
/// handled inside the loop like any other event, never out-of-band.
#[derive(Clone)]
pub struct ShutdownHandle(mpsc::UnboundedSender<ShutdownMode>);

impl ShutdownHandle {
    pub fn request(&self, mode: ShutdownMode) {
        let _ = self.0.send(mode);
    }
}

/// The event loop: TLS listener, connection registry, and dispatcher
pub struct Reactor {
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    socket_path: PathBuf,
    keepalive: Duration,
    registry: HashMap<ConnId, Connection>,
    next_id: u64,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    control_tx: mpsc::UnboundedSender<ShutdownMode>,
    control_rx: mpsc::UnboundedReceiver<ShutdownMode>,
}

impl Reactor {
    /// Bind the TLS listener and set up the dispatch channels.
    pub async fn bind(config: &WorkerConfig, acceptor: SslAcceptor) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .map_err(WorkerError::Io)?;
        if let Ok(addr) = listener.local_addr() {
            info!("listening for TLS connections on {}", addr);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener,
            acceptor: Arc::new(acceptor),
            socket_path: config.socket_path.clone(),
            keepalive: config.keepalive(),
            registry: HashMap::new(),
            next_id: 0,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
        })
    }

    /// Address the listener actually bound to (port 0 resolves here)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.control_tx.clone())
    }

    /// Run the event loop until a shutdown request arrives, then drain.
    ///
    /// Every iteration delivers exactly one completion (accept, stage event,
    /// or control request) and handles it fully before the next.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                Some(mode) = self.control_rx.recv() => {
                    match mode {
                        ShutdownMode::Flush => {
                            info!("shutdown requested; flushing {} connections", self.registry.len());
                        }
                        ShutdownMode::Discard => {
                            info!("immediate shutdown; dropping {} connections", self.registry.len());
                        }
                    }
                    self.begin_shutdown(mode);
                    break;
                }

                Some(event) = self.events_rx.recv() => {
                    self.dispatch(event);
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.on_accept(stream, peer),
                        Err(e) => error!("accept failed: {}", e),
                    }
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Number of live connections in the registry
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    fn next_conn_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    /// Accept: create the connection and start the TLS handshake with the
    /// fixed timeout armed.
    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_conn_id();
        info!("[{}] new connection on TLS port from {}", id, peer);

        let sock = socket2::SockRef::from(&stream);
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            warn!("[{}] failed to set keepalive on {}: {}", id, peer, e);
        }

        let ssl = match Ssl::new(self.acceptor.context()) {
            Ok(ssl) => ssl,
            Err(e) => {
                error!("[{}] unable to create TLS session: {}", id, e);
                return;
            }
        };
        let ssl_stream = match SslStream::new(ssl, stream) {
            Ok(ssl_stream) => ssl_stream,
            Err(e) => {
                error!("[{}] unable to wrap stream for TLS: {}", id, e);
                return;
            }
        };

        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let mut stream = Box::new(ssl_stream);
            let result = match timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut *stream).accept()).await {
                Ok(Ok(())) => Ok(stream),
                Ok(Err(e)) => Err(HandshakeFailure::Failed(e.to_string())),
                Err(_) => Err(HandshakeFailure::TimedOut),
            };
            let _ = events.send(Event::HandshakeDone { id, result });
        });

        let mut conn = Connection::new(peer);
        conn.pending_stage = Some(task.abort_handle());
        self.registry.insert(id, conn);
    }

    /// Deliver one completion to the owning connection's state machine.
    /// Events for unknown connections or mismatched states are spurious and
    /// ignored.
    fn dispatch(&mut self, event: Event) {
        match event {
            Event::HandshakeDone { id, result } => self.on_handshake_done(id, result),
            Event::Resolved { id, hostname } => self.on_resolved(id, hostname),
            Event::LocalConnected { id, result } => self.on_local_connected(id, result),
            Event::RelayClosed { id, outcome } => self.on_relay_closed(id, outcome),
        }
    }

    fn on_handshake_done(
        &mut self,
        id: ConnId,
        result: std::result::Result<Box<SslStream<TcpStream>>, HandshakeFailure>,
    ) {
        let state = match self.registry.get(&id) {
            Some(conn) => conn.state(),
            None => return,
        };
        if state != ConnState::SslConnecting {
            return;
        }

        match result {
            Ok(stream) => {
                {
                    let ssl = stream.ssl();
                    info!(
                        "[{}] TLS handshake complete using {} and cipher {}",
                        id,
                        ssl.version_str(),
                        ssl.current_cipher().map_or("unknown", |c| c.name()),
                    );
                    if let Some(peer_cert) = ssl.peer_certificate() {
                        if ssl.verify_result() == X509VerifyResult::OK {
                            info!(
                                "[{}] client certificate accepted: {:?}",
                                id,
                                peer_cert.subject_name()
                            );
                        }
                    }
                }

                let events = self.events_tx.clone();
                if let Some(conn) = self.registry.get_mut(&id) {
                    conn.pending_stage = None;
                    conn.state = ConnState::HostnameLookup;
                    let addr = conn.remote_addr().ip();
                    conn.remote_stream = Some(stream);
                    conn.pending_lookup = Some(resolver::spawn_reverse_lookup(id, addr, events));
                }
            }
            Err(HandshakeFailure::TimedOut) => {
                warn!("[{}] TLS handshake timed out", id);
                self.destroy(id);
            }
            Err(HandshakeFailure::Failed(e)) => {
                warn!("[{}] TLS handshake failed: {}", id, e);
                self.destroy(id);
            }
        }
    }

    fn on_resolved(&mut self, id: ConnId, hostname: Option<String>) {
        let Some(conn) = self.registry.get_mut(&id) else {
            // Late completion for a connection already torn down.
            return;
        };
        conn.pending_lookup = None;
        if conn.state() != ConnState::HostnameLookup {
            return;
        }

        conn.set_identity(hostname);
        let line = conn.identity_line();
        info!(
            "[{}] resolved hostname as '{}({})'; opening local connection",
            id,
            conn.remote_host().unwrap_or_default(),
            conn.remote_ip().unwrap_or_default(),
        );

        conn.state = ConnState::LocalConnecting;
        let path = self.socket_path.clone();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = async {
                let mut local = UnixStream::connect(&path).await?;
                // The identity line, credential-stamped, before any relayed
                // bytes.
                creds::send_with_creds(&mut local, line.as_bytes()).await?;
                Ok::<UnixStream, io::Error>(local)
            }
            .await;
            let _ = events.send(Event::LocalConnected { id, result });
        });
        conn.pending_stage = Some(task.abort_handle());
    }

    fn on_local_connected(&mut self, id: ConnId, result: io::Result<UnixStream>) {
        match result {
            Ok(local) => {
                let Some(conn) = self.registry.get_mut(&id) else {
                    // Connection torn down while connecting; the freshly
                    // opened socket just closes on drop.
                    return;
                };
                if conn.state() != ConnState::LocalConnecting {
                    return;
                }
                let Some(remote) = conn.remote_stream.take() else {
                    self.destroy(id);
                    return;
                };

                debug!("[{}] local connection established; relaying", id);
                conn.state = ConnState::Established;

                let (ctl_tx, ctl_rx) = watch::channel(None);
                conn.relay_ctl = Some(ctl_tx);
                let events = self.events_tx.clone();
                let task = tokio::spawn(async move {
                    let outcome = relay::run(*remote, local, ctl_rx).await;
                    let _ = events.send(Event::RelayClosed { id, outcome });
                });
                conn.pending_stage = Some(task.abort_handle());
            }
            Err(e) => {
                let valid = self
                    .registry
                    .get(&id)
                    .is_some_and(|c| c.state() == ConnState::LocalConnecting);
                if valid {
                    warn!("[{}] local connection to rendezvous socket failed: {}", id, e);
                    self.destroy(id);
                }
            }
        }
    }

    fn on_relay_closed(&mut self, id: ConnId, outcome: RelayOutcome) {
        if !self.registry.contains_key(&id) {
            return;
        }
        match outcome {
            RelayOutcome::RemoteClosed => info!("[{}] lost TLS connection", id),
            RelayOutcome::LocalClosed => info!("[{}] lost local connection", id),
            RelayOutcome::ShutDown => debug!("[{}] relay shut down", id),
        }
        self.destroy(id);
    }

    /// Destroy a connection: cancel its pending lookup, abort its stage task,
    /// release its channels, and remove it from the registry. Terminal and
    /// idempotent; a second call for the same id finds nothing to do.
    fn destroy(&mut self, id: ConnId) -> bool {
        let Some(mut conn) = self.registry.remove(&id) else {
            return false;
        };
        if let Some(lookup) = conn.pending_lookup.take() {
            lookup.abort();
        }
        if let Some(stage) = conn.pending_stage.take() {
            stage.abort();
        }
        // Dropping the control sender tells a still-running relay to stop.
        conn.relay_ctl = None;
        if let Some(mut remote) = conn.remote_stream.take() {
            // A handshake-complete session that never reached the relay still
            // deserves a close_notify; do it off the dispatch path.
            tokio::spawn(async move {
                let _ = remote.shutdown().await;
            });
        }
        debug!("[{}] connection destroyed", id);
        true
    }

    /// Mark every connection SHUTTINGDOWN. Established relays get the
    /// flush/discard command and report back with `RelayClosed`; connections
    /// that never reached ESTABLISHED have nothing buffered and are torn
    /// down directly.
    fn begin_shutdown(&mut self, mode: ShutdownMode) {
        let ids: Vec<ConnId> = self.registry.keys().copied().collect();
        for id in ids {
            let commanded = match self.registry.get_mut(&id) {
                Some(conn) if conn.state() == ConnState::Established => {
                    conn.state = ConnState::ShuttingDown;
                    if let Some(ctl) = &conn.relay_ctl {
                        let _ = ctl.send(Some(mode));
                    }
                    true
                }
                Some(_) => false,
                None => continue,
            };
            if !commanded {
                self.destroy(id);
            }
        }
    }

    /// Process remaining relay completions for a bounded grace period, then
    /// force-destroy whatever is left.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.dispatch(event),
                Ok(None) | Err(_) => break,
            }
        }

        let leftover: Vec<ConnId> = self.registry.keys().copied().collect();
        if !leftover.is_empty() {
            warn!("{} connections still open at shutdown; closing", leftover.len());
        }
        for id in leftover {
            self.destroy(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ssl::SslMethod;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            version: crate::config::CONFIG_VERSION,
            private_key_file: "server.key".into(),
            certificate_file: "server.crt".into(),
            ca_file: None,
            ca_dir: None,
            require_client_cert: false,
            ssl_port: 0,
            ssl_addr: "127.0.0.1".parse().unwrap(),
            socket_path: "/nonexistent/rendezvous.sock".into(),
            keepalive_secs: 300,
        }
    }

    fn bare_acceptor() -> SslAcceptor {
        // No certificates: handshakes would fail, but these tests never
        // perform one.
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
            .unwrap()
            .build()
    }

    async fn test_reactor() -> Reactor {
        Reactor::bind(&test_config(), bare_acceptor()).await.unwrap()
    }

    fn insert_conn(reactor: &mut Reactor, state: ConnState) -> ConnId {
        let id = reactor.next_conn_id();
        let mut conn = Connection::new("203.0.113.5:49152".parse().unwrap());
        conn.state = state;
        reactor.registry.insert(id, conn);
        id
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut reactor = test_reactor().await;
        let id = insert_conn(&mut reactor, ConnState::SslConnecting);

        assert!(reactor.destroy(id));
        assert!(!reactor.destroy(id), "second destroy must be a no-op");
        assert_eq!(reactor.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_events_for_unknown_connection_are_ignored() {
        let mut reactor = test_reactor().await;

        reactor.dispatch(Event::Resolved {
            id: ConnId(99),
            hostname: Some("ghost.example.net".to_string()),
        });
        reactor.dispatch(Event::HandshakeDone {
            id: ConnId(99),
            result: Err(HandshakeFailure::TimedOut),
        });
        reactor.dispatch(Event::RelayClosed {
            id: ConnId(99),
            outcome: RelayOutcome::RemoteClosed,
        });
        assert_eq!(reactor.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_late_resolution_after_progress_is_ignored() {
        let mut reactor = test_reactor().await;
        let id = insert_conn(&mut reactor, ConnState::Established);

        reactor.dispatch(Event::Resolved {
            id,
            hostname: Some("late.example.net".to_string()),
        });

        let conn = reactor.registry.get(&id).unwrap();
        assert_eq!(conn.state(), ConnState::Established);
        assert!(conn.remote_host().is_none(), "late lookup must not set identity");
    }

    #[tokio::test]
    async fn test_spurious_handshake_timeout_is_ignored() {
        let mut reactor = test_reactor().await;
        let id = insert_conn(&mut reactor, ConnState::Established);

        reactor.dispatch(Event::HandshakeDone {
            id,
            result: Err(HandshakeFailure::TimedOut),
        });
        assert_eq!(reactor.connection_count(), 1, "connection must survive");
    }

    #[tokio::test]
    async fn test_handshake_timeout_destroys_connection() {
        let mut reactor = test_reactor().await;
        let id = insert_conn(&mut reactor, ConnState::SslConnecting);

        reactor.dispatch(Event::HandshakeDone {
            id,
            result: Err(HandshakeFailure::TimedOut),
        });
        assert_eq!(reactor.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_resolution_failure_falls_back_to_numeric() {
        let mut reactor = test_reactor().await;
        let id = insert_conn(&mut reactor, ConnState::HostnameLookup);

        reactor.dispatch(Event::Resolved { id, hostname: None });

        let conn = reactor.registry.get(&id).unwrap();
        assert_eq!(conn.state(), ConnState::LocalConnecting);
        assert_eq!(conn.identity_line(), "203.0.113.5^203.0.113.5\r\n");
    }

    #[tokio::test]
    async fn test_local_connect_failure_destroys_connection() {
        let mut reactor = test_reactor().await;
        let id = insert_conn(&mut reactor, ConnState::HostnameLookup);

        // Drives the connection into LOCAL_CONNECTING; the configured
        // rendezvous path does not exist, so the spawned connect fails.
        reactor.dispatch(Event::Resolved { id, hostname: None });

        let event = reactor.events_rx.recv().await.expect("connect result");
        match &event {
            Event::LocalConnected { result, .. } => assert!(result.is_err()),
            _ => panic!("expected LocalConnected"),
        }
        reactor.dispatch(event);
        assert_eq!(reactor.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_pre_established_connections() {
        let mut reactor = test_reactor().await;
        insert_conn(&mut reactor, ConnState::SslConnecting);
        insert_conn(&mut reactor, ConnState::HostnameLookup);
        insert_conn(&mut reactor, ConnState::LocalConnecting);

        reactor.begin_shutdown(ShutdownMode::Flush);
        assert_eq!(reactor.connection_count(), 0);
    }
}
