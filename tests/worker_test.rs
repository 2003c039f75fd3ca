//! End-to-end tests
//!
//! These run a real reactor on a loopback TLS listener with generated
//! self-signed certificates and a tempdir rendezvous socket, then drive it
//! with a TLS client exactly as the parent server's users would.

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509, X509NameBuilder};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixListener};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use tls_worker::common::Result;
use tls_worker::config::{WorkerConfig, CONFIG_VERSION};
use tls_worker::proxy::{ParentMonitor, Reactor, ShutdownHandle, ShutdownMode};
use tls_worker::create_tls_acceptor;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Generate a self-signed certificate and key, written as PEM files.
fn write_self_signed_cert(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = openssl::bn::BigNum::from_u32(1)
        .unwrap()
        .to_asn1_integer()
        .unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let key_path = dir.join("server.key");
    let cert_path = dir.join("server.crt");
    std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    (key_path, cert_path)
}

struct TestWorker {
    addr: std::net::SocketAddr,
    shutdown: ShutdownHandle,
    run_task: JoinHandle<Result<()>>,
    _dir: TempDir,
}

/// Bind a reactor for the given rendezvous socket name and start it.
async fn start_worker(socket_name: &str) -> TestWorker {
    let dir = TempDir::new().unwrap();
    let (key_path, cert_path) = write_self_signed_cert(dir.path());

    let config = WorkerConfig {
        version: CONFIG_VERSION,
        private_key_file: key_path,
        certificate_file: cert_path,
        ca_file: None,
        ca_dir: None,
        require_client_cert: false,
        ssl_port: 0,
        ssl_addr: "127.0.0.1".parse().unwrap(),
        socket_path: dir.path().join(socket_name),
        keepalive_secs: 300,
    };

    let acceptor = create_tls_acceptor(&config).unwrap();
    let reactor = Reactor::bind(&config, acceptor).await.unwrap();
    let addr = reactor.local_addr().unwrap();
    let shutdown = reactor.shutdown_handle();
    let run_task = tokio::spawn(reactor.run());

    TestWorker {
        addr,
        shutdown,
        run_task,
        _dir: dir,
    }
}

/// Connect a TLS client to the worker and complete the handshake.
async fn tls_client(addr: std::net::SocketAddr) -> SslStream<TcpStream> {
    let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
    connector.set_verify(SslVerifyMode::NONE);
    let connector = connector.build();

    let ssl = connector
        .configure()
        .unwrap()
        .into_ssl("localhost")
        .unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = SslStream::new(ssl, tcp).unwrap();
    timeout(TEST_TIMEOUT, Pin::new(&mut stream).connect())
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    stream
}

#[tokio::test]
async fn test_identity_line_then_bidirectional_relay() {
    let worker = start_worker("rendezvous.sock").await;
    let rendezvous = UnixListener::bind(worker._dir.path().join("rendezvous.sock")).unwrap();

    let mut client = tls_client(worker.addr).await;

    let (local, _) = timeout(TEST_TIMEOUT, rendezvous.accept())
        .await
        .expect("no local connection")
        .unwrap();
    let (local_rd, mut local_wr) = local.into_split();
    let mut local_rd = BufReader::new(local_rd);

    // The very first line must be the credential-stamped identity.
    let mut line = String::new();
    timeout(TEST_TIMEOUT, local_rd.read_line(&mut line))
        .await
        .expect("no identity line")
        .unwrap();
    assert!(
        line.starts_with("127.0.0.1^"),
        "identity line should lead with the numeric address, got {:?}",
        line
    );
    assert!(line.ends_with("\r\n"));

    // Client to rendezvous peer, order preserved.
    client.write_all(b"PING\nPONG\n").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(TEST_TIMEOUT, local_rd.read_exact(&mut buf))
        .await
        .expect("relayed bytes missing")
        .unwrap();
    assert_eq!(&buf, b"PING\nPONG\n");

    // Rendezvous peer back to client.
    local_wr.write_all(b"WELCOME\r\n").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .expect("return bytes missing")
        .unwrap();
    assert_eq!(&buf, b"WELCOME\r\n");

    worker.shutdown.request(ShutdownMode::Flush);
    timeout(TEST_TIMEOUT, worker.run_task)
        .await
        .expect("reactor did not exit")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_local_connect_failure_closes_client() {
    // No listener is ever bound at the rendezvous path.
    let worker = start_worker("missing.sock").await;

    let mut client = tls_client(worker.addr).await;

    // The worker destroys the connection after the local connect fails; the
    // client observes EOF or a reset, never an ESTABLISHED session.
    let mut buf = [0u8; 8];
    let read = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .expect("client connection should be closed");
    match read {
        Ok(n) => assert_eq!(n, 0, "no bytes should ever be relayed"),
        Err(_) => {}
    }

    worker.shutdown.request(ShutdownMode::Discard);
    timeout(TEST_TIMEOUT, worker.run_task)
        .await
        .expect("reactor did not exit")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_flush_shutdown_delivers_buffered_bytes() {
    let worker = start_worker("rendezvous.sock").await;
    let rendezvous = UnixListener::bind(worker._dir.path().join("rendezvous.sock")).unwrap();

    let mut client = tls_client(worker.addr).await;
    let (local, _) = timeout(TEST_TIMEOUT, rendezvous.accept())
        .await
        .expect("no local connection")
        .unwrap();
    let (local_rd, _local_wr) = local.into_split();
    let mut local_rd = BufReader::new(local_rd);

    let mut line = String::new();
    timeout(TEST_TIMEOUT, local_rd.read_line(&mut line))
        .await
        .expect("no identity line")
        .unwrap();

    client.write_all(b"GOODBYE\n").await.unwrap();
    // Give the relay a beat to move the bytes into the local channel.
    tokio::time::sleep(Duration::from_millis(200)).await;

    worker.shutdown.request(ShutdownMode::Flush);

    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, local_rd.read_to_end(&mut received))
        .await
        .expect("local side never closed")
        .unwrap();
    assert_eq!(received, b"GOODBYE\n", "queued bytes must arrive before close");

    timeout(TEST_TIMEOUT, worker.run_task)
        .await
        .expect("reactor did not exit")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_discard_shutdown_exits_promptly() {
    let worker = start_worker("rendezvous.sock").await;
    let rendezvous = UnixListener::bind(worker._dir.path().join("rendezvous.sock")).unwrap();

    let mut client = tls_client(worker.addr).await;
    let (local, _) = timeout(TEST_TIMEOUT, rendezvous.accept())
        .await
        .expect("no local connection")
        .unwrap();

    worker.shutdown.request(ShutdownMode::Discard);
    timeout(TEST_TIMEOUT, worker.run_task)
        .await
        .expect("reactor did not exit")
        .unwrap()
        .unwrap();

    // Both sides observe the teardown.
    let mut buf = [0u8; 8];
    let read = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .expect("client should see the close");
    assert!(matches!(read, Ok(0) | Err(_)));

    let (mut local_rd, _) = local.into_split();
    let mut drained = Vec::new();
    let _ = timeout(TEST_TIMEOUT, local_rd.read_to_end(&mut drained))
        .await
        .expect("local side should see the close");
}

#[tokio::test]
async fn test_parent_death_triggers_shutdown() {
    let worker = start_worker("rendezvous.sock").await;

    // Wired exactly like main(): the monitor fires, the handle requests a
    // non-flushing shutdown. The sentinel pid never matches, so the first
    // poll reads as parent death.
    let mut monitor = ParentMonitor::poll_only(-1, Duration::from_millis(50));
    let shutdown = worker.shutdown.clone();
    tokio::spawn(async move {
        monitor.gone().await;
        shutdown.request(ShutdownMode::Discard);
    });

    timeout(TEST_TIMEOUT, worker.run_task)
        .await
        .expect("reactor did not exit after parent death")
        .unwrap()
        .unwrap();
}
