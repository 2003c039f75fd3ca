//! TLS Worker binary
//!
//! Spawned by the parent server with a configuration record on an inherited
//! descriptor. Exits 0 on orderly shutdown (SIGTERM or parent death),
//! nonzero if the configuration cannot be read or TLS initialization fails.

use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};

use tls_worker::common::{init_logger, Result, WorkerError};
use tls_worker::config::WorkerConfig;
use tls_worker::proxy::{current_parent_pid, ParentMonitor, Reactor, ShutdownMode};
use tls_worker::tls::create_tls_acceptor;
use tls_worker::{APP_NAME, VERSION};

/// TLS Worker: TLS-terminating proxy for a trusted parent server
#[derive(Parser, Debug)]
#[clap(version = VERSION, about, long_about = None)]
struct Args {
    /// Descriptor the parent wrote the startup configuration record to
    #[clap(long, default_value_t = 0)]
    config_fd: i32,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level);

    info!("starting {} v{}", APP_NAME, VERSION);

    let config = WorkerConfig::read_from_fd(args.config_fd).map_err(|e| {
        error!("unable to read startup configuration: {}", e);
        e
    })?;

    let acceptor = create_tls_acceptor(&config).map_err(|e| {
        error!("TLS initialization failure: {}", e);
        e
    })?;

    let parent_pid = current_parent_pid();
    let monitor = ParentMonitor::spawn(parent_pid);
    info!(
        "watching parent pid {} using {:?} strategy",
        parent_pid,
        monitor.strategy()
    );

    let reactor = Reactor::bind(&config, acceptor).await?;
    let shutdown = reactor.shutdown_handle();

    // SIGTERM from the parent: orderly, flush-aware teardown.
    let mut sigterm = signal(SignalKind::terminate()).map_err(WorkerError::Io)?;
    let term_handle = shutdown.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        warn!("received SIGTERM");
        term_handle.request(ShutdownMode::Flush);
    });

    // Parent death: nothing left to flush toward a dead peer.
    let mut monitor = monitor;
    tokio::spawn(async move {
        monitor.gone().await;
        warn!("parent process exited unexpectedly; shutting down");
        shutdown.request(ShutdownMode::Discard);
    });

    reactor.run().await?;

    info!("shutting down");
    Ok(())
}
