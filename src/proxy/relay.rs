//! Established-phase byte relay
//!
//! Once a connection is established, one relay task owns both streams and
//! copies bytes verbatim in bounded chunks, preserving order. A single
//! `select!` loop (rather than a task per direction) keeps the teardown
//! ordering deterministic: when one side fails, no further reads happen
//! anywhere before the surviving side is flushed and closed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Copy chunk size, matching the line-oriented traffic this worker carries
pub const CHUNK_SIZE: usize = 8192;

/// How a commanded shutdown treats buffered outbound data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Deliver buffered output before closing
    Flush,
    /// Close immediately, discarding buffered output
    Discard,
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Client (TLS) side hit error or EOF
    RemoteClosed,
    /// Rendezvous side hit error or EOF
    LocalClosed,
    /// A shutdown command arrived over the control channel
    ShutDown,
}

/// Relay bytes between the TLS client and the rendezvous peer until one side
/// closes or a shutdown command arrives.
///
/// Control values: `Some(Flush)` flushes and closes both writers,
/// `Some(Discard)` drops everything on the floor. A dropped control sender is
/// treated as `Discard` (the reactor has already torn the connection down).
pub async fn run<R, L>(
    remote: R,
    local: L,
    mut ctl: watch::Receiver<Option<ShutdownMode>>,
) -> RelayOutcome
where
    R: AsyncRead + AsyncWrite,
    L: AsyncRead + AsyncWrite,
{
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let mut from_remote = vec![0u8; CHUNK_SIZE];
    let mut from_local = vec![0u8; CHUNK_SIZE];

    loop {
        tokio::select! {
            biased;

            changed = ctl.changed() => {
                let mode = if changed.is_ok() {
                    *ctl.borrow_and_update()
                } else {
                    Some(ShutdownMode::Discard)
                };
                match mode {
                    Some(ShutdownMode::Flush) => {
                        let _ = local_wr.shutdown().await;
                        let _ = remote_wr.shutdown().await;
                        return RelayOutcome::ShutDown;
                    }
                    Some(ShutdownMode::Discard) => return RelayOutcome::ShutDown,
                    None => {}
                }
            }

            read = remote_rd.read(&mut from_remote) => {
                match read {
                    Ok(n) if n > 0 => {
                        if local_wr.write_all(&from_remote[..n]).await.is_err() {
                            // Rendezvous peer gone mid-write: flush the TLS
                            // buffer and send close_notify toward the client.
                            let _ = remote_wr.shutdown().await;
                            return RelayOutcome::LocalClosed;
                        }
                    }
                    _ => {
                        // Client gone: deliver what it already sent to the
                        // rendezvous peer, then answer with a best-effort
                        // close_notify.
                        let _ = local_wr.shutdown().await;
                        let _ = remote_wr.shutdown().await;
                        return RelayOutcome::RemoteClosed;
                    }
                }
            }

            read = local_rd.read(&mut from_local) => {
                match read {
                    Ok(n) if n > 0 => {
                        if remote_wr.write_all(&from_local[..n]).await.is_err() {
                            let _ = local_wr.shutdown().await;
                            return RelayOutcome::RemoteClosed;
                        }
                    }
                    _ => {
                        // Rendezvous peer gone: flush the client's pending
                        // output and close the TLS session gracefully.
                        let _ = remote_wr.shutdown().await;
                        return RelayOutcome::LocalClosed;
                    }
                }
            }
        }
    }
}
