//! Parent liveness monitor
//!
//! The worker must notice when its supervising parent exits and tear
//! everything down rather than linger as an orphan holding the TLS port.
//! Exactly one detection strategy is active, picked at startup in priority
//! order:
//!
//! 1. [`Strategy::DeathSignal`]: `prctl(PR_SET_PDEATHSIG)` has the kernel
//!    deliver SIGUSR1 the moment the parent exits.
//! 2. [`Strategy::PidFd`]: a pidfd for the parent becomes readable on exit,
//!    polled through the runtime's readiness multiplexer.
//! 3. [`Strategy::Poll`]: a periodic timer re-reads `getppid()` and compares
//!    it against the pid recorded at startup.
//!
//! Whichever strategy fires, `gone()` resolves at most once, ever.

use std::time::Duration;

use tokio::sync::mpsc;

/// Interval for the polling fallback strategy
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Which detection mechanism is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DeathSignal,
    PidFd,
    Poll,
}

/// Watches the parent process and reports its death at most once
pub struct ParentMonitor {
    rx: mpsc::Receiver<()>,
    strategy: Strategy,
    fired: bool,
}

/// The pid of this process's current parent
pub fn current_parent_pid() -> i32 {
    // SAFETY: getppid cannot fail and has no side effects.
    unsafe { libc::getppid() }
}

impl ParentMonitor {
    /// Start watching `parent_pid` with the best available strategy.
    pub fn spawn(parent_pid: i32) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let strategy = spawn_watcher(parent_pid, POLL_INTERVAL, tx);
        Self {
            rx,
            strategy,
            fired: false,
        }
    }

    /// Start a polling-only monitor with a custom interval.
    ///
    /// Used on platforms without a kernel notification and by tests, since it
    /// neither installs signal handlers nor alters process state.
    pub fn poll_only(parent_pid: i32, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        spawn_poll_watcher(parent_pid, interval, tx);
        Self {
            rx,
            strategy: Strategy::Poll,
            fired: false,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Resolves when the parent is detected dead. Resolves at most once over
    /// the lifetime of the monitor; later calls pend forever.
    pub async fn gone(&mut self) {
        if self.fired {
            std::future::pending::<()>().await;
        }
        match self.rx.recv().await {
            Some(()) => self.fired = true,
            // Watcher task ended without firing (e.g. runtime teardown);
            // never report a death that was not observed.
            None => std::future::pending::<()>().await,
        }
    }
}

fn spawn_watcher(parent_pid: i32, interval: Duration, tx: mpsc::Sender<()>) -> Strategy {
    #[cfg(target_os = "linux")]
    {
        if spawn_death_signal_watcher(parent_pid, tx.clone()) {
            return Strategy::DeathSignal;
        }
        if spawn_pidfd_watcher(parent_pid, tx.clone()) {
            return Strategy::PidFd;
        }
    }
    spawn_poll_watcher(parent_pid, interval, tx);
    Strategy::Poll
}

#[cfg(target_os = "linux")]
fn spawn_death_signal_watcher(parent_pid: i32, tx: mpsc::Sender<()>) -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    // SAFETY: PR_SET_PDEATHSIG only changes this process's own settings.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGUSR1, 0, 0, 0) } != 0 {
        return false;
    }
    let mut sig = match signal(SignalKind::user_defined1()) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    // The parent may have exited between our fork and arming the signal, in
    // which case no signal will ever arrive.
    let already_gone = current_parent_pid() != parent_pid;
    tokio::spawn(async move {
        if !already_gone {
            sig.recv().await;
        }
        let _ = tx.send(()).await;
    });
    true
}

#[cfg(target_os = "linux")]
fn spawn_pidfd_watcher(parent_pid: i32, tx: mpsc::Sender<()>) -> bool {
    use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    // SAFETY: pidfd_open returns a new descriptor we immediately take
    // ownership of.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, parent_pid as libc::pid_t, 0u32) };
    if fd < 0 {
        return false;
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
    let async_fd = match AsyncFd::with_interest(owned, Interest::READABLE) {
        Ok(async_fd) => async_fd,
        Err(_) => return false,
    };
    tokio::spawn(async move {
        // A pidfd polls readable exactly when the watched process exits.
        let _ = async_fd.readable().await;
        let _ = tx.send(()).await;
    });
    true
}

fn spawn_poll_watcher(parent_pid: i32, interval: Duration, tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a freshly spawned
        // monitor waits one full interval before its first check.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if current_parent_pid() != parent_pid {
                let _ = tx.send(()).await;
                return;
            }
        }
    });
}
