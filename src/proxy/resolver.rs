//! Reverse-lookup adapter
//!
//! Wraps the blocking system resolver in an abortable task so the reactor
//! never blocks on DNS. Exactly one `Resolved` event is sent per lookup;
//! failures, timeouts, and empty results all surface as `hostname: None` and
//! the state machine falls back to the numeric address. A lookup cancelled
//! after its completion was already scheduled is harmless: the dispatcher
//! ignores events for connections that have moved on.

use std::net::IpAddr;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use super::connection::{ConnId, Event};

/// Time budget for one reverse lookup
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start an asynchronous reverse lookup of `addr` for connection `id`.
///
/// Returns a handle that cancels the lookup; aborting after completion is a
/// no-op.
pub fn spawn_reverse_lookup(
    id: ConnId,
    addr: IpAddr,
    events: mpsc::UnboundedSender<Event>,
) -> AbortHandle {
    let task = tokio::spawn(async move {
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr));
        let hostname = match timeout(LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(Ok(name))) if !name.is_empty() => Some(name),
            Ok(Ok(Err(e))) => {
                debug!("reverse lookup of {} failed: {}", addr, e);
                None
            }
            Err(_) => {
                debug!("reverse lookup of {} timed out", addr);
                None
            }
            _ => None,
        };
        let _ = events.send(Event::Resolved { id, hostname });
    });
    task.abort_handle()
}
