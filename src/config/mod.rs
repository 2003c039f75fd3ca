//! Startup configuration
//!
//! The worker is spawned by a trusted parent server which writes a single
//! configuration record to a pre-established descriptor before the event loop
//! starts. The record is a 4-byte big-endian length followed by a versioned
//! JSON body, so fields can be added later without breaking older workers.
//! A short, truncated, or malformed record is a fatal startup error.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{Result, WorkerError};

/// Highest configuration record version this worker understands
pub const CONFIG_VERSION: u32 = 1;

/// Upper bound on the record body; anything larger is a corrupt length prefix
const MAX_RECORD_LEN: usize = 64 * 1024;

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_ssl_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_keepalive_secs() -> u64 {
    300
}

/// Worker configuration record
///
/// Unknown fields are ignored on read so a newer parent can hand extra fields
/// to an older worker. A record claiming a version newer than
/// [`CONFIG_VERSION`] is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Record format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Server private key path (PEM)
    pub private_key_file: PathBuf,

    /// Server certificate chain path (PEM)
    pub certificate_file: PathBuf,

    /// CA certificate file for client certificate verification
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Hashed CA certificate directory for client certificate verification
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,

    /// Whether clients must present a valid certificate
    #[serde(default)]
    pub require_client_cert: bool,

    /// TLS listen port
    pub ssl_port: u16,

    /// TLS bind address
    #[serde(default = "default_ssl_addr")]
    pub ssl_addr: IpAddr,

    /// Filesystem path of the rendezvous Unix stream socket
    pub socket_path: PathBuf,

    /// TCP keepalive idle time applied to accepted client sockets, in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl WorkerConfig {
    /// Read one length-prefixed configuration record
    pub fn read_from<R: Read>(src: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        src.read_exact(&mut len_buf)
            .map_err(|e| WorkerError::Config(format!("short configuration record: {}", e)))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(WorkerError::Config(format!(
                "implausible configuration record length: {}",
                len
            )));
        }

        let mut body = vec![0u8; len];
        src.read_exact(&mut body)
            .map_err(|e| WorkerError::Config(format!("short configuration record: {}", e)))?;

        let config: WorkerConfig = serde_json::from_slice(&body)
            .map_err(|e| WorkerError::Config(format!("malformed configuration record: {}", e)))?;

        if config.version > CONFIG_VERSION {
            return Err(WorkerError::Config(format!(
                "unsupported configuration record version {} (worker supports up to {})",
                config.version, CONFIG_VERSION
            )));
        }

        Ok(config)
    }

    /// Read the configuration record from an inherited descriptor
    pub fn read_from_fd(fd: RawFd) -> Result<Self> {
        // Duplicate so dropping the File does not close the inherited fd.
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(WorkerError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: `dup` is a freshly duplicated descriptor owned by no one else.
        let mut file = unsafe { File::from_raw_fd(dup) };
        Self::read_from(&mut file)
    }

    /// Write a record in the wire form `read_from` expects
    ///
    /// Used by the spawning parent and by tests.
    pub fn write_to<W: Write>(&self, dst: &mut W) -> Result<()> {
        let body = serde_json::to_vec(self)
            .map_err(|e| WorkerError::Config(format!("cannot encode configuration: {}", e)))?;
        dst.write_all(&(body.len() as u32).to_be_bytes())?;
        dst.write_all(&body)?;
        Ok(())
    }

    /// Socket address the TLS listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ssl_addr, self.ssl_port)
    }

    /// TCP keepalive idle time for accepted client sockets
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}
