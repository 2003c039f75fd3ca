//! Credential-stamped send
//!
//! The identity line is the rendezvous peer's only way to bind the plaintext
//! stream to a network identity, so on Linux the first segment is sent with
//! an `SCM_CREDENTIALS` control message carrying this process's pid/uid/gid
//! (which the kernel verifies). Platforms without credential passing send
//! the line alone.

use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(target_os = "linux")]
use tokio::io::Interest;

/// Send `payload` over the rendezvous channel, stamping the first segment
/// with OS-verified process credentials where the platform supports it.
pub async fn send_with_creds(stream: &mut UnixStream, payload: &[u8]) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let fd = stream.as_raw_fd();
        let sent = loop {
            stream.writable().await?;
            match stream.try_io(Interest::WRITABLE, || send_with_ucred(fd, payload)) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e)
                    if e.raw_os_error() == Some(libc::EOPNOTSUPP)
                        || e.raw_os_error() == Some(libc::EINVAL) =>
                {
                    // No ancillary support on this socket; the stamp is
                    // defense-in-depth, so degrade to the plain line.
                    return stream.write_all(payload).await;
                }
                Err(e) => return Err(e),
            }
        };
        if sent < payload.len() {
            stream.write_all(&payload[sent..]).await?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        stream.write_all(payload).await
    }
}

/// One `sendmsg` carrying the payload plus an `SCM_CREDENTIALS` message.
#[cfg(target_os = "linux")]
fn send_with_ucred(fd: std::os::unix::io::RawFd, payload: &[u8]) -> io::Result<usize> {
    use std::mem;

    // cmsghdr requires aligned storage; 64 bytes comfortably holds
    // CMSG_SPACE(sizeof(ucred)).
    #[repr(align(8))]
    struct CmsgBuf([u8; 64]);
    let mut cmsg_buf = CmsgBuf([0u8; 64]);

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: every pointer handed to sendmsg references locals that outlive
    // the call, and the control buffer is large and aligned enough for one
    // ucred control message.
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.0.as_mut_ptr().cast();
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32) as usize;

        let hdr = libc::CMSG_FIRSTHDR(&msg);
        (*hdr).cmsg_level = libc::SOL_SOCKET;
        (*hdr).cmsg_type = libc::SCM_CREDENTIALS;
        (*hdr).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::ucred>() as u32) as usize;

        let creds = libc::ucred {
            pid: libc::getpid(),
            uid: libc::getuid(),
            gid: libc::getgid(),
        };
        std::ptr::write_unaligned(libc::CMSG_DATA(hdr).cast::<libc::ucred>(), creds);

        let n = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_payload_arrives_intact() {
        let (mut tx, mut rx) = UnixStream::pair().unwrap();

        send_with_creds(&mut tx, b"203.0.113.5^client.example.net\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"203.0.113.5^client.example.net\r\n");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        send_with_creds(&mut tx, b"").await.unwrap();
        drop(rx);
    }
}
