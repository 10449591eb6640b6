//! `AF_UNIX SOCK_SEQPACKET` transport: one JSON datagram per message, with
//! an optional `SCM_RIGHTS` side channel of file descriptors.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::socket::{
    accept, bind, connect, listen, recvmsg, sendmsg, socket, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};

use crate::error::GraphError;
use crate::rpc::FdSet;

/// Datagrams larger than this are rejected with `MessageTooLarge` rather
/// than silently truncated; large payloads are expected to go over a memfd
/// passed via `SCM_RIGHTS` instead.
pub const MAX_MESSAGE_BYTES: usize = 128 * 1024;

pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    fn from_owned(fd: OwnedFd) -> Self {
        Socket { fd }
    }

    /// Create a bound, listening endpoint at `path` (removing any stale
    /// socket file first).
    pub fn bind_listen(path: &Path) -> Result<Socket, GraphError> {
        let _ = std::fs::remove_file(path);
        let fd = socket(AddressFamily::Unix, SockType::SeqPacket, SockFlag::empty(), None)
            .map_err(|e| GraphError::Protocol(format!("socket: {e}")))?;
        let addr = UnixAddr::new(path).map_err(|e| GraphError::Protocol(format!("addr: {e}")))?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| GraphError::Protocol(format!("bind: {e}")))?;
        listen(&fd, Backlog::new(16).unwrap_or(Backlog::MAXCONN))
            .map_err(|e| GraphError::Protocol(format!("listen: {e}")))?;
        Ok(Socket::from_owned(fd))
    }

    /// Accept one connected peer.
    pub fn accept(&self) -> Result<Socket, GraphError> {
        let raw = accept(self.fd.as_raw_fd()).map_err(|e| GraphError::Protocol(format!("accept: {e}")))?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Socket::from_owned(fd))
    }

    /// Accept one connected peer, waiting at most `timeout_ms`. Returns
    /// `Ok(None)` on timeout so a dispatcher loop can re-check a shutdown
    /// flag between waits rather than blocking on `accept` forever (the
    /// socket-timeout-based cancellation support called for in the
    /// concurrency model).
    pub fn accept_timeout(&self, timeout_ms: i32) -> Result<Option<Socket>, GraphError> {
        let mut pfd = libc::pollfd { fd: self.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(GraphError::Protocol(format!("poll: {}", std::io::Error::last_os_error())));
        }
        if rc == 0 {
            return Ok(None);
        }
        Ok(Some(self.accept()?))
    }

    /// Connect to a listening endpoint at `path`.
    pub fn connect(path: &Path) -> Result<Socket, GraphError> {
        let fd = socket(AddressFamily::Unix, SockType::SeqPacket, SockFlag::empty(), None)
            .map_err(|e| GraphError::Protocol(format!("socket: {e}")))?;
        let addr = UnixAddr::new(path).map_err(|e| GraphError::Protocol(format!("addr: {e}")))?;
        connect(fd.as_raw_fd(), &addr).map_err(|e| GraphError::Protocol(format!("connect: {e}")))?;
        Ok(Socket::from_owned(fd))
    }

    /// A connected, in-process pair (used for the host-bridge API sockets
    /// that back each auxiliary service).
    pub fn pair() -> Result<(Socket, Socket), GraphError> {
        let (a, b) = nix::sys::socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| GraphError::Protocol(format!("socketpair: {e}")))?;
        Ok((Socket::from_owned(a), Socket::from_owned(b)))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Send one JSON value, optionally with accompanying descriptors.
    pub fn send(&self, value: &serde_json::Value, fds: &[RawFd]) -> Result<(), GraphError> {
        let bytes = serde_json::to_vec(value).map_err(|e| GraphError::Protocol(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(GraphError::Protocol(format!(
                "message too large: {} bytes (max {})",
                bytes.len(),
                MAX_MESSAGE_BYTES
            )));
        }
        let iov = [IoSlice::new(&bytes)];
        if fds.is_empty() {
            sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
                .map_err(|e| GraphError::Protocol(format!("sendmsg: {e}")))?;
        } else {
            let cmsg = [ControlMessage::ScmRights(fds)];
            sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .map_err(|e| GraphError::Protocol(format!("sendmsg: {e}")))?;
        }
        Ok(())
    }

    /// Receive one JSON value plus any descriptors sent alongside it.
    ///
    /// Peeks the pending datagram's true size first (`MSG_PEEK | MSG_TRUNC`)
    /// so the real read allocates exactly enough buffer; a datagram larger
    /// than [`MAX_MESSAGE_BYTES`] is drained and reported as
    /// `MessageTooLarge` rather than delivered truncated.
    pub fn recv(&self) -> Result<(serde_json::Value, FdSet), GraphError> {
        let mut probe = [0u8; 0];
        let mut probe_iov = [IoSliceMut::new(&mut probe)];
        let peek = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut probe_iov,
            None,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_TRUNC,
        )
        .map_err(|e| GraphError::Protocol(format!("recvmsg peek: {e}")))?;
        let size = peek.bytes;

        if size > MAX_MESSAGE_BYTES {
            // Drain the oversized datagram so it doesn't wedge the queue.
            let mut sink = vec![0u8; size];
            let mut sink_iov = [IoSliceMut::new(&mut sink)];
            let _ = recvmsg::<()>(self.fd.as_raw_fd(), &mut sink_iov, None, MsgFlags::empty());
            return Err(GraphError::Protocol(format!(
                "message too large: {size} bytes (max {MAX_MESSAGE_BYTES})"
            )));
        }

        let mut buf = vec![0u8; size];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 8]);
        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(|e| GraphError::Protocol(format!("recvmsg: {e}")))?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().map_err(|e| GraphError::Protocol(e.to_string()))? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for raw in received {
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        let value: serde_json::Value =
            serde_json::from_slice(&buf).map_err(|e| GraphError::Protocol(e.to_string()))?;
        Ok((value, FdSet::new(fds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pair_roundtrips_a_message() {
        let (a, b) = Socket::pair().unwrap();
        a.send(&json!({"method": "ping"}), &[]).unwrap();
        let (value, fds) = b.recv().unwrap();
        assert_eq!(value, json!({"method": "ping"}));
        assert!(fds.is_empty());
    }

    #[test]
    fn oversized_message_is_rejected_before_send() {
        let (a, _b) = Socket::pair().unwrap();
        let huge = "x".repeat(MAX_MESSAGE_BYTES + 1);
        let err = a.send(&json!({"blob": huge}), &[]).unwrap_err();
        assert!(matches!(err, GraphError::Protocol(_)));
    }

    #[test]
    fn accept_timeout_returns_none_when_nothing_connects() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Socket::bind_listen(&dir.path().join("sock")).unwrap();
        assert!(listener.accept_timeout(50).unwrap().is_none());
    }
}
