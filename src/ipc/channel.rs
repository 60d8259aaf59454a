//! The descriptor channel between the engine and one frameserver.

use super::scm::{recv_fds, send_fds};
use crate::error::{Error, Result};
use crate::event::DescriptorRole;
use crate::observability;
use rustix::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use rustix::io::fcntl_getfd;
use std::os::unix::net::UnixStream;

/// Descriptor number the child end of the channel is placed at.
pub const CONTROL_FD: RawFd = 5;

/// Environment variable naming the child's channel descriptor.
pub const SOCKIN_FD_ENV: &str = "FRAMELINK_SOCKIN_FD";

/// Local-domain socket that moves open descriptors to the peer.
#[derive(Debug, Default)]
pub struct DescriptorChannel {
    socket: Option<UnixStream>,
}

impl DescriptorChannel {
    /// Create a connected pair: the engine's channel and the raw end to hand
    /// to the child.
    pub fn pair() -> Result<(Self, OwnedFd)> {
        let (ours, theirs) = UnixStream::pair()?;
        Ok((Self { socket: Some(ours) }, OwnedFd::from(theirs)))
    }

    /// A channel with no socket; every transfer fails with
    /// [`Error::NotConnected`].
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UnixStream) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    /// Adopt the descriptor named by `FRAMELINK_SOCKIN_FD` (child side).
    ///
    /// A missing variable yields a disconnected channel.
    pub fn from_env() -> Result<Self> {
        let Ok(value) = std::env::var(SOCKIN_FD_ENV) else {
            return Ok(Self::disconnected());
        };
        let fd: RawFd = value
            .parse()
            .map_err(|_| Error::BadArgument(format!("{SOCKIN_FD_ENV}={value} is not a descriptor")))?;
        if fd <= 2 {
            return Err(Error::BadArgument(format!(
                "{SOCKIN_FD_ENV}={fd} names a standard stream"
            )));
        }
        // SAFETY: probe that the number is an open descriptor before taking
        // ownership of it; the spawner reserved it for this channel.
        let borrowed = unsafe { rustix::fd::BorrowedFd::borrow_raw(fd) };
        if fcntl_getfd(borrowed).is_err() {
            return Err(Error::NotConnected);
        }
        // SAFETY: the descriptor is open and nothing else in this process
        // owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_socket(UnixStream::from(owned)))
    }

    /// Whether a socket is attached.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Drop the socket; the peer observes end-of-file.
    pub fn close(&mut self) {
        self.socket = None;
    }

    /// Transfer ownership of `fd` to the peer.
    ///
    /// `fd` is closed in this process when the call returns, whether or not
    /// the transfer succeeded.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedTransfer`] for standard-stream descriptors
    /// - [`Error::NotConnected`] without a socket
    /// - [`Error::TransferFailed`] if the send fails
    pub fn send(&self, fd: OwnedFd, role: DescriptorRole) -> Result<()> {
        let raw = fd.as_raw_fd();
        check_transferable(raw)?;
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        send_fds(socket, &[&fd], &(role as u32).to_le_bytes()).map_err(|e| match e {
            Error::System(errno) => Error::TransferFailed(format!("sendmsg: {errno}")),
            other => other,
        })?;
        observability::record_descriptor_transferred();
        tracing::debug!(fd = raw, ?role, "descriptor transferred");
        Ok(())
    }

    /// Receive one descriptor and its role (blocking).
    ///
    /// # Errors
    ///
    /// [`Error::PeerGone`] if the peer closed the socket,
    /// [`Error::TransferFailed`] for a malformed message.
    pub fn recv(&self) -> Result<(OwnedFd, DescriptorRole)> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        let mut buf = [0u8; 4];
        let (len, fds) = recv_fds(socket, &mut buf)?;
        if len == 0 && fds.is_empty() {
            return Err(Error::PeerGone);
        }
        if len != buf.len() || fds.len() != 1 {
            return Err(Error::TransferFailed(format!(
                "expected one descriptor and 4 bytes, got {} and {len}",
                fds.len()
            )));
        }
        let role = DescriptorRole::from_u32(u32::from_le_bytes(buf))
            .map_err(|e| Error::TransferFailed(e.to_string()))?;
        let mut fds = fds.into_iter();
        let fd = fds
            .next()
            .ok_or_else(|| Error::TransferFailed("descriptor missing".into()))?;
        Ok((fd, role))
    }
}

fn check_transferable(raw: RawFd) -> Result<()> {
    if (0..=2).contains(&raw) {
        return Err(Error::UnsupportedTransfer(format!(
            "descriptor {raw} is a standard stream"
        )));
    }
    Ok(())
}
