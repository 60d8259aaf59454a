//! `SCM_RIGHTS` descriptor passing over a Unix stream socket.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use smallvec::SmallVec;
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Maximum number of descriptors carried by one message.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

/// Send descriptors plus a small data payload.
///
/// At least one data byte always goes out, since `SCM_RIGHTS` cannot ride on
/// an empty message.
pub fn send_fds<Fd: AsFd>(socket: &UnixStream, fds: &[Fd], data: &[u8]) -> Result<()> {
    if fds.is_empty() {
        return Err(Error::BadArgument("no descriptors to send".into()));
    }
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(Error::BadArgument(format!(
            "too many descriptors: {} > {MAX_FDS_PER_MESSAGE}",
            fds.len()
        )));
    }

    let data = if data.is_empty() { &[0u8] } else { data };
    let borrowed: SmallVec<[BorrowedFd<'_>; MAX_FDS_PER_MESSAGE]> =
        fds.iter().map(|fd| fd.as_fd()).collect();

    let mut space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(Error::TransferFailed(
            "descriptors do not fit the ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::NOSIGNAL)?;
    Ok(())
}

/// Receive descriptors plus their data payload.
///
/// Returns the number of data bytes read and the received descriptors. Zero
/// bytes means the peer closed its end.
pub fn recv_fds(
    socket: &UnixStream,
    data_buf: &mut [u8],
) -> Result<(usize, SmallVec<[OwnedFd; MAX_FDS_PER_MESSAGE]>)> {
    if data_buf.is_empty() {
        return Err(Error::BadArgument("receive buffer cannot be empty".into()));
    }

    let mut space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut space);
    let mut iov = [IoSliceMut::new(data_buf)];
    let received = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)?;

    let mut fds = SmallVec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }
    Ok((received.bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_send_recv_file() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut file = tempfile_with(b"framelink");

        send_fds(&tx, &[&file], b"hi").unwrap();
        let mut buf = [0u8; 8];
        let (len, fds) = recv_fds(&rx, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hi");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "framelink");

        // Same open file description: the offset is shared.
        file.seek(SeekFrom::Start(5)).unwrap();
        assert_eq!(received.stream_position().unwrap(), 5);
    }

    #[test]
    fn test_send_nothing_fails() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let empty: &[BorrowedFd<'_>] = &[];
        assert!(matches!(send_fds(&tx, empty, b"x"), Err(Error::BadArgument(_))));
    }

    #[test]
    fn test_recv_after_close_reads_zero() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let mut buf = [0u8; 4];
        let (len, fds) = recv_fds(&rx, &mut buf).unwrap();
        assert_eq!(len, 0);
        assert!(fds.is_empty());
    }

    fn tempfile_with(contents: &[u8]) -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "framelink-scm-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        file.write_all(contents).unwrap();
        file
    }
}
