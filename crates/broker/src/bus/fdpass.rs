//! Socket I/O carrying file descriptors as `SCM_RIGHTS` ancillary data.
//!
//! Tokio's `UnixStream` has no notion of ancillary data, so reads and writes
//! go through `recvmsg`/`sendmsg` once the stream reports readiness.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use portal_protocol::MAX_FDS_PER_FRAME;
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Read bytes into `buf`, queueing any descriptors received with them.
///
/// Returns 0 at end of stream.
pub(crate) async fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        let result = stream.try_io(Interest::READABLE, || {
            recv_once(stream.as_raw_fd(), &mut *buf, &mut *fds)
        });
        match result {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn recv_once(fd: RawFd, buf: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC)
        .map_err(io::Error::from)?;

    for control in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = control {
            for raw in received {
                // SAFETY: the kernel just installed this descriptor for us.
                fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }

    Ok(msg.bytes)
}

/// Write `data` with `fds` attached to its first byte.
pub(crate) async fn send_with_fds(
    stream: &UnixStream,
    data: &[u8],
    fds: &[RawFd],
) -> io::Result<()> {
    if fds.is_empty() {
        return write_all(stream, data).await;
    }

    let sent = loop {
        stream.writable().await?;
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(data)];
            let cmsg = [ControlMessage::ScmRights(fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match result {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    };

    write_all(stream, &data[sent..]).await
}

/// Write all of `data` without ancillary data.
pub(crate) async fn write_all(stream: &UnixStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};

    #[tokio::test]
    async fn test_descriptors_cross_the_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload").unwrap();

        send_with_fds(&a, b"hello", &[file.as_raw_fd()]).await.unwrap();

        let mut buf = [0u8; 16];
        let mut fds = VecDeque::new();
        let n = recv_with_fds(&b, &mut buf, &mut fds).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.pop_front().unwrap());
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "payload");
    }

    #[tokio::test]
    async fn test_plain_write_and_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        write_all(&a, b"abc").await.unwrap();
        drop(a);

        let mut buf = [0u8; 8];
        let mut fds = VecDeque::new();
        let n = recv_with_fds(&b, &mut buf, &mut fds).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(recv_with_fds(&b, &mut buf, &mut fds).await.unwrap(), 0);
        assert!(fds.is_empty());
    }
}
