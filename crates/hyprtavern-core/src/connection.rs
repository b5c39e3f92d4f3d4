//! Async duplex wire over a Unix stream socket.
//!
//! A [`WireConnection`] owns one `AF_UNIX` stream and speaks length-prefixed
//! JSON frames with optional `SCM_RIGHTS` descriptors. IO is driven by hand
//! over [`AsyncFd`] rather than `tokio::net::UnixStream` because descriptor
//! passing needs `sendmsg`/`recvmsg` on the raw socket.
//!
//! Received descriptors queue FIFO; after decoding an fd-carrying message
//! the caller pops its descriptor with [`WireConnection::take_fd`]. Frame
//! order on a stream socket guarantees the pairing.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::unix::AsyncFd;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{WireError, WireResult};
use crate::fd_passing;
use crate::framing::FrameCodec;

/// Read chunk size; large enough for any registry snapshot in one pass.
const READ_CHUNK: usize = 16 * 1024;

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// One end of a tavern wire.
#[derive(Debug)]
pub struct WireConnection {
    io: Arc<AsyncFd<UnixStream>>,
    codec: FrameCodec,
    readbuf: BytesMut,
    fds: VecDeque<OwnedFd>,
    peer_pid: Option<i32>,
}

impl WireConnection {
    /// Wrap a connected stream. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be made non-blocking or registered with
    /// the reactor.
    pub fn from_std(stream: UnixStream) -> WireResult<Self> {
        stream.set_nonblocking(true)?;

        let peer_pid = nix::sys::socket::getsockopt(
            &stream,
            nix::sys::socket::sockopt::PeerCredentials,
        )
        .ok()
        .map(|creds| creds.pid());

        Ok(Self {
            io: Arc::new(AsyncFd::new(stream)?),
            codec: FrameCodec::new(),
            readbuf: BytesMut::with_capacity(READ_CHUNK),
            fds: VecDeque::new(),
            peer_pid,
        })
    }

    /// Adopt an inherited descriptor, e.g. the barmaid's `--fd`.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is not a connected stream socket.
    pub fn from_owned_fd(fd: OwnedFd) -> WireResult<Self> {
        Self::from_std(UnixStream::from(fd))
    }

    /// A connected pair, for in-process clients and tests.
    ///
    /// # Errors
    ///
    /// Fails if the socket pair cannot be created.
    pub fn pair() -> WireResult<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_std(a)?, Self::from_std(b)?))
    }

    /// Pid of the peer process from `SO_PEERCRED`, when the platform
    /// reports one.
    #[must_use]
    pub const fn peer_pid(&self) -> Option<i32> {
        self.peer_pid
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Fails on serialization or socket errors.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> WireResult<()> {
        let payload = serde_json::to_vec(msg)?;
        write_frame(&self.io, &mut self.codec, &payload, &[]).await
    }

    /// Send one message with a descriptor attached to its frame.
    ///
    /// # Errors
    ///
    /// Fails on serialization or socket errors.
    pub async fn send_with_fd<T: Serialize>(
        &mut self,
        msg: &T,
        fd: BorrowedFd<'_>,
    ) -> WireResult<()> {
        let payload = serde_json::to_vec(msg)?;
        write_frame(&self.io, &mut self.codec, &payload, &[fd.as_raw_fd()]).await
    }

    /// Receive the next message, queueing any descriptors that arrive.
    ///
    /// # Errors
    ///
    /// [`WireError::Closed`] when the peer hangs up; otherwise socket or
    /// decode errors.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        let frame = read_frame(&self.io, &mut self.codec, &mut self.readbuf, &mut self.fds)
            .await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Pop the oldest received descriptor.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Pop the oldest received descriptor, erroring when none arrived.
    ///
    /// # Errors
    ///
    /// [`WireError::MissingFd`] when the queue is empty.
    pub fn expect_fd(&mut self) -> WireResult<OwnedFd> {
        self.fds.pop_front().ok_or(WireError::MissingFd)
    }

    /// Split into independently usable read and write halves.
    #[must_use]
    pub fn split(self) -> (WireReader, WireWriter) {
        (
            WireReader {
                io: Arc::clone(&self.io),
                codec: self.codec.clone(),
                readbuf: self.readbuf,
                fds: self.fds,
                peer_pid: self.peer_pid,
            },
            WireWriter {
                io: self.io,
                codec: self.codec,
            },
        )
    }
}

/// Read half of a split [`WireConnection`].
#[derive(Debug)]
pub struct WireReader {
    io: Arc<AsyncFd<UnixStream>>,
    codec: FrameCodec,
    readbuf: BytesMut,
    fds: VecDeque<OwnedFd>,
    peer_pid: Option<i32>,
}

impl WireReader {
    /// Receive the next message. See [`WireConnection::recv`].
    ///
    /// # Errors
    ///
    /// [`WireError::Closed`] when the peer hangs up.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        let frame = read_frame(&self.io, &mut self.codec, &mut self.readbuf, &mut self.fds)
            .await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Pop the oldest received descriptor.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Pid of the peer process, when known.
    #[must_use]
    pub const fn peer_pid(&self) -> Option<i32> {
        self.peer_pid
    }
}

/// Write half of a split [`WireConnection`].
#[derive(Debug)]
pub struct WireWriter {
    io: Arc<AsyncFd<UnixStream>>,
    codec: FrameCodec,
}

impl WireWriter {
    /// Send one message.
    ///
    /// # Errors
    ///
    /// Fails on serialization or socket errors.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> WireResult<()> {
        let payload = serde_json::to_vec(msg)?;
        write_frame(&self.io, &mut self.codec, &payload, &[]).await
    }

    /// Send one message with an attached descriptor.
    ///
    /// # Errors
    ///
    /// Fails on serialization or socket errors.
    pub async fn send_with_fd<T: Serialize>(
        &mut self,
        msg: &T,
        fd: BorrowedFd<'_>,
    ) -> WireResult<()> {
        let payload = serde_json::to_vec(msg)?;
        write_frame(&self.io, &mut self.codec, &payload, &[fd.as_raw_fd()]).await
    }
}

async fn write_frame(
    io: &AsyncFd<UnixStream>,
    codec: &mut FrameCodec,
    payload: &[u8],
    fds: &[RawFd],
) -> WireResult<()> {
    let mut framed = BytesMut::new();
    codec.encode(Bytes::copy_from_slice(payload), &mut framed)?;

    let mut offset = 0usize;
    // Descriptors ride on the sendmsg that writes the first byte; any
    // continuation after a short write goes bare.
    let mut pending_fds = fds;

    while offset < framed.len() {
        let mut guard = io.writable().await?;
        match guard.try_io(|inner| {
            fd_passing::send_with_fds(inner.get_ref().as_raw_fd(), &framed[offset..], pending_fds)
                .map_err(errno_to_io)
        }) {
            Ok(Ok(written)) => {
                offset += written;
                pending_fds = &[];
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_would_block) => {}
        }
    }

    Ok(())
}

async fn read_frame(
    io: &AsyncFd<UnixStream>,
    codec: &mut FrameCodec,
    readbuf: &mut BytesMut,
    fds: &mut VecDeque<OwnedFd>,
) -> WireResult<Bytes> {
    loop {
        if let Some(frame) = codec.decode(readbuf)? {
            return Ok(frame);
        }

        let mut guard = io.readable().await?;
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = Vec::new();

        let read = match guard.try_io(|inner| {
            fd_passing::recv_with_fds(inner.get_ref().as_raw_fd(), &mut chunk, &mut received)
                .map_err(errno_to_io)
        }) {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(e.into()),
            Err(_would_block) => continue,
        };

        fds.extend(received);

        if read == 0 {
            return Err(WireError::Closed);
        }

        readbuf.extend_from_slice(&chunk[..read]);
    }
}
