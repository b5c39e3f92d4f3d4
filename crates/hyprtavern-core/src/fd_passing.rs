//! `SCM_RIGHTS` descriptor passing over `AF_UNIX` stream sockets.
//!
//! A frame that carries a descriptor attaches it as ancillary data on the
//! `sendmsg` that writes the frame's first byte. On a stream socket the
//! kernel pins ancillary data to that byte range, so descriptors arrive in
//! frame order and the receiver can pair them FIFO with the fd-carrying
//! messages it decodes.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};

/// Largest number of descriptors accepted in one message's ancillary data.
///
/// The tavern protocols attach at most one descriptor per frame; room for a
/// few more tolerates batched delivery.
pub const MAX_FDS_PER_MSG: usize = 4;

/// Write `bytes` to `sock`, attaching `fds` as `SCM_RIGHTS` ancillary data.
///
/// Returns the number of payload bytes written, which may be short; the
/// caller must retry the remainder *without* the descriptors (they travel
/// with the first byte).
///
/// # Errors
///
/// Returns the underlying `sendmsg` errno, including `EAGAIN` when the
/// socket is non-blocking and full.
pub fn send_with_fds(sock: RawFd, bytes: &[u8], fds: &[RawFd]) -> nix::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let cmsgs = if fds.is_empty() {
        vec![]
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
}

/// Read from `sock` into `buf`, appending any received descriptors to
/// `out_fds`.
///
/// Returns the number of payload bytes read; zero means the peer hung up.
/// Received descriptors are opened close-on-exec so they never leak into
/// spawned children.
///
/// # Errors
///
/// Returns the underlying `recvmsg` errno, including `EAGAIN` when the
/// socket is non-blocking and empty.
pub fn recv_with_fds(
    sock: RawFd,
    buf: &mut [u8],
    out_fds: &mut Vec<OwnedFd>,
) -> nix::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MSG]);

    let msg = recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let bytes = msg.bytes;

    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel just handed us ownership of this
                // descriptor; nothing else in the process knows it.
                out_fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }

    Ok(bytes)
}
