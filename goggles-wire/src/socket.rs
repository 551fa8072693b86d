//! Thin libc wrappers for the capture socket: abstract-namespace
//! bind/connect, non-blocking accept, and `SCM_RIGHTS` fd passing.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::protocol::CAPTURE_SOCKET_NAME;

/// Outcome of a non-blocking receive.
pub enum RecvOutcome {
    /// `data_len` payload bytes landed in the caller's buffer.
    Data { data_len: usize, fds: Vec<OwnedFd> },
    /// Nothing available right now (EAGAIN/EWOULDBLOCK).
    WouldBlock,
    /// Orderly peer shutdown.
    Closed,
    /// Hard socket error; treat like a close.
    Error(io::Error),
}

fn abstract_addr() -> (libc::sockaddr_un, libc::socklen_t) {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // sun_path[0] stays NUL: abstract namespace.
    let name = CAPTURE_SOCKET_NAME.as_bytes();
    for (i, &b) in name.iter().enumerate() {
        addr.sun_path[i + 1] = b as libc::c_char;
    }
    let path_len = 1 + name.len();
    let len = mem::size_of::<libc::sa_family_t>() + path_len;
    (addr, len as libc::socklen_t)
}

fn new_stream_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates the listener on the abstract capture socket.
pub fn bind_listener() -> io::Result<OwnedFd> {
    let sock = new_stream_socket()?;
    let (addr, len) = abstract_addr();
    let rc = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::listen(sock.as_raw_fd(), 1) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sock)
}

/// Connects to the abstract capture socket (producer side).
pub fn connect() -> io::Result<OwnedFd> {
    let sock = new_stream_socket()?;
    let (addr, len) = abstract_addr();
    let rc = unsafe {
        libc::connect(
            sock.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sock)
}

/// Accepts one pending client, or `None` when nothing is queued.
pub fn accept(listener: BorrowedFd<'_>) -> io::Result<Option<OwnedFd>> {
    let fd = unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            _ => Err(err),
        };
    }
    Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Maximum fds accepted in a single ancillary block. semaphore_init's two
/// is the largest the protocol sends, with headroom for coalesced messages.
const MAX_ANCILLARY_FDS: usize = 4;

/// Room for `CMSG_SPACE(MAX_ANCILLARY_FDS * sizeof(int))` on LP64.
const CMSG_BUF_LEN: usize = 64;

/// Non-blocking receive into `buf`, extracting any `SCM_RIGHTS` fds.
pub fn recv_with_fds(sock: BorrowedFd<'_>, buf: &mut [u8]) -> RecvOutcome {
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let received = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
    if received == 0 {
        return RecvOutcome::Closed;
    }
    if received < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => RecvOutcome::WouldBlock,
            _ => RecvOutcome::Error(err),
        };
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    RecvOutcome::Data {
        data_len: received as usize,
        fds,
    }
}

/// Sends `data` with up to [`MAX_ANCILLARY_FDS`] borrowed fds attached.
pub fn send_with_fds(sock: BorrowedFd<'_>, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    assert!(fds.len() <= MAX_ANCILLARY_FDS);

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let payload = std::mem::size_of_val(fds);
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(payload as u32) } as usize;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as usize;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                payload,
            );
        }
    }

    let sent = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Blocking best-effort send used for the initial control message: retries
/// through EINTR and short sleeps through EAGAIN until the whole buffer is
/// on the wire.
pub fn send_all_blocking(sock: BorrowedFd<'_>, data: &[u8]) -> io::Result<()> {
    let mut total = 0usize;
    while total < data.len() {
        let sent = unsafe {
            libc::send(
                sock.as_raw_fd(),
                data[total..].as_ptr() as *const libc::c_void,
                data.len() - total,
                libc::MSG_NOSIGNAL,
            )
        };
        if sent < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    let mut pfd = libc::pollfd {
                        fd: sock.as_raw_fd(),
                        events: libc::POLLOUT,
                        revents: 0,
                    };
                    unsafe { libc::poll(&mut pfd, 1, 100) };
                    continue;
                }
                _ => return Err(err),
            }
        }
        total += sent as usize;
    }
    Ok(())
}
