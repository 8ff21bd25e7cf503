use crate::router::FrameSink;
use anyhow::{Context, Result, bail};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Longest name that fits an abstract `sun_path` with its leading NUL.
pub const MAX_SOCKET_NAME: usize = 106;

/// Builds an abstract-namespace address; no filesystem entry is created.
pub(crate) fn abstract_addr(name: &str) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        bail!("socket name must not be empty");
    }
    if bytes.len() > MAX_SOCKET_NAME {
        bail!("socket name too long ({} > {MAX_SOCKET_NAME}): {name}", bytes.len());
    }
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i + 1] = *b as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + 1 + bytes.len();
    Ok((addr, len as libc::socklen_t))
}

pub(crate) fn seqpacket_socket(flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC | flags,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A connected `SOCK_SEQPACKET` unix socket. Every send and receive moves
/// exactly one whole message.
#[derive(Debug)]
pub struct SeqPacket {
    fd: OwnedFd,
}

impl SeqPacket {
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Connects to a router listening on the abstract name `name`.
    pub fn connect(name: &str) -> Result<Self> {
        let (addr, len) = abstract_addr(name)?;
        let fd = seqpacket_socket(0).context("could not create unix socket")?;
        let ret = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("could not connect to @{name}"));
        }
        Ok(Self { fd })
    }

    /// A connected pair, both ends non-blocking.
    pub fn pair() -> Result<(Self, Self)> {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error()).context("socketpair failed");
        }
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((Self { fd: a }, Self { fd: b }))
    }

    /// Non-blocking send of one message. Never raises SIGPIPE.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receives one message. The returned length is the size of the message
    /// on the wire, which exceeds `buf.len()` when it was truncated.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_TRUNC,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let tv = match timeout {
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error()).context("failed to set SO_RCVTIMEO");
        }
        Ok(())
    }
}

impl FrameSink for SeqPacket {
    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        self.send(frame)
    }
}

impl AsRawFd for SeqPacket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SeqPacket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
