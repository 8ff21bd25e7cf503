use crate::socket::{SeqPacket, abstract_addr, seqpacket_socket};
use anyhow::{Context, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// The rendezvous socket clients connect to.
#[derive(Debug)]
pub struct ControlListener {
    fd: OwnedFd,
    name: String,
}

impl ControlListener {
    /// Binds `@name` in the abstract namespace and starts listening.
    pub fn bind(name: &str, backlog: i32) -> Result<Self> {
        let (addr, len) = abstract_addr(name)?;
        let fd = seqpacket_socket(libc::SOCK_NONBLOCK).context("could not create unix socket")?;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("could not bind unix socket @{name}"));
        }
        let ret = unsafe { libc::listen(fd.as_raw_fd(), backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("could not listen on @{name}"));
        }
        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accepts one pending connection as a non-blocking socket, or `None`
    /// when nothing is pending.
    pub fn accept(&self) -> io::Result<Option<SeqPacket>> {
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some(SeqPacket::from_owned(unsafe { OwnedFd::from_raw_fd(fd) })))
    }
}

impl AsRawFd for ControlListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("wifirouter-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn accept_without_pending_returns_none() {
        let listener = ControlListener::bind(&unique_name("idle"), 4).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn accepts_connected_client() {
        let name = unique_name("accept");
        let listener = ControlListener::bind(&name, 4).unwrap();
        assert_eq!(listener.name(), name);
        let client = SeqPacket::connect(&name).unwrap();
        let server = listener.accept().unwrap().unwrap();
        client.send(&[1, 2]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(server.recv(&mut buf).unwrap(), 2);
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn name_in_use_is_rejected() {
        let name = unique_name("busy");
        let _first = ControlListener::bind(&name, 4).unwrap();
        assert!(ControlListener::bind(&name, 4).is_err());
    }
}
