use anyhow::{Result, anyhow};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

pub const READABLE: u32 = libc::EPOLLIN as u32;
const HANGUP: u32 = (libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// One ready descriptor as reported by `epoll_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub flags: u32,
}

impl Readiness {
    pub fn is_readable(&self) -> bool {
        self.flags & READABLE != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.flags & HANGUP != 0
    }
}

/// Level-triggered epoll set keyed by descriptor.
pub struct Poller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret =
            unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Blocks until something is ready or `timeout_ms` passes (-1 waits
    /// forever). An interrupted wait yields no events.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<Vec<Readiness>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                i32::try_from(self.events.len()).map_err(|_| anyhow!("events len overflow"))?,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }
        Ok(self
            .events
            .iter()
            .take(n as usize)
            .map(|ev| Readiness {
                fd: ev.u64 as RawFd,
                flags: ev.events,
            })
            .collect())
    }
}

/// Non-blocking eventfd used to wake the event loop from other threads.
pub struct EventFd {
    fd: Arc<OwnedFd>,
}

impl EventFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            fd: Arc::clone(&self.fd),
        }
    }

    pub fn drain(&self) -> Result<()> {
        loop {
            let mut buf: u64 = 0;
            let ptr = &mut buf as *mut u64 as *mut libc::c_void;
            let n = unsafe { libc::read(self.fd.as_raw_fd(), ptr, std::mem::size_of::<u64>()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(err.into());
            }
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Clonable trigger that asks a running event loop to stop.
#[derive(Clone)]
pub struct ShutdownHandle {
    fd: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn signal(&self) -> Result<()> {
        let one: u64 = 1;
        let ptr = &one as *const u64 as *const libc::c_void;
        let n = unsafe { libc::write(self.fd.as_raw_fd(), ptr, std::mem::size_of::<u64>()) };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SeqPacket;
    use std::thread;

    #[test]
    fn idle_wait_times_out_empty() {
        let mut poller = Poller::new(8).unwrap();
        let (a, _b) = SeqPacket::pair().unwrap();
        poller.add(a.as_raw_fd(), READABLE).unwrap();
        assert!(poller.wait(10).unwrap().is_empty());
    }

    #[test]
    fn reports_readable_descriptor() {
        let mut poller = Poller::new(8).unwrap();
        let (a, b) = SeqPacket::pair().unwrap();
        poller.add(a.as_raw_fd(), READABLE).unwrap();
        b.send(&[1]).unwrap();
        let ready = poller.wait(1000).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, a.as_raw_fd());
        assert!(ready[0].is_readable());
        assert!(!ready[0].is_hangup());
    }

    #[test]
    fn deleted_descriptor_is_not_reported() {
        let mut poller = Poller::new(8).unwrap();
        let (a, b) = SeqPacket::pair().unwrap();
        poller.add(a.as_raw_fd(), READABLE).unwrap();
        poller.delete(a.as_raw_fd()).unwrap();
        b.send(&[1]).unwrap();
        assert!(poller.wait(10).unwrap().is_empty());
    }

    #[test]
    fn shutdown_handle_wakes_waiter_from_another_thread() {
        let mut poller = Poller::new(8).unwrap();
        let wake = EventFd::new().unwrap();
        poller.add(wake.as_raw_fd(), READABLE).unwrap();
        let handle = wake.handle();
        let t = thread::spawn(move || handle.signal().unwrap());
        let ready = poller.wait(5000).unwrap();
        t.join().unwrap();
        assert_eq!(ready[0].fd, wake.as_raw_fd());
        wake.drain().unwrap();
        assert!(poller.wait(10).unwrap().is_empty());
    }
}
