//! The kernel side: a generic netlink socket subscribed to `mac80211_hwsim`.
//!
//! Startup (family lookup, registration and its ack) goes through `neli`.
//! Once registered, the socket is read raw so every datagram can be
//! forwarded byte for byte.

use anyhow::{Context, Result, bail};
use neli::consts::{nl::NlmF, socket::NlFamily};
use neli::genl::{Genlmsghdr, GenlmsghdrBuilder, NoUserHeader};
use neli::nl::{NlPayload, Nlmsghdr, NlmsghdrBuilder};
use neli::router::synchronous::NlRouter;
use neli::socket::synchronous::NlSocketHandle;
use neli::utils::Groups;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, info};

const HWSIM_GENL_VERSION: u8 = 0;
/// Replies are expected within the first few datagrams.
const MAX_REPLY_DATAGRAMS: usize = 32;

#[neli::neli_enum(serialized_type = "u8")]
pub enum HwsimCmd {
    Unspec = 0,
    Register = 1,
    Frame = 2,
    TxInfoFrame = 3,
}

impl neli::consts::genl::Cmd for HwsimCmd {}

#[neli::neli_enum(serialized_type = "u16")]
pub enum HwsimAttr {
    Unspec = 0,
    AddrReceiver = 1,
    AddrTransmitter = 2,
    Frame = 3,
}

impl neli::consts::genl::NlAttrType for HwsimAttr {}

type HwsimMsg = Nlmsghdr<u16, Genlmsghdr<HwsimCmd, HwsimAttr>>;

/// Source of kernel datagrams for the event loop.
pub trait KernelSource: AsRawFd {
    /// Receives one datagram. The returned length is the size on the wire and
    /// exceeds `buf.len()` when the datagram was truncated.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Resolves a generic netlink family name to its numeric id.
pub fn resolve_family(name: &str) -> Result<u16> {
    let (router, _) = NlRouter::connect(NlFamily::Generic, Some(0), Groups::empty())
        .context("could not connect to netlink generic")?;
    let id = router.resolve_genl_family(name).with_context(|| {
        format!("could not find {name}; make sure module 'mac80211_hwsim' is loaded")
    })?;
    info!("resolved genl family {name} id={id}");
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ack,
    Refused(i32),
    Other,
}

/// What the startup code needs to know about one kernel reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reply {
    seq: u32,
    port: u32,
    outcome: Outcome,
}

impl Reply {
    fn from_msg(msg: &HwsimMsg) -> Self {
        let outcome = match msg.nl_payload() {
            NlPayload::Ack(_) => Outcome::Ack,
            NlPayload::Err(err) => Outcome::Refused(*err.error()),
            _ => Outcome::Other,
        };
        Self {
            seq: *msg.nl_seq(),
            port: *msg.nl_pid(),
            outcome,
        }
    }
}

/// Consumes replies until the ack for `seq` on `port`. Replies to other
/// requests are skipped; an error ack for this one fails the wait.
fn await_ack(replies: impl IntoIterator<Item = Result<Reply>>, seq: u32, port: u32) -> Result<()> {
    for reply in replies {
        let reply = reply?;
        if reply.seq != seq || reply.port != port {
            debug!(
                "skipping netlink reply seq={} port={}",
                reply.seq, reply.port
            );
            continue;
        }
        match reply.outcome {
            Outcome::Ack => return Ok(()),
            Outcome::Refused(errno) => {
                return Err(io::Error::from_raw_os_error(errno.abs()))
                    .context("kernel refused request");
            }
            Outcome::Other => {}
        }
    }
    bail!("no reply from kernel")
}

pub struct NetlinkSocket {
    sock: NlSocketHandle,
    port: u32,
    seq: u32,
}

impl NetlinkSocket {
    pub fn connect() -> Result<Self> {
        let sock = NlSocketHandle::connect(NlFamily::Generic, Some(0), Groups::empty())
            .context("could not connect to netlink generic")?;
        let port = local_port(sock.as_raw_fd()).context("getsockname on netlink socket")?;
        debug!("netlink socket bound port={port}");
        Ok(Self { sock, port, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn recv_replies(&self) -> Result<Vec<Reply>> {
        let (msgs, _) = self
            .sock
            .recv::<u16, Genlmsghdr<HwsimCmd, HwsimAttr>>()
            .context("netlink recv failed")?;
        let mut replies = Vec::new();
        for msg in msgs {
            let msg = msg.context("could not parse netlink reply")?;
            replies.push(Reply::from_msg(&msg));
        }
        Ok(replies)
    }

    fn replies(&self) -> impl Iterator<Item = Result<Reply>> + '_ {
        let mut queued = VecDeque::new();
        let mut datagrams = 0;
        std::iter::from_fn(move || {
            loop {
                if let Some(reply) = queued.pop_front() {
                    return Some(Ok(reply));
                }
                if datagrams == MAX_REPLY_DATAGRAMS {
                    return None;
                }
                datagrams += 1;
                match self.recv_replies() {
                    Ok(batch) => queued.extend(batch),
                    Err(err) => return Some(Err(err)),
                }
            }
        })
    }

    /// Asks hwsim to deliver radio frames to this socket.
    pub fn register_for_notifications(&mut self, family: u16) -> Result<()> {
        let seq = self.next_seq();
        let genl = GenlmsghdrBuilder::<HwsimCmd, HwsimAttr, NoUserHeader>::default()
            .cmd(HwsimCmd::Register)
            .version(HWSIM_GENL_VERSION)
            .build()
            .context("could not build hwsim register")?;
        let msg = NlmsghdrBuilder::default()
            .nl_type(family)
            .nl_flags(NlmF::REQUEST | NlmF::ACK)
            .nl_seq(seq)
            .nl_pid(self.port)
            .nl_payload(NlPayload::Payload(genl))
            .build()
            .context("could not build hwsim register")?;
        self.sock.send(&msg).context("netlink send failed")?;
        await_ack(self.replies(), seq, self.port)
            .context("could not register for hwsim notifications")?;
        info!("registered for hwsim notifications family={family}");
        Ok(())
    }
}

fn local_port(fd: RawFd) -> io::Result<u32> {
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr.nl_pid)
}

impl KernelSource for NetlinkSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.sock.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
