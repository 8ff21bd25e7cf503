use crate::codec::{self, ClientRequest};
use crate::config::RouterConfig;
use crate::listener::ControlListener;
use crate::netlink::KernelSource;
use crate::poller::{EventFd, Poller, READABLE, Readiness, ShutdownHandle};
use crate::registry::{ClientId, ClientRegistry};
use crate::router::{self, FrameSink};
use crate::socket::SeqPacket;
use anyhow::{Context, Result};
use std::io;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MAX_EVENTS: usize = 256;
/// How long the listener stays out of the poll set after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const ACCEPT_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    /// Numeric id of the hwsim generic netlink family.
    pub family: u16,
    pub max_client_message: usize,
    pub kernel_buffer: usize,
}

impl LoopOptions {
    pub fn new(family: u16, cfg: &RouterConfig) -> Self {
        Self {
            family,
            max_client_message: cfg.max_client_message,
            kernel_buffer: cfg.kernel_buffer,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub accepted: u64,
    pub removed: u64,
    pub notifications: u64,
    pub ignored_notifications: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub protocol_errors: u64,
    pub accept_errors: u64,
}

/// Single-threaded readiness loop over the kernel channel, the control
/// listener and every connected client. It is the only writer of the
/// client registry.
pub struct EventLoop<K> {
    poller: Poller,
    listener: ControlListener,
    kernel: K,
    wake: EventFd,
    family: u16,
    registry: ClientRegistry<SeqPacket>,
    kernel_buf: Vec<u8>,
    client_buf: Vec<u8>,
    stats: RouterStats,
    accept_paused_until: Option<Instant>,
    last_accept_log: Option<Instant>,
}

impl<K: KernelSource> EventLoop<K> {
    pub fn new(listener: ControlListener, kernel: K, opts: LoopOptions) -> Result<Self> {
        let poller = Poller::new(MAX_EVENTS)?;
        let wake = EventFd::new().context("failed to create shutdown eventfd")?;
        poller
            .add(listener.as_raw_fd(), READABLE)
            .context("failed to watch control listener")?;
        poller
            .add(kernel.as_raw_fd(), READABLE)
            .context("failed to watch netlink socket")?;
        poller
            .add(wake.as_raw_fd(), READABLE)
            .context("failed to watch shutdown eventfd")?;
        Ok(Self {
            poller,
            listener,
            kernel,
            wake,
            family: opts.family,
            registry: ClientRegistry::new(),
            kernel_buf: vec![0u8; opts.kernel_buffer],
            client_buf: vec![0u8; opts.max_client_message],
            stats: RouterStats::default(),
            accept_paused_until: None,
            last_accept_log: None,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.wake.handle()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn registry(&self) -> &ClientRegistry<SeqPacket> {
        &self.registry
    }

    /// Runs until the shutdown handle fires, then closes every client.
    pub fn run(&mut self) -> Result<()> {
        info!("routing on @{}", self.listener.name());
        while self.poll_once(-1)? {}
        for (id, conn) in self.registry.drain() {
            self.retire(id, conn, "shutting down");
        }
        let s = self.stats;
        info!(
            "router stopped accepted={} removed={} notifications={} ignored={} deliveries={} failed_deliveries={} protocol_errors={} accept_errors={}",
            s.accepted,
            s.removed,
            s.notifications,
            s.ignored_notifications,
            s.deliveries,
            s.failed_deliveries,
            s.protocol_errors,
            s.accept_errors
        );
        Ok(())
    }

    /// One loop iteration. Returns false once shutdown was requested.
    pub fn poll_once(&mut self, timeout_ms: i32) -> Result<bool> {
        self.resume_accept()?;
        let ready = self.poller.wait(self.bounded_timeout(timeout_ms))?;

        let mut listener_ready = false;
        let mut kernel_ready = false;
        let mut clients: Vec<Readiness> = Vec::new();
        for ev in ready {
            if ev.fd == self.wake.as_raw_fd() {
                self.wake.drain()?;
                info!("shutdown requested");
                return Ok(false);
            } else if ev.fd == self.listener.as_raw_fd() {
                listener_ready = true;
            } else if ev.fd == self.kernel.as_raw_fd() {
                kernel_ready = true;
            } else {
                clients.push(ev);
            }
        }

        if listener_ready {
            self.accept_clients();
        }
        if kernel_ready {
            self.handle_kernel();
        }
        for ev in clients {
            let id = ClientId(ev.fd);
            // may have been dropped by fan-out above
            if !self.registry.contains(id) {
                continue;
            }
            if ev.is_readable() {
                self.handle_client(id);
            } else if ev.is_hangup() {
                self.remove_client(id, "hang up");
            }
        }
        Ok(true)
    }

    /// Shortens `timeout_ms` so a paused listener is resumed on time.
    fn bounded_timeout(&self, timeout_ms: i32) -> i32 {
        let Some(until) = self.accept_paused_until else {
            return timeout_ms;
        };
        let left = until.saturating_duration_since(Instant::now()).as_millis() as i32 + 1;
        if timeout_ms < 0 {
            left
        } else {
            timeout_ms.min(left)
        }
    }

    fn resume_accept(&mut self) -> Result<()> {
        if let Some(until) = self.accept_paused_until
            && Instant::now() >= until
        {
            self.poller
                .add(self.listener.as_raw_fd(), READABLE)
                .context("failed to watch control listener")?;
            self.accept_paused_until = None;
            debug!("accepting clients again");
        }
        Ok(())
    }

    /// The listener is level-triggered, so an accept that keeps failing
    /// (descriptor exhaustion) would spin. Take it out of the poll set for
    /// a while instead.
    fn pause_accept(&mut self, err: io::Error) {
        self.stats.accept_errors += 1;
        let now = Instant::now();
        if self
            .last_accept_log
            .is_none_or(|last| now.duration_since(last) >= ACCEPT_LOG_INTERVAL)
        {
            error!(
                "could not accept client on @{}: {err} failures={}",
                self.listener.name(),
                self.stats.accept_errors
            );
            self.last_accept_log = Some(now);
        }
        if self.accept_paused_until.is_some() {
            return;
        }
        match self.poller.delete(self.listener.as_raw_fd()) {
            Ok(()) => self.accept_paused_until = Some(now + ACCEPT_BACKOFF),
            Err(err) => debug!("could not pause control listener: {err:#}"),
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let conn = match self.listener.accept() {
                Ok(Some(conn)) => conn,
                Ok(None) => return,
                Err(err) => {
                    self.pause_accept(err);
                    return;
                }
            };
            let id = ClientId(conn.as_raw_fd());
            if let Err(err) = self.poller.add(id.0, READABLE) {
                warn!("could not watch client fd={id}: {err:#}");
                continue;
            }
            self.registry.add(id, conn);
            self.stats.accepted += 1;
            info!("client fd={id} added");
        }
    }

    fn handle_kernel(&mut self) {
        let n = match self.kernel.recv_datagram(&mut self.kernel_buf) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("netlink receive buffer overrun, frames were lost");
                return;
            }
            Err(err) => {
                error!("could not read from netlink: {err}");
                return;
            }
        };
        if n > self.kernel_buf.len() {
            warn!(
                "discarded oversized netlink datagram len={n} cap={}",
                self.kernel_buf.len()
            );
            self.stats.ignored_notifications += 1;
            return;
        }

        let Some(notification) = codec::decode_kernel_notification(&self.kernel_buf[..n], self.family)
        else {
            debug!("ignored netlink message len={n}");
            self.stats.ignored_notifications += 1;
            return;
        };
        self.stats.notifications += 1;
        debug!(
            "received netlink packet from mac={} len={n}",
            notification.transmitter
        );

        let report = router::route(&notification, &mut self.registry);
        self.stats.deliveries += report.delivered as u64;
        self.stats.failed_deliveries += report.dropped.len() as u64;
        for (id, conn) in report.dropped {
            self.retire(id, conn, "delivery failed");
        }
    }

    fn handle_client(&mut self, id: ClientId) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        let n = match conn.recv(&mut self.client_buf) {
            Ok(0) => {
                self.remove_client(id, "end of stream");
                return;
            }
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(err) => {
                self.remove_client(id, &format!("recv failed: {err}"));
                return;
            }
        };
        if n > self.client_buf.len() {
            self.stats.protocol_errors += 1;
            self.remove_client(
                id,
                &format!("oversized message len={n} cap={}", self.client_buf.len()),
            );
            return;
        }

        let msg = match codec::decode_client_request(&self.client_buf[..n]) {
            Ok(msg) => msg,
            Err(err) => {
                self.stats.protocol_errors += 1;
                self.remove_client(id, &format!("protocol violation: {err}"));
                return;
            }
        };

        let result = match msg.request {
            ClientRequest::Register { mac } => {
                self.registry.register(mac, id);
                info!("client fd={id} registered mac={mac}");
                0
            }
            ClientRequest::MissingMac => {
                warn!("client fd={id} sent register without a valid mac");
                -libc::EINVAL
            }
            ClientRequest::Unrecognized { command } => {
                warn!("client fd={id} sent unsupported command={command}");
                -libc::EINVAL
            }
        };

        let ack = codec::encode_ack(result, &msg.header);
        let sent = self.registry.get(id).map(|conn| conn.send_frame(&ack));
        match sent {
            Some(Ok(n)) if n == ack.len() => {}
            Some(Ok(n)) => self.remove_client(id, &format!("short ack write {n}/{}", ack.len())),
            Some(Err(err)) => self.remove_client(id, &format!("ack failed: {err}")),
            None => {}
        }
    }

    fn remove_client(&mut self, id: ClientId, reason: &str) {
        if let Some(conn) = self.registry.remove(id) {
            self.retire(id, conn, reason);
        }
    }

    /// Stops watching and closes a connection already taken out of the
    /// registry.
    fn retire(&mut self, id: ClientId, conn: SeqPacket, reason: &str) {
        if let Err(err) = self.poller.delete(conn.as_raw_fd()) {
            debug!("epoll delete for client fd={id} failed: {err:#}");
        }
        drop(conn);
        self.stats.removed += 1;
        info!("client fd={id} removed: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{FAMILY, kernel_frame};
    use crate::codec::{Ack, decode_ack, decode_fanout_frame, encode_register_request};
    use crate::mac::MacAddress;
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MAC: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    /// One end of a socketpair standing in for the netlink socket.
    struct FakeKernel(SeqPacket);

    impl AsRawFd for FakeKernel {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl KernelSource for FakeKernel {
        fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.recv(buf)
        }
    }

    fn setup() -> (EventLoop<FakeKernel>, SeqPacket, String) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let name = format!(
            "wifirouter-loop-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let listener = ControlListener::bind(&name, 4).unwrap();
        let (kernel, kernel_peer) = SeqPacket::pair().unwrap();
        let opts = LoopOptions {
            family: FAMILY,
            max_client_message: 4096,
            kernel_buffer: 16 * 1024,
        };
        let ev = EventLoop::new(listener, FakeKernel(kernel), opts).unwrap();
        (ev, kernel_peer, name)
    }

    fn connect(ev: &mut EventLoop<FakeKernel>, name: &str) -> SeqPacket {
        let client = SeqPacket::connect(name).unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let before = ev.registry().len();
        while ev.registry().len() == before {
            assert!(ev.poll_once(1000).unwrap());
        }
        client
    }

    fn recv(client: &SeqPacket) -> Vec<u8> {
        let mut buf = vec![0u8; 8192];
        let n = client.recv(&mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn register_is_acked_and_subscribed() {
        let (mut ev, _kernel, name) = setup();
        let client = connect(&mut ev, &name);
        client.send(&encode_register_request(MAC, 42, 7)).unwrap();
        ev.poll_once(1000).unwrap();
        assert_eq!(
            decode_ack(&recv(&client)),
            Some(Ack {
                seq: 42,
                port: 7,
                error: 0
            })
        );
        assert_eq!(ev.registry().subscribers_for(&MAC).len(), 1);
    }

    #[test]
    fn unsupported_command_is_nacked_without_disconnect() {
        let (mut ev, _kernel, name) = setup();
        let client = connect(&mut ev, &name);
        let mut req = encode_register_request(MAC, 1, 1);
        req[codec::NLMSG_HDRLEN] = 0x7f;
        client.send(&req).unwrap();
        ev.poll_once(1000).unwrap();
        let ack = decode_ack(&recv(&client)).unwrap();
        assert_eq!(ack.error, -libc::EINVAL);
        assert_eq!(ev.registry().len(), 1);
        assert_eq!(ev.stats().removed, 0);
    }

    #[test]
    fn malformed_message_disconnects() {
        let (mut ev, _kernel, name) = setup();
        let client = connect(&mut ev, &name);
        let mut req = encode_register_request(MAC, 1, 1);
        req.push(0);
        client.send(&req).unwrap();
        ev.poll_once(1000).unwrap();
        assert!(ev.registry().is_empty());
        assert_eq!(ev.stats().protocol_errors, 1);
        assert_eq!(recv(&client).len(), 0);
    }

    #[test]
    fn oversized_message_disconnects() {
        let (mut ev, _kernel, name) = setup();
        let client = connect(&mut ev, &name);
        client.send(&vec![0u8; 5000]).unwrap();
        ev.poll_once(1000).unwrap();
        assert!(ev.registry().is_empty());
    }

    #[test]
    fn hangup_removes_client_and_subscriptions() {
        let (mut ev, _kernel, name) = setup();
        let client = connect(&mut ev, &name);
        client.send(&encode_register_request(MAC, 1, 1)).unwrap();
        ev.poll_once(1000).unwrap();
        drop(client);
        ev.poll_once(1000).unwrap();
        assert!(ev.registry().is_empty());
        assert!(ev.registry().subscribers_for(&MAC).is_empty());
        assert_eq!(ev.stats().removed, 1);
    }

    #[test]
    fn kernel_frame_is_fanned_out() {
        let (mut ev, kernel, name) = setup();
        let client = connect(&mut ev, &name);
        client.send(&encode_register_request(MAC, 1, 1)).unwrap();
        ev.poll_once(1000).unwrap();
        recv(&client);

        let datagram = kernel_frame(FAMILY, Some(&MAC.octets()), &[1, 2, 3]);
        kernel.send(&datagram).unwrap();
        ev.poll_once(1000).unwrap();
        let frame = decode_fanout_frame(&recv(&client)).unwrap();
        assert_eq!(frame.mac, MAC);
        assert_eq!(frame.packet, datagram);
        assert_eq!(ev.stats().deliveries, 1);
    }

    #[test]
    fn foreign_kernel_messages_are_ignored() {
        let (mut ev, kernel, name) = setup();
        let _client = connect(&mut ev, &name);
        kernel
            .send(&kernel_frame(FAMILY + 1, Some(&MAC.octets()), &[1]))
            .unwrap();
        kernel.send(&[1, 2, 3]).unwrap();
        ev.poll_once(1000).unwrap();
        ev.poll_once(1000).unwrap();
        assert_eq!(ev.stats().ignored_notifications, 2);
        assert_eq!(ev.registry().len(), 1);
    }

    #[test]
    fn client_that_stops_reading_acks_is_removed() {
        let (mut ev, _kernel, name) = setup();
        let client = connect(&mut ev, &name);
        let req = encode_register_request(MAC, 1, 1);
        let mut rounds = 0;
        // acks pile up unread until the router's send would block
        while !ev.registry().is_empty() {
            assert!(rounds < 100_000, "ack queue never filled");
            client.send(&req).unwrap();
            ev.poll_once(1000).unwrap();
            rounds += 1;
        }
        assert!(rounds > 1);
        assert_eq!(ev.stats().removed, 1);
        assert_eq!(ev.stats().protocol_errors, 0);
        assert!(ev.registry().subscribers_for(&MAC).is_empty());
    }

    #[test]
    fn accept_failure_pauses_listener_then_resumes() {
        let (mut ev, _kernel, name) = setup();
        ev.pause_accept(io::Error::from_raw_os_error(libc::EMFILE));
        ev.pause_accept(io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(ev.stats().accept_errors, 2);

        let _client = SeqPacket::connect(&name).unwrap();
        assert!(ev.poll_once(0).unwrap());
        assert!(ev.registry().is_empty());

        std::thread::sleep(ACCEPT_BACKOFF);
        assert!(ev.poll_once(1000).unwrap());
        assert_eq!(ev.registry().len(), 1);
        assert!(ev.accept_paused_until.is_none());
    }

    #[test]
    fn shutdown_handle_stops_run() {
        let (mut ev, _kernel, name) = setup();
        let _client = connect(&mut ev, &name);
        ev.shutdown_handle().signal().unwrap();
        ev.run().unwrap();
        assert!(ev.registry().is_empty());
        assert_eq!(ev.stats().removed, 1);
    }
}
