use crate::codec::{self, Notification};
use crate::registry::{ClientId, ClientRegistry};
use std::io;
use tracing::{debug, warn};

/// Anything a fan-out frame can be written to in one non-blocking call.
pub trait FrameSink {
    /// Sends `frame` as a single message, returning the bytes accepted.
    fn send_frame(&self, frame: &[u8]) -> io::Result<usize>;
}

/// Result of routing one notification.
pub struct RouteReport<C> {
    pub subscribers: usize,
    pub delivered: usize,
    /// Subscribers whose delivery failed; already removed from the registry.
    pub dropped: Vec<(ClientId, C)>,
}

impl<C> Default for RouteReport<C> {
    fn default() -> Self {
        Self {
            subscribers: 0,
            delivered: 0,
            dropped: Vec::new(),
        }
    }
}

/// Delivers `notification` to every subscriber of its transmitter.
///
/// A short write or an error fails that subscriber; it is not retried. Failed
/// subscribers are removed only after every delivery has been attempted.
pub fn route<C: FrameSink>(
    notification: &Notification,
    registry: &mut ClientRegistry<C>,
) -> RouteReport<C> {
    let mac = notification.transmitter;
    let targets = registry.subscribers_for(&mac);
    if targets.is_empty() {
        debug!("no subscribers for mac={mac}");
        return RouteReport::default();
    }

    let frame = match codec::encode_fanout_frame(mac, &notification.raw_frame) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropped frame from mac={mac}: {err}");
            return RouteReport {
                subscribers: targets.len(),
                ..RouteReport::default()
            };
        }
    };

    let mut delivered = 0usize;
    let mut failed: Vec<ClientId> = Vec::new();
    for id in &targets {
        let Some(conn) = registry.get(*id) else {
            continue;
        };
        match conn.send_frame(&frame) {
            Ok(n) if n == frame.len() => delivered += 1,
            Ok(n) => {
                warn!(
                    "short write to client fd={id} mac={mac} wrote={n} len={}",
                    frame.len()
                );
                failed.push(*id);
            }
            Err(err) => {
                warn!("delivery to client fd={id} mac={mac} failed: {err}");
                failed.push(*id);
            }
        }
    }

    let dropped = failed
        .into_iter()
        .filter_map(|id| registry.remove(id).map(|conn| (id, conn)))
        .collect();
    debug!(
        "routed frame from mac={mac} len={} subscribers={} delivered={delivered}",
        notification.raw_frame.len(),
        targets.len()
    );
    RouteReport {
        subscribers: targets.len(),
        delivered,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_fanout_frame;
    use crate::mac::MacAddress;
    use std::cell::RefCell;

    const M: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const M2: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x02]);

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum Mode {
        Ok,
        Short,
        Fail,
    }

    struct FakeConn {
        mode: Mode,
        sent: RefCell<Vec<Vec<u8>>>,
    }

    impl FakeConn {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl FrameSink for FakeConn {
        fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
            match self.mode {
                Mode::Ok => {
                    self.sent.borrow_mut().push(frame.to_vec());
                    Ok(frame.len())
                }
                Mode::Short => Ok(frame.len() / 2),
                Mode::Fail => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    fn notification(mac: MacAddress, raw: &[u8]) -> Notification {
        Notification {
            transmitter: mac,
            raw_frame: raw.to_vec(),
        }
    }

    fn sent(reg: &ClientRegistry<FakeConn>, id: i32) -> Vec<Vec<u8>> {
        reg.get(ClientId(id)).unwrap().sent.borrow().clone()
    }

    #[test]
    fn registered_client_gets_exactly_one_frame() {
        let mut reg = ClientRegistry::new();
        reg.add(ClientId(1), FakeConn::new(Mode::Ok));
        reg.register(M, ClientId(1));

        let report = route(&notification(M, &[1, 2, 3]), &mut reg);
        assert_eq!((report.subscribers, report.delivered), (1, 1));
        let frames = sent(&reg, 1);
        assert_eq!(frames.len(), 1);
        let frame = decode_fanout_frame(&frames[0]).unwrap();
        assert_eq!(frame.mac, M);
        assert_eq!(frame.packet, vec![1, 2, 3]);
    }

    #[test]
    fn fanout_reaches_only_matching_subscribers() {
        let mut reg = ClientRegistry::new();
        for fd in 1..=3 {
            reg.add(ClientId(fd), FakeConn::new(Mode::Ok));
        }
        reg.register(M, ClientId(1));
        reg.register(M, ClientId(2));
        reg.register(M2, ClientId(3));

        let report = route(&notification(M, &[7]), &mut reg);
        assert_eq!(report.delivered, 2);
        assert_eq!(sent(&reg, 1).len(), 1);
        assert_eq!(sent(&reg, 2).len(), 1);
        assert!(sent(&reg, 3).is_empty());
    }

    #[test]
    fn failed_subscriber_is_removed_and_others_still_served() {
        let mut reg = ClientRegistry::new();
        reg.add(ClientId(1), FakeConn::new(Mode::Short));
        reg.add(ClientId(2), FakeConn::new(Mode::Ok));
        reg.add(ClientId(3), FakeConn::new(Mode::Fail));
        for fd in 1..=3 {
            reg.register(M, ClientId(fd));
        }
        reg.register(M2, ClientId(1));

        let report = route(&notification(M, &[1]), &mut reg);
        assert_eq!(report.delivered, 1);
        let mut dropped: Vec<ClientId> = report.dropped.iter().map(|(id, _)| *id).collect();
        dropped.sort();
        assert_eq!(dropped, vec![ClientId(1), ClientId(3)]);
        assert!(!reg.contains(ClientId(1)));
        assert!(reg.subscribers_for(&M2).is_empty());
        assert_eq!(reg.subscribers_for(&M), vec![ClientId(2)]);

        let report = route(&notification(M, &[2]), &mut reg);
        assert_eq!(report.subscribers, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(sent(&reg, 2).len(), 2);
    }

    #[test]
    fn unsubscribed_mac_is_a_no_op() {
        let mut reg: ClientRegistry<FakeConn> = ClientRegistry::new();
        reg.add(ClientId(1), FakeConn::new(Mode::Ok));
        let report = route(&notification(M, &[1]), &mut reg);
        assert_eq!(report.subscribers, 0);
        assert!(sent(&reg, 1).is_empty());
    }
}
