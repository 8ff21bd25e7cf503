//! Generic netlink framing for both sides of the router.
//!
//! The kernel side speaks `mac80211_hwsim` notifications, the client side
//! speaks a small command set riding on the same `nlmsghdr` + `genlmsghdr` +
//! attribute layout. Every read is checked against the buffer it came from;
//! decoders return a sum type and never a partially filled struct.

use crate::mac::MacAddress;
use thiserror::Error;

pub const NLMSG_HDRLEN: usize = 16;
pub const GENL_HDRLEN: usize = 4;
pub const NLA_HDRLEN: usize = 4;
/// Smallest well-formed generic netlink message.
pub const MIN_GENL_LEN: usize = NLMSG_HDRLEN + GENL_HDRLEN;
pub const MAX_ATTR_PAYLOAD: usize = u16::MAX as usize - NLA_HDRLEN;
const NLA_TYPE_MASK: u16 = 0x3fff;

pub const NLMSG_ERROR: u16 = 2;
pub const NLM_F_REQUEST: u16 = 0x01;

pub const HWSIM_ATTR_ADDR_TRANSMITTER: u16 = 2;

pub const ROUTER_CMD_REGISTER: u8 = 0;
pub const ROUTER_CMD_NOTIFY: u8 = 1;
pub const ROUTER_ATTR_MAC: u16 = 0;
pub const ROUTER_ATTR_PACKET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message truncated: {received} bytes is below the 20 byte header")]
    Truncated { received: usize },
    #[error("declared length {declared} does not match {received} received bytes")]
    SizeMismatch { declared: usize, received: usize },
    #[error("malformed attribute section")]
    Malformed,
    #[error("attribute payload of {0} bytes exceeds the netlink attribute limit")]
    AttributeTooLarge(usize),
}

/// `struct nlmsghdr`, native endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NlHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
}

impl NlHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let h = buf.get(..NLMSG_HDRLEN)?;
        Some(Self {
            len: u32::from_ne_bytes([h[0], h[1], h[2], h[3]]),
            kind: u16::from_ne_bytes([h[4], h[5]]),
            flags: u16::from_ne_bytes([h[6], h[7]]),
            seq: u32::from_ne_bytes([h[8], h[9], h[10], h[11]]),
            port: u32::from_ne_bytes([h[12], h[13], h[14], h[15]]),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.kind.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.port.to_ne_bytes());
    }
}

/// Header of a client request; echoed back in the ack for correlation.
pub type RequestHeader = NlHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr<'a> {
    pub kind: u16,
    pub payload: &'a [u8],
}

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Splits an attribute section. Any header that does not fit, or a declared
/// length that runs past the section, fails the whole parse.
pub fn parse_attrs(mut buf: &[u8]) -> Result<Vec<Attr<'_>>, ProtocolError> {
    let mut attrs = Vec::new();
    while !buf.is_empty() {
        if buf.len() < NLA_HDRLEN {
            return Err(ProtocolError::Malformed);
        }
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let kind = u16::from_ne_bytes([buf[2], buf[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > buf.len() {
            return Err(ProtocolError::Malformed);
        }
        attrs.push(Attr {
            kind,
            payload: &buf[NLA_HDRLEN..len],
        });
        // trailing padding of the last attribute may be omitted
        buf = &buf[align4(len).min(buf.len())..];
    }
    Ok(attrs)
}

/// Later duplicates win, matching how the kernel fills its attribute table.
fn find_attr<'a>(attrs: &[Attr<'a>], kind: u16) -> Option<&'a [u8]> {
    attrs.iter().rev().find(|a| a.kind == kind).map(|a| a.payload)
}

struct GenlMessage<'a> {
    header: NlHeader,
    cmd: u8,
    attrs: &'a [u8],
}

/// Parses one generic netlink message that must span the buffer exactly.
fn parse_genl_exact(bytes: &[u8]) -> Result<GenlMessage<'_>, ProtocolError> {
    if bytes.len() < MIN_GENL_LEN {
        return Err(ProtocolError::Truncated {
            received: bytes.len(),
        });
    }
    let header = NlHeader::parse(bytes).ok_or(ProtocolError::Truncated {
        received: bytes.len(),
    })?;
    if header.len as usize != bytes.len() {
        return Err(ProtocolError::SizeMismatch {
            declared: header.len as usize,
            received: bytes.len(),
        });
    }
    Ok(GenlMessage {
        header,
        cmd: bytes[NLMSG_HDRLEN],
        attrs: &bytes[MIN_GENL_LEN..],
    })
}

struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(kind: u16, flags: u16, seq: u32, port: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        NlHeader {
            len: 0,
            kind,
            flags,
            seq,
            port,
        }
        .write(&mut buf);
        Self { buf }
    }

    fn genl(kind: u16, flags: u16, seq: u32, port: u32, cmd: u8, version: u8) -> Self {
        let mut b = Self::new(kind, flags, seq, port);
        b.buf.extend_from_slice(&[cmd, version, 0, 0]);
        b
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn attr(&mut self, kind: u16, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > MAX_ATTR_PAYLOAD {
            return Err(ProtocolError::AttributeTooLarge(payload.len()));
        }
        let len = (NLA_HDRLEN + payload.len()) as u16;
        self.buf.reserve(align4(len as usize));
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        let padded = align4(self.buf.len());
        self.buf.resize(padded, 0);
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// A hwsim frame the kernel handed to us, ready for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub transmitter: MacAddress,
    /// The whole datagram as received; forwarded verbatim.
    pub raw_frame: Vec<u8>,
}

pub fn decode_kernel_notification(bytes: &[u8], family: u16) -> Option<Notification> {
    let header = NlHeader::parse(bytes)?;
    if header.kind != family {
        return None;
    }
    let len = header.len as usize;
    if len < MIN_GENL_LEN || len > bytes.len() {
        return None;
    }
    let attrs = parse_attrs(&bytes[MIN_GENL_LEN..len]).ok()?;
    let transmitter =
        find_attr(&attrs, HWSIM_ATTR_ADDR_TRANSMITTER).and_then(MacAddress::from_slice)?;
    Some(Notification {
        transmitter,
        raw_frame: bytes.to_vec(),
    })
}

/// Largest message `encode_fanout_frame` can produce.
pub const MAX_FANOUT_LEN: usize =
    MIN_GENL_LEN + align4(NLA_HDRLEN + MacAddress::LEN) + align4(NLA_HDRLEN + MAX_ATTR_PAYLOAD);

pub fn encode_fanout_frame(mac: MacAddress, raw_frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut b = MessageBuilder::genl(0, 0, 0, 0, ROUTER_CMD_NOTIFY, 0);
    b.attr(ROUTER_ATTR_MAC, mac.as_bytes())?;
    b.attr(ROUTER_ATTR_PACKET, raw_frame)?;
    Ok(b.finish())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutFrame {
    pub mac: MacAddress,
    pub packet: Vec<u8>,
}

pub fn decode_fanout_frame(bytes: &[u8]) -> Result<FanoutFrame, ProtocolError> {
    let msg = parse_genl_exact(bytes)?;
    if msg.cmd != ROUTER_CMD_NOTIFY {
        return Err(ProtocolError::Malformed);
    }
    let attrs = parse_attrs(msg.attrs)?;
    let mac = find_attr(&attrs, ROUTER_ATTR_MAC)
        .and_then(MacAddress::from_slice)
        .ok_or(ProtocolError::Malformed)?;
    let packet = find_attr(&attrs, ROUTER_ATTR_PACKET).ok_or(ProtocolError::Malformed)?;
    Ok(FanoutFrame {
        mac,
        packet: packet.to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequest {
    Register { mac: MacAddress },
    /// `REGISTER` without a usable 6-byte MAC attribute.
    MissingMac,
    Unrecognized { command: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMessage {
    pub header: RequestHeader,
    pub request: ClientRequest,
}

pub fn decode_client_request(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let msg = parse_genl_exact(bytes)?;
    let request = match msg.cmd {
        ROUTER_CMD_REGISTER => {
            let attrs = parse_attrs(msg.attrs)?;
            match find_attr(&attrs, ROUTER_ATTR_MAC).and_then(MacAddress::from_slice) {
                Some(mac) => ClientRequest::Register { mac },
                None => ClientRequest::MissingMac,
            }
        }
        command => ClientRequest::Unrecognized { command },
    };
    Ok(ClientMessage {
        header: msg.header,
        request,
    })
}

pub fn encode_register_request(mac: MacAddress, seq: u32, port: u32) -> Vec<u8> {
    let mut b = MessageBuilder::genl(0, NLM_F_REQUEST, seq, port, ROUTER_CMD_REGISTER, 0);
    // six bytes always fit
    let _ = b.attr(ROUTER_ATTR_MAC, mac.as_bytes());
    b.finish()
}

/// `NLMSG_ERROR` carrying `result` and a copy of the request header.
pub fn encode_ack(result: i32, request: &RequestHeader) -> Vec<u8> {
    let mut b = MessageBuilder::new(NLMSG_ERROR, 0, request.seq, request.port);
    b.raw(&result.to_ne_bytes());
    request.write(&mut b.buf);
    b.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub seq: u32,
    pub port: u32,
    /// 0 on success, a negative errno otherwise.
    pub error: i32,
}

pub fn decode_ack(bytes: &[u8]) -> Option<Ack> {
    let header = NlHeader::parse(bytes)?;
    let len = header.len as usize;
    if header.kind != NLMSG_ERROR || len < NLMSG_HDRLEN + 4 || len > bytes.len() {
        return None;
    }
    let e = &bytes[NLMSG_HDRLEN..NLMSG_HDRLEN + 4];
    Some(Ack {
        seq: header.seq,
        port: header.port,
        error: i32::from_ne_bytes([e[0], e[1], e[2], e[3]]),
    })
}
