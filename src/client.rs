use crate::codec::{self, FanoutFrame};
use crate::mac::MacAddress;
use crate::socket::SeqPacket;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tracing::debug;

/// Client side of the control protocol, as a VM-side forwarder would use it.
pub struct RouterClient {
    conn: SeqPacket,
    port: u32,
    seq: u32,
    buf: Vec<u8>,
    /// Frames that arrived while waiting for an ack.
    pending: VecDeque<FanoutFrame>,
}

impl RouterClient {
    pub fn connect(socket_name: &str) -> Result<Self> {
        let conn = SeqPacket::connect(socket_name)?;
        Ok(Self {
            conn,
            port: std::process::id(),
            seq: 0,
            buf: vec![0u8; codec::MAX_FANOUT_LEN],
            pending: VecDeque::new(),
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.conn.set_read_timeout(timeout)
    }

    fn recv_message(&mut self) -> Result<&[u8]> {
        let n = loop {
            match self.conn.recv(&mut self.buf) {
                Ok(0) => bail!("router closed the connection"),
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("recv from router failed"),
            }
        };
        if n > self.buf.len() {
            bail!("message from router too large: {n} bytes");
        }
        Ok(&self.buf[..n])
    }

    /// Registers interest in `mac` and waits for the router's ack.
    pub fn register(&mut self, mac: MacAddress) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let port = self.port;
        let req = codec::encode_register_request(mac, seq, port);
        let n = self.conn.send(&req).context("send register failed")?;
        if n != req.len() {
            bail!("short register write {n}/{}", req.len());
        }
        loop {
            let msg = self.recv_message()?;
            if let Some(ack) = codec::decode_ack(msg) {
                if ack.seq != seq || ack.port != port {
                    debug!("skipping ack for seq={} port={}", ack.seq, ack.port);
                    continue;
                }
                if ack.error != 0 {
                    return Err(io::Error::from_raw_os_error(-ack.error))
                        .with_context(|| format!("router refused mac={mac}"));
                }
                return Ok(());
            }
            let frame = codec::decode_fanout_frame(msg)
                .map_err(|err| anyhow!("unexpected message while awaiting ack: {err}"))?;
            self.pending.push_back(frame);
        }
    }

    /// Blocks for the next delivered frame.
    pub fn recv_frame(&mut self) -> Result<FanoutFrame> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        let msg = self.recv_message()?;
        codec::decode_fanout_frame(msg).map_err(|err| anyhow!("bad frame from router: {err}"))
    }
}
