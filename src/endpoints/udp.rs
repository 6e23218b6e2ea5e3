//! UDP endpoint for MAVLink communications.
//!
//! Two modes are supported:
//!
//! - **client**: binds an ephemeral port and sends every frame to the
//!   configured address. Anything arriving on the socket is accepted.
//! - **server** (eavesdropping): binds the configured address and answers
//!   whichever peer sent the most recent datagram. Until a peer shows up
//!   there is nobody to send to, and frames are discarded.
//!
//! A datagram may carry several frames; they are returned one by one.
//! Datagrams the socket refuses with `WouldBlock` are queued (bounded) and
//! retried on write-readiness.

use crate::config::UdpMode;
use crate::endpoint_core::{Endpoint, FlushStatus, StreamCore, WriteStatus};
use crate::error::{Result, RouterError};
use crate::framing::MavlinkFrame;
use crate::stats::EndpointStats;
use bytes::Bytes;
use mio::event::Source;
use mio::net::UdpSocket;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, info};

/// Maximum number of datagrams queued while the socket would block.
pub const UDP_QUEUE_MAX: usize = 64;

const MAX_DATAGRAM: usize = 65535;

pub struct UdpEndpoint {
    name: String,
    socket: UdpSocket,
    mode: UdpMode,
    /// Where frames go: the configured address (client) or the last peer
    /// heard from (server).
    peer: Option<SocketAddr>,
    core: StreamCore,
    queue: VecDeque<(Bytes, SocketAddr)>,
    rx_buf: Box<[u8]>,
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| RouterError::network(address, e))?
        .next()
        .ok_or_else(|| RouterError::config(format!("could not resolve address {address}")))
}

impl UdpEndpoint {
    /// Creates the socket for `address` in the given mode.
    pub fn open(address: &str, mode: UdpMode) -> Result<Self> {
        let addr = resolve(address)?;
        let (bind_addr, peer) = match mode {
            UdpMode::Server => (addr, None),
            UdpMode::Client => {
                let any: SocketAddr = if addr.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                (any, Some(addr))
            }
        };

        let socket = UdpSocket::bind(bind_addr).map_err(|e| RouterError::network(address, e))?;
        info!(
            "UDP endpoint {} ({:?}) bound to {}",
            address,
            mode,
            socket.local_addr().map_err(|e| RouterError::network(address, e))?
        );

        Ok(Self {
            name: format!("UDP {address}"),
            socket,
            mode,
            peer,
            core: StreamCore::new(),
            queue: VecDeque::with_capacity(UDP_QUEUE_MAX),
            rx_buf: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn enqueue(&mut self, data: Bytes, dest: SocketAddr) -> WriteStatus {
        if self.queue.len() >= UDP_QUEUE_MAX {
            self.core.stats.record_drop();
        } else {
            self.core.stats.record_write(data.len());
            self.queue.push_back((data, dest));
        }
        WriteStatus::WouldBlock
    }
}

impl Endpoint for UdpEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_msg(&mut self) -> io::Result<Option<MavlinkFrame>> {
        loop {
            if let Some(frame) = self.core.parser.parse_next() {
                self.core.learn(&frame);
                return Ok(Some(frame));
            }

            match self.socket.recv_from(&mut self.rx_buf) {
                Ok((n, from)) => {
                    if self.mode == UdpMode::Server && self.peer != Some(from) {
                        debug!("UDP {} now answering {}", self.name, from);
                        self.peer = Some(from);
                    }
                    // A datagram never continues a frame from another one.
                    self.core.parser.clear();
                    self.core.parser.push(&self.rx_buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn write_msg(&mut self, frame: &MavlinkFrame) -> io::Result<WriteStatus> {
        let Some(dest) = self.peer else {
            return Ok(WriteStatus::Written(0));
        };

        if !self.queue.is_empty() {
            return Ok(self.enqueue(frame.raw_bytes.clone(), dest));
        }

        match self.socket.send_to(&frame.raw_bytes, dest) {
            Ok(n) => {
                self.core.stats.record_write(n);
                Ok(WriteStatus::Written(n))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Ok(self.enqueue(frame.raw_bytes.clone(), dest))
            }
            Err(e) => Err(e),
        }
    }

    fn flush_pending_msgs(&mut self) -> io::Result<FlushStatus> {
        while let Some((data, dest)) = self.queue.front() {
            match self.socket.send_to(data, *dest) {
                Ok(_) => {
                    self.queue.pop_front();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FlushStatus::WouldBlock),
                Err(e) => {
                    // The datagram is lost either way.
                    self.queue.pop_front();
                    return Err(e);
                }
            }
        }
        Ok(FlushStatus::Drained)
    }

    fn system_id(&self) -> u8 {
        self.core.system_id()
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(&mut self.socket)
    }

    fn stats(&self) -> &EndpointStats {
        &self.core.stats
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use mavlink::common::{MavMessage, HEARTBEAT_DATA};
    use mavlink::MavHeader;
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread::sleep;
    use std::time::Duration;

    fn heartbeat(system_id: u8) -> MavlinkFrame {
        let header = MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        };
        MavlinkFrame::encode_v2(header, MavMessage::HEARTBEAT(HEARTBEAT_DATA::default()))
            .expect("encode")
    }

    fn read_eventually(ep: &mut UdpEndpoint) -> Option<MavlinkFrame> {
        for _ in 0..100 {
            if let Some(frame) = ep.read_msg().expect("read") {
                return Some(frame);
            }
            sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_server_discards_until_peer_known() {
        let mut server = UdpEndpoint::open("127.0.0.1:0", UdpMode::Server).expect("server");
        assert_eq!(
            server.write_msg(&heartbeat(1)).expect("write"),
            WriteStatus::Written(0)
        );
        assert!(server.peer().is_none());
    }

    #[test]
    fn test_server_answers_last_peer() {
        let mut server = UdpEndpoint::open("127.0.0.1:0", UdpMode::Server).expect("server");
        let addr = server.local_addr().expect("addr");

        let gcs = StdUdpSocket::bind("127.0.0.1:0").expect("gcs");
        gcs.set_read_timeout(Some(Duration::from_secs(1))).expect("timeout");
        let hb = heartbeat(255);
        gcs.send_to(&hb.raw_bytes, addr).expect("send");

        let frame = read_eventually(&mut server).expect("frame");
        assert_eq!(frame.header.system_id, 255);
        assert_eq!(server.system_id(), 255);
        assert_eq!(server.peer(), Some(gcs.local_addr().expect("gcs addr")));

        let reply = heartbeat(1);
        server.write_msg(&reply).expect("reply");
        let mut buf = [0u8; 512];
        let (n, _) = gcs.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], &reply.raw_bytes[..]);
    }

    #[test]
    fn test_client_sends_to_configured_address() {
        let gcs = StdUdpSocket::bind("127.0.0.1:0").expect("gcs");
        gcs.set_read_timeout(Some(Duration::from_secs(1))).expect("timeout");
        let target = gcs.local_addr().expect("addr").to_string();

        let mut client = UdpEndpoint::open(&target, UdpMode::Client).expect("client");
        let frame = heartbeat(1);
        assert!(matches!(
            client.write_msg(&frame).expect("write"),
            WriteStatus::Written(_)
        ));

        let mut buf = [0u8; 512];
        let (n, from) = gcs.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], &frame.raw_bytes[..]);

        // The flight side may answer from wherever it likes.
        gcs.send_to(&heartbeat(7).raw_bytes, from).expect("answer");
        let back = read_eventually(&mut client).expect("frame");
        assert_eq!(back.header.system_id, 7);
    }

    #[test]
    fn test_several_frames_in_one_datagram() {
        let mut server = UdpEndpoint::open("127.0.0.1:0", UdpMode::Server).expect("server");
        let addr = server.local_addr().expect("addr");
        let gcs = StdUdpSocket::bind("127.0.0.1:0").expect("gcs");

        let mut datagram = heartbeat(3).raw_bytes.to_vec();
        datagram.extend_from_slice(&heartbeat(4).raw_bytes);
        gcs.send_to(&datagram, addr).expect("send");

        let first = read_eventually(&mut server).expect("first");
        let second = server.read_msg().expect("read").expect("second");
        assert_eq!(first.header.system_id, 3);
        assert_eq!(second.header.system_id, 4);
        assert_eq!(server.stats().read.messages, 2);
    }
}
