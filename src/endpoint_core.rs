//! Core logic for MAVLink endpoints.
//!
//! This module defines the capability set every endpoint presents to the
//! mainloop ([`Endpoint`]) and the shared machinery the byte-stream
//! transports (serial, TCP) build on: [`StreamCore`] reads frames until the
//! transport runs dry and keeps a bounded transmit buffer for output the
//! transport could not take yet.

use crate::framing::{MavlinkFrame, StreamParser};
use crate::stats::EndpointStats;
use bytes::{Buf, BytesMut};
use mio::event::Source;
use std::io::{self, ErrorKind, Read, Write};
use tracing::trace;

/// Maximum number of bytes held back for a stream endpoint that would block.
pub const TX_BUF_MAX_SIZE: usize = 8 * 1024;

const RX_CHUNK_SIZE: usize = 8 * 1024;

/// Outcome of handing one frame to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The whole frame was written; carries its length.
    Written(usize),
    /// The frame (or part of it) is parked in the endpoint. The caller must
    /// watch the endpoint for write-readiness and call
    /// [`Endpoint::flush_pending_msgs`] once it fires.
    WouldBlock,
}

/// Outcome of a write-readiness flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Nothing is pending anymore; write-readiness watching can stop.
    Drained,
    /// Output is still pending.
    WouldBlock,
}

/// The uniform capability set the mainloop routes through.
///
/// Implementations are non-blocking: `read_msg` returns `Ok(None)` as soon
/// as the transport has nothing more to offer, and `write_msg` never waits.
/// A peer that went away is reported as an `io::Error` whose kind satisfies
/// [`crate::error::is_hangup`].
pub trait Endpoint {
    /// Human readable name, used in logs and statistics.
    fn name(&self) -> &str;

    /// Returns the next complete frame, `Ok(None)` if none is available.
    fn read_msg(&mut self) -> io::Result<Option<MavlinkFrame>>;

    /// Writes one frame, or parks it if the transport would block.
    fn write_msg(&mut self, frame: &MavlinkFrame) -> io::Result<WriteStatus>;

    /// Retries parked output after a write-readiness event.
    fn flush_pending_msgs(&mut self) -> io::Result<FlushStatus>;

    /// System id learned from traffic on this endpoint, 0 while unknown.
    fn system_id(&self) -> u8;

    /// The readiness source to register with the poller. Endpoints that are
    /// not backed by a descriptor (the log sink) return `None`.
    fn source(&mut self) -> Option<&mut dyn Source>;

    fn stats(&self) -> &EndpointStats;
}

/// Bounded buffer for output a transport could not accept yet.
#[derive(Debug, Default)]
pub struct TxBuffer {
    buf: BytesMut,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(TX_BUF_MAX_SIZE),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Writes `data` straight through if nothing is pending, otherwise (or
    /// on a short write) queues the unwritten tail. Frames that do not fit
    /// are dropped and counted.
    pub fn write<W: Write>(
        &mut self,
        writer: &mut W,
        data: &[u8],
        stats: &mut EndpointStats,
    ) -> io::Result<WriteStatus> {
        if !self.buf.is_empty() {
            if self.buf.len() + data.len() > TX_BUF_MAX_SIZE {
                stats.record_drop();
                return Ok(WriteStatus::WouldBlock);
            }
            self.buf.extend_from_slice(data);
            stats.record_write(data.len());
            return Ok(WriteStatus::WouldBlock);
        }

        let written = loop {
            match writer.write(data) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break 0,
                Err(e) => return Err(e),
            }
        };

        stats.record_write(data.len());
        if written == data.len() {
            return Ok(WriteStatus::Written(written));
        }

        trace!(written, total = data.len(), "short write, parking remainder");
        self.buf.extend_from_slice(&data[written..]);
        Ok(WriteStatus::WouldBlock)
    }

    /// Pushes parked bytes out until the writer would block.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        while !self.buf.is_empty() {
            match writer.write(&self.buf) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => self.buf.advance(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FlushStatus::WouldBlock),
                Err(e) => return Err(e),
            }
        }
        Ok(FlushStatus::Drained)
    }
}

/// Shared state of a byte-stream endpoint: parser, transmit buffer,
/// learned system id and counters.
pub struct StreamCore {
    pub parser: StreamParser,
    pub tx: TxBuffer,
    pub stats: EndpointStats,
    system_id: u8,
    rx_chunk: Box<[u8]>,
}

impl Default for StreamCore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCore {
    pub fn new() -> Self {
        Self {
            parser: StreamParser::new(),
            tx: TxBuffer::new(),
            stats: EndpointStats::default(),
            system_id: 0,
            rx_chunk: vec![0u8; RX_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    /// Records a frame that arrived on this endpoint. The first sender seen
    /// on a connection becomes the endpoint's system id.
    pub fn learn(&mut self, frame: &MavlinkFrame) {
        if self.system_id == 0 {
            self.system_id = frame.header.system_id;
        }
        self.stats.record_read(frame.len());
    }

    /// Forgets everything tied to the current connection.
    pub fn reset(&mut self) {
        self.parser.clear();
        self.tx.clear();
        self.system_id = 0;
    }

    /// Returns the next frame, reading from `reader` until it would block.
    ///
    /// Readiness is edge-triggered, so callers keep calling this until it
    /// returns `Ok(None)`. With `eof_is_hangup` a zero-length read (peer
    /// closed the stream) is reported as `ConnectionAborted`; otherwise it
    /// just means "no data" (a tty with nothing pending).
    pub fn read_frame<R: Read>(
        &mut self,
        reader: &mut R,
        eof_is_hangup: bool,
    ) -> io::Result<Option<MavlinkFrame>> {
        loop {
            if let Some(frame) = self.parser.parse_next() {
                self.learn(&frame);
                return Ok(Some(frame));
            }

            match reader.read(&mut self.rx_chunk) {
                Ok(0) if eof_is_hangup => {
                    return Err(io::Error::new(
                        ErrorKind::ConnectionAborted,
                        "connection closed by peer",
                    ))
                }
                Ok(0) => return Ok(None),
                Ok(n) => self.parser.push(&self.rx_chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn write_frame<W: Write>(
        &mut self,
        writer: &mut W,
        frame: &MavlinkFrame,
    ) -> io::Result<WriteStatus> {
        self.tx.write(writer, &frame.raw_bytes, &mut self.stats)
    }

    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        self.tx.flush(writer)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use mavlink::common::{MavMessage, HEARTBEAT_DATA};
    use mavlink::MavHeader;
    use std::collections::VecDeque;

    /// Writer that accepts a scripted number of bytes per call.
    struct ScriptedWriter {
        budget: VecDeque<Option<usize>>,
        written: Vec<u8>,
    }

    impl Write for ScriptedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.budget.pop_front().unwrap_or(Some(usize::MAX)) {
                Some(n) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                None => Err(io::Error::from(ErrorKind::WouldBlock)),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(system_id: u8) -> MavlinkFrame {
        let header = MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        };
        MavlinkFrame::encode_v2(header, MavMessage::HEARTBEAT(HEARTBEAT_DATA::default()))
            .expect("encode")
    }

    #[test]
    fn test_short_write_is_completed_by_flush() {
        let mut core = StreamCore::new();
        let f = frame(1);
        let mut writer = ScriptedWriter {
            budget: VecDeque::from([Some(5), None]),
            written: Vec::new(),
        };

        assert_eq!(core.write_frame(&mut writer, &f).expect("write"), WriteStatus::WouldBlock);
        assert_eq!(core.tx.len(), f.len() - 5);
        assert_eq!(core.flush(&mut writer).expect("flush"), FlushStatus::WouldBlock);
        assert_eq!(core.flush(&mut writer).expect("flush"), FlushStatus::Drained);
        assert_eq!(writer.written, f.raw_bytes.to_vec());
    }

    #[test]
    fn test_pending_output_preserves_order() {
        let mut core = StreamCore::new();
        let a = frame(1);
        let b = frame(2);
        let mut writer = ScriptedWriter {
            budget: VecDeque::from([None]),
            written: Vec::new(),
        };

        assert_eq!(core.write_frame(&mut writer, &a).expect("a"), WriteStatus::WouldBlock);
        assert_eq!(core.write_frame(&mut writer, &b).expect("b"), WriteStatus::WouldBlock);
        assert_eq!(core.flush(&mut writer).expect("flush"), FlushStatus::Drained);

        let mut expected = a.raw_bytes.to_vec();
        expected.extend_from_slice(&b.raw_bytes);
        assert_eq!(writer.written, expected);
    }

    #[test]
    fn test_full_buffer_drops_and_counts() {
        let mut core = StreamCore::new();
        let f = frame(1);
        let mut writer = ScriptedWriter {
            budget: VecDeque::from(vec![None; 1024]),
            written: Vec::new(),
        };

        let fits = TX_BUF_MAX_SIZE / f.len();
        for _ in 0..fits + 3 {
            core.write_frame(&mut writer, &f).expect("write");
        }
        assert_eq!(core.stats.write.messages as usize, fits);
        assert_eq!(core.stats.write.dropped, 3);
        assert!(core.tx.len() <= TX_BUF_MAX_SIZE);
    }

    #[test]
    fn test_read_frame_learns_first_sender() {
        let mut core = StreamCore::new();
        let mut bytes = frame(9).raw_bytes.to_vec();
        bytes.extend_from_slice(&frame(3).raw_bytes);
        let mut reader = io::Cursor::new(bytes);

        assert!(core.read_frame(&mut reader, false).expect("read").is_some());
        assert!(core.read_frame(&mut reader, false).expect("read").is_some());
        assert!(core.read_frame(&mut reader, false).expect("read").is_none());
        assert_eq!(core.system_id(), 9);
        assert_eq!(core.stats.read.messages, 2);
    }

    #[test]
    fn test_eof_as_hangup() {
        let mut core = StreamCore::new();
        let mut reader = io::Cursor::new(Vec::<u8>::new());
        let err = core.read_frame(&mut reader, true).expect_err("eof");
        assert!(crate::error::is_hangup(&err));
    }
}
