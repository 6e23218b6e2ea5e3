//! MAVLink frame extraction from byte streams.
//!
//! Endpoints feed whatever their transport delivered into a [`StreamParser`]
//! and pull complete frames out of it. Frames are delimited by their header
//! alone, so messages from any dialect pass through. Each [`MavlinkFrame`]
//! carries the header, the exact bytes of the frame (which is what gets
//! forwarded) and, when the id belongs to the `common` set, the decoded
//! message used for addressing and by the log sink.

use bytes::{Buf, Bytes, BytesMut};
use mavlink::common::MavMessage;
use mavlink::error::{MessageReadError, ParserError};
use mavlink::{MavHeader, MavlinkVersion, Message};
use std::io::Cursor;
use tracing::{trace, warn};

use crate::error::{Result, RouterError};
use crate::mavlink_utils::{extract_target, MessageTarget};

// Maximum buffer size to prevent OOM from malformed streams
const MAX_BUFFER_SIZE: usize = 1024 * 1024; // 1MB

const MAV_STX_V1: u8 = 0xFE;
const MAV_STX_V2: u8 = 0xFD;
const V1_OVERHEAD: usize = 8; // 6 header + 2 crc
const V2_OVERHEAD: usize = 12; // 10 header + 2 crc
const V2_SIGNATURE_LEN: usize = 13;
const V2_IFLAG_SIGNED: u8 = 0x01;

/// One complete MAVLink frame as read from (or written to) an endpoint.
#[derive(Debug, Clone)]
pub struct MavlinkFrame {
    pub header: MavHeader,
    pub msgid: u32,
    /// `None` for messages outside the `common` set; those are forwarded
    /// as they are.
    pub message: Option<MavMessage>,
    pub version: MavlinkVersion,
    /// The frame exactly as it appeared on the wire.
    pub raw_bytes: Bytes,
}

impl MavlinkFrame {
    /// Serializes `message` as a MAVLink 2 frame.
    pub fn encode_v2(header: MavHeader, message: MavMessage) -> Result<Self> {
        let mut buf = Vec::with_capacity(280);
        mavlink::write_v2_msg(&mut buf, header, &message)
            .map_err(|e| RouterError::protocol(format!("failed to encode frame: {e}")))?;
        Ok(Self {
            header,
            msgid: message.message_id(),
            message: Some(message),
            version: MavlinkVersion::V2,
            raw_bytes: Bytes::from(buf),
        })
    }

    /// Where the frame is addressed. Messages that could not be decoded
    /// count as broadcast.
    pub fn target(&self) -> MessageTarget {
        self.message
            .as_ref()
            .map(extract_target)
            .unwrap_or_default()
    }

    /// Size of the frame on the wire.
    pub fn len(&self) -> usize {
        self.raw_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_bytes.is_empty()
    }
}

pub struct StreamParser {
    buffer: BytesMut,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        // Clear buffer if adding new data would exceed the limit
        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            warn!("StreamParser buffer exceeded MAX_BUFFER_SIZE. Clearing buffer to prevent OOM.");
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(data);
    }

    /// Drops everything buffered, e.g. when a connection is re-established.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn parse_next(&mut self) -> Option<MavlinkFrame> {
        loop {
            // Search for STX (MAVLink 1: 0xFE, MAVLink 2: 0xFD)
            let idx = self
                .buffer
                .iter()
                .position(|&b| b == MAV_STX_V2 || b == MAV_STX_V1);
            match idx {
                Some(0) => {}
                Some(idx) => self.buffer.advance(idx),
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            let version = if self.buffer[0] == MAV_STX_V2 {
                MavlinkVersion::V2
            } else {
                MavlinkVersion::V1
            };

            let len = frame_len(&self.buffer, version)?;
            if self.buffer.len() < len {
                return None;
            }

            let raw = &self.buffer[..len];
            let header = raw_header(raw, version);
            let msgid = raw_msgid(raw, version);

            // Only ids with a known CRC_EXTRA can be checked; everything else
            // is forwarded on the strength of its header.
            let message = if is_known_id(version, msgid) {
                let mut cursor = Cursor::new(raw);
                let res = match version {
                    MavlinkVersion::V2 => mavlink::read_v2_msg::<MavMessage, _>(&mut cursor),
                    MavlinkVersion::V1 => mavlink::read_v1_msg::<MavMessage, _>(&mut cursor),
                };
                match res {
                    Ok((_, message)) => Some(message),
                    // CRC matched but the payload holds values this dialect
                    // does not define.
                    Err(MessageReadError::Parse(e)) => {
                        trace!("Forwarding undecodable message {}: {}", msgid, e);
                        None
                    }
                    Err(MessageReadError::Io(_)) => {
                        // Invalid packet, skip STX
                        self.buffer.advance(1);
                        continue;
                    }
                }
            } else {
                None
            };

            let raw_bytes = self.buffer.split_to(len).freeze();
            return Some(MavlinkFrame {
                header,
                msgid,
                message,
                version,
                raw_bytes,
            });
        }
    }
}

/// Wire length of the frame starting at `buf[0]`, if its header is present.
fn frame_len(buf: &[u8], version: MavlinkVersion) -> Option<usize> {
    let payload_len = *buf.get(1)? as usize;
    match version {
        MavlinkVersion::V1 => Some(payload_len + V1_OVERHEAD),
        MavlinkVersion::V2 => {
            let signed = buf.get(2)? & V2_IFLAG_SIGNED != 0;
            Some(payload_len + V2_OVERHEAD + if signed { V2_SIGNATURE_LEN } else { 0 })
        }
    }
}

/// Header fields of a complete frame.
fn raw_header(raw: &[u8], version: MavlinkVersion) -> MavHeader {
    // v2 carries the incompat and compat flags ahead of the sequence.
    let base = match version {
        MavlinkVersion::V1 => 2,
        MavlinkVersion::V2 => 4,
    };
    MavHeader {
        sequence: raw[base],
        system_id: raw[base + 1],
        component_id: raw[base + 2],
    }
}

fn raw_msgid(raw: &[u8], version: MavlinkVersion) -> u32 {
    match version {
        MavlinkVersion::V1 => u32::from(raw[5]),
        MavlinkVersion::V2 => u32::from_le_bytes([raw[7], raw[8], raw[9], 0]),
    }
}

/// Whether `msgid` belongs to the `common` set.
fn is_known_id(version: MavlinkVersion, msgid: u32) -> bool {
    !matches!(
        MavMessage::parse(version, msgid, &[]),
        Err(ParserError::UnknownMessage { .. })
    )
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn heartbeat(system_id: u8) -> Vec<u8> {
        let header = MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        };
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("Failed to write test message");
        buf
    }

    #[test]
    fn test_partial_packet() {
        let mut parser = StreamParser::new();
        let buf = heartbeat(1);

        let split_idx = buf.len() / 2;
        parser.push(&buf[..split_idx]);
        assert!(parser.parse_next().is_none());

        parser.push(&buf[split_idx..]);
        let res = parser.parse_next();
        assert!(res.is_some());
        assert_eq!(res.expect("Should have parsed packet").msgid, 0);
    }

    #[test]
    fn test_raw_bytes_are_exact_frame() {
        let mut parser = StreamParser::new();
        let buf = heartbeat(7);

        parser.push(&[0x00, 0x11, 0x22]);
        parser.push(&buf);
        let frame = parser.parse_next().expect("frame");
        assert_eq!(&frame.raw_bytes[..], &buf[..]);
        assert_eq!(frame.header.system_id, 7);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_raw_bytes_after_corrupt_frame() {
        let mut parser = StreamParser::new();
        let good = heartbeat(3);
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut stream = bad.clone();
        stream.extend_from_slice(&good);
        parser.push(&stream);

        let frame = parser.parse_next().expect("valid frame after corrupt one");
        assert_eq!(&frame.raw_bytes[..], &good[..]);
        assert!(parser.parse_next().is_none());
    }

    #[test]
    fn test_v1_frame() {
        let mut parser = StreamParser::new();
        let header = MavHeader {
            system_id: 4,
            component_id: 1,
            sequence: 9,
        };
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());
        let mut buf = Vec::new();
        mavlink::write_v1_msg(&mut buf, header, &msg).expect("write v1");

        parser.push(&buf);
        let frame = parser.parse_next().expect("v1 frame");
        assert_eq!(frame.version, MavlinkVersion::V1);
        assert_eq!(frame.len(), buf.len());
    }

    #[test]
    fn test_encode_v2_roundtrips_through_parser() {
        let header = MavHeader {
            system_id: 2,
            component_id: 0,
            sequence: 1,
        };
        let frame = MavlinkFrame::encode_v2(
            header,
            MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default()),
        )
        .expect("encode");

        let mut parser = StreamParser::new();
        parser.push(&frame.raw_bytes);
        let parsed = parser.parse_next().expect("parse");
        assert_eq!(parsed.header.system_id, 2);
        assert_eq!(parsed.raw_bytes, frame.raw_bytes);
    }

    fn crc_accumulate(crc: u16, byte: u8) -> u16 {
        let mut tmp = byte ^ (crc & 0xFF) as u8;
        tmp ^= tmp << 4;
        let tmp = u16::from(tmp);
        (crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4)
    }

    /// A MAVLink 2 frame for DEVICE_OP_READ (ardupilotmega, id 11000).
    fn device_op_read(system_id: u8) -> Vec<u8> {
        const CRC_EXTRA: u8 = 134;
        let payload = [0x11u8; 51];
        let mut buf = vec![MAV_STX_V2, payload.len() as u8, 0, 0, 7, system_id, 1];
        buf.extend_from_slice(&11000u32.to_le_bytes()[..3]);
        buf.extend_from_slice(&payload);
        let crc = buf[1..]
            .iter()
            .chain(std::iter::once(&CRC_EXTRA))
            .fold(0xFFFF, |crc, &b| crc_accumulate(crc, b));
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    #[test]
    fn test_dialect_frame_is_forwarded_undecoded() {
        let mut parser = StreamParser::new();
        let dialect = device_op_read(9);
        let hb = heartbeat(9);
        parser.push(&dialect);
        parser.push(&hb);

        let frame = parser.parse_next().expect("dialect frame");
        assert_eq!(frame.msgid, 11000);
        assert!(frame.message.is_none());
        assert_eq!(frame.header.system_id, 9);
        assert_eq!(frame.header.sequence, 7);
        assert_eq!(&frame.raw_bytes[..], &dialect[..]);
        assert!(frame.target().is_broadcast());

        let next = parser.parse_next().expect("heartbeat after it");
        assert_eq!(next.msgid, 0);
        assert!(next.message.is_some());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_frame_waits_for_its_full_length() {
        let mut parser = StreamParser::new();
        let dialect = device_op_read(9);
        parser.push(&dialect[..dialect.len() - 1]);
        assert!(parser.parse_next().is_none());
        assert_eq!(parser.buffered(), dialect.len() - 1);

        parser.push(&dialect[dialect.len() - 1..]);
        assert_eq!(parser.parse_next().expect("complete").len(), dialect.len());
    }

    #[test]
    fn test_known_ids() {
        assert!(is_known_id(MavlinkVersion::V2, 0));
        assert!(is_known_id(MavlinkVersion::V2, 266)); // LOGGING_DATA
        assert!(!is_known_id(MavlinkVersion::V2, 11000));
    }
}
