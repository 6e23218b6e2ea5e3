//! ULog stream reassembly.
//!
//! The flight stack streams its log as `LOGGING_DATA`/`LOGGING_DATA_ACKED`
//! chunks: a 16 bit wrapping sequence number, up to 249 payload bytes and the
//! offset of the first record that starts inside the chunk. [`Reassembler`]
//! stitches those chunks back into the original ULog byte stream and writes
//! it record by record, so a lost chunk never leaves half a record in the
//! middle of the file.
//!
//! The file layout is a 16 byte header starting with [`ULOG_MAGIC`],
//! followed by records prefixed with `(u16 little-endian size, u8 type)`,
//! where `size` excludes that 3 byte prefix.

use crate::error::{Result, RouterError};
use std::io::{self, ErrorKind, Write};
use tracing::{debug, error, warn};

pub const ULOG_HEADER_SIZE: usize = 16;
pub const ULOG_MAGIC: [u8; 7] = [0x55, 0x4C, 0x6F, 0x67, 0x01, 0x12, 0x35];

/// `first_message_offset` value meaning "no record starts in this chunk".
pub const NO_FIRST_MSG_OFFSET: u8 = 255;

/// Capacity of the reassembly buffer.
pub const BUFFER_LEN: usize = 2048;

/// Capacity of the holding buffer for a record the writer only took part of.
pub const PARTIAL_LEN: usize = 1024;

const RECORD_HEADER_SIZE: usize = 3;
const HALF_SEQ_RANGE: u16 = 0x8000;

/// One log chunk as carried by `LOGGING_DATA`.
#[derive(Debug, Clone, Copy)]
pub struct LogChunk<'a> {
    pub sequence: u16,
    pub first_message_offset: u8,
    pub data: &'a [u8],
}

/// How an incoming sequence number relates to the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqClass {
    InOrder,
    /// Ahead of expectation by less than half the sequence space.
    Gap,
    /// Retransmission of something already seen.
    Stale,
}

/// Classifies `seq` against `expected` using half-range disambiguation.
pub fn classify_sequence(seq: u16, expected: u16) -> SeqClass {
    match seq.wrapping_sub(expected) {
        0 => SeqClass::InOrder,
        d if d < HALF_SEQ_RANGE => SeqClass::Gap,
        _ => SeqClass::Stale,
    }
}

/// What [`Reassembler::process`] did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Data was taken into the stream. `gap` is set if chunks were lost
    /// before this one.
    Accepted { gap: bool },
    /// Sequence behind expectation, ignored.
    Stale,
    /// Waiting for a record boundary and this chunk carries none.
    Skipped,
    /// The session's header was invalid; nothing is accepted anymore.
    Rejected,
}

/// Rebuilds a ULog byte stream out of sequenced chunks and writes it to `W`.
///
/// Writes may be short or report `WouldBlock`; the unwritten tail of a
/// record is held back and completed by the next [`Reassembler::flush`]
/// before any later record is attempted.
pub struct Reassembler<W> {
    writer: W,
    waiting_header: bool,
    waiting_first_msg_offset: bool,
    rejected: bool,
    expected_seq: u16,
    buffer: [u8; BUFFER_LEN],
    index: usize,
    len: usize,
    partial: [u8; PARTIAL_LEN],
    partial_len: usize,
}

impl<W: Write> Reassembler<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            waiting_header: true,
            waiting_first_msg_offset: false,
            rejected: false,
            expected_seq: 0,
            buffer: [0; BUFFER_LEN],
            index: 0,
            len: 0,
            partial: [0; PARTIAL_LEN],
            partial_len: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn expected_sequence(&self) -> u16 {
        self.expected_seq
    }

    /// Bytes reassembled but not yet handed to the writer.
    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Bytes of a record the writer only partially accepted.
    pub fn pending_partial(&self) -> usize {
        self.partial_len
    }

    pub fn is_waiting_header(&self) -> bool {
        self.waiting_header
    }

    /// Feeds one chunk.
    ///
    /// Returns a protocol error when the first chunk of the session does not
    /// carry a valid ULog header; from then on every chunk is
    /// [`ChunkOutcome::Rejected`].
    pub fn process(&mut self, chunk: &LogChunk<'_>) -> Result<ChunkOutcome> {
        if self.rejected {
            return Ok(ChunkOutcome::Rejected);
        }

        let mut data = chunk.data;
        let mut gap = false;

        if self.waiting_header {
            // The first chunk of a session sets the baseline.
            self.expected_seq = chunk.sequence.wrapping_add(1);

            if data.len() < ULOG_HEADER_SIZE {
                self.rejected = true;
                return Err(RouterError::protocol(format!(
                    "ULog header is not complete ({} bytes)",
                    data.len()
                )));
            }
            if data[..ULOG_MAGIC.len()] != ULOG_MAGIC {
                self.rejected = true;
                return Err(RouterError::protocol("invalid ULog magic number"));
            }

            self.partial[..ULOG_HEADER_SIZE].copy_from_slice(&data[..ULOG_HEADER_SIZE]);
            self.partial_len = ULOG_HEADER_SIZE;
            self.index = 0;
            self.len = 0;
            self.waiting_header = false;
            data = &data[ULOG_HEADER_SIZE..];
        } else {
            match classify_sequence(chunk.sequence, self.expected_seq) {
                SeqClass::Stale => return Ok(ChunkOutcome::Stale),
                SeqClass::InOrder => {}
                SeqClass::Gap => {
                    debug!(
                        expected = self.expected_seq,
                        got = chunk.sequence,
                        "ULog sequence gap"
                    );
                    gap = true;
                }
            }
            self.expected_seq = chunk.sequence.wrapping_add(1);
        }

        if gap {
            self.flush_logged();
            self.index = 0;
            self.len = 0;
            self.waiting_first_msg_offset = true;
        }

        if self.len + data.len() > BUFFER_LEN {
            warn!("ULog buffer full, dropping everything on buffer");
            self.index = 0;
            self.len = 0;
            self.waiting_first_msg_offset = true;
        }

        if self.waiting_first_msg_offset {
            let offset = chunk.first_message_offset;
            if offset == NO_FIRST_MSG_OFFSET || offset as usize > data.len() {
                return Ok(ChunkOutcome::Skipped);
            }
            self.waiting_first_msg_offset = false;
            data = &data[offset as usize..];
        }

        if !data.is_empty() {
            if self.index + self.len + data.len() > BUFFER_LEN {
                self.buffer.copy_within(self.index..self.index + self.len, 0);
                self.index = 0;
            }
            let end = self.index + self.len;
            self.buffer[end..end + data.len()].copy_from_slice(data);
            self.len += data.len();
        }

        self.flush_logged();
        Ok(ChunkOutcome::Accepted { gap })
    }

    fn flush_logged(&mut self) {
        if let Err(e) = self.flush() {
            error!("Unable to write to ULog file: {}", e);
        }
    }

    /// Writes out the held partial record, then as many whole records as
    /// the writer accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while self.partial_len > 0 {
            match self.writer.write(&self.partial[..self.partial_len]) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.partial.copy_within(n..self.partial_len, 0);
                    self.partial_len -= n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        while self.len >= RECORD_HEADER_SIZE {
            let start = self.index;
            let msg_size = u16::from_le_bytes([self.buffer[start], self.buffer[start + 1]]);
            let full_size = msg_size as usize + RECORD_HEADER_SIZE;
            if full_size > self.len {
                break;
            }

            let written = match self.writer.write(&self.buffer[start..start + full_size]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };
            if written == 0 {
                break;
            }

            self.index += full_size;
            self.len -= full_size;
            if written == full_size {
                continue;
            }

            let remainder = full_size - written;
            if remainder > PARTIAL_LEN {
                error!(
                    msg_type = self.buffer[start + 2],
                    len = full_size,
                    "Partial buffer is not big enough to store the ULog entry, ULog file is now corrupt"
                );
                continue;
            }
            self.partial[..remainder].copy_from_slice(&self.buffer[start + written..start + full_size]);
            self.partial_len = remainder;
            break;
        }

        Ok(())
    }

    /// Ends the session: forgets buffered records and pushes out whatever
    /// remains of a partially written one, giving up once the writer stops
    /// making progress.
    pub fn finish(&mut self) -> io::Result<()> {
        self.index = 0;
        self.len = 0;
        while self.partial_len > 0 {
            let before = self.partial_len;
            self.flush()?;
            if self.partial_len == before {
                break;
            }
        }
        self.writer.flush()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn header() -> Vec<u8> {
        let mut h = ULOG_MAGIC.to_vec();
        h.resize(ULOG_HEADER_SIZE, 0xAB);
        h
    }

    fn record(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut r = (payload.len() as u16).to_le_bytes().to_vec();
        r.push(msg_type);
        r.extend_from_slice(payload);
        r
    }

    fn chunk(sequence: u16, offset: u8, data: &[u8]) -> LogChunk<'_> {
        LogChunk {
            sequence,
            first_message_offset: offset,
            data,
        }
    }

    /// Writer that accepts a scripted number of bytes per call; `None`
    /// reports `WouldBlock`. Unlimited once the script runs out.
    struct ScriptedWriter {
        budget: VecDeque<Option<usize>>,
        out: Vec<u8>,
        calls: Vec<usize>,
    }

    impl ScriptedWriter {
        fn new(budget: impl IntoIterator<Item = Option<usize>>) -> Self {
            Self {
                budget: budget.into_iter().collect(),
                out: Vec::new(),
                calls: Vec::new(),
            }
        }

        fn unlimited() -> Self {
            Self::new(Vec::new())
        }
    }

    impl Write for ScriptedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls.push(buf.len());
            match self.budget.pop_front().unwrap_or(Some(usize::MAX)) {
                Some(n) => {
                    let n = n.min(buf.len());
                    self.out.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                None => Err(io::Error::from(ErrorKind::WouldBlock)),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_classify_sequence() {
        assert_eq!(classify_sequence(10, 10), SeqClass::InOrder);
        assert_eq!(classify_sequence(11, 10), SeqClass::Gap);
        assert_eq!(classify_sequence(10 + 32767, 10), SeqClass::Gap);
        assert_eq!(classify_sequence(9, 10), SeqClass::Stale);
        assert_eq!(classify_sequence(10u16.wrapping_sub(32767), 10), SeqClass::Stale);
        // wraparound
        assert_eq!(classify_sequence(65535, 65535), SeqClass::InOrder);
        assert_eq!(classify_sequence(0, 0), SeqClass::InOrder);
        assert_eq!(classify_sequence(0, 65535), SeqClass::Gap);
        assert_eq!(classify_sequence(3, 65534), SeqClass::Gap);
        assert_eq!(classify_sequence(65534, 2), SeqClass::Stale);
    }

    #[test]
    fn test_in_order_stream_is_reproduced() {
        let mut stream = header();
        for i in 0..40u8 {
            stream.extend(record(b'D', &vec![i; (i as usize * 7) % 60]));
        }

        let mut r = Reassembler::new(Vec::new());
        for (i, piece) in stream.chunks(249).enumerate() {
            let outcome = r.process(&chunk(i as u16 + 100, 0, piece)).expect("process");
            assert_eq!(outcome, ChunkOutcome::Accepted { gap: false });
        }
        assert_eq!(r.get_ref(), &stream);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_records_are_written_whole() {
        let rec = record(b'D', &[7u8; 40]);
        let mut first = header();
        first.extend_from_slice(&rec[..10]);

        let mut r = Reassembler::new(ScriptedWriter::unlimited());
        r.process(&chunk(0, 0, &first)).expect("header");
        assert_eq!(r.get_ref().out, header());

        r.process(&chunk(1, NO_FIRST_MSG_OFFSET, &rec[10..])).expect("rest");
        assert_eq!(r.get_ref().calls.last().copied(), Some(rec.len()));
    }

    #[test]
    fn test_stale_chunk_changes_nothing() {
        let mut r = Reassembler::new(Vec::new());
        r.process(&chunk(5, 0, &header())).expect("header");
        let rec = record(b'I', &[1, 2, 3]);
        r.process(&chunk(6, 0, &rec)).expect("rec");
        let written = r.get_ref().len();

        assert_eq!(r.process(&chunk(6, 0, &rec)).expect("dup"), ChunkOutcome::Stale);
        assert_eq!(r.process(&chunk(2, 0, &rec)).expect("old"), ChunkOutcome::Stale);
        assert_eq!(r.get_ref().len(), written);
        assert_eq!(r.expected_sequence(), 7);
    }

    #[test]
    fn test_gap_resyncs_on_boundary() {
        let a = record(b'D', &[1u8; 20]);
        let b = record(b'D', &[2u8; 20]);
        let c = record(b'D', &[3u8; 20]);

        let mut r = Reassembler::new(Vec::new());
        r.process(&chunk(0, 0, &header())).expect("header");

        // A complete record plus the start of one whose tail is lost.
        let mut first = a.clone();
        first.extend_from_slice(&b[..8]);
        r.process(&chunk(1, 0, &first)).expect("first");

        // Chunk 2 is lost. Chunk 3 has no boundary, chunk 4 has one.
        let outcome = r.process(&chunk(3, NO_FIRST_MSG_OFFSET, &b[8..16])).expect("no boundary");
        assert_eq!(outcome, ChunkOutcome::Skipped);
        assert_eq!(r.buffered(), 0);

        let mut with_boundary = b[16..].to_vec();
        let offset = with_boundary.len() as u8;
        with_boundary.extend_from_slice(&c);
        r.process(&chunk(4, offset, &with_boundary)).expect("boundary");

        let mut expected = header();
        expected.extend_from_slice(&a);
        expected.extend_from_slice(&c);
        assert_eq!(r.get_ref(), &expected);
    }

    #[test]
    fn test_gap_flushes_held_partial_first() {
        let a = record(b'D', &[9u8; 30]);
        // Header and 10 bytes of `a` go out, then the writer blocks.
        let mut r = Reassembler::new(ScriptedWriter::new([Some(16), Some(10), None]));
        r.process(&chunk(0, 0, &header())).expect("header");
        r.process(&chunk(1, 0, &a)).expect("a");
        assert_eq!(r.pending_partial(), a.len() - 10);

        let b = record(b'D', &[4u8; 5]);
        let outcome = r.process(&chunk(9, 0, &b)).expect("after gap");
        assert_eq!(outcome, ChunkOutcome::Accepted { gap: true });

        let mut expected = header();
        expected.extend_from_slice(&a);
        expected.extend_from_slice(&b);
        assert_eq!(r.get_ref().out, expected);
    }

    #[test]
    fn test_partial_write_resumes_before_next_record() {
        let a = record(b'D', &[1u8; 50]);
        let b = record(b'D', &[2u8; 50]);
        let mut both = a.clone();
        both.extend_from_slice(&b);

        let mut r = Reassembler::new(ScriptedWriter::new([None, Some(16), Some(20)]));
        r.process(&chunk(0, 0, &header())).expect("header");
        r.process(&chunk(1, 0, &both)).expect("records");
        assert_eq!(r.pending_partial(), a.len() - 20);
        assert_eq!(r.buffered(), b.len());

        r.flush().expect("flush");
        assert_eq!(r.pending_partial(), 0);
        assert_eq!(r.buffered(), 0);

        let mut expected = header();
        expected.extend_from_slice(&both);
        assert_eq!(r.get_ref().out, expected);
    }

    #[test]
    fn test_oversized_remainder_is_discarded() {
        let big = record(b'D', &[5u8; 1500]);
        let small = record(b'D', &[6u8; 4]);

        let mut r = Reassembler::new(ScriptedWriter::new([Some(16), Some(100)]));
        r.process(&chunk(0, 0, &header())).expect("header");
        for (i, piece) in big.chunks(249).enumerate() {
            r.process(&chunk(i as u16 + 1, 0, piece)).expect("big");
        }
        assert_eq!(r.pending_partial(), 0);
        assert_eq!(r.buffered(), 0);

        let seq = big.chunks(249).count() as u16 + 1;
        r.process(&chunk(seq, 0, &small)).expect("small");

        let out = &r.get_ref().out;
        assert_eq!(out.len(), ULOG_HEADER_SIZE + 100 + small.len());
        assert!(out.ends_with(&small));
    }

    #[test]
    fn test_overflow_drops_buffer() {
        let mut r = Reassembler::new(ScriptedWriter::unlimited());
        r.process(&chunk(0, 0, &header())).expect("header");

        // A record too large to ever fit keeps accumulating.
        let mut huge = 4000u16.to_le_bytes().to_vec();
        huge.push(b'D');
        huge.resize(249, 0);
        let mut seq = 1;
        while r.buffered() + 249 <= BUFFER_LEN {
            r.process(&chunk(seq, 0, &huge)).expect("fill");
            huge = vec![0; 249];
            seq += 1;
        }

        let outcome = r
            .process(&chunk(seq, NO_FIRST_MSG_OFFSET, &[0u8; 249]))
            .expect("overflow");
        assert_eq!(outcome, ChunkOutcome::Skipped);
        assert_eq!(r.buffered(), 0);

        let rec = record(b'I', &[1, 2]);

        r.process(&chunk(seq + 1, 0, &rec)).expect("resync");
        assert!(r.get_ref().out.ends_with(&rec));
    }

    #[test]
    fn test_bad_magic_rejects_session() {
        let mut bad = header();
        bad[0] = 0;
        let mut r = Reassembler::new(Vec::new());
        assert!(r.process(&chunk(0, 0, &bad)).is_err());
        assert_eq!(
            r.process(&chunk(1, 0, &header())).expect("rejected"),
            ChunkOutcome::Rejected
        );
        assert!(r.get_ref().is_empty());
    }

    #[test]
    fn test_short_header_rejects_session() {
        let mut r = Reassembler::new(Vec::new());
        assert!(r.process(&chunk(0, 0, &ULOG_MAGIC)).is_err());
        assert!(r.get_ref().is_empty());
    }

    #[test]
    fn test_finish_writes_held_partial() {
        let a = record(b'D', &[3u8; 30]);
        let mut r = Reassembler::new(ScriptedWriter::new([Some(16), Some(5)]));
        r.process(&chunk(0, 0, &header())).expect("header");
        r.process(&chunk(1, 0, &a)).expect("a");
        assert!(r.pending_partial() > 0);

        r.finish().expect("finish");
        assert_eq!(r.pending_partial(), 0);
        let mut expected = header();
        expected.extend_from_slice(&a);
        assert_eq!(r.get_ref().out, expected);
    }
}
