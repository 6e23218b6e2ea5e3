//! Per-endpoint traffic statistics.
//!
//! Every endpoint owns an [`EndpointStats`]; the mainloop logs them
//! periodically when statistics reporting is enabled.

use std::fmt;

/// Counters for the receive direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Frames successfully parsed from the transport.
    pub messages: u64,
    /// Bytes of those frames.
    pub bytes: u64,
}

/// Counters for the transmit direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Frames accepted for transmission (written or queued).
    pub messages: u64,
    /// Bytes of those frames.
    pub bytes: u64,
    /// Frames discarded because the transmit queue was full.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub read: ReadStats,
    pub write: WriteStats,
}

impl EndpointStats {
    pub fn record_read(&mut self, len: usize) {
        self.read.messages += 1;
        self.read.bytes += len as u64;
    }

    pub fn record_write(&mut self, len: usize) {
        self.write.messages += 1;
        self.write.bytes += len as u64;
    }

    pub fn record_drop(&mut self) {
        self.write.dropped += 1;
    }

    /// Percentage of frames handed to this endpoint that were dropped.
    pub fn drop_rate(&self) -> f64 {
        let offered = self.write.messages + self.write.dropped;
        if offered == 0 {
            return 0.0;
        }
        self.write.dropped as f64 * 100.0 / offered as f64
    }
}

impl fmt::Display for EndpointStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {} msgs / {} bytes, tx {} msgs / {} bytes, dropped {} ({:.1}%)",
            self.read.messages,
            self.read.bytes,
            self.write.messages,
            self.write.bytes,
            self.write.dropped,
            self.drop_rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = EndpointStats::default();
        stats.record_read(20);
        stats.record_read(30);
        stats.record_write(12);
        stats.record_drop();

        assert_eq!(stats.read.messages, 2);
        assert_eq!(stats.read.bytes, 50);
        assert_eq!(stats.write.messages, 1);
        assert_eq!(stats.write.dropped, 1);
        assert!((stats.drop_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drop_rate_empty() {
        assert_eq!(EndpointStats::default().drop_rate(), 0.0);
    }

    #[test]
    fn test_display() {
        let mut stats = EndpointStats::default();
        stats.record_read(10);
        let text = stats.to_string();
        assert!(text.starts_with("rx 1 msgs / 10 bytes"));
    }
}
