//! ULog sink endpoint.
//!
//! The sink asks the flight stack (system [`LOG_TARGET_SYSTEM_ID`]) to stream
//! its log over MAVLink and stores the reassembled ULog file in the log
//! directory. It takes part in routing like any other endpoint: frames
//! addressed to it are handed to [`Endpoint::write_msg`], and the control
//! messages it originates (start/stop commands, chunk acknowledgements) are
//! picked up by the mainloop through [`Endpoint::read_msg`].
//!
//! Session timing (resending the start command until it is acknowledged,
//! restarting a stream that went silent) belongs to the mainloop; the sink
//! only exposes its [`LogPhase`] and the hooks the timers call.

use crate::endpoint_core::{Endpoint, FlushStatus, WriteStatus};
use crate::error::{Result, RouterError};
use crate::framing::MavlinkFrame;
use crate::mavlink_utils::{command_long, local_header, logging_ack};
use crate::stats::EndpointStats;
use crate::ulog::{ChunkOutcome, LogChunk, Reassembler};
use chrono::Local;
use mavlink::common::{MavCmd, MavMessage, MavResult};
use mio::event::Source;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// System id the sink uses for the frames it sends.
pub const LOG_SYSTEM_ID: u8 = 2;
/// System id of the flight stack whose log is recorded.
pub const LOG_TARGET_SYSTEM_ID: u8 = 1;
/// Period for resending the start command until it is acknowledged.
pub const START_RETRY_PERIOD: Duration = Duration::from_secs(1);
/// A session without a single accepted chunk for this long is restarted.
pub const ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

const LOG_EXTENSION: &str = "ulg";

/// Where a logging session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPhase {
    Stopped,
    /// Start command sent, no acceptance seen yet.
    AwaitingAck,
    Streaming,
}

struct Session {
    path: PathBuf,
    reassembler: Reassembler<File>,
}

pub struct LogEndpoint {
    name: String,
    dir: PathBuf,
    phase: LogPhase,
    session: Option<Session>,
    outbox: VecDeque<MavlinkFrame>,
    system_id: u8,
    sequence: u8,
    stats: EndpointStats,
    chunks: u64,
    chunks_at_last_check: u64,
}

impl LogEndpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "ULog".to_string(),
            dir: dir.into(),
            phase: LogPhase::Stopped,
            session: None,
            outbox: VecDeque::new(),
            system_id: 0,
            sequence: 0,
            stats: EndpointStats::default(),
            chunks: 0,
            chunks_at_last_check: 0,
        }
    }

    pub fn phase(&self) -> LogPhase {
        self.phase
    }

    /// File of the running session.
    pub fn session_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    /// Chunks accepted into the current session.
    pub fn chunks_accepted(&self) -> u64 {
        self.chunks
    }

    /// Opens a new log file and asks the flight stack to start streaming.
    ///
    /// # Errors
    ///
    /// Fails if a session is already running or no file could be created.
    pub fn start(&mut self) -> Result<PathBuf> {
        if self.session.is_some() {
            return Err(RouterError::internal("ULog already started"));
        }

        let (path, file) = create_log_file(&self.dir)?;
        info!(
            "Logging target system_id={} on {}",
            LOG_TARGET_SYSTEM_ID,
            path.display()
        );

        self.session = Some(Session {
            path: path.clone(),
            reassembler: Reassembler::new(file),
        });
        self.system_id = LOG_SYSTEM_ID;
        self.chunks = 0;
        self.chunks_at_last_check = 0;
        self.phase = LogPhase::AwaitingAck;
        self.send_start_command();
        Ok(path)
    }

    /// Asks the flight stack to stop, writes out what is left and syncs the
    /// file.
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            error!("ULog not started");
            return;
        };

        self.queue(command_long(MavCmd::MAV_CMD_LOGGING_STOP, LOG_TARGET_SYSTEM_ID));

        if let Err(e) = session.reassembler.finish() {
            error!("Unable to write the last ULog record: {}", e);
        }
        if let Err(e) = session.reassembler.get_ref().sync_all() {
            error!("Unable to sync {}: {}", session.path.display(), e);
        }
        info!("ULog session {} closed", session.path.display());

        self.phase = LogPhase::Stopped;
        self.system_id = 0;
    }

    /// Queues `MAV_CMD_LOGGING_START` for the flight stack.
    pub fn send_start_command(&mut self) {
        self.queue(command_long(MavCmd::MAV_CMD_LOGGING_START, LOG_TARGET_SYSTEM_ID));
    }

    /// Returns `true` if no chunk was accepted since the previous check.
    pub fn check_stalled(&mut self) -> bool {
        let stalled = self.chunks == self.chunks_at_last_check;
        self.chunks_at_last_check = self.chunks;
        stalled
    }

    fn queue(&mut self, message: MavMessage) {
        let header = local_header(LOG_SYSTEM_ID, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        match MavlinkFrame::encode_v2(header, message) {
            Ok(frame) => self.outbox.push_back(frame),
            Err(e) => error!("ULog: {}", e),
        }
    }

    fn handle_command_ack(&mut self, command: MavCmd, result: MavResult) {
        if self.phase != LogPhase::AwaitingAck || command != MavCmd::MAV_CMD_LOGGING_START {
            return;
        }
        if result == MavResult::MAV_RESULT_ACCEPTED {
            debug!("MAV_CMD_LOGGING_START accepted");
            self.phase = LogPhase::Streaming;
        } else {
            error!(
                "MAV_CMD_LOGGING_START result({:?}) is different than accepted",
                result
            );
        }
    }

    fn handle_chunk(&mut self, chunk: LogChunk<'_>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.reassembler.process(&chunk) {
            Ok(ChunkOutcome::Accepted { .. }) => self.chunks += 1,
            Ok(_) => {}
            Err(e) => error!("ULog session rejected: {}", e),
        }
    }
}

/// Creates `<dir>/<timestamp>[_n].ulg`, taking the first free name.
fn create_log_file(dir: &Path) -> Result<(PathBuf, File)> {
    fs::create_dir_all(dir).map_err(|e| RouterError::filesystem(dir.display().to_string(), e))?;

    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    for i in 0..u16::MAX {
        let file_name = if i == 0 {
            format!("{stamp}.{LOG_EXTENSION}")
        } else {
            format!("{stamp}_{i}.{LOG_EXTENSION}")
        };
        let path = dir.join(file_name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o444)
            .open(&path)
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(RouterError::filesystem(path.display().to_string(), e)),
        }
    }

    Err(RouterError::endpoint_init(
        "Log",
        "unable to create a ULog file without overriding another file",
    ))
}

impl Endpoint for LogEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_msg(&mut self) -> io::Result<Option<MavlinkFrame>> {
        let frame = self.outbox.pop_front();
        if let Some(frame) = &frame {
            self.stats.record_read(frame.len());
        }
        Ok(frame)
    }

    fn write_msg(&mut self, frame: &MavlinkFrame) -> io::Result<WriteStatus> {
        match &frame.message {
            Some(MavMessage::COMMAND_ACK(ack)) => {
                self.handle_command_ack(ack.command, ack.result);
            }
            Some(MavMessage::LOGGING_DATA_ACKED(d)) => {
                self.queue(logging_ack(d.sequence, LOG_TARGET_SYSTEM_ID));
                let len = (d.length as usize).min(d.data.len());
                self.handle_chunk(LogChunk {
                    sequence: d.sequence,
                    first_message_offset: d.first_message_offset,
                    data: &d.data[..len],
                });
            }
            Some(MavMessage::LOGGING_DATA(d)) => {
                let len = (d.length as usize).min(d.data.len());
                self.handle_chunk(LogChunk {
                    sequence: d.sequence,
                    first_message_offset: d.first_message_offset,
                    data: &d.data[..len],
                });
            }
            _ => return Ok(WriteStatus::Written(frame.len())),
        }

        self.stats.record_write(frame.len());
        Ok(WriteStatus::Written(frame.len()))
    }

    fn flush_pending_msgs(&mut self) -> io::Result<FlushStatus> {
        if let Some(session) = self.session.as_mut() {
            session.reassembler.flush()?;
            if session.reassembler.pending_partial() > 0 {
                warn!("ULog file still has a partial record pending");
                return Ok(FlushStatus::WouldBlock);
            }
        }
        Ok(FlushStatus::Drained)
    }

    fn system_id(&self) -> u8 {
        self.system_id
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        None
    }

    fn stats(&self) -> &EndpointStats {
        &self.stats
    }
}
