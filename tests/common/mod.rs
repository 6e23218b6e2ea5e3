#![allow(dead_code)]

//! Shared helpers for the integration tests.

use mavlink::common::{MavMessage, HEARTBEAT_DATA};
use mavrouter_loop::endpoint_core::{Endpoint, FlushStatus, WriteStatus};
use mavrouter_loop::framing::MavlinkFrame;
use mavrouter_loop::mavlink_utils::local_header;
use mavrouter_loop::stats::EndpointStats;
use mio::event::Source;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// Test-visible side of a [`MockEndpoint`].
#[derive(Default)]
pub struct MockState {
    /// Frames handed out by `read_msg`, front first.
    pub inbox: VecDeque<MavlinkFrame>,
    /// Frames the endpoint accepted, in order.
    pub written: Vec<MavlinkFrame>,
    /// Frames held back while `blocked` was set.
    pub parked: Vec<MavlinkFrame>,
    /// While set, writes are parked and flushes report `WouldBlock`.
    pub blocked: bool,
    /// While set, reads and writes fail as if the peer went away.
    pub hung_up: bool,
}

pub type Shared = Rc<RefCell<MockState>>;

/// An endpoint without a descriptor. Reads come from `MockState::inbox`,
/// writes land in `MockState::written`.
pub struct MockEndpoint {
    name: String,
    system_id: u8,
    state: Shared,
    stats: EndpointStats,
}

impl MockEndpoint {
    pub fn new(name: &str) -> (Self, Shared) {
        let state = Shared::default();
        let ep = Self {
            name: name.to_string(),
            system_id: 0,
            state: Rc::clone(&state),
            stats: EndpointStats::default(),
        };
        (ep, state)
    }

    /// Mock that already knows its peer's system id.
    pub fn with_system_id(name: &str, system_id: u8) -> (Self, Shared) {
        let (mut ep, state) = Self::new(name);
        ep.system_id = system_id;
        (ep, state)
    }
}

impl Endpoint for MockEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_msg(&mut self) -> io::Result<Option<MavlinkFrame>> {
        let mut state = self.state.borrow_mut();
        if state.hung_up {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let frame = state.inbox.pop_front();
        if let Some(frame) = &frame {
            if self.system_id == 0 {
                self.system_id = frame.header.system_id;
            }
            self.stats.record_read(frame.len());
        }
        Ok(frame)
    }

    fn write_msg(&mut self, frame: &MavlinkFrame) -> io::Result<WriteStatus> {
        let mut state = self.state.borrow_mut();
        if state.hung_up {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if state.blocked {
            state.parked.push(frame.clone());
            return Ok(WriteStatus::WouldBlock);
        }
        state.written.push(frame.clone());
        self.stats.record_write(frame.len());
        Ok(WriteStatus::Written(frame.len()))
    }

    fn flush_pending_msgs(&mut self) -> io::Result<FlushStatus> {
        let mut state = self.state.borrow_mut();
        if state.blocked {
            return Ok(FlushStatus::WouldBlock);
        }
        let parked = std::mem::take(&mut state.parked);
        for frame in parked {
            self.stats.record_write(frame.len());
            state.written.push(frame);
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

pub fn heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA::default())
}

/// Encodes `message` as a MAVLink 2 frame from `system_id`.
pub fn frame_from(system_id: u8, message: MavMessage) -> MavlinkFrame {
    MavlinkFrame::encode_v2(local_header(system_id, 0), message).expect("encode frame")
}
