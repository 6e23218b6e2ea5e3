//! Serial endpoint for MAVLink communications.
//!
//! This is typically the link to the flight controller. The port is opened
//! non-blocking at the configured baud rate and shares the stream read/write
//! core with TCP. A tty that has nothing to read reports zero bytes; that is
//! not a hangup.

use crate::endpoint_core::{Endpoint, FlushStatus, StreamCore, WriteStatus};
use crate::error::{Result, RouterError};
use crate::framing::MavlinkFrame;
use crate::stats::EndpointStats;
use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use mio_serial::{SerialPortBuilderExt, SerialStream};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{info, warn};

/// Registers a raw descriptor with the poller.
///
/// The serial stream is handed to `mio` by descriptor so the endpoint does
/// not depend on the `mio` version `mio-serial` was built against.
#[derive(Debug, Clone, Copy)]
pub struct FdSource(RawFd);

impl Source for FdSource {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.0).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.0).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.0).deregister(registry)
    }
}

pub struct SerialEndpoint {
    name: String,
    port: SerialStream,
    fd: FdSource,
    core: StreamCore,
}

impl SerialEndpoint {
    /// Opens `device` at `baud`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Serial`] if the port cannot be opened or
    /// configured.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let mut port = mio_serial::new(device, baud)
            .open_native_async()
            .map_err(|e| RouterError::serial(device, e))?;

        if let Err(e) = port.set_exclusive(false) {
            warn!("Failed to set exclusive mode on {}: {}", device, e);
        }

        info!("Serial endpoint {} opened at {} baud", device, baud);

        let fd = FdSource(port.as_raw_fd());
        Ok(Self {
            name: device.to_string(),
            port,
            fd,
            core: StreamCore::new(),
        })
    }
}

impl Endpoint for SerialEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_msg(&mut self) -> io::Result<Option<MavlinkFrame>> {
        self.core.read_frame(&mut self.port, false)
    }

    fn write_msg(&mut self, frame: &MavlinkFrame) -> io::Result<WriteStatus> {
        self.core.write_frame(&mut self.port, frame)
    }

    fn flush_pending_msgs(&mut self) -> io::Result<FlushStatus> {
        self.core.flush(&mut self.port)
    }

    fn system_id(&self) -> u8 {
        self.core.system_id()
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(&mut self.fd)
    }

    fn stats(&self) -> &EndpointStats {
        &self.core.stats
    }
}
