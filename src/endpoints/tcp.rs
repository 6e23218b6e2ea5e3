//! TCP endpoint for MAVLink communications.
//!
//! A TCP endpoint is either a connection accepted on the router's listening
//! port or an outbound connection to a configured address. Outbound
//! endpoints survive their connection: [`TcpEndpoint::close`] drops the
//! socket and everything learned from it, and [`TcpEndpoint::reopen`] dials
//! the same address again. Whether and how often that happens is up to the
//! mainloop's retry timer.
//!
//! Dialing never blocks. [`TcpEndpoint::reopen`] only starts the connection;
//! the mainloop watches the socket for write-readiness and settles it with
//! [`TcpEndpoint::finish_connect`].

use crate::endpoint_core::{Endpoint, FlushStatus, StreamCore, WriteStatus};
use crate::error::{Result, RouterError};
use crate::framing::MavlinkFrame;
use crate::stats::EndpointStats;
use mio::event::Source;
use mio::net::TcpStream;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

pub struct TcpEndpoint {
    name: String,
    address: String,
    stream: Option<TcpStream>,
    /// Set between starting an outbound connection and its outcome.
    connecting: bool,
    retry_timeout: Duration,
    core: StreamCore,
}

impl TcpEndpoint {
    /// Wraps a connection accepted on the listening socket.
    pub fn from_accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Self {
            name: format!("TCP {peer}"),
            address: peer.to_string(),
            stream: Some(stream),
            connecting: false,
            retry_timeout: Duration::ZERO,
            core: StreamCore::new(),
        }
    }

    /// An outbound endpoint for `address` that is not connected yet.
    ///
    /// A zero `retry_timeout` means the endpoint is discarded once its
    /// connection is lost.
    pub fn outbound(address: impl Into<String>, retry_timeout: Duration) -> Self {
        let address = address.into();
        Self {
            name: format!("TCP {address}"),
            address,
            stream: None,
            connecting: false,
            retry_timeout,
            core: StreamCore::new(),
        }
    }

    /// Starts connecting to the first resolved address that accepts a
    /// connection attempt. The outcome is known once the socket becomes
    /// writable; see [`TcpEndpoint::finish_connect`].
    pub fn reopen(&mut self) -> Result<()> {
        self.close();

        let addrs = self
            .address
            .to_socket_addrs()
            .map_err(|e| RouterError::network(&self.address, e))?;

        let mut last_err = io::Error::new(ErrorKind::NotFound, "address resolved to nothing");
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    debug!("Connecting to TCP endpoint {}", addr);
                    self.stream = Some(stream);
                    self.connecting = true;
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }

        Err(RouterError::network(&self.address, last_err))
    }

    /// Settles a connection started by [`TcpEndpoint::reopen`].
    ///
    /// Returns `Ok(true)` once connected and `Ok(false)` while the attempt
    /// is still in progress. An error means the attempt failed.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if !self.connecting {
            return Ok(self.stream.is_some());
        }
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;

        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", self.address, e);
                }
                self.connecting = false;
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotConnected | ErrorKind::WouldBlock) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drops the connection and forgets everything learned on it.
    pub fn close(&mut self) {
        self.stream = None;
        self.connecting = false;
        self.core.reset();
    }

    pub fn is_connecting(&self) -> bool {
        self.stream.is_some() && self.connecting
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.connecting
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }
}

impl Endpoint for TcpEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_msg(&mut self) -> io::Result<Option<MavlinkFrame>> {
        if self.connecting {
            return Ok(None);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        self.core.read_frame(stream, true)
    }

    fn write_msg(&mut self, frame: &MavlinkFrame) -> io::Result<WriteStatus> {
        // Nobody to talk to yet, same as a UDP server without a peer.
        if self.connecting {
            return Ok(WriteStatus::Written(0));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        self.core.write_frame(stream, frame)
    }

    fn flush_pending_msgs(&mut self) -> io::Result<FlushStatus> {
        if self.connecting {
            return Ok(FlushStatus::WouldBlock);
        }
        if self.core.tx.is_empty() {
            return Ok(FlushStatus::Drained);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        self.core.flush(stream)
    }

    fn system_id(&self) -> u8 {
        self.core.system_id()
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.stream.as_mut().map(|s| s as &mut dyn Source)
    }

    fn stats(&self) -> &EndpointStats {
        &self.core.stats
    }
}
