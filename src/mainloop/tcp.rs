//! TCP connection management: inbound accepts, the hangup sweep and the
//! reconnection timer for outbound endpoints.

use super::Mainloop;
use crate::endpoint_core::Endpoint;
use crate::endpoints::tcp::TcpEndpoint;
use crate::error::{Result, RouterError};
use crate::registry::{EndpointId, LISTENER_TOKEN};
use crate::timeout::TimerAction;
use mio::net::TcpListener;
use mio::Interest;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

impl Mainloop {
    /// Binds the inbound TCP listening socket and starts accepting on it.
    /// Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr).map_err(|e| RouterError::network(addr.to_string(), e))?;
        self.poller
            .add_fd(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local = listener
            .local_addr()
            .map_err(|e| RouterError::network(addr.to_string(), e))?;
        info!("Listening for TCP connections on {}", local);
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accepts every pending inbound connection.
    pub fn handle_tcp_connection(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    let ep = TcpEndpoint::from_accepted(stream, peer);
                    if let Ok(id) = self.add_tcp_endpoint(ep) {
                        info!("Accepted TCP connection from {} ({:?})", peer, id);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Could not accept TCP connection: {}", e);
                    return;
                }
            }
        }
    }

    /// Stores a connected (or connecting) TCP endpoint and starts watching
    /// it. A connection still in progress is watched for write-readiness
    /// too, which is how its outcome is reported.
    ///
    /// On failure the endpoint is handed back, already out of the registry.
    pub fn add_tcp_endpoint(&mut self, endpoint: TcpEndpoint) -> std::result::Result<EndpointId, TcpEndpoint> {
        let interest = if endpoint.is_connecting() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let id = self.registry.insert_tcp(endpoint);

        let registered = match (id.token(), self.registry.get_mut(id)) {
            (Some(token), Some(ep)) => match ep.source() {
                Some(source) => self.poller.add_fd(source, token, interest),
                None => Err(RouterError::internal("TCP endpoint is not connected")),
            },
            _ => Err(RouterError::internal("TCP slot vanished")),
        };

        match registered {
            Ok(()) => Ok(id),
            Err(e) => {
                error!("Could not watch TCP endpoint: {}", e);
                match self.registry.remove_tcp(id) {
                    Some(ep) => Err(ep),
                    None => Ok(id),
                }
            }
        }
    }

    /// Settles an outbound connection in progress after readiness was
    /// reported on it. A failed attempt is marked, so the sweep hands the
    /// endpoint to its retry timer.
    ///
    /// Returns whether the endpoint is connected and can do I/O.
    pub(super) fn finish_tcp_connect(&mut self, slot: usize) -> bool {
        let id = EndpointId::Tcp(slot);
        let Some(ep) = self.registry.tcp_mut(slot) else {
            return false;
        };
        match ep.finish_connect() {
            Ok(true) => {
                info!("Connected to TCP endpoint {}", ep.address());
                if let (Some(token), Some(source)) = (id.token(), ep.source()) {
                    if let Err(e) = self.poller.mod_fd(source, token, Interest::READABLE) {
                        warn!("Could not stop watching {:?} for output: {}", id, e);
                    }
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Could not connect to TCP endpoint {}: {}", ep.address(), e);
                self.registry.mark_tcp(slot);
                false
            }
        }
    }

    /// Takes every TCP endpoint marked for removal out of the loop. Each one
    /// either goes to the retry timer, if it has a retry period, or is
    /// dropped.
    pub fn process_tcp_hangups(&mut self) {
        for (id, mut ep) in self.registry.take_marked_tcp() {
            if let Some(source) = ep.source() {
                if let Err(e) = self.poller.remove_fd(source) {
                    debug!("Could not stop watching {:?}: {}", id, e);
                }
            }
            info!("TCP connection {} closed", ep.name());
            ep.close();

            if !ep.retry_timeout().is_zero() {
                self.add_tcp_retry(ep);
            }
        }
    }

    /// Arms a timer that tries to reconnect `endpoint` every retry period.
    ///
    /// The timer retires once a connection attempt is under way; if that
    /// attempt fails, the hangup sweep arms a new one.
    pub fn add_tcp_retry(&mut self, endpoint: TcpEndpoint) {
        let period = endpoint.retry_timeout();
        let address = endpoint.address().to_string();
        let mut pending = Some(endpoint);

        let res = self.add_timeout(period, move |ml: &mut Mainloop| {
            let Some(mut ep) = pending.take() else {
                return TimerAction::Stop;
            };
            if let Err(e) = ep.reopen() {
                debug!("TCP retry to {} failed: {}", ep.address(), e);
                pending = Some(ep);
                return TimerAction::Continue;
            }
            match ml.add_tcp_endpoint(ep) {
                Ok(id) => {
                    debug!("TCP endpoint reconnecting ({:?})", id);
                    TimerAction::Stop
                }
                Err(mut ep) => {
                    ep.close();
                    pending = Some(ep);
                    TimerAction::Continue
                }
            }
        });

        match res {
            Ok(_) => info!("Retrying TCP connection to {} every {:?}", address, period),
            Err(e) => warn!("Could not create retry timeout for TCP endpoint {}: {}", address, e),
        }
    }
}
