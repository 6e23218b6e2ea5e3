//! The readiness-driven event loop.
//!
//! One thread, one `mio::Poll`. Every iteration waits for readiness (or for
//! the nearest timer deadline), drains each ready endpoint frame by frame
//! and routes every frame synchronously to its destination(s). Nothing is
//! queued between iterations except the bytes a destination could not take
//! yet, which the destination keeps itself until it reports
//! write-readiness.
//!
//! Endpoints that fail are never removed while events are being
//! dispatched. TCP endpoints are marked and swept at the end of the
//! iteration, timers likewise.

mod log;
mod tcp;

use crate::config::{Config, EndpointConfig};
use crate::endpoint_core::{Endpoint, FlushStatus, WriteStatus};
use crate::endpoints::log::LogEndpoint;
use crate::endpoints::serial::SerialEndpoint;
use crate::endpoints::tcp::TcpEndpoint;
use crate::endpoints::udp::UdpEndpoint;
use crate::error::{is_hangup, Result, RouterError};
use crate::framing::MavlinkFrame;
use crate::registry::{EndpointId, EndpointRegistry, LISTENER_TOKEN};
use crate::timeout::{fire_due, HasTimeouts, TimeoutHandle, TimerAction, Timeouts};
use mio::event::Source;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use self::log::LogTimers;

const MAX_EVENTS: usize = 8;
const STATS_PERIOD: Duration = Duration::from_secs(1);

/// Where [`Mainloop::route_msg`] sent a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the first endpoint that learned the target system id.
    Targeted(EndpointId),
    /// Broadcast; carries the number of endpoints written to.
    Broadcast(usize),
    /// No endpoint knows the target system id; the frame was dropped.
    UnknownTarget,
}

/// Thin wrapper around the readiness multiplexer.
///
/// Kept apart from the endpoint registry so an endpoint can be borrowed
/// from the registry while its readiness interest is changed.
#[derive(Default)]
pub struct Poller {
    poll: Option<Poll>,
}

impl Poller {
    fn registry(&self) -> Result<&mio::Registry> {
        self.poll
            .as_ref()
            .map(Poll::registry)
            .ok_or_else(|| RouterError::internal("mainloop is not open"))
    }

    /// Starts watching `source` for `interest`, reporting it as `token`.
    pub fn add_fd(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        self.registry()?
            .register(source, token, interest)
            .map_err(RouterError::Poll)
    }

    /// Changes the watched interest of an already registered source.
    pub fn mod_fd(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        self.registry()?
            .reregister(source, token, interest)
            .map_err(RouterError::Poll)
    }

    pub fn remove_fd(&self, source: &mut dyn Source) -> Result<()> {
        self.registry()?.deregister(source).map_err(RouterError::Poll)
    }
}

pub struct Mainloop {
    poller: Poller,
    events: Events,
    registry: EndpointRegistry,
    listener: Option<TcpListener>,
    timeouts: Timeouts<Mainloop>,
    log_timers: LogTimers,
    exit: Arc<AtomicBool>,
}

impl HasTimeouts for Mainloop {
    fn timeouts(&mut self) -> &mut Timeouts<Self> {
        &mut self.timeouts
    }
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Mainloop {
    /// Creates a loop that is not open yet; see [`Mainloop::open`].
    pub fn new() -> Self {
        Self {
            poller: Poller::default(),
            events: Events::with_capacity(MAX_EVENTS),
            registry: EndpointRegistry::new(),
            listener: None,
            timeouts: Timeouts::new(),
            log_timers: LogTimers::default(),
            exit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquires the readiness multiplexer.
    ///
    /// # Errors
    ///
    /// Fails if the loop is already open or the multiplexer cannot be
    /// created.
    pub fn open(&mut self) -> Result<()> {
        if self.poller.poll.is_some() {
            return Err(RouterError::internal("mainloop already open"));
        }
        self.poller.poll = Some(Poll::new().map_err(RouterError::Poll)?);
        Ok(())
    }

    pub fn add_fd(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        self.poller.add_fd(source, token, interest)
    }

    pub fn mod_fd(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        self.poller.mod_fd(source, token, interest)
    }

    pub fn remove_fd(&self, source: &mut dyn Source) -> Result<()> {
        self.poller.remove_fd(source)
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EndpointRegistry {
        &mut self.registry
    }

    /// Flag that ends [`Mainloop::run`] once set.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn should_exit(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    /// Registers a periodic timer on the loop.
    pub fn add_timeout<F>(&mut self, period: Duration, callback: F) -> Result<TimeoutHandle>
    where
        F: FnMut(&mut Mainloop) -> TimerAction + 'static,
    {
        self.timeouts.add(period, callback)
    }

    /// Marks a timer for removal at the end of the current iteration.
    pub fn del_timeout(&mut self, handle: TimeoutHandle) {
        self.timeouts.del(handle);
    }

    /// Number of timers that are still armed.
    pub fn active_timeouts(&self) -> usize {
        self.timeouts.len()
    }

    /// Adds a fixed endpoint and starts watching it for input.
    pub fn add_endpoint(&mut self, endpoint: Box<dyn Endpoint>) -> Result<EndpointId> {
        let id = self.registry.add_fixed(endpoint);
        if let (Some(token), Some(ep)) = (id.token(), self.registry.get_mut(id)) {
            if let Some(source) = ep.source() {
                self.poller.add_fd(source, token, Interest::READABLE)?;
            }
        }
        Ok(id)
    }

    /// Creates every endpoint named by `config`.
    ///
    /// A serial or UDP endpoint that cannot be opened, or a listening port
    /// that cannot be bound, fails startup. Outbound TCP endpoints only
    /// start connecting here; one whose attempt fails is handed to the
    /// retry timer if it has a retry period and dropped otherwise.
    pub fn add_endpoints(&mut self, config: &Config) -> Result<()> {
        for conf in &config.endpoint {
            match conf {
                EndpointConfig::Serial { device, baud } => {
                    let ep = SerialEndpoint::open(device, *baud)?;
                    self.add_endpoint(Box::new(ep))?;
                }
                EndpointConfig::Udp { address, mode } => {
                    let ep = UdpEndpoint::open(address, *mode).map_err(|e| {
                        error!("Could not open {}", address);
                        e
                    })?;
                    self.add_endpoint(Box::new(ep))?;
                }
                EndpointConfig::Tcp { address, .. } => {
                    let mut ep = TcpEndpoint::outbound(address.clone(), conf.retry_timeout());
                    match ep.reopen() {
                        Ok(()) => {
                            if self.add_tcp_endpoint(ep).is_err() {
                                return Err(RouterError::endpoint_init(
                                    "TCP",
                                    format!("could not watch {address}"),
                                ));
                            }
                        }
                        Err(e) => {
                            error!("Could not open {}: {}", address, e);
                            if !ep.retry_timeout().is_zero() {
                                self.add_tcp_retry(ep);
                            }
                        }
                    }
                }
            }
        }

        if let Some(port) = config.general.tcp_port {
            self.listen(std::net::SocketAddr::from(([0, 0, 0, 0], port)))?;
        }

        if let Some(dir) = &config.general.log {
            self.registry.set_log(LogEndpoint::new(dir.clone()));
        }

        if config.general.report_stats {
            self.add_timeout(STATS_PERIOD, |ml: &mut Mainloop| {
                ml.print_statistics();
                TimerAction::Continue
            })?;
        }

        Ok(())
    }

    /// Writes `frame` to one endpoint, arming write-readiness if it would
    /// block and marking a TCP endpoint whose peer went away.
    ///
    /// Returns whether the endpoint took the frame (written or parked).
    pub fn write_msg(&mut self, id: EndpointId, frame: &MavlinkFrame) -> bool {
        deliver(&self.poller, &mut self.registry, id, frame)
    }

    /// Routes `frame` by target system id.
    ///
    /// A positive `target_sysid` goes to the first endpoint (fixed ones
    /// before TCP) that learned that id, or is dropped with an error log if
    /// none did. Target 0 goes to every endpoint whose id differs from
    /// `sender_sysid`.
    pub fn route_msg(&mut self, frame: &MavlinkFrame, target_sysid: u8, sender_sysid: u8) -> RouteOutcome {
        if target_sysid > 0 {
            return match self.registry.find_by_system_id(target_sysid) {
                Some(id) => {
                    trace!(
                        "Routing message from {} to endpoint {} ({:?})",
                        sender_sysid,
                        target_sysid,
                        id
                    );
                    deliver(&self.poller, &mut self.registry, id, frame);
                    RouteOutcome::Targeted(id)
                }
                None => {
                    error!("Message to unknown sysid: {}", target_sysid);
                    RouteOutcome::UnknownTarget
                }
            };
        }

        trace!("Routing message from {} to all other known endpoints", sender_sysid);
        let mut delivered = 0;
        let mut cursor = self.registry.first();
        while let Some(id) = cursor {
            let skip = self
                .registry
                .get(id)
                .map_or(true, |e| e.system_id() == sender_sysid);
            if !skip && deliver(&self.poller, &mut self.registry, id, frame) {
                delivered += 1;
            }
            cursor = self.registry.next(id);
        }
        RouteOutcome::Broadcast(delivered)
    }

    /// Reads every frame an endpoint has available and routes each one.
    pub fn handle_read(&mut self, id: EndpointId) {
        loop {
            let Some(ep) = self.registry.get_mut(id) else {
                return;
            };
            match ep.read_msg() {
                Ok(Some(frame)) => {
                    let target = frame.target();
                    self.route_msg(&frame, target.system_id, frame.header.system_id);
                }
                Ok(None) => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    endpoint_failed(&mut self.registry, id, "Read", &e);
                    return;
                }
            }
        }
    }

    /// Flushes parked output after write-readiness and stops watching for
    /// it once the endpoint is drained.
    pub fn handle_canwrite(&mut self, id: EndpointId) {
        let Some(ep) = self.registry.get_mut(id) else {
            return;
        };
        match ep.flush_pending_msgs() {
            Ok(FlushStatus::Drained) => {
                if let (Some(token), Some(source)) = (id.token(), ep.source()) {
                    if let Err(e) = self.poller.mod_fd(source, token, Interest::READABLE) {
                        warn!("Could not stop watching {:?} for output: {}", id, e);
                    }
                }
            }
            Ok(FlushStatus::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => endpoint_failed(&mut self.registry, id, "Flush", &e),
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        if token == LISTENER_TOKEN {
            self.handle_tcp_connection();
            return;
        }
        let Some(id) = EndpointId::from_token(token) else {
            return;
        };
        if let EndpointId::Tcp(slot) = id {
            if self.registry.is_marked(slot) {
                return;
            }
            if self.registry.tcp(slot).is_some_and(TcpEndpoint::is_connecting)
                && !self.finish_tcp_connect(slot)
            {
                return;
            }
        }

        if readable {
            self.handle_read(id);
        }
        if writable {
            self.handle_canwrite(id);
        }
    }

    /// Runs one loop iteration, waiting at most `timeout` (or until the
    /// next timer is due, whichever is sooner; `None` waits for readiness
    /// alone).
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let timer_wait = self
            .timeouts
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let wait = match (timeout, timer_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        let polled = match self.poller.poll.as_mut() {
            Some(poll) => poll.poll(&mut events, wait),
            None => {
                self.events = events;
                return Err(RouterError::internal("mainloop is not open"));
            }
        };
        match polled {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => events.clear(),
            Err(e) => {
                self.events = events;
                return Err(RouterError::Poll(e));
            }
        }

        for event in events.iter() {
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            self.dispatch(event.token(), readable, event.is_writable());
        }
        self.events = events;

        fire_due(self, Instant::now());
        self.service_log();

        if self.registry.has_marked_tcp() {
            self.process_tcp_hangups();
        }

        self.timeouts.sweep();
        Ok(())
    }

    /// Runs until SIGINT/SIGTERM or [`Mainloop::request_exit`].
    ///
    /// Starts the log session first if a log sink is configured and stops it
    /// on the way out; all remaining timers are released before returning.
    pub fn run(&mut self) -> Result<()> {
        self.setup_signal_handlers()?;

        if self.registry.log().is_some() {
            if let Err(e) = self.start_log() {
                error!("Could not start ULog: {}", e);
            }
        }

        while !self.should_exit() {
            self.run_once(None)?;
        }

        info!("Exiting mainloop");
        if self.registry.log().is_some_and(|l| l.session_path().is_some()) {
            self.stop_log();
        }
        self.timeouts.clear();
        Ok(())
    }

    fn setup_signal_handlers(&self) -> Result<()> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.exit))
                .map_err(|e| RouterError::internal(format!("could not install signal handler: {e}")))?;
        }
        Ok(())
    }

    /// Logs the traffic counters of every endpoint.
    pub fn print_statistics(&self) {
        for id in self.registry.ids() {
            if let Some(ep) = self.registry.get(id) {
                info!("{}: {}", ep.name(), ep.stats());
            }
        }
    }
}

/// Writes `frame` to the endpoint `id`; see [`Mainloop::write_msg`].
fn deliver(poller: &Poller, registry: &mut EndpointRegistry, id: EndpointId, frame: &MavlinkFrame) -> bool {
    let Some(ep) = registry.get_mut(id) else {
        return false;
    };
    match ep.write_msg(frame) {
        Ok(WriteStatus::Written(_)) => true,
        Ok(WriteStatus::WouldBlock) => {
            if let (Some(token), Some(source)) = (id.token(), ep.source()) {
                if let Err(e) =
                    poller.mod_fd(source, token, Interest::READABLE | Interest::WRITABLE)
                {
                    warn!("Could not watch {:?} for output: {}", id, e);
                }
            }
            true
        }
        Err(e) => {
            endpoint_failed(registry, id, "Write", &e);
            false
        }
    }
}

/// Reports an I/O failure of `op` on the endpoint `id`.
///
/// Any failure ends a TCP connection: the endpoint is marked and the sweep
/// at the end of the iteration closes it. Other endpoints stay in place.
fn endpoint_failed(registry: &mut EndpointRegistry, id: EndpointId, op: &str, err: &io::Error) {
    let name = registry
        .get(id)
        .map(|e| e.name().to_string())
        .unwrap_or_default();
    match id {
        EndpointId::Tcp(slot) => {
            if is_hangup(err) {
                debug!("{} hung up: {}", name, err);
            } else {
                warn!("{} error on {}, closing: {}", op, name, err);
            }
            registry.mark_tcp(slot);
        }
        _ if is_hangup(err) => debug!("{} hung up: {}", name, err),
        _ => warn!("{} error on {}: {}", op, name, err),
    }
}
