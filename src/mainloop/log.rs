//! Log session timing and the log sink's outgoing traffic.
//!
//! The sink reports which [`LogPhase`] its session is in; the loop keeps the
//! matching timer armed: the start-command retry while the flight stack has
//! not accepted the session, the liveness check while it streams.

use super::Mainloop;
use crate::endpoint_core::Endpoint;
use crate::endpoints::log::{LogPhase, ALIVE_TIMEOUT, START_RETRY_PERIOD};
use crate::error::{Result, RouterError};
use crate::timeout::{TimeoutHandle, TimerAction};
use tracing::{error, warn};

#[derive(Debug, Default)]
pub(super) struct LogTimers {
    start: Option<TimeoutHandle>,
    alive: Option<TimeoutHandle>,
}

impl Mainloop {
    /// Starts a log session on the configured log sink.
    pub fn start_log(&mut self) -> Result<()> {
        let log = self
            .registry
            .log_mut()
            .ok_or_else(|| RouterError::internal("no log sink configured"))?;
        log.start()?;
        self.service_log();
        Ok(())
    }

    /// Stops the running log session, if any.
    pub fn stop_log(&mut self) {
        if let Some(log) = self.registry.log_mut() {
            log.stop();
        }
        self.service_log();
    }

    /// Brings the log timers in line with the session phase and routes
    /// whatever the sink has queued for the flight stack.
    pub(super) fn service_log(&mut self) {
        self.reconcile_log_timers();

        loop {
            let Some(log) = self.registry.log_mut() else {
                return;
            };
            match log.read_msg() {
                Ok(Some(frame)) => {
                    let target = frame.target();
                    self.route_msg(&frame, target.system_id, frame.header.system_id);
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    fn reconcile_log_timers(&mut self) {
        let phase = self
            .registry
            .log()
            .map_or(LogPhase::Stopped, |l| l.phase());

        let want_start = phase == LogPhase::AwaitingAck;
        match (want_start, self.log_timers.start) {
            (true, None) => {
                let res = self.add_timeout(START_RETRY_PERIOD, |ml: &mut Mainloop| {
                    if let Some(log) = ml.registry.log_mut() {
                        log.send_start_command();
                    }
                    TimerAction::Continue
                });
                match res {
                    Ok(h) => self.log_timers.start = Some(h),
                    Err(e) => error!("Unable to add ULog start timeout: {}", e),
                }
            }
            (false, Some(h)) => {
                self.del_timeout(h);
                self.log_timers.start = None;
            }
            _ => {}
        }

        let want_alive = phase == LogPhase::Streaming;
        match (want_alive, self.log_timers.alive) {
            (true, None) => {
                let res = self.add_timeout(ALIVE_TIMEOUT, |ml: &mut Mainloop| {
                    ml.check_log_alive();
                    TimerAction::Continue
                });
                match res {
                    Ok(h) => self.log_timers.alive = Some(h),
                    Err(e) => error!("Unable to add ULog alive timeout: {}", e),
                }
            }
            (false, Some(h)) => {
                self.del_timeout(h);
                self.log_timers.alive = None;
            }
            _ => {}
        }
    }

    /// Restarts a session that has not delivered a chunk for a whole
    /// liveness period.
    fn check_log_alive(&mut self) {
        let Some(log) = self.registry.log_mut() else {
            return;
        };
        if !log.check_stalled() {
            return;
        }

        warn!(
            "No ULog messages received in {} seconds restarting ULog...",
            ALIVE_TIMEOUT.as_secs()
        );
        log.stop();
        if let Err(e) = log.start() {
            error!("Could not restart ULog: {}", e);
        }
    }
}
