//! Cooperative periodic timers.
//!
//! Timers are deadlines kept next to the event loop; the nearest one bounds
//! how long the loop may block in `poll`. A timer callback receives the
//! owning context mutably and answers [`TimerAction::Continue`] to keep
//! firing or [`TimerAction::Stop`] to be removed.
//!
//! Removal is lazy: [`Timeouts::del`] and a `Stop` answer only mark the
//! timer, and [`Timeouts::sweep`] drops marked timers once per loop
//! iteration. That makes it safe for a callback to cancel itself or any
//! other timer while timers are being fired.

use crate::error::{Result, RouterError};
use ahash::AHashMap;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Continue,
    Stop,
}

/// Handle identifying a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutHandle(u64);

pub type TimerCallback<C> = Box<dyn FnMut(&mut C) -> TimerAction>;

struct Timer<C> {
    period: Duration,
    deadline: Instant,
    remove_me: bool,
    callback: Option<TimerCallback<C>>,
}

/// The set of live timers of a context `C`.
pub struct Timeouts<C> {
    timers: AHashMap<TimeoutHandle, Timer<C>>,
    next_id: u64,
}

impl<C> Default for Timeouts<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Timeouts<C> {
    pub fn new() -> Self {
        Self {
            timers: AHashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a periodic timer first firing one `period` from now.
    pub fn add<F>(&mut self, period: Duration, callback: F) -> Result<TimeoutHandle>
    where
        F: FnMut(&mut C) -> TimerAction + 'static,
    {
        if period.is_zero() {
            return Err(RouterError::internal("timer period must be positive"));
        }

        let handle = TimeoutHandle(self.next_id);
        self.next_id += 1;
        self.timers.insert(
            handle,
            Timer {
                period,
                deadline: Instant::now() + period,
                remove_me: false,
                callback: Some(Box::new(callback)),
            },
        );
        trace!(?handle, ?period, "timer added");
        Ok(handle)
    }

    /// Marks a timer for removal. It will not fire again.
    pub fn del(&mut self, handle: TimeoutHandle) {
        if let Some(timer) = self.timers.get_mut(&handle) {
            timer.remove_me = true;
        }
    }

    pub fn is_active(&self, handle: TimeoutHandle) -> bool {
        self.timers.get(&handle).is_some_and(|t| !t.remove_me)
    }

    /// Number of timers not marked for removal.
    pub fn len(&self) -> usize {
        self.timers.values().filter(|t| !t.remove_me).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The earliest deadline among live timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .filter(|t| !t.remove_me)
            .map(|t| t.deadline)
            .min()
    }

    /// Live timers whose deadline is at or before `now`, earliest first.
    pub fn due(&self, now: Instant) -> Vec<TimeoutHandle> {
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|(_, t)| !t.remove_me && t.deadline <= now)
            .map(|(h, t)| (t.deadline, *h))
            .collect();
        due.sort();
        due.into_iter().map(|(_, h)| h).collect()
    }

    /// Drops every timer marked for removal.
    pub fn sweep(&mut self) {
        self.timers.retain(|_, t| !t.remove_me);
    }

    /// Releases all timers.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    fn take_callback(&mut self, handle: TimeoutHandle) -> Option<TimerCallback<C>> {
        let timer = self.timers.get_mut(&handle)?;
        if timer.remove_me {
            return None;
        }
        timer.callback.take()
    }

    fn restore(&mut self, handle: TimeoutHandle, callback: TimerCallback<C>, action: TimerAction, now: Instant) {
        if let Some(timer) = self.timers.get_mut(&handle) {
            timer.callback = Some(callback);
            match action {
                TimerAction::Continue => timer.deadline = now + timer.period,
                TimerAction::Stop => timer.remove_me = true,
            }
        }
    }
}

/// A context that owns its own timers.
pub trait HasTimeouts: Sized {
    fn timeouts(&mut self) -> &mut Timeouts<Self>;
}

/// Fires every timer of `ctx` that is due at `now`.
///
/// A timer that fell behind by several periods fires once and is
/// rescheduled one period after `now`. Returns how many callbacks ran.
pub fn fire_due<C: HasTimeouts>(ctx: &mut C, now: Instant) -> usize {
    let due = ctx.timeouts().due(now);
    let mut fired = 0;

    for handle in due {
        // Skipped if an earlier callback in this pass removed it.
        let Some(mut callback) = ctx.timeouts().take_callback(handle) else {
            continue;
        };
        let action = callback(ctx);
        ctx.timeouts().restore(handle, callback, action, now);
        fired += 1;
    }

    fired
}
