//! Maps the transport's two expiry timestamps onto host-provided timers.
//!
//! The host owns the actual timer machinery: the engine asks it to arm,
//! reset or cancel through the event callbacks and the host calls
//! `Session::timer_expired` when a timer fires. A `set_timer` that fires
//! before it can be armed is reported back as [`TimerArm::Fired`] and the
//! session dispatches it after the reconciliation pass returns, so the
//! callback edge never re-enters timer state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::transport::TIMESTAMP_NEVER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    LossDetection,
    AckDelay,
}

/// Host-defined token identifying an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Outcome of asking the host to arm a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerArm {
    Armed(TimerHandle),
    /// The deadline passed while arming; the host did not keep a timer.
    Fired,
    /// The host provides no timers; expiries are polled instead.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    target: u64,
    handle: Option<TimerHandle>,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            target: TIMESTAMP_NEVER,
            handle: None,
        }
    }
}

/// Reconciliation interface between transport expiries and host timers.
/// Hosts without timers keep the defaults and poll instead.
pub trait TimerHost {
    fn set_timer(&mut self, delay: Duration, kind: TimerKind) -> TimerArm {
        let _ = (delay, kind);
        TimerArm::Unsupported
    }

    fn reset_timer(&mut self, handle: TimerHandle, delay: Duration) {
        let _ = (handle, delay);
    }

    fn cancel_timer(&mut self, handle: TimerHandle) {
        let _ = handle;
    }
}

#[derive(Debug)]
pub struct Timers {
    loss: Slot,
    ack: Slot,
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    pub const fn new() -> Self {
        Timers {
            loss: Slot::new(),
            ack: Slot::new(),
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Slot {
        match kind {
            TimerKind::LossDetection => &mut self.loss,
            TimerKind::AckDelay => &mut self.ack,
        }
    }

    /// Reconcile one expiry timestamp against the armed host timer.
    ///
    /// Returns true when the deadline is already due; the caller dispatches
    /// the timeout after this returns.
    pub fn adjust<H: TimerHost>(
        &mut self,
        host: &mut H,
        kind: TimerKind,
        trigger: u64,
        now: u64,
    ) -> bool {
        let slot = self.slot(kind);
        if trigger == slot.target {
            return false;
        }
        slot.target = trigger;

        if trigger == TIMESTAMP_NEVER {
            if let Some(handle) = slot.handle.take() {
                host.cancel_timer(handle);
            }
            return false;
        }

        if trigger <= now {
            if let Some(handle) = slot.handle.take() {
                host.cancel_timer(handle);
            }
            slot.target = TIMESTAMP_NEVER;
            return true;
        }

        let delay = Duration::from_nanos(trigger - now);
        match slot.handle {
            Some(handle) => host.reset_timer(handle, delay),
            None => match host.set_timer(delay, kind) {
                TimerArm::Armed(handle) => slot.handle = Some(handle),
                TimerArm::Fired => {
                    slot.target = TIMESTAMP_NEVER;
                    return true;
                }
                TimerArm::Unsupported => {}
            },
        }

        false
    }

    /// Forget the armed state after the host reports an expiry.
    pub fn expired(&mut self, kind: TimerKind) {
        let slot = self.slot(kind);
        slot.target = TIMESTAMP_NEVER;
        slot.handle = None;
    }

    pub fn cancel_all<H: TimerHost>(&mut self, host: &mut H) {
        for kind in [TimerKind::LossDetection, TimerKind::AckDelay] {
            let slot = self.slot(kind);
            slot.target = TIMESTAMP_NEVER;
            if let Some(handle) = slot.handle.take() {
                host.cancel_timer(handle);
            }
        }
    }
}

/// Wall-clock nanoseconds, the timestamp base shared with the transport.
pub(crate) fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
