//! Timers owned by workflow controllers.
//!
//! Each controller keeps one [`TimerSlot`] per kind of timer. Installing a new
//! task into a slot aborts the previous one, and dropping the slot aborts
//! whatever is still running, so a countdown can never be applied twice.
//!
//! All tasks are spawned on the ambient tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Liveness flag shared between a controller and its in-flight work.
///
/// Cleared on teardown. Anything that completes later must check it before
/// touching the controller.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Holder for at most one running timer task.
#[derive(Debug)]
pub struct TimerSlot {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    /// Install `handle`, aborting whatever ran in this slot before.
    pub fn replace(&mut self, handle: JoinHandle<()>) {
        self.clear();
        debug!(timer = self.name, "Timer started");
        self.handle = Some(handle);
    }

    pub fn clear(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(timer = self.name, "Timer cleared");
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Whole seconds left until `deadline`, rounded up.
fn seconds_until(deadline: Instant) -> u64 {
    let left = deadline.saturating_duration_since(Instant::now());
    left.as_millis().div_ceil(1000) as u64
}

/// User-visible countdown in whole seconds.
///
/// The remaining value is always derived from a fixed deadline rather than
/// decremented, so reading it late or ticking late cannot make it drift. It
/// stops at zero and never goes below.
#[derive(Debug)]
pub struct Countdown {
    remaining: watch::Receiver<u64>,
    deadline: Instant,
    slot: TimerSlot,
}

impl Countdown {
    pub fn start(name: &'static str, seconds: u64, tick: Duration) -> Self {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(seconds);
        let (tx, rx) = watch::channel(seconds);
        let mut slot = TimerSlot::new(name);

        if seconds > 0 {
            slot.replace(tokio::spawn(async move {
                let mut ticker = interval_at(now + tick, tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let left = seconds_until(deadline);
                    trace!(timer = name, left, "Countdown tick");
                    if tx.send(left).is_err() || left == 0 {
                        break;
                    }
                }
            }));
        }

        Self {
            remaining: rx,
            deadline,
            slot,
        }
    }

    /// Last published value.
    pub fn remaining(&self) -> u64 {
        *self.remaining.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.remaining.clone()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_active()
    }

    pub fn stop(&mut self) {
        self.slot.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    Continue,
    Stop,
}

/// Call `poll` every `period` until it asks to stop or `liveness` is cleared.
pub fn spawn_poller<F>(period: Duration, liveness: Liveness, mut poll: F) -> JoinHandle<()>
where
    F: FnMut() -> PollControl + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !liveness.is_alive() {
                break;
            }
            if poll() == PollControl::Stop {
                break;
            }
        }
    })
}
