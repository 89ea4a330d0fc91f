//! Cancellable timers that report back into the owning event loop.
//!
//! A timer never calls into state directly. It posts a [`TimerEvent`] carrying
//! its token, and the owner compares that token with the task it still holds.
//! Aborting the task plus the token check means a cancelled timer is never
//! observed, even if it fired just before the abort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    InviteTimeout,
    RecoveryCheck,
    StatsTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: TimerKind,
    pub token: u64,
}

/// Handle to a scheduled firing. Dropping it cancels the timer.
#[derive(Debug)]
pub struct ScheduledTask {
    token: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn matches(&self, event: &TimerEvent) -> bool {
        self.token == event.token
    }

    pub fn cancel(self) {
        // Drop aborts.
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
    next_token: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(tx: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            tx,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Creates a scheduler together with the receiving end of its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Fires once after `delay`.
    pub fn once(&self, kind: TimerKind, delay: Duration) -> ScheduledTask {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            trace!(?kind, token, "timer fired");
            let _ = tx.send(TimerEvent { kind, token });
        });
        ScheduledTask { token, handle }
    }

    /// Fires every `period`, first firing one period from now.
    pub fn every(&self, kind: TimerKind, period: Duration) -> ScheduledTask {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.send(TimerEvent { kind, token }).is_err() {
                    break;
                }
            }
        });
        ScheduledTask { token, handle }
    }
}
