//! Cancellable timers keyed by kind.
//!
//! Each timer runs as a small tokio task that only sends a [`TimerFired`]
//! message back to its owner. [`Timers`] keeps one slot per [`TimerKind`]:
//! starting a kind cancels the previous instance of that kind, and every
//! start gets a new generation so a message from a cancelled instance that
//! was already queued is rejected by [`Timers::accept`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Recurring detection poll.
    Poll,
    /// Delay between the first single-face tick and verification.
    Stabilization,
    /// Upper bound on time spent detecting.
    NoFace,
    /// Automatic restart after a terminal failure.
    AutoRestart,
    /// How long the success message stays up before hand-off.
    SuccessDisplay,
    /// Gap between releasing the camera and setting up again.
    Settle,
}

impl TimerKind {
    pub const ALL: [TimerKind; 6] = [
        TimerKind::Poll,
        TimerKind::Stabilization,
        TimerKind::NoFace,
        TimerKind::AutoRestart,
        TimerKind::SuccessDisplay,
        TimerKind::Settle,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::Poll => 0,
            TimerKind::Stabilization => 1,
            TimerKind::NoFace => 2,
            TimerKind::AutoRestart => 3,
            TimerKind::SuccessDisplay => 4,
            TimerKind::Settle => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Handle to a spawned timer task. Cancelling twice is harmless; dropping
/// the handle cancels the task.
#[derive(Debug)]
pub struct TaskHandle {
    abort: AbortHandle,
    cancelled: bool,
}

impl TaskHandle {
    fn new(abort: AbortHandle) -> Self {
        Self {
            abort,
            cancelled: false,
        }
    }

    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.abort.abort();
            self.cancelled = true;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Slot {
    generation: u64,
    handle: TaskHandle,
    // Set only for repeating timers: cleared when a tick is sent, set again
    // once the owner has accepted it.
    armed: Option<Arc<AtomicBool>>,
}

pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    slots: [Option<Slot>; 6],
    next_generation: u64,
}

impl Timers {
    /// Create an empty timer set and the receiver its timers fire into.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Self {
            tx,
            slots: Default::default(),
            next_generation: 0,
        };
        (timers, rx)
    }

    /// Fire once after `delay`, replacing any pending timer of this kind.
    pub fn start_once(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        let generation = self.bump();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { kind, generation });
        });
        self.slots[kind.index()] = Some(Slot {
            generation,
            handle: TaskHandle::new(task.abort_handle()),
            armed: None,
        });
        tracing::trace!(?kind, generation, delay_ms = delay.as_millis() as u64, "timer started");
    }

    /// Fire every `period`, first after one period, replacing any pending
    /// timer of this kind. At most one tick is outstanding at a time.
    pub fn start_repeating(&mut self, kind: TimerKind, period: Duration) {
        self.cancel(kind);
        let generation = self.bump();
        let tx = self.tx.clone();
        let armed = Arc::new(AtomicBool::new(true));
        let task_armed = armed.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if task_armed.swap(false, Ordering::AcqRel)
                    && tx.send(TimerFired { kind, generation }).is_err()
                {
                    break;
                }
            }
        });
        self.slots[kind.index()] = Some(Slot {
            generation,
            handle: TaskHandle::new(task.abort_handle()),
            armed: Some(armed),
        });
        tracing::trace!(?kind, generation, period_ms = period.as_millis() as u64, "repeating timer started");
    }

    /// Cancel the pending timer of `kind`. Returns whether one was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slots[kind.index()].take() {
            Some(mut slot) => {
                slot.handle.cancel();
                tracing::trace!(?kind, generation = slot.generation, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    pub fn pending(&self) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|k| self.is_pending(*k))
            .collect()
    }

    /// Decide whether a fired message should be acted on.
    ///
    /// Returns `false` for messages from cancelled or replaced timers. An
    /// accepted one-shot leaves its slot empty; an accepted repeating tick
    /// re-arms the timer.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let idx = fired.kind.index();
        let current = match &self.slots[idx] {
            Some(slot) => slot.generation == fired.generation,
            None => false,
        };
        if !current {
            tracing::trace!(kind = ?fired.kind, generation = fired.generation, "stale timer ignored");
            return false;
        }

        match self.slots[idx].as_ref().and_then(|s| s.armed.as_ref()) {
            Some(armed) => armed.store(true, Ordering::Release),
            None => self.slots[idx] = None,
        }
        true
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut mpsc::UnboundedReceiver<TimerFired>, within: Duration) -> Option<TimerFired> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_after_delay() {
        let (mut timers, mut rx) = Timers::new();
        let started = Instant::now();
        timers.start_once(TimerKind::NoFace, Duration::from_millis(700));

        let fired = next(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(fired.kind, TimerKind::NoFace);
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert!(timers.accept(fired));
        assert!(!timers.is_pending(TimerKind::NoFace));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_a_kind_replaces_the_previous_instance() {
        let (mut timers, mut rx) = Timers::new();
        timers.start_once(TimerKind::Stabilization, Duration::from_millis(100));
        timers.start_once(TimerKind::Stabilization, Duration::from_millis(300));
        assert_eq!(timers.pending(), vec![TimerKind::Stabilization]);

        let fired = next(&mut rx, Duration::from_secs(1)).await.unwrap();
        assert!(timers.accept(fired));
        assert!(next(&mut rx, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_rejected() {
        let (mut timers, mut rx) = Timers::new();
        timers.start_once(TimerKind::AutoRestart, Duration::from_millis(10));
        let fired = next(&mut rx, Duration::from_secs(1)).await.unwrap();

        // Restarted before the queued message was handled.
        timers.start_once(TimerKind::AutoRestart, Duration::from_millis(10));
        assert!(!timers.accept(fired));
        assert!(timers.is_pending(TimerKind::AutoRestart));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut rx) = Timers::new();
        timers.start_once(TimerKind::Settle, Duration::from_millis(50));
        assert!(timers.cancel(TimerKind::Settle));
        assert!(!timers.cancel(TimerKind::Settle));
        assert!(next(&mut rx, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_ticks_coalesce_until_accepted() {
        let (mut timers, mut rx) = Timers::new();
        timers.start_repeating(TimerKind::Poll, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(550)).await;
        let first = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        assert!(timers.accept(first));
        assert!(timers.is_pending(TimerKind::Poll));
        let second = next(&mut rx, Duration::from_millis(150)).await.unwrap();
        assert_eq!(second.generation, first.generation);

        timers.cancel_all();
        assert!(timers.pending().is_empty());
        assert!(!timers.accept(second));
    }

    #[tokio::test]
    async fn task_handle_cancel_is_idempotent() {
        let task = tokio::spawn(std::future::pending::<()>());
        let mut handle = TaskHandle::new(task.abort_handle());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
