//! Cancellable deadline timers driven by the run's event loop
//!
//! A timer owns one sleeping task that posts a `Timer` event when it
//! wakes. Deadlines can move after arming: moving one later leaves the
//! task alone and the wake-up re-arms for the remaining time, moving one
//! earlier replaces the task. Every re-arm or cancel bumps the generation
//! so events from superseded tasks are recognised as stale.

use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::run::engine::{LoopEvent, LoopHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Waiting for an asynchronous setup to complete
    Setup,
    /// Waiting for the running iteration to complete
    Test,
    /// Owned by the test body (e.g. waiting for a stop acknowledgement)
    Guard,
}

/// What a timer event meant once it reached the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fire {
    /// Superseded or cancelled; ignore
    Stale,
    /// The deadline moved; the timer is armed again
    Rearmed,
    /// The deadline passed; the timer is now disarmed
    Expired,
}

#[derive(Debug)]
struct Armed {
    deadline: Instant,
    wakes_at: Instant,
    task: AbortHandle,
}

#[derive(Debug)]
pub struct Timer {
    test: Uuid,
    kind: TimerKind,
    generation: u64,
    armed: Option<Armed>,
}

impl Timer {
    pub fn new(test: Uuid, kind: TimerKind) -> Self {
        Self {
            test,
            kind,
            generation: 0,
            armed: None,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub(crate) fn arm(&mut self, handle: &LoopHandle, after: Duration) {
        self.cancel();
        self.schedule(handle, Instant::now() + after);
    }

    fn schedule(&mut self, handle: &LoopHandle, deadline: Instant) {
        self.generation += 1;
        let task = handle.send_at(
            deadline,
            LoopEvent::Timer {
                test: self.test,
                kind: self.kind,
                generation: self.generation,
            },
        );
        self.armed = Some(Armed {
            deadline,
            wakes_at: deadline,
            task,
        });
    }

    /// Returns whether the timer was armed
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                armed.task.abort();
                self.generation += 1;
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.as_ref().map(|a| a.deadline)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Push the deadline to `after` from now
    pub(crate) fn reset(&mut self, handle: &LoopHandle, after: Duration) {
        self.move_deadline(handle, Instant::now() + after);
    }

    /// Apply a timeout change: the deadline moves by `new - old`
    pub(crate) fn adjust(&mut self, handle: &LoopHandle, old: Duration, new: Duration) {
        let Some(deadline) = self.deadline() else {
            return;
        };
        let deadline = if new >= old {
            deadline + (new - old)
        } else {
            deadline
                .checked_sub(old - new)
                .unwrap_or_else(Instant::now)
        };
        self.move_deadline(handle, deadline);
    }

    fn move_deadline(&mut self, handle: &LoopHandle, deadline: Instant) {
        let Some(armed) = self.armed.as_mut() else {
            return;
        };
        if deadline < armed.wakes_at {
            armed.task.abort();
            self.schedule(handle, deadline);
        } else {
            armed.deadline = deadline;
        }
    }

    pub(crate) fn on_fire(&mut self, handle: &LoopHandle, generation: u64) -> Fire {
        if generation != self.generation {
            return Fire::Stale;
        }
        let Some(armed) = self.armed.as_ref() else {
            return Fire::Stale;
        };
        let deadline = armed.deadline;
        if Instant::now() < deadline {
            self.schedule(handle, deadline);
            return Fire::Rearmed;
        }
        self.armed = None;
        Fire::Expired
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_generation(rx: &mut UnboundedReceiver<LoopEvent>) -> u64 {
        match rx.recv().await {
            Some(LoopEvent::Timer { generation, .. }) => generation,
            other => panic!("expected timer event, got {:?}", other.is_some()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_at_deadline() {
        let (handle, mut rx) = LoopHandle::channel();
        let mut timer = Timer::new(Uuid::new_v4(), TimerKind::Test);
        let start = Instant::now();
        timer.arm(&handle, Duration::from_secs(10));

        let generation = next_generation(&mut rx).await;
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
        assert_eq!(timer.on_fire(&handle, generation), Fire::Expired);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_pushes_deadline() {
        let (handle, mut rx) = LoopHandle::channel();
        let mut timer = Timer::new(Uuid::new_v4(), TimerKind::Setup);
        let start = Instant::now();
        timer.arm(&handle, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.reset(&handle, Duration::from_secs(10));

        let generation = next_generation(&mut rx).await;
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
        assert_eq!(timer.on_fire(&handle, generation), Fire::Rearmed);

        let generation = next_generation(&mut rx).await;
        assert_eq!(Instant::now() - start, Duration::from_secs(15));
        assert_eq!(timer.on_fire(&handle, generation), Fire::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_shifts_remaining_time() {
        let (handle, _rx) = LoopHandle::channel();
        let mut timer = Timer::new(Uuid::new_v4(), TimerKind::Test);
        timer.arm(&handle, Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(timer.remaining(), Some(Duration::from_secs(10)));

        timer.adjust(&handle, Duration::from_secs(15), Duration::from_secs(25));
        assert_eq!(timer.remaining(), Some(Duration::from_secs(20)));

        timer.adjust(&handle, Duration::from_secs(25), Duration::from_secs(10));
        assert_eq!(timer.remaining(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortened_deadline_fires_early() {
        let (handle, mut rx) = LoopHandle::channel();
        let mut timer = Timer::new(Uuid::new_v4(), TimerKind::Test);
        let start = Instant::now();
        timer.arm(&handle, Duration::from_secs(20));
        timer.adjust(&handle, Duration::from_secs(20), Duration::from_secs(5));

        let generation = next_generation(&mut rx).await;
        assert_eq!(Instant::now() - start, Duration::from_secs(5));
        assert_eq!(timer.on_fire(&handle, generation), Fire::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_events_are_stale() {
        let (handle, _rx) = LoopHandle::channel();
        let mut timer = Timer::new(Uuid::new_v4(), TimerKind::Guard);
        timer.arm(&handle, Duration::from_secs(1));
        let generation = timer.generation;
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(timer.on_fire(&handle, generation), Fire::Stale);
    }
}
