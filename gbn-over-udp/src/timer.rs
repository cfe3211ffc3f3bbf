//! Retransmission timer.
//!
//! Go-Back-N keeps exactly one timer per sender, covering the oldest
//! unacknowledged packet.  [`RetransmitTimer`] owns that timer as a spawned
//! tokio task that sleeps for a fixed timeout and then runs an expiry
//! callback.  There is no backoff and no RTT estimation: the timeout is fixed
//! for the whole run.
//!
//! # Generations
//!
//! Every [`arm`](RetransmitTimer::arm) and [`cancel`](RetransmitTimer::cancel)
//! bumps a generation counter, and the expiry callback receives the
//! generation it was armed with.  The callback must lock the state that owns
//! the timer and call [`claim`](RetransmitTimer::claim) before acting.  A timer
//! that expired just as it was being cancelled or rearmed then sees a stale
//! generation and does nothing, even if the abort arrived too late to stop the
//! task.
//!
//! `claim` also detaches the task handle, so the expiring task can rearm the
//! timer from inside its own callback without aborting itself.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Default retransmission timeout.
pub const TIMEOUT: Duration = Duration::from_millis(500);

/// A single cancellable retransmission timer.
#[derive(Debug)]
pub struct RetransmitTimer {
    timeout: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TIMEOUT)
    }
}

impl RetransmitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            generation: 0,
            task: None,
        }
    }

    /// Generation of the most recent arm or cancel.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` while a timer task is outstanding.
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Cancel any outstanding timer and start a fresh one.
    ///
    /// `on_expiry` runs once, after the timeout, with the generation returned
    /// here.  Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(&mut self, on_expiry: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let timeout = self.timeout;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_expiry(generation).await;
        }));
        generation
    }

    /// Stop the outstanding timer, if any, and invalidate its generation.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
    }

    /// Called by an expiring timer: `true` if `generation` is still current.
    ///
    /// On success the timer counts as disarmed until the next `arm`.
    pub fn claim(&mut self, generation: u64) -> bool {
        if self.task.is_none() || generation != self.generation {
            return false;
        }
        self.task = None;
        true
    }
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const T: Duration = Duration::from_millis(100);

    fn reporter(tx: mpsc::UnboundedSender<u64>) -> impl FnOnce(u64) -> std::future::Ready<()> {
        move |generation| {
            let _ = tx.send(generation);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RetransmitTimer::new(T);
        let generation = timer.arm(reporter(tx));
        assert!(timer.is_armed());

        tokio::time::sleep(T / 2).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(T).await;
        assert_eq!(rx.try_recv(), Ok(generation));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RetransmitTimer::new(T);
        timer.arm(reporter(tx));
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::sleep(T * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RetransmitTimer::new(T);
        let first = timer.arm(reporter(tx.clone()));
        tokio::time::sleep(T / 2).await;
        let second = timer.arm(reporter(tx));
        assert_ne!(first, second);

        tokio::time::sleep(T * 3).await;
        assert_eq!(rx.try_recv(), Ok(second));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn claim_rejects_stale_generations() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = RetransmitTimer::new(T);
        let stale = timer.arm(reporter(tx.clone()));
        let current = timer.arm(reporter(tx));

        assert!(!timer.claim(stale));
        assert!(timer.claim(current));
        assert!(!timer.is_armed());
        // A generation can only be claimed once.
        assert!(!timer.claim(current));
    }

    #[tokio::test(start_paused = true)]
    async fn claim_after_cancel_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = RetransmitTimer::new(T);
        let generation = timer.arm(reporter(tx));
        timer.cancel();
        assert!(!timer.claim(generation));
    }
}
