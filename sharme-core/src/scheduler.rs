//! Coalesced periodic background ticks.
//!
//! Each tick runs to completion; if a tick is still running when its
//! next deadline arrives, the next tick is coalesced rather than
//! overlapping. `tokio::time::interval`'s `MissedTickBehavior::Skip`
//! gives us exactly that for free, so there's no hand-rolled mutex
//! around the task body.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Cooperative shutdown signal shared between the scheduler and
/// whoever owns the sync engine's lifetime.
///
/// The flag is the state; `Notify` only wakes a task that's currently
/// polling `wait()`. `notify_waiters()` alone would lose the signal if
/// `trigger()` fires while a tick is running — the `wait()` future
/// inside `run_coalesced`'s `select!` is dropped and re-created fresh
/// on every loop iteration, so it is never the one polling at the
/// moment `trigger()` runs. Checking the flag at the top of every
/// iteration, regardless of which `select!` branch woke it, closes
/// that window.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Runs `task` every `period`, stopping new ticks once `shutdown` is
/// triggered. Allows an in-flight tick to complete first.
pub async fn run_coalesced<F, Fut>(period: Duration, shutdown: ShutdownSignal, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if shutdown.is_triggered() {
            break;
        }

        tokio::select! {
            _ = interval.tick() => {
                task().await;
            }
            _ = shutdown.wait() => {}
        }

        if shutdown.is_triggered() {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn stops_after_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = ShutdownSignal::new();

        let count_clone = count.clone();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move {
            run_coalesced(Duration::from_millis(10), shutdown_clone, || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        });

        tokio::time::advance(Duration::from_millis(35)).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_an_in_flight_tick_is_not_lost() {
        let shutdown = ShutdownSignal::new();
        let shutdown_clone = shutdown.clone();
        let in_tick = Arc::new(Notify::new());
        let in_tick_clone = in_tick.clone();

        let handle = tokio::spawn(async move {
            run_coalesced(Duration::from_millis(10), shutdown_clone, || {
                let in_tick = in_tick_clone.clone();
                async move {
                    in_tick.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
        });

        tokio::time::advance(Duration::from_millis(10)).await;
        in_tick.notified().await;
        // Trigger while the task body above is still sleeping, i.e.
        // before the loop has re-entered `select!` to register a
        // fresh `wait()`.
        shutdown.trigger();

        tokio::time::advance(Duration::from_millis(100)).await;
        handle.await.unwrap();
    }
}
