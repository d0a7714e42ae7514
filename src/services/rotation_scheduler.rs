//! Interval rotation scheduler
//!
//! Owns at most one periodic task. Arming replaces the current task, and
//! cancellation stops future ticks but never interrupts a tick in flight.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

struct ScheduledTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    period: Duration,
}

impl ScheduledTask {
    fn cancel(self) {
        let _ = self.shutdown_tx.send(true);
        if !self.handle.is_finished() {
            debug!(period_secs = self.period.as_secs(), "Rotation timer cancelled");
        }
    }
}

/// Single cancellable periodic task
#[derive(Default)]
pub struct RotationScheduler {
    current: Mutex<Option<ScheduledTask>>,
}

impl RotationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period`, first tick one period from now.
    ///
    /// Any previously armed task is cancelled before the new one starts.
    pub fn arm<F, Fut>(&self, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            previous.cancel();
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        job().await;
                    }
                }
            }
        });

        info!(period_secs = period.as_secs(), "Rotation timer armed");
        *current = Some(ScheduledTask {
            shutdown_tx,
            handle,
            period,
        });
    }

    /// Stop future ticks; returns whether a task was armed
    pub fn cancel(&self) -> bool {
        match self.current.lock().take() {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for RotationScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
