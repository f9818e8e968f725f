//! Scheduler (SPEC §4.E): periodic (`every`) and schedule-driven (`schedule`)
//! long-lived background tasks. Both variants avoid skew by measuring the
//! next run from the instant the current tick actually started rather than
//! from a fixed grid, so a slow handler delays the next tick instead of
//! queueing up a backlog of immediate re-runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

use crate::errors::BusError;

pub type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TickHandler = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// Computes the delay until the next run, given the chance to recompute it
/// every tick. `every` is the constant-delay special case of this; a
/// calendar-aware recurrence (e.g. "daily at 03:00") is one closure away
/// without needing a dedicated cron grammar.
pub type ScheduleSpec = Arc<dyn Fn() -> Duration + Send + Sync>;

pub struct Scheduler;

impl Scheduler {
    /// Run `handler` every `interval`, optionally once immediately first.
    /// Rejects a zero interval rather than spinning a busy loop.
    pub fn every(
        interval: Duration,
        run_immediately: bool,
        shutdown: Arc<Notify>,
        handler: TickHandler,
    ) -> Result<JoinHandle<()>, BusError> {
        if interval.is_zero() {
            return Err(BusError::InvalidSchedule(
                "every() interval must be greater than zero".to_owned(),
            ));
        }
        Ok(spawn_loop(run_immediately, shutdown, handler, move || interval))
    }

    /// Run `handler` on the recurrence described by `spec`, recomputed after
    /// every tick so the delay can vary run to run.
    pub fn schedule(
        spec: ScheduleSpec,
        run_immediately: bool,
        shutdown: Arc<Notify>,
        handler: TickHandler,
    ) -> Result<JoinHandle<()>, BusError> {
        if spec().is_zero() {
            return Err(BusError::InvalidSchedule(
                "schedule() must never resolve to a zero delay".to_owned(),
            ));
        }
        Ok(spawn_loop(run_immediately, shutdown, handler, move || spec()))
    }
}

fn spawn_loop(
    run_immediately: bool,
    shutdown: Arc<Notify>,
    handler: TickHandler,
    mut next_delay: impl FnMut() -> Duration + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_tick = if run_immediately {
            TokioInstant::now()
        } else {
            TokioInstant::now() + next_delay()
        };
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                _ = tokio::time::sleep_until(next_tick) => {}
            }
            let start = TokioInstant::now();
            handler().await;
            next_tick = start + next_delay();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn every_rejects_zero_interval() {
        let shutdown = Arc::new(Notify::new());
        let err = Scheduler::every(Duration::ZERO, false, shutdown, Arc::new(|| Box::pin(async {})))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidSchedule(_)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn every_runs_immediately_when_requested() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_for_handler = count.clone();
        let shutdown = Arc::new(Notify::new());
        let handle = Scheduler::every(
            Duration::from_secs(10),
            true,
            shutdown.clone(),
            Arc::new(move || {
                let count = count_for_handler.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .unwrap();

        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        shutdown.notify_waiters();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn every_ticks_at_the_configured_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_for_handler = count.clone();
        let shutdown = Arc::new(Notify::new());
        let handle = Scheduler::every(
            Duration::from_secs(1),
            false,
            shutdown.clone(),
            Arc::new(move || {
                let count = count_for_handler.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .unwrap();

        tokio::time::advance(Duration::from_millis(3_500)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        shutdown.notify_waiters();
        handle.await.unwrap();
    }
}
