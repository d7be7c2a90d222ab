//! Cycle Scheduler
//!
//! Triggers synchronization cycles on a fixed, jittered interval and keeps
//! at most one cycle in flight.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::cycle::CycleOrchestrator;
use crate::cli::config::{default_interval, ScheduleConfig};
use crate::connection::client::ControlPlane;
use crate::runtime::adapter::CommandRunner;

/// Something the scheduler can run once per tick
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run_cycle(&self, cancel: CancellationToken);
}

#[async_trait]
impl<C, R> CycleRunner for CycleOrchestrator<C, R>
where
    C: ControlPlane + 'static,
    R: CommandRunner + 'static,
{
    async fn run_cycle(&self, cancel: CancellationToken) {
        match self.run_once(&cancel).await {
            Ok(state) => info!(
                executed = state.policies.iter().filter(|p| p.is_executed()).count(),
                total = state.policies.len(),
                "Cycle finished"
            ),
            Err(e) => error!(error = %e, "Cycle aborted"),
        }
    }
}

/// Effective tick period: a non-positive interval falls back to the
/// default, plus a uniform jitter in `[0, max_jitter_minutes)` minutes.
pub fn effective_interval(
    interval_secs: i64,
    max_jitter_minutes: u64,
    rng: &mut impl Rng,
) -> Duration {
    let base = if interval_secs > 0 {
        interval_secs.unsigned_abs()
    } else {
        default_interval().unsigned_abs()
    };

    let jitter_bound = max_jitter_minutes.saturating_mul(60);
    let jitter = if jitter_bound == 0 {
        0
    } else {
        rng.gen_range(0..jitter_bound)
    };

    Duration::from_secs(base.saturating_add(jitter))
}

/// Counters reported when the scheduler stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles_started: u64,
    pub ticks_dropped: u64,
}

/// Single-flight periodic cycle trigger
pub struct Scheduler<R: CycleRunner> {
    cycle: Arc<R>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<R: CycleRunner> Scheduler<R> {
    pub fn new(cycle: Arc<R>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            cycle,
            interval,
            cancel,
        }
    }

    /// Build a scheduler whose period is drawn once from `schedule`
    pub fn from_schedule(
        cycle: Arc<R>,
        schedule: &ScheduleConfig,
        cancel: CancellationToken,
    ) -> Self {
        let interval = effective_interval(
            schedule.interval_secs,
            schedule.max_jitter_minutes,
            &mut rand::thread_rng(),
        );
        Self::new(cycle, interval, cancel)
    }

    /// Tick until cancelled, then wait for the in-flight cycle to finish.
    ///
    /// The first cycle starts immediately. A tick that fires while a cycle
    /// is still running is dropped.
    pub async fn run(&self) -> SchedulerStats {
        info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stats = SchedulerStats::default();
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if in_flight.as_ref().is_some_and(|handle| !handle.is_finished()) {
                        stats.ticks_dropped += 1;
                        warn!(dropped = stats.ticks_dropped, "Previous cycle still running, skipping tick");
                        continue;
                    }
                    if let Some(finished) = in_flight.take() {
                        reap(finished).await;
                    }

                    stats.cycles_started += 1;
                    let cycle = self.cycle.clone();
                    let cancel = self.cancel.clone();
                    in_flight = Some(tokio::spawn(async move {
                        cycle.run_cycle(cancel).await;
                    }));
                }
            }
        }

        if let Some(handle) = in_flight {
            info!("Shutdown requested, waiting for in-flight cycle");
            reap(handle).await;
        }

        info!(
            cycles_started = stats.cycles_started,
            ticks_dropped = stats.ticks_dropped,
            "Scheduler stopped"
        );
        stats
    }
}

async fn reap(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(error = %e, "Cycle task panicked");
    }
}
