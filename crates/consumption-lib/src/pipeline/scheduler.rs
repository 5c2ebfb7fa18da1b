//! Attribution scheduler
//!
//! Runs one export cycle immediately, then one per tick of a fixed-period
//! timer. Ticks are handed to the cycle driver through a one-slot queue:
//! - At most one tick is pending while a cycle runs
//! - Further ticks are dropped, so an overrunning cycle absorbs them
//! - `stop` cancels the timer and any in-flight cycle
//!
//! Cadence drifts under sustained overrun; cycles never overlap.

use super::export::{CycleOutcome, ExportCycle};
use crate::health::{components, HealthRegistry};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick
    Idle,
    /// A cycle is in flight
    Running,
    /// Stopped for good
    Stopped,
}

/// A unit of periodic work
#[async_trait]
pub trait CycleRunner: Send + Sync {
    /// Run one cycle; `None` means it was cancelled
    async fn run(&self, cancel: &CancellationToken) -> Option<CycleOutcome>;
}

#[async_trait]
impl CycleRunner for ExportCycle {
    async fn run(&self, cancel: &CancellationToken) -> Option<CycleOutcome> {
        ExportCycle::run(self, cancel).await
    }
}

pub struct AttributionScheduler {
    runner: Arc<dyn CycleRunner>,
    interval: Duration,
    health: HealthRegistry,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SchedulerState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AttributionScheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, interval: Duration, health: HealthRegistry) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            runner,
            interval,
            health,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Spawn the timer and the cycle driver
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if self.cancel.is_cancelled() {
            bail!("scheduler already stopped");
        }
        if !tasks.is_empty() {
            bail!("scheduler already started");
        }

        info!(interval_secs = self.interval.as_secs(), "Starting attribution scheduler");

        let (tick_tx, tick_rx) = mpsc::channel(1);
        tasks.push(tokio::spawn(run_ticker(
            self.interval,
            tick_tx,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(drive_cycles(
            self.runner.clone(),
            tick_rx,
            self.state.clone(),
            self.health.clone(),
            self.cancel.clone(),
        )));

        self.health.set_healthy(components::SCHEDULER).await;
        Ok(())
    }

    /// Cancel the timer and any in-flight cycle, then wait for both to exit.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }

        if self.state() != SchedulerState::Stopped {
            info!("Attribution scheduler stopped");
            self.state.send_replace(SchedulerState::Stopped);
        }
    }
}

/// Emit one tick per period into the one-slot queue, dropping ticks while
/// one is already pending
async fn run_ticker(period: Duration, ticks: mpsc::Sender<()>, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if ticks.try_send(()).is_err() {
                    debug!("Export cycle overran its period, dropping tick");
                }
            }
        }
    }
}

async fn drive_cycles(
    runner: Arc<dyn CycleRunner>,
    mut ticks: mpsc::Receiver<()>,
    state: Arc<watch::Sender<SchedulerState>>,
    health: HealthRegistry,
    cancel: CancellationToken,
) {
    loop {
        state.send_replace(SchedulerState::Running);
        if runner.run(&cancel).await.is_none() {
            break;
        }
        state.send_replace(SchedulerState::Idle);

        tokio::select! {
            _ = cancel.cancelled() => break,
            tick = ticks.recv() => {
                if tick.is_none() {
                    break;
                }
            }
        }
    }

    health
        .set_unhealthy(components::SCHEDULER, "Scheduler stopped")
        .await;
    state.send_replace(SchedulerState::Stopped);
}
