// 8.2 engine/clock.rs: one clock task per team market.
// 8.2.1 the clock ticks at the interval of the live (or staged) config, parks when nobody
//       watches and nobody trades, and backs off then recovers after a failed tick.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::core::{Engine, EngineInner, MarketHandle};
use super::results::EngineError;
use crate::events::EventPayload;
use crate::market::{MarketError, MarketSnapshot, MarketState, MarketStatus, TickOutcome};
use crate::types::{TeamId, Timestamp};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(super) struct ClockControl {
    wake: Notify,
    parked: AtomicBool,
    last_activity: Mutex<Instant>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Step {
    Tick(Duration),
    Park { idle: bool },
    Recover,
    Stop,
}

impl ClockControl {
    pub(super) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            wake: Notify::new(),
            parked: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Record trade or subscribe activity and wake the clock if it parked for idleness.
    pub(super) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
        if self.parked.load(Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    /// Make the clock re-read its interval, after a config change.
    pub(super) fn reschedule(&self) {
        self.wake.notify_one();
    }

    fn idle(&self, window: Duration, subscribers: usize) -> bool {
        subscribers == 0 && lock(&self.last_activity).elapsed() >= window
    }

    pub(super) fn start(&self, engine: Weak<EngineInner>, handle: Arc<MarketHandle>) {
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(run(engine, handle, shutdown));
        *lock(&self.task) = Some(task);
    }

    /// Stop the task and wait for it. A tick in progress finishes first.
    pub(super) async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "clock task ended abnormally");
            }
        }
    }
}

async fn run(engine: Weak<EngineInner>, handle: Arc<MarketHandle>, mut shutdown: watch::Receiver<bool>) {
    let team_id = handle.team_id;
    debug!(team = %team_id, "clock started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(inner) = engine.upgrade() else { break };
        let idle_window = inner.config.idle_pause();
        let backoff = inner.config.fault_backoff();
        let step = next_step(&handle, idle_window).await;
        drop(inner);

        match step {
            Step::Stop => break,
            Step::Tick(interval) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = handle.clock.wake.notified() => continue,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(inner) = engine.upgrade() else { break };
                let mut state = handle.state.lock().await;
                // failures are journaled and pushed to subscribers inside tick_locked
                let _ = tick_locked(&inner, &handle, &mut state);
            }
            Step::Recover => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                let Some(inner) = engine.upgrade() else { break };
                let mut state = handle.state.lock().await;
                if state.recover() {
                    info!(team = %team_id, "market recovered, resuming from last good snapshot");
                    inner.emit_event(team_id, EventPayload::MarketRecovered);
                }
            }
            Step::Park { idle } => {
                if idle {
                    handle.clock.parked.store(true, Ordering::SeqCst);
                    // activity that raced the decision wins
                    if !handle.clock.idle(idle_window, handle.hub.subscriber_count()) {
                        handle.clock.parked.store(false, Ordering::SeqCst);
                        continue;
                    }
                    handle.state.lock().await.pause();
                    info!(team = %team_id, "clock paused, no subscribers or trades");
                }

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = handle.clock.wake.notified() => {}
                }

                if idle {
                    handle.clock.parked.store(false, Ordering::SeqCst);
                    handle.state.lock().await.resume();
                    info!(team = %team_id, "clock resumed");
                }
            }
        }
    }

    handle.clock.parked.store(false, Ordering::SeqCst);
    debug!(team = %team_id, "clock stopped");
}

async fn next_step(handle: &MarketHandle, idle_window: Duration) -> Step {
    let state = handle.state.lock().await;
    match state.status() {
        MarketStatus::Closed => Step::Stop,
        MarketStatus::Errored => Step::Recover,
        MarketStatus::Active | MarketStatus::Paused => {
            if handle.clock.idle(idle_window, handle.hub.subscriber_count()) {
                return Step::Park { idle: true };
            }
            match state.upcoming_interval() {
                Some(interval) => Step::Tick(interval),
                None => Step::Park { idle: false },
            }
        }
    }
}

/// One tick under the team lock. A failed tick marks the market errored, fails every
/// current subscriber, and leaves the last good snapshot in place.
pub(super) fn tick_locked(
    inner: &EngineInner,
    handle: &MarketHandle,
    state: &mut MarketState,
) -> Result<Arc<MarketSnapshot>, EngineError> {
    let result = state.tick(Timestamp::now(), Decimal::ONE);
    finish(inner, handle, state, result)
}

/// Apply staged changes under the team lock without a price step.
pub(super) fn settle_locked(
    inner: &EngineInner,
    handle: &MarketHandle,
    state: &mut MarketState,
) -> Result<Option<Arc<MarketSnapshot>>, EngineError> {
    match state.settle(Timestamp::now()) {
        Ok(None) => Ok(None),
        Ok(Some(outcome)) => finish(inner, handle, state, Ok(outcome)).map(Some),
        Err(e) => finish(inner, handle, state, Err(e)).map(Some),
    }
}

fn finish(
    inner: &EngineInner,
    handle: &MarketHandle,
    state: &mut MarketState,
    result: Result<TickOutcome, MarketError>,
) -> Result<Arc<MarketSnapshot>, EngineError> {
    match result {
        Ok(outcome) => {
            inner.announce_tick(handle, &outcome);
            Ok(outcome.snapshot)
        }
        Err(MarketError::Closed(team_id)) => Err(EngineError::MarketClosed(team_id)),
        Err(e) => {
            let reason = e.to_string();
            state.mark_errored(&reason);
            let failed = handle.hub.fail(&reason);
            error!(team = %handle.team_id, %reason, subscribers = failed, "tick failed, market errored");
            inner.emit_event(handle.team_id, EventPayload::MarketFaulted { reason });
            Err(e.into())
        }
    }
}

impl Engine {
    /// Advance the team's market by one tick now and publish the snapshot.
    /// An errored market recovers first.
    pub async fn tick(&self, team_id: TeamId) -> Result<Arc<MarketSnapshot>, EngineError> {
        let handle = self.ensure_market(team_id).await?;
        let mut state = handle.state.lock().await;
        if state.recover() {
            info!(team = %team_id, "market recovered by manual tick");
            self.inner.emit_event(team_id, EventPayload::MarketRecovered);
        }
        tick_locked(&self.inner, &handle, &mut state)
    }
}
