//! Systems and the fixed-rate tick loop that drives them.
//!
//! Systems run in registration order, each receiving the real elapsed time
//! since the previous tick. Ticking is best-effort: if the loop falls behind,
//! missed ticks are skipped rather than replayed, and the next `delta` simply
//! covers the gap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::world_state::{SharedWorld, WorldState};

/// A unit of per-tick world logic.
pub trait System: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Advance this system by `delta`.
    fn run(&mut self, delta: Duration, world: &mut WorldState);
}

/// Adapter turning a closure into a [`System`].
pub struct FnSystem<F> {
    name: String,
    run: F,
}

impl<F> System for FnSystem<F>
where
    F: FnMut(Duration, &mut WorldState) + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, delta: Duration, world: &mut WorldState) {
        (self.run)(delta, world)
    }
}

/// Build a system from a closure.
pub fn system_fn<F>(name: impl Into<String>, run: F) -> FnSystem<F>
where
    F: FnMut(Duration, &mut WorldState) + Send,
{
    FnSystem {
        name: name.into(),
        run,
    }
}

/// Periodic referential-integrity check over the world store.
///
/// Accumulates ticked time and runs [`WorldState::check_invariants`] once
/// `every` has elapsed. Violations are logged and counted.
#[derive(Debug)]
pub struct InvariantAudit {
    every: Duration,
    since: Duration,
    audits: Arc<AtomicU64>,
    violations: Arc<AtomicU64>,
}

impl InvariantAudit {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            since: Duration::ZERO,
            audits: Arc::new(AtomicU64::new(0)),
            violations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle to the number of audits run so far.
    pub fn audits(&self) -> Arc<AtomicU64> {
        self.audits.clone()
    }

    /// Handle to the number of failed audits so far.
    pub fn violations(&self) -> Arc<AtomicU64> {
        self.violations.clone()
    }
}

impl System for InvariantAudit {
    fn name(&self) -> &str {
        "invariant_audit"
    }

    fn run(&mut self, delta: Duration, world: &mut WorldState) {
        self.since += delta;
        if self.since < self.every {
            return;
        }
        self.since = Duration::ZERO;
        self.audits.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = world.check_invariants() {
            self.violations.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "world invariant violated");
        }
    }
}

/// Counters exposed by a running tick loop.
#[derive(Debug, Default)]
pub struct TickStats {
    ticks: AtomicU64,
    missed: AtomicU64,
}

impl TickStats {
    /// Ticks executed.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Ticks skipped because the loop fell behind.
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

/// Fixed-rate scheduler running registered systems against the shared world.
pub struct TickLoop {
    world: SharedWorld,
    systems: Vec<Box<dyn System>>,
    period: Duration,
    stats: Arc<TickStats>,
}

impl TickLoop {
    /// Create a tick loop at `tick_hz` ticks per second (clamped to at least 1).
    pub fn new(world: SharedWorld, tick_hz: u32) -> Self {
        let hz = u64::from(tick_hz.max(1));
        Self {
            world,
            systems: Vec::new(),
            period: Duration::from_nanos(1_000_000_000 / hz),
            stats: Arc::new(TickStats::default()),
        }
    }

    /// Register a system. Systems run in the order they were added.
    pub fn add_system(&mut self, system: impl System + 'static) -> &mut Self {
        self.systems.push(Box::new(system));
        self
    }

    /// Builder-style variant of [`TickLoop::add_system`].
    pub fn with_system(mut self, system: impl System + 'static) -> Self {
        self.add_system(system);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> Arc<TickStats> {
        self.stats.clone()
    }

    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name()).collect()
    }

    /// Run every system once with the given delta.
    pub async fn tick(&mut self, delta: Duration) {
        let mut world = self.world.write().await;
        for system in &mut self.systems {
            system.run(delta, &mut world);
        }
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Tick until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_us = self.period.as_micros() as u64,
            systems = self.systems.len(),
            "tick loop started"
        );
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    let delta = now.duration_since(last);
                    last = now;

                    let behind = delta.as_nanos() / self.period.as_nanos().max(1);
                    if behind > 1 {
                        let skipped = u64::try_from(behind - 1).unwrap_or(u64::MAX);
                        self.stats.missed.fetch_add(skipped, Ordering::Relaxed);
                        debug!(skipped, delta_ms = delta.as_millis() as u64, "tick loop fell behind");
                    }

                    self.tick(delta).await;
                }
            }
        }
        info!(ticks = self.stats.ticks(), missed = self.stats.missed(), "tick loop stopped");
    }
}
