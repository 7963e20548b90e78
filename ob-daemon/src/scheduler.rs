//! Turns triggers into engine cycles.
//!
//! Every trigger becomes its own blocking task. Before touching the vault the
//! task takes the vault's flight guard; when another cycle already holds it the
//! trigger is skipped without running a single command. The guard is released
//! when the task ends, whether it succeeded, failed or panicked.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use ob_core::VaultPath;
use ob_sync::{CompactReport, CycleError, CyclePhase, CycleReport, Engine, VcsClient};

use crate::error::DaemonError;

/// Why a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    /// Full cycle once at daemon start.
    Startup,
    /// Short-period commit-only tick.
    Settle,
    /// Long-period full cycle.
    Reconcile,
    /// User-requested full cycle; pushes regardless of the threshold.
    Manual,
    /// User-requested rewrite of the last `commits` commits.
    Compact { commits: u64 },
}

impl Trigger {
    /// Squash threshold a full cycle runs with; `None` for triggers that do
    /// not evaluate one.
    pub fn threshold(self, configured: u64) -> Option<u64> {
        match self {
            Trigger::Startup | Trigger::Reconcile => Some(configured),
            Trigger::Manual => Some(0),
            Trigger::Settle | Trigger::Compact { .. } => None,
        }
    }

    pub fn is_scheduled(self) -> bool {
        matches!(self, Trigger::Startup | Trigger::Settle | Trigger::Reconcile)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Startup => f.write_str("startup"),
            Trigger::Settle => f.write_str("settle"),
            Trigger::Reconcile => f.write_str("reconcile"),
            Trigger::Manual => f.write_str("manual"),
            Trigger::Compact { commits } => write!(f, "compact({commits})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Cycle(CycleReport),
    Compacted(CompactReport),
    /// Another cycle held the vault; nothing ran.
    Skipped,
    Failed { phase: CyclePhase, error: String },
}

impl TriggerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TriggerOutcome::Cycle(_) | TriggerOutcome::Compacted(_))
    }
}

// ---------------------------------------------------------------------------
// Single-flight
// ---------------------------------------------------------------------------

/// Vaults with a cycle in flight.
#[derive(Debug, Clone, Default)]
pub struct FlightRegistry {
    in_flight: Arc<Mutex<HashSet<VaultPath>>>,
}

impl FlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a cycle already holds `vault`.
    pub fn try_acquire(&self, vault: &VaultPath) -> Option<FlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(vault.clone()) {
            return None;
        }
        Some(FlightGuard {
            registry: self.clone(),
            vault: vault.clone(),
        })
    }

    pub fn is_in_flight(&self, vault: &VaultPath) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(vault)
    }
}

/// Releases the vault on drop.
#[derive(Debug)]
pub struct FlightGuard {
    registry: FlightRegistry,
    vault: VaultPath,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.registry
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.vault);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<C> {
    engine: Arc<Engine<C>>,
    flights: FlightRegistry,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            flights: self.flights.clone(),
        }
    }
}

impl<C: VcsClient + 'static> Scheduler<C> {
    pub fn new(engine: Engine<C>) -> Self {
        Self::with_flights(engine, FlightRegistry::new())
    }

    /// Share a registry with other schedulers of the same process.
    pub fn with_flights(engine: Engine<C>, flights: FlightRegistry) -> Self {
        Self {
            engine: Arc::new(engine),
            flights,
        }
    }

    pub fn engine(&self) -> &Engine<C> {
        &self.engine
    }

    pub fn flights(&self) -> &FlightRegistry {
        &self.flights
    }

    pub fn in_flight(&self) -> bool {
        self.flights.is_in_flight(&self.engine.config().vault)
    }

    /// Run `trigger` on the blocking pool.
    pub fn fire(&self, trigger: Trigger) -> JoinHandle<TriggerOutcome> {
        let engine = self.engine.clone();
        let flights = self.flights.clone();
        tokio::task::spawn_blocking(move || execute(&engine, &flights, trigger))
    }

    /// Run `trigger` on the calling thread.
    pub fn run_now(&self, trigger: Trigger) -> TriggerOutcome {
        execute(&self.engine, &self.flights, trigger)
    }
}

fn execute<C: VcsClient>(
    engine: &Engine<C>,
    flights: &FlightRegistry,
    trigger: Trigger,
) -> TriggerOutcome {
    let vault = &engine.config().vault;
    let Some(_guard) = flights.try_acquire(vault) else {
        tracing::info!(vault = %vault, %trigger, "cycle already in flight, skipping trigger");
        return TriggerOutcome::Skipped;
    };

    let configured = engine.config().squash_threshold;
    tracing::debug!(vault = %vault, %trigger, "cycle started");
    let result: Result<TriggerOutcome, CycleError> = match trigger {
        Trigger::Settle => engine.settle().map(TriggerOutcome::Cycle),
        Trigger::Startup | Trigger::Reconcile | Trigger::Manual => engine
            .reconcile(trigger.threshold(configured).unwrap_or(configured))
            .map(TriggerOutcome::Cycle),
        Trigger::Compact { commits } => engine.compact(commits).map(TriggerOutcome::Compacted),
    };

    match result {
        Ok(outcome) => {
            tracing::info!(vault = %vault, %trigger, "cycle completed");
            outcome
        }
        Err(err) => {
            tracing::error!(
                vault = %vault,
                %trigger,
                phase = %err.phase,
                error = %err,
                "cycle failed",
            );
            TriggerOutcome::Failed {
                phase: err.phase,
                error: err.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Emit `Startup` once, then `Settle` every `settle` and `Reconcile` every
/// `reconcile`, until shutdown.
pub async fn timer_task(
    settle: Duration,
    reconcile: Duration,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let now = Instant::now();
    let mut settle_tick = interval_at(now + settle, settle);
    settle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconcile_tick = interval_at(now + reconcile, reconcile);
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    triggers
        .send(Trigger::Startup)
        .await
        .map_err(|_| DaemonError::ChannelClosed("trigger queue"))?;

    loop {
        let trigger = tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = settle_tick.tick() => Trigger::Settle,
            _ = reconcile_tick.tick() => Trigger::Reconcile,
        };
        if triggers.send(trigger).await.is_err() {
            break;
        }
    }
    Ok(())
}
