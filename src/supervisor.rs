//! Lifecycle supervisor
//!
//! Drives each subscriber's worker through
//! `Stopped → Starting → Running → Stopping → Stopped`, with
//! `Starting`/`Running → Failed` on crash and a capped exponential-backoff
//! restart policy. Control operations are serialized per subscriber; status
//! reads are snapshots and never touch the network. Each worker gets its own
//! monitor task that owns the process handle, so one subscriber's crash
//! handling can never stall another's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::SupervisorError;
use crate::subscriber::Subscriber;
use crate::synth::ConfigSynthesizer;
use crate::tiers::TierPolicyRegistry;
use crate::worker::{LaunchSpec, WorkerExit, WorkerLauncher, WorkerProcess, WorkerState};

/// Crash-restart policy applied by each worker's monitor task.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Point-in-time view of one subscriber's worker, safe to hand to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub subscriber_id: Uuid,
    pub state: WorkerState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub api_port: Option<u16>,
}

impl StatusSnapshot {
    fn stopped(subscriber_id: Uuid) -> Self {
        Self {
            subscriber_id,
            state: WorkerState::Stopped,
            started_at: None,
            last_heartbeat: None,
            restart_count: 0,
            api_port: None,
        }
    }
}

/// Readable side of a slot, updated by control ops and the monitor task.
/// Write guards are never held across I/O.
#[derive(Debug, Clone)]
struct SlotView {
    state: WorkerState,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    restart_count: u32,
    api_port: Option<u16>,
}

impl Default for SlotView {
    fn default() -> Self {
        Self {
            state: WorkerState::Stopped,
            started_at: None,
            last_heartbeat: None,
            restart_count: 0,
            api_port: None,
        }
    }
}

/// The live half of a slot: shutdown signal plus the owned monitor task.
struct ActiveWorker {
    shutdown: watch::Sender<bool>,
    monitor: JoinHandle<()>,
}

/// One registry entry per subscriber. The control mutex serializes
/// start/stop for this subscriber only; other subscribers proceed freely.
struct WorkerSlot {
    subscriber_id: Uuid,
    control: Mutex<Option<ActiveWorker>>,
    view: RwLock<SlotView>,
}

impl WorkerSlot {
    fn new(subscriber_id: Uuid) -> Self {
        Self {
            subscriber_id,
            control: Mutex::new(None),
            view: RwLock::new(SlotView::default()),
        }
    }
}

/// Everything a monitor task needs, captured at start time.
struct MonitorContext {
    launcher: Arc<dyn WorkerLauncher>,
    spec: LaunchSpec,
    restart: RestartPolicy,
    heartbeat_interval: Duration,
    grace: Duration,
}

pub struct Supervisor {
    tiers: TierPolicyRegistry,
    synthesizer: ConfigSynthesizer,
    launcher: Arc<dyn WorkerLauncher>,
    slots: RwLock<HashMap<Uuid, Arc<WorkerSlot>>>,
    restart: RestartPolicy,
    heartbeat_interval: Duration,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(
        cfg: &ManagerConfig,
        tiers: TierPolicyRegistry,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            tiers,
            synthesizer: ConfigSynthesizer::new(cfg),
            launcher,
            slots: RwLock::new(HashMap::new()),
            restart: RestartPolicy {
                max_restarts: cfg.max_restarts,
                base_delay_ms: cfg.restart_backoff_base_ms,
                max_delay_ms: cfg.restart_backoff_max_ms,
            },
            heartbeat_interval: cfg.heartbeat_interval(),
            stop_grace: cfg.stop_grace(),
        }
    }

    /// Start the subscriber's worker. Idempotent: a worker already
    /// `Starting` or `Running` is reported as success without spawning a
    /// duplicate.
    pub async fn start(&self, subscriber: &Subscriber) -> Result<StatusSnapshot, SupervisorError> {
        let slot = self.slot(subscriber.id).await;
        let mut control = slot.control.lock().await;

        let current = slot.view.read().await.state;
        if matches!(current, WorkerState::Starting | WorkerState::Running) {
            debug!(subscriber = %subscriber.id, "start is a no-op, worker already up");
            return Ok(snapshot_of(&slot).await);
        }

        // Reap a previous monitor (settled in Failed, or mid-backoff).
        if let Some(active) = control.take() {
            let _ = active.shutdown.send(true);
            let _ = active.monitor.await;
        }

        {
            let mut view = slot.view.write().await;
            *view = SlotView {
                state: WorkerState::Starting,
                ..SlotView::default()
            };
        }

        let policy = self.tiers.resolve(&subscriber.tier, &subscriber.risk_level);
        let artifact = match self.synthesizer.synthesize(subscriber, &policy).await {
            Ok(artifact) => artifact,
            Err(e) => {
                // Nothing was spawned; revert to the last known-good state.
                slot.view.write().await.state = WorkerState::Stopped;
                return Err(SupervisorError::Synthesis(e));
            }
        };

        let spec = LaunchSpec {
            subscriber_id: subscriber.id,
            artifact_path: artifact.path.clone(),
        };
        let process = match self.launcher.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                slot.view.write().await.state = WorkerState::Failed;
                return Err(SupervisorError::Spawn(e));
            }
        };

        {
            let mut view = slot.view.write().await;
            view.state = WorkerState::Running;
            view.started_at = Some(Utc::now());
            view.last_heartbeat = Some(Utc::now());
            view.api_port = Some(artifact.api_port);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = MonitorContext {
            launcher: Arc::clone(&self.launcher),
            spec,
            restart: self.restart,
            heartbeat_interval: self.heartbeat_interval,
            grace: self.stop_grace,
        };
        let monitor = tokio::spawn(monitor_worker(
            Arc::clone(&slot),
            ctx,
            process,
            shutdown_rx,
        ));
        *control = Some(ActiveWorker {
            shutdown: shutdown_tx,
            monitor,
        });

        info!(
            subscriber = %subscriber.id,
            strategy = %artifact.strategy,
            max_open_trades = artifact.max_open_trades,
            "worker started"
        );
        Ok(snapshot_of(&slot).await)
    }

    /// Stop the subscriber's worker. Idempotent: stopping a worker that was
    /// never started, already stopped, or settled in `Failed` succeeds
    /// without side effects.
    pub async fn stop(&self, subscriber_id: Uuid) -> StatusSnapshot {
        let slot = self.slots.read().await.get(&subscriber_id).cloned();
        let Some(slot) = slot else {
            return StatusSnapshot::stopped(subscriber_id);
        };

        let mut control = slot.control.lock().await;
        let Some(active) = control.take() else {
            let mut view = slot.view.write().await;
            view.state = WorkerState::Stopped;
            view.api_port = None;
            drop(view);
            return snapshot_of(&slot).await;
        };

        slot.view.write().await.state = WorkerState::Stopping;
        let _ = active.shutdown.send(true);

        // The monitor handles terminate-then-kill within the grace budget;
        // the margin covers its own winding down.
        let deadline = self.stop_grace + Duration::from_secs(2);
        let mut monitor = active.monitor;
        if tokio::time::timeout(deadline, &mut monitor).await.is_err() {
            warn!(subscriber = %subscriber_id, "monitor did not wind down in time, aborting");
            monitor.abort();
            let _ = monitor.await;
        }

        {
            let mut view = slot.view.write().await;
            view.state = WorkerState::Stopped;
            view.started_at = None;
            view.last_heartbeat = None;
            view.api_port = None;
        }

        info!(subscriber = %subscriber_id, "worker stopped");
        snapshot_of(&slot).await
    }

    /// Snapshot read of the subscriber's worker. Never blocks on I/O; may
    /// benignly observe a transient `Starting`/`Stopping` during a
    /// concurrent control operation.
    pub async fn status(&self, subscriber_id: Uuid) -> StatusSnapshot {
        match self.slots.read().await.get(&subscriber_id) {
            Some(slot) => snapshot_of(slot).await,
            None => StatusSnapshot::stopped(subscriber_id),
        }
    }

    /// Get or create the registry slot for a subscriber. The map lock is
    /// held only for the lookup, never across control operations.
    async fn slot(&self, subscriber_id: Uuid) -> Arc<WorkerSlot> {
        if let Some(slot) = self.slots.read().await.get(&subscriber_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(subscriber_id)
                .or_insert_with(|| Arc::new(WorkerSlot::new(subscriber_id))),
        )
    }
}

async fn snapshot_of(slot: &WorkerSlot) -> StatusSnapshot {
    let view = slot.view.read().await.clone();
    StatusSnapshot {
        subscriber_id: slot.subscriber_id,
        state: view.state,
        started_at: view.started_at,
        last_heartbeat: view.last_heartbeat,
        restart_count: view.restart_count,
        api_port: view.api_port,
    }
}

/// Exponential backoff with ±25% jitter, capped at `max_delay_ms`.
fn backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let delay = base_delay_ms
        .saturating_mul(1_u64 << attempt.min(5))
        .min(max_delay_ms);
    let jitter_range = delay / 4;
    let jitter = rand::random::<u64>() % (jitter_range * 2 + 1);
    Duration::from_millis(delay.saturating_sub(jitter_range) + jitter)
}

/// Per-worker supervision task. Owns the process handle exclusively; exits
/// when the worker stops (cleanly or by request) or the restart budget is
/// exhausted.
async fn monitor_worker(
    slot: Arc<WorkerSlot>,
    ctx: MonitorContext,
    mut process: Box<dyn WorkerProcess>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heartbeat = tokio::time::interval(ctx.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            exit = process.wait() => {
                let stopping = slot.view.read().await.state == WorkerState::Stopping;
                if stopping {
                    // stop() owns this transition; just confirm the exit.
                    slot.view.write().await.state = WorkerState::Stopped;
                    return;
                }
                match exit {
                    WorkerExit::Clean => {
                        info!(subscriber = %slot.subscriber_id, "worker exited cleanly");
                        let mut view = slot.view.write().await;
                        view.state = WorkerState::Stopped;
                        view.api_port = None;
                        return;
                    }
                    WorkerExit::Crashed { detail } => {
                        match respawn_with_backoff(&slot, &ctx, &mut shutdown, &detail).await {
                            Some(next) => process = next,
                            None => return,
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                let mut view = slot.view.write().await;
                if view.state == WorkerState::Running {
                    view.last_heartbeat = Some(Utc::now());
                }
            }
            _ = shutdown.changed() => {
                process.terminate().await;
                match tokio::time::timeout(ctx.grace, process.wait()).await {
                    Ok(_) => debug!(subscriber = %slot.subscriber_id, "worker exited gracefully"),
                    Err(_) => {
                        warn!(subscriber = %slot.subscriber_id, "grace period expired, force-killing worker");
                        process.kill().await;
                    }
                }
                slot.view.write().await.state = WorkerState::Stopped;
                return;
            }
        }
    }
}

/// Apply the restart policy after a crash. Returns the replacement process,
/// or `None` once the slot has settled (budget spent or stop requested).
async fn respawn_with_backoff(
    slot: &Arc<WorkerSlot>,
    ctx: &MonitorContext,
    shutdown: &mut watch::Receiver<bool>,
    crash_detail: &str,
) -> Option<Box<dyn WorkerProcess>> {
    let mut attempt = {
        let mut view = slot.view.write().await;
        view.state = WorkerState::Failed;
        view.restart_count += 1;
        view.restart_count
    };
    warn!(
        subscriber = %slot.subscriber_id,
        attempt,
        "worker crashed: {}",
        crash_detail
    );

    loop {
        if attempt > ctx.restart.max_restarts {
            error!(
                subscriber = %slot.subscriber_id,
                "restart budget exhausted, worker requires a manual start"
            );
            return None; // settles in Failed
        }

        let delay = backoff_delay(
            attempt.saturating_sub(1),
            ctx.restart.base_delay_ms,
            ctx.restart.max_delay_ms,
        );
        debug!(subscriber = %slot.subscriber_id, "retrying after {:?}", delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {
                slot.view.write().await.state = WorkerState::Stopped;
                return None;
            }
        }

        slot.view.write().await.state = WorkerState::Starting;
        match ctx.launcher.spawn(&ctx.spec).await {
            Ok(process) => {
                let mut view = slot.view.write().await;
                view.state = WorkerState::Running;
                view.started_at = Some(Utc::now());
                view.last_heartbeat = Some(Utc::now());
                info!(
                    subscriber = %slot.subscriber_id,
                    attempt,
                    "worker restarted after crash"
                );
                return Some(process);
            }
            Err(e) => {
                attempt = {
                    let mut view = slot.view.write().await;
                    view.state = WorkerState::Failed;
                    view.restart_count += 1;
                    view.restart_count
                };
                warn!(subscriber = %slot.subscriber_id, "respawn failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped_and_grows() {
        let base = 100;
        let max = 800;
        for attempt in 0..10 {
            let delay = backoff_delay(attempt, base, max).as_millis() as u64;
            // Jitter is ±25% of the capped exponential value
            assert!(delay <= max + max / 4, "attempt {}: {}ms", attempt, delay);
        }
        // First attempt stays near the base
        let first = backoff_delay(0, base, max).as_millis() as u64;
        assert!(first >= base - base / 4 && first <= base + base / 4);
    }

    #[test]
    fn test_snapshot_default_is_stopped() {
        let snap = StatusSnapshot::stopped(Uuid::new_v4());
        assert_eq!(snap.state, WorkerState::Stopped);
        assert_eq!(snap.restart_count, 0);
        assert!(snap.api_port.is_none());
    }
}
