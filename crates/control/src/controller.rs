//! Control API: the single entry point for start/stop commands.
//!
//! A command flows through the registry (state transition), the session
//! logger (open/close the matching log), the auto-stop scheduler and the
//! valve board, in that order. Every mutating path for a system, including
//! a fired auto-stop, runs under that system's lock.

use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::ControlError;
use crate::model::{
    IrrigationLog, IrrigationSystem, LogId, SessionToken, StopReason, SystemStatus, TriggerType,
};
use crate::registry::{StateRegistry, Transition};
use crate::scheduler::AutoStopScheduler;
use crate::session::SessionLogger;
use crate::store::Store;
use crate::valve::ValveBoard;

/// Buffered control events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Commands, responses, events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControlCommand {
    pub system_id: String,
    pub action: String,
    pub duration: Option<i64>,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
}

impl ControlCommand {
    pub fn new(system_id: impl Into<String>, action: impl Into<String>, duration: Option<i64>) -> Self {
        Self {
            system_id: system_id.into(),
            action: action.into(),
            duration,
            trigger_type: TriggerType::Manual,
            triggered_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub message: String,
    pub system: IrrigationSystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            _ => Err(ControlError::InvalidAction(s.to_string())),
        }
    }
}

/// `None` and `0` mean manual mode; negative durations are rejected.
fn parse_duration(duration: Option<i64>) -> Result<Option<u32>, ControlError> {
    match duration {
        None | Some(0) => Ok(None),
        Some(m) => u32::try_from(m)
            .map(Some)
            .map_err(|_| ControlError::InvalidDuration(m.to_string())),
    }
}

/// Emitted for every closed session; consumed by the alerting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub system_id: String,
    pub field_id: String,
    pub log_id: LogId,
    pub water_amount: i64,
    pub trigger_type: StopReason,
}

impl CompletionEvent {
    fn from_log(log: &IrrigationLog, reason: StopReason) -> Self {
        Self {
            system_id: log.system_id.clone(),
            field_id: log.field_id.clone(),
            log_id: log.id,
            water_amount: log.water_amount,
            trigger_type: log.stop_reason.unwrap_or(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Started {
        system_id: String,
        field_id: String,
        log_id: LogId,
        trigger_type: TriggerType,
        duration_minutes: Option<u32>,
    },
    Completed(CompletionEvent),
}

/// What startup reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed_manual: usize,
    pub rescheduled: usize,
    pub expired: usize,
    pub closed_dangling: usize,
    pub reset_orphaned: usize,
}

// ---------------------------------------------------------------------------
// Per-system serialization
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SystemLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SystemLocks {
    async fn acquire(&self, system_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(table.entry(system_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    registry: StateRegistry,
    logger: SessionLogger,
    scheduler: AutoStopScheduler,
    valves: Mutex<ValveBoard>,
    locks: SystemLocks,
    events: broadcast::Sender<ControlEvent>,
    clock: Arc<dyn Clock>,
}

impl Controller {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry: StateRegistry::new(Arc::clone(&store), Arc::clone(&clock)),
                logger: SessionLogger::new(store, Arc::clone(&clock)),
                scheduler: AutoStopScheduler::new(),
                valves: Mutex::new(ValveBoard::new()),
                locks: SystemLocks::default(),
                events,
                clock,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and apply a start/stop command.
    pub async fn execute(&self, cmd: ControlCommand) -> Result<ControlResponse, ControlError> {
        let action: Action = cmd.action.parse()?;
        let duration = parse_duration(cmd.duration)?;

        // Unknown ids are rejected before a lock entry is created for them.
        self.inner.registry.snapshot(&cmd.system_id).await?;
        let _guard = self.inner.locks.acquire(&cmd.system_id).await;

        let result = match action {
            Action::Start => {
                self.start_locked(
                    &cmd.system_id,
                    duration,
                    cmd.trigger_type,
                    cmd.triggered_by.as_deref(),
                )
                .await
            }
            Action::Stop => {
                self.inner
                    .stop_locked(&cmd.system_id, StopReason::Manual, None)
                    .await
            }
        };

        if let Err(e) = &result {
            error!(system = %cmd.system_id, ?action, "control command failed: {e}");
        }
        result
    }

    async fn start_locked(
        &self,
        system_id: &str,
        duration: Option<u32>,
        trigger_type: TriggerType,
        triggered_by: Option<&str>,
    ) -> Result<ControlResponse, ControlError> {
        let inner = &self.inner;
        let transition = inner
            .registry
            .transition(system_id, SystemStatus::Running)
            .await?;

        if !transition.changed {
            info!(system = %system_id, "start ignored, already running");
            return Ok(ControlResponse {
                message: "Irrigation already running".to_string(),
                system: transition.system,
            });
        }

        let log = match inner
            .logger
            .open(&transition.system, trigger_type, triggered_by, duration)
            .await
        {
            Ok(log) => log,
            Err(e) => {
                inner.rollback(&transition).await;
                return Err(e);
            }
        };

        inner.set_valve(&transition.system, true);

        if let Some(minutes) = duration {
            self.schedule_auto_stop(
                system_id,
                Duration::from_secs(u64::from(minutes) * 60),
                log.token(),
            );
        }

        inner.publish(ControlEvent::Started {
            system_id: log.system_id.clone(),
            field_id: log.field_id.clone(),
            log_id: log.id,
            trigger_type,
            duration_minutes: duration,
        });

        let message = match duration {
            Some(m) => format!("Irrigation started for {m} mins"),
            None => "Irrigation started for manual stop".to_string(),
        };
        Ok(ControlResponse {
            message,
            system: transition.system,
        })
    }

    fn schedule_auto_stop(&self, system_id: &str, after: Duration, token: SessionToken) {
        let weak = Arc::downgrade(&self.inner);
        let id = system_id.to_string();
        self.inner
            .scheduler
            .schedule(system_id, after, token, move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.fire_auto_stop(&id, token).await;
                }
            });
    }

    /// Entry point of a fired auto-stop timer.
    #[cfg(test)]
    pub(crate) async fn fire_auto_stop(&self, system_id: &str, token: SessionToken) {
        self.inner.fire_auto_stop(system_id, token).await;
    }

    /// Reconcile persisted state with valves and timers after a restart.
    ///
    /// Valves were off while the service was down, so an overdue timed
    /// session is billed up to its due time only. A session left open on an
    /// idle system is closed now; its real stop instant was never recorded.
    pub async fn recover(&self) -> Result<RecoveryReport, ControlError> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        for system in inner.registry.all().await? {
            let id = system.system_id.as_str();
            let _guard = inner.locks.acquire(id).await;
            let running = inner.logger.running(id).await?;

            match (system.status, running) {
                (SystemStatus::Idle, None) => {}
                (SystemStatus::Idle, Some(log)) => {
                    warn!(system = %id, log_id = log.id, "closing session left open on an idle system");
                    if let Some(closed) = inner
                        .logger
                        .close(&system, StopReason::Recovery, Some(log.token()))
                        .await?
                    {
                        inner.publish_completed(&closed, StopReason::Recovery);
                    }
                    report.closed_dangling += 1;
                }
                (SystemStatus::Running, None) => {
                    warn!(system = %id, "running system has no open session, resetting to idle");
                    inner.registry.transition(id, SystemStatus::Idle).await?;
                    report.reset_orphaned += 1;
                }
                (SystemStatus::Running, Some(log)) => match log.due_at() {
                    None => {
                        inner.set_valve(&system, true);
                        report.resumed_manual += 1;
                    }
                    Some(due) => {
                        let now = inner.clock.now_ms();
                        if due <= now {
                            info!(system = %id, log_id = log.id, due, "auto-stop overdue, closing at due time");
                            inner
                                .stop_locked(id, StopReason::Scheduled, Some(log.token()))
                                .await?;
                            report.expired += 1;
                        } else {
                            inner.set_valve(&system, true);
                            let remaining = Duration::from_millis((due - now) as u64);
                            self.schedule_auto_stop(id, remaining, log.token());
                            report.rescheduled += 1;
                        }
                    }
                },
            }
        }

        info!(?report, "recovery complete");
        Ok(report)
    }

    /// Register a new irrigation system. It always starts idle with no usage
    /// and counts as freshly maintained.
    pub async fn create_system(
        &self,
        mut system: IrrigationSystem,
    ) -> Result<IrrigationSystem, ControlError> {
        system.status = SystemStatus::Idle;
        system.last_activated = None;
        system.last_maintenance_date = Some(self.inner.clock.now_ms());
        system.total_water_used = 0;
        self.inner.registry.register(&system).await?;
        self.inner.register_valve(&system);
        info!(system = %system.system_id, field = %system.field_id, kind = %system.kind, "system registered");
        self.inner.registry.snapshot(&system.system_id).await
    }

    /// Insert or refresh a system from static configuration.
    pub async fn seed_system(&self, system: &IrrigationSystem) -> Result<(), ControlError> {
        self.inner.registry.upsert(system).await?;
        self.inner.register_valve(system);
        Ok(())
    }

    pub async fn system(&self, system_id: &str) -> Result<IrrigationSystem, ControlError> {
        self.inner.registry.snapshot(system_id).await
    }

    pub async fn systems_for_field(
        &self,
        field_id: &str,
    ) -> Result<Vec<IrrigationSystem>, ControlError> {
        self.inner.registry.systems_for_field(field_id).await
    }

    pub async fn logs_for_field(&self, field_id: &str) -> Result<Vec<IrrigationLog>, ControlError> {
        self.inner.logger.recent_for_field(field_id).await
    }

    pub fn pending_auto_stops(&self) -> usize {
        self.inner.scheduler.pending_count()
    }

    pub fn open_valves(&self) -> usize {
        self.inner.valves().open_count()
    }

    /// Fail-safe: switch every simulated valve off.
    pub fn all_valves_off(&self) {
        self.inner.valves().all_off();
    }
}

impl Inner {
    /// Stop path shared by manual stops, fired auto-stops and recovery.
    /// Caller holds the system lock.
    async fn stop_locked(
        &self,
        system_id: &str,
        reason: StopReason,
        expected: Option<SessionToken>,
    ) -> Result<ControlResponse, ControlError> {
        let transition = self
            .registry
            .transition(system_id, SystemStatus::Idle)
            .await?;

        let closed = match self.logger.close(&transition.system, reason, expected).await {
            Ok(closed) => closed,
            Err(e) => {
                self.rollback(&transition).await;
                return Err(e);
            }
        };

        self.scheduler.cancel(system_id);
        self.set_valve(&transition.system, false);

        let stopped = transition.changed || closed.is_some();
        if let Some(log) = &closed {
            self.publish_completed(log, reason);
        } else if !transition.changed {
            info!(system = %system_id, "stop ignored, already idle");
        }

        let message = if stopped {
            "Irrigation stopped"
        } else {
            "Irrigation already stopped"
        };
        Ok(ControlResponse {
            message: message.to_string(),
            system: self.registry.snapshot(system_id).await?,
        })
    }

    async fn fire_auto_stop(&self, system_id: &str, token: SessionToken) {
        let _guard = self.locks.acquire(system_id).await;

        let system = match self.registry.snapshot(system_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(system = %system_id, %token, "auto-stop: cannot read system: {e}");
                return;
            }
        };
        if !system.is_running() {
            info!(system = %system_id, %token, "auto-stop ignored, system not running");
            return;
        }

        match self.logger.running(system_id).await {
            Ok(Some(log)) if log.token() == token => {}
            Ok(other) => {
                info!(
                    system = %system_id,
                    %token,
                    running = ?other.map(|l| l.id),
                    "auto-stop ignored, session token mismatch"
                );
                return;
            }
            Err(e) => {
                error!(system = %system_id, %token, "auto-stop: cannot read running log: {e}");
                return;
            }
        }

        match self
            .stop_locked(system_id, StopReason::Scheduled, Some(token))
            .await
        {
            Ok(_) => info!(system = %system_id, %token, "auto-stopped irrigation"),
            Err(e) => error!(system = %system_id, %token, "auto-stop failed: {e}"),
        }
    }

    async fn rollback(&self, transition: &Transition) {
        if let Err(e) = self.registry.revert(transition).await {
            error!(
                system = %transition.system.system_id,
                "rollback of state transition failed: {e}"
            );
        }
    }

    fn valves(&self) -> std::sync::MutexGuard<'_, ValveBoard> {
        self.valves.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_valve(&self, system: &IrrigationSystem) {
        self.valves().register(&system.system_id, system.kind);
    }

    fn set_valve(&self, system: &IrrigationSystem, on: bool) {
        let mut valves = self.valves();
        valves.register(&system.system_id, system.kind);
        valves.set(&system.system_id, on);
    }

    fn publish_completed(&self, log: &IrrigationLog, reason: StopReason) {
        self.publish(ControlEvent::Completed(CompletionEvent::from_log(log, reason)));
    }

    fn publish(&self, event: ControlEvent) {
        if self.events.send(event).is_err() {
            debug!("no control event subscribers");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
