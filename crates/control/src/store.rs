//! Keyed store for irrigation systems and logs. The SQLite backend lives in
//! `db.rs`; `MemoryStore` backs dev mode (`DB_URL=memory`) and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::model::{
    water_used, CloseLog, IrrigationLog, IrrigationSystem, LogId, LogStatus, NewLog, SystemStatus,
};

/// Pause before the single retry of a transient store failure.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("constraint violated: {0}")]
    Conflict(String),
    /// Transient backend failure; worth one retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A persisted row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new system. `Conflict` if the id is taken.
    async fn insert_system(&self, system: &IrrigationSystem) -> Result<(), StoreError>;

    /// Insert or update a system's metadata, leaving status and usage
    /// counters of an existing row untouched.
    async fn upsert_system(&self, system: &IrrigationSystem) -> Result<(), StoreError>;

    async fn get_system(&self, system_id: &str) -> Result<Option<IrrigationSystem>, StoreError>;

    async fn list_systems(&self) -> Result<Vec<IrrigationSystem>, StoreError>;

    async fn systems_for_field(&self, field_id: &str) -> Result<Vec<IrrigationSystem>, StoreError>;

    /// Set `status` and `last_activated` only if the current status is
    /// `expected`. Returns whether the row was updated.
    async fn compare_and_set_status(
        &self,
        system_id: &str,
        expected: SystemStatus,
        desired: SystemStatus,
        last_activated: Option<i64>,
    ) -> Result<bool, StoreError>;

    /// Create a running log. `Conflict` if the system already has one.
    async fn open_log(&self, log: &NewLog) -> Result<IrrigationLog, StoreError>;

    /// Claim and complete the running log in one atomic write, adding its
    /// water to the system's total. The end time is the log's
    /// [`billable_end`](IrrigationLog::billable_end). `None` if nothing
    /// matched.
    async fn close_running_log(&self, close: &CloseLog) -> Result<Option<IrrigationLog>, StoreError>;

    async fn running_log(&self, system_id: &str) -> Result<Option<IrrigationLog>, StoreError>;

    /// Newest first by start time.
    async fn recent_logs_for_field(
        &self,
        field_id: &str,
        limit: u32,
    ) -> Result<Vec<IrrigationLog>, StoreError>;
}

/// Run a store operation, retrying once after [`RETRY_BACKOFF`] if it fails
/// with [`StoreError::Unavailable`].
pub async fn with_retry<T, F, Fut>(op: &str, mut attempt: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match attempt().await {
        Err(StoreError::Unavailable(e)) => {
            warn!(op, "store unavailable, retrying once: {e}");
            tokio::time::sleep(RETRY_BACKOFF).await;
            attempt().await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    systems: HashMap<String, IrrigationSystem>,
    logs: Vec<IrrigationLog>,
    /// system_id -> index into `logs` of its running log.
    running: HashMap<String, usize>,
    last_log_id: LogId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryInner {
    fn running_log(&self, system_id: &str) -> Option<&IrrigationLog> {
        self.running.get(system_id).and_then(|&i| self.logs.get(i))
    }
}

fn sorted_by_id(mut systems: Vec<IrrigationSystem>) -> Vec<IrrigationSystem> {
    systems.sort_by(|a, b| a.system_id.cmp(&b.system_id));
    systems
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_system(&self, system: &IrrigationSystem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.systems.contains_key(&system.system_id) {
            return Err(StoreError::Conflict(format!(
                "system '{}' already exists",
                system.system_id
            )));
        }
        inner
            .systems
            .insert(system.system_id.clone(), system.clone());
        Ok(())
    }

    async fn upsert_system(&self, system: &IrrigationSystem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.systems.get_mut(&system.system_id) {
            Some(existing) => {
                existing.field_id = system.field_id.clone();
                existing.zone_id = system.zone_id.clone();
                existing.kind = system.kind;
                existing.is_active = system.is_active;
                existing.flow_rate = system.flow_rate;
            }
            None => {
                inner
                    .systems
                    .insert(system.system_id.clone(), system.clone());
            }
        }
        Ok(())
    }

    async fn get_system(&self, system_id: &str) -> Result<Option<IrrigationSystem>, StoreError> {
        Ok(self.lock().systems.get(system_id).cloned())
    }

    async fn list_systems(&self) -> Result<Vec<IrrigationSystem>, StoreError> {
        Ok(sorted_by_id(self.lock().systems.values().cloned().collect()))
    }

    async fn systems_for_field(&self, field_id: &str) -> Result<Vec<IrrigationSystem>, StoreError> {
        Ok(sorted_by_id(
            self.lock()
                .systems
                .values()
                .filter(|s| s.field_id == field_id)
                .cloned()
                .collect(),
        ))
    }

    async fn compare_and_set_status(
        &self,
        system_id: &str,
        expected: SystemStatus,
        desired: SystemStatus,
        last_activated: Option<i64>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.systems.get_mut(system_id) {
            Some(s) if s.status == expected => {
                s.status = desired;
                s.last_activated = last_activated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn open_log(&self, log: &NewLog) -> Result<IrrigationLog, StoreError> {
        let mut inner = self.lock();
        if inner.running.contains_key(&log.system_id) {
            return Err(StoreError::Conflict(format!(
                "system '{}' already has a running log",
                log.system_id
            )));
        }
        inner.last_log_id += 1;
        let created = IrrigationLog {
            id: inner.last_log_id,
            system_id: log.system_id.clone(),
            field_id: log.field_id.clone(),
            start_time: log.start_time,
            end_time: None,
            duration_minutes: log.duration_minutes,
            water_amount: 0,
            status: LogStatus::Running,
            trigger_type: log.trigger_type,
            triggered_by: log.triggered_by.clone(),
            stop_reason: None,
        };
        let index = inner.logs.len();
        inner.logs.push(created.clone());
        inner.running.insert(log.system_id.clone(), index);
        Ok(created)
    }

    async fn close_running_log(&self, close: &CloseLog) -> Result<Option<IrrigationLog>, StoreError> {
        let mut inner = self.lock();
        let Some(&index) = inner.running.get(&close.system_id) else {
            return Ok(None);
        };
        if close.expected.is_some_and(|t| t.0 != inner.logs[index].id) {
            return Ok(None);
        }
        inner.running.remove(&close.system_id);

        let log = &mut inner.logs[index];
        let end_time = log.billable_end(close.end_time);
        log.end_time = Some(end_time);
        log.status = LogStatus::Completed;
        log.stop_reason = Some(close.reason);
        log.water_amount = water_used(log.start_time, end_time, close.flow_rate);
        let closed = log.clone();

        if let Some(system) = inner.systems.get_mut(&close.system_id) {
            system.total_water_used += closed.water_amount;
        }
        Ok(Some(closed))
    }

    async fn running_log(&self, system_id: &str) -> Result<Option<IrrigationLog>, StoreError> {
        Ok(self.lock().running_log(system_id).cloned())
    }

    async fn recent_logs_for_field(
        &self,
        field_id: &str,
        limit: u32,
    ) -> Result<Vec<IrrigationLog>, StoreError> {
        let inner = self.lock();
        let mut logs: Vec<IrrigationLog> = inner
            .logs
            .iter()
            .filter(|l| l.field_id == field_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        logs.truncate(limit as usize);
        Ok(logs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
