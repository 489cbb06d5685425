//! Opens and closes irrigation logs, one per continuous run.

use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::ControlError;
use crate::model::{
    CloseLog, IrrigationLog, IrrigationSystem, NewLog, SessionToken, StopReason, TriggerType,
};
use crate::store::{with_retry, Store, StoreError};

/// Number of logs returned by a field listing.
pub const RECENT_LOG_LIMIT: u32 = 20;

pub struct SessionLogger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl SessionLogger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Start a session log for `system`. The store rejects a second running
    /// log for the same system, which surfaces as `Conflict`.
    pub async fn open(
        &self,
        system: &IrrigationSystem,
        trigger_type: TriggerType,
        triggered_by: Option<&str>,
        duration_minutes: Option<u32>,
    ) -> Result<IrrigationLog, ControlError> {
        let new_log = NewLog {
            system_id: system.system_id.clone(),
            field_id: system.field_id.clone(),
            start_time: self.clock.now_ms(),
            duration_minutes,
            trigger_type,
            triggered_by: triggered_by.map(str::to_string),
        };

        let log = match with_retry("open_log", || self.store.open_log(&new_log)).await {
            Ok(log) => log,
            Err(StoreError::Conflict(msg)) => return Err(ControlError::Conflict(msg)),
            Err(e) => return Err(e.into()),
        };

        info!(
            system = %log.system_id,
            log_id = log.id,
            trigger = %log.trigger_type,
            by = ?log.triggered_by,
            duration_min = ?log.duration_minutes,
            "session opened"
        );
        Ok(log)
    }

    /// Close the running log of `system`, if any. With `expected` set only
    /// that specific session may be closed. Returns `None` when nothing was
    /// running (or the expected session is gone). A timed session closed
    /// after its due time is billed only up to that time.
    pub async fn close(
        &self,
        system: &IrrigationSystem,
        reason: StopReason,
        expected: Option<SessionToken>,
    ) -> Result<Option<IrrigationLog>, ControlError> {
        let close = CloseLog {
            system_id: system.system_id.clone(),
            expected,
            end_time: self.clock.now_ms(),
            flow_rate: system.effective_flow_rate(),
            reason,
        };

        let closed = with_retry("close_running_log", || self.store.close_running_log(&close)).await?;

        match &closed {
            Some(log) => info!(
                system = %log.system_id,
                log_id = log.id,
                reason = %reason,
                water_amount = log.water_amount,
                "session closed"
            ),
            None => debug!(system = %system.system_id, reason = %reason, "no running session to close"),
        }
        Ok(closed)
    }

    pub async fn running(&self, system_id: &str) -> Result<Option<IrrigationLog>, ControlError> {
        Ok(with_retry("running_log", || self.store.running_log(system_id)).await?)
    }

    /// Most recent logs of a field, newest first.
    pub async fn recent_for_field(&self, field_id: &str) -> Result<Vec<IrrigationLog>, ControlError> {
        Ok(with_retry("recent_logs_for_field", || {
            self.store.recent_logs_for_field(field_id, RECENT_LOG_LIMIT)
        })
        .await?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
