use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::controller::ControlEvent;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<ServiceStatus>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Operator-facing view of the service: uptime, broker link and the most
/// recent control activity.
pub struct ServiceStatus {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<ActivityEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub system_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub pending_auto_stops: usize,
    pub open_valves: usize,
    pub events: Vec<ActivityEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ServiceStatus {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a broadcast control event.
    pub fn record_control(&mut self, event: &ControlEvent) {
        match event {
            ControlEvent::Started {
                system_id,
                field_id,
                log_id,
                trigger_type,
                duration_minutes,
            } => {
                let mode = match duration_minutes {
                    Some(m) => format!("{m} min"),
                    None => "manual stop".to_string(),
                };
                self.push_event(
                    EventKind::Start,
                    Some(system_id.clone()),
                    format!("session {log_id} started on {field_id} ({trigger_type}, {mode})"),
                );
            }
            ControlEvent::Completed(c) => {
                self.push_event(
                    EventKind::Stop,
                    Some(c.system_id.clone()),
                    format!(
                        "session {} closed ({}), {} L used",
                        c.log_id, c.trigger_type, c.water_amount
                    ),
                );
            }
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, system_id: Option<&str>, detail: String) {
        self.push_event(EventKind::Error, system_id.map(str::to_string), detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self, pending_auto_stops: usize, open_valves: usize) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            pending_auto_stops,
            open_valves,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, system_id: Option<String>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ActivityEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            system_id,
            detail,
        });
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
