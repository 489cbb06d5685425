//! Irrigation systems, session logs and the small value types shared by the
//! registry, the session logger and the store backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flow rate assumed when a system has none configured (liters/minute).
pub const DEFAULT_FLOW_RATE_LPM: f64 = 15.0;

/// Upper bound accepted for a configured flow rate (liters/minute).
pub const MAX_FLOW_RATE_LPM: f64 = 10_000.0;

const MS_PER_MINUTE: f64 = 60_000.0;

pub type LogId = i64;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    Drip,
    Sprinkler,
    Flood,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Completed,
}

/// What started a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
    Sensor,
    Ai,
}

/// What closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Manual,
    Scheduled,
    Recovery,
}

/// Generates `as_str`, `Display` and `FromStr` for the lowercase column
/// encoding used by the SQLite backend.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{other}'", stringify!($ty))),
                }
            }
        }
    };
}

text_enum!(SystemStatus { Idle => "idle", Running => "running" });
text_enum!(HardwareKind { Drip => "drip", Sprinkler => "sprinkler", Flood => "flood" });
text_enum!(LogStatus { Running => "running", Completed => "completed" });
text_enum!(TriggerType { Manual => "manual", Scheduled => "scheduled", Sensor => "sensor", Ai => "ai" });
text_enum!(StopReason { Manual => "manual", Scheduled => "scheduled", Recovery => "recovery" });

// ---------------------------------------------------------------------------
// Session token
// ---------------------------------------------------------------------------

/// Identity of the session a deferred stop was scheduled for. Log ids are
/// never reused, so a token from an earlier session can't match a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(pub LogId);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Irrigation system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationSystem {
    pub system_id: String,
    pub field_id: String,
    pub zone_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: HardwareKind,
    pub status: SystemStatus,
    /// Decommissioned systems stay listed but are flagged inactive.
    pub is_active: bool,
    pub flow_rate: Option<f64>,
    pub last_activated: Option<i64>,
    pub last_maintenance_date: Option<i64>,
    pub total_water_used: i64,
}

impl IrrigationSystem {
    /// A fresh, idle system with no usage history.
    pub fn new(
        system_id: impl Into<String>,
        field_id: impl Into<String>,
        kind: HardwareKind,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            field_id: field_id.into(),
            zone_id: None,
            kind,
            status: SystemStatus::Idle,
            is_active: true,
            flow_rate: None,
            last_activated: None,
            last_maintenance_date: None,
            total_water_used: 0,
        }
    }

    pub fn effective_flow_rate(&self) -> f64 {
        effective_flow_rate(self.flow_rate)
    }

    pub fn is_running(&self) -> bool {
        self.status == SystemStatus::Running
    }

    /// Field-level problems with this definition, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.system_id.trim().is_empty() {
            problems.push("system_id is empty".to_string());
        }
        if self.field_id.trim().is_empty() {
            problems.push("field_id is empty".to_string());
        }
        if let Some(rate) = self.flow_rate {
            if !rate.is_finite() || rate <= 0.0 {
                problems.push(format!("flow_rate must be positive, got {rate}"));
            } else if rate > MAX_FLOW_RATE_LPM {
                problems.push(format!(
                    "flow_rate {rate} exceeds maximum of {MAX_FLOW_RATE_LPM} L/min"
                ));
            }
        }
        problems
    }
}

pub fn effective_flow_rate(flow_rate: Option<f64>) -> f64 {
    match flow_rate {
        Some(rate) if rate.is_finite() && rate > 0.0 => rate,
        _ => DEFAULT_FLOW_RATE_LPM,
    }
}

/// Liters delivered between two timestamps at the given flow rate, rounded
/// down to whole liters. A clock that went backwards yields zero.
pub fn water_used(start_ms: i64, end_ms: i64, flow_rate_lpm: f64) -> i64 {
    let elapsed_minutes = (end_ms - start_ms).max(0) as f64 / MS_PER_MINUTE;
    (elapsed_minutes * flow_rate_lpm).floor() as i64
}

// ---------------------------------------------------------------------------
// Irrigation log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationLog {
    pub id: LogId,
    pub system_id: String,
    pub field_id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_minutes: Option<u32>,
    pub water_amount: i64,
    pub status: LogStatus,
    pub trigger_type: TriggerType,
    /// Free-form origin of the command (operator, sensor or rule id).
    pub triggered_by: Option<String>,
    pub stop_reason: Option<StopReason>,
}

impl IrrigationLog {
    pub fn token(&self) -> SessionToken {
        SessionToken(self.id)
    }

    /// When a timed session is due to stop, if it has a duration.
    pub fn due_at(&self) -> Option<i64> {
        self.duration_minutes
            .map(|m| self.start_time + i64::from(m) * 60_000)
    }

    /// End time to bill a close at `now`. A timed session never runs past
    /// its due time, however late the close happens.
    pub fn billable_end(&self, now: i64) -> i64 {
        self.due_at().map_or(now, |due| due.min(now))
    }
}

/// Insert request for a new running log.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub system_id: String,
    pub field_id: String,
    pub start_time: i64,
    pub duration_minutes: Option<u32>,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
}

/// Atomic claim of a system's running log.
#[derive(Debug, Clone)]
pub struct CloseLog {
    pub system_id: String,
    /// Only close the running log if it is this one.
    pub expected: Option<SessionToken>,
    /// Requested end. Backends cap timed sessions at their due time.
    pub end_time: i64,
    pub flow_rate: f64,
    pub reason: StopReason,
}

// ===========================================================================
// Tests
// ===========================================================================
