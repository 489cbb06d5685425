use serde::Deserialize;
use tracing::{info, warn};

use crate::controller::{CompletionEvent, ControlCommand, Controller};
use crate::model::TriggerType;
use crate::state::SharedState;

/// Subscription filter for control commands.
pub(crate) const CONTROL_FILTER: &str = "irrigation/+/control";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ControlMsg {
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) duration: Option<i64>,
    #[serde(default)]
    pub(crate) trigger_type: TriggerType,
    #[serde(default)]
    pub(crate) triggered_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract system_id from "irrigation/<system_id>/control".
pub(crate) fn extract_system_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "irrigation" && parts[2] == "control" && !parts[1].is_empty()
    {
        Some(parts[1])
    } else {
        None
    }
}

/// "irrigation/<system_id>/completed", where completion events are published.
pub(crate) fn completion_topic(system_id: &str) -> String {
    format!("irrigation/{system_id}/completed")
}

pub(crate) fn completion_payload(event: &CompletionEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

/// Parse a control payload: either a JSON object `{action, duration?,
/// triggerType?}` or a bare action word such as `start`. The action itself is
/// validated by the controller.
pub(crate) fn parse_control_payload(system_id: &str, payload: &[u8]) -> Result<ControlCommand, String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    if text.starts_with('{') {
        let msg: ControlMsg =
            serde_json::from_str(text).map_err(|e| format!("bad control json: {e}"))?;
        Ok(ControlCommand {
            system_id: system_id.to_string(),
            action: msg.action,
            duration: msg.duration,
            trigger_type: msg.trigger_type,
            triggered_by: msg.triggered_by,
        })
    } else if text.is_empty() {
        Err("empty control payload".to_string())
    } else {
        Ok(ControlCommand::new(system_id, text, None))
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Apply one message received on a control topic. The poll loop awaits this
/// before reading the next message.
pub(crate) async fn handle_control_message(
    controller: &Controller,
    status: &SharedState,
    topic: &str,
    payload: &[u8],
) {
    let Some(system_id) = extract_system_id(topic) else {
        warn!(%topic, "unhandled topic");
        return;
    };

    let cmd = match parse_control_payload(system_id, payload) {
        Ok(cmd) => cmd,
        Err(msg) => {
            warn!(%topic, "{msg}");
            status.write().await.record_error(Some(system_id), msg);
            return;
        }
    };

    match controller.execute(cmd).await {
        Ok(resp) => info!(system = %system_id, "mqtt control: {}", resp.message),
        Err(e) => status.write().await.record_error(Some(system_id), e.to_string()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
