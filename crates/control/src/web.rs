use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::controller::{ControlCommand, ControlResponse, Controller};
use crate::error::ControlError;
use crate::model::{HardwareKind, IrrigationLog, IrrigationSystem, TriggerType};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub status: SharedState,
    pub controller: Controller,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSystemRequest {
    pub system_id: String,
    pub field_id: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: HardwareKind,
    #[serde(default)]
    pub flow_rate: Option<f64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl From<NewSystemRequest> for IrrigationSystem {
    fn from(req: NewSystemRequest) -> Self {
        let mut system = IrrigationSystem::new(req.system_id, req.field_id, req.kind);
        system.zone_id = req.zone_id;
        system.flow_rate = req.flow_rate;
        system.is_active = req.is_active.unwrap_or(true);
        system
    }
}

/// Body of a control request. `action` and `duration` are read as raw JSON
/// so a wrongly typed value maps to its own control error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub action: Value,
    #[serde(default)]
    pub duration: Value,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl TryFrom<ControlRequest> for ControlCommand {
    type Error = ControlError;

    fn try_from(req: ControlRequest) -> Result<Self, Self::Error> {
        let system_id = req
            .system_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ControlError::InvalidRequest("systemId is required".to_string()))?;

        let action = match req.action {
            Value::String(action) => action,
            Value::Null => return Err(ControlError::InvalidAction("(missing)".to_string())),
            other => return Err(ControlError::InvalidAction(other.to_string())),
        };

        let duration = match &req.duration {
            Value::Null => None,
            other => Some(
                other
                    .as_i64()
                    .ok_or_else(|| ControlError::InvalidDuration(other.to_string()))?,
            ),
        };

        Ok(ControlCommand {
            system_id,
            action,
            duration,
            trigger_type: req.trigger_type.unwrap_or_default(),
            triggered_by: req.triggered_by,
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidAction(_)
            | ControlError::InvalidDuration(_)
            | ControlError::InvalidRequest(_)
            | ControlError::InvalidSystem(_) => StatusCode::BAD_REQUEST,
            ControlError::AlreadyExists(_) => StatusCode::CONFLICT,
            ControlError::Conflict(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        json_error(status, self.code(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/irrigation/control", post(control))
        .route("/api/irrigation/logs/{field_id}", get(field_logs))
        .route("/api/irrigation/systems", post(create_system))
        .route("/api/irrigation/systems/{field_id}", get(field_systems))
        .route("/api/status", get(api_status))
        .with_state(state)
}

fn read_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ControlError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ControlError::InvalidRequest(rejection.body_text()))
}

async fn control(
    State(state): State<AppState>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<Json<ControlResponse>, ControlError> {
    let req = read_body(body)?;
    let system_id = req.system_id.clone();

    let result = match ControlCommand::try_from(req) {
        Ok(cmd) => state.controller.execute(cmd).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        let mut st = state.status.write().await;
        st.record_error(system_id.as_deref(), e.to_string());
    }
    result.map(Json)
}

async fn field_logs(
    State(state): State<AppState>,
    Path(field_id): Path<String>,
) -> Result<Json<Vec<IrrigationLog>>, ControlError> {
    Ok(Json(state.controller.logs_for_field(&field_id).await?))
}

async fn field_systems(
    State(state): State<AppState>,
    Path(field_id): Path<String>,
) -> Result<Json<Vec<IrrigationSystem>>, ControlError> {
    Ok(Json(state.controller.systems_for_field(&field_id).await?))
}

async fn create_system(
    State(state): State<AppState>,
    body: Result<Json<NewSystemRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IrrigationSystem>), ControlError> {
    let req = read_body(body)?;
    let system = state.controller.create_system(req.into()).await?;
    let mut st = state.status.write().await;
    st.record_system(format!("system '{}' registered", system.system_id));
    Ok((StatusCode::CREATED, Json(system)))
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.status.read().await;
    Json(st.to_status(
        state.controller.pending_auto_stops(),
        state.controller.open_valves(),
    ))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::state::ServiceStatus;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let controller = Controller::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        controller
            .create_system(IrrigationSystem::new("s1", "f1", HardwareKind::Drip))
            .await
            .unwrap();
        router(AppState {
            status: ServiceStatus::shared(),
            controller,
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn start_returns_message_and_snapshot() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "s1", "action": "start", "duration": 30})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Irrigation started for 30 mins");
        assert_eq!(body["system"]["systemId"], "s1");
        assert_eq!(body["system"]["status"], "running");
        assert_eq!(body["system"]["type"], "drip");
    }

    #[tokio::test]
    async fn stop_on_idle_is_ok() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "s1", "action": "stop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Irrigation already stopped");
    }

    #[tokio::test]
    async fn unknown_system_is_404() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "ghost", "action": "start"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert!(body["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn bad_action_and_duration_are_400() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "s1", "action": "pause"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_action");

        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "s1", "action": "start", "duration": -1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_duration");
    }

    async fn control_error(body: Value) -> (StatusCode, Value) {
        let app = test_app().await;
        send(&app, "POST", "/api/irrigation/control", Some(body)).await
    }

    #[tokio::test]
    async fn missing_or_mistyped_action_is_invalid_action() {
        for body in [
            json!({"systemId": "s1"}),
            json!({"systemId": "s1", "action": 7}),
            json!({"systemId": "s1", "action": null}),
        ] {
            let (status, resp) = control_error(body.clone()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(resp["error"], "invalid_action", "{body}");
            assert!(resp["message"].is_string());
        }
    }

    #[tokio::test]
    async fn fractional_or_text_duration_is_invalid_duration() {
        for duration in [json!(1.5), json!("ten"), json!(true)] {
            let (status, resp) =
                control_error(json!({"systemId": "s1", "action": "start", "duration": duration.clone()}))
                    .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{duration}");
            assert_eq!(resp["error"], "invalid_duration", "{duration}");
        }
    }

    #[tokio::test]
    async fn unreadable_body_is_invalid_request_json() {
        let app = test_app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/irrigation/control")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("start please"))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "invalid_request");

        let (status, body) = control_error(json!({"action": "start"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, body) =
            control_error(json!({"systemId": "s1", "action": "start", "triggerType": "laser"}))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn bad_action_is_reported_before_bad_duration() {
        let (_, body) =
            control_error(json!({"systemId": "s1", "action": 1, "duration": 1.5})).await;
        assert_eq!(body["error"], "invalid_action");
    }

    #[tokio::test]
    async fn logs_listed_for_field() {
        let app = test_app().await;
        for action in ["start", "stop"] {
            send(
                &app,
                "POST",
                "/api/irrigation/control",
                Some(json!({"systemId": "s1", "action": action})),
            )
            .await;
        }
        let (status, body) = send(&app, "GET", "/api/irrigation/logs/f1", None).await;
        assert_eq!(status, StatusCode::OK);
        let logs = body.as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["systemId"], "s1");
        assert_eq!(logs[0]["status"], "completed");
        assert_eq!(logs[0]["stopReason"], "manual");
        assert!(logs[0]["endTime"].is_i64());

        let (_, body) = send(&app, "GET", "/api/irrigation/logs/other", None).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_and_list_systems() {
        let app = test_app().await;
        let new_system = json!({
            "systemId": "s2",
            "fieldId": "f1",
            "zoneId": "east",
            "type": "sprinkler",
            "flowRate": 25.0
        });
        let (status, body) =
            send(&app, "POST", "/api/irrigation/systems", Some(new_system.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "idle");
        assert_eq!(body["isActive"], true);
        assert!(body["lastMaintenanceDate"].is_i64());
        assert_eq!(body["totalWaterUsed"], 0);

        let (status, body) =
            send(&app, "POST", "/api/irrigation/systems", Some(new_system)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exists");

        let (status, body) = send(&app, "GET", "/api/irrigation/systems/f1", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["systemId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn invalid_system_definition_is_400() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/systems",
            Some(json!({"systemId": "s3", "fieldId": "f1", "type": "flood", "flowRate": -2.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_system");

        let (status, body) = send(
            &app,
            "POST",
            "/api/irrigation/systems",
            Some(json!({"systemId": "s4", "fieldId": "f1", "type": "hose"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn trigger_origin_is_listed_with_the_log() {
        let app = test_app().await;
        send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({
                "systemId": "s1",
                "action": "start",
                "triggerType": "sensor",
                "triggeredBy": "moisture-2"
            })),
        )
        .await;
        let (_, body) = send(&app, "GET", "/api/irrigation/logs/f1", None).await;
        assert_eq!(body[0]["triggerType"], "sensor");
        assert_eq!(body[0]["triggeredBy"], "moisture-2");
        assert_eq!(body[0]["status"], "running");
    }

    #[tokio::test]
    async fn status_reports_activity() {
        let app = test_app().await;
        send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "ghost", "action": "start"})),
        )
        .await;
        send(
            &app,
            "POST",
            "/api/irrigation/control",
            Some(json!({"systemId": "s1", "action": "start", "duration": 5})),
        )
        .await;

        let (status, body) = send(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqttConnected"], false);
        assert_eq!(body["pendingAutoStops"], 1);
        assert_eq!(body["openValves"], 1);
        let events = body["events"].as_array().unwrap();
        assert_eq!(events[0]["kind"], "error");
        assert_eq!(events[0]["systemId"], "ghost");
    }
}
