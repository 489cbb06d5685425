mod clock;
mod config;
mod controller;
mod db;
mod error;
mod model;
mod mqtt;
mod registry;
mod scheduler;
mod session;
mod state;
mod store;
mod valve;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::str::FromStr;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use controller::{ControlEvent, Controller};
use db::Db;
use state::{ServiceStatus, SharedState};
use store::{MemoryStore, Store};
use web::AppState;

const DEFAULT_DB_URL: &str = "sqlite:irrigation.db?mode=rwc";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| DEFAULT_DB_URL.to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let mqtt_host = env::var("MQTT_HOST").ok().filter(|h| !h.trim().is_empty());
    let mqtt_port: u16 = env_or("MQTT_PORT", 1883);

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn Store> = if db_url == "memory" {
        warn!("DB_URL=memory: state is not persisted across restarts");
        Arc::new(MemoryStore::new())
    } else {
        let db = Db::connect(&db_url).await?;
        db.migrate().await?;
        info!(%db_url, "db ready");
        Arc::new(db)
    };

    let controller = Controller::new(store, Arc::new(SystemClock));

    // ── Config file (seed systems) ──────────────────────────────────
    if let Some(cfg) = config::load_if_present(&config_path)? {
        config::apply(&cfg, &controller).await?;
    }

    // ── Status + event relay ──────────────────────────────────
    let status = ServiceStatus::shared();

    let mqtt = mqtt_host.map(|host| {
        let mut options = MqttOptions::new("irrigation-control", host, mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        AsyncClient::new(options, 20)
    });
    let publisher = mqtt.as_ref().map(|(client, _)| client.clone());

    // Subscribed before recovery so sessions it closes are relayed too.
    tokio::spawn(relay_events(
        controller.subscribe(),
        Arc::clone(&status),
        publisher,
    ));

    // ── Valves + recovery ───────────────────────────────────────────
    controller.all_valves_off();
    let report = controller
        .recover()
        .await
        .context("startup recovery failed")?;

    {
        let mut st = status.write().await;
        st.record_system(format!(
            "service started: {} manual session(s) resumed, {} rescheduled, {} expired, \
             {} dangling log(s) closed, {} orphaned system(s) reset",
            report.resumed_manual,
            report.rescheduled,
            report.expired,
            report.closed_dangling,
            report.reset_orphaned
        ));
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        status: Arc::clone(&status),
        controller: controller.clone(),
    };
    let web = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    match mqtt {
        Some((client, eventloop)) => run_mqtt(client, eventloop, controller, status).await,
        None => {
            info!("MQTT_HOST not set, mqtt bridge disabled");
            web.await.context("web server task failed")?;
            Ok(())
        }
    }
}

/// Mirror control events into the activity feed and forward completions to
/// the broker for alerting.
async fn relay_events(
    mut events: broadcast::Receiver<ControlEvent>,
    status: SharedState,
    publisher: Option<AsyncClient>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event relay lagged, events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        status.write().await.record_control(&event);

        let (ControlEvent::Completed(done), Some(client)) = (&event, &publisher) else {
            continue;
        };
        match mqtt::completion_payload(done) {
            Ok(payload) => {
                let topic = mqtt::completion_topic(&done.system_id);
                if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                    warn!(%topic, log_id = done.log_id, "completion publish failed: {e}");
                }
            }
            Err(e) => error!(log_id = done.log_id, "completion event not serializable: {e}"),
        }
    }
}

async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    controller: Controller,
    status: SharedState,
) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                // Awaited in place: a system's commands apply in delivery order.
                mqtt::handle_control_message(&controller, &status, &p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Non-blocking: the request queue is drained by this loop.
                if let Err(e) = client.try_subscribe(mqtt::CONTROL_FILTER, QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = status.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_error(None, format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
