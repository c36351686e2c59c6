//! autolockd - automatic door locking daemon
//!
//! Watches door contact sensors and lock state over MQTT, counts down a
//! schedule-dependent delay after a door closes, then locks the door
//! and verifies the device actually reports locked.
//!
//! Module structure:
//! - `domain/` - Core types (DoorId, Phase, events, schedule math)
//! - `io/` - External interfaces (MQTT ingest, lock actuation, notify, HTTP)
//! - `services/` - Business logic (safety checks, door state machine)
//! - `infra/` - Infrastructure (config, metrics, retry, broker)

use autolockd::domain::types::{DoorEvent, DoorId};
use autolockd::infra::{Config, Metrics};
use autolockd::io::http::{DoorHandle, DoorRegistry};
use autolockd::io::lock::{DeviceStates, LockController};
use autolockd::io::mqtt::build_topic_router;
use autolockd::io::notify::NotificationService;
use autolockd::services::door::DoorController;
use autolockd::services::safety::SafetyValidator;
use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// autolockd - automatic door locking daemon
#[derive(Parser, Debug)]
#[command(name = "autolockd", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "autolockd starting");

    let args = Args::parse();
    // --config wins; otherwise CONFIG_FILE, then the default path
    let config_path = args
        .config
        .unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    if config.doors().is_empty() {
        warn!(config_file = %config.config_file(), "no doors configured");
    }

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        doors = %config.doors().len(),
        broker_enabled = %config.broker_enabled(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    // Start embedded MQTT broker if enabled
    autolockd::infra::broker::start_embedded_broker(&config);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // MQTT client shared by ingest, lock actuation, and notifications
    let mut mqttoptions = MqttOptions::new("autolockd", config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }
    let (mqtt_client, eventloop) = AsyncClient::new(mqttoptions, 100);

    let metrics = Arc::new(Metrics::new());
    let states = Arc::new(DeviceStates::new());
    let lock = Arc::new(LockController::new(mqtt_client.clone()));
    let safety = Arc::new(SafetyValidator::new(states.clone(), lock));
    let notifier = Arc::new(NotificationService::new(
        mqtt_client.clone(),
        config.notify_topic().to_string(),
        config.notify_webhook_url().map(String::from),
        config.notify_timeout(),
    ));

    // One task and bounded event channel per configured door
    let mut door_tasks = JoinSet::new();
    let mut senders: FxHashMap<DoorId, mpsc::Sender<DoorEvent>> = FxHashMap::default();
    let mut registry_entries: FxHashMap<String, DoorHandle> = FxHashMap::default();
    for door in config.doors() {
        let (tx, rx) = mpsc::channel(64);
        let (controller, phase_rx) =
            DoorController::new(door.clone(), safety.clone(), notifier.clone(), metrics.clone());

        senders.insert(door.id.clone(), tx.clone());
        registry_entries
            .insert(door.id.to_string(), DoorHandle { tx, phase: phase_rx });

        let door_shutdown = shutdown_rx.clone();
        door_tasks.spawn(controller.run(rx, door_shutdown));
    }
    let registry = Arc::new(DoorRegistry::new(registry_entries));

    // Start MQTT ingest
    let router = build_topic_router(config.doors(), &senders);
    let ingest_config = config.clone();
    let ingest_states = states.clone();
    let ingest_metrics = metrics.clone();
    let ingest_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = autolockd::io::mqtt::start_mqtt_ingest(
            &ingest_config,
            mqtt_client,
            eventloop,
            router,
            ingest_states,
            ingest_metrics,
            ingest_shutdown,
        )
        .await
        {
            error!(error = %e, "mqtt ingest error");
        }
    });

    // Start HTTP server for metrics and service commands (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let http_metrics = metrics.clone();
        let http_registry = registry.clone();
        let site_id = config.site_id().to_string();
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = autolockd::io::http::start_http_server(
                http_port,
                http_metrics,
                http_registry,
                site_id,
                http_shutdown,
            )
            .await
            {
                error!(error = %e, "http server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run until every door task has stopped
    while door_tasks.join_next().await.is_some() {}

    info!("autolockd shutdown complete");
    Ok(())
}
