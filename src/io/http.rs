//! HTTP surface: Prometheus metrics, health, and door service commands
//!
//! Exposes metrics in Prometheus text format at /metrics and accepts
//! operator commands at POST /doors/{id}/{action}. Uses hyper for the
//! HTTP server.

use crate::domain::types::{DoorCommand, DoorEvent, Phase};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_CYCLE_MS_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Default snooze window when the query string omits minutes
const DEFAULT_SNOOZE_MINUTES: u32 = 30;

/// Per-door handles held by the HTTP surface
#[derive(Clone)]
pub struct DoorHandle {
    pub tx: mpsc::Sender<DoorEvent>,
    pub phase: watch::Receiver<Phase>,
}

/// Registry of doors addressable over HTTP, keyed by door id
pub struct DoorRegistry {
    entries: FxHashMap<String, DoorHandle>,
}

impl DoorRegistry {
    pub fn new(entries: FxHashMap<String, DoorHandle>) -> Self {
        Self { entries }
    }

    fn get(&self, door_id: &str) -> Option<&DoorHandle> {
        self.entries.get(door_id)
    }

    fn phases(&self) -> impl Iterator<Item = (&str, Phase)> {
        self.entries.iter().map(|(id, handle)| (id.as_str(), *handle.phase.borrow()))
    }
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Numeric encoding of the door phase for the phase gauge
fn phase_gauge_value(phase: Phase) -> u64 {
    match phase {
        Phase::Idle => 0,
        Phase::CountingDown => 1,
        Phase::Locking => 2,
        Phase::Verifying => 3,
        Phase::Failed => 4,
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, registry: &DoorRegistry, site: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(8192);

    write_trigger_metrics(&mut output, site, &summary);
    write_cycle_metrics(&mut output, site, &summary);
    write_channel_metrics(&mut output, site, &summary);
    write_phase_gauges(&mut output, site, registry);

    output
}

fn write_trigger_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "autolock_triggers_total",
        "Qualifying auto-lock triggers observed",
        MetricType::Counter,
        site,
        summary.triggers_total,
    );
    write_metric(
        output,
        "autolock_countdowns_started_total",
        "Countdowns armed from idle",
        MetricType::Counter,
        site,
        summary.countdowns_started,
    );
    write_metric(
        output,
        "autolock_countdowns_restarted_total",
        "Countdowns restarted by repeated triggers",
        MetricType::Counter,
        site,
        summary.countdowns_restarted,
    );
    write_metric(
        output,
        "autolock_countdowns_cancelled_total",
        "Countdowns cancelled before expiry",
        MetricType::Counter,
        site,
        summary.countdowns_cancelled,
    );
}

fn write_cycle_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "autolock_lock_cycles_total",
        "Lock cycles started",
        MetricType::Counter,
        site,
        summary.lock_cycles_total,
    );
    write_metric(
        output,
        "autolock_lock_attempts_total",
        "Individual lock attempts",
        MetricType::Counter,
        site,
        summary.lock_attempts_total,
    );
    write_metric(
        output,
        "autolock_lock_call_failures_total",
        "Lock attempts that failed sending the command",
        MetricType::Counter,
        site,
        summary.lock_call_failures,
    );
    write_metric(
        output,
        "autolock_verification_failures_total",
        "Lock attempts where the device never reported locked",
        MetricType::Counter,
        site,
        summary.verification_failures,
    );
    write_metric(
        output,
        "autolock_locks_verified_total",
        "Lock cycles that ended with a verified lock",
        MetricType::Counter,
        site,
        summary.locks_verified_total,
    );
    write_metric(
        output,
        "autolock_retries_exhausted_total",
        "Lock cycles that exhausted their retry budget",
        MetricType::Counter,
        site,
        summary.retries_exhausted_total,
    );
    write_metric(
        output,
        "autolock_notifications_sent_total",
        "Failure notifications delivered on at least one channel",
        MetricType::Counter,
        site,
        summary.notifications_sent,
    );
    write_metric(
        output,
        "autolock_notifications_failed_total",
        "Failure notifications that failed on every channel",
        MetricType::Counter,
        site,
        summary.notifications_failed,
    );

    write_histogram(
        output,
        "autolock_cycle_duration_ms",
        "Lock cycle duration in milliseconds",
        site,
        &summary.cycle_duration_buckets,
        &METRICS_CYCLE_MS_BOUNDS,
        summary.cycle_duration_avg_ms,
    );
}

fn write_channel_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "autolock_mqtt_events_received_total",
        "MQTT events received (before try_send)",
        MetricType::Counter,
        site,
        summary.mqtt_events_received,
    );
    write_metric(
        output,
        "autolock_mqtt_events_dropped_total",
        "MQTT events dropped due to channel full",
        MetricType::Counter,
        site,
        summary.mqtt_events_dropped,
    );
    write_metric(
        output,
        "autolock_commands_received_total",
        "Service commands received over MQTT or HTTP",
        MetricType::Counter,
        site,
        summary.commands_received,
    );
}

fn write_phase_gauges(output: &mut String, site: &str, registry: &DoorRegistry) {
    let _ = writeln!(
        output,
        "# HELP autolock_door_phase Door phase (0=idle, 1=counting_down, 2=locking, 3=verifying, 4=failed)"
    );
    let _ = writeln!(output, "# TYPE autolock_door_phase gauge");
    for (door_id, phase) in registry.phases() {
        let _ = writeln!(
            output,
            "autolock_door_phase{{site=\"{site}\",door=\"{door_id}\"}} {}",
            phase_gauge_value(phase)
        );
    }
}

/// Split "/doors/{id}/{action}" into (id, action)
fn parse_door_action(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/doors/")?;
    let (door_id, action) = rest.split_once('/')?;
    if door_id.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((door_id, action))
}

/// Extract the minutes value from a query string like "minutes=30"
fn parse_snooze_minutes(query: Option<&str>) -> u32 {
    query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("minutes="))
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(DEFAULT_SNOOZE_MINUTES)
}

/// Map an action path segment to a door command
fn action_to_command(action: &str, query: Option<&str>) -> Option<DoorCommand> {
    match action {
        "lock" => Some(DoorCommand::LockNow),
        "snooze" => Some(DoorCommand::Snooze { minutes: parse_snooze_minutes(query) }),
        "enable" => Some(DoorCommand::Enable),
        "disable" => Some(DoorCommand::Disable),
        _ => None,
    }
}

fn json_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    registry: Arc<DoorRegistry>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &registry, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        (&Method::POST, path) => {
            let Some((door_id, action)) = parse_door_action(path) else {
                return Ok(json_response(StatusCode::NOT_FOUND, r#"{"ok":false,"error":"not_found"}"#));
            };
            let Some(command) = action_to_command(action, req.uri().query()) else {
                return Ok(json_response(
                    StatusCode::NOT_FOUND,
                    r#"{"ok":false,"error":"unknown_action"}"#,
                ));
            };
            let Some(handle) = registry.get(door_id) else {
                return Ok(json_response(
                    StatusCode::NOT_FOUND,
                    r#"{"ok":false,"error":"unknown_door"}"#,
                ));
            };

            metrics.record_command_received();
            match handle.tx.try_send(DoorEvent::Command(command.clone())) {
                Ok(()) => {
                    info!(door = %door_id, action = %action, "http_command_accepted");
                    Ok(json_response(StatusCode::OK, r#"{"ok":true}"#))
                }
                Err(TrySendError::Full(_)) => {
                    warn!(door = %door_id, action = %action, "http_command_dropped: channel full");
                    Ok(json_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        r#"{"ok":false,"error":"busy"}"#,
                    ))
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(door = %door_id, "http_command_dropped: channel closed");
                    Ok(json_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        r#"{"ok":false,"error":"door_stopped"}"#,
                    ))
                }
            }
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the HTTP server for metrics and service commands
pub async fn start_http_server(
    port: u16,
    metrics: Arc<Metrics>,
    registry: Arc<DoorRegistry>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let registry = registry.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let registry = registry.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, registry, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
