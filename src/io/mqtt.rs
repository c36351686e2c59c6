//! MQTT ingest: device state topics and door command topics
//!
//! Events are sent via try_send to avoid blocking the MQTT eventloop.
//! Dropped events are counted in metrics and logged (rate-limited).

use crate::domain::types::{DoorCommand, DoorEvent, DoorId, DoorPosition, LockState};
use crate::infra::config::{Config, DoorConfig};
use crate::infra::metrics::Metrics;
use crate::io::lock::DeviceStates;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What a subscribed topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    LockState,
    Sensor,
    Command,
}

/// Routing entry: which door a topic belongs to and where events go
#[derive(Clone)]
pub struct TopicRoute {
    pub door_id: DoorId,
    pub kind: TopicKind,
    pub tx: mpsc::Sender<DoorEvent>,
}

/// Build the topic -> route table for all configured doors
pub fn build_topic_router(
    doors: &[DoorConfig],
    senders: &FxHashMap<DoorId, mpsc::Sender<DoorEvent>>,
) -> FxHashMap<String, TopicRoute> {
    let mut router = FxHashMap::default();
    for door in doors {
        let Some(tx) = senders.get(&door.id) else { continue };

        router.insert(
            door.lock_state_topic.clone(),
            TopicRoute { door_id: door.id.clone(), kind: TopicKind::LockState, tx: tx.clone() },
        );
        if let Some(sensor_topic) = &door.sensor_topic {
            router.insert(
                sensor_topic.clone(),
                TopicRoute { door_id: door.id.clone(), kind: TopicKind::Sensor, tx: tx.clone() },
            );
        }
        router.insert(
            door.command_topic.clone(),
            TopicRoute { door_id: door.id.clone(), kind: TopicKind::Command, tx: tx.clone() },
        );
    }
    router
}

/// Parse a topic payload into a door event according to the topic kind
///
/// Unknown state payloads map to the Unknown variants; malformed
/// command JSON yields None.
pub fn parse_topic_payload(kind: TopicKind, payload: &str) -> Option<DoorEvent> {
    match kind {
        TopicKind::LockState => {
            let state: LockState = payload.trim().parse().ok()?;
            Some(DoorEvent::LockChanged(state))
        }
        TopicKind::Sensor => {
            let position: DoorPosition = payload.trim().parse().ok()?;
            Some(DoorEvent::SensorChanged(position))
        }
        TopicKind::Command => {
            let command: DoorCommand = serde_json::from_str(payload).ok()?;
            Some(DoorEvent::Command(command))
        }
    }
}

/// Run the MQTT ingest loop until shutdown
///
/// Subscribes every routed topic, keeps the device-state cache current,
/// and forwards events to the owning door task.
pub async fn start_mqtt_ingest(
    config: &Config,
    client: AsyncClient,
    mut eventloop: EventLoop,
    router: FxHashMap<String, TopicRoute>,
    states: Arc<DeviceStates>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for (topic, route) in &router {
        let qos = match route.kind {
            // State topics are retained snapshots; commands must arrive
            TopicKind::LockState | TopicKind::Sensor => QoS::AtMostOnce,
            TopicKind::Command => QoS::AtLeastOnce,
        };
        client.subscribe(topic, qos).await?;
    }

    info!(
        topics = %router.len(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(route) = router.get(&publish.topic) else {
                            debug!(topic = %publish.topic, "mqtt_unrouted_topic");
                            continue;
                        };

                        let payload = match std::str::from_utf8(&publish.payload) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "mqtt_payload_not_utf8");
                                continue;
                            }
                        };

                        metrics.record_mqtt_event();
                        let Some(event) = parse_topic_payload(route.kind, payload) else {
                            warn!(
                                topic = %publish.topic,
                                door = %route.door_id,
                                payload = %payload,
                                "mqtt_payload_unparseable"
                            );
                            continue;
                        };

                        // Keep the shared cache current before handing the
                        // event to the door task.
                        match &event {
                            DoorEvent::LockChanged(state) => {
                                states.update_lock(&route.door_id, *state);
                            }
                            DoorEvent::SensorChanged(position) => {
                                states.update_sensor(&route.door_id, *position);
                            }
                            DoorEvent::Command(_) => {
                                metrics.record_command_received();
                            }
                        }

                        if let Err(e) = route.tx.try_send(event) {
                            match e {
                                TrySendError::Full(_) => {
                                    metrics.record_mqtt_event_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!(door = %route.door_id, "mqtt_event_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                TrySendError::Closed(_) => {
                                    warn!(door = %route.door_id, "door channel closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schedule::ScheduleConfig;
    use crate::infra::config::LockMode;

    fn door(id: &str, sensor: Option<&str>) -> DoorConfig {
        DoorConfig {
            id: DoorId::from(id),
            name: id.to_string(),
            mode: LockMode::Mqtt,
            lock_state_topic: format!("home/{id}/lock/state"),
            lock_command_topic: Some(format!("home/{id}/lock/set")),
            lock_url: None,
            lock_timeout: Duration::from_secs(2),
            sensor_topic: sensor.map(String::from),
            command_topic: format!("autolock/{id}/set"),
            day_delay: Duration::from_secs(300),
            night_delay: Duration::from_secs(120),
            schedule: ScheduleConfig::from_strs("22:00", "06:00").unwrap(),
            retry_count: 3,
            retry_delay: Duration::from_secs(5),
            exponential_backoff: true,
            verification_delay: Duration::from_secs(5),
            enable_on_creation: true,
        }
    }

    #[test]
    fn test_parse_lock_state_payload() {
        assert_eq!(
            parse_topic_payload(TopicKind::LockState, "locked"),
            Some(DoorEvent::LockChanged(LockState::Locked))
        );
        assert_eq!(
            parse_topic_payload(TopicKind::LockState, " unlocked\n"),
            Some(DoorEvent::LockChanged(LockState::Unlocked))
        );
        // Unrecognized states fail safe as Unknown
        assert_eq!(
            parse_topic_payload(TopicKind::LockState, "ajar"),
            Some(DoorEvent::LockChanged(LockState::Unknown))
        );
    }

    #[test]
    fn test_parse_sensor_payload() {
        assert_eq!(
            parse_topic_payload(TopicKind::Sensor, "closed"),
            Some(DoorEvent::SensorChanged(DoorPosition::Closed))
        );
        assert_eq!(
            parse_topic_payload(TopicKind::Sensor, "open"),
            Some(DoorEvent::SensorChanged(DoorPosition::Open))
        );
    }

    #[test]
    fn test_parse_command_payload() {
        assert_eq!(
            parse_topic_payload(TopicKind::Command, r#"{"action":"lock_now"}"#),
            Some(DoorEvent::Command(DoorCommand::LockNow))
        );
        assert_eq!(
            parse_topic_payload(TopicKind::Command, r#"{"action":"snooze","minutes":15}"#),
            Some(DoorEvent::Command(DoorCommand::Snooze { minutes: 15 }))
        );
        assert_eq!(parse_topic_payload(TopicKind::Command, "not json"), None);
        assert_eq!(parse_topic_payload(TopicKind::Command, r#"{"action":"open"}"#), None);
    }

    #[test]
    fn test_build_topic_router() {
        let doors = vec![door("front", Some("home/front/contact")), door("back", None)];
        let mut senders = FxHashMap::default();
        for d in &doors {
            let (tx, _rx) = mpsc::channel(8);
            senders.insert(d.id.clone(), tx);
        }

        let router = build_topic_router(&doors, &senders);

        // front: state + sensor + command, back: state + command
        assert_eq!(router.len(), 5);
        assert_eq!(router["home/front/lock/state"].kind, TopicKind::LockState);
        assert_eq!(router["home/front/contact"].kind, TopicKind::Sensor);
        assert_eq!(router["autolock/front/set"].kind, TopicKind::Command);
        assert_eq!(router["autolock/back/set"].door_id, DoorId::from("back"));
        assert!(!router.contains_key("home/back/contact"));
    }
}
