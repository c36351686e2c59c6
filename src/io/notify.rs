//! Failure notifications over MQTT and an optional webhook
//!
//! Delivery is best-effort on each channel; the caller only learns
//! whether at least one channel accepted the notification. Notification
//! failures never propagate into the lock state machine.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// A persistent notification about a door that could not be secured
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// Stable id so repeated failures replace rather than stack
    pub persistent_id: String,
    pub severity: &'static str,
}

impl Notification {
    /// Auto-lock cycle exhausted its retries
    pub fn autolock_failure(door_id: &str, door_name: &str, detail: &str) -> Self {
        Self {
            title: format!("AutoLock Failed: {door_name}"),
            message: format!("Failed to lock {door_name}: {detail}"),
            persistent_id: format!("autolock_{door_id}_failure"),
            severity: "error",
        }
    }

    /// An operator-requested lock_now cycle exhausted its retries
    pub fn manual_failure(door_id: &str, door_name: &str, detail: &str) -> Self {
        Self {
            title: format!("Manual Lock Failed: {door_name}"),
            message: format!("Failed to lock {door_name} on request: {detail}"),
            persistent_id: format!("autolock_{door_id}_manual_failure"),
            severity: "error",
        }
    }
}

/// Notification delivery seam, faked in state machine tests
#[async_trait]
pub trait Notify: Send + Sync {
    /// Returns true when at least one channel accepted the notification
    async fn send_notification(&self, notification: &Notification) -> bool;
}

/// Publishes to the notify topic and, when configured, a webhook
pub struct NotificationService {
    mqtt: AsyncClient,
    topic: String,
    webhook_url: Option<String>,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl NotificationService {
    pub fn new(
        mqtt: AsyncClient,
        topic: String,
        webhook_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        let http_client =
            reqwest::Client::builder().http1_only().build().unwrap_or_else(|_| reqwest::Client::new());
        Self { mqtt, topic, webhook_url, http_client, timeout }
    }

    async fn send_mqtt(&self, payload: &str) -> bool {
        match self.mqtt.publish(&self.topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "notify_mqtt_failed");
                false
            }
        }
    }

    async fn send_webhook(&self, url: &str, payload: &str) -> bool {
        let result = self
            .http_client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .body(payload.to_string())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status().as_u16(), "notify_webhook_rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "notify_webhook_failed");
                false
            }
        }
    }
}

#[async_trait]
impl Notify for NotificationService {
    async fn send_notification(&self, notification: &Notification) -> bool {
        let payload = match serde_json::to_string(notification) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "notify_serialize_failed");
                return false;
            }
        };

        let mqtt_ok = self.send_mqtt(&payload).await;
        let webhook_ok = match self.webhook_url.as_deref() {
            Some(url) => self.send_webhook(url, &payload).await,
            None => false,
        };

        let delivered = mqtt_ok || webhook_ok;
        if delivered {
            info!(
                persistent_id = %notification.persistent_id,
                mqtt = %mqtt_ok,
                webhook = %webhook_ok,
                "notification_sent"
            );
        } else {
            warn!(persistent_id = %notification.persistent_id, "notification_undelivered");
        }
        delivered
    }
}
