//! Door state machine tests under a paused clock
//!
//! Each harness runs a real controller task against a fake lock device
//! and a recording notifier. Test doors use equal day and night delays
//! so the wall-clock schedule cannot change the expected countdown.

use super::*;
use crate::domain::schedule::ScheduleConfig;
use crate::domain::types::{DoorId, DoorPosition, LockState};
use crate::infra::config::LockMode;
use crate::io::lock::{DeviceStates, LockCommand};
use crate::services::safety::SafetyValidator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;

const DELAY: Duration = Duration::from_secs(120);

/// How the fake device responds to lock commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockPlan {
    /// Command succeeds and the device reports locked
    Succeed,
    /// Command itself errors
    FailCall,
    /// Command succeeds but the device never reports locked
    StayUnlocked,
}

struct FakeLock {
    states: Arc<DeviceStates>,
    plan: LockPlan,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl LockCommand for FakeLock {
    async fn send_lock_command(&self, door: &DoorConfig) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.plan {
            LockPlan::Succeed => {
                self.states.update_lock(&door.id, LockState::Locked);
                Ok(())
            }
            LockPlan::FailCall => anyhow::bail!("connection refused"),
            LockPlan::StayUnlocked => Ok(()),
        }
    }
}

struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

#[async_trait]
impl Notify for RecordingNotifier {
    async fn send_notification(&self, notification: &Notification) -> bool {
        self.notifications.lock().push(notification.clone());
        true
    }
}

fn test_door(sensor: bool, retry_count: u32) -> DoorConfig {
    DoorConfig {
        id: DoorId::from("front_door"),
        name: "Front Door".to_string(),
        mode: LockMode::Mqtt,
        lock_state_topic: "home/front_door/lock/state".to_string(),
        lock_command_topic: Some("home/front_door/lock/set".to_string()),
        lock_url: None,
        lock_timeout: Duration::from_secs(2),
        sensor_topic: sensor.then(|| "home/front_door/contact".to_string()),
        command_topic: "autolock/front_door/set".to_string(),
        day_delay: DELAY,
        night_delay: DELAY,
        schedule: ScheduleConfig::from_strs("22:00", "06:00").unwrap(),
        retry_count,
        retry_delay: Duration::from_secs(5),
        exponential_backoff: false,
        verification_delay: Duration::from_secs(5),
        enable_on_creation: true,
    }
}

struct Harness {
    tx: mpsc::Sender<DoorEvent>,
    phase: watch::Receiver<Phase>,
    states: Arc<DeviceStates>,
    lock_calls: Arc<AtomicU32>,
    notifications: Arc<Mutex<Vec<Notification>>>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    fn spawn(config: DoorConfig, plan: LockPlan) -> Self {
        let states = Arc::new(DeviceStates::new());
        let lock_calls = Arc::new(AtomicU32::new(0));
        let lock = Arc::new(FakeLock {
            states: states.clone(),
            plan,
            calls: lock_calls.clone(),
        });
        let safety = Arc::new(SafetyValidator::new(states.clone(), lock));

        let notifications = Arc::new(Mutex::new(Vec::new()));
        let notifier = Arc::new(RecordingNotifier { notifications: notifications.clone() });

        let metrics = Arc::new(Metrics::new());
        let (controller, phase) = DoorController::new(config, safety, notifier, metrics);

        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(rx, shutdown_rx));

        Self { tx, phase, states, lock_calls, notifications, _shutdown_tx: shutdown_tx }
    }

    /// Spawn with the door already closed and unlocked
    fn spawn_ready(config: DoorConfig, plan: LockPlan) -> Self {
        let harness = Self::spawn(config, plan);
        let id = DoorId::from("front_door");
        harness.states.update_lock(&id, LockState::Unlocked);
        harness.states.update_sensor(&id, DoorPosition::Closed);
        harness
    }

    async fn send(&self, event: DoorEvent) {
        self.tx.send(event).await.unwrap();
        // Let the controller task process under the paused clock
        sleep(Duration::from_millis(10)).await;
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn calls(&self) -> u32 {
        self.lock_calls.load(Ordering::SeqCst)
    }
}

#[tokio::test(start_paused = true)]
async fn test_trigger_arms_countdown_and_locks() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);
    assert_eq!(h.calls(), 0);

    // Countdown plus verification settle
    sleep(DELAY + Duration::from_secs(10)).await;
    assert_eq!(h.calls(), 1);
    assert_eq!(h.phase(), Phase::Idle);
    assert!(h.notifications.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_triggers_restart_countdown() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    sleep(Duration::from_secs(60)).await;
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;

    // Past the first deadline, before the restarted one
    sleep(Duration::from_secs(70)).await;
    assert_eq!(h.phase(), Phase::CountingDown);
    assert_eq!(h.calls(), 0);

    // Now past the restarted deadline
    sleep(Duration::from_secs(60)).await;
    assert_eq!(h.calls(), 1);
    assert_eq!(h.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_external_lock_cancels_countdown() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);

    h.states.update_lock(&DoorId::from("front_door"), LockState::Locked);
    h.send(DoorEvent::LockChanged(LockState::Locked)).await;
    assert_eq!(h.phase(), Phase::Idle);

    sleep(DELAY + Duration::from_secs(10)).await;
    assert_eq!(h.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_door_opening_cancels_countdown() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);

    h.states.update_sensor(&DoorId::from("front_door"), DoorPosition::Open);
    h.send(DoorEvent::SensorChanged(DoorPosition::Open)).await;
    assert_eq!(h.phase(), Phase::Idle);

    sleep(DELAY + Duration::from_secs(10)).await;
    assert_eq!(h.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_ignored_when_lock_state_unknown() {
    let h = Harness::spawn(test_door(true, 3), LockPlan::Succeed);
    h.states.update_sensor(&DoorId::from("front_door"), DoorPosition::Closed);
    // Lock state never observed

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::Idle);
    sleep(DELAY + Duration::from_secs(10)).await;
    assert_eq!(h.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_ignored_while_disabled() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::Command(DoorCommand::Disable)).await;
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::Idle);

    // Enable alone does not arm anything; the next trigger does
    h.send(DoorEvent::Command(DoorCommand::Enable)).await;
    assert_eq!(h.phase(), Phase::Idle);
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);
}

#[tokio::test(start_paused = true)]
async fn test_snooze_cancels_countdown_and_expires() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);

    h.send(DoorEvent::Command(DoorCommand::Snooze { minutes: 15 })).await;
    assert_eq!(h.phase(), Phase::Idle);

    // Triggers during the snooze window are ignored
    sleep(Duration::from_secs(5 * 60)).await;
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::Idle);

    // After expiry triggers qualify again
    sleep(Duration::from_secs(11 * 60)).await;
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_snooze_rejected() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    h.send(DoorEvent::Command(DoorCommand::Snooze { minutes: 7 })).await;
    // Countdown keeps running
    assert_eq!(h.phase(), Phase::CountingDown);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_notifies_once() {
    let h = Harness::spawn_ready(test_door(true, 2), LockPlan::FailCall);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    // 3 attempts with 5s fixed backoff between them
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.calls(), 3);
    assert_eq!(h.phase(), Phase::Failed);

    let notifications = h.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].message.contains("failed after 3 attempt(s)"));
    assert!(notifications[0].message.contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn test_manual_failure_uses_manual_notification() {
    let h = Harness::spawn_ready(test_door(true, 0), LockPlan::FailCall);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    sleep(Duration::from_secs(10)).await;

    let notifications = h.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].persistent_id, "autolock_front_door_manual_failure");
}

#[tokio::test(start_paused = true)]
async fn test_countdown_failure_uses_autolock_notification() {
    let h = Harness::spawn_ready(test_door(true, 0), LockPlan::FailCall);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    sleep(DELAY + Duration::from_secs(10)).await;

    assert_eq!(h.phase(), Phase::Failed);
    let notifications = h.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].persistent_id, "autolock_front_door_failure");
    assert_eq!(notifications[0].title, "AutoLock Failed: Front Door");
}

#[tokio::test(start_paused = true)]
async fn test_verification_timeout_counts_as_failed_attempt() {
    let h = Harness::spawn_ready(test_door(true, 1), LockPlan::StayUnlocked);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    // Each attempt: 5s settle + 5s verify window, plus 5s backoff
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.calls(), 2);
    assert_eq!(h.phase(), Phase::Failed);
    let notifications = h.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].message.contains("still unlocked"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_door_rearms_on_next_trigger() {
    let h = Harness::spawn_ready(test_door(true, 0), LockPlan::FailCall);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    sleep(DELAY + Duration::from_secs(10)).await;
    assert_eq!(h.phase(), Phase::Failed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);
}

#[tokio::test(start_paused = true)]
async fn test_external_lock_clears_failed() {
    let h = Harness::spawn_ready(test_door(true, 0), LockPlan::FailCall);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.phase(), Phase::Failed);

    h.states.update_lock(&DoorId::from("front_door"), LockState::Locked);
    h.send(DoorEvent::LockChanged(LockState::Locked)).await;
    assert_eq!(h.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disable_aborts_in_flight_cycle() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::StayUnlocked);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    // Into the settle window of the first attempt
    sleep(Duration::from_secs(2)).await;

    h.send(DoorEvent::Command(DoorCommand::Disable)).await;
    assert_eq!(h.phase(), Phase::Idle);

    // No further attempts and no notification
    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.calls(), 1);
    assert!(h.notifications.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_snooze_aborts_in_flight_cycle() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::StayUnlocked);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    sleep(Duration::from_secs(2)).await;

    h.send(DoorEvent::Command(DoorCommand::Snooze { minutes: 30 })).await;
    assert_eq!(h.phase(), Phase::Idle);
    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.calls(), 1);
    assert!(h.notifications.lock().is_empty());

    // Snoozed window also blocks new triggers
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_snooze_during_cycle_is_dropped() {
    let h = Harness::spawn_ready(test_door(true, 1), LockPlan::FailCall);

    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    sleep(Duration::from_secs(2)).await;

    // Disallowed duration: rejected in place, the cycle keeps running
    h.send(DoorEvent::Command(DoorCommand::Snooze { minutes: 7 })).await;
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.calls(), 2);
    assert_eq!(h.phase(), Phase::Failed);
    assert_eq!(h.notifications.lock().len(), 1);

    // The door never entered a snooze window
    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);
}

#[tokio::test(start_paused = true)]
async fn test_lock_now_bypasses_snooze() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::Command(DoorCommand::Snooze { minutes: 60 })).await;
    h.send(DoorEvent::Command(DoorCommand::LockNow)).await;
    sleep(Duration::from_secs(15)).await;

    assert_eq!(h.calls(), 1);
    assert_eq!(h.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_sensorless_door_triggers_on_unlock() {
    let h = Harness::spawn(test_door(false, 3), LockPlan::Succeed);
    h.states.update_lock(&DoorId::from("front_door"), LockState::Unlocked);

    h.send(DoorEvent::LockChanged(LockState::Unlocked)).await;
    assert_eq!(h.phase(), Phase::CountingDown);

    sleep(DELAY + Duration::from_secs(10)).await;
    assert_eq!(h.calls(), 1);
    assert_eq!(h.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_skips_when_preconditions_drift() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);

    // Lock reading drifts to unknown without any event arriving
    sleep(DELAY - Duration::from_secs(1)).await;
    h.states.update_lock(&DoorId::from("front_door"), LockState::Unknown);
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.calls(), 0);
    assert_eq!(h.phase(), Phase::Idle);
    assert!(h.notifications.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expiry_skips_when_already_locked() {
    let h = Harness::spawn_ready(test_door(true, 3), LockPlan::Succeed);

    h.send(DoorEvent::SensorChanged(DoorPosition::Closed)).await;
    assert_eq!(h.phase(), Phase::CountingDown);

    // Someone locks the door manually right before the deadline, but
    // the cancel event never arrives (sensor-only install)
    sleep(DELAY - Duration::from_secs(1)).await;
    h.states.update_lock(&DoorId::from("front_door"), LockState::Locked);
    sleep(Duration::from_secs(10)).await;

    // Expiry saw the lock already engaged; no command went out
    assert_eq!(h.calls(), 0);
    assert_eq!(h.phase(), Phase::Idle);
    assert!(h.notifications.lock().is_empty());
}
