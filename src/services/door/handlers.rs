//! Event handling for the door state machine
//!
//! These run between lock cycles; they mutate state and decide whether
//! a lock cycle should start, but never await.

use super::{Action, DoorController};
use crate::domain::schedule::effective_delay;
use crate::domain::types::{DoorCommand, DoorEvent, DoorPosition, LockState, Phase};
use crate::services::safety::Readiness;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Snooze windows operators may request, in minutes
const ALLOWED_SNOOZE_MINUTES: [u32; 3] = [15, 30, 60];

impl DoorController {
    /// Process one event, returning what the run loop should do next
    pub(super) fn handle_event(&mut self, event: DoorEvent) -> Action {
        match event {
            DoorEvent::SensorChanged(DoorPosition::Closed) => self.handle_trigger(),
            DoorEvent::SensorChanged(position) => {
                // Door opened (or reading lost) - nothing to lock anymore
                if self.state.countdown_deadline.is_some() {
                    info!(door = %self.config.id, position = %position.as_str(), "countdown_cancelled: door not closed");
                    self.cancel_countdown();
                }
                Action::None
            }
            DoorEvent::LockChanged(LockState::Locked) => {
                if self.state.countdown_deadline.is_some() {
                    info!(door = %self.config.id, "countdown_cancelled: locked externally");
                    self.cancel_countdown();
                } else if *self.phase_tx.borrow() == Phase::Failed {
                    // The device recovered on its own; clear the failure
                    info!(door = %self.config.id, "failure_cleared: locked externally");
                    self.state.last_error = None;
                    self.phase_tx.send_replace(Phase::Idle);
                }
                Action::None
            }
            DoorEvent::LockChanged(LockState::Unlocked) => {
                // Without a contact sensor the unlock itself is the trigger
                if self.config.sensor_topic.is_none() {
                    self.handle_trigger()
                } else {
                    Action::None
                }
            }
            DoorEvent::LockChanged(state) => {
                debug!(door = %self.config.id, state = %state.as_str(), "lock_state_observed");
                Action::None
            }
            DoorEvent::Command(command) => self.handle_command(command),
        }
    }

    fn handle_command(&mut self, command: DoorCommand) -> Action {
        match command {
            DoorCommand::LockNow => {
                // Manual lock bypasses enable/snooze and any countdown
                info!(door = %self.config.id, "lock_now_requested");
                Action::StartCycle { manual: true }
            }
            DoorCommand::Snooze { minutes } => {
                if self.apply_snooze(minutes) && self.state.countdown_deadline.is_some() {
                    info!(door = %self.config.id, minutes = %minutes, "countdown_cancelled: snoozed");
                    self.cancel_countdown();
                }
                Action::None
            }
            DoorCommand::Enable => {
                info!(door = %self.config.id, "door_enabled");
                self.state.enabled = true;
                Action::None
            }
            DoorCommand::Disable => {
                info!(door = %self.config.id, "door_disabled");
                self.state.enabled = false;
                if self.state.countdown_deadline.is_some() {
                    self.cancel_countdown();
                } else if *self.phase_tx.borrow() == Phase::Failed {
                    self.state.last_error = None;
                    self.phase_tx.send_replace(Phase::Idle);
                }
                Action::None
            }
        }
    }

    /// A qualifying trigger: arm or restart the countdown if the door
    /// is eligible and the preconditions hold
    fn handle_trigger(&mut self) -> Action {
        self.metrics.record_trigger();

        if !self.state.enabled {
            debug!(door = %self.config.id, "trigger_ignored: disabled");
            return Action::None;
        }
        if self.state.is_snoozed(Instant::now()) {
            debug!(door = %self.config.id, "trigger_ignored: snoozed");
            return Action::None;
        }

        match self.safety.can_lock(&self.config) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::AlreadyLocked) => {
                if self.state.countdown_deadline.is_some() {
                    info!(door = %self.config.id, "countdown_cancelled: already locked");
                    self.cancel_countdown();
                }
                return Action::None;
            }
            Err(e) => {
                debug!(door = %self.config.id, reason = %e, "trigger_ignored");
                return Action::None;
            }
        }

        let delay = effective_delay(
            chrono::Local::now().time(),
            self.config.day_delay,
            self.config.night_delay,
            &self.config.schedule,
        );

        let restarted = self.state.countdown_deadline.is_some();
        self.state.countdown_deadline = Some(Instant::now() + delay);
        self.phase_tx.send_replace(Phase::CountingDown);
        if restarted {
            self.metrics.record_countdown_restarted();
            info!(door = %self.config.id, delay_secs = %delay.as_secs(), "countdown_restarted");
        } else {
            self.metrics.record_countdown_started();
            info!(door = %self.config.id, delay_secs = %delay.as_secs(), "countdown_started");
        }
        Action::None
    }

    /// Validate and apply a snooze window; returns whether it applied
    pub(super) fn apply_snooze(&mut self, minutes: u32) -> bool {
        if !ALLOWED_SNOOZE_MINUTES.contains(&minutes) {
            warn!(
                door = %self.config.id,
                minutes = %minutes,
                allowed = ?ALLOWED_SNOOZE_MINUTES,
                "snooze_rejected"
            );
            return false;
        }
        self.state.snoozed_until =
            Some(Instant::now() + std::time::Duration::from_secs(u64::from(minutes) * 60));
        info!(door = %self.config.id, minutes = %minutes, "door_snoozed");
        true
    }

    pub(super) fn cancel_countdown(&mut self) {
        self.state.countdown_deadline = None;
        self.metrics.record_countdown_cancelled();
        self.phase_tx.send_replace(Phase::Idle);
    }
}
