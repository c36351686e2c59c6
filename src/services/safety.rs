//! Safety checks around lock actuation
//!
//! A lock attempt only goes out when the door is known closed and the
//! lock known unlocked; unknown readings fail safe. After the command
//! is sent the device must report locked within the verification
//! window or the attempt counts as failed.

use crate::domain::types::{DoorPosition, LockState, Phase};
use crate::infra::config::DoorConfig;
use crate::io::lock::{DeviceStates, LockCommand};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// How often the device state is polled during verification
const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long the device has to report locked after the settle delay
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a single lock attempt failed
#[derive(Debug, Error)]
pub enum LockError {
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),
    #[error("lock command failed: {0}")]
    CallFailed(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

/// Outcome of the pre-lock check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The device already reports locked; nothing to do
    AlreadyLocked,
}

/// Validates preconditions and runs verified lock attempts
pub struct SafetyValidator {
    states: Arc<DeviceStates>,
    lock: Arc<dyn LockCommand>,
}

impl SafetyValidator {
    pub fn new(states: Arc<DeviceStates>, lock: Arc<dyn LockCommand>) -> Self {
        Self { states, lock }
    }

    /// Check whether a lock attempt may go out right now
    ///
    /// Doors without a contact sensor skip the position check; the
    /// lock state check always applies.
    pub fn can_lock(&self, door: &DoorConfig) -> Result<Readiness, LockError> {
        let snapshot = self.states.snapshot(&door.id);

        if snapshot.lock == LockState::Locked {
            return Ok(Readiness::AlreadyLocked);
        }

        if door.sensor_topic.is_some() {
            match snapshot.door {
                DoorPosition::Closed => {}
                DoorPosition::Open => {
                    return Err(LockError::PreconditionNotMet(format!(
                        "door {} is open",
                        door.id
                    )))
                }
                DoorPosition::Unknown => {
                    return Err(LockError::PreconditionNotMet(format!(
                        "door {} position unknown",
                        door.id
                    )))
                }
            }
        }

        match snapshot.lock {
            LockState::Unlocked => Ok(Readiness::Ready),
            LockState::Jammed => {
                Err(LockError::PreconditionNotMet(format!("lock {} is jammed", door.id)))
            }
            LockState::Unknown => {
                Err(LockError::PreconditionNotMet(format!("lock {} state unknown", door.id)))
            }
            // Handled above
            LockState::Locked => Ok(Readiness::AlreadyLocked),
        }
    }

    /// Poll the device state until it reports locked or the window ends
    async fn verify_lock_state(&self, door: &DoorConfig) -> Result<(), LockError> {
        let deadline = Instant::now() + VERIFY_TIMEOUT;

        loop {
            let state = self.states.snapshot(&door.id).lock;
            if state == LockState::Locked {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LockError::VerificationFailed(format!(
                    "lock {} still {} after {}s",
                    door.id,
                    state.as_str(),
                    VERIFY_TIMEOUT.as_secs()
                )));
            }
            debug!(door = %door.id, state = %state.as_str(), "verify_poll");
            sleep(VERIFY_POLL_INTERVAL).await;
        }
    }

    /// One full attempt: precondition check, command, settle, verify
    ///
    /// Publishes Locking and Verifying through the phase channel as the
    /// attempt progresses so observers see the live phase mid-cycle.
    pub async fn lock_with_verification(
        &self,
        door: &DoorConfig,
        phase_tx: &watch::Sender<Phase>,
    ) -> Result<(), LockError> {
        match self.can_lock(door)? {
            Readiness::AlreadyLocked => {
                info!(door = %door.id, "lock_already_locked");
                return Ok(());
            }
            Readiness::Ready => {}
        }

        phase_tx.send_replace(Phase::Locking);
        self.lock
            .send_lock_command(door)
            .await
            .map_err(|e| LockError::CallFailed(e.to_string()))?;

        phase_tx.send_replace(Phase::Verifying);
        // Give the device time to move the bolt before polling
        sleep(door.verification_delay).await;
        self.verify_lock_state(door).await?;

        info!(door = %door.id, "lock_verified");
        Ok(())
    }
}
