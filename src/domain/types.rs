//! Shared types for the auto-lock daemon

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Newtype wrapper for door identifiers to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DoorId(pub String);

impl DoorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DoorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DoorId {
    fn from(s: &str) -> Self {
        DoorId(s.to_string())
    }
}

/// Observed lock state as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
    Jammed,
    Unknown,
}

impl LockState {
    pub fn as_str(&self) -> &str {
        match self {
            LockState::Locked => "locked",
            LockState::Unlocked => "unlocked",
            LockState::Jammed => "jammed",
            LockState::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for LockState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "locked" => LockState::Locked,
            "unlocked" => LockState::Unlocked,
            "jammed" => LockState::Jammed,
            _ => LockState::Unknown,
        })
    }
}

/// Observed door position as reported by the contact sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorPosition {
    Closed,
    Open,
    Unknown,
}

impl DoorPosition {
    pub fn as_str(&self) -> &str {
        match self {
            DoorPosition::Closed => "closed",
            DoorPosition::Open => "open",
            DoorPosition::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for DoorPosition {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "closed" => DoorPosition::Closed,
            "open" => DoorPosition::Open,
            _ => DoorPosition::Unknown,
        })
    }
}

/// State machine phase for a single door
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CountingDown,
    Locking,
    Verifying,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Idle => "idle",
            Phase::CountingDown => "counting_down",
            Phase::Locking => "locking",
            Phase::Verifying => "verifying",
            Phase::Failed => "failed",
        }
    }
}

/// Service command addressed to a single door
///
/// Arrives as JSON on the door's command topic or via the HTTP surface,
/// e.g. `{"action":"snooze","minutes":30}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DoorCommand {
    LockNow,
    Snooze { minutes: u32 },
    Enable,
    Disable,
}

/// Inbound event for a door task, processed in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoorEvent {
    SensorChanged(DoorPosition),
    LockChanged(LockState),
    Command(DoorCommand),
}

/// Mutable per-door state, owned exclusively by the door's task
///
/// The current `Phase` is not stored here; the controller publishes it
/// through a watch channel so the HTTP surface can observe it.
#[derive(Debug)]
pub struct DoorState {
    /// Triggers are ignored while false
    pub enabled: bool,
    /// Triggers are ignored while now < snoozed_until
    pub snoozed_until: Option<Instant>,
    /// Countdown deadline, set only while counting down
    pub countdown_deadline: Option<Instant>,
    /// Last failure description, set on entry to Failed
    pub last_error: Option<String>,
}

impl DoorState {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, snoozed_until: None, countdown_deadline: None, last_error: None }
    }

    /// Whether a snooze window is currently active
    pub fn is_snoozed(&self, now: Instant) -> bool {
        self.snoozed_until.is_some_and(|until| now < until)
    }
}
