//! Per-door auto-lock state machine
//!
//! Each configured door runs as one task owning all mutable state, fed
//! by an mpsc channel of sensor, lock-state, and command events. The
//! current phase is published through a watch channel for the HTTP
//! surface.
//!
//! Phases: Idle -> CountingDown -> Locking -> Verifying -> Idle,
//! with Failed entered when a lock cycle exhausts its retries. A new
//! qualifying trigger re-arms a Failed door.

use crate::domain::types::{DoorCommand, DoorEvent, DoorState, Phase};
use crate::infra::config::DoorConfig;
use crate::infra::metrics::Metrics;
use crate::infra::retry::execute_with_retry;
use crate::io::notify::{Notification, Notify};
use crate::services::safety::{LockError, Readiness, SafetyValidator};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

mod handlers;

#[cfg(test)]
mod tests;

/// What the event handler decided should happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    /// Run a lock cycle now; manual cycles get the manual notification
    StartCycle { manual: bool },
}

/// How a lock cycle ended from the run loop's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleExit {
    /// Completed or aborted; keep running
    Continue,
    /// Shutdown requested or channel closed
    Stop,
}

pub struct DoorController {
    config: DoorConfig,
    state: DoorState,
    phase_tx: Arc<watch::Sender<Phase>>,
    safety: Arc<SafetyValidator>,
    notifier: Arc<dyn Notify>,
    metrics: Arc<Metrics>,
    /// Events deferred while a lock cycle was in flight
    pending: VecDeque<DoorEvent>,
}

impl DoorController {
    pub fn new(
        config: DoorConfig,
        safety: Arc<SafetyValidator>,
        notifier: Arc<dyn Notify>,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<Phase>) {
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let state = DoorState::new(config.enable_on_creation);
        let controller = Self {
            config,
            state,
            phase_tx: Arc::new(phase_tx),
            safety,
            notifier,
            metrics,
            pending: VecDeque::new(),
        };
        (controller, phase_rx)
    }

    /// Run the door task until shutdown or the event channel closes
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<DoorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            door = %self.config.id,
            enabled = %self.state.enabled,
            day_delay_secs = %self.config.day_delay.as_secs(),
            night_delay_secs = %self.config.night_delay.as_secs(),
            "door_task_started"
        );

        loop {
            // Events deferred during a lock cycle come first
            while let Some(event) = self.pending.pop_front() {
                if let Action::StartCycle { manual } = self.handle_event(event) {
                    if self.run_lock_cycle(&mut event_rx, &mut shutdown, manual).await
                        == CycleExit::Stop
                    {
                        return;
                    }
                }
            }

            let deadline = self.state.countdown_deadline;
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(door = %self.config.id, "door_task_shutdown");
                        return;
                    }
                }
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else {
                        warn!(door = %self.config.id, "door_channel_closed");
                        return;
                    };
                    if let Action::StartCycle { manual } = self.handle_event(event) {
                        if self.run_lock_cycle(&mut event_rx, &mut shutdown, manual).await
                            == CycleExit::Stop
                        {
                            return;
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.state.countdown_deadline = None;
                    // Re-check preconditions at expiry: the device state may
                    // have drifted without an event arriving.
                    match self.safety.can_lock(&self.config) {
                        Ok(Readiness::Ready) => {
                            info!(door = %self.config.id, "countdown_expired");
                            if self.run_lock_cycle(&mut event_rx, &mut shutdown, false).await
                                == CycleExit::Stop
                            {
                                return;
                            }
                        }
                        Ok(Readiness::AlreadyLocked) => {
                            info!(door = %self.config.id, "countdown_expired: already locked");
                            self.phase_tx.send_replace(Phase::Idle);
                        }
                        Err(e) => {
                            info!(door = %self.config.id, reason = %e, "countdown_expired: skipped");
                            self.phase_tx.send_replace(Phase::Idle);
                        }
                    }
                }
            }
        }
    }

    /// Drive one retried lock cycle while staying responsive to events
    ///
    /// Disable and a valid snooze abort the cycle; enable applies
    /// immediately; everything else is deferred until the cycle ends.
    async fn run_lock_cycle(
        &mut self,
        event_rx: &mut mpsc::Receiver<DoorEvent>,
        shutdown: &mut watch::Receiver<bool>,
        manual: bool,
    ) -> CycleExit {
        self.state.countdown_deadline = None;
        self.phase_tx.send_replace(Phase::Locking);
        self.metrics.record_lock_cycle_started();
        let started = Instant::now();

        let safety = self.safety.clone();
        let door = self.config.clone();
        let phase_tx = self.phase_tx.clone();
        let metrics = self.metrics.clone();
        let attempt = move || {
            let safety = safety.clone();
            let door = door.clone();
            let phase_tx = phase_tx.clone();
            let metrics = metrics.clone();
            async move {
                metrics.record_lock_attempt();
                safety.lock_with_verification(&door, &phase_tx).await.inspect_err(|e| match e {
                    LockError::CallFailed(_) => metrics.record_lock_call_failure(),
                    LockError::VerificationFailed(_) => metrics.record_verification_failure(),
                    LockError::PreconditionNotMet(_) => {}
                })
            }
        };
        let policy = self.config.retry_policy();
        let cycle = execute_with_retry(attempt, &policy);
        tokio::pin!(cycle);

        let outcome = loop {
            tokio::select! {
                outcome = &mut cycle => break outcome,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(door = %self.config.id, "door_task_shutdown");
                        return CycleExit::Stop;
                    }
                }
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else {
                        warn!(door = %self.config.id, "door_channel_closed");
                        return CycleExit::Stop;
                    };
                    match event {
                        DoorEvent::Command(DoorCommand::Disable) => {
                            info!(door = %self.config.id, "lock_cycle_aborted: disabled");
                            self.state.enabled = false;
                            self.phase_tx.send_replace(Phase::Idle);
                            return CycleExit::Continue;
                        }
                        DoorEvent::Command(DoorCommand::Snooze { minutes }) => {
                            // apply_snooze warns and rejects invalid durations;
                            // consume those here rather than deferring them
                            if self.apply_snooze(minutes) {
                                info!(door = %self.config.id, minutes = %minutes, "lock_cycle_aborted: snoozed");
                                self.phase_tx.send_replace(Phase::Idle);
                                return CycleExit::Continue;
                            }
                        }
                        DoorEvent::Command(DoorCommand::Enable) => {
                            self.state.enabled = true;
                        }
                        other => self.pending.push_back(other),
                    }
                }
            }
        };

        self.metrics.record_cycle_duration(started.elapsed().as_millis() as u64);

        if outcome.succeeded {
            info!(door = %self.config.id, attempts = %outcome.attempts_made, "lock_cycle_succeeded");
            self.metrics.record_lock_verified();
            self.state.last_error = None;
            self.phase_tx.send_replace(Phase::Idle);
            return CycleExit::Continue;
        }

        let detail = outcome.to_string();
        warn!(door = %self.config.id, outcome = %detail, "lock_cycle_failed");
        self.metrics.record_retries_exhausted();
        self.state.last_error = Some(detail.clone());
        self.phase_tx.send_replace(Phase::Failed);

        // Exactly one notification per exhausted cycle
        let notification = if manual {
            Notification::manual_failure(self.config.id.as_str(), &self.config.name, &detail)
        } else {
            Notification::autolock_failure(self.config.id.as_str(), &self.config.name, &detail)
        };
        let delivered = self.notifier.send_notification(&notification).await;
        self.metrics.record_notification(delivered);

        CycleExit::Continue
    }
}
