//! Domain models - core types for the auto-lock state machine
//!
//! This module contains the canonical data types used throughout the system:
//! - `DoorId` - stable identifier of a monitored door
//! - `LockState` / `DoorPosition` - observed device states
//! - `Phase` - the per-door state machine phase
//! - `DoorEvent` / `DoorCommand` - inbound event model for a door task
//! - `ScheduleConfig` - day/night schedule with midnight wraparound

pub mod schedule;
pub mod types;
