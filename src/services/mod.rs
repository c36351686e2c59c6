//! Services - safety checks and the per-door state machine

pub mod door;
pub mod safety;
