//! Day/night schedule math
//!
//! Pure functions deciding which countdown delay applies at a given
//! time of day. The night window may wrap past midnight (22:00-06:00).

use anyhow::Context;
use chrono::NaiveTime;
use std::time::Duration;

/// Time format accepted in configuration files
const TIME_FORMAT: &str = "%H:%M";

/// Day/night schedule boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Start of the night window (inclusive)
    pub night_start: NaiveTime,
    /// End of the night window (exclusive), i.e. start of day
    pub day_start: NaiveTime,
}

impl ScheduleConfig {
    /// Parse a schedule from "HH:MM" strings
    pub fn from_strs(night_start: &str, day_start: &str) -> anyhow::Result<Self> {
        Ok(Self {
            night_start: parse_time_str(night_start)?,
            day_start: parse_time_str(day_start)?,
        })
    }
}

/// Parse a time-of-day string in HH:MM format
pub fn parse_time_str(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .with_context(|| format!("Invalid time format: {s}. Expected HH:MM"))
}

/// Whether `now` falls inside the night window `[night_start, day_start)`
///
/// The window is circular over the 24-hour clock: when night_start is
/// later than day_start it spans midnight. `night_start == day_start`
/// degenerates to an empty window (always day).
pub fn is_night(now: NaiveTime, schedule: &ScheduleConfig) -> bool {
    if schedule.night_start <= schedule.day_start {
        now >= schedule.night_start && now < schedule.day_start
    } else {
        now >= schedule.night_start || now < schedule.day_start
    }
}

/// Select the countdown delay for the current time of day
pub fn effective_delay(
    now: NaiveTime,
    day_delay: Duration,
    night_delay: Duration,
    schedule: &ScheduleConfig,
) -> Duration {
    if is_night(now, schedule) {
        night_delay
    } else {
        day_delay
    }
}
