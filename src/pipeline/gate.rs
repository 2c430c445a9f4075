use std::{collections::HashSet, fmt::Display, time::Duration};

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::Serialize;

/// Configured work window: `[start, end)` on each of `days`.
#[derive(Debug, Clone)]
pub struct WorkSchedule {
    start: NaiveTime,
    end: NaiveTime,
    days: HashSet<Weekday>,
}

impl WorkSchedule {
    pub fn new(start: NaiveTime, end: NaiveTime, days: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            start,
            end,
            days: days.into_iter().collect(),
        }
    }

    pub fn contains(&self, moment: NaiveDateTime) -> bool {
        let time = moment.time();
        self.days.contains(&moment.weekday()) && self.start <= time && time < self.end
    }

    /// Human readable reason of why `moment` is or isn't inside the window.
    pub fn describe(&self, moment: NaiveDateTime) -> String {
        let time = moment.time();
        if !self.days.contains(&moment.weekday()) {
            format!("Outside work hours ({})", moment.format("%A"))
        } else if time < self.start {
            format!("Outside work hours (before {})", self.start.format("%H:%M"))
        } else if time >= self.end {
            format!("Outside work hours (after {})", self.end.format("%H:%M"))
        } else {
            "Within work hours".to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateDecision {
    Proceed,
    SkipOutsideWorkHours,
    SkipPaused,
    /// The user is away. Still recorded, as a synthetic idle entry.
    SkipIdle,
}

impl Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateDecision::Proceed => write!(f, "proceed"),
            GateDecision::SkipOutsideWorkHours => write!(f, "outside work hours"),
            GateDecision::SkipPaused => write!(f, "paused"),
            GateDecision::SkipIdle => write!(f, "idle"),
        }
    }
}

/// Pre-flight check deciding whether a tracking run proceeds. Pure: every input is passed in.
#[derive(Debug, Clone)]
pub struct GateEvaluator {
    schedule: WorkSchedule,
    idle_threshold: Duration,
}

impl GateEvaluator {
    pub fn new(schedule: WorkSchedule, idle_threshold: Duration) -> Self {
        Self {
            schedule,
            idle_threshold,
        }
    }

    pub fn is_idle(&self, idle_time: Duration) -> bool {
        idle_time >= self.idle_threshold
    }

    /// Checks pause, work window and idleness in that order. `force` bypasses all of them.
    pub fn evaluate(
        &self,
        now: NaiveDateTime,
        pause_flag_present: bool,
        idle_time: Duration,
        force: bool,
    ) -> GateDecision {
        if force {
            return GateDecision::Proceed;
        }
        if pause_flag_present {
            return GateDecision::SkipPaused;
        }
        if !self.schedule.contains(now) {
            return GateDecision::SkipOutsideWorkHours;
        }
        if self.is_idle(idle_time) {
            return GateDecision::SkipIdle;
        }
        GateDecision::Proceed
    }
}
