use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::taxonomy::IDLE_ACTIVITY_ID;

/// One classified sample. Immutable once written.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct ActivityEntry {
    /// ISO-8601 moment of capture, in local time with its offset.
    pub timestamp: String,
    #[serde(rename = "activity")]
    pub activity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_context: Option<String>,
}

impl ActivityEntry {
    pub fn new(
        moment: DateTime<FixedOffset>,
        activity_id: impl Into<String>,
        reasoning: Option<String>,
        scene_description: Option<String>,
        secondary_context: Option<String>,
    ) -> Self {
        Self {
            timestamp: format_timestamp(moment),
            activity_id: activity_id.into(),
            reasoning,
            scene_description,
            secondary_context,
        }
    }

    /// Entry recorded instead of a capture when the user has been away.
    pub fn idle(moment: DateTime<FixedOffset>) -> Self {
        Self::new(moment, IDLE_ACTIVITY_ID, None, None, None)
    }

    pub fn is_idle(&self) -> bool {
        self.activity_id == IDLE_ACTIVITY_ID
    }

    pub fn moment(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

pub fn format_timestamp(moment: DateTime<FixedOffset>) -> String {
    moment.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// All entries of one calendar day, in the order they were appended.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub entries: Vec<ActivityEntry>,
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::ActivityEntry;

    #[test]
    fn serialized_entries_skip_missing_fields() {
        let moment = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 30, 10, 15, 0)
            .unwrap();
        let entry = ActivityEntry::idle(moment);
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"timestamp":"2026-01-30T10:15:00+01:00","activity":"idle"}"#
        );
        assert!(entry.is_idle());
        assert_eq!(entry.moment(), Some(moment));
    }
}
