use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serializer};

const DAY_FORMAT: &str = "%Y-%m-%d";
const RECORD_EXTENSION: &str = "jsonl";

/// This is the standard way of converting a date to a day key in zeit.
pub fn date_to_day_key(date: NaiveDate) -> String {
    date.format(DAY_FORMAT).to_string()
}

/// Name of the file holding the activity log for `date`.
pub fn date_to_record_name(date: NaiveDate) -> String {
    format!("{}.{RECORD_EXTENSION}", date_to_day_key(date))
}

/// Inverse of [date_to_record_name]. Returns [None] for files that aren't day records.
pub fn record_name_to_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(RECORD_EXTENSION)?.strip_suffix('.')?;
    NaiveDate::parse_from_str(stem, DAY_FORMAT).ok()
}

/// Serde adapter for `"HH:MM"` times of day.
pub mod hh_mm {
    use super::*;

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(s.trim(), FORMAT).map_err(|e| {
            serde::de::Error::custom(format!("invalid time {s:?}, expected HH:MM: {e}"))
        })
    }
}
