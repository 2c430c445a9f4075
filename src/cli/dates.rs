use std::fmt::Display;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate};
use chrono_english::parse_date_string;
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

/// Resolves a day argument. Accepts `YYYY-MM-DD` as well as whatever `chrono-english`
/// understands, for example "yesterday", "3 days ago" or "15/03/2025". Defaults to the day of
/// `now`.
pub fn parse_day(input: Option<&str>, style: DateStyle, now: DateTime<Local>) -> Result<NaiveDate> {
    let Some(input) = input.map(str::trim) else {
        return Ok(now.date_naive());
    };
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date);
    }
    parse_date_string(input, now, style.into())
        .map(|v| v.date_naive())
        .map_err(|e| anyhow!("Failed to validate date {input:?}: {e}"))
}
