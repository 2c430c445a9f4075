//! Terminal rendering of recorded activity.

use ansi_term::{Colour, Style};
use chrono::{Local, NaiveDate};

use crate::{
    pipeline::orchestrator::RunOutcome,
    storage::{
        entities::{ActivityEntry, DayRecord},
        stats::{ActivityStats, StatGroup},
    },
    taxonomy::{ActivityCategory, TaxonomySnapshot},
};

fn group_style(group: StatGroup) -> Style {
    match group {
        StatGroup::Work => Colour::Blue.bold(),
        StatGroup::Personal => Colour::Green.bold(),
        StatGroup::Idle => Colour::Fixed(244).normal(),
        StatGroup::Other => Colour::Yellow.normal(),
    }
}

fn group_name(group: StatGroup) -> &'static str {
    match group {
        StatGroup::Work => "work",
        StatGroup::Personal => "personal",
        StatGroup::Idle => "idle",
        StatGroup::Other => "other",
    }
}

/// Local clock time of an entry, or its raw timestamp when it can't be parsed.
pub fn entry_time(entry: &ActivityEntry) -> String {
    entry
        .moment()
        .map(|v| v.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| entry.timestamp.clone())
}

fn entry_group(entry: &ActivityEntry, taxonomy: &TaxonomySnapshot) -> StatGroup {
    if entry.is_idle() {
        return StatGroup::Idle;
    }
    taxonomy
        .get(&entry.activity_id)
        .map_or(StatGroup::Other, |v| v.category.into())
}

pub fn format_entry(entry: &ActivityEntry, taxonomy: &TaxonomySnapshot) -> String {
    let style = group_style(entry_group(entry, taxonomy));
    let mut line = format!(
        "{}\t{}",
        entry_time(entry),
        style.paint(entry.activity_id.as_str())
    );
    if let Some(reasoning) = &entry.reasoning {
        line.push('\t');
        line.push_str(reasoning);
    }
    line
}

pub fn print_record(record: Option<&DayRecord>, date: NaiveDate, taxonomy: &TaxonomySnapshot) {
    let Some(record) = record.filter(|v| !v.entries.is_empty()) else {
        println!("Nothing recorded on {date}");
        return;
    };
    println!("{}", Style::new().bold().paint(date.format("%A %Y-%m-%d").to_string()));
    for entry in &record.entries {
        println!("{}", format_entry(entry, taxonomy));
    }
}

pub fn print_stats(stats: &ActivityStats) {
    let title = if stats.from == stats.to {
        stats.from.to_string()
    } else {
        format!("{} - {}", stats.from, stats.to)
    };
    println!("{}", Style::new().bold().paint(title));
    if stats.total == 0 {
        println!("Nothing recorded");
        return;
    }
    for group in &stats.groups {
        println!(
            "{}\t{}\t{}",
            group_style(group.group).paint(group_name(group.group)),
            group.percentage,
            group.count
        );
    }
    println!();
    for activity in &stats.activities {
        println!(
            "{}\t{}\t{}\t{}",
            activity.percentage,
            activity.count,
            group_style(activity.group).paint(group_name(activity.group)),
            activity.name
        );
    }
}

pub fn print_days(days: &[(NaiveDate, usize)]) {
    if days.is_empty() {
        println!("Nothing recorded yet");
    }
    for (date, count) in days {
        println!("{date}\t{count}");
    }
}

pub fn print_taxonomy(taxonomy: &TaxonomySnapshot) {
    for category in [ActivityCategory::Work, ActivityCategory::Personal] {
        let group = StatGroup::from(category);
        println!("{}", group_style(group).paint(group_name(group)));
        for definition in taxonomy.in_category(category) {
            println!(
                "  {}\t{}\t{}",
                definition.id, definition.name, definition.description
            );
        }
    }
}

pub fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Recorded(entry) => {
            println!("Recorded {}", entry.activity_id);
            if let Some(scene) = &entry.scene_description {
                println!("{}", Colour::Fixed(244).paint(scene.as_str()));
            }
            if let Some(reasoning) = &entry.reasoning {
                println!("{reasoning}");
            }
        }
        RunOutcome::RecordedIdle(_) => println!("User is idle, recorded idle"),
        RunOutcome::Skipped(decision) => println!("Skipped: {decision}"),
    }
}
