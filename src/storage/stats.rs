use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::{
    taxonomy::{ActivityCategory, TaxonomySnapshot, IDLE_ACTIVITY_ID},
    utils::percentage::{count_percentage, Percentage},
};

use super::entities::DayRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatGroup {
    Work,
    Personal,
    Idle,
    /// Ids that are no longer part of the taxonomy.
    Other,
}

impl From<ActivityCategory> for StatGroup {
    fn from(value: ActivityCategory) -> Self {
        match value {
            ActivityCategory::Work => StatGroup::Work,
            ActivityCategory::Personal => StatGroup::Personal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityStat {
    pub activity_id: String,
    pub name: String,
    pub group: StatGroup,
    pub count: usize,
    pub percentage: Percentage,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStat {
    pub group: StatGroup,
    pub count: usize,
    pub percentage: Percentage,
}

/// Shares of activities over the days `from..=to`.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityStats {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Number of entries the percentages are computed against.
    pub total: usize,
    pub groups: Vec<GroupStat>,
    pub activities: Vec<ActivityStat>,
}

pub fn analyze_day(
    record: &DayRecord,
    taxonomy: &TaxonomySnapshot,
    include_idle: bool,
) -> ActivityStats {
    analyze_days(
        std::slice::from_ref(record),
        record.date,
        record.date,
        taxonomy,
        include_idle,
    )
}

/// Counts entries of `records` per activity and per group. Idle entries are left out of the
/// totals unless `include_idle` is set. Both lists are sorted by share, largest first.
pub fn analyze_days(
    records: &[DayRecord],
    from: NaiveDate,
    to: NaiveDate,
    taxonomy: &TaxonomySnapshot,
    include_idle: bool,
) -> ActivityStats {
    let mut counts = HashMap::<&str, usize>::new();
    for entry in records.iter().flat_map(|v| &v.entries) {
        if entry.is_idle() && !include_idle {
            continue;
        }
        *counts.entry(&entry.activity_id).or_default() += 1;
    }
    let total: usize = counts.values().sum();

    let mut group_counts = HashMap::<StatGroup, usize>::new();
    let mut activities = counts
        .into_iter()
        .map(|(id, count)| {
            let (name, group) = match taxonomy.get(id) {
                Some(definition) => (definition.name.clone(), definition.category.into()),
                None if id == IDLE_ACTIVITY_ID => ("Idle".to_string(), StatGroup::Idle),
                None => (id.to_string(), StatGroup::Other),
            };
            *group_counts.entry(group).or_default() += count;
            ActivityStat {
                activity_id: id.to_string(),
                name,
                group,
                count,
                percentage: count_percentage(count, total),
            }
        })
        .collect::<Vec<_>>();
    activities.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.activity_id.cmp(&b.activity_id))
    });

    let mut groups = group_counts
        .into_iter()
        .map(|(group, count)| GroupStat {
            group,
            count,
            percentage: count_percentage(count, total),
        })
        .collect::<Vec<_>>();
    groups.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| (a.group as u8).cmp(&(b.group as u8)))
    });

    ActivityStats {
        from,
        to,
        total,
        groups,
        activities,
    }
}
