use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};

use crate::store::entities::{DailySnapshot, TrackedApp};

/// How a day went against its goal. Days without an effective goal have no
/// status at all.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DayStatus {
    Success,
    Warning,
    Fail,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct DayVerdict {
    pub date: NaiveDate,
    pub status: DayStatus,
}

/// One bar of the month chart.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ChartPoint {
    pub day: u32,
    pub minutes: u32,
}

/// What a statistic looks at: every tracked app together, or one app.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub enum UsageFilter {
    #[default]
    Overall,
    App(Arc<str>),
}

/// Minutes of the snapshot the filter selects. The overall filter sums
/// tracked apps only; an empty tracked set leaves everything in.
pub fn filtered_usage(
    snapshot: &DailySnapshot,
    filter: &UsageFilter,
    tracked: &BTreeSet<Arc<str>>,
) -> u32 {
    match filter {
        UsageFilter::App(package) => snapshot.app_usages.get(package).copied().unwrap_or(0),
        UsageFilter::Overall => snapshot
            .app_usages
            .iter()
            .filter(|(package, _)| tracked.is_empty() || tracked.contains(*package))
            .map(|(_, minutes)| minutes)
            .sum(),
    }
}

/// Both boundaries are exact: reaching the goal is not a failure, and
/// reaching exactly 70% of it is not yet a warning.
pub fn day_status(usage_minutes: u32, goal_minutes: u32) -> Option<DayStatus> {
    if goal_minutes == 0 {
        return None;
    }
    Some(if usage_minutes > goal_minutes {
        DayStatus::Fail
    } else if 10 * u64::from(usage_minutes) > 7 * u64::from(goal_minutes) {
        DayStatus::Warning
    } else {
        DayStatus::Success
    })
}

/// Calendar statuses for the given snapshots. Days without an effective
/// goal are left out.
pub fn day_statuses(
    snapshots: &[DailySnapshot],
    filter: &UsageFilter,
    tracked: &BTreeSet<Arc<str>>,
    goal_minutes: u32,
) -> Vec<DayVerdict> {
    let mut verdicts: Vec<DayVerdict> = snapshots
        .iter()
        .filter_map(|snapshot| {
            let usage = filtered_usage(snapshot, filter, tracked);
            day_status(usage, goal_minutes).map(|status| DayVerdict {
                date: snapshot.date,
                status,
            })
        })
        .collect();
    verdicts.sort_by_key(|verdict| verdict.date);
    verdicts
}

/// Consecutive same-verdict days counted backwards from the most recent
/// snapshot; positive for a success run, negative for a failure run. Days
/// with no snapshot are simply not part of the walk.
pub fn streak(
    snapshots: &[DailySnapshot],
    filter: &UsageFilter,
    tracked: &BTreeSet<Arc<str>>,
    goal_minutes: u32,
) -> i32 {
    if goal_minutes == 0 {
        return 0;
    }
    let mut sorted: Vec<&DailySnapshot> = snapshots.iter().collect();
    sorted.sort_by(|a, b| b.date.cmp(&a.date));

    let mut run = 0;
    let mut seed: Option<bool> = None;
    for snapshot in sorted {
        let success = filtered_usage(snapshot, filter, tracked) <= goal_minutes;
        match seed {
            None => {
                seed = Some(success);
                run = 1;
            }
            Some(verdict) if verdict == success => run += 1,
            Some(_) => break,
        }
    }
    if seed == Some(false) {
        -run
    } else {
        run
    }
}

/// One point per stored day of the selected month, in day order.
pub fn month_series(
    snapshots: &[DailySnapshot],
    year: i32,
    month: u32,
    filter: &UsageFilter,
    tracked: &BTreeSet<Arc<str>>,
) -> Vec<ChartPoint> {
    let mut points: Vec<ChartPoint> = snapshots
        .iter()
        .filter(|snapshot| snapshot.date.year() == year && snapshot.date.month() == month)
        .map(|snapshot| ChartPoint {
            day: snapshot.date.day(),
            minutes: filtered_usage(snapshot, filter, tracked),
        })
        .collect();
    points.sort_by_key(|point| point.day);
    points
}

/// Days of the month that stayed within the goal. Warnings still count as
/// kept days.
pub fn month_success_days(
    snapshots: &[DailySnapshot],
    year: i32,
    month: u32,
    filter: &UsageFilter,
    tracked: &BTreeSet<Arc<str>>,
    goal_minutes: u32,
) -> usize {
    snapshots
        .iter()
        .filter(|snapshot| snapshot.date.year() == year && snapshot.date.month() == month)
        .filter_map(|snapshot| day_status(filtered_usage(snapshot, filter, tracked), goal_minutes))
        .filter(|status| !matches!(status, DayStatus::Fail))
        .count()
}

/// The goal the overall filter is judged against: the session override when
/// set, otherwise the sum of tracked goals.
pub fn overall_goal(override_minutes: Option<u32>, tracked: &[TrackedApp]) -> u32 {
    override_minutes.unwrap_or_else(|| tracked.iter().map(|app| app.goal_time).sum())
}

/// Completion ratio for progress display; zero without a goal.
pub fn completion_ratio(usage_minutes: u32, goal_minutes: u32) -> f32 {
    if goal_minutes == 0 {
        return 0.0;
    }
    usage_minutes as f32 / goal_minutes as f32
}
