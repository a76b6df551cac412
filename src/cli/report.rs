use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Local, Months, NaiveDate};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Parser, ValueEnum};
use futures::TryStreamExt;

use crate::usage::stats::{self, DayStatus, UsageFilter};
use crate::utils::clock::Clock;

use super::{open_session, Args, Services};

/// Streak walks look this far back; older snapshots cannot extend a run
/// anyone still cares about.
const STREAK_LOOKBACK_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DateStyle {
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

#[derive(Debug, Parser)]
pub struct DayCommand {
    #[arg(help = "The day to show. Examples are \"yesterday\", \"last friday\", \"15/03/2025\"")]
    when: String,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
}

#[derive(Debug, Parser)]
pub struct CalendarCommand {
    #[arg(long, help = "Month to show, 1 to 12. Defaults to the current one")]
    month: Option<u32>,
    #[arg(long, help = "Year of the month. Defaults to the current one")]
    year: Option<i32>,
    #[arg(long, help = "Judge one app against its own goal instead of the total")]
    app: Option<String>,
}

/// Refreshes today's view and prints one row per tracked app plus the
/// overall line, each with its verdict and streak.
pub async fn process_today_command(services: &Services) -> Result<()> {
    let session = open_session(services).await?;
    let refresh = session.refresh_today().await;
    refresh.persist.await?;

    let view = refresh.view;
    if view.rows.is_empty() {
        println!("Nothing is tracked. Add apps with `pixeldiet apps track`.");
        return Ok(());
    }

    let start = view.date - chrono::Duration::days(STREAK_LOOKBACK_DAYS);
    let snapshots: Vec<_> = services
        .local
        .snapshots_between(session.uid(), start, view.date)
        .try_collect()
        .await?;
    let tracked: BTreeSet<Arc<str>> = view.rows.iter().map(|row| row.package.clone()).collect();

    for row in &view.rows {
        let filter = UsageFilter::App(row.package.clone());
        let streak = stats::streak(&snapshots, &filter, &tracked, row.goal_minutes);
        println!(
            "{}\t{}\t{}\t{}\t{}",
            row.label,
            format_minutes(row.usage_minutes),
            format_minutes(row.goal_minutes),
            status_label(stats::day_status(row.usage_minutes, row.goal_minutes)),
            format_streak(streak),
        );
    }

    let goal = session.overall_goal().await;
    let total = view.total_minutes();
    println!();
    println!(
        "Total: {} of {} ({}, {:.0}%)",
        format_minutes(total),
        format_minutes(goal),
        status_label(stats::day_status(total, goal)),
        stats::completion_ratio(total, goal) * 100.0,
    );
    Ok(())
}

pub async fn process_day_command(
    services: &Services,
    DayCommand { when, date_style }: DayCommand,
) -> Result<()> {
    let date = match parse_date_string(&when, Local::now(), date_style.into()) {
        Ok(v) => v.date_naive(),
        Err(e) => {
            return Err(Args::command()
                .error(
                    clap::error::ErrorKind::ValueValidation,
                    format!("Failed to validate the date {e}"),
                )
                .into());
        }
    };

    let session = open_session(services).await?;
    let detail = session.day_detail(date).await;

    println!("{date}");
    if detail.goals.is_empty() && detail.usage.is_empty() {
        println!("Nothing recorded for this day");
        return Ok(());
    }

    let packages: BTreeSet<&Arc<str>> = detail.goals.keys().chain(detail.usage.keys()).collect();
    for package in packages {
        let usage = detail.usage.get(package).copied().unwrap_or(0);
        let goal = detail.goals.get(package).copied().unwrap_or(0);
        println!(
            "{}\t{}\t{}\t{}",
            package,
            format_minutes(usage),
            format_minutes(goal),
            status_label(stats::day_status(usage, goal)),
        );
    }
    Ok(())
}

/// Month report: a verdict per recorded day, the usage chart, and how many
/// of the recorded days stayed within the goal.
pub async fn process_calendar_command(
    services: &Services,
    CalendarCommand { month, year, app }: CalendarCommand,
) -> Result<()> {
    let session = open_session(services).await?;
    let refresh = session.refresh_today().await;
    refresh.persist.await?;

    let today = services.clock.today();
    let year = year.unwrap_or_else(|| today.year());
    let month = month.unwrap_or_else(|| today.month());
    let Some(start) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return Err(Args::command()
            .error(
                clap::error::ErrorKind::ValueValidation,
                format!("Not a month: {year}-{month}"),
            )
            .into());
    };
    let end = start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(start);

    let snapshots: Vec<_> = services
        .local
        .snapshots_between(session.uid(), start, end)
        .try_collect()
        .await?;
    let tracked_apps = session.tracked_apps().await;
    let tracked: BTreeSet<Arc<str>> = tracked_apps
        .iter()
        .map(|app| app.package_name.clone())
        .collect();

    let (filter, goal) = match app {
        Some(app) => {
            let package: Arc<str> = app.into();
            let goal = tracked_apps
                .iter()
                .find(|tracked| tracked.package_name == package)
                .map(|tracked| tracked.goal_time)
                .unwrap_or(0);
            (UsageFilter::App(package), goal)
        }
        None => (UsageFilter::Overall, session.overall_goal().await),
    };

    let verdicts = stats::day_statuses(&snapshots, &filter, &tracked, goal);
    for verdict in &verdicts {
        println!("{}\t{}", verdict.date, status_label(Some(verdict.status)));
    }
    if verdicts.is_empty() {
        println!("No day of this month has a goal verdict");
    }

    let series = stats::month_series(&snapshots, year, month, &filter, &tracked);
    let peak = series.iter().map(|point| point.minutes).max().unwrap_or(0);
    println!();
    for point in &series {
        let width = if peak == 0 {
            0
        } else {
            (point.minutes * 40 / peak) as usize
        };
        println!(
            "{:>2}\t{}\t{}",
            point.day,
            format_minutes(point.minutes),
            "#".repeat(width),
        );
    }

    if goal > 0 {
        let kept = stats::month_success_days(&snapshots, year, month, &filter, &tracked, goal);
        println!();
        println!("{kept} of {} recorded days within the goal", series.len());
    }
    Ok(())
}

pub(crate) fn format_minutes(minutes: u32) -> String {
    if minutes >= 60 {
        format!("{}h{}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}

pub(crate) fn status_label(status: Option<DayStatus>) -> &'static str {
    match status {
        Some(DayStatus::Success) => "SUCCESS",
        Some(DayStatus::Warning) => "WARNING",
        Some(DayStatus::Fail) => "FAIL",
        None => "NO GOAL",
    }
}

fn format_streak(streak: i32) -> String {
    if streak == 0 {
        "0".to_string()
    } else {
        format!("{streak:+}")
    }
}
