use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::platform::usage_stats::{UsageEvent, UsageEventKind};

/// Folds a window of foreground transitions into per-app foreground time.
///
/// A Foreground event marks the app open (a repeated one restarts the
/// marker); Background closes that one app; ScreenOff closes every open app
/// at once. Apps still open when the window ends are closed at `window_end`.
/// Non-positive intervals are discarded as clock skew or duplicates.
pub fn reduce_foreground_time(
    events: &[UsageEvent],
    window_end: DateTime<Utc>,
) -> BTreeMap<Arc<str>, Duration> {
    let mut totals = BTreeMap::new();
    let mut open: BTreeMap<Arc<str>, DateTime<Utc>> = BTreeMap::new();

    for event in events {
        match event.kind {
            UsageEventKind::Foreground => {
                open.insert(event.package.clone(), event.timestamp);
            }
            UsageEventKind::Background => {
                if let Some(start) = open.remove(&event.package) {
                    add_interval(&mut totals, event.package.clone(), start, event.timestamp);
                }
            }
            UsageEventKind::ScreenOff => {
                for (package, start) in std::mem::take(&mut open) {
                    add_interval(&mut totals, package, start, event.timestamp);
                }
            }
        }
    }

    for (package, start) in open {
        add_interval(&mut totals, package, start, window_end);
    }

    totals
}

/// Whole minutes of foreground time per app, truncated, zero-minute apps
/// included.
pub fn usage_minutes(events: &[UsageEvent], window_end: DateTime<Utc>) -> BTreeMap<Arc<str>, u32> {
    to_minutes(reduce_foreground_time(events, window_end))
}

pub fn to_minutes(totals: BTreeMap<Arc<str>, Duration>) -> BTreeMap<Arc<str>, u32> {
    totals
        .into_iter()
        .map(|(package, total)| {
            let minutes = (total.num_seconds() / 60).max(0) as u32;
            (package, minutes)
        })
        .collect()
}

fn add_interval(
    totals: &mut BTreeMap<Arc<str>, Duration>,
    package: Arc<str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    let elapsed = end - start;
    if elapsed > Duration::zero() {
        *totals.entry(package).or_insert(Duration::zero()) += elapsed;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

    use crate::platform::usage_stats::{UsageEvent, UsageEventKind};

    use super::{reduce_foreground_time, usage_minutes};

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(), NaiveTime::MIN);

    fn at(offset_s: i64) -> DateTime<Utc> {
        Utc.from_utc_datetime(&TEST_START_DATE) + Duration::seconds(offset_s)
    }

    fn event(package: &str, kind: UsageEventKind, offset_s: i64) -> UsageEvent {
        UsageEvent {
            package: package.into(),
            kind,
            timestamp: at(offset_s),
        }
    }

    #[test]
    fn matched_intervals_sum_per_app() {
        let events = [
            event("com.example.mail", UsageEventKind::Foreground, 0),
            event("com.example.mail", UsageEventKind::Background, 90),
            event("com.example.feed", UsageEventKind::Foreground, 100),
            event("com.example.feed", UsageEventKind::Background, 160),
            event("com.example.mail", UsageEventKind::Foreground, 200),
            event("com.example.mail", UsageEventKind::Background, 230),
        ];
        let totals = reduce_foreground_time(&events, at(300));

        assert_eq!(totals["com.example.mail"], Duration::seconds(120));
        assert_eq!(totals["com.example.feed"], Duration::seconds(60));

        let minutes = usage_minutes(&events, at(300));
        assert_eq!(minutes["com.example.mail"], 2);
        assert_eq!(minutes["com.example.feed"], 1);
    }

    #[test]
    fn still_open_apps_close_at_window_end() {
        let events = [event("com.example.mail", UsageEventKind::Foreground, 10)];
        let totals = reduce_foreground_time(&events, at(130));
        assert_eq!(totals["com.example.mail"], Duration::seconds(120));
    }

    #[test]
    fn repeated_foreground_restarts_the_marker() {
        let events = [
            event("com.example.mail", UsageEventKind::Foreground, 0),
            event("com.example.mail", UsageEventKind::Foreground, 60),
            event("com.example.mail", UsageEventKind::Background, 90),
        ];
        let totals = reduce_foreground_time(&events, at(300));
        assert_eq!(totals["com.example.mail"], Duration::seconds(30));
    }

    #[test]
    fn screen_off_closes_every_open_app() {
        let events = [
            event("com.example.mail", UsageEventKind::Foreground, 0),
            event("com.example.feed", UsageEventKind::Foreground, 10),
            event("", UsageEventKind::ScreenOff, 30),
        ];
        let totals = reduce_foreground_time(&events, at(300));
        assert_eq!(totals["com.example.mail"], Duration::seconds(30));
        assert_eq!(totals["com.example.feed"], Duration::seconds(20));
    }

    #[test]
    fn stray_and_empty_intervals_are_dropped() {
        let events = [
            // background without a matching foreground
            event("com.example.mail", UsageEventKind::Background, 10),
            // zero-length interval
            event("com.example.feed", UsageEventKind::Foreground, 20),
            event("com.example.feed", UsageEventKind::Background, 20),
        ];
        let totals = reduce_foreground_time(&events, at(300));
        assert!(totals.is_empty());
    }

    #[test]
    fn minutes_truncate_without_rounding() {
        let events = [
            event("com.example.mail", UsageEventKind::Foreground, 0),
            event("com.example.mail", UsageEventKind::Background, 119),
        ];
        let minutes = usage_minutes(&events, at(300));
        assert_eq!(minutes["com.example.mail"], 1);

        let events = [
            event("com.example.feed", UsageEventKind::Foreground, 0),
            event("com.example.feed", UsageEventKind::Background, 59),
        ];
        let minutes = usage_minutes(&events, at(300));
        // under a minute still appears, as zero
        assert_eq!(minutes["com.example.feed"], 0);
    }
}
