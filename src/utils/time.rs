use std::future;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};
use futures::{stream, Stream};

/// This is the standard way of converting a date to a string in pixeldiet.
/// The same key names day snapshot files on disk and date-keyed documents in
/// the remote store, and it sorts lexicographically in date order.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Returns start of the next day.
pub fn next_day_start<Tz: TimeZone>(date: DateTime<Tz>) -> DateTime<Tz> {
    (date + Duration::days(1)).with_time(NaiveTime::MIN).unwrap()
}

/// Returns a stream of dates between start (inclusive) and end (inclusive).
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Stream<Item = NaiveDate> {
    stream::unfold((start, end), |(mut current, end)| {
        future::ready({
            if current <= end {
                let last_current = current;
                current = current.succ_opt().expect("End of time should never happen");
                Some((last_current, (current, end)))
            } else {
                None
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
    use futures::StreamExt;

    use super::{date_key, date_range, next_day_start};

    #[test]
    fn date_key_is_iso_and_sortable() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(date_key(date), "2025-03-07");
        // lexicographic order matches date order
        assert!(date_key(date) < date_key(NaiveDate::from_ymd_opt(2025, 11, 2).unwrap()));
    }

    #[test]
    fn next_day_start_respects_offset() {
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        let evening = tz.with_ymd_and_hms(2025, 3, 7, 23, 30, 0).unwrap();
        let midnight = next_day_start(evening);
        assert_eq!(midnight, tz.with_ymd_and_hms(2025, 3, 8, 0, 0, 0).unwrap());

        let utc_evening = Utc.with_ymd_and_hms(2025, 12, 31, 5, 0, 0).unwrap();
        assert_eq!(
            next_day_start(utc_evening),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn date_range_is_inclusive() {
        let start = NaiveDate::from_ymd_opt(2025, 2, 27).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        let days: Vec<_> = date_range(start, end).collect().await;
        assert_eq!(days.len(), 4);
        assert_eq!(days.first(), Some(&start));
        assert_eq!(days.last(), Some(&end));
    }
}
