use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::usage::sampler::reduce_foreground_time;
use crate::utils::time::date_key;

/// One foreground transition reported by the platform.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct UsageEvent {
    pub package: Arc<str>,
    pub kind: UsageEventKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum UsageEventKind {
    /// The app moved to the foreground.
    Foreground,
    /// The app left the foreground.
    Background,
    /// The display turned off; every foreground app stops counting.
    ScreenOff,
}

/// Interface for abstracting the platform's usage statistics facility.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UsageStatsProvider: Send + Sync + 'static {
    /// Foreground transitions inside the window, oldest first.
    async fn foreground_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>>;

    /// Coarse per-app foreground totals for the window. Separately sourced
    /// on real platforms; used as the fallback when the event query fails.
    async fn usage_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<Arc<str>, Duration>>;

    /// Package of the most recent event in the `lookback` window ending at
    /// `at`. `None` when nothing happened or the screen went off.
    async fn foreground_app(
        &self,
        at: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Option<Arc<str>>>;
}

/// The shipped [UsageStatsProvider]: an append-only event log, one file of
/// JSON lines per UTC day, written by whatever platform bridge captures the
/// transitions. Reading tolerates partial lines so a crash mid-append loses
/// one event, not the day.
pub struct EventLogUsageStats {
    event_dir: PathBuf,
}

impl EventLogUsageStats {
    pub fn new(event_dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&event_dir)?;

        Ok(Self { event_dir })
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.event_dir.join(date_key(date))
    }

    /// Appends captured events, splitting them over day files by timestamp.
    pub async fn append(&self, events: &[UsageEvent]) -> Result<()> {
        let mut by_day: BTreeMap<NaiveDate, Vec<u8>> = BTreeMap::new();
        for event in events {
            let buffer = by_day.entry(event.timestamp.date_naive()).or_default();
            serde_json::to_writer(&mut *buffer, event)?;
            buffer.push(b'\n');
        }

        for (date, buffer) in by_day {
            let mut file = File::options()
                .append(true)
                .create(true)
                .open(self.day_file(date))
                .await?;
            file.lock_exclusive()?;
            let result = async {
                file.write_all(&buffer).await?;
                file.flush().await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            file.unlock_async().await?;
            result?;
        }
        Ok(())
    }

    async fn read_day(&self, date: NaiveDate) -> Result<Vec<UsageEvent>> {
        extract_events(&self.day_file(date)).await
    }

    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>> {
        let mut events = Vec::new();
        let mut date = start.date_naive();
        while date <= end.date_naive() {
            events.extend(self.read_day(date).await?);
            date += Duration::days(1);
        }
        events.retain(|event| start <= event.timestamp && event.timestamp <= end);
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }
}

async fn extract_events(path: &Path) -> Result<Vec<UsageEvent>> {
    async fn extract(path: &Path) -> std::result::Result<Vec<UsageEvent>, std::io::Error> {
        debug!("Extracting {path:?}");
        let file = File::open(path).await?;
        file.lock_shared()?;
        let buffer = BufReader::new(file);
        let mut lines = buffer.lines();
        let mut events = vec![];
        while let Ok(Some(v)) = lines.next_line().await {
            match serde_json::from_str::<UsageEvent>(&v) {
                Ok(v) => events.push(v),
                Err(e) => {
                    // ignore illegal values. Might happen after shutdowns
                    warn!(
                        "During parsing in path {:?} found illegal json string {}:  {e}",
                        path, &v
                    )
                }
            }
        }

        lines.into_inner().into_inner().unlock_async().await?;

        Ok(events)
    }

    match extract(path).await {
        Ok(s) => Ok(s),
        Err(e) => {
            if e.kind() == ErrorKind::NotFound {
                Ok(vec![])
            } else {
                Err(e)?
            }
        }
    }
}

#[async_trait]
impl UsageStatsProvider for EventLogUsageStats {
    async fn foreground_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>> {
        self.events_between(start, end).await
    }

    async fn usage_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<Arc<str>, Duration>> {
        let events = self.events_between(start, end).await?;
        Ok(reduce_foreground_time(&events, end))
    }

    async fn foreground_app(
        &self,
        at: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Option<Arc<str>>> {
        let events = self.events_between(at - lookback, at).await?;
        Ok(events.last().and_then(|event| match event.kind {
            UsageEventKind::ScreenOff => None,
            _ => Some(event.package.clone()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::platform::usage_stats::UsageStatsProvider;
    use crate::utils::logging::TEST_LOGGING;

    use super::{EventLogUsageStats, UsageEvent, UsageEventKind};

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(), NaiveTime::MIN);

    fn event(package: &str, kind: UsageEventKind, offset_s: i64) -> UsageEvent {
        UsageEvent {
            package: package.into(),
            kind,
            timestamp: Utc.from_utc_datetime(&TEST_START_DATE) + Duration::seconds(offset_s),
        }
    }

    #[tokio::test]
    async fn events_round_trip_in_window_order() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let log = EventLogUsageStats::new(dir.path().to_owned())?;

        log.append(&[
            event("com.example.mail", UsageEventKind::Foreground, 10),
            event("com.example.mail", UsageEventKind::Background, 70),
        ])
        .await?;
        log.append(&[event("com.example.feed", UsageEventKind::Foreground, 90)])
            .await?;

        let start = Utc.from_utc_datetime(&TEST_START_DATE);
        let events = log
            .foreground_events(start, start + Duration::seconds(80))
            .await?;
        assert_eq!(events.len(), 2);
        assert_eq!(&*events[0].package, "com.example.mail");
        assert_eq!(events[1].kind, UsageEventKind::Background);
        Ok(())
    }

    #[tokio::test]
    async fn window_spans_day_files() -> Result<()> {
        let dir = tempdir()?;
        let log = EventLogUsageStats::new(dir.path().to_owned())?;

        let late = 24 * 3600 - 30;
        log.append(&[
            event("com.example.mail", UsageEventKind::Foreground, late),
            event("com.example.mail", UsageEventKind::Background, late + 60),
        ])
        .await?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 2);

        let start = Utc.from_utc_datetime(&TEST_START_DATE) + Duration::seconds(late - 10);
        let events = log
            .foreground_events(start, start + Duration::seconds(120))
            .await?;
        assert_eq!(events.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let log = EventLogUsageStats::new(dir.path().to_owned())?;

        log.append(&[event("com.example.mail", UsageEventKind::Foreground, 5)])
            .await?;
        let day_file = dir.path().join("2025-03-07");
        let mut contents = std::fs::read(&day_file)?;
        contents.extend_from_slice(b"{\"package\": \"com.exam\n");
        std::fs::write(&day_file, contents)?;
        log.append(&[event("com.example.mail", UsageEventKind::Background, 25)])
            .await?;

        let start = Utc.from_utc_datetime(&TEST_START_DATE);
        let events = log
            .foreground_events(start, start + Duration::seconds(60))
            .await?;
        assert_eq!(events.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn foreground_probe_reports_most_recent_activity() -> Result<()> {
        let dir = tempdir()?;
        let log = EventLogUsageStats::new(dir.path().to_owned())?;
        let start = Utc.from_utc_datetime(&TEST_START_DATE);

        assert_eq!(
            log.foreground_app(start, Duration::seconds(10)).await?,
            None
        );

        log.append(&[
            event("com.example.mail", UsageEventKind::Foreground, 1),
            event("com.example.feed", UsageEventKind::Foreground, 4),
        ])
        .await?;
        let probed = log
            .foreground_app(start + Duration::seconds(8), Duration::seconds(10))
            .await?;
        assert_eq!(probed.as_deref(), Some("com.example.feed"));

        // a recent background event still names the package
        log.append(&[event("com.example.feed", UsageEventKind::Background, 9)])
            .await?;
        let probed = log
            .foreground_app(start + Duration::seconds(12), Duration::seconds(10))
            .await?;
        assert_eq!(probed.as_deref(), Some("com.example.feed"));

        // the screen going dark means nobody is in front
        log.append(&[event("com.example.feed", UsageEventKind::ScreenOff, 14)])
            .await?;
        let probed = log
            .foreground_app(start + Duration::seconds(15), Duration::seconds(10))
            .await?;
        assert_eq!(probed, None);
        Ok(())
    }
}
