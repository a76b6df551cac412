use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::platform::apps::AppCatalog;
use crate::platform::usage_stats::UsageStatsProvider;
use crate::store::entities::{DailySnapshot, TrackedApp};
use crate::store::local::LocalStore;
use crate::store::remote::{paths, to_document, RemoteStore};
use crate::utils::clock::Clock;

use super::sampler;

/// One row of the today view, sorted into place by label.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct AppUsageRow {
    pub package: Arc<str>,
    pub label: Arc<str>,
    pub icon: Option<PathBuf>,
    pub usage_minutes: u32,
    pub goal_minutes: u32,
    /// Placeholder; the statistics layer fills it in where a history is on
    /// hand.
    pub streak: i32,
}

#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct TodayView {
    pub date: NaiveDate,
    pub rows: Vec<AppUsageRow>,
}

impl TodayView {
    /// The durable form of this view.
    pub fn to_snapshot(&self) -> DailySnapshot {
        let mut snapshot = DailySnapshot::new(self.date);
        for row in &self.rows {
            snapshot
                .app_usages
                .insert(row.package.clone(), row.usage_minutes);
        }
        snapshot
    }

    pub fn total_minutes(&self) -> u32 {
        self.rows.iter().map(|row| row.usage_minutes).sum()
    }
}

/// Merges the live sampler output with the backed-up snapshot into the
/// single authoritative today view.
///
/// Union of packages across tracked apps, live data, backup and overrides:
/// tracked apps appear even at zero usage, backup-only apps stay visible.
pub fn merge_today_view(
    date: NaiveDate,
    tracked: &[TrackedApp],
    overrides: &BTreeMap<Arc<str>, u32>,
    live: &BTreeMap<Arc<str>, u32>,
    backup: &DailySnapshot,
    catalog: &dyn AppCatalog,
) -> TodayView {
    let tracked_goals: BTreeMap<Arc<str>, u32> = tracked
        .iter()
        .map(|app| (app.package_name.clone(), app.goal_time))
        .collect();

    let mut packages: BTreeSet<Arc<str>> = BTreeSet::new();
    packages.extend(tracked_goals.keys().cloned());
    packages.extend(live.keys().cloned());
    packages.extend(backup.app_usages.keys().cloned());
    packages.extend(overrides.keys().cloned());

    let mut rows: Vec<AppUsageRow> = packages
        .into_iter()
        .map(|package| {
            // the sampler's value wins outright; adding the backup on top
            // would double-count the same physical usage
            let usage_minutes = live
                .get(&package)
                .or_else(|| backup.app_usages.get(&package))
                .copied()
                .unwrap_or(0);
            let goal_minutes = overrides
                .get(&package)
                .copied()
                .or_else(|| tracked_goals.get(&package).copied())
                .unwrap_or(0);
            AppUsageRow {
                label: catalog.label(&package),
                icon: catalog.icon(&package),
                package,
                usage_minutes,
                goal_minutes,
                streak: 0,
            }
        })
        .collect();
    rows.sort_by_cached_key(|row| row.label.to_lowercase());

    TodayView { date, rows }
}

/// A freshly merged view plus the handle of its background persist task.
/// Awaiting the handle is optional; dropping it leaves the writes running.
pub struct TodayRefresh {
    pub view: TodayView,
    pub persist: JoinHandle<()>,
}

/// Builds today views out of everything that knows about usage, and keeps
/// the stores fed with the result.
pub struct Reconciler {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    usage_stats: Arc<dyn UsageStatsProvider>,
    catalog: Arc<dyn AppCatalog>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        usage_stats: Arc<dyn UsageStatsProvider>,
        catalog: Arc<dyn AppCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local,
            remote,
            usage_stats,
            catalog,
            clock,
        }
    }

    /// Recomputes the today view and persists it, locally and remotely, in
    /// the background. Store failures degrade the view instead of failing
    /// it.
    pub async fn refresh_today(
        &self,
        uid: &str,
        tracked: &[TrackedApp],
        overrides: &BTreeMap<Arc<str>, u32>,
    ) -> TodayRefresh {
        let date = self.clock.today();
        let live = self.live_usage().await;
        let backup = match self.local.snapshot(uid, date).await {
            Ok(snapshot) => snapshot.unwrap_or_else(|| DailySnapshot::new(date)),
            Err(e) => {
                warn!("Reading today's backup failed: {e}");
                DailySnapshot::new(date)
            }
        };

        let view = merge_today_view(
            date,
            tracked,
            overrides,
            &live,
            &backup,
            self.catalog.as_ref(),
        );
        let persist = self.spawn_persist(uid.to_string(), view.to_snapshot());

        TodayRefresh { view, persist }
    }

    /// Per-app minutes since the local day started. The event query wins;
    /// coarse totals are the fallback; with both gone the backup carries
    /// the view alone.
    async fn live_usage(&self) -> BTreeMap<Arc<str>, u32> {
        let start = self.clock.day_start();
        let end = self.clock.time();
        match self.usage_stats.foreground_events(start, end).await {
            Ok(events) => sampler::usage_minutes(&events, end),
            Err(e) => {
                warn!("Foreground event query failed, using coarse totals: {e}");
                match self.usage_stats.usage_totals(start, end).await {
                    Ok(totals) => sampler::to_minutes(totals),
                    Err(e) => {
                        error!("Usage totals query failed as well: {e}");
                        BTreeMap::new()
                    }
                }
            }
        }
    }

    fn spawn_persist(&self, uid: String, snapshot: DailySnapshot) -> JoinHandle<()> {
        let local = self.local.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            if let Err(e) = local.save_snapshot(&uid, &snapshot).await {
                error!("Backing up today's snapshot locally failed: {e}");
            }
            let document = match to_document(&snapshot) {
                Ok(v) => v,
                Err(e) => {
                    error!("Today's snapshot does not serialize: {e}");
                    return;
                }
            };
            if let Err(e) = remote
                .set(&paths::daily_record(&uid, snapshot.date), document)
                .await
            {
                warn!("Pushing today's snapshot failed: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use anyhow::anyhow;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::platform::apps::{MockAppCatalog, PlainCatalog};
    use crate::platform::usage_stats::{
        MockUsageStatsProvider, UsageEvent, UsageEventKind,
    };
    use crate::store::entities::{DailySnapshot, TrackedApp};
    use crate::store::local::LocalStore;
    use crate::store::memory::MemoryRemoteStore;
    use crate::store::remote::{paths, RemoteStore};
    use crate::utils::clock::TestClock;
    use crate::utils::logging::TEST_LOGGING;

    use super::{merge_today_view, Reconciler};

    const TEST_DATE: NaiveDate = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
    const TEST_START_DATE: NaiveDateTime = NaiveDateTime::new(TEST_DATE, NaiveTime::MIN);

    fn tracked(package: &str, goal: u32) -> TrackedApp {
        TrackedApp {
            package_name: package.into(),
            goal_time: goal,
        }
    }

    #[test]
    fn live_usage_wins_over_backup_without_summing() {
        let mut backup = DailySnapshot::new(TEST_DATE);
        backup.app_usages.insert("com.example.mail".into(), 5);
        backup.app_usages.insert("com.example.feed".into(), 12);
        let live = BTreeMap::from([(Arc::from("com.example.mail"), 45)]);

        let view = merge_today_view(
            TEST_DATE,
            &[tracked("com.example.mail", 60)],
            &BTreeMap::new(),
            &live,
            &backup,
            &PlainCatalog,
        );

        let mail = view
            .rows
            .iter()
            .find(|row| &*row.package == "com.example.mail")
            .unwrap();
        assert_eq!(mail.usage_minutes, 45);
        assert_eq!(mail.goal_minutes, 60);

        // the backup-only app stays visible, goalless
        let feed = view
            .rows
            .iter()
            .find(|row| &*row.package == "com.example.feed")
            .unwrap();
        assert_eq!(feed.usage_minutes, 12);
        assert_eq!(feed.goal_minutes, 0);
    }

    #[test]
    fn tracked_apps_show_at_zero_usage_and_overrides_beat_stored_goals() {
        let overrides = BTreeMap::from([(Arc::from("com.example.mail"), 25)]);
        let view = merge_today_view(
            TEST_DATE,
            &[tracked("com.example.mail", 60), tracked("com.example.game", 15)],
            &overrides,
            &BTreeMap::new(),
            &DailySnapshot::new(TEST_DATE),
            &PlainCatalog,
        );

        assert_eq!(view.rows.len(), 2);
        let game = view
            .rows
            .iter()
            .find(|row| &*row.package == "com.example.game")
            .unwrap();
        assert_eq!((game.usage_minutes, game.goal_minutes), (0, 15));
        let mail = view
            .rows
            .iter()
            .find(|row| &*row.package == "com.example.mail")
            .unwrap();
        assert_eq!(mail.goal_minutes, 25);
    }

    #[test]
    fn rows_sort_by_label_case_insensitively() {
        let mut catalog = MockAppCatalog::new();
        catalog.expect_label().returning(|package| match package {
            "com.a" => "Zebra".into(),
            "com.b" => "apple".into(),
            other => other.into(),
        });
        catalog.expect_icon().returning(|_| None);

        let view = merge_today_view(
            TEST_DATE,
            &[tracked("com.a", 10), tracked("com.b", 10)],
            &BTreeMap::new(),
            &BTreeMap::new(),
            &DailySnapshot::new(TEST_DATE),
            &catalog,
        );
        let labels: Vec<&str> = view.rows.iter().map(|row| &*row.label).collect();
        assert_eq!(labels, vec!["apple", "Zebra"]);
    }

    #[tokio::test]
    async fn refresh_persists_the_merged_snapshot_both_ways() {
        let _ = &*TEST_LOGGING;
        let dir = tempdir().unwrap();
        let local = Arc::new(LocalStore::new(dir.path().to_owned()).unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(TestClock::new(TEST_START_DATE + Duration::hours(10)));

        let events = vec![
            UsageEvent {
                package: "com.example.mail".into(),
                kind: UsageEventKind::Foreground,
                timestamp: Utc.from_utc_datetime(&TEST_START_DATE) + Duration::hours(9),
            },
            UsageEvent {
                package: "com.example.mail".into(),
                kind: UsageEventKind::Background,
                timestamp: Utc.from_utc_datetime(&TEST_START_DATE)
                    + Duration::hours(9)
                    + Duration::minutes(45),
            },
        ];
        let mut usage_stats = MockUsageStatsProvider::new();
        usage_stats
            .expect_foreground_events()
            .returning(move |_, _| Ok(events.clone()));

        let reconciler = Reconciler::new(
            local.clone(),
            remote.clone(),
            Arc::new(usage_stats),
            Arc::new(PlainCatalog),
            clock,
        );

        let refresh = reconciler
            .refresh_today("u1", &[tracked("com.example.mail", 60)], &BTreeMap::new())
            .await;
        assert_eq!(refresh.view.rows[0].usage_minutes, 45);
        refresh.persist.await.unwrap();

        let stored = local.snapshot("u1", TEST_DATE).await.unwrap().unwrap();
        assert_eq!(stored.app_usages["com.example.mail"], 45);

        let pushed = remote
            .get(&paths::daily_record("u1", TEST_DATE))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed["appUsages"]["com.example.mail"], 45);
    }

    #[tokio::test]
    async fn refresh_falls_back_to_coarse_totals() {
        let _ = &*TEST_LOGGING;
        let dir = tempdir().unwrap();
        let local = Arc::new(LocalStore::new(dir.path().to_owned()).unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(TestClock::new(TEST_START_DATE + Duration::hours(10)));

        let mut usage_stats = MockUsageStatsProvider::new();
        usage_stats
            .expect_foreground_events()
            .returning(|_, _| Err(anyhow!("events not available")));
        usage_stats.expect_usage_totals().returning(|_, _| {
            Ok(BTreeMap::from([(
                Arc::from("com.example.mail"),
                Duration::seconds(150),
            )]))
        });

        let reconciler = Reconciler::new(
            local,
            remote,
            Arc::new(usage_stats),
            Arc::new(PlainCatalog),
            clock,
        );
        let refresh = reconciler.refresh_today("u1", &[], &BTreeMap::new()).await;
        assert_eq!(refresh.view.rows[0].usage_minutes, 2);
        refresh.persist.await.unwrap();
    }
}
