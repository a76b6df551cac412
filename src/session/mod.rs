pub mod daily_push;
pub mod sync;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use rand::Rng;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::platform::apps::AppCatalog;
use crate::platform::auth::{AuthProvider, AuthUser};
use crate::platform::usage_stats::UsageStatsProvider;
use crate::social::friends::FriendService;
use crate::social::groups::GroupService;
use crate::social::monitor::GroupUsageMonitor;
use crate::store::entities::{NotificationSettings, TrackedApp, UserProfile};
use crate::store::local::LocalStore;
use crate::store::remote::{from_document, paths, to_document, Document, RemoteStore};
use crate::usage::reconciler::{Reconciler, TodayRefresh, TodayView};
use crate::usage::stats;
use crate::utils::clock::Clock;

use self::sync::{DayDetail, SyncReport};

/// Everything a session needs from the outside.
pub struct Dependencies {
    pub local: Arc<LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub usage_stats: Arc<dyn UsageStatsProvider>,
    pub catalog: Arc<dyn AppCatalog>,
    pub clock: Arc<dyn Clock>,
}

struct MonitorHandle {
    group_id: Arc<str>,
    package: Arc<str>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct BackgroundTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionState {
    tracked: Vec<TrackedApp>,
    /// Per-app goal edits that live only in this session; they beat the
    /// stored goal until the app list is saved again.
    goal_overrides: BTreeMap<Arc<str>, u32>,
    overall_goal: Option<u32>,
    monitor: Option<MonitorHandle>,
    daily_push: Option<BackgroundTask>,
}

/// One signed-in user's working state: cached tracked apps, session goal
/// overrides, the latest today view, and the background tasks that keep
/// them current. Built at login, torn down by [Session::logout].
pub struct Session {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    usage_stats: Arc<dyn UsageStatsProvider>,
    clock: Arc<dyn Clock>,
    reconciler: Reconciler,
    uid: Arc<str>,
    today_tx: watch::Sender<TodayView>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Opens the session of an authenticated user. Remote hiccups during
    /// the profile bootstrap are logged; the session still opens on local
    /// data.
    pub async fn open(deps: Dependencies, user: AuthUser) -> Session {
        let Dependencies {
            local,
            remote,
            auth,
            usage_stats,
            catalog,
            clock,
        } = deps;
        let uid = user.uid.clone();

        if let Err(e) = ensure_profile(&local, &*remote, &user, &*clock).await {
            warn!("Profile bootstrap for {uid} failed: {e:#}");
        }

        let tracked = match local.tracked_apps(&uid).await {
            Ok(tracked) => tracked,
            Err(e) => {
                warn!("Could not load tracked apps: {e:#}");
                Vec::new()
            }
        };

        let reconciler = Reconciler::new(
            local.clone(),
            remote.clone(),
            usage_stats.clone(),
            catalog,
            clock.clone(),
        );
        let (today_tx, _) = watch::channel(TodayView {
            date: clock.today(),
            rows: Vec::new(),
        });

        info!("Session opened for {uid}");
        Session {
            local,
            remote,
            auth,
            usage_stats,
            clock,
            reconciler,
            uid,
            today_tx,
            state: Mutex::new(SessionState {
                tracked,
                goal_overrides: BTreeMap::new(),
                overall_goal: None,
                monitor: None,
                daily_push: None,
            }),
        }
    }

    pub fn uid(&self) -> &Arc<str> {
        &self.uid
    }

    pub async fn profile(&self) -> Result<Option<UserProfile>> {
        self.local.profile(&self.uid).await
    }

    /// Pulls the remote state into the local store and refreshes the
    /// cached tracked apps from what arrived.
    pub async fn sync(&self) -> SyncReport {
        let report = sync::pull_all(&self.local, &*self.remote, &self.uid, self.clock.today()).await;
        match self.local.tracked_apps(&self.uid).await {
            Ok(tracked) => self.state.lock().await.tracked = tracked,
            Err(e) => warn!("Could not reload tracked apps after sync: {e:#}"),
        }
        report
    }

    /// Rebuilds the today view and publishes it on the watch channel. The
    /// returned handle finishes when the snapshot has been persisted.
    pub async fn refresh_today(&self) -> TodayRefresh {
        let (tracked, overrides) = {
            let state = self.state.lock().await;
            (state.tracked.clone(), state.goal_overrides.clone())
        };
        let refresh = self
            .reconciler
            .refresh_today(&self.uid, &tracked, &overrides)
            .await;
        self.today_tx.send_replace(refresh.view.clone());
        refresh
    }

    pub fn today_view_watch(&self) -> watch::Receiver<TodayView> {
        self.today_tx.subscribe()
    }

    pub async fn tracked_apps(&self) -> Vec<TrackedApp> {
        self.state.lock().await.tracked.clone()
    }

    /// Replaces the tracked-app list. Goals of apps missing from `goals`
    /// are dropped, session overrides reset (a saved goal supersedes them),
    /// the new goal map is pushed to today's goal history best-effort, and
    /// the today view refreshed.
    pub async fn set_tracked_apps(&self, goals: BTreeMap<Arc<str>, u32>) -> Result<TodayRefresh> {
        let tracked: Vec<TrackedApp> = goals
            .iter()
            .map(|(package, goal)| TrackedApp {
                package_name: package.clone(),
                goal_time: *goal,
            })
            .collect();
        self.local.save_tracked_apps(&self.uid, &tracked).await?;

        {
            let mut state = self.state.lock().await;
            state.tracked = tracked;
            state.goal_overrides.clear();
        }

        let today = self.clock.today();
        if let Err(e) =
            daily_push::push_goal_history(&self.local, &*self.remote, &self.uid, today).await
        {
            warn!("Goal history push failed: {e:#}");
        }

        Ok(self.refresh_today().await)
    }

    /// Session-only goal for one app; `None` clears it.
    pub async fn set_goal_override(&self, package: Arc<str>, minutes: Option<u32>) {
        let mut state = self.state.lock().await;
        match minutes {
            Some(minutes) => {
                state.goal_overrides.insert(package, minutes);
            }
            None => {
                state.goal_overrides.remove(&package);
            }
        }
    }

    /// Session-only total goal; `None` falls back to the sum of tracked
    /// goals.
    pub async fn set_overall_goal(&self, minutes: Option<u32>) {
        self.state.lock().await.overall_goal = minutes;
    }

    pub async fn overall_goal(&self) -> u32 {
        let state = self.state.lock().await;
        stats::overall_goal(state.overall_goal, &state.tracked)
    }

    /// One day's goal and usage maps from the remote store.
    pub async fn day_detail(&self, date: NaiveDate) -> DayDetail {
        sync::fetch_day_detail(&*self.remote, &self.uid, date).await
    }

    /// Starts watching `package` for the group, replacing a monitor watching
    /// anything else; asking for the already-watched pair changes nothing.
    /// The replaced monitor has fully stopped by the time this returns.
    pub async fn start_group_monitor(&self, group_id: Arc<str>, package: Arc<str>) {
        let mut state = self.state.lock().await;
        if let Some(current) = &state.monitor {
            if current.group_id == group_id && current.package == package {
                debug!("Monitor for {package} in group {group_id} already running");
                return;
            }
        }
        if let Some(previous) = state.monitor.take() {
            previous.stop.cancel();
            if let Err(e) = previous.task.await {
                warn!("Replaced monitor ended abnormally: {e}");
            }
        }

        let stop = CancellationToken::new();
        let monitor = GroupUsageMonitor::new(
            self.remote.clone(),
            self.usage_stats.clone(),
            self.clock.clone(),
            self.uid.clone(),
            group_id.clone(),
            package.clone(),
            stop.clone(),
        );
        let task = tokio::spawn(monitor.run());
        state.monitor = Some(MonitorHandle {
            group_id,
            package,
            stop,
            task,
        });
    }

    pub async fn stop_group_monitor(&self) {
        let mut state = self.state.lock().await;
        if let Some(monitor) = state.monitor.take() {
            monitor.stop.cancel();
            if let Err(e) = monitor.task.await {
                warn!("Monitor ended abnormally: {e}");
            }
        }
    }

    /// The (group, app) pair currently being monitored, if any.
    pub async fn monitored_app(&self) -> Option<(Arc<str>, Arc<str>)> {
        let state = self.state.lock().await;
        state
            .monitor
            .as_ref()
            .map(|monitor| (monitor.group_id.clone(), monitor.package.clone()))
    }

    /// Arms the midnight goal-history push. Idempotent.
    pub async fn start_daily_push(&self) {
        let mut state = self.state.lock().await;
        if state.daily_push.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(daily_push::run_daily_push(
            self.local.clone(),
            self.remote.clone(),
            self.clock.clone(),
            self.uid.clone(),
            stop.clone(),
        ));
        state.daily_push = Some(BackgroundTask { stop, task });
    }

    /// Cancels the monitor and the daily push and waits for both to wind
    /// down.
    pub async fn stop_background_tasks(&self) {
        let mut state = self.state.lock().await;
        if let Some(monitor) = state.monitor.take() {
            monitor.stop.cancel();
            if let Err(e) = monitor.task.await {
                warn!("Monitor ended abnormally: {e}");
            }
        }
        if let Some(push) = state.daily_push.take() {
            push.stop.cancel();
            if let Err(e) = push.task.await {
                warn!("Daily push task ended abnormally: {e}");
            }
        }
    }

    pub async fn notification_settings(&self) -> Result<NotificationSettings> {
        self.local.notification_settings(&self.uid).await
    }

    pub async fn update_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<()> {
        self.local
            .save_notification_settings(&self.uid, settings)
            .await
    }

    pub fn friends(&self) -> FriendService {
        FriendService::new(
            self.local.clone(),
            self.remote.clone(),
            self.clock.clone(),
            self.uid.clone(),
        )
    }

    pub fn groups(&self) -> GroupService {
        GroupService::new(
            self.local.clone(),
            self.remote.clone(),
            self.clock.clone(),
            self.uid.clone(),
        )
    }

    /// Ends the session: background tasks stop, the user's local data is
    /// removed, and the auth provider signs out.
    pub async fn logout(self) -> Result<()> {
        self.stop_background_tasks().await;
        self.local.clear_user(&self.uid).await?;
        self.auth.sign_out().await?;
        info!("Signed out {}", self.uid);
        Ok(())
    }
}

/// Pulls the remote profile into the local mirror, creating it (with a fresh
/// friend code and a user marker document) on first login.
async fn ensure_profile(
    local: &LocalStore,
    remote: &dyn RemoteStore,
    user: &AuthUser,
    clock: &dyn Clock,
) -> Result<()> {
    if let Some(document) = remote.get(&paths::profile(&user.uid)).await? {
        let mut profile: UserProfile = from_document(document)?;
        if profile.uid.is_empty() {
            profile.uid = user.uid.clone();
        }
        local.save_profile(&user.uid, &profile).await?;
        return Ok(());
    }

    let profile = UserProfile {
        uid: user.uid.clone(),
        name: user.display_name.clone().unwrap_or_default().into(),
        image_url: user.photo_url.clone().unwrap_or_default(),
        friend_code: new_friend_code(),
    };
    // marker document, so the user turns up when the collection is listed
    let mut marker = Document::new();
    marker.insert(
        "createdAt".into(),
        json!(clock.time().timestamp_millis()),
    );
    remote.set(&paths::user(&user.uid), marker).await?;
    remote
        .set(&paths::profile(&user.uid), to_document(&profile)?)
        .await?;
    local.save_profile(&user.uid, &profile).await?;
    info!("Created profile for {} with a new friend code", user.uid);
    Ok(())
}

fn new_friend_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use anyhow::Result;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde_json::json;
    use tempfile::tempdir;

    use crate::platform::apps::PlainCatalog;
    use crate::platform::auth::{AuthProvider, LocalAuth};
    use crate::platform::usage_stats::MockUsageStatsProvider;
    use crate::store::local::LocalStore;
    use crate::store::memory::MemoryRemoteStore;
    use crate::store::remote::{paths, RemoteStore};
    use crate::utils::clock::TestClock;
    use crate::utils::logging::TEST_LOGGING;

    use super::{Dependencies, Session};

    const TEST_START_DATE: NaiveDateTime = NaiveDateTime::new(
        NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
        NaiveTime::MIN,
    );

    struct Fixture {
        _dir: tempfile::TempDir,
        local: Arc<LocalStore>,
        remote: Arc<MemoryRemoteStore>,
        auth: Arc<LocalAuth>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let local = Arc::new(LocalStore::new(dir.path().to_owned()).unwrap());
            let auth = Arc::new(LocalAuth::new(dir.path()).unwrap());
            Self {
                _dir: dir,
                local,
                remote: Arc::new(MemoryRemoteStore::new()),
                auth,
            }
        }

        async fn open(&self, usage_stats: MockUsageStatsProvider) -> Session {
            let user = match self.auth.current_user() {
                Some(user) => user,
                None => self.auth.sign_in_anonymously().await.unwrap(),
            };
            let deps = Dependencies {
                local: self.local.clone(),
                remote: self.remote.clone(),
                auth: self.auth.clone(),
                usage_stats: Arc::new(usage_stats),
                catalog: Arc::new(PlainCatalog),
                clock: Arc::new(TestClock::new(TEST_START_DATE)),
            };
            Session::open(deps, user).await
        }
    }

    fn quiet_usage_stats() -> MockUsageStatsProvider {
        let mut usage_stats = MockUsageStatsProvider::new();
        usage_stats
            .expect_foreground_events()
            .returning(|_, _| Ok(Vec::new()));
        usage_stats
            .expect_foreground_app()
            .returning(|_, _| Ok(None));
        usage_stats
    }

    #[tokio::test]
    async fn opening_creates_a_profile_with_a_friend_code() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        let profile = session.profile().await?.unwrap();
        assert_eq!(profile.friend_code.len(), 8);

        let document = fixture
            .remote
            .get(&paths::profile(session.uid()))
            .await?
            .unwrap();
        assert_eq!(document["friendCode"], json!(profile.friend_code));
        assert!(fixture
            .remote
            .get(&paths::user(session.uid()))
            .await?
            .is_some());

        // a second open keeps the existing code
        let again = fixture.open(quiet_usage_stats()).await;
        assert_eq!(
            again.profile().await?.unwrap().friend_code,
            profile.friend_code
        );
        Ok(())
    }

    #[tokio::test]
    async fn set_tracked_apps_drops_untracked_goals() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        let mut goals = BTreeMap::new();
        goals.insert(Arc::from("com.a"), 30);
        goals.insert(Arc::from("com.b"), 15);
        session.set_tracked_apps(goals).await?.persist.await?;

        let mut fewer = BTreeMap::new();
        fewer.insert(Arc::from("com.a"), 30);
        let refresh = session.set_tracked_apps(fewer).await?;
        refresh.persist.await?;

        let tracked = fixture.local.tracked_apps(session.uid()).await?;
        assert_eq!(tracked.len(), 1);
        assert_eq!(&*tracked[0].package_name, "com.a");

        // pushed to today's goal history as well
        let today = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        let doc = fixture
            .remote
            .get(&paths::goal_history_entry(session.uid(), today))
            .await?
            .unwrap();
        assert_eq!(doc["appUsages"], json!({ "com.a": 30 }));

        assert_eq!(refresh.view.rows.len(), 1);
        assert_eq!(&*refresh.view.rows[0].package, "com.a");
        Ok(())
    }

    #[tokio::test]
    async fn overall_goal_override_beats_the_sum() -> Result<()> {
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        let mut goals = BTreeMap::new();
        goals.insert(Arc::from("com.a"), 30);
        goals.insert(Arc::from("com.b"), 15);
        session.set_tracked_apps(goals).await?.persist.await?;
        assert_eq!(session.overall_goal().await, 45);

        session.set_overall_goal(Some(90)).await;
        assert_eq!(session.overall_goal().await, 90);

        session.set_overall_goal(None).await;
        assert_eq!(session.overall_goal().await, 45);
        Ok(())
    }

    #[tokio::test]
    async fn goal_overrides_shape_the_view_until_saving() -> Result<()> {
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        let mut goals = BTreeMap::new();
        goals.insert(Arc::from("com.a"), 30);
        session.set_tracked_apps(goals).await?.persist.await?;

        session.set_goal_override("com.a".into(), Some(5)).await;
        let refresh = session.refresh_today().await;
        assert_eq!(refresh.view.rows[0].goal_minutes, 5);
        refresh.persist.await?;

        // saving the list again resets the override
        let mut goals = BTreeMap::new();
        goals.insert(Arc::from("com.a"), 30);
        let refresh = session.set_tracked_apps(goals).await?;
        assert_eq!(refresh.view.rows[0].goal_minutes, 30);
        refresh.persist.await?;
        Ok(())
    }

    #[tokio::test]
    async fn refresh_publishes_on_the_watch_channel() -> Result<()> {
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        let mut watch = session.today_view_watch();
        assert!(watch.borrow().rows.is_empty());

        let mut goals = BTreeMap::new();
        goals.insert(Arc::from("com.a"), 30);
        session.set_tracked_apps(goals).await?.persist.await?;

        assert!(watch.has_changed()?);
        let view = watch.borrow_and_update();
        assert_eq!(&*view.rows[0].package, "com.a");
        Ok(())
    }

    #[tokio::test]
    async fn notification_settings_round_trip() -> Result<()> {
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        let mut settings = session.notification_settings().await?;
        assert!(settings.total_100);

        settings.total_100 = false;
        settings.repeat_interval_minutes = 10;
        session.update_notification_settings(&settings).await?;

        assert_eq!(session.notification_settings().await?, settings);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_monitor_replaces_the_previous_one() {
        let _ = &*TEST_LOGGING;
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;

        session
            .start_group_monitor("g1".into(), "com.a".into())
            .await;
        assert_eq!(
            session.monitored_app().await,
            Some(("g1".into(), "com.a".into()))
        );

        // same pair: nothing to do
        session
            .start_group_monitor("g1".into(), "com.a".into())
            .await;
        assert_eq!(
            session.monitored_app().await,
            Some(("g1".into(), "com.a".into()))
        );

        session
            .start_group_monitor("g1".into(), "com.b".into())
            .await;
        assert_eq!(
            session.monitored_app().await,
            Some(("g1".into(), "com.b".into()))
        );

        session.stop_group_monitor().await;
        assert_eq!(session.monitored_app().await, None);
    }

    #[tokio::test]
    async fn logout_clears_local_data_and_signs_out() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let fixture = Fixture::new();
        let session = fixture.open(quiet_usage_stats()).await;
        let uid = session.uid().clone();

        let mut goals = BTreeMap::new();
        goals.insert(Arc::from("com.a"), 30);
        session.set_tracked_apps(goals).await?.persist.await?;

        session.logout().await?;

        assert!(fixture.local.profile(&uid).await?.is_none());
        assert!(fixture.local.tracked_apps(&uid).await?.is_empty());
        assert!(fixture.auth.current_user().is_none());
        Ok(())
    }
}
