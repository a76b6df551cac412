use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::social::friends;
use crate::store::entities::{DailySnapshot, FriendRecord, FriendRequest, GroupRecord, GroupRef, UserProfile};
use crate::store::local::LocalStore;
use crate::store::remote::{from_document, paths, DocPath, RemoteStore};

/// What one sync pass managed to pull. Categories fail independently: a
/// failing one is logged and recorded here, the rest still run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pulls the user's remote state into the local store: profile, the latest
/// goal-history entry (which defines the tracked apps), today's usage
/// record, group memberships, friends, and friend requests, in that order.
/// Every pulled record overwrites the local copy; local edits win again
/// once writes resume between syncs.
pub async fn pull_all(
    local: &LocalStore,
    remote: &dyn RemoteStore,
    uid: &str,
    today: NaiveDate,
) -> SyncReport {
    let mut report = SyncReport::default();
    note(&mut report, "profile", pull_profile(local, remote, uid).await);
    note(&mut report, "goals", pull_tracked_apps(local, remote, uid).await);
    note(&mut report, "today", pull_today(local, remote, uid, today).await);
    note(&mut report, "groups", pull_groups(local, remote, uid).await);
    note(&mut report, "friends", pull_friends(local, remote, uid).await);
    note(&mut report, "requests", pull_requests(local, remote, uid).await);
    info!(
        "Sync done: pulled {:?}, failed {:?}",
        report.pulled, report.failed
    );
    report
}

fn note(report: &mut SyncReport, category: &'static str, result: Result<()>) {
    match result {
        Ok(()) => report.pulled.push(category),
        Err(e) => {
            warn!("Sync of {category} failed: {e:#}");
            report.failed.push(category);
        }
    }
}

async fn pull_profile(local: &LocalStore, remote: &dyn RemoteStore, uid: &str) -> Result<()> {
    let Some(document) = remote.get(&paths::profile(uid)).await? else {
        return Ok(());
    };
    let mut profile: UserProfile = from_document(document)?;
    if profile.uid.is_empty() {
        profile.uid = uid.into();
    }
    local.save_profile(uid, &profile).await
}

/// The newest goal-history entry is the current tracked-app list.
async fn pull_tracked_apps(local: &LocalStore, remote: &dyn RemoteStore, uid: &str) -> Result<()> {
    let Some((_, document)) = remote.latest(&paths::goal_history(uid)).await? else {
        return Ok(());
    };
    let goals: DailySnapshot = from_document(document)?;
    local.save_tracked_apps(uid, &goals.to_tracked_apps()).await
}

async fn pull_today(
    local: &LocalStore,
    remote: &dyn RemoteStore,
    uid: &str,
    today: NaiveDate,
) -> Result<()> {
    let Some(document) = remote.get(&paths::daily_record(uid, today)).await? else {
        return Ok(());
    };
    let mut snapshot: DailySnapshot = from_document(document)?;
    // the document id names the day
    snapshot.date = today;
    local.save_snapshot(uid, &snapshot).await
}

/// Resolves the user's group references to full group records. A reference
/// that no longer resolves is skipped, not a category failure.
async fn pull_groups(local: &LocalStore, remote: &dyn RemoteStore, uid: &str) -> Result<()> {
    let references = remote.list(&paths::user_groups(uid)).await?;
    let mut groups = Vec::new();
    for (id, document) in references {
        let group_id: Arc<str> = match from_document::<GroupRef>(document) {
            Ok(reference) if !reference.group_id.is_empty() => reference.group_id,
            _ => id.into(),
        };
        match fetch_group(remote, &group_id).await {
            Ok(Some(group)) => groups.push(group),
            Ok(None) => warn!("Group {group_id} no longer exists, skipping"),
            Err(e) => warn!("Could not fetch group {group_id}: {e:#}"),
        }
    }
    local.save_groups(uid, &groups).await
}

async fn fetch_group(remote: &dyn RemoteStore, group_id: &str) -> Result<Option<GroupRecord>> {
    let Some(document) = remote.get(&paths::group(group_id)).await? else {
        return Ok(None);
    };
    let mut group: GroupRecord = from_document(document)?;
    if group.group_id.is_empty() {
        group.group_id = group_id.into();
    }
    Ok(Some(group))
}

async fn pull_friends(local: &LocalStore, remote: &dyn RemoteStore, uid: &str) -> Result<()> {
    let listed = remote.list(&paths::friends(uid)).await?;
    let records: Vec<FriendRecord> = listed
        .into_iter()
        .filter_map(|(_, document)| friends::friend_record(document))
        .collect();
    local.save_friends(uid, &records).await
}

async fn pull_requests(local: &LocalStore, remote: &dyn RemoteStore, uid: &str) -> Result<()> {
    let me: Arc<str> = uid.into();

    let listed = remote.list(&paths::friend_requests(uid)).await?;
    let received: Vec<FriendRequest> = listed
        .into_iter()
        .filter_map(|(id, document)| friends::received_request(&me, id, document))
        .collect();
    local.save_friend_requests(uid, &received).await?;

    let listed = remote.list(&paths::friend_requests_sent(uid)).await?;
    let sent: Vec<FriendRequest> = listed
        .into_iter()
        .filter_map(|(id, document)| friends::sent_request(&me, id, document))
        .collect();
    local.save_sent_requests(uid, &sent).await
}

/// Goal and usage maps of one day, straight from the remote store.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DayDetail {
    pub goals: BTreeMap<Arc<str>, u32>,
    pub usage: BTreeMap<Arc<str>, u32>,
}

/// Reads one day's goal and usage documents. Each side independently
/// defaults to empty when missing or unreadable.
pub async fn fetch_day_detail(remote: &dyn RemoteStore, uid: &str, date: NaiveDate) -> DayDetail {
    DayDetail {
        goals: read_usage_map(remote, &paths::goal_history_entry(uid, date)).await,
        usage: read_usage_map(remote, &paths::daily_record(uid, date)).await,
    }
}

async fn read_usage_map(remote: &dyn RemoteStore, path: &DocPath) -> BTreeMap<Arc<str>, u32> {
    let document = match remote.get(path).await {
        Ok(Some(document)) => document,
        Ok(None) => return BTreeMap::new(),
        Err(e) => {
            warn!("Could not read {path}: {e:#}");
            return BTreeMap::new();
        }
    };
    match from_document::<DailySnapshot>(document) {
        Ok(snapshot) => snapshot.app_usages,
        Err(e) => {
            warn!("Unreadable day document at {path}: {e:#}");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::store::entities::{DailySnapshot, FriendRecord, TrackedApp, UserProfile};
    use crate::store::local::LocalStore;
    use crate::store::memory::MemoryRemoteStore;
    use crate::store::remote::{paths, to_document, RemoteStore};
    use crate::utils::logging::TEST_LOGGING;

    use super::{fetch_day_detail, pull_all};

    const TODAY: NaiveDate = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();

    async fn seed_remote(remote: &MemoryRemoteStore) -> Result<()> {
        let profile = UserProfile {
            uid: "u1".into(),
            name: "Ada".into(),
            image_url: String::new(),
            friend_code: "AAA111".into(),
        };
        remote
            .set(&paths::profile("u1"), to_document(&profile)?)
            .await?;

        let mut old_goals = DailySnapshot::new(TODAY.pred_opt().unwrap());
        old_goals.app_usages.insert("com.b".into(), 10);
        remote
            .set(
                &paths::goal_history_entry("u1", old_goals.date),
                to_document(&old_goals)?,
            )
            .await?;
        let mut goals = DailySnapshot::new(TODAY);
        goals.app_usages.insert("com.a".into(), 30);
        remote
            .set(&paths::goal_history_entry("u1", TODAY), to_document(&goals)?)
            .await?;

        let mut today = DailySnapshot::new(TODAY);
        today.app_usages.insert("com.a".into(), 12);
        remote
            .set(&paths::daily_record("u1", TODAY), to_document(&today)?)
            .await?;

        let mut group = serde_json::Map::new();
        group.insert("name".into(), json!("Group"));
        group.insert("ownerId".into(), json!("u1"));
        group.insert("memberIds".into(), json!(["u1"]));
        remote.set(&paths::group("g1"), group).await?;
        let mut reference = serde_json::Map::new();
        reference.insert("groupId".into(), json!("g1"));
        remote.set(&paths::user_group("u1", "g1"), reference).await?;

        remote
            .set(
                &paths::friend("u1", "u2"),
                to_document(&FriendRecord {
                    uid: "u2".into(),
                    name: "Grace".into(),
                    photo_url: None,
                })?,
            )
            .await?;

        let mut request = serde_json::Map::new();
        request.insert("fromUid".into(), json!("u3"));
        request.insert("fromName".into(), json!("Alan"));
        remote
            .set(&paths::friend_request("u1", "u3"), request)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn pulls_every_category_and_overwrites_local() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let local = LocalStore::new(dir.path().to_owned())?;
        let remote = MemoryRemoteStore::new();
        seed_remote(&remote).await?;

        // stale local state the pull must replace
        local
            .save_tracked_apps(
                "u1",
                &[TrackedApp {
                    package_name: "com.stale".into(),
                    goal_time: 99,
                }],
            )
            .await?;

        let report = pull_all(&local, &remote, "u1", TODAY).await;
        assert!(report.is_complete(), "failed: {:?}", report.failed);

        let profile = local.profile("u1").await?.unwrap();
        assert_eq!(profile.friend_code, "AAA111");

        let tracked = local.tracked_apps("u1").await?;
        assert_eq!(tracked.len(), 1);
        assert_eq!(&*tracked[0].package_name, "com.a");
        assert_eq!(tracked[0].goal_time, 30);

        let snapshot = local.snapshot("u1", TODAY).await?.unwrap();
        assert_eq!(snapshot.app_usages.get("com.a"), Some(&12));

        let groups = local.groups("u1").await?;
        assert_eq!(groups.len(), 1);
        assert_eq!(&*groups[0].group_id, "g1");

        assert_eq!(local.friends("u1").await?.len(), 1);
        let requests = local.friend_requests("u1").await?;
        assert_eq!(requests.len(), 1);
        assert_eq!(&*requests[0].from_uid, "u3");
        assert_eq!(&*requests[0].to_uid, "u1");
        Ok(())
    }

    #[tokio::test]
    async fn a_failing_category_does_not_stop_the_rest() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let local = LocalStore::new(dir.path().to_owned())?;
        let remote = MemoryRemoteStore::new();
        seed_remote(&remote).await?;
        remote.fail_path("users/u1/friends");

        let report = pull_all(&local, &remote, "u1", TODAY).await;
        assert_eq!(report.failed, vec!["friends"]);
        assert!(report.pulled.contains(&"profile"));
        assert!(report.pulled.contains(&"requests"));

        // categories after the failing one still landed
        assert_eq!(local.friend_requests("u1").await?.len(), 1);
        assert!(local.friends("u1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dead_group_references_are_skipped() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let local = LocalStore::new(dir.path().to_owned())?;
        let remote = MemoryRemoteStore::new();
        seed_remote(&remote).await?;

        let mut dangling = serde_json::Map::new();
        dangling.insert("groupId".into(), json!("gone"));
        remote
            .set(&paths::user_group("u1", "gone"), dangling)
            .await?;

        let report = pull_all(&local, &remote, "u1", TODAY).await;
        assert!(report.pulled.contains(&"groups"));

        let groups = local.groups("u1").await?;
        assert_eq!(groups.len(), 1);
        assert_eq!(&*groups[0].group_id, "g1");
        Ok(())
    }

    #[tokio::test]
    async fn day_detail_defaults_to_empty_maps() -> Result<()> {
        let remote = MemoryRemoteStore::new();
        seed_remote(&remote).await?;

        let detail = fetch_day_detail(&remote, "u1", TODAY).await;
        assert_eq!(detail.goals.get("com.a"), Some(&30));
        assert_eq!(detail.usage.get("com.a"), Some(&12));

        let missing = fetch_day_detail(&remote, "u1", TODAY.succ_opt().unwrap()).await;
        assert!(missing.goals.is_empty());
        assert!(missing.usage.is_empty());
        Ok(())
    }
}
