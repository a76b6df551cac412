use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use futures::{Stream, StreamExt};

use crate::utils::time::{date_key, date_range};

use super::entities::{
    DailySnapshot, FriendRecord, FriendRequest, GroupRecord, NotificationSettings, TrackedApp,
    UserProfile,
};
use super::json_file::{read_json, write_json};

const DAYS_DIR: &str = "days";
const TRACKED_FILE: &str = "tracked.json";
const PROFILE_FILE: &str = "profile.json";
const FRIENDS_FILE: &str = "friends.json";
const REQUESTS_RECEIVED_FILE: &str = "requests_received.json";
const REQUESTS_SENT_FILE: &str = "requests_sent.json";
const GROUPS_FILE: &str = "groups.json";
const NOTIFICATIONS_FILE: &str = "notifications.json";

/// Durable per-user mirror of everything the app shows. Lists and settings
/// read as empty defaults until written, so a fresh account works before the
/// first sync lands.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    fn user_dir(&self, uid: &str) -> PathBuf {
        self.root.join("users").join(uid)
    }

    fn user_file(&self, uid: &str, name: &str) -> PathBuf {
        self.user_dir(uid).join(name)
    }

    fn day_file(&self, uid: &str, date: NaiveDate) -> PathBuf {
        self.user_dir(uid)
            .join(DAYS_DIR)
            .join(format!("{}.json", date_key(date)))
    }

    pub async fn snapshot(&self, uid: &str, date: NaiveDate) -> Result<Option<DailySnapshot>> {
        read_json(&self.day_file(uid, date)).await
    }

    pub async fn save_snapshot(&self, uid: &str, snapshot: &DailySnapshot) -> Result<()> {
        write_json(&self.day_file(uid, snapshot.date), snapshot).await
    }

    /// Snapshots of the inclusive date range that exist on disk. Days that
    /// were never written are skipped, not filled in.
    pub fn snapshots_between<'a>(
        &'a self,
        uid: &'a str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Stream<Item = Result<DailySnapshot>> + 'a {
        date_range(start, end)
            .map(move |date| self.snapshot(uid, date))
            .buffered(4)
            .filter_map(|result| async move { result.transpose() })
    }

    pub async fn tracked_apps(&self, uid: &str) -> Result<Vec<TrackedApp>> {
        Ok(read_json(&self.user_file(uid, TRACKED_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_tracked_apps(&self, uid: &str, apps: &[TrackedApp]) -> Result<()> {
        write_json(&self.user_file(uid, TRACKED_FILE), apps).await
    }

    pub async fn profile(&self, uid: &str) -> Result<Option<UserProfile>> {
        read_json(&self.user_file(uid, PROFILE_FILE)).await
    }

    pub async fn save_profile(&self, uid: &str, profile: &UserProfile) -> Result<()> {
        write_json(&self.user_file(uid, PROFILE_FILE), profile).await
    }

    pub async fn friends(&self, uid: &str) -> Result<Vec<FriendRecord>> {
        Ok(read_json(&self.user_file(uid, FRIENDS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_friends(&self, uid: &str, friends: &[FriendRecord]) -> Result<()> {
        write_json(&self.user_file(uid, FRIENDS_FILE), friends).await
    }

    pub async fn friend_requests(&self, uid: &str) -> Result<Vec<FriendRequest>> {
        Ok(read_json(&self.user_file(uid, REQUESTS_RECEIVED_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_friend_requests(&self, uid: &str, requests: &[FriendRequest]) -> Result<()> {
        write_json(&self.user_file(uid, REQUESTS_RECEIVED_FILE), requests).await
    }

    pub async fn sent_requests(&self, uid: &str) -> Result<Vec<FriendRequest>> {
        Ok(read_json(&self.user_file(uid, REQUESTS_SENT_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_sent_requests(&self, uid: &str, requests: &[FriendRequest]) -> Result<()> {
        write_json(&self.user_file(uid, REQUESTS_SENT_FILE), requests).await
    }

    pub async fn groups(&self, uid: &str) -> Result<Vec<GroupRecord>> {
        Ok(read_json(&self.user_file(uid, GROUPS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_groups(&self, uid: &str, groups: &[GroupRecord]) -> Result<()> {
        write_json(&self.user_file(uid, GROUPS_FILE), groups).await
    }

    pub async fn notification_settings(&self, uid: &str) -> Result<NotificationSettings> {
        Ok(read_json(&self.user_file(uid, NOTIFICATIONS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_notification_settings(
        &self,
        uid: &str,
        settings: &NotificationSettings,
    ) -> Result<()> {
        write_json(&self.user_file(uid, NOTIFICATIONS_FILE), settings).await
    }

    /// Drops everything stored for the user, for logout.
    pub async fn clear_user(&self, uid: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.user_dir(uid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
