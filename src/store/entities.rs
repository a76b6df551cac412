use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;

use serde::Deserialize;
use serde::Serialize;

use std::collections::BTreeMap;
use std::sync::Arc;

/// One day of per-app usage in minutes, keyed by package id. This is the
/// durable unit of history: it is always replaced whole, never incremented,
/// so a fresh write carries everything known about that day.
///
/// Goal history documents reuse the same shape with goal minutes in
/// `app_usages`, keyed by the same date string.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DailySnapshot {
    #[serde(default)]
    pub date: NaiveDate,
    #[serde(default, deserialize_with = "lenient::usage_map")]
    pub app_usages: BTreeMap<Arc<str>, u32>,
}

impl DailySnapshot {
    /// Empty snapshot for a day nothing is known about yet.
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            app_usages: BTreeMap::new(),
        }
    }

    /// Goal-history document for a tracked-app list.
    pub fn goals(date: NaiveDate, tracked: &[TrackedApp]) -> Self {
        Self {
            date,
            app_usages: tracked
                .iter()
                .map(|app| (app.package_name.clone(), app.goal_time))
                .collect(),
        }
    }

    pub fn to_tracked_apps(&self) -> Vec<TrackedApp> {
        self.app_usages
            .iter()
            .map(|(package, goal)| TrackedApp {
                package_name: package.clone(),
                goal_time: *goal,
            })
            .collect()
    }
}

/// An app the user set a goal for. One per (user, app); deleted when the app
/// is untracked.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrackedApp {
    pub package_name: Arc<str>,
    /// Allowed minutes per day.
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub goal_time: u32,
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub uid: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub name: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub image_url: String,
    /// Short shareable code other users address friend requests to.
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub friend_code: String,
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FriendRecord {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub uid: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub name: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub photo_url: Option<String>,
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Pending,
    Accepted,
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    /// Request documents carry no id of their own on the wire, the document
    /// id stands in for it (sender uid on the receiving side, recipient uid
    /// on the sending side).
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub from_uid: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub to_uid: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub from_name: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub to_name: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub from_photo_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub to_photo_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub status: RequestStatus,
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub group_id: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub name: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub owner_id: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub member_ids: Vec<Arc<str>>,
    /// App the group competes on. Groups may exist without one.
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub app_id: Option<Arc<str>>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub goal_minutes: u32,
}

/// Reference document under a user pointing at a group they belong to.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub group_id: Arc<str>,
}

/// Live usage record of one group member, stored under the group with the
/// member's uid as the document id. `last_start_time` is set while the
/// member's monitor considers the target app running; the stop transition
/// folds the elapsed time into `usage_seconds` and nulls it out again.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemberUsage {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub name: Arc<str>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub usage_seconds: u64,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub is_running: bool,
    #[serde(default, with = "millis_opt")]
    pub last_start_time: Option<DateTime<Utc>>,
}

impl MemberUsage {
    /// Record for a member that just joined.
    pub fn fresh(name: Arc<str>) -> Self {
        Self {
            name,
            usage_seconds: 0,
            is_running: false,
            last_start_time: None,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub individual_app_50: bool,
    pub individual_app_70: bool,
    pub individual_app_100: bool,
    pub total_50: bool,
    pub total_70: bool,
    pub total_100: bool,
    pub repeat_interval_minutes: u32,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            individual_app_50: true,
            individual_app_70: true,
            individual_app_100: true,
            total_50: true,
            total_70: true,
            total_100: true,
            repeat_interval_minutes: 5,
        }
    }
}

/// Remote documents come from clients of several versions, so single bad
/// fields fall back to their default instead of poisoning the whole record.
pub(crate) mod lenient {
    use std::{collections::BTreeMap, sync::Arc};

    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn or_default<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: Deserialize<'de> + Default,
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(T::deserialize(value).unwrap_or_default())
    }

    /// Per-entry tolerant map of package id to minutes. Non-string keys are
    /// dropped, non-numeric values read as zero.
    pub fn usage_map<'de, D>(deserializer: D) -> Result<BTreeMap<Arc<str>, u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let Value::Object(entries) = value else {
            return Ok(BTreeMap::new());
        };
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.as_u64().unwrap_or(0) as u32))
            .collect())
    }
}

mod millis_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_some(&time.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value
            .and_then(|v| v.as_i64())
            .and_then(DateTime::from_timestamp_millis))
    }
}
