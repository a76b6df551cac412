use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::store::entities::{FriendRecord, GroupRecord, MemberUsage, UserProfile};
use crate::store::local::LocalStore;
use crate::store::remote::{from_document, paths, to_document, Document, RemoteStore, Subscription};
use crate::utils::clock::Clock;

/// Shared-goal groups: membership, per-group goals, and the live member
/// leaderboard. Each group keeps three kinds of documents: the group itself,
/// a reference under every member, and one usage record per member.
pub struct GroupService {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    uid: Arc<str>,
}

/// One leaderboard row. `effective_seconds` adds the running session on top
/// of the accumulated total, so a member mid-session ranks by what their
/// total will be once the session closes.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct LeaderboardEntry {
    pub uid: Arc<str>,
    pub member: MemberUsage,
    pub effective_seconds: u64,
}

/// Ranks members by accumulated plus live usage, worst offender first.
pub fn rank_members(
    members: Vec<(String, MemberUsage)>,
    now: DateTime<Utc>,
) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = members
        .into_iter()
        .map(|(uid, member)| {
            let mut effective_seconds = member.usage_seconds;
            if member.is_running {
                if let Some(started) = member.last_start_time {
                    effective_seconds += (now - started).num_seconds().max(0) as u64;
                }
            }
            LeaderboardEntry {
                uid: uid.into(),
                member,
                effective_seconds,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.effective_seconds.cmp(&a.effective_seconds));
    entries
}

/// Live leaderboard of one group, backed by a remote subscription. Each
/// snapshot of the member collection arrives ranked; dropping the feed ends
/// the subscription.
pub struct LeaderboardFeed {
    subscription: Subscription,
    clock: Arc<dyn Clock>,
}

impl LeaderboardFeed {
    pub async fn next(&mut self) -> Option<Vec<LeaderboardEntry>> {
        let snapshot = self.subscription.next().await?;
        let members = snapshot
            .into_iter()
            .filter_map(|(uid, document)| {
                from_document::<MemberUsage>(document)
                    .ok()
                    .map(|member| (uid, member))
            })
            .collect();
        Some(rank_members(members, self.clock.time()))
    }
}

impl GroupService {
    pub(crate) fn new(
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        uid: Arc<str>,
    ) -> Self {
        Self {
            local,
            remote,
            clock,
            uid,
        }
    }

    pub async fn groups(&self) -> Result<Vec<GroupRecord>> {
        self.local.groups(&self.uid).await
    }

    /// Creates a group with the caller as owner and sole member: the group
    /// document, the owner's reference and a zeroed usage record.
    pub async fn create_group(
        &self,
        name: &str,
        app_id: Option<Arc<str>>,
        goal_minutes: u32,
    ) -> Result<GroupRecord> {
        let owner_name = match self.remote.get(&paths::profile(&self.uid)).await? {
            Some(document) => from_document::<UserProfile>(document)?.name,
            None => "".into(),
        };

        let group = GroupRecord {
            group_id: Uuid::new_v4().to_string().into(),
            name: name.into(),
            owner_id: self.uid.clone(),
            member_ids: vec![self.uid.clone()],
            app_id,
            goal_minutes,
        };
        self.remote
            .set(&paths::group(&group.group_id), to_document(&group)?)
            .await?;
        self.remote
            .set(
                &paths::user_group(&self.uid, &group.group_id),
                group_reference(&group.group_id),
            )
            .await?;
        self.remote
            .set(
                &paths::group_member(&group.group_id, &self.uid),
                to_document(&MemberUsage::fresh(owner_name))?,
            )
            .await?;

        let mut groups = self.local.groups(&self.uid).await?;
        groups.retain(|known| known.group_id != group.group_id);
        groups.push(group.clone());
        self.local.save_groups(&self.uid, &groups).await?;
        Ok(group)
    }

    /// Adds members to the group: a transactional union on `memberIds`, then
    /// an initialized usage record and a group reference per newcomer.
    pub async fn add_members(&self, group_id: &str, members: &[FriendRecord]) -> Result<()> {
        let joining: Vec<Arc<str>> = members.iter().map(|member| member.uid.clone()).collect();
        self.remote
            .transact(
                &paths::group(group_id),
                Box::new(move |current| {
                    let mut doc = current?;
                    let mut ids = doc
                        .get("memberIds")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for uid in joining {
                        if !ids.iter().any(|known| known.as_str() == Some(&*uid)) {
                            ids.push(json!(&*uid));
                        }
                    }
                    doc.insert("memberIds".into(), Value::Array(ids));
                    Some(doc)
                }),
            )
            .await?;

        for member in members {
            self.remote
                .set(
                    &paths::group_member(group_id, &member.uid),
                    to_document(&MemberUsage::fresh(member.name.clone()))?,
                )
                .await?;
            self.remote
                .set(
                    &paths::user_group(&member.uid, group_id),
                    group_reference(group_id),
                )
                .await?;
        }

        self.reload_local(group_id).await
    }

    /// Drops the caller out of the group. The last member out deletes the
    /// group document itself; the caller's reference and usage record go
    /// either way.
    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        let uid = self.uid.clone();
        self.remote
            .transact(
                &paths::group(group_id),
                Box::new(move |current| {
                    let mut doc = current?;
                    let remaining: Vec<Value> = doc
                        .get("memberIds")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|member| member.as_str() != Some(&*uid))
                        .collect();
                    doc.insert("memberIds".into(), Value::Array(remaining));
                    Some(doc)
                }),
            )
            .await?;

        let emptied = match self.remote.get(&paths::group(group_id)).await? {
            Some(doc) => doc
                .get("memberIds")
                .and_then(Value::as_array)
                .map(Vec::is_empty)
                .unwrap_or(true),
            None => false,
        };
        if emptied {
            self.remote.delete(&paths::group(group_id)).await?;
        }

        self.remote
            .delete(&paths::user_group(&self.uid, group_id))
            .await?;
        self.remote
            .delete(&paths::group_member(group_id, &self.uid))
            .await?;

        let mut groups = self.local.groups(&self.uid).await?;
        groups.retain(|known| &*known.group_id != group_id);
        self.local.save_groups(&self.uid, &groups).await
    }

    /// Deletes the group and every member's reference and usage record.
    /// Only the owner may do this; anyone else is ignored.
    pub async fn delete_group(&self, group_id: &str) -> Result<()> {
        let Some(document) = self.remote.get(&paths::group(group_id)).await? else {
            return Ok(());
        };
        let group: GroupRecord = from_document(document)?;
        if group.owner_id != self.uid {
            warn!("Ignoring delete of group {group_id}: not the owner");
            return Ok(());
        }

        for member in &group.member_ids {
            self.remote
                .delete(&paths::group_member(group_id, member))
                .await?;
            self.remote
                .delete(&paths::user_group(member, group_id))
                .await?;
        }
        self.remote.delete(&paths::group(group_id)).await?;

        let mut groups = self.local.groups(&self.uid).await?;
        groups.retain(|known| &*known.group_id != group_id);
        self.local.save_groups(&self.uid, &groups).await
    }

    pub async fn goal_minutes(&self, group_id: &str) -> Result<u32> {
        let groups = self.local.groups(&self.uid).await?;
        Ok(groups
            .iter()
            .find(|group| &*group.group_id == group_id)
            .map(|group| group.goal_minutes)
            .unwrap_or(0))
    }

    /// Points the group at an app and daily limit. Applied remotely first,
    /// then mirrored into the local group list.
    pub async fn set_goal_minutes(
        &self,
        group_id: &str,
        app_id: Option<Arc<str>>,
        goal_minutes: u32,
    ) -> Result<()> {
        let app_for_update = app_id.clone();
        self.remote
            .transact(
                &paths::group(group_id),
                Box::new(move |current| {
                    let mut doc = current?;
                    let app = match &app_for_update {
                        Some(app) => json!(&**app),
                        None => Value::Null,
                    };
                    doc.insert("appId".into(), app);
                    doc.insert("goalMinutes".into(), json!(goal_minutes));
                    Some(doc)
                }),
            )
            .await?;

        let mut groups = self.local.groups(&self.uid).await?;
        if let Some(group) = groups.iter_mut().find(|group| &*group.group_id == group_id) {
            group.app_id = app_id;
            group.goal_minutes = goal_minutes;
        }
        self.local.save_groups(&self.uid, &groups).await
    }

    /// One-shot read of every member's usage record.
    pub async fn members(&self, group_id: &str) -> Result<Vec<(String, MemberUsage)>> {
        let listed = self.remote.list(&paths::group_members(group_id)).await?;
        Ok(listed
            .into_iter()
            .filter_map(|(uid, document)| {
                from_document::<MemberUsage>(document)
                    .ok()
                    .map(|member| (uid, member))
            })
            .collect())
    }

    /// Subscribes to the member collection, delivering ranked snapshots as
    /// they change.
    pub async fn leaderboard(&self, group_id: &str) -> Result<LeaderboardFeed> {
        let subscription = self.remote.subscribe(&paths::group_members(group_id)).await?;
        Ok(LeaderboardFeed {
            subscription,
            clock: self.clock.clone(),
        })
    }

    /// Refreshes the local copy of one group from its remote document.
    async fn reload_local(&self, group_id: &str) -> Result<()> {
        let Some(document) = self.remote.get(&paths::group(group_id)).await? else {
            return Ok(());
        };
        let mut group: GroupRecord = from_document(document)?;
        if group.group_id.is_empty() {
            group.group_id = group_id.into();
        }
        let mut groups = self.local.groups(&self.uid).await?;
        groups.retain(|known| &*known.group_id != group_id);
        groups.push(group);
        self.local.save_groups(&self.uid, &groups).await
    }
}

fn group_reference(group_id: &str) -> Document {
    let mut reference = Document::new();
    reference.insert("groupId".into(), json!(group_id));
    reference
}
