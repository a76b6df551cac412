use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;
use uuid::Uuid;

use crate::store::entities::{FriendRecord, FriendRequest, RequestStatus, UserProfile};
use crate::store::local::LocalStore;
use crate::store::remote::{from_document, paths, to_document, Document, RemoteStore};
use crate::utils::clock::Clock;

/// Friend list and friend-request handling for one signed-in user. Remote
/// documents are the shared truth; the local store mirrors what this device
/// last saw.
pub struct FriendService {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    uid: Arc<str>,
}

impl FriendService {
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

    /// Replaces the local friend list with the remote one. Entries without
    /// a uid are unusable and dropped.
    pub async fn load_friends(&self) -> Result<()> {
        let listed = self.remote.list(&paths::friends(&self.uid)).await?;
        let friends: Vec<FriendRecord> = listed
            .into_iter()
            .filter_map(|(_, document)| friend_record(document))
            .collect();
        self.local.save_friends(&self.uid, &friends).await
    }

    pub async fn friends(&self) -> Result<Vec<FriendRecord>> {
        self.local.friends(&self.uid).await
    }

    pub async fn add_friend(&self, friend: &FriendRecord) -> Result<()> {
        self.remote
            .set(&paths::friend(&self.uid, &friend.uid), to_document(friend)?)
            .await?;
        let mut friends = self.local.friends(&self.uid).await?;
        friends.retain(|known| known.uid != friend.uid);
        friends.push(friend.clone());
        self.local.save_friends(&self.uid, &friends).await
    }

    pub async fn remove_friend(&self, friend_uid: &str) -> Result<()> {
        self.remote
            .delete(&paths::friend(&self.uid, friend_uid))
            .await?;
        let mut friends = self.local.friends(&self.uid).await?;
        friends.retain(|known| &*known.uid != friend_uid);
        self.local.save_friends(&self.uid, &friends).await
    }

    /// Replaces the local request mirrors, received and sent, with the
    /// remote state. The document id carries the counterparty uid.
    pub async fn load_requests(&self) -> Result<()> {
        let listed = self.remote.list(&paths::friend_requests(&self.uid)).await?;
        let received: Vec<FriendRequest> = listed
            .into_iter()
            .filter_map(|(id, document)| received_request(&self.uid, id, document))
            .collect();
        self.local
            .save_friend_requests(&self.uid, &received)
            .await?;

        let listed = self
            .remote
            .list(&paths::friend_requests_sent(&self.uid))
            .await?;
        let sent: Vec<FriendRequest> = listed
            .into_iter()
            .filter_map(|(id, document)| sent_request(&self.uid, id, document))
            .collect();
        self.local.save_sent_requests(&self.uid, &sent).await
    }

    pub async fn requests_received(&self) -> Result<Vec<FriendRequest>> {
        self.local.friend_requests(&self.uid).await
    }

    pub async fn requests_sent(&self) -> Result<Vec<FriendRequest>> {
        self.local.sent_requests(&self.uid).await
    }

    /// Sends a friend request to whoever owns `friend_code`. The request
    /// lands under the recipient keyed by our uid, and a sent marker lands
    /// under us keyed by theirs.
    pub async fn send_request(&self, friend_code: &str) -> Result<()> {
        let my_profile = self.profile_of(&self.uid).await?.unwrap_or_default();
        let from_name = my_profile.name;

        let Some(target) = self.find_profile_by_code(friend_code).await? else {
            bail!("no user with friend code {friend_code}");
        };

        let timestamp = self.clock.time().timestamp_millis();
        let mut received = Document::new();
        received.insert("fromUid".into(), json!(&*self.uid));
        received.insert("fromName".into(), json!(&*from_name));
        received.insert("timestamp".into(), json!(timestamp));
        self.remote
            .set(&paths::friend_request(&target.uid, &self.uid), received)
            .await?;

        let mut sent = Document::new();
        sent.insert("toUid".into(), json!(&*target.uid));
        sent.insert("toName".into(), json!(&*target.name));
        sent.insert("fromUid".into(), json!(&*self.uid));
        sent.insert("fromName".into(), json!(&*from_name));
        sent.insert("timestamp".into(), json!(timestamp));
        self.remote
            .set(&paths::friend_request_sent(&self.uid, &target.uid), sent)
            .await?;

        let mut requests = self.local.sent_requests(&self.uid).await?;
        requests.retain(|request| request.to_uid != target.uid);
        requests.push(FriendRequest {
            id: Uuid::new_v4().to_string(),
            from_uid: self.uid.clone(),
            to_uid: target.uid.clone(),
            from_name,
            to_name: target.name.clone(),
            from_photo_url: None,
            to_photo_url: None,
            status: RequestStatus::Pending,
        });
        self.local.save_sent_requests(&self.uid, &requests).await
    }

    /// Accepts a received request: both sides end up in each other's friend
    /// collections and both request documents disappear.
    pub async fn accept_request(&self, request: &FriendRequest) -> Result<()> {
        self.remote
            .delete(&paths::friend_request(&self.uid, &request.from_uid))
            .await?;

        let friend = FriendRecord {
            uid: request.from_uid.clone(),
            name: request.from_name.clone(),
            photo_url: request.from_photo_url.clone(),
        };
        self.add_friend(&friend).await?;

        let my_profile = self.profile_of(&self.uid).await?.unwrap_or_default();
        let me = FriendRecord {
            uid: self.uid.clone(),
            name: my_profile.name,
            photo_url: (!my_profile.image_url.is_empty()).then_some(my_profile.image_url),
        };
        self.remote
            .set(
                &paths::friend(&request.from_uid, &self.uid),
                to_document(&me)?,
            )
            .await?;

        self.remote
            .delete(&paths::friend_request_sent(&request.from_uid, &self.uid))
            .await?;

        let mut requests = self.local.friend_requests(&self.uid).await?;
        requests.retain(|pending| pending.from_uid != request.from_uid);
        self.local.save_friend_requests(&self.uid, &requests).await
    }

    /// Withdraws a request we sent earlier.
    pub async fn cancel_request(&self, request: &FriendRequest) -> Result<()> {
        self.remote
            .delete(&paths::friend_request_sent(&self.uid, &request.to_uid))
            .await?;
        self.remote
            .delete(&paths::friend_request(&request.to_uid, &self.uid))
            .await?;
        let mut requests = self.local.sent_requests(&self.uid).await?;
        requests.retain(|sent| sent.to_uid != request.to_uid);
        self.local.save_sent_requests(&self.uid, &requests).await
    }

    async fn profile_of(&self, uid: &str) -> Result<Option<UserProfile>> {
        let Some(document) = self.remote.get(&paths::profile(uid)).await? else {
            return Ok(None);
        };
        Ok(Some(from_document(document)?))
    }

    /// Friend codes are resolved by scanning profiles; the store keeps no
    /// index over them.
    async fn find_profile_by_code(&self, friend_code: &str) -> Result<Option<UserProfile>> {
        let users = self.remote.list(&paths::users()).await?;
        for (uid, _) in users {
            let Some(document) = self.remote.get(&paths::profile(&uid)).await? else {
                continue;
            };
            let mut profile: UserProfile = from_document(document)?;
            if profile.friend_code == friend_code {
                if profile.uid.is_empty() {
                    profile.uid = uid.into();
                }
                return Ok(Some(profile));
            }
        }
        Ok(None)
    }
}

/// Decodes a friend document, rejecting entries without a uid.
pub(crate) fn friend_record(document: Document) -> Option<FriendRecord> {
    let friend = from_document::<FriendRecord>(document).ok()?;
    (!friend.uid.is_empty()).then_some(friend)
}

/// Decodes a received-request document; its id carries the sender uid.
pub(crate) fn received_request(
    my_uid: &Arc<str>,
    id: String,
    document: Document,
) -> Option<FriendRequest> {
    let mut request = from_document::<FriendRequest>(document).ok()?;
    request.id = id.clone();
    if request.from_uid.is_empty() {
        request.from_uid = id.into();
    }
    request.to_uid = my_uid.clone();
    Some(request)
}

/// Decodes a sent-request document; its id carries the recipient uid.
pub(crate) fn sent_request(
    my_uid: &Arc<str>,
    id: String,
    document: Document,
) -> Option<FriendRequest> {
    let mut request = from_document::<FriendRequest>(document).ok()?;
    request.id = id.clone();
    request.from_uid = my_uid.clone();
    if request.to_uid.is_empty() {
        request.to_uid = id.into();
    }
    Some(request)
}
