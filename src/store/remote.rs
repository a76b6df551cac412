use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A stored document. Always a JSON object on the wire.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Documents of one collection, sorted by document id.
pub type CollectionSnapshot = Vec<(String, Document)>;

/// Read-modify-write closure passed to [RemoteStore::transact]. Returning
/// `None` leaves the document untouched.
pub type TransactFn = Box<dyn FnOnce(Option<Document>) -> Option<Document> + Send>;

/// Interface for abstracting the remote document store.
///
/// Documents live under slash-separated paths alternating collection and
/// document id, mirroring the hosted store's layout (see [paths]). All
/// methods are point operations; consistency across documents is only
/// guaranteed by [RemoteStore::transact] on a single document.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, doc: &DocPath) -> Result<Option<Document>>;

    /// Overwrites the whole document. Last write wins.
    async fn set(&self, doc: &DocPath, value: Document) -> Result<()>;

    /// Deleting a missing document is not an error.
    async fn delete(&self, doc: &DocPath) -> Result<()>;

    async fn list(&self, collection: &CollectionPath) -> Result<CollectionSnapshot>;

    /// Document with the greatest id, if any. Date-keyed collections name
    /// their documents `YYYY-MM-DD`, so this is the chronologically newest
    /// entry.
    async fn latest(&self, collection: &CollectionPath) -> Result<Option<(String, Document)>>;

    /// Atomic read-modify-write of a single document.
    async fn transact(&self, doc: &DocPath, update: TransactFn) -> Result<()>;

    /// Streams snapshots of a collection, starting with its current state.
    /// The subscription stops when the handle is dropped.
    async fn subscribe(&self, collection: &CollectionPath) -> Result<Subscription>;
}

/// Handle to a live collection subscription. The consumer owns its
/// lifecycle: dropping the handle cancels the producer.
pub struct Subscription {
    receiver: mpsc::Receiver<CollectionSnapshot>,
    _stop: DropGuard,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<CollectionSnapshot>, stop: CancellationToken) -> Self {
        Self {
            receiver,
            _stop: stop.drop_guard(),
        }
    }

    /// Next snapshot, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<CollectionSnapshot> {
        self.receiver.recv().await
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DocPath(Arc<str>);

impl DocPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment, the document id.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((collection, _)) => CollectionPath(collection.into()),
            None => CollectionPath(self.0.clone()),
        }
    }
}

impl fmt::Debug for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocPath({})", self.0)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(Arc<str>);

impl CollectionPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{}", self.0, id).into())
    }
}

impl fmt::Debug for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionPath({})", self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Document layout of the store.
///
/// ```text
/// users/{uid}                               account marker
/// users/{uid}/profile/main                  profile
/// users/{uid}/dailyRecords/{date}           usage snapshots
/// users/{uid}/goalHistory/{date}            goal snapshots
/// users/{uid}/friends/{friendUid}
/// users/{uid}/friendRequests/{fromUid}      received requests
/// users/{uid}/friendRequestsSent/{toUid}
/// users/{uid}/groups/{groupId}              membership references
/// groups/{groupId}                          group records
/// groups/{groupId}/members/{uid}            live member usage
/// ```
pub mod paths {
    use chrono::NaiveDate;

    use crate::utils::time::date_key;

    use super::{CollectionPath, DocPath};

    pub fn users() -> CollectionPath {
        CollectionPath("users".into())
    }

    pub fn user(uid: &str) -> DocPath {
        users().doc(uid)
    }

    pub fn profile(uid: &str) -> DocPath {
        CollectionPath(format!("users/{uid}/profile").into()).doc("main")
    }

    pub fn daily_records(uid: &str) -> CollectionPath {
        CollectionPath(format!("users/{uid}/dailyRecords").into())
    }

    pub fn daily_record(uid: &str, date: NaiveDate) -> DocPath {
        daily_records(uid).doc(&date_key(date))
    }

    pub fn goal_history(uid: &str) -> CollectionPath {
        CollectionPath(format!("users/{uid}/goalHistory").into())
    }

    pub fn goal_history_entry(uid: &str, date: NaiveDate) -> DocPath {
        goal_history(uid).doc(&date_key(date))
    }

    pub fn friends(uid: &str) -> CollectionPath {
        CollectionPath(format!("users/{uid}/friends").into())
    }

    pub fn friend(uid: &str, friend_uid: &str) -> DocPath {
        friends(uid).doc(friend_uid)
    }

    pub fn friend_requests(uid: &str) -> CollectionPath {
        CollectionPath(format!("users/{uid}/friendRequests").into())
    }

    pub fn friend_request(uid: &str, from_uid: &str) -> DocPath {
        friend_requests(uid).doc(from_uid)
    }

    pub fn friend_requests_sent(uid: &str) -> CollectionPath {
        CollectionPath(format!("users/{uid}/friendRequestsSent").into())
    }

    pub fn friend_request_sent(uid: &str, to_uid: &str) -> DocPath {
        friend_requests_sent(uid).doc(to_uid)
    }

    pub fn user_groups(uid: &str) -> CollectionPath {
        CollectionPath(format!("users/{uid}/groups").into())
    }

    pub fn user_group(uid: &str, group_id: &str) -> DocPath {
        user_groups(uid).doc(group_id)
    }

    pub fn groups() -> CollectionPath {
        CollectionPath("groups".into())
    }

    pub fn group(group_id: &str) -> DocPath {
        groups().doc(group_id)
    }

    pub fn group_members(group_id: &str) -> CollectionPath {
        CollectionPath(format!("groups/{group_id}/members").into())
    }

    pub fn group_member(group_id: &str, uid: &str) -> DocPath {
        group_members(group_id).doc(uid)
    }
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value).context("serializing document")? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("expected a document object, got {other}"),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T> {
    T::deserialize(serde_json::Value::Object(document)).context("deserializing document")
}
