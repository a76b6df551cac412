use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::utils::clock::Clock;

use super::json_file::{open_locked, parse_json, read_json, rewrite, write_json};
use super::remote::{
    CollectionPath, CollectionSnapshot, DocPath, Document, RemoteStore, Subscription, TransactFn,
};

const SUBSCRIPTION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SUBSCRIPTION_BUFFER: usize = 8;

/// [RemoteStore] over a directory tree, one JSON file per document and one
/// directory per collection. Pointing several devices at the same shared
/// folder gives a small-scale sync backend; file locks keep concurrent
/// writers from interleaving.
pub struct FsRemoteStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsRemoteStore {
    pub fn new(root: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;

        Ok(Self { root, clock })
    }

    fn document_file(&self, doc: &DocPath) -> PathBuf {
        self.root.join(format!("{}.json", doc.as_str()))
    }

    fn collection_dir(&self, collection: &CollectionPath) -> PathBuf {
        self.root.join(collection.as_str())
    }
}

#[async_trait]
impl RemoteStore for FsRemoteStore {
    async fn get(&self, doc: &DocPath) -> Result<Option<Document>> {
        read_json(&self.document_file(doc)).await
    }

    async fn set(&self, doc: &DocPath, value: Document) -> Result<()> {
        write_json(&self.document_file(doc), &value).await
    }

    async fn delete(&self, doc: &DocPath) -> Result<()> {
        match tokio::fs::remove_file(self.document_file(doc)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, collection: &CollectionPath) -> Result<CollectionSnapshot> {
        list_dir(&self.collection_dir(collection)).await
    }

    async fn latest(&self, collection: &CollectionPath) -> Result<Option<(String, Document)>> {
        let mut entries = match tokio::fs::read_dir(self.collection_dir(collection)).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut newest: Option<(String, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = document_id(&path) else {
                continue;
            };
            if newest.as_ref().map(|(max, _)| id > *max).unwrap_or(true) {
                newest = Some((id, path));
            }
        }
        match newest {
            Some((id, path)) => Ok(read_json(&path).await?.map(|doc| (id, doc))),
            None => Ok(None),
        }
    }

    async fn transact(&self, doc: &DocPath, update: TransactFn) -> Result<()> {
        let path = self.document_file(doc);
        let mut file = open_locked(&path).await?;
        let result = transact_locked(&mut file, &path, update).await;
        file.unlock_async().await?;
        result
    }

    async fn subscribe(&self, collection: &CollectionPath) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let stop = CancellationToken::new();
        tokio::spawn(poll_collection(
            self.collection_dir(collection),
            self.clock.clone(),
            sender,
            stop.clone(),
        ));
        Ok(Subscription::new(receiver, stop))
    }
}

async fn transact_locked(file: &mut File, path: &Path, update: TransactFn) -> Result<()> {
    let mut contents = String::new();
    file.read_to_string(&mut contents).await?;
    let current = parse_json(&contents, path);
    match update(current) {
        Some(next) => rewrite(file, &next).await,
        None => Ok(()),
    }
}

fn document_id(path: &Path) -> Option<String> {
    if path.extension().and_then(|v| v.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|v| v.to_str())
        .map(str::to_string)
}

async fn list_dir(dir: &Path) -> Result<CollectionSnapshot> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    let mut documents = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(id) = document_id(&path) else {
            continue;
        };
        if let Some(document) = read_json(&path).await? {
            documents.push((id, document));
        }
    }
    documents.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(documents)
}

async fn poll_collection(
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    sender: mpsc::Sender<CollectionSnapshot>,
    stop: CancellationToken,
) {
    let mut previous: Option<CollectionSnapshot> = None;
    let mut poll_point = clock.instant();
    loop {
        match list_dir(&dir).await {
            Ok(snapshot) => {
                if previous.as_ref() != Some(&snapshot) {
                    if sender.send(snapshot.clone()).await.is_err() {
                        return;
                    }
                    previous = Some(snapshot);
                }
            }
            Err(e) => warn!("Watching {dir:?} failed: {e}"),
        }

        poll_point += SUBSCRIPTION_POLL_INTERVAL;
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = clock.sleep_until(poll_point) => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::store::remote::{paths, Document, RemoteStore};
    use crate::utils::clock::DefaultClock;
    use crate::utils::logging::TEST_LOGGING;

    use super::FsRemoteStore;

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn store(dir: &std::path::Path) -> FsRemoteStore {
        FsRemoteStore::new(dir.to_owned(), Arc::new(DefaultClock)).unwrap()
    }

    #[tokio::test]
    async fn documents_round_trip_through_files() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let store = store(dir.path());
        let path = paths::daily_record("u1", chrono::NaiveDate::from_ymd_opt(2025, 3, 7).unwrap());

        assert!(store.get(&path).await?.is_none());
        store
            .set(&path, doc(json!({"date": "2025-03-07", "appUsages": {}})))
            .await?;
        let read = store.get(&path).await?.unwrap();
        assert_eq!(read["date"], json!("2025-03-07"));

        store.delete(&path).await?;
        assert!(store.get(&path).await?.is_none());
        store.delete(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_files_read_as_missing() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let store = store(dir.path());
        let users = dir.path().join("users");
        std::fs::create_dir_all(&users)?;
        std::fs::write(users.join("broken.json"), b"{\"name\": ")?;
        std::fs::write(users.join("empty.json"), b"")?;
        std::fs::write(users.join("ok.json"), b"{\"name\": \"ada\"}")?;

        assert!(store.get(&paths::user("broken")).await?.is_none());

        let listed = store.list(&paths::users()).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn latest_reads_only_the_newest_document() -> Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let history = paths::goal_history("u1");
        for date in ["2024-12-31", "2025-01-01", "2024-05-20"] {
            store
                .set(&history.doc(date), doc(json!({"date": date})))
                .await?;
        }
        let (id, document) = store.latest(&history).await?.unwrap();
        assert_eq!(id, "2025-01-01");
        assert_eq!(document["date"], json!("2025-01-01"));
        Ok(())
    }

    #[tokio::test]
    async fn transact_applies_update_in_place() -> Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let member = paths::group_member("g1", "u1");
        store.set(&member, doc(json!({"usageSeconds": 10}))).await?;

        store
            .transact(
                &member,
                Box::new(|current| {
                    let mut map = current.unwrap();
                    let seconds = map["usageSeconds"].as_u64().unwrap();
                    map.insert("usageSeconds".into(), json!(seconds + 5));
                    Some(map)
                }),
            )
            .await?;
        // a pass that bails out leaves the document alone
        store.transact(&member, Box::new(|_| None)).await?;

        let read = store.get(&member).await?.unwrap();
        assert_eq!(read["usageSeconds"], json!(15));
        Ok(())
    }

    // Writers block on the file lock, so they need real worker threads.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transacts_do_not_lose_increments() -> Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(store(dir.path()));
        let member = paths::group_member("g1", "u1");
        store.set(&member, doc(json!({"usageSeconds": 0}))).await?;

        let writers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                let member = member.clone();
                tokio::spawn(async move {
                    store
                        .transact(
                            &member,
                            Box::new(|current| {
                                let mut map = current.unwrap();
                                let seconds = map["usageSeconds"].as_u64().unwrap();
                                map.insert("usageSeconds".into(), json!(seconds + 1));
                                Some(map)
                            }),
                        )
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await??;
        }

        let read = store.get(&member).await?.unwrap();
        assert_eq!(read["usageSeconds"], json!(3));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_notices_new_documents() -> Result<()> {
        let _ = &*TEST_LOGGING;
        let dir = tempdir()?;
        let store = store(dir.path());
        let members = paths::group_members("g1");
        store
            .set(&members.doc("u1"), doc(json!({"name": "ada"})))
            .await?;

        let mut subscription = store.subscribe(&members).await?;
        let initial = subscription.next().await.unwrap();
        assert_eq!(initial.len(), 1);

        store
            .set(&members.doc("u2"), doc(json!({"name": "grace"})))
            .await?;
        let updated = subscription.next().await.unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[1].0, "u2");
        Ok(())
    }
}
