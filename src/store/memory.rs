use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::remote::{
    CollectionPath, CollectionSnapshot, DocPath, Document, RemoteStore, Subscription, TransactFn,
};

const SUBSCRIPTION_BUFFER: usize = 64;

/// In-memory [RemoteStore]. Backs tests and accounts that have no sync
/// backend configured; contents vanish with the process.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    documents: BTreeMap<String, Document>,
    watchers: Vec<Watcher>,
    failing: Vec<String>,
}

struct Watcher {
    collection: String,
    sender: mpsc::Sender<CollectionSnapshot>,
    stop: CancellationToken,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation under `prefix` fail, for exercising callers
    /// that must survive partial outages.
    pub fn fail_path(&self, prefix: impl Into<String>) {
        self.lock_state().failing.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.lock_state().failing.clear();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl State {
    fn check(&self, path: &str) -> Result<()> {
        if self.failing.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            bail!("remote store unavailable for {path}");
        }
        Ok(())
    }

    /// Direct children of `collection`, sorted by document id.
    fn snapshot(&self, collection: &str) -> CollectionSnapshot {
        let prefix = format!("{collection}/");
        self.documents
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, doc)| (key[prefix.len()..].to_string(), doc.clone()))
            .collect()
    }

    fn notify(&mut self, collection: &str) {
        self.watchers.retain(|watcher| !watcher.stop.is_cancelled());
        let snapshot = self.snapshot(collection);
        for watcher in &self.watchers {
            if watcher.collection == collection {
                let _ = watcher.sender.try_send(snapshot.clone());
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, doc: &DocPath) -> Result<Option<Document>> {
        let state = self.lock_state();
        state.check(doc.as_str())?;
        Ok(state.documents.get(doc.as_str()).cloned())
    }

    async fn set(&self, doc: &DocPath, value: Document) -> Result<()> {
        let mut state = self.lock_state();
        state.check(doc.as_str())?;
        state.documents.insert(doc.as_str().to_string(), value);
        state.notify(doc.parent().as_str());
        Ok(())
    }

    async fn delete(&self, doc: &DocPath) -> Result<()> {
        let mut state = self.lock_state();
        state.check(doc.as_str())?;
        state.documents.remove(doc.as_str());
        state.notify(doc.parent().as_str());
        Ok(())
    }

    async fn list(&self, collection: &CollectionPath) -> Result<CollectionSnapshot> {
        let state = self.lock_state();
        state.check(collection.as_str())?;
        Ok(state.snapshot(collection.as_str()))
    }

    async fn latest(&self, collection: &CollectionPath) -> Result<Option<(String, Document)>> {
        let state = self.lock_state();
        state.check(collection.as_str())?;
        Ok(state.snapshot(collection.as_str()).into_iter().next_back())
    }

    async fn transact(&self, doc: &DocPath, update: TransactFn) -> Result<()> {
        let mut state = self.lock_state();
        state.check(doc.as_str())?;
        let current = state.documents.get(doc.as_str()).cloned();
        if let Some(next) = update(current) {
            state.documents.insert(doc.as_str().to_string(), next);
            state.notify(doc.parent().as_str());
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &CollectionPath) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let stop = CancellationToken::new();
        let mut state = self.lock_state();
        state.check(collection.as_str())?;
        let initial = state.snapshot(collection.as_str());
        let _ = sender.try_send(initial);
        state.watchers.push(Watcher {
            collection: collection.as_str().to_string(),
            sender,
            stop: stop.clone(),
        });
        Ok(Subscription::new(receiver, stop))
    }
}
