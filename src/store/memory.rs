//! In-process document store.
//!
//! Collections list in arrival order: a document keeps its position across
//! updates and moves to the end when deleted and re-created. Writes are
//! journaled and can be made to fail, which the room tests lean on.

use super::{DocPath, Document, DocumentSet, DocumentStore, Snapshot, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A journaled mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { path: DocPath, fields: Document },
    Delete { path: DocPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Delete { path } => path,
        }
    }
}

struct Entry {
    seq: u64,
    doc: Document,
}

struct DocWatcher {
    path: DocPath,
    tx: watch::Sender<Snapshot<Option<Document>>>,
    cancel: CancellationToken,
}

struct CollectionWatcher {
    collection: String,
    tx: watch::Sender<Snapshot<DocumentSet>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    docs: HashMap<DocPath, Entry>,
    next_seq: u64,
    doc_watchers: Vec<DocWatcher>,
    collection_watchers: Vec<CollectionWatcher>,
    write_failure: Option<String>,
    journal: Vec<WriteOp>,
}

impl State {
    fn list(&self, collection: &str) -> DocumentSet {
        let mut entries: Vec<(&DocPath, &Entry)> = self
            .docs
            .iter()
            .filter(|(path, _)| path.collection == collection)
            .collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(path, entry)| (path.id.clone(), entry.doc.clone()))
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        match &self.write_failure {
            Some(reason) => Err(Error::Store(reason.clone())),
            None => Ok(()),
        }
    }

    fn prune(&mut self) {
        self.doc_watchers
            .retain(|w| !w.cancel.is_cancelled() && !w.tx.is_closed());
        self.collection_watchers
            .retain(|w| !w.cancel.is_cancelled() && !w.tx.is_closed());
    }

    fn notify(&mut self, path: &DocPath) {
        self.prune();
        let doc = self.docs.get(path).map(|e| e.doc.clone());
        for watcher in self.doc_watchers.iter().filter(|w| &w.path == path) {
            watcher.tx.send_replace(Snapshot::Ready(doc.clone()));
        }
        if self
            .collection_watchers
            .iter()
            .any(|w| w.collection == path.collection)
        {
            let listing = self.list(&path.collection);
            for watcher in self
                .collection_watchers
                .iter()
                .filter(|w| w.collection == path.collection)
            {
                watcher.tx.send_replace(Snapshot::Ready(listing.clone()));
            }
        }
    }

    fn merge(&mut self, path: &DocPath, fields: Document) {
        match self.docs.get_mut(path) {
            Some(entry) => entry.doc.extend(fields.clone()),
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.docs.insert(
                    path.clone(),
                    Entry {
                        seq,
                        doc: fields.clone(),
                    },
                );
            }
        }
        self.journal.push(WriteOp::Set {
            path: path.clone(),
            fields,
        });
        self.notify(path);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `set`/`update`/`delete` fails with this reason.
    pub async fn fail_writes(&self, reason: Option<&str>) {
        self.state.lock().await.write_failure = reason.map(str::to_string);
    }

    /// Pushes an `Unavailable` snapshot to every live subscription.
    pub async fn interrupt(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.prune();
        for watcher in &state.doc_watchers {
            watcher.tx.send_replace(Snapshot::Unavailable(reason.to_string()));
        }
        for watcher in &state.collection_watchers {
            watcher.tx.send_replace(Snapshot::Unavailable(reason.to_string()));
        }
    }

    /// Mutations applied so far, oldest first.
    pub async fn journal(&self) -> Vec<WriteOp> {
        self.state.lock().await.journal.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune();
        state.doc_watchers.len() + state.collection_watchers.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        Ok(self.state.lock().await.docs.get(path).map(|e| e.doc.clone()))
    }

    async fn set(&self, path: &DocPath, fields: Document) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        state.merge(path, fields);
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Document) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        if !state.docs.contains_key(path) {
            return Err(Error::Store(format!("no document at {path}")));
        }
        state.merge(path, fields);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        if state.docs.remove(path).is_some() {
            debug!(%path, "document deleted");
            state.journal.push(WriteOp::Delete { path: path.clone() });
            state.notify(path);
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<DocumentSet> {
        Ok(self.state.lock().await.list(collection))
    }

    async fn subscribe_document(&self, path: &DocPath) -> Result<Subscription<Option<Document>>> {
        let mut state = self.state.lock().await;
        let (tx, rx) = watch::channel(Snapshot::Pending);
        tx.send_replace(Snapshot::Ready(state.docs.get(path).map(|e| e.doc.clone())));
        let cancel = CancellationToken::new();
        state.doc_watchers.push(DocWatcher {
            path: path.clone(),
            tx,
            cancel: cancel.clone(),
        });
        Ok(Subscription::new(rx, cancel))
    }

    async fn subscribe_collection(&self, collection: &str) -> Result<Subscription<DocumentSet>> {
        let mut state = self.state.lock().await;
        let (tx, rx) = watch::channel(Snapshot::Pending);
        tx.send_replace(Snapshot::Ready(state.list(collection)));
        let cancel = CancellationToken::new();
        state.collection_watchers.push(CollectionWatcher {
            collection: collection.to_string(),
            tx,
            cancel: cancel.clone(),
        });
        Ok(Subscription::new(rx, cancel))
    }
}
