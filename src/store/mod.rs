//! Shared state store contract.
//!
//! Documents are JSON objects addressed by `(collection, id)`; collections may
//! be nested under a document (`rooms/{code}/participants`). Subscriptions
//! deliver the full current document or document set on every change, never
//! diffs, and coalesce to the latest value when the reader falls behind.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub type Document = serde_json::Map<String, Value>;

/// A collection listing in store delivery order.
pub type DocumentSet = Vec<(String, Document)>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// One delivery on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot<T> {
    /// Nothing delivered yet.
    Pending,
    Ready(T),
    /// The store could not produce a snapshot; the state is unknown.
    Unavailable(String),
}

impl<T> Snapshot<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Snapshot<U> {
        match self {
            Snapshot::Pending => Snapshot::Pending,
            Snapshot::Ready(value) => Snapshot::Ready(f(value)),
            Snapshot::Unavailable(reason) => Snapshot::Unavailable(reason),
        }
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Snapshot::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Cancelable stream of snapshots.
pub struct Subscription<T> {
    rx: watch::Receiver<Snapshot<T>>,
    cancel: CancellationToken,
}

impl<T: Clone> Subscription<T> {
    pub fn new(rx: watch::Receiver<Snapshot<T>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Waits for the next delivery and returns the latest snapshot.
    ///
    /// Fails once the subscription is cancelled or the source goes away.
    pub async fn changed(&mut self) -> Result<Snapshot<T>> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Store("subscription cancelled".to_string())),
            res = self.rx.changed() => {
                res.map_err(|_| Error::Store("subscription source closed".to_string()))?;
                Ok(self.rx.borrow_and_update().clone())
            }
        }
    }

    pub fn latest(&self) -> Snapshot<T> {
        self.rx.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>>;

    /// Upsert: creates the document or overwrites only the named fields.
    async fn set(&self, path: &DocPath, fields: Document) -> Result<()>;

    /// Like `set`, but fails if the document does not exist.
    async fn update(&self, path: &DocPath, fields: Document) -> Result<()>;

    /// Deleting an absent document succeeds.
    async fn delete(&self, path: &DocPath) -> Result<()>;

    async fn list(&self, collection: &str) -> Result<DocumentSet>;

    async fn subscribe_document(&self, path: &DocPath) -> Result<Subscription<Option<Document>>>;

    async fn subscribe_collection(&self, collection: &str) -> Result<Subscription<DocumentSet>>;
}

/// Serializes a record or patch into document fields.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Store(format!("expected an object, got {other}"))),
    }
}
