//! The shared work queue.
//!
//! The control plane publishes one [`QueueItem`] per pipeline build. A
//! worker only claims items whose routing labels are a subset of the
//! routes it offers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use buildhand_core::{BuildRecord, Pipeline};

use crate::WorkerResult;

/// Repository metadata carried with a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Repo {
    /// Repository full name ("org/name")
    pub full_name: String,
    /// Branch the build runs for
    pub branch: String,
}

/// A pipeline build envelope published to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// The build record to execute
    pub build: BuildRecord,
    /// Repository metadata
    pub repo: Repo,
    /// The compiled pipeline
    pub pipeline: Pipeline,
    /// User that triggered the build
    pub user: Option<String>,
    /// Event that triggered the build
    pub event: String,
    /// Routing labels; all must be offered by the claiming worker
    pub routes: Vec<String>,
}

impl QueueItem {
    /// True when every route of the item is offered by the worker.
    #[must_use]
    pub fn routable_to(&self, offered: &[String]) -> bool {
        self.routes.iter().all(|r| offered.contains(r))
    }
}

/// A queue the worker can claim build items from.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Publishes an item.
    async fn push(&self, item: QueueItem) -> WorkerResult<()>;

    /// Claims the oldest item routable to the offered labels, if any.
    async fn pop(&self, offered: &[String]) -> WorkerResult<Option<QueueItem>>;
}

/// FIFO in-memory queue.
#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    /// True when no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn push(&self, item: QueueItem) -> WorkerResult<()> {
        self.items.lock().expect("queue lock poisoned").push_back(item);
        Ok(())
    }

    async fn pop(&self, offered: &[String]) -> WorkerResult<Option<QueueItem>> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        let position = items.iter().position(|item| item.routable_to(offered));
        Ok(position.and_then(|i| items.remove(i)))
    }
}
