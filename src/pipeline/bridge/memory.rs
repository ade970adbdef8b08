//! In-process queue and status store.
//!
//! Used by tests and by single-process deployments (`gitbit all` with the
//! memory backend). Semantics mirror the Redis list/hash commands.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{StatusStore, WorkQueue};
use crate::errors::BridgeError;

#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.lists
            .lock()
            .map(|lists| lists.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Snapshot of a list, head first.
    pub fn items(&self, queue: &str) -> Vec<String> {
        self.lists
            .lock()
            .map(|lists| {
                lists
                    .get(queue)
                    .map(|items| items.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn try_pop(&self, queue: &str) -> Result<Option<String>, BridgeError> {
        let mut lists = self
            .lists
            .lock()
            .map_err(|_| BridgeError::QueueUnavailable("queue lock poisoned".into()))?;
        Ok(lists.get_mut(queue).and_then(VecDeque::pop_back))
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, queue: &str, value: &str) -> Result<(), BridgeError> {
        {
            let mut lists = self
                .lists
                .lock()
                .map_err(|_| BridgeError::QueueUnavailable("queue lock poisoned".into()))?;
            lists
                .entry(queue.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, queue: &str) -> Result<String, BridgeError> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(queue)? {
                return Ok(value);
            }
            notified.await;
        }
    }
}

#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set_field(&self, id: &str, field: &str, value: &str) -> Result<(), BridgeError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| BridgeError::StoreUnavailable("status lock poisoned".into()))?;
        records
            .entry(id.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn get_field(&self, id: &str, field: &str) -> Result<Option<String>, BridgeError> {
        let records = self
            .records
            .lock()
            .map_err(|_| BridgeError::StoreUnavailable("status lock poisoned".into()))?;
        Ok(records.get(id).and_then(|r| r.get(field).cloned()))
    }
}
