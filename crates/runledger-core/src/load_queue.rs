//! Load queue bookkeeping for performance testcases.
//!
//! A load queue is a named group of virtual-user threads inside a testcase.
//! Threads are bound to a queue by name, and checkpoints are keyed by
//! `(thread, checkpoint name)` so two threads may run the same checkpoint
//! concurrently.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::event::EntityId;
use crate::sink::CheckpointInfo;

#[derive(Debug, Clone, Default)]
pub struct LoadQueuesState {
    /// name → load queue id
    queues: HashMap<String, EntityId>,
    /// thread → load queue name
    threads: HashMap<String, String>,
    /// (thread, checkpoint name) → started checkpoint
    checkpoints: HashMap<(String, String), CheckpointInfo>,
}

impl LoadQueuesState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a load queue. A second queue with the same name is
    /// rejected and the first one keeps its id.
    pub fn remember(&mut self, name: &str, load_queue_id: EntityId) -> Result<()> {
        if self.queues.contains_key(name) {
            return Err(Error::AlreadyRunningConflict {
                name: name.to_string(),
            });
        }
        self.queues.insert(name.to_string(), load_queue_id);
        Ok(())
    }

    #[must_use]
    pub fn load_queue_id(&self, name: &str) -> Option<EntityId> {
        self.queues.get(name).copied()
    }

    /// Bind `thread` to the running queue `load_queue`. Rebinding replaces
    /// the previous binding.
    pub fn register_thread(&mut self, thread: &str, load_queue: &str) -> Result<()> {
        if !self.queues.contains_key(load_queue) {
            return Err(Error::UnknownLoadQueue(load_queue.to_string()));
        }
        self.threads
            .insert(thread.to_string(), load_queue.to_string());
        Ok(())
    }

    /// Id of the running queue `thread` is bound to.
    #[must_use]
    pub fn load_queue_for_thread(&self, thread: &str) -> Option<EntityId> {
        self.threads
            .get(thread)
            .and_then(|name| self.queues.get(name))
            .copied()
    }

    pub fn start_checkpoint(&mut self, started: CheckpointInfo) {
        let key = (started.thread.clone(), started.name.clone());
        self.checkpoints.insert(key, started);
    }

    /// Stop tracking a started checkpoint and hand it back.
    pub fn end_checkpoint(&mut self, thread: &str, name: &str) -> Result<CheckpointInfo> {
        if !self.threads.contains_key(thread) {
            return Err(Error::ThreadNotRegistered(thread.to_string()));
        }
        self.checkpoints
            .remove(&(thread.to_string(), name.to_string()))
            .ok_or_else(|| Error::UnknownCheckpoint {
                thread: thread.to_string(),
                name: name.to_string(),
            })
    }

    /// Forget a queue along with its thread bindings and open checkpoints.
    pub fn remove(&mut self, name: &str) -> Result<EntityId> {
        let load_queue_id = self
            .queues
            .remove(name)
            .ok_or_else(|| Error::UnknownLoadQueue(name.to_string()))?;
        self.threads.retain(|_, queue| queue != name);
        self.checkpoints
            .retain(|_, started| started.load_queue_id != load_queue_id);
        Ok(load_queue_id)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.threads.clear();
        self.checkpoints.clear();
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    #[must_use]
    pub fn open_checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.threads.is_empty() && self.checkpoints.is_empty()
    }
}
