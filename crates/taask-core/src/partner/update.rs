//! Locally queued changes awaiting flush to the partner.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use taask_common::MemberGroup;
use tokio::sync::Notify;

use crate::auth::SessionRecord;
use crate::task::{Task, TaskUpdate};

/// A batch of deltas exchanged between partners
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartnerUpdate {
    /// Newly created tasks, as they were before their first update
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub task_updates: Vec<TaskUpdate>,
    #[serde(default)]
    pub groups: Vec<MemberGroup>,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

impl PartnerUpdate {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.task_updates.is_empty()
            && self.groups.is_empty()
            && self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len() + self.task_updates.len() + self.groups.len() + self.sessions.len()
    }
}

/// The batch producers append to and the flusher swaps out.
///
/// `take` replaces the batch with an empty one under the same lock producers
/// append under, so a flushed batch is never observed half-written.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    batch: Mutex<PartnerUpdate>,
    notify: Notify,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PartnerUpdate> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_task(&self, task: Task) {
        self.lock().tasks.push(task);
        self.notify.notify_one();
    }

    pub fn push_task_update(&self, update: TaskUpdate) {
        self.lock().task_updates.push(update);
        self.notify.notify_one();
    }

    pub fn push_group(&self, group: MemberGroup) {
        self.lock().groups.push(group);
        self.notify.notify_one();
    }

    pub fn push_session(&self, session: SessionRecord) {
        self.lock().sessions.push(session);
        self.notify.notify_one();
    }

    /// Swap the queued batch for an empty one
    pub fn take(&self) -> PartnerUpdate {
        std::mem::take(&mut *self.lock())
    }

    /// Put a batch that couldn't be sent back in front of anything queued since
    pub fn requeue(&self, mut update: PartnerUpdate) {
        let mut batch = self.lock();
        update.tasks.append(&mut batch.tasks);
        update.task_updates.append(&mut batch.task_updates);
        update.groups.append(&mut batch.groups);
        update.sessions.append(&mut batch.sessions);
        *batch = update;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves after the next push (or immediately if one happened since the last wait)
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
