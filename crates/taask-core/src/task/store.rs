//! In-memory task store for an authority.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use taask_common::{Result, TaaskError, TaskStatus};
use tokio::sync::RwLock;

use super::{Task, TaskUpdate};
use crate::auth::AuthManager;
use crate::partner::{ApplyReport, PartnerUpdate, ReplicaSink, UpdateQueue};

/// Tasks held by an authority, plus the hooks that replicate them.
///
/// Locally accepted changes are queued for the partner (if one is attached);
/// changes applied from a partner are not queued again.
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    /// Receives replicated groups and sessions
    auth: Arc<AuthManager>,
    partner_queue: OnceLock<Arc<UpdateQueue>>,
}

impl TaskStore {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            auth,
            partner_queue: OnceLock::new(),
        }
    }

    /// Queue locally accepted changes for a partner from now on.
    ///
    /// Only the first queue attached is used.
    pub fn attach_partner_queue(&self, queue: Arc<UpdateQueue>) -> bool {
        self.partner_queue.set(queue).is_ok()
    }

    fn queue(&self) -> Option<&Arc<UpdateQueue>> {
        self.partner_queue.get()
    }

    /// Insert an uncreated task and apply its creating update.
    ///
    /// Assigns a uuid if the task has none. Returns the uuid.
    pub async fn create(&self, mut task: Task, initial: TaskStatus) -> Result<String> {
        if task.uuid.is_empty() {
            task.uuid = uuid::Uuid::new_v4().to_string();
        }
        if task.status.is_some() || task.version() != 0 {
            return Err(TaaskError::InvalidInput(format!(
                "task {} was already created (version {})",
                task.uuid,
                task.version()
            )));
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.uuid) {
            return Err(TaaskError::InvalidInput(format!("task {} already exists", task.uuid)));
        }

        let template = task.clone();
        let update = task.update(TaskUpdate::status(initial))?;
        let uuid = task.uuid.clone();
        tasks.insert(uuid.clone(), task);

        if let Some(queue) = self.queue() {
            queue.push_task(template);
            queue.push_task_update(update);
        }

        tracing::debug!(task = %uuid, status = %initial, "Task created");

        Ok(uuid)
    }

    pub async fn get(&self, uuid: &str) -> Option<Task> {
        self.tasks.read().await.get(uuid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Uuids of tasks currently in `status`
    pub async fn uuids_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == Some(status))
            .map(|t| t.uuid.clone())
            .collect()
    }

    /// Apply an unversioned change at the task's next version
    pub async fn update(&self, uuid: &str, update: TaskUpdate) -> Result<TaskUpdate> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(uuid)
            .ok_or_else(|| TaaskError::NotFound(format!("task {}", uuid)))?;

        let stamped = task.update(update)?;
        if let Some(queue) = self.queue() {
            queue.push_task_update(stamped.clone());
        }

        Ok(stamped)
    }

    /// Apply a versioned update that originated locally
    pub async fn apply(&self, update: TaskUpdate) -> Result<()> {
        self.apply_inner(&update).await?;
        if let Some(queue) = self.queue() {
            queue.push_task_update(update);
        }
        Ok(())
    }

    async fn apply_inner(&self, update: &TaskUpdate) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&update.uuid)
            .ok_or_else(|| TaaskError::NotFound(format!("task {}", update.uuid)))?;

        task.apply_update(update)
    }

    async fn insert_replica(&self, task: Task) -> bool {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.uuid) {
            return false;
        }
        tasks.insert(task.uuid.clone(), task);
        true
    }
}

#[async_trait]
impl ReplicaSink for TaskStore {
    async fn apply_partner_update(&self, update: PartnerUpdate) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for group in update.groups {
            self.auth.add_group(group).await;
            report.applied += 1;
        }

        for session in update.sessions {
            let member = session.member_uuid.clone();
            match self.auth.import_session(session).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!(member = %member, error = %e, "Discarding replicated session");
                    report.rejected += 1;
                }
            }
        }

        for task in update.tasks {
            if task.status.is_some() || task.version() != 0 {
                tracing::warn!(task = %task.uuid, "Discarding replicated task with a status");
                report.rejected += 1;
            } else if self.insert_replica(task).await {
                report.applied += 1;
            } else {
                report.rejected += 1;
            }
        }

        for task_update in update.task_updates {
            match self.apply_inner(&task_update).await {
                Ok(()) => report.applied += 1,
                Err(e) if e.is_rejection() => report.rejected += 1,
                Err(e) => {
                    tracing::warn!(
                        task = %task_update.uuid,
                        error = %e,
                        "Discarding replicated task update"
                    );
                    report.rejected += 1;
                }
            }
        }

        tracing::debug!(
            applied = report.applied,
            rejected = report.rejected,
            "Applied partner update"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_member_group, group_key};
    use crate::crypto::KeyPair;
    use crate::envelope::seal;

    fn auth() -> Arc<AuthManager> {
        Arc::new(AuthManager::new(Arc::new(KeyPair::generate()), 30))
    }

    fn sealed_task() -> Task {
        let (_, sealed) = seal(b"{}", &KeyPair::generate(), &group_key("p")).unwrap();
        Task::from_sealed("add", sealed, vec![], 0)
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let store = TaskStore::new(auth());
        let uuid = store.create(sealed_task(), TaskStatus::Pending).await.unwrap();

        let task = store.get(&uuid).await.unwrap();
        assert_eq!(task.status, Some(TaskStatus::Pending));
        assert_eq!(task.version(), 1);

        let stamped = store.update(&uuid, TaskUpdate::status(TaskStatus::Waiting)).await.unwrap();
        assert_eq!(stamped.version, 2);
        assert_eq!(store.uuids_with_status(TaskStatus::Waiting).await, vec![uuid.clone()]);

        assert!(matches!(
            store.update("missing", TaskUpdate::status(TaskStatus::Waiting)).await,
            Err(TaaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_changes_are_queued() {
        let queue = Arc::new(UpdateQueue::new());
        let store = TaskStore::new(auth());
        assert!(store.attach_partner_queue(queue.clone()));
        assert!(!store.attach_partner_queue(Arc::new(UpdateQueue::new())));

        let uuid = store.create(sealed_task(), TaskStatus::Waiting).await.unwrap();
        store.update(&uuid, TaskUpdate::status(TaskStatus::Queued)).await.unwrap();

        let batch = queue.take();
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].version(), 0);
        assert_eq!(batch.task_updates.len(), 2);

        // Rejected updates never reach the queue
        let stale = TaskUpdate::status(TaskStatus::Running).at_version(uuid.clone(), 2);
        assert!(store.apply(stale).await.is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_replica_converges_and_does_not_requeue() {
        let origin_queue = Arc::new(UpdateQueue::new());
        let origin = TaskStore::new(auth());
        origin.attach_partner_queue(origin_queue.clone());

        let uuid = origin.create(sealed_task(), TaskStatus::Waiting).await.unwrap();
        origin.update(&uuid, TaskUpdate::status(TaskStatus::Queued)).await.unwrap();

        let replica_queue = Arc::new(UpdateQueue::new());
        let replica = TaskStore::new(auth());
        replica.attach_partner_queue(replica_queue.clone());

        let batch = origin_queue.take();
        let report = replica.apply_partner_update(batch.clone()).await.unwrap();
        assert_eq!(report, ApplyReport { applied: 3, rejected: 0 });

        let task = replica.get(&uuid).await.unwrap();
        assert_eq!(task.version(), 2);
        assert_eq!(task.status, Some(TaskStatus::Queued));
        assert!(replica_queue.is_empty());

        // Redelivery is rejected, not merged
        let report = replica.apply_partner_update(batch).await.unwrap();
        assert_eq!(report, ApplyReport { applied: 0, rejected: 3 });
        assert_eq!(replica.get(&uuid).await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_replicated_groups_are_registered() {
        let auth = auth();
        let store = TaskStore::new(auth.clone());
        let group = generate_member_group("default", "group-runners", "");

        let update = PartnerUpdate {
            groups: vec![group.clone()],
            ..Default::default()
        };
        store.apply_partner_update(update).await.unwrap();

        assert_eq!(auth.group(&group.uuid).await, Some(group));
    }
}
