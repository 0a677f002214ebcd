//! Tasks and the guarded state machine that mutates them.
//!
//! Every change to a task, local or replicated from a partner, goes through
//! [`Task::apply_update`]. An update must carry exactly `version + 1` and, if
//! it changes status, a transition allowed by [`TaskStatus::can_transition`].
//! Rejected updates leave the task untouched.

mod store;

pub use store::TaskStore;

use serde::{Deserialize, Serialize};
use taask_common::{Result, TaaskError, TaskStatus};

use crate::crypto::Message;
use crate::envelope::SealedTask;

/// An encrypted unit of work
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,
    /// Routing tag
    pub kind: String,
    pub enc_body: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_result: Option<Message>,
    /// `None` until the creating update is applied
    #[serde(default)]
    pub status: Option<TaskStatus>,
    pub meta: TaskMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: u32,
    /// Bumped by exactly one for every accepted update
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_uuid: Option<String>,
    /// Task key wrapped to the executing authority
    pub master_enc_task_key: Message,
    /// Task key wrapped under the submitting group's key
    pub client_enc_task_key: Message,
    /// Task key wrapped to the assigned runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_enc_task_key: Option<Message>,
    #[serde(default)]
    pub retry_seconds: u32,
}

/// A partial, versioned mutation of a task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub uuid: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_result: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_enc_task_key: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_seconds: Option<u32>,
}

impl TaskUpdate {
    /// An unversioned change; [`Task::update`] stamps uuid and version
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, enc_result: Message) -> Self {
        self.enc_result = Some(enc_result);
        self
    }

    pub fn with_runner(mut self, runner_uuid: impl Into<String>) -> Self {
        self.runner_uuid = Some(runner_uuid.into());
        self
    }

    pub fn with_runner_key(mut self, key: Message) -> Self {
        self.runner_enc_task_key = Some(key);
        self
    }

    pub fn with_retry_seconds(mut self, seconds: u32) -> Self {
        self.retry_seconds = Some(seconds);
        self
    }

    pub fn at_version(mut self, uuid: impl Into<String>, version: u64) -> Self {
        self.uuid = uuid.into();
        self.version = version;
        self
    }
}

impl Task {
    /// Build an uncreated task (no status, version 0) from an envelope
    pub fn from_sealed(
        kind: &str,
        sealed: SealedTask,
        annotations: Vec<String>,
        timeout_seconds: u32,
    ) -> Self {
        Self {
            uuid: String::new(),
            kind: kind.to_string(),
            enc_body: sealed.enc_body,
            enc_result: None,
            status: None,
            meta: TaskMeta {
                annotations,
                timeout_seconds,
                version: 0,
                runner_uuid: None,
                master_enc_task_key: sealed.master_enc_task_key,
                client_enc_task_key: sealed.client_enc_task_key,
                runner_enc_task_key: None,
                retry_seconds: 0,
            },
        }
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    /// Stamp `update` with this task's uuid and next version, then apply it.
    ///
    /// Returns the stamped update so it can be replicated.
    pub fn update(&mut self, update: TaskUpdate) -> Result<TaskUpdate> {
        let update = update.at_version(self.uuid.clone(), self.meta.version + 1);
        self.apply_update(&update)?;
        Ok(update)
    }

    /// Validate then apply a versioned update.
    ///
    /// Nothing is mutated unless every check passes.
    pub fn apply_update(&mut self, update: &TaskUpdate) -> Result<()> {
        if let Err(err) = self.check_update(update) {
            tracing::warn!(task = %self.uuid, error = %err, "Discarding task update");
            return Err(err);
        }

        self.meta.version = update.version;

        if let Some(enc_result) = &update.enc_result {
            self.enc_result = Some(enc_result.clone());
        }

        if let Some(status) = update.status {
            if self.status != Some(status) {
                tracing::info!(
                    task = %self.uuid,
                    from = %status_name(self.status),
                    to = %status,
                    version = update.version,
                    "Task status updated"
                );
                self.status = Some(status);
            }
        }

        if let Some(runner) = &update.runner_uuid {
            if self.meta.runner_uuid.as_ref() != Some(runner) {
                tracing::debug!(task = %self.uuid, runner = %runner, "Task assigned to runner");
                self.meta.runner_uuid = Some(runner.clone());
            }
        }

        if let Some(key) = &update.runner_enc_task_key {
            tracing::debug!(task = %self.uuid, kid = %key.kid, "Task runner key updated");
            self.meta.runner_enc_task_key = Some(key.clone());
        }

        if let Some(seconds) = update.retry_seconds {
            if seconds != 0 && self.meta.retry_seconds != seconds {
                tracing::debug!(task = %self.uuid, retry_seconds = seconds, "Retry interval set");
                self.meta.retry_seconds = seconds;
            }
        }

        Ok(())
    }

    fn check_update(&self, update: &TaskUpdate) -> Result<()> {
        if update.version != self.meta.version + 1 {
            return Err(TaaskError::VersionConflict {
                task: self.uuid.clone(),
                expected: self.meta.version + 1,
                got: update.version,
            });
        }

        if self.status.is_some_and(|status| status.is_terminal()) {
            return Err(TaaskError::IllegalTransition {
                task: self.uuid.clone(),
                from: status_name(self.status).to_string(),
                to: status_name(update.status).to_string(),
            });
        }

        if let Some(to) = update.status {
            if self.status != Some(to) && !TaskStatus::can_transition(self.status, to) {
                return Err(TaaskError::IllegalTransition {
                    task: self.uuid.clone(),
                    from: status_name(self.status).to_string(),
                    to: to.to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.status == Some(TaskStatus::Pending)
    }

    /// Hasn't been handed to a runner yet
    pub fn is_not_started(&self) -> bool {
        matches!(self.status, Some(TaskStatus::Waiting | TaskStatus::Retrying))
    }

    pub fn is_retrying(&self) -> bool {
        self.status == Some(TaskStatus::Retrying)
    }

    /// Assigned to a runner and not yet finished
    pub fn is_running(&self) -> bool {
        matches!(self.status, Some(TaskStatus::Queued | TaskStatus::Running))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, Some(TaskStatus::Completed | TaskStatus::Failed))
    }
}

fn status_name(status: Option<TaskStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("none")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::group_key;
    use crate::crypto::{KeyPair, SymKey};
    use crate::envelope::seal;

    fn new_task() -> Task {
        let (_, sealed) = seal(b"{}", &KeyPair::generate(), &group_key("p")).unwrap();
        let mut task = Task::from_sealed("add", sealed, vec![], 15);
        task.uuid = "task-1".to_string();
        task
    }

    fn walk(task: &mut Task, statuses: &[TaskStatus]) {
        for status in statuses {
            task.update(TaskUpdate::status(*status)).unwrap();
        }
    }

    #[test]
    fn test_happy_path_versions() {
        use TaskStatus::*;

        let mut task = new_task();
        walk(&mut task, &[Pending, Waiting, Queued, Running]);

        let result = SymKey::generate().encrypt(b"{\"Answer\":7}").unwrap();
        let update = task
            .update(TaskUpdate::status(Completed).with_result(result.clone()))
            .unwrap();

        assert_eq!(update.version, 5);
        assert_eq!(update.uuid, "task-1");
        assert_eq!(task.version(), 5);
        assert_eq!(task.status, Some(Completed));
        assert_eq!(task.enc_result, Some(result));
        assert!(task.is_finished());
    }

    #[test]
    fn test_version_conflict_never_mutates() {
        let mut task = new_task();
        walk(&mut task, &[TaskStatus::Waiting]);
        let before = serde_json::to_value(&task).unwrap();

        for version in [0, 1, 3, 7] {
            let update = TaskUpdate::status(TaskStatus::Queued)
                .with_runner("runner-1")
                .at_version("task-1", version);
            let err = task.apply_update(&update).unwrap_err();
            assert!(matches!(err, TaaskError::VersionConflict { expected: 2, .. }));
        }

        assert_eq!(serde_json::to_value(&task).unwrap(), before);
    }

    #[test]
    fn test_completed_rejects_everything() {
        use TaskStatus::*;

        let mut task = new_task();
        walk(&mut task, &[Waiting, Queued, Running, Completed]);
        let before = serde_json::to_value(&task).unwrap();

        let mut candidates: Vec<TaskUpdate> = TaskStatus::ALL
            .iter()
            .map(|s| TaskUpdate::status(*s))
            .collect();
        candidates.push(TaskUpdate::default().with_runner("runner-2"));
        candidates.push(TaskUpdate::default().with_retry_seconds(30));

        for update in candidates {
            let update = update.at_version("task-1", task.version() + 1);
            assert!(matches!(
                task.apply_update(&update),
                Err(TaaskError::IllegalTransition { .. })
            ));
        }

        assert_eq!(serde_json::to_value(&task).unwrap(), before);
    }

    #[test]
    fn test_illegal_transition_is_atomic() {
        let mut task = new_task();
        walk(&mut task, &[TaskStatus::Waiting]);

        // waiting -> running skips queued; the runner field must not stick
        let update = TaskUpdate::status(TaskStatus::Running)
            .with_runner("runner-1")
            .at_version("task-1", 2);
        assert!(matches!(
            task.apply_update(&update),
            Err(TaaskError::IllegalTransition { .. })
        ));
        assert_eq!(task.version(), 1);
        assert_eq!(task.status, Some(TaskStatus::Waiting));
        assert!(task.meta.runner_uuid.is_none());
    }

    #[test]
    fn test_retry_cycle() {
        use TaskStatus::*;

        let mut task = new_task();
        walk(&mut task, &[Waiting, Queued, Running, Failed]);
        assert!(task.is_finished());

        task.update(TaskUpdate::status(Retrying).with_retry_seconds(10)).unwrap();
        assert!(task.is_retrying());
        assert!(task.is_not_started());
        assert_eq!(task.meta.retry_seconds, 10);

        // failed can only go to retrying, retrying only to queued
        assert!(task.update(TaskUpdate::status(Running)).is_err());
        task.update(TaskUpdate::status(Queued)).unwrap();
        assert!(task.is_running());
        assert_eq!(task.version(), 6);
    }

    #[test]
    fn test_field_only_update_keeps_status() {
        let mut task = new_task();
        walk(&mut task, &[TaskStatus::Waiting, TaskStatus::Queued]);

        let runner_key = KeyPair::generate().encrypt(b"key").unwrap();
        task.update(TaskUpdate::default().with_runner("runner-9").with_runner_key(runner_key))
            .unwrap();

        assert_eq!(task.status, Some(TaskStatus::Queued));
        assert_eq!(task.meta.runner_uuid.as_deref(), Some("runner-9"));
        assert!(task.meta.runner_enc_task_key.is_some());
        assert_eq!(task.version(), 3);

        // Re-stating the current status is not a transition
        task.update(TaskUpdate::status(TaskStatus::Queued)).unwrap();
        assert_eq!(task.version(), 4);
    }
}
