//! Submitting tasks and reading their results.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use taask_common::constants::DEFAULT_TASK_KIND;
use taask_common::{Result, TaaskError, TaskStatus};
use tokio::sync::broadcast;

use crate::auth::{self, ActiveSession};
use crate::config::LocalAuthConfig;
use crate::crypto::SymKey;
use crate::envelope::{self, TaskKeyCache, UnwrapKey};
use crate::task::Task;
use crate::transport::{CheckTaskRequest, CheckTaskResponse, QueueTaskRequest, TaskService};

/// A task as a user describes it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Defaults to [`DEFAULT_TASK_KIND`]
    #[serde(default)]
    pub kind: Option<String>,
    pub body: serde_json::Value,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: u32,
}

impl TaskSpec {
    pub fn new(kind: &str, body: serde_json::Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            body,
            annotations: Vec::new(),
            timeout_seconds: 0,
        }
    }
}

/// An authenticated connection to an authority
pub struct Client {
    member_uuid: String,
    service: Arc<dyn TaskService>,
    session: ActiveSession,
    group_key: SymKey,
    task_keys: TaskKeyCache,
    poll_interval: Duration,
}

impl Client {
    /// Authenticate against `service` with the group in `config`.
    ///
    /// `task_keys` may be shared between clients; keys for tasks submitted
    /// here are cached in it.
    pub async fn connect(
        service: Arc<dyn TaskService>,
        config: &LocalAuthConfig,
        task_keys: TaskKeyCache,
        poll_interval: Duration,
    ) -> Result<Self> {
        let member_uuid = uuid::Uuid::new_v4().to_string();
        let session = auth::authenticate(&member_uuid, &config.member_group, |attempt| {
            service.auth_client(attempt)
        })
        .await?;

        Ok(Self {
            member_uuid,
            service,
            session,
            group_key: config.group_key(),
            task_keys,
            poll_interval,
        })
    }

    pub fn member_uuid(&self) -> &str {
        &self.member_uuid
    }

    pub fn session(&self) -> &ActiveSession {
        &self.session
    }

    /// Seal and queue a task. Returns its uuid.
    pub async fn send_task(&self, spec: TaskSpec) -> Result<String> {
        if spec.body.is_null() {
            return Err(TaaskError::InvalidInput("task has no body".to_string()));
        }
        let kind = spec.kind.as_deref().unwrap_or(DEFAULT_TASK_KIND);
        let body = serde_json::to_vec(&spec.body)?;

        let (task_key, sealed) =
            envelope::seal(&body, &self.session.master_pub_key, &self.group_key)?;
        let task = Task::from_sealed(kind, sealed, spec.annotations, spec.timeout_seconds);

        let response = self
            .service
            .queue(QueueTaskRequest {
                task,
                session: self.session.session.clone(),
            })
            .await?;

        self.task_keys.insert(&response.uuid, task_key).await;
        tracing::info!(task = %response.uuid, kind = %kind, "Task queued");

        Ok(response.uuid)
    }

    async fn check(
        &self,
        uuid: &str,
    ) -> Result<futures::stream::BoxStream<'static, Result<CheckTaskResponse>>> {
        self.service
            .check_task(CheckTaskRequest {
                uuid: uuid.to_string(),
                session: self.session.session.clone(),
            })
            .await
    }

    /// Current status of a task
    pub async fn get_task_status(&self, uuid: &str) -> Result<Option<TaskStatus>> {
        let mut stream = self.check(uuid).await?;
        let response = stream
            .next()
            .await
            .ok_or_else(|| TaaskError::Transport(format!("no status for task {}", uuid)))??;

        Ok(response.status)
    }

    /// Poll until the task completes and return its decrypted result.
    ///
    /// Checks every poll interval. Sending on (or dropping the sender of)
    /// `shutdown` stops the wait with `Cancelled`.
    pub async fn stream_task_result(
        &self,
        uuid: &str,
        mut shutdown: Option<broadcast::Receiver<()>>,
    ) -> Result<Vec<u8>> {
        let mut stream = self.check(uuid).await?;

        loop {
            let response = tokio::select! {
                next = stream.next() => next.ok_or_else(|| {
                    TaaskError::Transport(format!("result stream for task {} ended", uuid))
                })??,
                _ = cancelled(&mut shutdown) => {
                    return Err(TaaskError::Cancelled(format!("stopped waiting for task {}", uuid)));
                }
            };

            match response.status {
                Some(TaskStatus::Completed) => return self.decrypt_result(uuid, &response).await,
                Some(TaskStatus::Failed) => {
                    tracing::debug!(task = %uuid, "Task failed, waiting for a retry");
                }
                status => {
                    tracing::trace!(task = %uuid, status = ?status, "Task not finished");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancelled(&mut shutdown) => {
                    return Err(TaaskError::Cancelled(format!("stopped waiting for task {}", uuid)));
                }
            }
        }
    }

    /// [`Self::stream_task_result`] with a deadline
    pub async fn wait_for_result(
        &self,
        uuid: &str,
        deadline: Duration,
        shutdown: Option<broadcast::Receiver<()>>,
    ) -> Result<Vec<u8>> {
        tokio::time::timeout(deadline, self.stream_task_result(uuid, shutdown))
            .await
            .map_err(|_| {
                TaaskError::Timeout(format!("task {} not complete after {:?}", uuid, deadline))
            })?
    }

    async fn decrypt_result(&self, uuid: &str, response: &CheckTaskResponse) -> Result<Vec<u8>> {
        let enc_result = response.enc_result.as_ref().ok_or_else(|| {
            TaaskError::InvalidInput(format!("completed task {} has no result", uuid))
        })?;

        let task_key = self
            .task_keys
            .get_or_unwrap(uuid, &response.enc_task_key, UnwrapKey::Group(&self.group_key))
            .await?;

        task_key.decrypt(enc_result)
    }
}

/// Resolves when the shutdown signal fires; never, without one
async fn cancelled(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}
