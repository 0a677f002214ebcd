//! In-process authority.
//!
//! Implements the client and partner RPC surfaces over local state:
//! - handshake authority for members and partners
//! - task queueing into a [`TaskStore`]
//! - a built-in runner that drives queued tasks to completion
//! - serving partner update streams through a partner [`Manager`]

mod runner;

pub use runner::{ADD_KIND, AddInput, AddOutput, execute};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::{Arc, OnceLock};
use taask_common::constants::groups::PARTNER_GROUP_UUID;
use taask_common::{MemberGroup, Result, TaaskError, TaskStatus};

use crate::auth::{Attempt, AuthManager, AuthResponse};
use crate::config::{CoreConfig, LocalAuthConfig};
use crate::crypto::KeyPair;
use crate::envelope::{UnwrapKey, unwrap_task_key, wrap_for_runner};
use crate::partner::{Manager, UpdateQueue};
use crate::task::{TaskStore, TaskUpdate};
use crate::transport::{
    CheckTaskRequest, CheckTaskResponse, PartnerConnector, PartnerService, QueueTaskRequest,
    QueueTaskResponse, TaskService, UpdateStream,
};
use runner::Runner;

/// An authority running entirely in this process
pub struct LocalCluster {
    name: String,
    core: CoreConfig,
    auth: Arc<AuthManager>,
    store: Arc<TaskStore>,
    runner: Arc<Runner>,
    partner: OnceLock<Arc<Manager>>,
}

impl LocalCluster {
    pub fn new(name: &str, core: CoreConfig) -> Arc<Self> {
        let master = Arc::new(KeyPair::generate());
        let auth = Arc::new(AuthManager::new(master, core.auth_skew_secs));
        let store = Arc::new(TaskStore::new(auth.clone()));

        tracing::info!(cluster = %name, "Local cluster started");

        Arc::new(Self {
            name: name.to_string(),
            core,
            auth,
            store,
            runner: Arc::new(Runner::new()),
            partner: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn partner(&self) -> Option<&Arc<Manager>> {
        self.partner.get()
    }

    /// Register a member group, replicating it if a partner is attached
    pub async fn add_group(&self, group: MemberGroup) {
        self.auth.add_group(group.clone()).await;
        if let Some(manager) = self.partner() {
            manager.queue().push_group(group);
        }
    }

    /// Enable partner replication for this cluster.
    ///
    /// Local task changes are queued for the partner from here on. Only one
    /// partner can be attached.
    pub async fn attach_partner(
        &self,
        config: LocalAuthConfig,
        connector: Arc<dyn PartnerConnector>,
    ) -> Result<Arc<Manager>> {
        if self.partner.get().is_some() {
            return Err(TaaskError::Config(format!("cluster {} already has a partner", self.name)));
        }

        let queue = Arc::new(UpdateQueue::new());
        let manager = Arc::new(
            Manager::new(
                config,
                &self.core,
                self.auth.clone(),
                connector,
                queue.clone(),
                self.store.clone(),
            )
            .await?,
        );

        self.partner
            .set(manager.clone())
            .map_err(|_| {
                TaaskError::Config(format!("cluster {} already has a partner", self.name))
            })?;
        self.store.attach_partner_queue(queue);

        Ok(manager)
    }

    async fn replicate_session(&self, member_uuid: &str) {
        let Some(manager) = self.partner() else {
            return;
        };
        if let Some(record) = self.auth.session_record(member_uuid).await {
            manager.queue().push_session(record);
        }
    }
}

/// Move a freshly queued task through the state machine and run it
async fn drive_task(
    store: Arc<TaskStore>,
    master: Arc<KeyPair>,
    runner: Arc<Runner>,
    uuid: String,
) {
    if let Err(e) = execute_task(&store, &master, &runner, &uuid).await {
        tracing::warn!(task = %uuid, error = %e, "Task execution failed");
        if let Err(e) = store.update(&uuid, TaskUpdate::status(TaskStatus::Failed)).await {
            tracing::debug!(task = %uuid, error = %e, "Could not mark task failed");
        }
    }
}

async fn execute_task(
    store: &TaskStore,
    master: &KeyPair,
    runner: &Runner,
    uuid: &str,
) -> Result<()> {
    store.update(uuid, TaskUpdate::status(TaskStatus::Waiting)).await?;

    let task = store
        .get(uuid)
        .await
        .ok_or_else(|| TaaskError::NotFound(format!("task {}", uuid)))?;
    let task_key = unwrap_task_key(&task.meta.master_enc_task_key, UnwrapKey::Authority(master))?;
    let runner_key = wrap_for_runner(&task_key, &runner.public_key())?;

    store
        .update(
            uuid,
            TaskUpdate::status(TaskStatus::Queued)
                .with_runner(runner.uuid.clone())
                .with_runner_key(runner_key),
        )
        .await?;
    store.update(uuid, TaskUpdate::status(TaskStatus::Running)).await?;

    let task = store
        .get(uuid)
        .await
        .ok_or_else(|| TaaskError::NotFound(format!("task {}", uuid)))?;
    let enc_result = runner.run(&task)?;

    store
        .update(uuid, TaskUpdate::status(TaskStatus::Completed).with_result(enc_result))
        .await?;

    Ok(())
}

#[async_trait]
impl TaskService for LocalCluster {
    async fn auth_client(&self, attempt: Attempt) -> Result<AuthResponse> {
        if attempt.group_uuid == PARTNER_GROUP_UUID {
            return Err(TaaskError::Auth("partners must authenticate as partners".to_string()));
        }

        let member_uuid = attempt.member_uuid.clone();
        let response = self.auth.attempt_auth(attempt).await?;
        self.replicate_session(&member_uuid).await;

        Ok(response)
    }

    async fn queue(&self, request: QueueTaskRequest) -> Result<QueueTaskResponse> {
        self.auth.check_session(&request.session).await?;

        let task = request.task;
        if !task.uuid.is_empty() {
            return Err(TaaskError::InvalidInput("queued tasks must not carry a uuid".to_string()));
        }
        if task.kind.is_empty() {
            return Err(TaaskError::InvalidInput("task has no kind".to_string()));
        }

        let uuid = self.store.create(task, TaskStatus::Pending).await?;

        tokio::spawn(drive_task(
            self.store.clone(),
            self.auth.master_keypair().clone(),
            self.runner.clone(),
            uuid.clone(),
        ));

        Ok(QueueTaskResponse { uuid })
    }

    async fn check_task(
        &self,
        request: CheckTaskRequest,
    ) -> Result<BoxStream<'static, Result<CheckTaskResponse>>> {
        self.auth.check_session(&request.session).await?;

        if self.store.get(&request.uuid).await.is_none() {
            return Err(TaaskError::NotFound(format!("task {}", request.uuid)));
        }

        let store = self.store.clone();
        let stream = futures::stream::unfold(Some(request.uuid), move |uuid| {
            let store = store.clone();
            async move {
                let uuid = uuid?;
                match store.get(&uuid).await {
                    Some(task) => Some((
                        Ok(CheckTaskResponse {
                            status: task.status,
                            enc_result: task.enc_result,
                            enc_task_key: task.meta.client_enc_task_key,
                        }),
                        Some(uuid),
                    )),
                    None => Some((Err(TaaskError::NotFound(format!("task {}", uuid))), None)),
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl PartnerService for LocalCluster {
    async fn auth_partner(&self, attempt: Attempt) -> Result<AuthResponse> {
        if attempt.group_uuid != PARTNER_GROUP_UUID {
            return Err(TaaskError::Auth(format!(
                "member {} is not in the partner group",
                attempt.member_uuid
            )));
        }
        if self.partner().is_none() {
            return Err(TaaskError::Auth(format!(
                "cluster {} has no partner configured",
                self.name
            )));
        }

        self.auth.attempt_auth(attempt).await
    }

    async fn stream_updates(&self) -> Result<UpdateStream> {
        let manager = self
            .partner()
            .cloned()
            .ok_or_else(|| {
                TaaskError::Transport(format!("cluster {} has no partner configured", self.name))
            })?;

        let (client_end, server_end) = UpdateStream::pair(self.core.partner_channel_capacity);
        tokio::spawn(async move {
            if let Err(e) = manager.serve_stream(server_end).await {
                tracing::debug!(error = %e, "Inbound partner stream ended");
            }
        });

        Ok(client_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::generate_member_group;
    use crate::client::{Client, TaskSpec};
    use crate::envelope::TaskKeyCache;
    use crate::transport::LocalConnector;
    use serde_json::json;
    use std::time::Duration;
    use taask_common::constants::DEFAULT_PARTNER_PORT;
    use taask_common::constants::groups::{DEFAULT_GROUP_UUID, PARTNER_GROUP_NAME};
    use taask_common::{Service, ServiceType};
    use tokio::sync::broadcast;

    fn fast_config() -> CoreConfig {
        CoreConfig {
            poll_interval_millis: 10,
            ..CoreConfig::default()
        }
    }

    async fn client_for(cluster: &Arc<LocalCluster>, cache: TaskKeyCache) -> Client {
        let group = generate_member_group("default", DEFAULT_GROUP_UUID, "hunter2");
        cluster.add_group(group.clone()).await;
        let config = LocalAuthConfig::new(group, "hunter2", None);

        Client::connect(cluster.clone(), &config, cache, Duration::from_millis(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_scenario() {
        let cluster = LocalCluster::new("a", fast_config());
        let client = client_for(&cluster, TaskKeyCache::new()).await;

        let uuid = client
            .send_task(TaskSpec::new(ADD_KIND, json!({"First": 3, "Second": 4})))
            .await
            .unwrap();

        let result = client
            .wait_for_result(&uuid, Duration::from_secs(5), None)
            .await
            .unwrap();
        let output: AddOutput = serde_json::from_slice(&result).unwrap();
        assert_eq!(output, AddOutput { answer: 7 });

        let task = cluster.store().get(&uuid).await.unwrap();
        assert_eq!(task.status, Some(TaskStatus::Completed));
        assert_eq!(task.version(), 5);
        assert!(task.meta.runner_uuid.is_some());
        assert!(task.meta.runner_enc_task_key.is_some());
        assert_eq!(client.get_task_status(&uuid).await.unwrap(), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_result_readable_from_fresh_cache() {
        let cluster = LocalCluster::new("a", fast_config());
        let submitter = client_for(&cluster, TaskKeyCache::new()).await;
        let uuid = submitter
            .send_task(TaskSpec::new(ADD_KIND, json!({"First": 20, "Second": 22})))
            .await
            .unwrap();

        // Another member of the group, with no cached key, unwraps via the group key
        let reader = client_for(&cluster, TaskKeyCache::new()).await;
        let result = reader
            .wait_for_result(&uuid, Duration::from_secs(5), None)
            .await
            .unwrap();
        let output: AddOutput = serde_json::from_slice(&result).unwrap();
        assert_eq!(output.answer, 42);
    }

    #[tokio::test]
    async fn test_failed_task() {
        let cluster = LocalCluster::new("a", fast_config());
        let client = client_for(&cluster, TaskKeyCache::new()).await;

        let uuid = client
            .send_task(TaskSpec::new(ADD_KIND, json!({"First": "three"})))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.get_task_status(&uuid).await.unwrap() != Some(TaskStatus::Failed) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(cluster.store().get(&uuid).await.unwrap().version(), 5);
    }

    #[tokio::test]
    async fn test_queue_requires_session() {
        let cluster = LocalCluster::new("a", fast_config());
        let client = client_for(&cluster, TaskKeyCache::new()).await;

        let other = LocalCluster::new("b", fast_config());
        let group_key = crate::auth::group_key("x");
        let (_, sealed) = crate::envelope::seal(b"{}", &KeyPair::generate(), &group_key).unwrap();
        let result = other
            .queue(QueueTaskRequest {
                task: crate::task::Task::from_sealed(ADD_KIND, sealed, vec![], 0),
                session: client.session().session.clone(),
            })
            .await;
        assert!(matches!(result, Err(TaaskError::Auth(_))));
    }

    #[tokio::test]
    async fn test_partner_clusters_converge() {
        let partner_group = generate_member_group(PARTNER_GROUP_NAME, PARTNER_GROUP_UUID, "link");
        let connector = Arc::new(LocalConnector::new());

        let a = LocalCluster::new("a", fast_config());
        let b = LocalCluster::new("b", fast_config());

        b.attach_partner(
            LocalAuthConfig::new(
                partner_group.clone(),
                "link",
                Some(Service::new(ServiceType::Partner, "cluster-a")),
            ),
            connector.clone(),
        )
        .await
        .unwrap();
        connector.register("cluster-b", DEFAULT_PARTNER_PORT, b.clone());

        let a_manager = a
            .attach_partner(
                LocalAuthConfig::new(
                    partner_group,
                    "link",
                    Some(Service::new(ServiceType::Partner, "cluster-b")),
                ),
                connector.clone(),
            )
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let outgoing = {
            let manager = a_manager.clone();
            tokio::spawn(async move { manager.start_outgoing_manager(shutdown_rx).await })
        };

        let client = client_for(&a, TaskKeyCache::new()).await;
        let uuid = client
            .send_task(TaskSpec::new(ADD_KIND, json!({"First": 3, "Second": 4})))
            .await
            .unwrap();
        client
            .wait_for_result(&uuid, Duration::from_secs(5), None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(task) = b.store().get(&uuid).await {
                    if task.version() == 5 {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let replica = b.store().get(&uuid).await.unwrap();
        let origin = a.store().get(&uuid).await.unwrap();
        assert_eq!(replica.status, Some(TaskStatus::Completed));
        assert_eq!(replica.enc_result, origin.enc_result);

        // The client's group and session were replicated too
        assert!(b.auth().group(DEFAULT_GROUP_UUID).await.is_some());
        assert!(b.auth().check_session(&client.session().session).await.is_ok());

        shutdown_tx.send(()).unwrap();
        outgoing.await.unwrap();
    }
}
