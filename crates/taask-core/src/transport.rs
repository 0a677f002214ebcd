//! RPC seams between members and authorities.
//!
//! The wire encoding is not this crate's concern: services are traits, and
//! the partner update stream is a pair of bounded channels. Anything that can
//! carry these messages (gRPC, a TCP framing, an in-process pair) can sit
//! behind them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taask_common::{Result, TaaskError, TaskStatus};
use tokio::sync::mpsc;

use crate::auth::{Attempt, AuthResponse, Session};
use crate::crypto::{Message, Signature};
use crate::task::Task;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueTaskRequest {
    pub task: Task,
    pub session: Session,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueTaskResponse {
    pub uuid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckTaskRequest {
    pub uuid: String,
    pub session: Session,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckTaskResponse {
    pub status: Option<TaskStatus>,
    pub enc_result: Option<Message>,
    /// Task key wrapped under the submitting group's key
    pub enc_task_key: Message,
}

/// One frame on a partner update stream
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    /// `PartnerUpdate` JSON sealed under the data key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_update: Option<Message>,
    /// Signature over the plaintext update (or data key) JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_data_key: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_uuid: Option<String>,
    #[serde(default)]
    pub is_health_check: bool,
}

impl UpdateRequest {
    pub fn health_check() -> Self {
        Self {
            is_health_check: true,
            ..Default::default()
        }
    }
}

/// Client/runner-facing surface of an authority
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn auth_client(&self, attempt: Attempt) -> Result<AuthResponse>;

    async fn queue(&self, request: QueueTaskRequest) -> Result<QueueTaskResponse>;

    /// Stream of the task's state; each item is a fresh observation
    async fn check_task(
        &self,
        request: CheckTaskRequest,
    ) -> Result<BoxStream<'static, Result<CheckTaskResponse>>>;
}

/// Partner-facing surface of an authority
#[async_trait]
pub trait PartnerService: Send + Sync {
    async fn auth_partner(&self, attempt: Attempt) -> Result<AuthResponse>;

    /// Open a bidirectional update stream
    async fn stream_updates(&self) -> Result<UpdateStream>;
}

/// Dials a partner
#[async_trait]
pub trait PartnerConnector: Send + Sync {
    async fn connect(&self, host: &str, port: &str) -> Result<Arc<dyn PartnerService>>;
}

/// Sending half of an update stream
#[derive(Clone, Debug)]
pub struct UpdateSender {
    tx: mpsc::Sender<UpdateRequest>,
}

impl UpdateSender {
    pub async fn send(&self, request: UpdateRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| TaaskError::Transport("update stream closed by peer".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of an update stream
#[derive(Debug)]
pub struct UpdateReceiver {
    rx: mpsc::Receiver<UpdateRequest>,
}

impl UpdateReceiver {
    pub async fn recv(&mut self) -> Result<UpdateRequest> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TaaskError::Transport("update stream ended".to_string()))
    }

    /// Next frame if one is already buffered
    pub fn try_recv(&mut self) -> Option<UpdateRequest> {
        self.rx.try_recv().ok()
    }
}

/// One end of a duplex partner update stream
#[derive(Debug)]
pub struct UpdateStream {
    pub sender: UpdateSender,
    pub receiver: UpdateReceiver,
}

impl UpdateStream {
    /// Two connected ends: what one sends, the other receives
    pub fn pair(capacity: usize) -> (UpdateStream, UpdateStream) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);

        (
            UpdateStream {
                sender: UpdateSender { tx: a_tx },
                receiver: UpdateReceiver { rx: b_rx },
            },
            UpdateStream {
                sender: UpdateSender { tx: b_tx },
                receiver: UpdateReceiver { rx: a_rx },
            },
        )
    }
}

/// Resolves partner addresses to in-process services
#[derive(Default)]
pub struct LocalConnector {
    services: std::sync::RwLock<HashMap<String, Arc<dyn PartnerService>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable at `host:port`
    pub fn register(&self, host: &str, port: &str, service: Arc<dyn PartnerService>) {
        self.services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(format!("{}:{}", host, port), service);
    }

    /// Make `host:port` unreachable
    #[cfg(test)]
    pub fn unregister(&self, host: &str, port: &str) {
        self.services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&format!("{}:{}", host, port));
    }
}

#[async_trait]
impl PartnerConnector for LocalConnector {
    async fn connect(&self, host: &str, port: &str) -> Result<Arc<dyn PartnerService>> {
        let address = format!("{}:{}", host, port);
        self.services
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&address)
            .cloned()
            .ok_or_else(|| TaaskError::Transport(format!("failed to dial {}", address)))
    }
}
