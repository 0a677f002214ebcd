//! The duplex update loop shared by both ends of a partner link.

use std::sync::Arc;
use std::time::Duration;
use taask_common::constants::groups::PARTNER_GROUP_UUID;
use taask_common::{Result, TaaskError};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::{HealthChecker, PartnerUpdate, ReplicaSink, UpdateQueue};
use crate::auth::{ActiveSession, AuthManager};
use crate::crypto::{KeyPair, SymKey};
use crate::transport::{UpdateReceiver, UpdateRequest, UpdateSender, UpdateStream};

/// Which end of the link we are, and so which keys sign and verify
pub(crate) enum Role {
    /// We dialed and authenticated; we sign with our session key and the
    /// peer signs with its master key
    Outbound { session: ActiveSession },
    /// The peer dialed us; we sign with our master key and the peer signs
    /// with its session key
    Inbound {
        master: Arc<KeyPair>,
        auth: Arc<AuthManager>,
        member_uuid: String,
    },
}

/// Immutable view of one established link.
///
/// Built once the data key is known and never mutated, so the send and
/// receive directions agree on keys for the lifetime of the stream.
pub(crate) struct StreamContext {
    pub role: Role,
    pub data_key: SymKey,
    pub peer_uuid: String,
}

impl StreamContext {
    /// Serialize, sign and seal a batch
    pub fn encrypt_and_sign(&self, update: &PartnerUpdate) -> Result<UpdateRequest> {
        let json = serde_json::to_vec(update)?;

        let (signature, session) = match &self.role {
            Role::Outbound { session } => (
                session.keypair.sign(&json)?,
                Some(session.session.clone()),
            ),
            Role::Inbound { master, .. } => (master.sign(&json)?, None),
        };

        Ok(UpdateRequest {
            session,
            enc_update: Some(self.data_key.encrypt(&json)?),
            update_signature: Some(signature),
            ..Default::default()
        })
    }

    /// Open and verify a received frame.
    ///
    /// Health checks and frames without an update yield `None`.
    pub async fn decrypt_and_verify(
        &self,
        request: UpdateRequest,
    ) -> Result<Option<PartnerUpdate>> {
        if request.is_health_check {
            return Ok(None);
        }
        let Some(enc_update) = request.enc_update else {
            return Ok(None);
        };
        let signature = request
            .update_signature
            .ok_or_else(|| TaaskError::Auth("partner update is unsigned".to_string()))?;

        let json = self.data_key.decrypt(&enc_update)?;

        match &self.role {
            Role::Outbound { session } => session.master_pub_key.verify(&json, &signature)?,
            Role::Inbound {
                auth, member_uuid, ..
            } => {
                if let Some(session) = &request.session {
                    if session.member_uuid != *member_uuid {
                        return Err(TaaskError::Auth(format!(
                            "update carries session for {}, stream belongs to {}",
                            session.member_uuid, member_uuid
                        )));
                    }
                }
                auth.verify_signature_from_member(
                    PARTNER_GROUP_UUID,
                    member_uuid,
                    &json,
                    &signature,
                )
                .await?
            }
        }

        Ok(Some(serde_json::from_slice(&json)?))
    }
}

/// Timing for [`run`]
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamIntervals {
    pub flush: Duration,
    pub health_check: Duration,
}

/// Swap out the queued batch and send it.
///
/// Returns how many deltas were sent. An empty batch sends nothing; a batch
/// that fails to send is put back on the queue.
pub(crate) async fn flush(
    ctx: &StreamContext,
    queue: &UpdateQueue,
    sender: &UpdateSender,
) -> Result<usize> {
    let batch = queue.take();
    if batch.is_empty() {
        return Ok(0);
    }
    let count = batch.len();

    let request = match ctx.encrypt_and_sign(&batch) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, deltas = count, "Failed to seal partner update");
            return Err(e);
        }
    };

    if let Err(e) = sender.send(request).await {
        queue.requeue(batch);
        return Err(e);
    }

    tracing::debug!(partner = %ctx.peer_uuid, deltas = count, "Flushed updates to partner");
    Ok(count)
}

async fn send_loop(
    ctx: Arc<StreamContext>,
    queue: Arc<UpdateQueue>,
    sender: UpdateSender,
    health: Arc<HealthChecker>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = queue.notified() => {}
        }

        match flush(&ctx, &queue, &sender).await {
            Ok(_) => {}
            Err(e @ TaaskError::Transport(_)) => {
                health.mark_unhealthy(format!("failed to send update: {}", e));
                return;
            }
            Err(_) => {}
        }
    }
}

async fn receive_loop(
    ctx: Arc<StreamContext>,
    mut receiver: UpdateReceiver,
    sink: Arc<dyn ReplicaSink>,
    health: Arc<HealthChecker>,
) {
    loop {
        let request = match receiver.recv().await {
            Ok(request) => request,
            Err(e) => {
                health.mark_unhealthy(e.to_string());
                return;
            }
        };

        let update = match ctx.decrypt_and_verify(request).await {
            Ok(Some(update)) => update,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(partner = %ctx.peer_uuid, error = %e, "Discarding partner update");
                continue;
            }
        };

        // Batches are applied in arrival order so per-task versions stay sequential
        if let Err(e) = sink.apply_partner_update(update).await {
            tracing::error!(partner = %ctx.peer_uuid, error = %e, "Failed to apply partner update");
        }
    }
}

/// Run both directions of an established stream until it goes unhealthy.
///
/// Always returns a `Transport` error naming why the stream ended.
pub(crate) async fn run(
    ctx: Arc<StreamContext>,
    stream: UpdateStream,
    queue: Arc<UpdateQueue>,
    sink: Arc<dyn ReplicaSink>,
    health: Arc<HealthChecker>,
    intervals: StreamIntervals,
) -> Result<()> {
    let UpdateStream { sender, receiver } = stream;

    tracing::info!(partner = %ctx.peer_uuid, "🔁 Partner update stream started");

    // Dropping the set aborts all three, including when this future is dropped
    let mut tasks = JoinSet::new();
    {
        let health = health.clone();
        let sender = sender.clone();
        tasks.spawn(async move { health.run(sender, intervals.health_check).await });
    }
    tasks.spawn(send_loop(
        ctx.clone(),
        queue,
        sender,
        health.clone(),
        intervals.flush,
    ));
    tasks.spawn(receive_loop(ctx.clone(), receiver, sink, health.clone()));

    let reason = health.unhealthy().await;
    tasks.abort_all();

    tracing::warn!(partner = %ctx.peer_uuid, reason = %reason, "Partner update stream ended");

    Err(TaaskError::Transport(reason))
}
