//! Partner link lifecycle: dialing, reconnecting, and serving inbound links.

use std::sync::Arc;
use std::time::Duration;
use taask_common::constants::groups::PARTNER_GROUP_UUID;
use taask_common::{ConnectionState, Result, Service, TaaskError};
use tokio::sync::{RwLock, broadcast};

use super::stream::{self, Role, StreamContext, StreamIntervals};
use super::{Backoff, HealthChecker, ReplicaSink, UpdateQueue};
use crate::auth::{self, ActiveSession, AuthManager, Session};
use crate::config::{CoreConfig, LocalAuthConfig};
use crate::crypto::{KeyPair, SymKey};
use crate::transport::{PartnerConnector, UpdateReceiver, UpdateRequest, UpdateStream};

/// Which side dialed a link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

/// The link currently holding the partner slot
#[derive(Debug)]
struct Link {
    id: u64,
    direction: LinkDirection,
    health: Arc<HealthChecker>,
}

/// The one peer cluster we replicate with.
///
/// At most one link, dialed by either side, holds the slot at a time.
#[derive(Debug)]
pub struct Partner {
    /// Peer's partner uuid, known once a link is established
    pub uuid: Option<String>,
    pub service: Service,
    pub state: ConnectionState,
    /// Our session with the peer, when we dialed
    pub session: Option<Session>,
    /// Kid of the current link's data key
    pub data_key_kid: Option<String>,
    /// Links that reached streaming, across reconnects
    pub links_established: u64,
    link: Option<Link>,
    next_link_id: u64,
}

impl Partner {
    fn new(service: Service) -> Self {
        Self {
            uuid: None,
            service,
            state: ConnectionState::Disconnected,
            session: None,
            data_key_kid: None,
            links_established: 0,
            link: None,
            next_link_id: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_streaming() && self.link.as_ref().is_some_and(|l| l.health.is_healthy())
    }

    /// Direction of the link holding the slot
    pub fn direction(&self) -> Option<LinkDirection> {
        self.link.as_ref().map(|l| l.direction)
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, "Partner connection state changed");
            self.state = state;
        }
    }

    fn claim(&mut self, direction: LinkDirection, health: Arc<HealthChecker>) -> u64 {
        self.next_link_id += 1;
        let id = self.next_link_id;
        self.link = Some(Link {
            id,
            direction,
            health,
        });
        self.transition(ConnectionState::Connecting);
        id
    }

    fn owns(&self, id: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.id == id)
    }

    /// Forget everything tied to link `id`, unless another link has since
    /// taken the slot
    fn release(&mut self, id: u64) {
        if !self.owns(id) {
            return;
        }
        self.link = None;
        self.session = None;
        self.data_key_kid = None;
        self.transition(ConnectionState::Disconnected);
    }

    /// Decide whether a link dialed by partner `dialer` may take the slot.
    ///
    /// When both sides dial at once, the link dialed by the lower manager uuid
    /// wins; if that is the dialer's, our own attempt is abandoned.
    fn admit_inbound(&self, own_uuid: &str, dialer: &str) -> Result<()> {
        let Some(link) = &self.link else {
            return Ok(());
        };

        let contending = link.direction == LinkDirection::Outbound && !self.state.is_streaming();
        if contending && dialer < own_uuid {
            tracing::info!(partner = %dialer, "Both sides dialed, yielding to partner's link");
            link.health.mark_unhealthy("superseded by the partner's link");
            return Ok(());
        }

        tracing::warn!(partner = %dialer, state = %self.state, "Refusing a second partner link");
        Err(TaaskError::Auth(format!(
            "refusing partner {}: a link is already {}",
            dialer, self.state
        )))
    }
}

/// Owns the partner link and moves queued deltas across it.
///
/// Only the lifecycle methods here mutate [`Partner`]; the streaming loops
/// work from an immutable snapshot taken when the link comes up.
pub struct Manager {
    /// Our own partner uuid
    uuid: String,
    config: LocalAuthConfig,
    auth: Arc<AuthManager>,
    connector: Arc<dyn PartnerConnector>,
    queue: Arc<UpdateQueue>,
    sink: Arc<dyn ReplicaSink>,
    intervals: StreamIntervals,
    backoff_initial: Duration,
    backoff_max: Duration,
    partner: RwLock<Partner>,
}

impl Manager {
    /// Validate the partner auth config and register the partner group.
    pub async fn new(
        config: LocalAuthConfig,
        core: &CoreConfig,
        auth: Arc<AuthManager>,
        connector: Arc<dyn PartnerConnector>,
        queue: Arc<UpdateQueue>,
        sink: Arc<dyn ReplicaSink>,
    ) -> Result<Self> {
        let config = config.into_partner_config()?;
        let service = config
            .service
            .clone()
            .ok_or_else(|| TaaskError::Config("partner auth config has no service".to_string()))?;

        auth.add_group(config.member_group.clone()).await;

        let uuid = uuid::Uuid::new_v4().to_string();
        tracing::info!(uuid = %uuid, partner = %service.address(), "Partner manager created");

        Ok(Self {
            uuid,
            config,
            auth,
            connector,
            queue,
            sink,
            intervals: StreamIntervals {
                flush: core.flush_interval(),
                health_check: core.health_check_interval(),
            },
            backoff_initial: core.backoff_initial(),
            backoff_max: core.backoff_max(),
            partner: RwLock::new(Partner::new(service)),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Where local deltas are queued for the partner
    pub fn queue(&self) -> &Arc<UpdateQueue> {
        &self.queue
    }

    pub async fn state(&self) -> ConnectionState {
        self.partner.read().await.state
    }

    /// Peer uuid while the link is healthy
    pub async fn healthy_partner_uuid(&self) -> Option<String> {
        let partner = self.partner.read().await;
        if partner.is_healthy() {
            partner.uuid.clone()
        } else {
            None
        }
    }

    /// Update the partner record on behalf of link `id`; fails once another
    /// link has taken the slot
    async fn with_link<T>(&self, id: u64, f: impl FnOnce(&mut Partner) -> T) -> Result<T> {
        let mut partner = self.partner.write().await;
        if !partner.owns(id) {
            return Err(TaaskError::Transport("partner link was superseded".to_string()));
        }
        Ok(f(&mut partner))
    }

    /// Dial the partner and stream until the link fails.
    ///
    /// Returns `Ok` immediately if a link (ours or the partner's) already
    /// holds the slot; otherwise returns the error that ended this attempt.
    pub async fn run(&self) -> Result<()> {
        let health = Arc::new(HealthChecker::new());
        let (id, service) = {
            let mut partner = self.partner.write().await;
            if let Some(direction) = partner.direction() {
                tracing::debug!(?direction, state = %partner.state, "Partner link in place");
                return Ok(());
            }
            let id = partner.claim(LinkDirection::Outbound, health.clone());
            (id, partner.service.clone())
        };

        let result = tokio::select! {
            result = self.connect_and_stream(id, &service, health.clone()) => result,
            reason = health.unhealthy() => Err(TaaskError::Transport(reason)),
        };

        self.partner.write().await.release(id);
        result
    }

    async fn connect_and_stream(
        &self,
        id: u64,
        service: &Service,
        health: Arc<HealthChecker>,
    ) -> Result<()> {
        let remote = self.connector.connect(&service.host, &service.port).await?;

        self.with_link(id, |p| p.transition(ConnectionState::Authenticating))
            .await?;
        let session = auth::authenticate(&self.uuid, &self.config.member_group, |attempt| {
            remote.auth_partner(attempt)
        })
        .await?;

        let mut stream = remote.stream_updates().await?;
        stream
            .sender
            .send(UpdateRequest {
                session: Some(session.session.clone()),
                ..Default::default()
            })
            .await?;

        self.with_link(id, |p| {
            p.session = Some(session.session.clone());
            p.transition(ConnectionState::AwaitingDataKey);
        })
        .await?;

        let wait = self.intervals.health_check * 3;
        let (peer_uuid, data_key) =
            tokio::time::timeout(wait, receive_data_key(&session, &mut stream.receiver))
                .await
                .map_err(|_| TaaskError::Timeout("partner never sent a data key".to_string()))??;

        self.with_link(id, |p| {
            p.uuid = Some(peer_uuid.clone());
            p.data_key_kid = Some(data_key.kid.clone());
            p.links_established += 1;
            p.transition(ConnectionState::Streaming);
        })
        .await?;

        let ctx = Arc::new(StreamContext {
            role: Role::Outbound { session },
            data_key,
            peer_uuid,
        });
        let result = stream::run(
            ctx,
            stream,
            self.queue.clone(),
            self.sink.clone(),
            health,
            self.intervals,
        )
        .await;

        let _ = self
            .with_link(id, |p| p.transition(ConnectionState::Unhealthy))
            .await;
        result
    }

    /// Keep a partner link up until `shutdown` fires, backing off between
    /// failed attempts.
    pub async fn start_outgoing_manager(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);

        tracing::info!(uuid = %self.uuid, "🤝 Partner manager started");

        loop {
            let established = self.partner.read().await.links_established;

            let result = tokio::select! {
                result = self.run() => result,
                _ = shutdown.recv() => break,
            };

            let delay = match result {
                // The slot is taken; look again later without backing off
                Ok(()) => self.intervals.health_check,
                Err(e) => {
                    if self.partner.read().await.links_established > established {
                        backoff.reset();
                    }
                    if e.is_retryable() {
                        tracing::warn!(error = %e, "Partner connection failed");
                    } else {
                        tracing::error!(error = %e, "Partner connection failed, check config");
                    }

                    let delay = backoff.next_delay();
                    tracing::warn!(retry_in_secs = delay.as_secs(), "Reconnecting to partner");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!("Partner manager shutting down");

        // A link dropped mid-stream never saw its loop end
        let mut partner = self.partner.write().await;
        let outbound = partner
            .link
            .as_ref()
            .filter(|l| l.direction == LinkDirection::Outbound)
            .map(|l| {
                l.health.mark_unhealthy("partner manager shut down");
                l.id
            });
        if let Some(id) = outbound {
            partner.release(id);
        }
    }

    /// Serve a link the partner dialed to us.
    ///
    /// The first frame must carry a partner-group session; we answer with a
    /// fresh data key, then stream until the link fails. The member's session
    /// is destroyed when the stream ends.
    pub async fn serve_stream(&self, mut stream: UpdateStream) -> Result<()> {
        let first = stream.receiver.recv().await?;
        let session = first.session.ok_or_else(|| {
            TaaskError::Auth("first partner frame must carry a session".to_string())
        })?;

        if session.group_uuid != PARTNER_GROUP_UUID {
            return Err(TaaskError::Auth(format!(
                "member {} is not in the partner group",
                session.member_uuid
            )));
        }
        self.auth.check_session(&session).await?;
        let member_key = self.auth.member_key(&session.member_uuid).await?;
        let member_uuid = session.member_uuid;

        let health = Arc::new(HealthChecker::new());
        let id = {
            let mut partner = self.partner.write().await;
            partner.admit_inbound(&self.uuid, &member_uuid)?;
            let id = partner.claim(LinkDirection::Inbound, health.clone());
            partner.uuid = Some(member_uuid.clone());
            id
        };

        let result = self
            .stream_inbound(id, &member_uuid, &member_key, stream, health)
            .await;

        self.auth.remove_member(&member_uuid).await;
        self.partner.write().await.release(id);
        result
    }

    async fn stream_inbound(
        &self,
        id: u64,
        member_uuid: &str,
        member_key: &KeyPair,
        stream: UpdateStream,
        health: Arc<HealthChecker>,
    ) -> Result<()> {
        let data_key = SymKey::generate();
        let json = data_key.to_json();

        stream
            .sender
            .send(UpdateRequest {
                enc_data_key: Some(member_key.encrypt(&json)?),
                update_signature: Some(self.auth.master_keypair().sign(&json)?),
                partner_uuid: Some(self.uuid.clone()),
                ..Default::default()
            })
            .await?;

        self.with_link(id, |p| {
            p.data_key_kid = Some(data_key.kid.clone());
            p.links_established += 1;
            p.transition(ConnectionState::Streaming);
        })
        .await?;

        let ctx = Arc::new(StreamContext {
            role: Role::Inbound {
                master: self.auth.master_keypair().clone(),
                auth: self.auth.clone(),
                member_uuid: member_uuid.to_string(),
            },
            data_key,
            peer_uuid: member_uuid.to_string(),
        });
        let result = stream::run(
            ctx,
            stream,
            self.queue.clone(),
            self.sink.clone(),
            health,
            self.intervals,
        )
        .await;

        let _ = self
            .with_link(id, |p| p.transition(ConnectionState::Unhealthy))
            .await;
        result
    }
}

/// Wait for the data key frame, skipping any early health checks
async fn receive_data_key(
    session: &ActiveSession,
    receiver: &mut UpdateReceiver,
) -> Result<(String, SymKey)> {
    loop {
        let frame = receiver.recv().await?;
        if frame.is_health_check {
            tracing::trace!("Partner health check received");
            continue;
        }

        let enc_data_key = frame
            .enc_data_key
            .ok_or_else(|| TaaskError::Auth("expected a data key frame".to_string()))?;
        let signature = frame
            .update_signature
            .ok_or_else(|| TaaskError::Auth("data key is unsigned".to_string()))?;
        let peer_uuid = frame
            .partner_uuid
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| TaaskError::Auth("data key frame has no partner uuid".to_string()))?;

        let json = session.keypair.decrypt(&enc_data_key)?;
        session
            .master_pub_key
            .verify(&json, &signature)
            .map_err(|e| TaaskError::Auth(format!("data key signature rejected: {}", e)))?;

        let data_key = SymKey::from_json(&json)?;
        tracing::debug!(partner = %peer_uuid, kid = %data_key.kid, "Received partner data key");

        return Ok((peer_uuid, data_key));
    }
}
