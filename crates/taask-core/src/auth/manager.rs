//! Authority side of the handshake.

use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;
use taask_common::{MemberGroup, Result, TaaskError};
use tokio::sync::RwLock;

use super::handshake::timestamp_nonce;
use super::{Attempt, AuthResponse, Session, SessionRecord};
use crate::crypto::{KeyPair, SerializablePubKey, Signature};

const CHALLENGE_LEN: usize = 32;

/// Challenge state kept for each member with a live session
#[derive(Clone, Debug)]
struct MemberAuth {
    group_uuid: String,
    pub_key: KeyPair,
    challenge: Vec<u8>,
}

/// Validates auth attempts and the sessions that result from them.
///
/// Sessions live only as long as this manager's in-memory challenge state.
pub struct AuthManager {
    /// Long-lived identity that signs challenges and data keys
    master_keypair: Arc<KeyPair>,
    /// Maximum distance between an attempt's timestamp and our clock
    skew_secs: u64,
    /// Known groups (group uuid -> group)
    groups: RwLock<HashMap<String, MemberGroup>>,
    /// Members with issued challenges (member uuid -> state)
    members: RwLock<HashMap<String, MemberAuth>>,
}

impl AuthManager {
    pub fn new(master_keypair: Arc<KeyPair>, skew_secs: u64) -> Self {
        Self {
            master_keypair,
            skew_secs,
            groups: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn master_keypair(&self) -> &Arc<KeyPair> {
        &self.master_keypair
    }

    pub fn master_pub_key(&self) -> SerializablePubKey {
        self.master_keypair.serializable_pub_key()
    }

    /// Register (or replace) a group
    pub async fn add_group(&self, group: MemberGroup) {
        tracing::info!(group = %group.uuid, name = %group.name, "Added member group");
        self.groups.write().await.insert(group.uuid.clone(), group);
    }

    pub async fn group(&self, uuid: &str) -> Option<MemberGroup> {
        self.groups.read().await.get(uuid).cloned()
    }

    /// Validate an attempt against the current clock
    pub async fn attempt_auth(&self, attempt: Attempt) -> Result<AuthResponse> {
        self.attempt_auth_at(attempt, chrono::Utc::now().timestamp()).await
    }

    /// Validate an attempt as of `now` (unix seconds)
    pub async fn attempt_auth_at(&self, attempt: Attempt, now: i64) -> Result<AuthResponse> {
        let skew = now.abs_diff(attempt.timestamp);
        if skew > self.skew_secs {
            tracing::warn!(
                member = %attempt.member_uuid,
                skew_secs = skew,
                "Rejected stale auth attempt"
            );
            return Err(TaaskError::Auth(format!(
                "attempt timestamp {} is {}s away from now (allowed {}s)",
                attempt.timestamp, skew, self.skew_secs
            )));
        }

        let group = self.group(&attempt.group_uuid).await.ok_or_else(|| {
            TaaskError::Auth(format!("unknown group {}", attempt.group_uuid))
        })?;

        let member_key = KeyPair::from_serialized_pub_key(&attempt.pub_key)
            .map_err(|e| TaaskError::Auth(format!("invalid attempt public key: {}", e)))?;

        let mut hash_with_nonce = group.auth_hash.clone();
        hash_with_nonce.extend_from_slice(&timestamp_nonce(attempt.timestamp));

        member_key
            .verify(&hash_with_nonce, &attempt.auth_hash_signature)
            .map_err(|_| {
                tracing::warn!(
                    member = %attempt.member_uuid,
                    group = %group.uuid,
                    "Auth hash signature rejected"
                );
                TaaskError::Auth("auth hash signature does not verify".to_string())
            })?;

        let mut challenge = vec![0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);

        let enc_challenge = member_key
            .encrypt(&challenge)
            .map_err(|e| TaaskError::Auth(format!("failed to encrypt challenge: {}", e)))?;
        let challenge_signature = self
            .master_keypair
            .sign(&challenge)
            .map_err(|e| TaaskError::Auth(format!("failed to sign challenge: {}", e)))?;

        {
            let mut members = self.members.write().await;
            claim_member(&members, &attempt.member_uuid, &group.uuid)?;
            members.insert(
                attempt.member_uuid.clone(),
                MemberAuth {
                    group_uuid: group.uuid.clone(),
                    pub_key: member_key,
                    challenge,
                },
            );
        }

        tracing::debug!(
            member = %attempt.member_uuid,
            group = %group.uuid,
            "Issued auth challenge"
        );

        Ok(AuthResponse {
            enc_challenge,
            master_pub_key: self.master_pub_key(),
            challenge_signature,
        })
    }

    /// Check that a presented session matches an issued challenge
    pub async fn check_session(&self, session: &Session) -> Result<()> {
        let members = self.members.read().await;
        let member = members.get(&session.member_uuid).ok_or_else(|| {
            TaaskError::Auth(format!("no session state for member {}", session.member_uuid))
        })?;

        if member.group_uuid != session.group_uuid {
            return Err(TaaskError::Auth(format!(
                "member {} belongs to group {}, session claims {}",
                session.member_uuid, member.group_uuid, session.group_uuid
            )));
        }

        member
            .pub_key
            .verify(&member.challenge, &session.challenge_signature)
            .map_err(|_| {
                TaaskError::Auth("session challenge signature does not verify".to_string())
            })
    }

    /// Verify `message` was signed by the session key of `member_uuid`, a
    /// member of `group_uuid`
    pub async fn verify_signature_from_member(
        &self,
        group_uuid: &str,
        member_uuid: &str,
        message: &[u8],
        signature: &Signature,
    ) -> Result<()> {
        let members = self.members.read().await;
        let member = members
            .get(member_uuid)
            .ok_or_else(|| TaaskError::Auth(format!("unknown member {}", member_uuid)))?;

        if member.group_uuid != group_uuid {
            return Err(TaaskError::Auth(format!(
                "member {} is not in group {}",
                member_uuid, group_uuid
            )));
        }

        member.pub_key.verify(message, signature)
    }

    /// Public session key of a member
    pub async fn member_key(&self, member_uuid: &str) -> Result<KeyPair> {
        self.members
            .read()
            .await
            .get(member_uuid)
            .map(|m| m.pub_key.clone())
            .ok_or_else(|| TaaskError::NotFound(format!("member {}", member_uuid)))
    }

    /// Export a member's session state for replication
    pub async fn session_record(&self, member_uuid: &str) -> Option<SessionRecord> {
        self.members.read().await.get(member_uuid).map(|m| SessionRecord {
            member_uuid: member_uuid.to_string(),
            group_uuid: m.group_uuid.clone(),
            pub_key: m.pub_key.serializable_pub_key(),
            challenge: m.challenge.clone(),
        })
    }

    /// Accept a session issued by a partner authority
    pub async fn import_session(&self, record: SessionRecord) -> Result<()> {
        if self.group(&record.group_uuid).await.is_none() {
            return Err(TaaskError::NotFound(format!("group {}", record.group_uuid)));
        }

        let pub_key = KeyPair::from_serialized_pub_key(&record.pub_key)?;

        let mut members = self.members.write().await;
        claim_member(&members, &record.member_uuid, &record.group_uuid)?;
        members.insert(
            record.member_uuid,
            MemberAuth {
                group_uuid: record.group_uuid,
                pub_key,
                challenge: record.challenge,
            },
        );

        Ok(())
    }

    /// Forget a member's session (its stream ended)
    pub async fn remove_member(&self, member_uuid: &str) {
        if self.members.write().await.remove(member_uuid).is_some() {
            tracing::debug!(member = %member_uuid, "Session destroyed");
        }
    }
}

/// A member uuid stays bound to the group it first authenticated in until
/// its session is removed
fn claim_member(
    members: &HashMap<String, MemberAuth>,
    member_uuid: &str,
    group_uuid: &str,
) -> Result<()> {
    match members.get(member_uuid) {
        Some(existing) if existing.group_uuid != group_uuid => {
            tracing::warn!(
                member = %member_uuid,
                registered = %existing.group_uuid,
                requested = %group_uuid,
                "Rejected auth for a member registered in another group"
            );
            Err(TaaskError::Auth(format!(
                "member {} is already registered in another group",
                member_uuid
            )))
        }
        _ => Ok(()),
    }
}
