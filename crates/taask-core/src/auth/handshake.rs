//! Member side of the handshake.

use std::future::Future;
use std::sync::Arc;
use taask_common::{MemberGroup, Result, TaaskError};

use super::{ActiveSession, Attempt, AuthResponse, Session};
use crate::crypto::KeyPair;

/// Unix timestamp as the 8 little-endian bytes appended to the auth hash
pub fn timestamp_nonce(timestamp: i64) -> [u8; 8] {
    (timestamp as u64).to_le_bytes()
}

/// Sign the group auth hash salted with `timestamp` and package the attempt
pub fn build_attempt(
    member_uuid: &str,
    group: &MemberGroup,
    keypair: &KeyPair,
    timestamp: i64,
) -> Result<Attempt> {
    let mut hash_with_nonce = group.auth_hash.clone();
    hash_with_nonce.extend_from_slice(&timestamp_nonce(timestamp));

    let auth_hash_signature = keypair
        .sign(&hash_with_nonce)
        .map_err(|e| TaaskError::Auth(format!("failed to sign auth hash: {}", e)))?;

    Ok(Attempt {
        member_uuid: member_uuid.to_string(),
        group_uuid: group.uuid.clone(),
        pub_key: keypair.serializable_pub_key(),
        auth_hash_signature,
        timestamp,
    })
}

/// Open the authority's challenge and turn it into a session.
///
/// Fails without producing a session if the challenge signature doesn't
/// verify against the returned master key.
pub fn complete_handshake(
    member_uuid: &str,
    group_uuid: &str,
    keypair: Arc<KeyPair>,
    response: &AuthResponse,
) -> Result<ActiveSession> {
    let challenge = keypair
        .decrypt(&response.enc_challenge)
        .map_err(|e| TaaskError::Auth(format!("failed to decrypt challenge: {}", e)))?;

    let master_pub_key = KeyPair::from_serialized_pub_key(&response.master_pub_key)
        .map_err(|e| TaaskError::Auth(format!("invalid master public key: {}", e)))?;

    master_pub_key
        .verify(&challenge, &response.challenge_signature)
        .map_err(|e| TaaskError::Auth(format!("authority challenge signature rejected: {}", e)))?;

    let challenge_signature = keypair
        .sign(&challenge)
        .map_err(|e| TaaskError::Auth(format!("failed to sign challenge: {}", e)))?;

    Ok(ActiveSession {
        session: Session {
            member_uuid: member_uuid.to_string(),
            group_uuid: group_uuid.to_string(),
            challenge_signature,
        },
        keypair,
        master_pub_key: Arc::new(master_pub_key),
    })
}

/// Run the whole handshake, using `send` for the single round trip
/// (`AuthClient` for clients and runners, `AuthPartner` for partners).
pub async fn authenticate<F, Fut>(
    member_uuid: &str,
    group: &MemberGroup,
    send: F,
) -> Result<ActiveSession>
where
    F: FnOnce(Attempt) -> Fut,
    Fut: Future<Output = Result<AuthResponse>>,
{
    let keypair = Arc::new(KeyPair::generate());
    let timestamp = chrono::Utc::now().timestamp();
    let attempt = build_attempt(member_uuid, group, &keypair, timestamp)?;

    tracing::debug!(
        member = %member_uuid,
        group = %group.uuid,
        kid = %keypair.kid(),
        "Sending auth attempt"
    );

    let response = send(attempt).await.map_err(|e| match e {
        TaaskError::Auth(_) | TaaskError::Transport(_) => e,
        other => TaaskError::Auth(other.to_string()),
    })?;

    let active = complete_handshake(member_uuid, &group.uuid, keypair, &response)?;

    tracing::info!(
        member = %member_uuid,
        group = %group.uuid,
        master_kid = %active.master_pub_key.kid(),
        "Auth attempt succeeded"
    );

    Ok(active)
}
