//! Mutual authentication between members and an authority.
//!
//! Protocol:
//! 1. member generates an ephemeral [`KeyPair`]
//! 2. member signs `auth_hash || timestamp_le` and sends an [`Attempt`]
//! 3. authority checks freshness and the signature, then returns a random
//!    challenge sealed to the ephemeral key, signed by its master key
//! 4. member opens the challenge, checks the authority's signature and signs
//!    the challenge; that signature is the [`Session`]
//!
//! The session is presented on every later RPC of the connection.

mod group;
mod handshake;
mod manager;

pub use group::{generate_join_code, generate_member_group, group_auth_hash, group_key};
pub use handshake::{authenticate, build_attempt, complete_handshake, timestamp_nonce};
pub use manager::AuthManager;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taask_common::encoding::b64;

use crate::crypto::{KeyPair, Message, SerializablePubKey, Signature};

/// First message of the handshake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attempt {
    pub member_uuid: String,
    pub group_uuid: String,
    pub pub_key: SerializablePubKey,
    /// Signature over `auth_hash || timestamp_le`
    pub auth_hash_signature: Signature,
    /// Unix seconds
    pub timestamp: i64,
}

/// Authority's answer to an [`Attempt`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Challenge sealed to the attempt's public key
    pub enc_challenge: Message,
    pub master_pub_key: SerializablePubKey,
    /// Master key's signature over the plaintext challenge
    pub challenge_signature: Signature,
}

/// Proof of a completed handshake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub member_uuid: String,
    pub group_uuid: String,
    pub challenge_signature: Signature,
}

/// A member's side of an established session
#[derive(Clone, Debug)]
pub struct ActiveSession {
    pub session: Session,
    /// Ephemeral keypair the session was negotiated with
    pub keypair: Arc<KeyPair>,
    /// Authority's long-lived public key
    pub master_pub_key: Arc<KeyPair>,
}

/// What an authority needs to honour a session it didn't issue itself
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub member_uuid: String,
    pub group_uuid: String,
    pub pub_key: SerializablePubKey,
    #[serde(with = "b64")]
    pub challenge: Vec<u8>,
}
