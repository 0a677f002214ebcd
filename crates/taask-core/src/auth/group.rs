//! Group credentials: join codes, auth hashes and the group key.

use rand::Rng;
use sha2::{Digest, Sha256};
use taask_common::MemberGroup;

use crate::crypto::SymKey;

const GROUP_KEY_DOMAIN: &[u8] = b"taask-group-key-v1";
const JOIN_CODE_LEN: usize = 24;

/// SHA-256(join code || passphrase)
pub fn group_auth_hash(join_code: &str, passphrase: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(join_code.as_bytes());
    hasher.update(passphrase.as_bytes());
    hasher.finalize().to_vec()
}

/// The symmetric key every member of a group can derive from the passphrase
pub fn group_key(passphrase: &str) -> SymKey {
    SymKey::derive(GROUP_KEY_DOMAIN, passphrase.as_bytes())
}

/// Random alphanumeric join code
pub fn generate_join_code() -> String {
    let mut rng = rand::rng();

    (0..JOIN_CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// Create a group with a fresh join code and the matching auth hash
pub fn generate_member_group(name: &str, uuid: &str, passphrase: &str) -> MemberGroup {
    let join_code = generate_join_code();
    let auth_hash = group_auth_hash(&join_code, passphrase);

    MemberGroup {
        uuid: uuid.to_string(),
        name: name.to_string(),
        join_code,
        auth_hash,
    }
}
