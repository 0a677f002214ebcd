//! Task envelopes.
//!
//! A task body is encrypted once under a fresh per-task [`SymKey`]. That key
//! is then wrapped twice:
//! - to the executing authority's public key, so runners can be handed the
//!   task without learning the group secret
//! - under the submitting group's key, so the client can read results
//!   without trusting the authority's long-term key material

use std::collections::HashMap;
use std::sync::Arc;
use taask_common::{Result, TaaskError};
use tokio::sync::Mutex;

use crate::crypto::{KeyPair, Message, SymKey};

/// Output of [`seal`]
#[derive(Clone, Debug)]
pub struct SealedTask {
    pub enc_body: Message,
    /// Task key wrapped to the executing authority
    pub master_enc_task_key: Message,
    /// Task key wrapped under the group key
    pub client_enc_task_key: Message,
}

/// The key used to reverse one wrap path
#[derive(Clone, Copy, Debug)]
pub enum UnwrapKey<'a> {
    /// Authority path: the master keypair (private half)
    Authority(&'a KeyPair),
    /// Group path: the group's shared key
    Group(&'a SymKey),
}

/// Encrypt `body` under a fresh task key and wrap that key for both recipients.
///
/// Returns the task key alongside the envelope so the sender can cache it.
pub fn seal(body: &[u8], authority: &KeyPair, group_key: &SymKey) -> Result<(SymKey, SealedTask)> {
    let task_key = SymKey::generate();
    let task_key_json = task_key.to_json();

    let enc_body = task_key.encrypt(body)?;
    let master_enc_task_key = authority.encrypt(&task_key_json)?;
    let client_enc_task_key = group_key.encrypt(&task_key_json)?;

    Ok((
        task_key,
        SealedTask {
            enc_body,
            master_enc_task_key,
            client_enc_task_key,
        },
    ))
}

/// Recover the task key from one of its wrapped copies
pub fn unwrap_task_key(wrapped_key: &Message, unwrap: UnwrapKey<'_>) -> Result<SymKey> {
    let task_key_json = match unwrap {
        UnwrapKey::Authority(keypair) => keypair.decrypt(wrapped_key)?,
        UnwrapKey::Group(group_key) => group_key.decrypt(wrapped_key)?,
    };

    SymKey::from_json(&task_key_json)
}

/// Reverse one wrap path and decrypt `payload` (a body or a result)
pub fn open(wrapped_key: &Message, payload: &Message, unwrap: UnwrapKey<'_>) -> Result<Vec<u8>> {
    let task_key = unwrap_task_key(wrapped_key, unwrap)?;
    task_key.decrypt(payload)
}

/// Wrap a task key for a specific runner's session key
pub fn wrap_for_runner(task_key: &SymKey, runner: &KeyPair) -> Result<Message> {
    runner.encrypt(&task_key.to_json())
}

/// Unwrapped task keys by task uuid, shared by every caller that polls results.
///
/// Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct TaskKeyCache {
    keys: Arc<Mutex<HashMap<String, SymKey>>>,
}

impl TaskKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task_uuid: &str, key: SymKey) {
        self.keys.lock().await.insert(task_uuid.to_string(), key);
    }

    pub async fn get(&self, task_uuid: &str) -> Option<SymKey> {
        self.keys.lock().await.get(task_uuid).cloned()
    }

    pub async fn remove(&self, task_uuid: &str) -> Option<SymKey> {
        self.keys.lock().await.remove(task_uuid)
    }

    pub async fn len(&self) -> usize {
        self.keys.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.lock().await.is_empty()
    }

    /// Cached key for `task_uuid`, unwrapping and caching it on a miss.
    ///
    /// A failed unwrap leaves the cache untouched.
    pub async fn get_or_unwrap(
        &self,
        task_uuid: &str,
        wrapped_key: &Message,
        unwrap: UnwrapKey<'_>,
    ) -> Result<SymKey> {
        let mut keys = self.keys.lock().await;

        if let Some(key) = keys.get(task_uuid) {
            return Ok(key.clone());
        }

        let key = unwrap_task_key(wrapped_key, unwrap).map_err(|e| {
            TaaskError::Crypto(format!("failed to unwrap key for task {}: {}", task_uuid, e))
        })?;
        keys.insert(task_uuid.to_string(), key.clone());

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::group_key;

    const BODY: &[u8] = br#"{"First":3,"Second":4}"#;

    #[test]
    fn test_open_via_authority_path() {
        let authority = KeyPair::generate();
        let group = group_key("hunter2");
        let (_, sealed) = seal(BODY, &authority.public_only(), &group).unwrap();

        let body = open(
            &sealed.master_enc_task_key,
            &sealed.enc_body,
            UnwrapKey::Authority(&authority),
        )
        .unwrap();
        assert_eq!(body, BODY);
    }

    #[test]
    fn test_open_via_group_path() {
        let authority = KeyPair::generate();
        let (_, sealed) = seal(BODY, &authority, &group_key("hunter2")).unwrap();

        // Any member can re-derive the group key from the passphrase
        let member_key = group_key("hunter2");
        let body = open(
            &sealed.client_enc_task_key,
            &sealed.enc_body,
            UnwrapKey::Group(&member_key),
        )
        .unwrap();
        assert_eq!(body, BODY);
    }

    #[test]
    fn test_paths_are_independent() {
        let authority = KeyPair::generate();
        let group = group_key("hunter2");
        let (task_key, sealed) = seal(BODY, &authority, &group).unwrap();

        // Each wrap only opens with its own key
        assert!(unwrap_task_key(&sealed.master_enc_task_key, UnwrapKey::Group(&group)).is_err());
        assert!(
            unwrap_task_key(&sealed.client_enc_task_key, UnwrapKey::Authority(&authority)).is_err()
        );
        assert!(
            unwrap_task_key(&sealed.client_enc_task_key, UnwrapKey::Group(&group_key("wrong")))
                .is_err()
        );

        let a = unwrap_task_key(&sealed.master_enc_task_key, UnwrapKey::Authority(&authority))
            .unwrap();
        let b = unwrap_task_key(&sealed.client_enc_task_key, UnwrapKey::Group(&group)).unwrap();
        assert_eq!(a, task_key);
        assert_eq!(b, task_key);
    }

    #[test]
    fn test_runner_wrap() {
        let runner = KeyPair::generate();
        let (task_key, _) = seal(BODY, &KeyPair::generate(), &group_key("x")).unwrap();

        let wrapped = wrap_for_runner(&task_key, &runner.public_only()).unwrap();
        let unwrapped = unwrap_task_key(&wrapped, UnwrapKey::Authority(&runner)).unwrap();
        assert_eq!(unwrapped, task_key);
    }

    #[tokio::test]
    async fn test_cache_unwraps_once() {
        let cache = TaskKeyCache::new();
        let group = group_key("hunter2");
        let (task_key, sealed) = seal(BODY, &KeyPair::generate(), &group).unwrap();

        let first = cache
            .get_or_unwrap("task-1", &sealed.client_enc_task_key, UnwrapKey::Group(&group))
            .await
            .unwrap();
        assert_eq!(first, task_key);
        assert_eq!(cache.len().await, 1);

        // A cached key is returned even if the unwrap key would now fail
        let wrong = group_key("wrong");
        let second = cache
            .get_or_unwrap("task-1", &sealed.client_enc_task_key, UnwrapKey::Group(&wrong))
            .await
            .unwrap();
        assert_eq!(second, task_key);
    }

    #[tokio::test]
    async fn test_cache_failure_is_isolated() {
        let cache = TaskKeyCache::new();
        let group = group_key("hunter2");
        let (_, good) = seal(BODY, &KeyPair::generate(), &group).unwrap();
        let (_, bad) = seal(BODY, &KeyPair::generate(), &group_key("other")).unwrap();

        let clone = cache.clone();
        assert!(
            clone
                .get_or_unwrap("bad", &bad.client_enc_task_key, UnwrapKey::Group(&group))
                .await
                .is_err()
        );
        assert!(
            cache
                .get_or_unwrap("good", &good.client_enc_task_key, UnwrapKey::Group(&group))
                .await
                .is_ok()
        );
        assert!(cache.get("bad").await.is_none());
        assert_eq!(cache.len().await, 1);
    }
}
