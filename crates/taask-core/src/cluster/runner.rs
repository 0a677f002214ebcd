//! Built-in task execution for the in-process authority.

use serde::{Deserialize, Serialize};
use taask_common::{Result, TaaskError};

use crate::crypto::{KeyPair, Message};
use crate::envelope::{UnwrapKey, unwrap_task_key};
use crate::task::Task;

/// Kind handled by [`execute`]: adds two integers
pub const ADD_KIND: &str = "add";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddInput {
    pub first: i64,
    pub second: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddOutput {
    pub answer: i64,
}

/// Run a decrypted task body, returning the plaintext result
pub fn execute(kind: &str, body: &[u8]) -> Result<Vec<u8>> {
    match kind {
        ADD_KIND => {
            let input: AddInput = serde_json::from_slice(body)
                .map_err(|e| TaaskError::InvalidInput(format!("bad add input: {}", e)))?;
            let answer = input
                .first
                .checked_add(input.second)
                .ok_or_else(|| TaaskError::InvalidInput("add overflowed".to_string()))?;

            Ok(serde_json::to_vec(&AddOutput { answer })?)
        }
        other => Err(TaaskError::InvalidInput(format!("no runner for kind {}", other))),
    }
}

/// A runner identity whose key tasks are re-wrapped to
pub(crate) struct Runner {
    pub uuid: String,
    keypair: KeyPair,
}

impl Runner {
    pub fn new() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            keypair: KeyPair::generate(),
        }
    }

    pub fn public_key(&self) -> KeyPair {
        self.keypair.public_only()
    }

    /// Decrypt an assigned task, execute it and encrypt the result under the
    /// same task key
    pub fn run(&self, task: &Task) -> Result<Message> {
        let wrapped = task.meta.runner_enc_task_key.as_ref().ok_or_else(|| {
            TaaskError::InvalidInput(format!("task {} has no runner key", task.uuid))
        })?;

        let task_key = unwrap_task_key(wrapped, UnwrapKey::Authority(&self.keypair))?;
        let body = task_key.decrypt(&task.enc_body)?;
        let output = execute(&task.kind, &body)?;

        task_key.encrypt(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add() {
        let output = execute(ADD_KIND, br#"{"First":3,"Second":4}"#).unwrap();
        let parsed: AddOutput = serde_json::from_slice(&output).unwrap();
        assert_eq!(parsed, AddOutput { answer: 7 });
    }

    #[test]
    fn test_bad_input() {
        assert!(matches!(
            execute(ADD_KIND, br#"{"First":3}"#),
            Err(TaaskError::InvalidInput(_))
        ));
        assert!(matches!(
            execute(ADD_KIND, format!(r#"{{"First":{},"Second":1}}"#, i64::MAX).as_bytes()),
            Err(TaaskError::InvalidInput(_))
        ));
        assert!(matches!(execute("io.taask.k8s", b"{}"), Err(TaaskError::InvalidInput(_))));
    }
}
