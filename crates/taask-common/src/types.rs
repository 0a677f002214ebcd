//! Core types shared across Taask components.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encoding::b64;

/// Lifecycle status of a task.
///
/// ```text
/// (none) -> pending -> waiting -> queued -> running -> completed
///                         |         |         |
///                         +--> retrying <-----+---> failed
///                                 |                   |
///                                 +--> queued         +--> retrying
/// ```
///
/// `Completed` is terminal. The full table lives in [`TaskStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Received, but the client does not want it scheduled yet
    Pending,
    /// Received and waiting to be scheduled to a runner
    Waiting,
    /// Scheduled to a runner
    Queued,
    /// The runner has begun executing it
    Running,
    /// The runner finished it (the result itself may describe an error)
    #[serde(rename = "complete")]
    Completed,
    /// The runner could not complete it
    Failed,
    /// Backing off before being re-queued
    Retrying,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Waiting,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
    ];

    /// Returns true if a task in `from` (`None` = not yet created) may move to `to`
    pub fn can_transition(from: Option<TaskStatus>, to: TaskStatus) -> bool {
        use TaskStatus::*;

        match from {
            None => matches!(to, Pending | Waiting),
            Some(Pending) => to == Waiting,
            Some(Waiting) => matches!(to, Queued | Retrying),
            Some(Queued) => matches!(to, Running | Failed | Retrying),
            Some(Running) => matches!(to, Completed | Failed | Retrying),
            Some(Failed) => to == Retrying,
            Some(Retrying) => to == Queued,
            Some(Completed) => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "complete",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Completed
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle of a partner link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    AwaitingDataKey,
    Streaming,
    Unhealthy,
}

impl ConnectionState {
    pub fn is_streaming(&self) -> bool {
        *self == Self::Streaming
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::AwaitingDataKey => "awaiting-data-key",
            Self::Streaming => "streaming",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Which surface of a cluster a service endpoint exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Client,
    Runner,
    Partner,
}

impl ServiceType {
    pub fn default_port(&self) -> &'static str {
        use crate::constants::*;

        match self {
            Self::Client => DEFAULT_CLIENT_PORT,
            Self::Runner => DEFAULT_RUNNER_PORT,
            Self::Partner => DEFAULT_PARTNER_PORT,
        }
    }
}

/// A cluster endpoint a member connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub host: String,
    pub port: String,
}

impl Service {
    /// Endpoint for `service_type` on `host`, using the type's default port
    pub fn new(service_type: ServiceType, host: impl Into<String>) -> Self {
        Self {
            service_type,
            host: host.into(),
            port: service_type.default_port().to_string(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A named credential domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberGroup {
    pub uuid: String,
    pub name: String,
    pub join_code: String,

    /// SHA-256(join code || passphrase); only ever sent signed and nonce-salted
    #[serde(with = "b64")]
    pub auth_hash: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_exhaustive() {
        use TaskStatus::*;

        let allowed: &[(Option<TaskStatus>, TaskStatus)] = &[
            (None, Pending),
            (None, Waiting),
            (Some(Pending), Waiting),
            (Some(Waiting), Queued),
            (Some(Waiting), Retrying),
            (Some(Queued), Running),
            (Some(Queued), Failed),
            (Some(Queued), Retrying),
            (Some(Running), Completed),
            (Some(Running), Failed),
            (Some(Running), Retrying),
            (Some(Failed), Retrying),
            (Some(Retrying), Queued),
        ];

        let froms = std::iter::once(None).chain(TaskStatus::ALL.iter().copied().map(Some));
        let mut checked = 0;
        for from in froms {
            for to in TaskStatus::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    TaskStatus::can_transition(from, to),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
                checked += 1;
            }
        }
        assert_eq!(checked, 8 * 7);
    }

    #[test]
    fn test_completed_is_terminal() {
        for to in TaskStatus::ALL {
            assert!(!TaskStatus::can_transition(Some(TaskStatus::Completed), to));
        }
        assert!(TaskStatus::Completed.is_terminal());
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"complete\"");

        let parsed: TaskStatus = serde_json::from_str("\"retrying\"").unwrap();
        assert_eq!(parsed, TaskStatus::Retrying);
        assert_eq!(TaskStatus::Completed.to_string(), "complete");
    }

    #[test]
    fn test_service_defaults() {
        let service = Service::new(ServiceType::Partner, "taask-server");
        assert_eq!(service.port, "3690");
        assert_eq!(service.address(), "taask-server:3690");
    }
}
