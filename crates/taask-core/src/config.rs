//! Configuration: core tunables and persisted member auth records.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use taask_common::constants::{
    self, DEFAULT_AUTH_SKEW_SECS, PARTNER_BACKOFF_INITIAL_SECS, PARTNER_BACKOFF_MAX_SECS,
    PARTNER_CHANNEL_CAPACITY, PARTNER_FLUSH_INTERVAL_SECS, PARTNER_HEALTH_CHECK_INTERVAL_SECS,
    RESULT_POLL_INTERVAL_MILLIS,
};
use taask_common::constants::groups::{PARTNER_GROUP_NAME, PARTNER_GROUP_UUID};
use taask_common::{MemberGroup, Result, Service, TaaskError};

use crate::auth::group_key;
use crate::crypto::SymKey;

/// Core tunables
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Allowed clock difference for auth attempts, in seconds
    #[serde(default = "default_auth_skew")]
    pub auth_skew_secs: u64,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// First partner reconnect delay
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,

    /// Reconnect delay cap
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Delay between result checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_millis: u64,

    /// Buffered frames per direction of an in-process update stream
    #[serde(default = "default_channel_capacity")]
    pub partner_channel_capacity: usize,
}

fn default_auth_skew() -> u64 { DEFAULT_AUTH_SKEW_SECS }
fn default_flush_interval() -> u64 { PARTNER_FLUSH_INTERVAL_SECS }
fn default_health_check_interval() -> u64 { PARTNER_HEALTH_CHECK_INTERVAL_SECS }
fn default_backoff_initial() -> u64 { PARTNER_BACKOFF_INITIAL_SECS }
fn default_backoff_max() -> u64 { PARTNER_BACKOFF_MAX_SECS }
fn default_poll_interval() -> u64 { RESULT_POLL_INTERVAL_MILLIS }
fn default_channel_capacity() -> usize { PARTNER_CHANNEL_CAPACITY }

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            auth_skew_secs: default_auth_skew(),
            flush_interval_secs: default_flush_interval(),
            health_check_interval_secs: default_health_check_interval(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            poll_interval_millis: default_poll_interval(),
            partner_channel_capacity: default_channel_capacity(),
        }
    }
}

impl CoreConfig {
    /// Load from an optional file, then `TAASK_*` environment variables.
    ///
    /// A missing file falls back to defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            } else {
                tracing::warn!(path = %path, "Config file not found, using defaults");
            }
        }

        let config: Self = builder
            .add_source(config::Environment::with_prefix(constants::env::CONFIG_PREFIX))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TaaskError::Config(format!("failed to load core config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.flush_interval_secs == 0 || self.health_check_interval_secs == 0 {
            return Err(TaaskError::Config("partner intervals must be non-zero".to_string()));
        }
        if self.backoff_initial_secs == 0 || self.backoff_max_secs < self.backoff_initial_secs {
            return Err(TaaskError::Config(format!(
                "invalid backoff bounds {}s..{}s",
                self.backoff_initial_secs, self.backoff_max_secs
            )));
        }
        if self.partner_channel_capacity == 0 {
            return Err(TaaskError::Config("partner channel capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

/// A member's persisted credentials.
///
/// Holds the group passphrase, so it is only ever read from the member's own
/// disk, never sent anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAuthConfig {
    #[serde(default = "default_auth_version")]
    pub version: String,

    #[serde(rename = "type", default = "default_auth_type")]
    pub config_type: String,

    pub member_group: MemberGroup,

    #[serde(default)]
    pub passphrase: String,

    /// Where the authority (or partner) for this record listens
    #[serde(default)]
    pub service: Option<Service>,
}

fn default_auth_version() -> String { constants::MEMBER_AUTH_CONFIG_VERSION.to_string() }
fn default_auth_type() -> String { constants::MEMBER_AUTH_CONFIG_TYPE.to_string() }

impl LocalAuthConfig {
    pub fn new(member_group: MemberGroup, passphrase: &str, service: Option<Service>) -> Self {
        Self {
            version: default_auth_version(),
            config_type: default_auth_type(),
            member_group,
            passphrase: passphrase.to_string(),
            service,
        }
    }

    /// Read a YAML or JSON auth record
    pub fn from_file(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(TaaskError::Config(format!("auth config {} does not exist", path)));
        }

        config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TaaskError::Config(format!("failed to load auth config {}: {}", path, e)))
    }

    /// Key derived from the group passphrase
    pub fn group_key(&self) -> SymKey {
        group_key(&self.passphrase)
    }

    /// Check this is a partner record and apply the partner host override.
    pub fn into_partner_config(self) -> Result<Self> {
        self.into_partner_config_with(std::env::var(constants::env::PARTNER_HOST).ok())
    }

    fn into_partner_config_with(mut self, host_override: Option<String>) -> Result<Self> {
        if self.member_group.name != PARTNER_GROUP_NAME {
            return Err(TaaskError::Config(format!(
                "partner auth config has group name {:?}, expected {:?}",
                self.member_group.name, PARTNER_GROUP_NAME
            )));
        }
        if self.member_group.uuid != PARTNER_GROUP_UUID {
            return Err(TaaskError::Config(format!(
                "partner auth config has group uuid {}, expected {}",
                self.member_group.uuid, PARTNER_GROUP_UUID
            )));
        }

        let service = self
            .service
            .as_mut()
            .ok_or_else(|| TaaskError::Config("partner auth config has no service".to_string()))?;

        if let Some(host) = host_override.filter(|host| !host.trim().is_empty()) {
            tracing::info!(host = %host, "Using partner host from environment");
            service.host = host;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::generate_member_group;
    use taask_common::ServiceType;

    fn partner_config() -> LocalAuthConfig {
        LocalAuthConfig::new(
            generate_member_group(PARTNER_GROUP_NAME, PARTNER_GROUP_UUID, "secret"),
            "secret",
            Some(Service::new(ServiceType::Partner, "cluster-b")),
        )
    }

    #[test]
    fn test_core_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.auth_skew_secs, 30);
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.backoff_max(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_core_load_without_file() {
        let config = CoreConfig::load(Some("/nonexistent/taask.yaml")).unwrap();
        assert_eq!(config.health_check_interval_secs, 5);
    }

    #[test]
    fn test_core_rejects_inverted_backoff() {
        let config = CoreConfig {
            backoff_initial_secs: 60,
            backoff_max_secs: 5,
            ..CoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(TaaskError::Config(_))));
    }

    #[test]
    fn test_auth_config_from_yaml() {
        let dir = std::env::temp_dir().join(format!("taask-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("member-auth.yaml");

        let group = generate_member_group("default", "group-1", "hunter2");
        let yaml = format!(
            r#"version: "0.1"
type: member-auth
member_group:
  uuid: group-1
  name: default
  join_code: "{}"
  auth_hash: "{}"
passphrase: hunter2
service:
  type: client
  host: localhost
  port: "30688"
"#,
            group.join_code,
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &group.auth_hash),
        );
        std::fs::write(&path, yaml).unwrap();

        let config = LocalAuthConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.member_group, group);
        assert_eq!(config.group_key(), group_key("hunter2"));
        assert_eq!(config.service.unwrap().address(), "localhost:30688");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partner_validation() {
        tokio_test::assert_ok!(partner_config().into_partner_config());

        let mut wrong_name = partner_config();
        wrong_name.member_group.name = "default".into();
        assert!(matches!(wrong_name.into_partner_config(), Err(TaaskError::Config(_))));

        let mut wrong_uuid = partner_config();
        wrong_uuid.member_group.uuid = "not-the-partner-group".into();
        assert!(matches!(wrong_uuid.into_partner_config(), Err(TaaskError::Config(_))));

        let mut no_service = partner_config();
        no_service.service = None;
        assert!(matches!(no_service.into_partner_config(), Err(TaaskError::Config(_))));
    }

    #[test]
    fn test_partner_host_override() {
        let config = partner_config()
            .into_partner_config_with(Some("cluster-c".to_string()))
            .unwrap();
        let service = config.service.unwrap();
        assert_eq!(service.host, "cluster-c");
        assert_eq!(service.port, constants::DEFAULT_PARTNER_PORT);

        for unset in [None, Some(String::new()), Some("   ".to_string())] {
            let config = partner_config().into_partner_config_with(unset).unwrap();
            assert_eq!(config.service.unwrap().host, "cluster-b");
        }

        // The override never rescues a record that is not a partner record
        let mut wrong_group = partner_config();
        wrong_group.member_group.uuid = "not-the-partner-group".into();
        let result = wrong_group.into_partner_config_with(Some("cluster-c".to_string()));
        assert!(matches!(result, Err(TaaskError::Config(_))));
    }
}
