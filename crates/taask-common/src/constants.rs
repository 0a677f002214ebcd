//! Shared constants for Taask components.

/// Default port for the client-facing task service
pub const DEFAULT_CLIENT_PORT: &str = "30688";

/// Default port for the runner-facing service
pub const DEFAULT_RUNNER_PORT: &str = "3687";

/// Default port for the partner replication service
pub const DEFAULT_PARTNER_PORT: &str = "3690";

/// Allowed clock skew for handshake timestamps (seconds)
pub const DEFAULT_AUTH_SKEW_SECS: u64 = 30;

/// Partner update flush interval (seconds)
pub const PARTNER_FLUSH_INTERVAL_SECS: u64 = 5;

/// Partner health-check ping interval (seconds)
pub const PARTNER_HEALTH_CHECK_INTERVAL_SECS: u64 = 5;

/// First reconnect delay after a failed partner connection (seconds)
pub const PARTNER_BACKOFF_INITIAL_SECS: u64 = 5;

/// Ceiling for the doubling reconnect delay (5 minutes)
pub const PARTNER_BACKOFF_MAX_SECS: u64 = 300;

/// Interval between result checks while waiting on a task (milliseconds)
pub const RESULT_POLL_INTERVAL_MILLIS: u64 = 1000;

/// Buffer size of each direction of a partner update stream
pub const PARTNER_CHANNEL_CAPACITY: usize = 64;

/// Task kind used when a submitted task doesn't set one
pub const DEFAULT_TASK_KIND: &str = "io.taask.k8s";

/// Version and type stamped into member auth config records
pub const MEMBER_AUTH_CONFIG_VERSION: &str = "0.1.0";
pub const MEMBER_AUTH_CONFIG_TYPE: &str = "io.taask.member.auth";

/// Environment variables
pub mod env {
    /// Overrides the configured partner host at startup
    pub const PARTNER_HOST: &str = "TAASK_PARTNER_HOST";

    /// Prefix for `CoreConfig` overrides (e.g. TAASK_AUTH_SKEW_SECS)
    pub const CONFIG_PREFIX: &str = "TAASK";
}

/// Well-known group identities
pub mod groups {
    /// Admin clients
    pub const ADMIN_GROUP_UUID: &str = "7a3b6f1e-0c2d-4e5f-8a9b-0c1d2e3f4a5b";

    /// Default runner group
    pub const DEFAULT_GROUP_UUID: &str = "1d6e8c2a-4b3f-4a7e-9c1d-2e3f4a5b6c7d";

    /// Partner clusters
    pub const PARTNER_GROUP_UUID: &str = "9e8d7c6b-5a4f-4e3d-8c2b-1a0f9e8d7c6b";

    /// Name partner auth configs must carry
    pub const PARTNER_GROUP_NAME: &str = "partner";
}
