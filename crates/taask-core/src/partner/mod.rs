//! Cross-cluster partner replication.
//!
//! Two authorities pair up over a single authenticated, encrypted update
//! stream. Each side batches its local deltas (new tasks, task updates,
//! groups, sessions) and flushes them to the other, which applies them to
//! its own state.
//!
//! Connection lifecycle on the dialing side:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> AwaitingDataKey -> Streaming
//!       ^                                                               |
//!       +------------------------- Unhealthy <--------------------------+
//! ```
//!
//! Any failure before `Streaming` returns to `Disconnected`; the outgoing
//! manager retries with exponential backoff.

mod backoff;
mod health;
mod manager;
mod stream;
mod update;

pub use backoff::Backoff;
pub use health::HealthChecker;
pub use manager::{LinkDirection, Manager, Partner};
pub use update::{PartnerUpdate, UpdateQueue};

use async_trait::async_trait;
use taask_common::Result;

/// Outcome of applying one received batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub rejected: usize,
}

/// Where received partner updates are applied.
///
/// Individual rejected entries are counted, not returned as errors; an `Err`
/// means the whole batch could not be processed.
#[async_trait]
pub trait ReplicaSink: Send + Sync {
    async fn apply_partner_update(&self, update: PartnerUpdate) -> Result<ApplyReport>;
}
