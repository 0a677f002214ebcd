//! Liveness of a partner update stream.

use std::time::Duration;
use tokio::sync::watch;

use crate::transport::{UpdateRequest, UpdateSender};

/// Tracks whether the current partner stream is alive.
///
/// Starts healthy. Once marked unhealthy it stays that way; a new stream gets
/// a new checker.
#[derive(Debug)]
pub struct HealthChecker {
    healthy: watch::Sender<bool>,
    reason: std::sync::Mutex<Option<String>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        let (healthy, _) = watch::channel(true);
        Self {
            healthy,
            reason: std::sync::Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    /// Record the first failure and wake everyone waiting in [`Self::unhealthy`]
    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.reason.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if slot.is_none() {
                tracing::warn!(reason = %reason, "Partner stream unhealthy");
                *slot = Some(reason);
            }
        }
        self.healthy.send_replace(false);
    }

    /// Why the stream was marked unhealthy, if it was
    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Resolves once the stream is unhealthy, with the reason
    pub async fn unhealthy(&self) -> String {
        let mut rx = self.healthy.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped mid-wait
        let _ = rx.wait_for(|healthy| !*healthy).await;
        self.reason().unwrap_or_else(|| "partner stream closed".to_string())
    }

    /// Ping the partner every `interval` until a ping fails or the stream is
    /// already known to be unhealthy.
    pub async fn run(&self, sender: UpdateSender, interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = sender.send(UpdateRequest::health_check()).await {
                        self.mark_unhealthy(format!("health check failed: {}", e));
                        return;
                    }
                    tracing::trace!("Partner health check sent");
                }
                _ = self.unhealthy() => return,
            }
        }
    }
}
