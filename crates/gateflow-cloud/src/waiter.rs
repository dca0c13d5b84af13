//! Readiness polling
//!
//! Some resources report success on create but only become usable later
//! (an appliance has to boot before the gateway can be activated against it).

use crate::error::{CloudError, Result};
use crate::provider::{Readiness, ResourceProvider};
use gateflow_core::ResourceKind;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Polling configuration
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Give up after this long
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
        }
    }
}

impl PollConfig {
    /// Interval after the given poll (0-based)
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        let interval =
            self.initial_interval.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(interval as u64).min(self.max_interval)
    }
}

/// Poll until the resource is ready
///
/// - `Readiness::Failed` becomes [`CloudError::Rejected`]
/// - an exceeded deadline becomes [`CloudError::ReadinessTimeout`]
/// - cancellation becomes [`CloudError::Cancelled`]
///
/// Transient poll errors are tolerated until the deadline.
#[tracing::instrument(skip(provider, config, cancel))]
pub async fn wait_until_ready(
    provider: &dyn ResourceProvider,
    resource: &str,
    kind: ResourceKind,
    id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled(format!(
                "stopped waiting for {resource}"
            )));
        }

        let last_status = match provider.poll(kind, id).await {
            Ok(Readiness::Ready) => {
                info!(
                    resource,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Resource is ready"
                );
                return Ok(());
            }
            Ok(Readiness::Pending(status)) => {
                debug!(resource, %status, attempt, "Not ready yet");
                status
            }
            Ok(Readiness::Failed(reason)) => {
                return Err(CloudError::rejected(resource, reason));
            }
            Err(e) if e.is_transient() => {
                debug!(resource, error = %e, "Transient error while polling");
                e.to_string()
            }
            Err(e) => return Err(e),
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(CloudError::ReadinessTimeout {
                resource: resource.to_string(),
                last_status,
                waited: now - started,
            });
        }

        let sleep = config
            .interval_for_attempt(attempt)
            .min(deadline - now);
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CloudError::Cancelled(format!(
                    "stopped waiting for {resource}"
                )));
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
