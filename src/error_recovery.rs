//! Bounded retry for opening device connections.
//
// When the host starts many workers at once, drivers sometimes fail to find a
// device on the first try. Connection attempts are therefore retried a fixed
// number of times with a fixed sleep before the error is propagated.

use crate::adapters::Transport;
use crate::error::{AppResult, DeviceError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}

impl RetryPolicy {
    /// Policy used for opening instrument connections: 10 attempts, 1 s apart.
    pub fn connection() -> Self {
        Self {
            max_attempts: 10,
            backoff_delay: Duration::from_secs(1),
        }
    }

    /// A single attempt with no retry.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Open `transport`, retrying according to `policy`.
pub async fn open_with_retry(transport: &mut dyn Transport, policy: &RetryPolicy) -> AppResult<()> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        info!(device = transport.name(), attempt, "Connection attempt");
        match transport.open().await {
            Ok(()) => {
                info!(device = transport.name(), "Connected");
                return Ok(());
            }
            Err(err) if attempt < max_attempts => {
                warn!(device = transport.name(), attempt, error = %err, "Connection attempt failed, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(device = transport.name(), attempts = attempt, error = %err, "Giving up on connection");
                return Err(err);
            }
        }
    }
}

/// Collect the errors from a sequence of shutdown steps into one result.
pub fn collect_shutdown_errors(errors: Vec<DeviceError>) -> AppResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DeviceError::ShutdownFailed(errors))
    }
}
