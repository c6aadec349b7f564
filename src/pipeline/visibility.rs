//! Eventual-consistency tolerant existence checks
//!
//! A remote read may lag a very recent write, so "not found" right after
//! an upload is polled on a fixed schedule before it is believed.

use crate::config::PollPolicy;
use crate::storage::{MediaStore, ResourceKind, StorageError};
use tracing::{debug, warn};

/// Result of a bounded visibility wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceStatus {
    pub exists: bool,
    pub duration: Option<f64>,
}

/// Poll until `public_id` is visible or the policy is exhausted
///
/// Only `NotFound` is retried; any other error class aborts immediately.
/// Exhaustion yields `exists: false` rather than an error.
pub async fn await_visibility<S: MediaStore + ?Sized>(
    media: &S,
    kind: ResourceKind,
    public_id: &str,
    policy: &PollPolicy,
) -> Result<ResourceStatus, StorageError> {
    for attempt in 1..=policy.attempts {
        match media.resource_info(kind, public_id).await {
            Ok(info) => {
                debug!("{} visible on attempt {}", public_id, attempt);
                return Ok(ResourceStatus {
                    exists: true,
                    duration: info.duration,
                });
            }
            Err(StorageError::NotFound(_)) => {
                debug!(
                    "{} not yet visible (attempt {}/{})",
                    public_id, attempt, policy.attempts
                );
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        "{} still not visible after {} attempts",
        public_id, policy.attempts
    );
    Ok(ResourceStatus {
        exists: false,
        duration: None,
    })
}
