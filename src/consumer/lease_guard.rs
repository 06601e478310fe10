//! Per-partition lease validity: the single gate in front of checkpoint writes.
//!
//! The dispatcher's renewal loop and the partition worker share one
//! [`LeaseGuard`]. The renewal loop extends it or marks it lost; the worker
//! waits on it while receiving and validates it before every checkpoint
//! attempt. Loss is sticky: once marked lost, a guard never becomes held
//! again. A re-acquired partition gets a new guard with a new token.
//!
//! # Example
//!
//! ```text
//! let guard = LeaseGuard::new(&lease, clock, safety_margin);
//!
//! // Renewal loop
//! guard.extend(renewed.expires_at);
//!
//! // Worker, before each checkpoint attempt
//! guard.validate_for_checkpoint()?;
//! store.put_checkpoint(&partition, position, guard.token()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::types::{FencingToken, PartitionId, PartitionLease};

use super::clock::SharedClock;
use super::error::{ConsumerError, ConsumerResult};

/// Why a lease stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The stored lease carries another token or owner.
    FencingMismatch,
    /// The lease lapsed before it could be renewed.
    Expired,
    /// The event source reported that another reader took the partition.
    OwnershipLost,
    /// The checkpoint store holds a newer token.
    StaleFencing,
    /// This process gave the lease up.
    Released,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::FencingMismatch => "fencing_mismatch",
            LossReason::Expired => "expired",
            LossReason::OwnershipLost => "ownership_lost",
            LossReason::StaleFencing => "stale_fencing",
            LossReason::Released => "released",
        }
    }

    /// Map an ownership error onto a loss reason.
    pub fn from_error(err: &ConsumerError) -> Option<Self> {
        match err {
            ConsumerError::FencingMismatch { .. } | ConsumerError::LeaseHeld { .. } => {
                Some(LossReason::FencingMismatch)
            }
            ConsumerError::Expired { .. } => Some(LossReason::Expired),
            ConsumerError::StaleFencing { .. } => Some(LossReason::StaleFencing),
            ConsumerError::OwnershipLost { .. } => Some(LossReason::OwnershipLost),
            _ => None,
        }
    }
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held { expires_at: DateTime<Utc> },
    Lost(LossReason),
}

#[derive(Debug, Clone)]
pub struct LeaseGuard {
    partition: PartitionId,
    token: FencingToken,
    status: Arc<watch::Sender<LeaseStatus>>,
    clock: SharedClock,
    safety_margin: Duration,
}

impl LeaseGuard {
    pub fn new(lease: &PartitionLease, clock: SharedClock, safety_margin: Duration) -> Self {
        let (status, _) = watch::channel(LeaseStatus::Held {
            expires_at: lease.expires_at,
        });
        Self {
            partition: lease.partition_id.clone(),
            token: lease.fencing_token,
            status: Arc::new(status),
            clock,
            safety_margin,
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn token(&self) -> FencingToken {
        self.token
    }

    pub fn status(&self) -> LeaseStatus {
        *self.status.borrow()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.status() {
            LeaseStatus::Held { expires_at } => Some(expires_at),
            LeaseStatus::Lost(_) => None,
        }
    }

    /// Record a successful renewal. Ignored once the guard is lost.
    pub fn extend(&self, expires_at: DateTime<Utc>) {
        self.status.send_if_modified(|status| match status {
            LeaseStatus::Held { expires_at: current } if *current < expires_at => {
                *current = expires_at;
                true
            }
            _ => false,
        });
    }

    /// Mark the lease lost. Returns `true` if this call made the transition.
    pub fn mark_lost(&self, reason: LossReason) -> bool {
        self.status.send_if_modified(|status| match status {
            LeaseStatus::Held { .. } => {
                *status = LeaseStatus::Lost(reason);
                true
            }
            LeaseStatus::Lost(_) => false,
        })
    }

    pub fn is_lost(&self) -> bool {
        matches!(self.status(), LeaseStatus::Lost(_))
    }

    pub fn loss_reason(&self) -> Option<LossReason> {
        match self.status() {
            LeaseStatus::Lost(reason) => Some(reason),
            LeaseStatus::Held { .. } => None,
        }
    }

    /// Resolve once the lease is lost. Cancel-safe.
    pub async fn lost(&self) -> LossReason {
        let mut rx = self.status.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let LeaseStatus::Lost(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                return LossReason::Released;
            }
        }
    }

    /// Check that a checkpoint may be written now.
    ///
    /// Fails with `OwnershipLost` when the lease was lost, and with the
    /// retriable `LeaseTooShort` when the lease expires within the safety
    /// margin (a renewal may still land).
    pub fn validate_for_checkpoint(&self) -> ConsumerResult<()> {
        match self.status() {
            LeaseStatus::Lost(_) => Err(ConsumerError::OwnershipLost {
                partition: self.partition.clone(),
            }),
            LeaseStatus::Held { expires_at } => {
                let remaining = (expires_at - self.clock.now())
                    .to_std()
                    .unwrap_or_default();
                if remaining <= self.safety_margin {
                    Err(ConsumerError::LeaseTooShort {
                        partition: self.partition.clone(),
                        remaining_ms: remaining.as_millis() as u64,
                        margin_ms: self.safety_margin.as_millis() as u64,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}
