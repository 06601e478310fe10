//! Lease acquisition, renewal and release with fencing tokens.
//!
//! Every operation is a read → evaluate → conditional write loop against the
//! [`LeaseStore`]. A CAS conflict means another process wrote the record in
//! between; the loop re-reads and re-evaluates, so of two racing acquirers
//! exactly one wins and the other observes `LeaseHeld`.
//!
//! # Token Rules
//!
//! - A first-ever acquisition gets [`FencingToken::FIRST`].
//! - Every later acquisition gets `stored_token + 1`, including when the same
//!   owner re-acquires its own live lease. Records are never deleted, so the
//!   counter survives expiry and release.
//! - Renewal keeps the token; release keeps the token and moves `expires_at`
//!   to now.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info};

use crate::constants::MAX_CAS_ATTEMPTS;
use crate::types::{FencingToken, OwnerId, PartitionId, PartitionLease};

use super::clock::{SharedClock, add_duration};
use super::error::{ConsumerError, ConsumerResult};
use super::lease_store::LeaseStore;
use super::metrics::record_lease_operation;
use super::object_store::CasOutcome;
use super::observability::{LeaseOperation, lease_operation_span};

#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    clock: SharedClock,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Acquire the lease on `partition` for `owner`.
    ///
    /// Succeeds when no live lease exists or the live lease already belongs
    /// to `owner`; the returned lease always carries a fresh token.
    pub async fn acquire_lease(
        &self,
        partition: &PartitionId,
        owner: &OwnerId,
        duration: Duration,
    ) -> ConsumerResult<PartitionLease> {
        let span = lease_operation_span(partition, owner, LeaseOperation::Acquire);
        let result = self
            .acquire_inner(partition, owner, duration)
            .instrument(span)
            .await;
        record_lease_operation("acquire", status_label(&result));
        result
    }

    async fn acquire_inner(
        &self,
        partition: &PartitionId,
        owner: &OwnerId,
        duration: Duration,
    ) -> ConsumerResult<PartitionLease> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.store.read_lease(partition).await?;

            let token = match current.as_ref().map(|c| &c.value) {
                Some(stored) if stored.is_live(now) && &stored.owner_id != owner => {
                    return Err(ConsumerError::LeaseHeld {
                        partition: partition.clone(),
                        holder: stored.owner_id.to_string(),
                        expires_at: stored.expires_at,
                    });
                }
                Some(stored) => stored.fencing_token.next(),
                None => FencingToken::FIRST,
            };

            let lease = PartitionLease {
                partition_id: partition.clone(),
                owner_id: owner.clone(),
                fencing_token: token,
                expires_at: add_duration(now, duration),
            };

            let expected = current.as_ref().map(|c| &c.version);
            match self.store.write_lease(&lease, expected).await? {
                CasOutcome::Written(_) => {
                    info!(
                        partition = %partition,
                        owner = %owner,
                        token = %token,
                        expires_at = %lease.expires_at,
                        "Acquired partition lease"
                    );
                    return Ok(lease);
                }
                CasOutcome::Conflict => {
                    debug!(partition = %partition, attempt, "Lease CAS conflict on acquire");
                }
            }
        }

        Err(cas_exhausted(partition, "acquire"))
    }

    /// Extend a lease this process holds.
    ///
    /// Fails with `FencingMismatch` when the stored record carries another
    /// token or owner, and with `Expired` when the lease lapsed, even if
    /// nobody else has claimed it yet.
    pub async fn renew_lease(
        &self,
        partition: &PartitionId,
        owner: &OwnerId,
        token: FencingToken,
        duration: Duration,
    ) -> ConsumerResult<PartitionLease> {
        let span = lease_operation_span(partition, owner, LeaseOperation::Renew);
        let result = self
            .renew_inner(partition, owner, token, duration)
            .instrument(span)
            .await;
        record_lease_operation("renew", status_label(&result));
        result
    }

    async fn renew_inner(
        &self,
        partition: &PartitionId,
        owner: &OwnerId,
        token: FencingToken,
        duration: Duration,
    ) -> ConsumerResult<PartitionLease> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some(current) = self.store.read_lease(partition).await? else {
                return Err(ConsumerError::FencingMismatch {
                    partition: partition.clone(),
                    held: token,
                    stored: None,
                });
            };

            let stored = &current.value;
            if stored.fencing_token != token || &stored.owner_id != owner {
                return Err(ConsumerError::FencingMismatch {
                    partition: partition.clone(),
                    held: token,
                    stored: Some(stored.fencing_token),
                });
            }
            if !stored.is_live(now) {
                return Err(ConsumerError::Expired {
                    partition: partition.clone(),
                });
            }

            let renewed = PartitionLease {
                expires_at: add_duration(now, duration),
                ..stored.clone()
            };

            match self.store.write_lease(&renewed, Some(&current.version)).await? {
                CasOutcome::Written(_) => {
                    debug!(
                        partition = %partition,
                        token = %token,
                        expires_at = %renewed.expires_at,
                        "Renewed partition lease"
                    );
                    return Ok(renewed);
                }
                CasOutcome::Conflict => {
                    debug!(partition = %partition, attempt, "Lease CAS conflict on renew");
                }
            }
        }

        Err(cas_exhausted(partition, "renew"))
    }

    /// Give up a lease early so another process can claim it immediately.
    ///
    /// Best-effort and idempotent: releasing a lease that expired, belongs to
    /// someone else, or was already released is a no-op, and so is losing a
    /// CAS race. Store failures are returned for the caller to log.
    pub async fn release_lease(
        &self,
        partition: &PartitionId,
        owner: &OwnerId,
        token: FencingToken,
    ) -> ConsumerResult<()> {
        let span = lease_operation_span(partition, owner, LeaseOperation::Release);
        let result = self
            .release_inner(partition, owner, token)
            .instrument(span)
            .await;
        record_lease_operation("release", status_label(&result));
        result
    }

    async fn release_inner(
        &self,
        partition: &PartitionId,
        owner: &OwnerId,
        token: FencingToken,
    ) -> ConsumerResult<()> {
        let now = self.clock.now();
        let Some(current) = self.store.read_lease(partition).await? else {
            return Ok(());
        };

        let stored = &current.value;
        if stored.fencing_token != token || !stored.is_held_by(owner, now) {
            debug!(partition = %partition, token = %token, "Release skipped, lease not held");
            return Ok(());
        }

        let released = PartitionLease {
            expires_at: now,
            ..stored.clone()
        };

        match self.store.write_lease(&released, Some(&current.version)).await? {
            CasOutcome::Written(_) => {
                info!(partition = %partition, owner = %owner, token = %token, "Released partition lease");
            }
            CasOutcome::Conflict => {
                debug!(partition = %partition, "Release lost CAS race, treating as released");
            }
        }
        Ok(())
    }

    /// Current lease record for a partition, live or not.
    pub async fn current_lease(
        &self,
        partition: &PartitionId,
    ) -> ConsumerResult<Option<PartitionLease>> {
        Ok(self.store.read_lease(partition).await?.map(|c| c.value))
    }
}

fn status_label<T>(result: &ConsumerResult<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.metric_label(),
    }
}

fn cas_exhausted(partition: &PartitionId, operation: &str) -> ConsumerError {
    ConsumerError::Store(format!(
        "lease {} for {} still contended after {} attempts",
        operation, partition, MAX_CAS_ATTEMPTS
    ))
}
