//! Lease store: versioned lease records plus fleet membership heartbeats.
//!
//! The store is deliberately dumb: it reads records and performs conditional
//! writes. All lease semantics (liveness, token increments, ownership checks)
//! live in [`LeaseManager`](super::lease_manager::LeaseManager).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::{ObjectStore, UpdateVersion};

use crate::types::{MemberRecord, OwnerId, PartitionId, PartitionLease};

use super::error::ConsumerResult;
use super::keys::StoreLayout;
use super::object_store::{
    CasOutcome, Versioned, delete_record, list_json, overwrite_json, read_json, write_json_if,
};

/// A lease record and the version it was read at.
pub type StoredLease = Versioned<PartitionLease>;

/// Durable, linearizable storage for lease and member records.
///
/// Implementations must make `write_lease` atomic with respect to the
/// version check: of two writers holding the same `expected` version, at
/// most one observes `CasOutcome::Written`.
#[async_trait]
pub trait LeaseStore: Send + Sync + Debug {
    /// Read the lease record for a partition, if one was ever written.
    async fn read_lease(&self, partition: &PartitionId) -> ConsumerResult<Option<StoredLease>>;

    /// Write a lease record if the stored record is still at `expected`.
    ///
    /// `expected = None` creates the record and conflicts if it exists.
    async fn write_lease(
        &self,
        lease: &PartitionLease,
        expected: Option<&UpdateVersion>,
    ) -> ConsumerResult<CasOutcome>;

    /// All lease records, live or expired.
    async fn list_leases(&self) -> ConsumerResult<Vec<PartitionLease>>;

    /// Create or refresh this process's membership record.
    async fn put_member(&self, member: &MemberRecord) -> ConsumerResult<()>;

    /// Remove a membership record. Missing records are not an error.
    async fn remove_member(&self, owner: &OwnerId) -> ConsumerResult<()>;

    /// All membership records, live or expired.
    async fn list_members(&self) -> ConsumerResult<Vec<MemberRecord>>;
}

/// Lease store backed by any `object_store` backend with conditional puts.
#[derive(Debug, Clone)]
pub struct ObjectLeaseStore {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
}

impl ObjectLeaseStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }
}

#[async_trait]
impl LeaseStore for ObjectLeaseStore {
    async fn read_lease(&self, partition: &PartitionId) -> ConsumerResult<Option<StoredLease>> {
        read_json(self.store.as_ref(), &self.layout.lease(partition)).await
    }

    async fn write_lease(
        &self,
        lease: &PartitionLease,
        expected: Option<&UpdateVersion>,
    ) -> ConsumerResult<CasOutcome> {
        let path = self.layout.lease(&lease.partition_id);
        write_json_if(self.store.as_ref(), &path, lease, expected).await
    }

    async fn list_leases(&self) -> ConsumerResult<Vec<PartitionLease>> {
        let records = list_json(self.store.as_ref(), &self.layout.leases_dir()).await?;
        Ok(records.into_iter().map(|r| r.value).collect())
    }

    async fn put_member(&self, member: &MemberRecord) -> ConsumerResult<()> {
        let path = self.layout.member(&member.owner_id);
        overwrite_json(self.store.as_ref(), &path, member).await
    }

    async fn remove_member(&self, owner: &OwnerId) -> ConsumerResult<()> {
        delete_record(self.store.as_ref(), &self.layout.member(owner)).await
    }

    async fn list_members(&self) -> ConsumerResult<Vec<MemberRecord>> {
        let records = list_json(self.store.as_ref(), &self.layout.members_dir()).await?;
        Ok(records.into_iter().map(|r| r.value).collect())
    }
}
