//! Test doubles for the leasing and consumption layers.
//!
//! Available when the `test-utilities` feature is enabled, or during unit
//! tests:
//!
//! ```toml
//! [dev-dependencies]
//! leasehold = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use object_store::UpdateVersion;
use object_store::memory::InMemory;

use crate::types::{Checkpoint, Event, FencingToken, MemberRecord, OwnerId, PartitionId, PartitionLease, Position};

use super::checkpoint_store::{CheckpointStore, ObjectCheckpointStore};
use super::clock::SharedClock;
use super::error::{ConsumerError, ConsumerResult};
use super::handler::{EventHandler, HandlerError, PartitionContext, StopReason};
use super::keys::StoreLayout;
use super::lease_store::{LeaseStore, ObjectLeaseStore, StoredLease};
use super::object_store::CasOutcome;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lease and checkpoint stores sharing one in-memory object store.
pub fn memory_stores(clock: SharedClock) -> (Arc<ObjectLeaseStore>, Arc<ObjectCheckpointStore>) {
    let store = Arc::new(InMemory::new());
    let layout = StoreLayout::new("test", "group");
    (
        Arc::new(ObjectLeaseStore::new(store.clone(), layout.clone())),
        Arc::new(ObjectCheckpointStore::new(store, layout, clock)),
    )
}

// ============================================================================
// Lease Store
// ============================================================================

/// Lease store wrapper that fails every call while switched off.
#[derive(Debug)]
pub struct FlakyLeaseStore {
    inner: Arc<dyn LeaseStore>,
    failing: AtomicBool,
    calls_failed: AtomicU32,
}

impl FlakyLeaseStore {
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            calls_failed: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls_failed(&self) -> u32 {
        self.calls_failed.load(Ordering::SeqCst)
    }

    fn check(&self) -> ConsumerResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.calls_failed.fetch_add(1, Ordering::SeqCst);
            return Err(ConsumerError::Store("injected lease store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FlakyLeaseStore {
    async fn read_lease(&self, partition: &PartitionId) -> ConsumerResult<Option<StoredLease>> {
        self.check()?;
        self.inner.read_lease(partition).await
    }

    async fn write_lease(
        &self,
        lease: &PartitionLease,
        expected: Option<&UpdateVersion>,
    ) -> ConsumerResult<CasOutcome> {
        self.check()?;
        self.inner.write_lease(lease, expected).await
    }

    async fn list_leases(&self) -> ConsumerResult<Vec<PartitionLease>> {
        self.check()?;
        self.inner.list_leases().await
    }

    async fn put_member(&self, member: &MemberRecord) -> ConsumerResult<()> {
        self.check()?;
        self.inner.put_member(member).await
    }

    async fn remove_member(&self, owner: &OwnerId) -> ConsumerResult<()> {
        self.check()?;
        self.inner.remove_member(owner).await
    }

    async fn list_members(&self) -> ConsumerResult<Vec<MemberRecord>> {
        self.check()?;
        self.inner.list_members().await
    }
}

// ============================================================================
// Checkpoint Store
// ============================================================================

/// One `put_checkpoint` call as seen by [`RecordingCheckpointStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub partition_id: PartitionId,
    pub position: Position,
    pub token: FencingToken,
    pub accepted: bool,
}

/// Checkpoint store wrapper that records every put and can inject failures.
#[derive(Debug)]
pub struct RecordingCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    puts: Mutex<Vec<PutRecord>>,
    fail_next: AtomicU32,
}

impl RecordingCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            puts: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` puts with a retriable store error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        lock(&self.puts).clone()
    }

    /// Accepted puts for one partition, in call order.
    pub fn accepted_for(&self, partition: &PartitionId) -> Vec<PutRecord> {
        lock(&self.puts)
            .iter()
            .filter(|r| r.accepted && &r.partition_id == partition)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpointStore {
    async fn get_checkpoint(&self, partition: &PartitionId) -> ConsumerResult<Option<Checkpoint>> {
        self.inner.get_checkpoint(partition).await
    }

    async fn put_checkpoint(
        &self,
        partition: &PartitionId,
        position: Position,
        token: FencingToken,
    ) -> ConsumerResult<Checkpoint> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if injected {
            Err(ConsumerError::Store("injected checkpoint failure".to_string()))
        } else {
            self.inner.put_checkpoint(partition, position, token).await
        };

        lock(&self.puts).push(PutRecord {
            partition_id: partition.clone(),
            position,
            token,
            accepted: result.is_ok(),
        });
        result
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Handler that records what it saw, optionally slowly or failing.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    processed: Mutex<HashMap<PartitionId, Vec<Position>>>,
    starts: Mutex<Vec<(PartitionId, FencingToken)>>,
    stops: Mutex<Vec<(PartitionId, StopReason)>>,
    fail_at: Option<Position>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail when processing the event at `position`.
    pub fn failing_at(position: Position) -> Self {
        Self {
            fail_at: Some(position),
            ..Self::default()
        }
    }

    /// Sleep `delay` per event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn processed(&self, partition: &PartitionId) -> Vec<Position> {
        lock(&self.processed)
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_processed(&self) -> usize {
        lock(&self.processed).values().map(Vec::len).sum()
    }

    pub fn starts(&self) -> Vec<(PartitionId, FencingToken)> {
        lock(&self.starts).clone()
    }

    pub fn stops(&self) -> Vec<(PartitionId, StopReason)> {
        lock(&self.stops).clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_partition_start(&self, ctx: &PartitionContext) -> Result<(), HandlerError> {
        lock(&self.starts).push((ctx.partition_id.clone(), ctx.fencing_token));
        Ok(())
    }

    async fn process(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_at == Some(event.position) {
            return Err(format!("rejected event at {}", event.position).into());
        }
        lock(&self.processed)
            .entry(ctx.partition_id.clone())
            .or_default()
            .push(event.position);
        Ok(())
    }

    async fn on_partition_stop(&self, ctx: &PartitionContext, reason: StopReason) {
        lock(&self.stops).push((ctx.partition_id.clone(), reason));
    }
}
