//! Checkpoint store: partition → last committed position, fencing-gated.
//!
//! # Write Rules
//!
//! A `put_checkpoint(partition, position, token)` against a stored
//! checkpoint `(stored_position, stored_token)`:
//!
//! | Condition | Result |
//! |-----------|--------|
//! | no stored checkpoint | written |
//! | `token < stored_token` | `StaleFencing` |
//! | `token == stored_token && position <= stored_position` | not written, stored returned |
//! | `token > stored_token` | `(max(position, stored_position), token)` written |
//! | otherwise | written |
//!
//! A higher token is always written, even when the position cannot move:
//! that is how a new owner raises the fence, and a position that a fenced
//! owner pushed ahead is kept rather than rolled back.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::ObjectStore;
use tracing::debug;

use crate::constants::MAX_CAS_ATTEMPTS;
use crate::types::{Checkpoint, FencingToken, PartitionId, Position};

use super::clock::SharedClock;
use super::error::{ConsumerError, ConsumerResult};
use super::keys::StoreLayout;
use super::object_store::{CasOutcome, read_json, write_json_if};

#[async_trait]
pub trait CheckpointStore: Send + Sync + Debug {
    /// The last committed checkpoint, if any.
    async fn get_checkpoint(&self, partition: &PartitionId) -> ConsumerResult<Option<Checkpoint>>;

    /// Commit `position` for `partition` under fencing token `token`.
    ///
    /// Returns the checkpoint that is stored after the call, which is the
    /// existing one when the write was a no-op.
    async fn put_checkpoint(
        &self,
        partition: &PartitionId,
        position: Position,
        token: FencingToken,
    ) -> ConsumerResult<Checkpoint>;
}

/// Checkpoint store backed by any `object_store` backend with conditional puts.
#[derive(Debug, Clone)]
pub struct ObjectCheckpointStore {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
    clock: SharedClock,
}

impl ObjectCheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout, clock: SharedClock) -> Self {
        Self {
            store,
            layout,
            clock,
        }
    }
}

#[async_trait]
impl CheckpointStore for ObjectCheckpointStore {
    async fn get_checkpoint(&self, partition: &PartitionId) -> ConsumerResult<Option<Checkpoint>> {
        let stored = read_json::<Checkpoint>(self.store.as_ref(), &self.layout.checkpoint(partition))
            .await?;
        Ok(stored.map(|v| v.value))
    }

    async fn put_checkpoint(
        &self,
        partition: &PartitionId,
        position: Position,
        token: FencingToken,
    ) -> ConsumerResult<Checkpoint> {
        let path = self.layout.checkpoint(partition);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = read_json::<Checkpoint>(self.store.as_ref(), &path).await?;

            if let Some(stored) = current.as_ref().map(|v| &v.value) {
                if stored.fencing_token > token {
                    return Err(ConsumerError::StaleFencing {
                        partition: partition.clone(),
                        supplied: token,
                        stored: stored.fencing_token,
                    });
                }
                if stored.fencing_token == token && stored.position >= position {
                    debug!(
                        partition = %partition,
                        stored = %stored.position,
                        requested = %position,
                        "Checkpoint not advanced"
                    );
                    return Ok(stored.clone());
                }
            }

            let next = Checkpoint {
                partition_id: partition.clone(),
                position: current
                    .as_ref()
                    .map_or(position, |v| v.value.position.max(position)),
                fencing_token: token,
                updated_at: self.clock.now(),
            };

            let expected = current.as_ref().map(|v| &v.version);
            match write_json_if(self.store.as_ref(), &path, &next, expected).await? {
                CasOutcome::Written(_) => return Ok(next),
                CasOutcome::Conflict => {
                    debug!(
                        partition = %partition,
                        attempt,
                        "Checkpoint CAS conflict, re-reading"
                    );
                }
            }
        }

        Err(ConsumerError::Store(format!(
            "checkpoint for {} still contended after {} attempts",
            partition, MAX_CAS_ATTEMPTS
        )))
    }
}
