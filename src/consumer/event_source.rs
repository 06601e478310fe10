//! Interface to the partitioned event log transport.
//!
//! The transport itself (connections, authentication, wire protocol) lives
//! outside this crate. A worker only needs to open a receiver positioned
//! after its checkpoint and pull batches from it.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Event, PartitionId, ResumeFrom};

use super::error::ConsumerError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// No event arrived within the receive timeout. Not a failure.
    #[error("receive timed out")]
    Timeout,

    /// Another reader took the partition at the transport level.
    #[error("partition ownership lost at the source")]
    OwnershipLost,

    /// Transient transport failure; retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SourceError {
    pub fn into_consumer_error(self, partition: &PartitionId) -> ConsumerError {
        match self {
            SourceError::OwnershipLost => ConsumerError::OwnershipLost {
                partition: partition.clone(),
            },
            other => ConsumerError::Source {
                partition: partition.clone(),
                message: other.to_string(),
            },
        }
    }
}

/// A partitioned, append-only event log.
#[async_trait]
pub trait EventSource: Send + Sync + Debug {
    /// All partitions of the stream, in a stable order.
    async fn partition_ids(&self) -> Result<Vec<PartitionId>, SourceError>;

    /// Open a receiver for one partition.
    async fn open(
        &self,
        partition: &PartitionId,
        from: ResumeFrom,
    ) -> Result<Box<dyn PartitionReceiver>, SourceError>;
}

/// Pull-based reader over one partition.
#[async_trait]
pub trait PartitionReceiver: Send {
    /// Wait up to `timeout` for at least one event, then return up to `max`
    /// events in position order.
    ///
    /// Returns `Err(SourceError::Timeout)` (or an empty batch) when nothing
    /// arrived. Must be cancel-safe: dropping the future loses no events.
    async fn receive_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Event>, SourceError>;

    /// Release transport resources. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_lost_maps_to_ownership_error() {
        let err = SourceError::OwnershipLost.into_consumer_error(&PartitionId::new("1"));
        assert!(err.is_ownership_lost());
    }

    #[test]
    fn test_transport_maps_to_retriable_error() {
        let err = SourceError::Transport("reset".into()).into_consumer_error(&PartitionId::new("1"));
        assert!(err.is_retriable());
        assert!(err.to_string().contains("reset"));
    }
}
