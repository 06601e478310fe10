//! Error types for the leasing and consumption layers.
//!
//! # Error Handling Patterns
//!
//! Errors fall into three groups, and callers react to the group rather than
//! the individual variant:
//!
//! ## Ownership Lost (terminal for one worker)
//!
//! `LeaseHeld`, `FencingMismatch`, `Expired`, `StaleFencing` and
//! `OwnershipLost` mean another process owns (or may own) the partition.
//! The affected worker stops without writing anything further; the rest of
//! the process carries on.
//!
//! ## Retriable (transient infrastructure)
//!
//! `Store`, `ObjectStore`, `Source` and `LeaseTooShort` errors are retried
//! with backoff. Event source failures are retried indefinitely; store
//! failures are retried a bounded number of times and then escalate.
//!
//! ## Fatal (terminate the run)
//!
//! `Config`, `StoreUnavailable`, `NoPartitionsClaimed` and `ShutdownTimeout`
//! are returned from `PartitionDispatcher::run`. The embedding application
//! decides whether to restart.
//!
//! # Fencing
//!
//! Fencing errors are the split-brain guard: a zombie that resumes after a
//! pause sees `StaleFencing` on its next checkpoint write and stops.

use thiserror::Error;

use crate::types::{FencingToken, PartitionId, Position};

/// Result type for leasing and consumption operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised while leasing partitions and consuming them.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Another owner holds a live lease on the partition.
    #[error("Partition {partition} is leased by {holder} until {expires_at}")]
    LeaseHeld {
        partition: PartitionId,
        holder: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    /// The stored lease no longer carries our token or owner.
    #[error("Fencing mismatch on {partition}: held token {held}, stored {stored:?}")]
    FencingMismatch {
        partition: PartitionId,
        held: FencingToken,
        stored: Option<FencingToken>,
    },

    /// Our lease expired before it could be renewed.
    #[error("Lease on {partition} expired")]
    Expired { partition: PartitionId },

    /// A checkpoint write carried a token older than the stored one.
    #[error("Stale fencing token on {partition}: supplied {supplied}, stored {stored}")]
    StaleFencing {
        partition: PartitionId,
        supplied: FencingToken,
        stored: FencingToken,
    },

    /// The event source or lease guard reports that ownership moved elsewhere.
    #[error("Ownership of {partition} lost")]
    OwnershipLost { partition: PartitionId },

    /// The lease expires within the checkpoint safety margin.
    ///
    /// Retriable: a renewal may land before the next attempt.
    #[error("Lease on {partition} expires in {remaining_ms}ms, inside the {margin_ms}ms safety margin")]
    LeaseTooShort {
        partition: PartitionId,
        remaining_ms: u64,
        margin_ms: u64,
    },

    /// Transient event source failure.
    #[error("Event source error on {partition}: {message}")]
    Source {
        partition: PartitionId,
        message: String,
    },

    /// The event handler rejected an event.
    #[error("Handler failed on {partition} at position {position}: {message}")]
    Handler {
        partition: PartitionId,
        position: Position,
        message: String,
    },

    /// Checkpoint write retries exhausted within the lease window.
    #[error("Checkpoint write for {partition} at {position} failed: {message}")]
    CheckpointWrite {
        partition: PartitionId,
        position: Position,
        message: String,
    },

    /// Generic store failure (e.g. CAS attempts exhausted).
    #[error("Store error: {0}")]
    Store(String),

    /// Error from object store operations.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The lease store failed repeatedly; this process cannot keep its claims.
    #[error("Lease store unavailable after {failures} consecutive failures: {last_error}")]
    StoreUnavailable { failures: u32, last_error: String },

    /// No partitions could be claimed for longer than the configured threshold.
    #[error("No partitions claimed for {elapsed_secs}s while fair share is {fair_share}")]
    NoPartitionsClaimed { elapsed_secs: u64, fair_share: usize },

    /// Workers did not stop within the shutdown grace period.
    #[error("Shutdown grace of {grace_secs}s exceeded; {stragglers} workers aborted")]
    ShutdownTimeout { grace_secs: u64, stragglers: usize },

    /// A worker task panicked or was aborted.
    #[error("Worker for {partition} terminated abnormally: {message}")]
    Worker {
        partition: PartitionId,
        message: String,
    },
}

impl ConsumerError {
    /// Check if this error means the partition is (or may be) owned elsewhere.
    ///
    /// Ownership errors are terminal for the affected worker only.
    #[inline]
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self,
            ConsumerError::LeaseHeld { .. }
                | ConsumerError::FencingMismatch { .. }
                | ConsumerError::Expired { .. }
                | ConsumerError::StaleFencing { .. }
                | ConsumerError::OwnershipLost { .. }
        )
    }

    /// Check if the operation may succeed when retried.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ConsumerError::Store(_)
                | ConsumerError::ObjectStore(_)
                | ConsumerError::Source { .. }
                | ConsumerError::LeaseTooShort { .. }
        )
    }

    /// Check if this error must terminate the dispatcher run.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumerError::Config(_)
                | ConsumerError::StoreUnavailable { .. }
                | ConsumerError::NoPartitionsClaimed { .. }
                | ConsumerError::ShutdownTimeout { .. }
        )
    }

    /// Short label used for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            ConsumerError::LeaseHeld { .. } => "lease_held",
            ConsumerError::FencingMismatch { .. } => "fencing_mismatch",
            ConsumerError::Expired { .. } => "expired",
            ConsumerError::StaleFencing { .. } => "stale_fencing",
            ConsumerError::OwnershipLost { .. } => "ownership_lost",
            ConsumerError::LeaseTooShort { .. } => "lease_too_short",
            ConsumerError::Source { .. } => "source",
            ConsumerError::Handler { .. } => "handler",
            ConsumerError::CheckpointWrite { .. } => "checkpoint_write",
            ConsumerError::Store(_) => "store",
            ConsumerError::ObjectStore(_) => "object_store",
            ConsumerError::Serde(_) => "serde",
            ConsumerError::Config(_) => "config",
            ConsumerError::StoreUnavailable { .. } => "store_unavailable",
            ConsumerError::NoPartitionsClaimed { .. } => "no_partitions_claimed",
            ConsumerError::ShutdownTimeout { .. } => "shutdown_timeout",
            ConsumerError::Worker { .. } => "worker",
        }
    }
}
