//! # Leasehold
//! Partition leasing and checkpointed batch consumption over object storage.
//!
//! A fleet of identical processes shares the partitions of an event log.
//! Every partition is processed by at most one process at a time under a
//! time-bounded lease carrying a fencing token, and progress is committed as
//! checkpoints that a stale owner can never overwrite. Lease, membership and
//! checkpoint records live in any [`object_store`] backend with conditional
//! writes (in-memory, S3, GCS, Azure).
//!
//! ## Getting started
//! Implement [`EventHandler`](consumer::EventHandler), plug in an
//! [`EventSource`](consumer::EventSource) for your transport, and run a
//! [`PartitionDispatcher`](consumer::PartitionDispatcher):
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use leasehold::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn process(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
//!         println!("{} @ {}: {} bytes", ctx.partition_id, event.position, event.body.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConsumerConfig::from_env()?;
//!     let source = Arc::new(MemoryEventSource::new(8));
//!     let dispatcher = PartitionDispatcher::from_config(config, source, Arc::new(Printer))?;
//!     dispatcher.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! See `demos/fleet.rs` for two dispatchers sharing one store.
#![forbid(unsafe_code)]

pub mod constants;
pub mod consumer;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for embedding a consumer.
    pub use crate::consumer::{
        AssignmentStrategy, ConsumerConfig, ConsumerError, ConsumerProfile, ConsumerResult,
        EventHandler, EventSource, HandlerError, LoggingHandler, MemoryEventSource,
        PartitionContext, PartitionDispatcher, PartitionReceiver, SourceError, StopReason,
        StoreBackend,
    };
    pub use crate::types::{
        Checkpoint, Event, FencingToken, OwnerId, PartitionId, PartitionLease, Position,
        ResumeFrom, StartPosition,
    };

    pub use bytes;
    pub use tokio_util::sync::CancellationToken;
}
