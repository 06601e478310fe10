//! Partition leasing and checkpointed batch consumption.
//!
//! A fleet of identical processes consumes a partitioned event log. Each
//! partition is processed by at most one process at a time, guarded by a
//! time-bounded lease with a fencing token; progress is committed as
//! checkpoints that a lower token can never overwrite.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────── PartitionDispatcher ────────────────────────┐
//!   │  balance loop: heartbeat → reap → plan → acquire / release          │
//!   │  renewal loop: renew held leases → extend or mark guard lost        │
//!   └──────┬──────────────────────────────┬───────────────────────────────┘
//!          │ spawn (one per partition)    │ LeaseManager
//!          ▼                              ▼
//!   ┌──────────────┐   receive     ┌─────────────┐
//!   │PartitionWorker│◀────────────│ EventSource │
//!   │ guard-gated   │              └─────────────┘
//!   │ checkpoints   │──────┐
//!   └──────────────┘      ▼
//!              ┌───────────────────────────────────┐
//!              │ Object store (CAS writes)          │
//!              │  leases/  members/  checkpoints/   │
//!              └───────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use leasehold::consumer::{
//!     ConsumerConfig, LoggingHandler, MemoryEventSource, PartitionDispatcher,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConsumerConfig::from_env()?;
//!     let source = Arc::new(MemoryEventSource::new(4));
//!     let dispatcher =
//!         PartitionDispatcher::from_config(config, source, Arc::new(LoggingHandler))?;
//!
//!     let shutdown = CancellationToken::new();
//!     let signal = shutdown.clone();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         signal.cancel();
//!     });
//!     dispatcher.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod checkpoint_store;
pub mod clock;
mod config;
pub mod dispatcher;
mod error;
pub mod event_source;
pub mod handler;
mod keys;
pub mod lease_guard;
pub mod lease_manager;
pub mod lease_store;
pub mod memory_source;
pub mod metrics;
mod object_store;
pub mod observability;
pub mod retry;
pub mod worker;
pub mod worker_state;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testing;

pub use balancer::{AssignmentStrategy, BalancePlan};
pub use checkpoint_store::{CheckpointStore, ObjectCheckpointStore};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConsumerConfig, ConsumerProfile, StoreBackend};
pub use dispatcher::PartitionDispatcher;
pub use error::{ConsumerError, ConsumerResult};
pub use event_source::{EventSource, PartitionReceiver, SourceError};
pub use handler::{EventHandler, HandlerError, LoggingHandler, PartitionContext, StopReason};
pub use keys::StoreLayout;
pub use lease_guard::{LeaseGuard, LeaseStatus, LossReason};
pub use lease_manager::LeaseManager;
pub use lease_store::{LeaseStore, ObjectLeaseStore};
pub use memory_source::MemoryEventSource;
pub use self::object_store::{CasOutcome, create_object_store};
pub use observability::{TelemetryEvent, TelemetryKind, TelemetrySink, spawn_log_drain};
pub use worker::{PartitionWorker, WorkerDeps, WorkerOutcome, WorkerSettings};
pub use worker_state::WorkerState;
