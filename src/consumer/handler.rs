//! Business-logic hook invoked by partition workers.
//!
//! A worker calls `on_partition_start` once after claiming a partition,
//! `process` for every event in arrival order, and `on_partition_stop` exactly
//! once on every exit path. Delivery is at-least-once: after a crash or a
//! lease loss mid-batch, events after the last checkpoint are delivered again
//! to the next owner, so `process` should be idempotent.

use std::error::Error;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Event, FencingToken, OwnerId, PartitionId};

/// Error type returned by handlers. Any error stops the worker.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Identity of the worker invoking the handler.
#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub partition_id: PartitionId,
    pub owner_id: OwnerId,
    pub fencing_token: FencingToken,
    /// Unique per worker incarnation; correlates logs and telemetry.
    pub operation_id: Uuid,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown or rebalance.
    Cancelled,
    /// The lease moved to another owner.
    LeaseLost,
    /// The worker failed (handler, source or checkpoint error).
    Failed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Cancelled => "cancelled",
            StopReason::LeaseLost => "lease_lost",
            StopReason::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once before the first batch.
    async fn on_partition_start(&self, _ctx: &PartitionContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handle one event.
    async fn process(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError>;

    /// Called once when the worker stops, whatever the reason.
    async fn on_partition_stop(&self, _ctx: &PartitionContext, _reason: StopReason) {}
}

/// Handler that logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn on_partition_start(&self, ctx: &PartitionContext) -> Result<(), HandlerError> {
        info!(
            partition = %ctx.partition_id,
            token = %ctx.fencing_token,
            "Partition processing started"
        );
        Ok(())
    }

    async fn process(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
        debug!(
            partition = %ctx.partition_id,
            position = %event.position,
            bytes = event.body.len(),
            "Event received"
        );
        Ok(())
    }

    async fn on_partition_stop(&self, ctx: &PartitionContext, reason: StopReason) {
        info!(
            partition = %ctx.partition_id,
            token = %ctx.fencing_token,
            reason = %reason,
            "Partition processing stopped"
        );
    }
}
