//! Tracing spans and the best-effort telemetry sink.
//!
//! Spans are plain `tracing` spans; with the `otel` feature they are exported
//! through `tracing-opentelemetry` like every other span.
//!
//! The [`TelemetrySink`] is a bounded channel of lifecycle events for an
//! external collector. Emission never blocks and never fails the consumption
//! path: when the channel is full or closed the event is dropped and counted.
//!
//! # Usage
//!
//! ```rust,ignore
//! use leasehold::consumer::observability::{lease_operation_span, LeaseOperation};
//!
//! let span = lease_operation_span(&partition, &owner, LeaseOperation::Acquire);
//! async {
//!     // lease acquisition
//! }.instrument(span).await;
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Level, Span, debug, span};
use uuid::Uuid;

use crate::types::{FencingToken, OwnerId, PartitionId, Position};

use super::metrics::TELEMETRY_DROPPED;

/// Lease operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOperation {
    Acquire,
    Renew,
    Release,
}

impl std::fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquire => write!(f, "acquire"),
            Self::Renew => write!(f, "renew"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Create a span for a lease operation.
pub fn lease_operation_span(
    partition: &PartitionId,
    owner: &OwnerId,
    operation: LeaseOperation,
) -> Span {
    span!(
        Level::INFO,
        "lease.operation",
        partition = %partition,
        owner = %owner,
        operation = %operation,
        otel.status_code = tracing::field::Empty,
    )
}

/// Create the long-lived span wrapping one partition worker.
pub fn worker_span(
    partition: &PartitionId,
    owner: &OwnerId,
    token: FencingToken,
    operation_id: Uuid,
) -> Span {
    span!(
        Level::INFO,
        "partition.worker",
        partition = %partition,
        owner = %owner,
        token = %token,
        operation_id = %operation_id,
    )
}

/// Create a span for one checkpoint write (including retries).
pub fn checkpoint_span(partition: &PartitionId, position: Position, token: FencingToken) -> Span {
    span!(
        Level::DEBUG,
        "checkpoint.write",
        partition = %partition,
        position = %position,
        token = %token,
        otel.status_code = tracing::field::Empty,
    )
}

/// Create a span for one dispatcher balance cycle.
pub fn balance_cycle_span(owner: &OwnerId, cycle: u64) -> Span {
    span!(
        Level::DEBUG,
        "dispatcher.balance",
        owner = %owner,
        cycle,
        owned = tracing::field::Empty,
        fair_share = tracing::field::Empty,
    )
}

// =============================================================================
// Telemetry Sink
// =============================================================================

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    PartitionClaimed,
    PartitionLost,
    PartitionReleased,
    BatchProcessed,
    CheckpointWritten,
    Error,
}

/// One lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub kind: TelemetryKind,
    pub owner_id: OwnerId,
    pub partition_id: Option<PartitionId>,
    /// Correlates every event of one worker run.
    pub operation_id: Option<Uuid>,
    pub fencing_token: Option<FencingToken>,
    pub position: Option<Position>,
    pub event_count: Option<usize>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(kind: TelemetryKind, owner_id: OwnerId) -> Self {
        Self {
            kind,
            owner_id,
            partition_id: None,
            operation_id: None,
            fencing_token: None,
            position: None,
            event_count: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn partition(mut self, partition: &PartitionId) -> Self {
        self.partition_id = Some(partition.clone());
        self
    }

    pub fn operation(mut self, operation_id: Uuid) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn token(mut self, token: FencingToken) -> Self {
        self.fencing_token = Some(token);
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn events(mut self, count: usize) -> Self {
        self.event_count = Some(count);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Non-blocking, lossy telemetry emitter.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySink {
    tx: Option<mpsc::Sender<TelemetryEvent>>,
}

impl TelemetrySink {
    /// A sink with a bounded channel; the receiver belongs to the collector.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Emit an event. Dropped and counted when the channel is full or closed.
    pub fn emit(&self, event: TelemetryEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.try_send(event).is_err() {
            TELEMETRY_DROPPED.inc();
        }
    }
}

/// Drain a telemetry receiver into the log as JSON lines.
///
/// Stand-in collector for deployments without an external pipeline.
pub fn spawn_log_drain(mut rx: mpsc::Receiver<TelemetryEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => debug!(target: "leasehold::telemetry", event = %json, "telemetry"),
                Err(e) => debug!(error = %e, "Failed to encode telemetry event"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Instrument;

    fn owner() -> OwnerId {
        OwnerId::new("owner-a")
    }

    #[test]
    fn test_lease_operation_display() {
        assert_eq!(LeaseOperation::Acquire.to_string(), "acquire");
        assert_eq!(LeaseOperation::Renew.to_string(), "renew");
        assert_eq!(LeaseOperation::Release.to_string(), "release");
    }

    #[tokio::test]
    async fn test_spans_instrument_futures() {
        let partition = PartitionId::new("0");
        async {}
            .instrument(lease_operation_span(
                &partition,
                &owner(),
                LeaseOperation::Acquire,
            ))
            .await;
        async {}
            .instrument(worker_span(
                &partition,
                &owner(),
                FencingToken::FIRST,
                Uuid::new_v4(),
            ))
            .await;
        async {}
            .instrument(checkpoint_span(&partition, Position(3), FencingToken(2)))
            .await;
        async {}.instrument(balance_cycle_span(&owner(), 1)).await;
    }

    // ========================================================================
    // Telemetry Sink Tests
    // ========================================================================

    #[tokio::test]
    async fn test_sink_delivers_events() {
        let (sink, mut rx) = TelemetrySink::channel(4);
        sink.emit(
            TelemetryEvent::new(TelemetryKind::PartitionClaimed, owner())
                .partition(&PartitionId::new("1"))
                .token(FencingToken(3)),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, TelemetryKind::PartitionClaimed);
        assert_eq!(event.fencing_token, Some(FencingToken(3)));
    }

    #[test]
    fn test_full_sink_drops_without_blocking() {
        let (sink, _rx) = TelemetrySink::channel(1);
        let before = TELEMETRY_DROPPED.get();
        sink.emit(TelemetryEvent::new(TelemetryKind::Error, owner()));
        sink.emit(TelemetryEvent::new(TelemetryKind::Error, owner()));
        sink.emit(TelemetryEvent::new(TelemetryKind::Error, owner()));
        assert!(TELEMETRY_DROPPED.get() >= before + 2);
    }

    #[test]
    fn test_closed_sink_drops() {
        let (sink, rx) = TelemetrySink::channel(8);
        drop(rx);
        sink.emit(TelemetryEvent::new(TelemetryKind::Error, owner()));
    }

    #[test]
    fn test_disabled_sink_is_noop() {
        let sink = TelemetrySink::disabled();
        assert!(!sink.is_enabled());
        sink.emit(TelemetryEvent::new(TelemetryKind::BatchProcessed, owner()).events(5));
    }

    #[test]
    fn test_event_serializes_snake_case_kind() {
        let event = TelemetryEvent::new(TelemetryKind::CheckpointWritten, owner())
            .position(Position(12));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"checkpoint_written\""));
        assert!(json.contains("\"position\":12"));
    }
}
