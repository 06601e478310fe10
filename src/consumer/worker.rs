//! Partition worker: receive → process → checkpoint for one leased partition.
//!
//! A worker is bound to exactly one lease incarnation (one fencing token).
//! It never renews its own lease; the dispatcher's renewal loop does that and
//! flips the shared [`LeaseGuard`] when renewal fails. The worker watches the
//! guard while receiving and validates it before every checkpoint attempt.
//!
//! # Lifecycle
//!
//! 1. `on_partition_start`, read the checkpoint, raise the checkpoint fence
//!    by re-writing the stored position under the new token, open a receiver
//!    strictly after the stored position (or at the configured start).
//! 2. Loop: receive a batch (interruptible by cancellation and lease loss),
//!    process every event in order (not interruptible), write one checkpoint
//!    at the last event of the batch.
//! 3. On every exit path: close the receiver and call `on_partition_stop`.
//!
//! Lease loss during processing suppresses the checkpoint; the next owner
//! re-delivers the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::Retryable;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::types::{Event, OwnerId, Position, ResumeFrom, StartPosition};

use super::checkpoint_store::CheckpointStore;
use super::config::ConsumerConfig;
use super::error::ConsumerError;
use super::event_source::{EventSource, PartitionReceiver, SourceError};
use super::handler::{EventHandler, PartitionContext, StopReason};
use super::lease_guard::{LeaseGuard, LossReason};
use super::metrics::{record_batch, record_checkpoint, record_error, record_worker_exit};
use super::observability::{
    TelemetryEvent, TelemetryKind, TelemetrySink, checkpoint_span, worker_span,
};
use super::retry::{
    SOURCE_MAX_DELAY, checkpoint_policy, record_retry_attempt, record_retry_exhausted,
    record_retry_success, source_backoff, store_policy,
};
use super::worker_state::WorkerState;

/// How a worker run ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Stopped by shutdown or rebalance.
    Cancelled,
    /// Ownership moved elsewhere; nothing further was written.
    LeaseLost(LossReason),
    /// Unrecoverable error.
    Failed(ConsumerError),
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Cancelled => "cancelled",
            WorkerOutcome::LeaseLost(_) => "lease_lost",
            WorkerOutcome::Failed(_) => "failed",
        }
    }

    fn stop_reason(&self) -> StopReason {
        match self {
            WorkerOutcome::Cancelled => StopReason::Cancelled,
            WorkerOutcome::LeaseLost(_) => StopReason::LeaseLost,
            WorkerOutcome::Failed(_) => StopReason::Failed,
        }
    }
}

/// Consumption knobs a worker needs from the consumer configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub max_batch_size: usize,
    pub receive_timeout: Duration,
    pub start_position: StartPosition,
}

impl WorkerSettings {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            receive_timeout: config.receive_timeout,
            start_position: config.start_position,
        }
    }
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub source: Arc<dyn EventSource>,
    pub handler: Arc<dyn EventHandler>,
    pub telemetry: TelemetrySink,
}

pub struct PartitionWorker {
    ctx: PartitionContext,
    guard: LeaseGuard,
    deps: WorkerDeps,
    settings: WorkerSettings,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
}

type Step<T> = Result<T, WorkerOutcome>;

impl PartitionWorker {
    pub fn new(
        owner: OwnerId,
        guard: LeaseGuard,
        deps: WorkerDeps,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = PartitionContext {
            partition_id: guard.partition().clone(),
            owner_id: owner,
            fencing_token: guard.token(),
            operation_id: Uuid::new_v4(),
        };
        let (state, _) = watch::channel(WorkerState::Initializing);
        Self {
            ctx,
            guard,
            deps,
            settings,
            cancel,
            state,
        }
    }

    pub fn context(&self) -> &PartitionContext {
        &self.ctx
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub async fn run(self) -> WorkerOutcome {
        let span = worker_span(
            &self.ctx.partition_id,
            &self.ctx.owner_id,
            self.ctx.fencing_token,
            self.ctx.operation_id,
        );
        async move {
            let mut receiver = None;
            let outcome = match self.run_inner(&mut receiver).await {
                Ok(never) => match never {},
                Err(outcome) => outcome,
            };
            self.finish(receiver, &outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        slot: &mut Option<Box<dyn PartitionReceiver>>,
    ) -> Step<std::convert::Infallible> {
        self.deps
            .handler
            .on_partition_start(&self.ctx)
            .await
            .map_err(|e| {
                WorkerOutcome::Failed(ConsumerError::Worker {
                    partition: self.ctx.partition_id.clone(),
                    message: format!("on_partition_start failed: {}", e),
                })
            })?;

        let resume = self.resume_point().await?;
        let receiver = slot.insert(self.open_receiver(resume).await?);
        info!(resume = %resume, "Partition worker started");

        let mut backoff = source_backoff();
        loop {
            self.transition(WorkerState::Receiving);
            let received = tokio::select! {
                biased;
                // Loss wins over cancellation: the renewer marks the guard first.
                reason = self.guard.lost() => return Err(WorkerOutcome::LeaseLost(reason)),
                _ = self.cancel.cancelled() => return Err(WorkerOutcome::Cancelled),
                result = receiver.receive_batch(
                    self.settings.max_batch_size,
                    self.settings.receive_timeout,
                ) => result,
            };

            let events = match received {
                Ok(events) if events.is_empty() => continue,
                Ok(events) => {
                    backoff = source_backoff();
                    events
                }
                Err(SourceError::Timeout) => continue,
                Err(SourceError::OwnershipLost) => {
                    self.guard.mark_lost(LossReason::OwnershipLost);
                    return Err(WorkerOutcome::LeaseLost(LossReason::OwnershipLost));
                }
                Err(err @ SourceError::Transport(_)) => {
                    let delay = backoff.next().unwrap_or(SOURCE_MAX_DELAY);
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "Receive failed, backing off");
                    record_error("source");
                    self.pause(delay).await?;
                    continue;
                }
            };

            self.transition(WorkerState::Processing);
            let last = self.process_batch(&events).await?;

            self.transition(WorkerState::Checkpointing);
            self.checkpoint(last).await?;
        }
    }

    /// Read the stored checkpoint and fence it with our token.
    async fn resume_point(&self) -> Step<ResumeFrom> {
        let partition = &self.ctx.partition_id;
        let token = self.ctx.fencing_token;
        let store = &self.deps.checkpoints;

        let stored = (|| async move { store.get_checkpoint(partition).await })
            .retry(store_policy())
            .when(|e: &ConsumerError| e.is_retriable())
            .await
            .map_err(|e| self.classify(e))?;

        let Some(checkpoint) = stored else {
            return Ok(ResumeFrom::Start(self.settings.start_position));
        };

        let position = checkpoint.position;
        let fenced = (|| async move { store.put_checkpoint(partition, position, token).await })
            .retry(store_policy())
            .when(|e: &ConsumerError| e.is_retriable())
            .await
            .map_err(|e| self.classify(e))?;

        debug!(
            position = %fenced.position,
            stored_token = %checkpoint.fencing_token,
            "Checkpoint fence raised"
        );
        Ok(ResumeFrom::After(fenced.position))
    }

    async fn open_receiver(&self, resume: ResumeFrom) -> Step<Box<dyn PartitionReceiver>> {
        let mut backoff = source_backoff();
        loop {
            match self.deps.source.open(&self.ctx.partition_id, resume).await {
                Ok(receiver) => return Ok(receiver),
                Err(SourceError::OwnershipLost) => {
                    self.guard.mark_lost(LossReason::OwnershipLost);
                    return Err(WorkerOutcome::LeaseLost(LossReason::OwnershipLost));
                }
                Err(err) => {
                    let delay = backoff.next().unwrap_or(SOURCE_MAX_DELAY);
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "Open failed, backing off");
                    record_error("source");
                    self.pause(delay).await?;
                }
            }
        }
    }

    /// Sleep unless cancelled or the lease is lost first.
    async fn pause(&self, delay: Duration) -> Step<()> {
        tokio::select! {
            biased;
            reason = self.guard.lost() => Err(WorkerOutcome::LeaseLost(reason)),
            _ = self.cancel.cancelled() => Err(WorkerOutcome::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run the handler over the batch in order. Returns the last position.
    async fn process_batch(&self, events: &[Event]) -> Step<Position> {
        let mut last = Position::default();
        for event in events {
            if let Err(e) = self.deps.handler.process(&self.ctx, event).await {
                return Err(WorkerOutcome::Failed(ConsumerError::Handler {
                    partition: self.ctx.partition_id.clone(),
                    position: event.position,
                    message: e.to_string(),
                }));
            }
            last = event.position;
        }

        record_batch(self.ctx.partition_id.as_str(), events.len());
        self.deps.telemetry.emit(
            self.telemetry(TelemetryKind::BatchProcessed)
                .position(last)
                .events(events.len()),
        );
        debug!(events = events.len(), last = %last, "Batch processed");
        Ok(last)
    }

    async fn checkpoint(&self, position: Position) -> Step<()> {
        if let Some(reason) = self.guard.loss_reason() {
            info!(position = %position, reason = %reason, "Lease lost during processing; checkpoint suppressed");
            record_checkpoint("suppressed", 0.0);
            return Err(WorkerOutcome::LeaseLost(reason));
        }

        let partition = &self.ctx.partition_id;
        let token = self.ctx.fencing_token;
        let guard = &self.guard;
        let store = &self.deps.checkpoints;
        let started = Instant::now();
        let mut retries: u32 = 0;

        let result = (|| async move {
            guard.validate_for_checkpoint()?;
            store.put_checkpoint(partition, position, token).await
        })
        .retry(checkpoint_policy())
        .when(|e: &ConsumerError| e.is_retriable())
        .notify(|e: &ConsumerError, delay: Duration| {
            retries += 1;
            record_retry_attempt("checkpoint", retries);
            debug!(error = %e, delay_ms = delay.as_millis() as u64, "Retrying checkpoint write");
        })
        .instrument(checkpoint_span(partition, position, token))
        .await;
        let elapsed = started.elapsed().as_secs_f64();
        if retries > 0 {
            match &result {
                Ok(_) => record_retry_success("checkpoint"),
                Err(_) => record_retry_exhausted("checkpoint"),
            }
        }

        match result {
            Ok(stored) => {
                record_checkpoint("ok", elapsed);
                self.deps
                    .telemetry
                    .emit(self.telemetry(TelemetryKind::CheckpointWritten).position(stored.position));
                debug!(position = %stored.position, "Checkpoint written");
                Ok(())
            }
            Err(ConsumerError::LeaseTooShort { .. }) => {
                record_checkpoint("lease_too_short", elapsed);
                self.guard.mark_lost(LossReason::Expired);
                Err(WorkerOutcome::LeaseLost(
                    self.guard.loss_reason().unwrap_or(LossReason::Expired),
                ))
            }
            Err(e) if e.is_ownership_lost() => {
                record_checkpoint("fenced", elapsed);
                Err(self.classify(e))
            }
            Err(e) => {
                record_checkpoint("error", elapsed);
                Err(WorkerOutcome::Failed(ConsumerError::CheckpointWrite {
                    partition: partition.clone(),
                    position,
                    message: e.to_string(),
                }))
            }
        }
    }

    /// Turn a store error into a worker outcome, marking the guard on loss.
    fn classify(&self, err: ConsumerError) -> WorkerOutcome {
        if !err.is_ownership_lost() {
            return WorkerOutcome::Failed(err);
        }
        let reason = self
            .guard
            .loss_reason()
            .or_else(|| LossReason::from_error(&err))
            .unwrap_or(LossReason::OwnershipLost);
        self.guard.mark_lost(reason);
        WorkerOutcome::LeaseLost(reason)
    }

    async fn finish(&self, receiver: Option<Box<dyn PartitionReceiver>>, outcome: &WorkerOutcome) {
        let lease_lost = matches!(outcome, WorkerOutcome::LeaseLost(_));
        if !lease_lost {
            self.transition(WorkerState::Closing);
        }

        if let Some(mut receiver) = receiver {
            receiver.close().await;
        }
        self.deps
            .handler
            .on_partition_stop(&self.ctx, outcome.stop_reason())
            .await;

        record_worker_exit(outcome.label());
        match outcome {
            WorkerOutcome::Cancelled => {
                info!("Partition worker stopped");
            }
            WorkerOutcome::LeaseLost(reason) => {
                warn!(reason = %reason, "Partition worker lost its lease");
                self.deps
                    .telemetry
                    .emit(self.telemetry(TelemetryKind::PartitionLost).detail(reason.as_str()));
            }
            WorkerOutcome::Failed(err) => {
                warn!(error = %err, "Partition worker failed");
                record_error(err.metric_label());
                self.deps
                    .telemetry
                    .emit(self.telemetry(TelemetryKind::Error).detail(err.to_string()));
            }
        }

        self.transition(if lease_lost {
            WorkerState::LeaseLost
        } else {
            WorkerState::Closed
        });
    }

    fn transition(&self, next: WorkerState) {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn telemetry(&self, kind: TelemetryKind) -> TelemetryEvent {
        TelemetryEvent::new(kind, self.ctx.owner_id.clone())
            .partition(&self.ctx.partition_id)
            .operation(self.ctx.operation_id)
            .token(self.ctx.fencing_token)
    }
}
