//! Partition dispatcher: claims partitions, renews leases, runs workers.
//!
//! One dispatcher per process. [`PartitionDispatcher::run`] drives two
//! loops until the shutdown token fires:
//!
//! - **Balance loop** (every `balance_interval`, jittered): heartbeat the
//!   member record, reap finished workers, read partitions, leases and
//!   members, plan, acquire, release excess.
//! - **Renewal loop** (every `renew_interval`, jittered, its own task):
//!   renew every held lease concurrently. A renewal that reports
//!   `FencingMismatch` or `Expired` marks the worker's guard lost and
//!   cancels the worker at once; transient errors are retried next round.
//!
//! # Shutdown Sequence
//!
//! 1. Cancel the shared worker token; every worker finishes its in-flight
//!    batch (processing is not interruptible) and checkpoints.
//! 2. Wait up to `shutdown_grace`, renewing leases meanwhile, then abort
//!    stragglers.
//! 3. Stop the renewal loop, release every held lease, remove the member
//!    record.
//!
//! Aborted stragglers are reported as `ShutdownTimeout` after cleanup.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use object_store::ObjectStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::constants::{ACQUIRE_CHUNK_SIZE, LOOP_JITTER_FRACTION, RELEASE_TIMEOUT};
use crate::types::{FencingToken, MemberRecord, OwnerId, PartitionId, PartitionLease};

use super::balancer::{BalanceInput, HeldPartition, plan};
use super::checkpoint_store::{CheckpointStore, ObjectCheckpointStore};
use super::clock::{SharedClock, SystemClock, add_duration};
use super::config::ConsumerConfig;
use super::error::{ConsumerError, ConsumerResult};
use super::event_source::EventSource;
use super::handler::EventHandler;
use super::keys::StoreLayout;
use super::lease_guard::{LeaseGuard, LossReason};
use super::lease_manager::LeaseManager;
use super::lease_store::{LeaseStore, ObjectLeaseStore};
use super::metrics::{record_error, record_store_failure, set_fair_share, set_owned_partitions};
use super::object_store::create_object_store;
use super::observability::{TelemetryEvent, TelemetryKind, TelemetrySink, balance_cycle_span};
use super::retry::with_store_policy;
use super::worker::{PartitionWorker, WorkerDeps, WorkerOutcome, WorkerSettings};
use super::worker_state::WorkerState;

/// Apply ±15% jitter so a fleet started together does not poll in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let factor = 1.0 - LOOP_JITTER_FRACTION + fastrand::f64() * 2.0 * LOOP_JITTER_FRACTION;
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Errors that count toward `max_consecutive_store_failures`.
fn is_store_failure(err: &ConsumerError) -> bool {
    matches!(
        err,
        ConsumerError::Store(_) | ConsumerError::ObjectStore(_) | ConsumerError::Serde(_)
    )
}

/// A running worker, owned exclusively by the dispatcher.
struct WorkerHandle {
    fencing_token: FencingToken,
    acquired_at: DateTime<Utc>,
    guard: LeaseGuard,
    cancel: CancellationToken,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<WorkerOutcome>,
    /// Set once the partition is being given up; the worker is aborted if it
    /// is still running at this instant.
    retire_by: Option<Instant>,
}

impl WorkerHandle {
    /// Counts toward this process's holdings.
    fn is_held(&self) -> bool {
        self.retire_by.is_none() && !self.guard.is_lost()
    }
}

type WorkerMap = Arc<DashMap<PartitionId, WorkerHandle>>;

/// What one balance cycle observed.
#[derive(Debug, Clone, Copy)]
struct CycleReport {
    owned: usize,
    fair_share: usize,
}

pub struct PartitionDispatcher {
    config: Arc<ConsumerConfig>,
    leases: LeaseManager,
    checkpoints: Arc<dyn CheckpointStore>,
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    clock: SharedClock,
    telemetry: TelemetrySink,
    workers: WorkerMap,
    /// Partition → instant before which this process will not re-claim it.
    cooldown: DashMap<PartitionId, DateTime<Utc>>,
    fair_share: AtomicUsize,
}

impl PartitionDispatcher {
    pub fn new(
        config: ConsumerConfig,
        lease_store: Arc<dyn LeaseStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        source: Arc<dyn EventSource>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let clock: SharedClock = Arc::new(SystemClock);
        Self {
            config: Arc::new(config),
            leases: LeaseManager::new(lease_store, clock.clone()),
            checkpoints: checkpoint_store,
            source,
            handler,
            clock,
            telemetry: TelemetrySink::disabled(),
            workers: Arc::new(DashMap::new()),
            cooldown: DashMap::new(),
            fair_share: AtomicUsize::new(0),
        }
    }

    /// Build lease and checkpoint stores from `config.store`.
    pub fn from_config(
        config: ConsumerConfig,
        source: Arc<dyn EventSource>,
        handler: Arc<dyn EventHandler>,
    ) -> ConsumerResult<Self> {
        let store: Arc<dyn ObjectStore> = create_object_store(&config.store)?;
        let layout = StoreLayout::new(&config.store_prefix, &config.consumer_group);
        let clock: SharedClock = Arc::new(SystemClock);
        let lease_store = Arc::new(ObjectLeaseStore::new(store.clone(), layout.clone()));
        let checkpoint_store = Arc::new(ObjectCheckpointStore::new(store, layout, clock));
        Ok(Self::new(config, lease_store, checkpoint_store, source, handler))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.leases = LeaseManager::new(self.leases.store().clone(), clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.config.owner_id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Partitions with a running worker whose lease is still held and that
    /// are not being given up.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut owned: Vec<PartitionId> = self
            .workers
            .iter()
            .filter(|entry| entry.value().is_held())
            .map(|entry| entry.key().clone())
            .collect();
        owned.sort();
        owned
    }

    pub fn worker_state(&self, partition: &PartitionId) -> Option<WorkerState> {
        self.workers
            .get(partition)
            .map(|entry| *entry.value().state.borrow())
    }

    /// Fair share computed by the last balance cycle.
    pub fn fair_share(&self) -> usize {
        self.fair_share.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// Always performs the full shutdown sequence before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerResult<()> {
        self.config.validated()?;
        info!(
            owner = %self.config.owner_id,
            group = %self.config.consumer_group,
            strategy = %self.config.strategy,
            lease_secs = self.config.lease_duration.as_secs_f64(),
            "Partition dispatcher starting"
        );

        let workers_token = shutdown.child_token();
        let renewal_stop = CancellationToken::new();
        let renewal = tokio::spawn(
            Renewer {
                leases: self.leases.clone(),
                workers: self.workers.clone(),
                owner: self.config.owner_id.clone(),
                lease_duration: self.config.lease_duration,
                interval: self.config.renew_interval,
            }
            .run(renewal_stop.clone()),
        );

        let started_at = self.clock.now();
        let balance_result = self.balance_loop(&shutdown, &workers_token, started_at).await;
        if let Err(e) = &balance_result {
            error!(error = %e, "Balance loop failed; shutting down");
            record_error(e.metric_label());
        }

        let stop_result = self.stop_workers(&workers_token).await;

        renewal_stop.cancel();
        if let Err(e) = renewal.await {
            warn!(error = %e, "Renewal loop terminated abnormally");
        }

        self.release_all().await;
        self.leave_fleet().await;
        set_owned_partitions(0);
        info!(owner = %self.config.owner_id, "Partition dispatcher stopped");

        balance_result.and(stop_result)
    }

    // ========================================================================
    // Balance Loop
    // ========================================================================

    async fn balance_loop(
        &self,
        shutdown: &CancellationToken,
        workers_token: &CancellationToken,
        started_at: DateTime<Utc>,
    ) -> ConsumerResult<()> {
        let mut cycle: u64 = 0;
        let mut store_failures: u32 = 0;
        let mut unclaimed_since: Option<DateTime<Utc>> = None;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            cycle += 1;

            let span = balance_cycle_span(&self.config.owner_id, cycle);
            match self
                .balance_once(workers_token, started_at)
                .instrument(span.clone())
                .await
            {
                Ok(report) => {
                    store_failures = 0;
                    span.record("owned", report.owned);
                    span.record("fair_share", report.fair_share);
                    self.check_unclaimed(report, &mut unclaimed_since)?;
                }
                Err(e) if is_store_failure(&e) => {
                    store_failures += 1;
                    record_store_failure("balance");
                    warn!(
                        error = %e,
                        consecutive = store_failures,
                        "Balance cycle failed on lease store"
                    );
                    if store_failures >= self.config.max_consecutive_store_failures {
                        return Err(ConsumerError::StoreUnavailable {
                            failures: store_failures,
                            last_error: e.to_string(),
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Balance cycle failed");
                    record_error(e.metric_label());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(with_jitter(self.config.balance_interval)) => {}
                _ = shutdown.cancelled() => {
                    info!("Balance loop received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    async fn balance_once(
        &self,
        workers_token: &CancellationToken,
        started_at: DateTime<Utc>,
    ) -> ConsumerResult<CycleReport> {
        self.heartbeat(started_at).await?;
        self.reap_finished().await;

        let partitions = self.source.partition_ids().await.map_err(|e| ConsumerError::Source {
            partition: PartitionId::new("*"),
            message: e.to_string(),
        })?;

        let store = self.leases.store();
        let leases = with_store_policy(
            "list_leases",
            move || store.list_leases(),
            |e: &ConsumerError| e.is_retriable(),
        )
        .await?;
        let members = with_store_policy(
            "list_members",
            move || store.list_members(),
            |e: &ConsumerError| e.is_retriable(),
        )
        .await?;

        let now = self.clock.now();
        let held = self.held_snapshot();
        let cooldown = self.active_cooldowns(now);
        let input = BalanceInput {
            owner: &self.config.owner_id,
            partitions: &partitions,
            leases: &leases,
            members: &members,
            held: &held,
            cooldown: &cooldown,
            now,
            lease_duration: self.config.lease_duration,
        };
        let plan = plan(self.config.strategy, &input);
        self.fair_share.store(plan.fair_share, Ordering::Relaxed);
        set_fair_share(plan.fair_share);

        if !plan.is_noop() {
            debug!(
                held = held.len(),
                fair_share = plan.fair_share,
                acquire = plan.acquire.len(),
                release = plan.release.len(),
                "Balance plan"
            );
        }

        for chunk in plan.acquire.chunks(ACQUIRE_CHUNK_SIZE) {
            join_all(chunk.iter().map(|p| self.claim(p, workers_token))).await;
        }
        for partition in &plan.release {
            self.retire(partition);
        }

        let owned = self.owned_partitions().len();
        set_owned_partitions(owned);
        Ok(CycleReport {
            owned,
            fair_share: plan.fair_share,
        })
    }

    fn check_unclaimed(
        &self,
        report: CycleReport,
        unclaimed_since: &mut Option<DateTime<Utc>>,
    ) -> ConsumerResult<()> {
        let Some(limit) = self.config.max_unclaimed_duration else {
            return Ok(());
        };
        if report.owned > 0 || report.fair_share == 0 {
            *unclaimed_since = None;
            return Ok(());
        }

        let now = self.clock.now();
        let since = *unclaimed_since.get_or_insert(now);
        if add_duration(since, limit) <= now {
            return Err(ConsumerError::NoPartitionsClaimed {
                elapsed_secs: (now - since).num_seconds().max(0) as u64,
                fair_share: report.fair_share,
            });
        }
        Ok(())
    }

    async fn heartbeat(&self, started_at: DateTime<Utc>) -> ConsumerResult<()> {
        let now = self.clock.now();
        let member = MemberRecord {
            owner_id: self.config.owner_id.clone(),
            started_at,
            expires_at: add_duration(now, self.config.lease_duration),
        };
        let store = self.leases.store();
        let member = &member;
        with_store_policy(
            "heartbeat",
            move || store.put_member(member),
            |e: &ConsumerError| e.is_retriable(),
        )
        .await
    }

    fn held_snapshot(&self) -> Vec<HeldPartition> {
        self.workers
            .iter()
            .filter(|entry| entry.value().is_held())
            .map(|entry| HeldPartition {
                partition_id: entry.key().clone(),
                acquired_at: entry.value().acquired_at,
            })
            .collect()
    }

    /// Partitions this process must not claim this cycle: those in cooldown
    /// plus those whose worker is lost or retiring but not yet reaped.
    fn active_cooldowns(&self, now: DateTime<Utc>) -> HashSet<PartitionId> {
        self.cooldown.retain(|_, until| *until > now);
        let mut blocked: HashSet<PartitionId> =
            self.cooldown.iter().map(|entry| entry.key().clone()).collect();
        blocked.extend(
            self.workers
                .iter()
                .filter(|entry| !entry.value().is_held())
                .map(|entry| entry.key().clone()),
        );
        blocked
    }

    // ========================================================================
    // Worker Lifecycle
    // ========================================================================

    async fn claim(&self, partition: &PartitionId, workers_token: &CancellationToken) {
        let owner = &self.config.owner_id;
        match self
            .leases
            .acquire_lease(partition, owner, self.config.lease_duration)
            .await
        {
            Ok(lease) => self.spawn_worker(lease, workers_token),
            Err(e) if e.is_ownership_lost() => {
                debug!(partition = %partition, error = %e, "Partition claimed elsewhere first");
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Failed to acquire partition lease");
                record_store_failure("acquire");
            }
        }
    }

    fn spawn_worker(&self, lease: PartitionLease, workers_token: &CancellationToken) {
        let guard = LeaseGuard::new(
            &lease,
            self.clock.clone(),
            self.config.checkpoint_safety_margin,
        );
        let cancel = workers_token.child_token();
        let worker = PartitionWorker::new(
            self.config.owner_id.clone(),
            guard.clone(),
            WorkerDeps {
                checkpoints: self.checkpoints.clone(),
                source: self.source.clone(),
                handler: self.handler.clone(),
                telemetry: self.telemetry.clone(),
            },
            WorkerSettings::from_config(&self.config),
            cancel.clone(),
        );
        let operation_id = worker.context().operation_id;
        let state = worker.state();
        let task = tokio::spawn(worker.run());

        self.telemetry.emit(
            TelemetryEvent::new(TelemetryKind::PartitionClaimed, self.config.owner_id.clone())
                .partition(&lease.partition_id)
                .operation(operation_id)
                .token(lease.fencing_token),
        );
        info!(
            partition = %lease.partition_id,
            token = %lease.fencing_token,
            "Partition claimed"
        );

        let previous = self.workers.insert(
            lease.partition_id.clone(),
            WorkerHandle {
                fencing_token: lease.fencing_token,
                acquired_at: self.clock.now(),
                guard,
                cancel,
                state,
                task,
                retire_by: None,
            },
        );
        if let Some(previous) = previous {
            previous.guard.mark_lost(LossReason::FencingMismatch);
            previous.cancel.cancel();
        }
    }

    /// Collect finished workers and release their leases. Workers that
    /// stopped on their own put the partition into cooldown; retiring workers
    /// past their deadline are aborted.
    async fn reap_finished(&self) {
        let now = Instant::now();
        let finished: Vec<PartitionId> = self
            .workers
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                if handle.task.is_finished() {
                    return true;
                }
                if handle.retire_by.is_some_and(|by| by <= now) {
                    warn!(partition = %entry.key(), "Worker did not stop in time; aborting");
                    handle.task.abort();
                    return true;
                }
                false
            })
            .map(|entry| entry.key().clone())
            .collect();

        for partition in finished {
            let Some((_, handle)) = self.workers.remove(&partition) else {
                continue;
            };
            let outcome = match handle.task.await {
                Ok(outcome) => outcome,
                Err(e) => WorkerOutcome::Failed(ConsumerError::Worker {
                    partition: partition.clone(),
                    message: e.to_string(),
                }),
            };

            match &outcome {
                WorkerOutcome::Cancelled => {
                    debug!(partition = %partition, "Reaped cancelled worker");
                }
                WorkerOutcome::LeaseLost(reason) => {
                    info!(partition = %partition, reason = %reason, "Reaped worker after lease loss");
                }
                WorkerOutcome::Failed(err) => {
                    warn!(partition = %partition, error = %err, "Reaped failed worker");
                }
            }

            let retired = handle.retire_by.is_some();
            if !retired && !matches!(outcome, WorkerOutcome::Cancelled) {
                let until = add_duration(self.clock.now(), self.config.lease_duration);
                self.cooldown.insert(partition.clone(), until);
            }
            handle.guard.mark_lost(LossReason::Released);
            self.release(&partition, handle.fencing_token).await;
            if retired {
                info!(partition = %partition, "Excess partition released");
            }
        }
    }

    /// Start giving up one partition. The worker finishes its in-flight
    /// batch and checkpoints; a later cycle reaps it and releases the lease.
    fn retire(&self, partition: &PartitionId) {
        let Some(mut entry) = self.workers.get_mut(partition) else {
            return;
        };
        let handle = entry.value_mut();
        if handle.retire_by.is_some() {
            return;
        }
        handle.retire_by = Some(Instant::now() + self.config.shutdown_grace);
        handle.cancel.cancel();
        debug!(partition = %partition, "Retiring excess partition");
    }

    async fn release(&self, partition: &PartitionId, token: FencingToken) {
        let owner = &self.config.owner_id;
        match timeout(
            RELEASE_TIMEOUT,
            self.leases.release_lease(partition, owner, token),
        )
        .await
        {
            Ok(Ok(())) => {
                self.telemetry.emit(
                    TelemetryEvent::new(TelemetryKind::PartitionReleased, owner.clone())
                        .partition(partition)
                        .token(token),
                );
            }
            Ok(Err(e)) => warn!(partition = %partition, error = %e, "Error releasing lease"),
            Err(_) => warn!(partition = %partition, "Timeout releasing lease"),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancel every worker and wait for them within the grace period.
    async fn stop_workers(&self, workers_token: &CancellationToken) -> ConsumerResult<()> {
        workers_token.cancel();
        let mut states: Vec<watch::Receiver<WorkerState>> = self
            .workers
            .iter()
            .map(|entry| entry.value().state.clone())
            .collect();
        if states.is_empty() {
            return Ok(());
        }
        info!(workers = states.len(), "Waiting for workers to finish");

        let grace = self.config.shutdown_grace;
        let all_stopped = timeout(
            grace,
            join_all(states.iter_mut().map(|rx| async move {
                rx.wait_for(|s| s.is_terminal()).await.map(|_| ())
            })),
        )
        .await
        .is_ok();
        if all_stopped {
            return Ok(());
        }

        let stragglers: Vec<PartitionId> = self
            .workers
            .iter()
            .filter(|entry| !entry.value().task.is_finished())
            .map(|entry| {
                entry.value().task.abort();
                entry.key().clone()
            })
            .collect();
        if stragglers.is_empty() {
            return Ok(());
        }
        warn!(
            stragglers = ?stragglers,
            grace_secs = grace.as_secs(),
            "Workers exceeded shutdown grace; aborted"
        );
        Err(ConsumerError::ShutdownTimeout {
            grace_secs: grace.as_secs(),
            stragglers: stragglers.len(),
        })
    }

    async fn release_all(&self) {
        let handles: Vec<(PartitionId, WorkerHandle)> = {
            let keys: Vec<PartitionId> = self.workers.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|k| self.workers.remove(&k))
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(partitions = handles.len(), "Releasing partitions during shutdown");

        join_all(handles.iter().map(|(partition, handle)| {
            handle.guard.mark_lost(LossReason::Released);
            self.release(partition, handle.fencing_token)
        }))
        .await;
    }

    async fn leave_fleet(&self) {
        let owner = &self.config.owner_id;
        match timeout(RELEASE_TIMEOUT, self.leases.store().remove_member(owner)).await {
            Ok(Ok(())) => debug!(owner = %owner, "Member record removed"),
            Ok(Err(e)) => warn!(owner = %owner, error = %e, "Error removing member record"),
            Err(_) => warn!(owner = %owner, "Timeout removing member record"),
        }
    }
}

/// Background renewal of every held lease.
struct Renewer {
    leases: LeaseManager,
    workers: WorkerMap,
    owner: OwnerId,
    lease_duration: Duration,
    interval: Duration,
}

impl Renewer {
    async fn run(self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(with_jitter(self.interval)) => {}
                _ = stop.cancelled() => {
                    debug!("Renewal loop stopped");
                    return;
                }
            }
            self.renew_all().await;
        }
    }

    async fn renew_all(&self) {
        let targets: Vec<(PartitionId, FencingToken, LeaseGuard, CancellationToken)> = self
            .workers
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                !handle.guard.is_lost() && !handle.task.is_finished()
            })
            .map(|entry| {
                let handle = entry.value();
                (
                    entry.key().clone(),
                    handle.fencing_token,
                    handle.guard.clone(),
                    handle.cancel.clone(),
                )
            })
            .collect();

        let results = join_all(targets.iter().map(|(partition, token, _, _)| {
            self.leases
                .renew_lease(partition, &self.owner, *token, self.lease_duration)
        }))
        .await;

        for ((partition, _, guard, cancel), result) in targets.into_iter().zip(results) {
            match result {
                Ok(lease) => guard.extend(lease.expires_at),
                Err(e) if e.is_ownership_lost() => {
                    let reason = LossReason::from_error(&e).unwrap_or(LossReason::FencingMismatch);
                    if guard.mark_lost(reason) {
                        warn!(partition = %partition, reason = %reason, "Lease lost on renewal; stopping worker");
                    }
                    cancel.cancel();
                }
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Lease renewal failed (will retry)");
                    record_store_failure("renew");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::clock::{Clock, ManualClock};
    use crate::consumer::handler::LoggingHandler;
    use crate::consumer::memory_source::MemoryEventSource;
    use crate::consumer::testing::memory_stores;

    const LEASE: Duration = Duration::from_secs(30);

    fn dispatcher(clock: SharedClock) -> PartitionDispatcher {
        let (leases, checkpoints) = memory_stores(clock.clone());
        let config = ConsumerConfig {
            owner_id: OwnerId::new("a"),
            lease_duration: LEASE,
            shutdown_grace: Duration::from_secs(5),
            ..ConsumerConfig::default()
        };
        PartitionDispatcher::new(
            config,
            leases,
            checkpoints,
            Arc::new(MemoryEventSource::new(2)),
            Arc::new(LoggingHandler),
        )
        .with_clock(clock)
    }

    /// Acquire `partition` and track `task` as its worker.
    async fn track(
        d: &PartitionDispatcher,
        partition: &str,
        task: JoinHandle<WorkerOutcome>,
    ) -> PartitionLease {
        let partition = PartitionId::new(partition);
        let lease = d
            .leases
            .acquire_lease(&partition, &d.config.owner_id, LEASE)
            .await
            .unwrap();
        let (_, state) = watch::channel(WorkerState::Receiving);
        d.workers.insert(
            partition,
            WorkerHandle {
                fencing_token: lease.fencing_token,
                acquired_at: d.clock.now(),
                guard: LeaseGuard::new(&lease, d.clock.clone(), Duration::from_secs(2)),
                cancel: CancellationToken::new(),
                state,
                task,
                retire_by: None,
            },
        );
        lease
    }

    // ========================================================================
    // Worker Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_renewal_skips_finished_workers() {
        let manual = Arc::new(ManualClock::default());
        let d = dispatcher(manual.clone());

        let done = tokio::spawn(async { WorkerOutcome::Cancelled });
        while !done.is_finished() {
            tokio::task::yield_now().await;
        }
        let finished = track(&d, "0", done).await;
        let running = track(&d, "1", tokio::spawn(std::future::pending())).await;

        manual.advance(Duration::from_secs(10));
        Renewer {
            leases: d.leases.clone(),
            workers: d.workers.clone(),
            owner: d.config.owner_id.clone(),
            lease_duration: LEASE,
            interval: Duration::from_secs(1),
        }
        .renew_all()
        .await;

        let p0 = d.leases.current_lease(&PartitionId::new("0")).await.unwrap().unwrap();
        let p1 = d.leases.current_lease(&PartitionId::new("1")).await.unwrap().unwrap();
        assert_eq!(p0.expires_at, finished.expires_at);
        assert!(p1.expires_at > running.expires_at);
    }

    #[tokio::test]
    async fn test_retire_does_not_wait_and_overdue_worker_is_aborted() {
        let manual = Arc::new(ManualClock::default());
        let d = dispatcher(manual.clone());
        let partition = PartitionId::new("0");
        let lease = track(&d, "0", tokio::spawn(std::future::pending())).await;

        d.retire(&partition);
        assert!(d.owned_partitions().is_empty());
        assert!(d.active_cooldowns(manual.now()).contains(&partition));
        {
            let handle = d.workers.get(&partition).unwrap();
            assert!(handle.cancel.is_cancelled());
            assert!(!handle.task.is_finished());
        }

        // Within the grace period the worker is left to finish.
        d.reap_finished().await;
        assert!(d.workers.contains_key(&partition));

        d.workers.get_mut(&partition).unwrap().retire_by = Some(Instant::now());
        d.reap_finished().await;
        assert!(d.workers.is_empty());
        assert!(d.cooldown.is_empty(), "retired partitions get no cooldown");

        let stored = d.leases.current_lease(&partition).await.unwrap().unwrap();
        assert_eq!(stored.fencing_token, lease.fencing_token);
        assert!(!stored.is_live(manual.now()));
    }

    #[test]
    fn test_with_jitter_stays_in_band() {
        let base = Duration::from_secs(10);
        for _ in 0..1000 {
            let d = with_jitter(base);
            assert!(d >= Duration::from_secs_f64(8.49), "{:?}", d);
            assert!(d <= Duration::from_secs_f64(11.51), "{:?}", d);
        }
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(is_store_failure(&ConsumerError::Store("cas".into())));
        assert!(!is_store_failure(&ConsumerError::Source {
            partition: PartitionId::new("*"),
            message: "x".into()
        }));
        assert!(!is_store_failure(&ConsumerError::Config("x".into())));
    }
}
