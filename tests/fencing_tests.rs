//! Fencing across owners: a process that lost its lease can neither renew
//! nor move the checkpoint, and its successor resumes where it stopped.

use std::sync::Arc;
use std::time::Duration;

use leasehold::consumer::testing::{RecordingHandler, memory_stores};
use leasehold::consumer::clock::add_duration;
use leasehold::consumer::{
    CheckpointStore, Clock, ConsumerError, LeaseGuard, LeaseManager, ManualClock, MemoryEventSource,
    PartitionWorker, SharedClock, TelemetrySink, WorkerDeps, WorkerOutcome, WorkerSettings,
};
use leasehold::types::{FencingToken, OwnerId, PartitionId, PartitionLease, Position, StartPosition};
use tokio_util::sync::CancellationToken;

const LEASE: Duration = Duration::from_secs(30);
const MARGIN: Duration = Duration::from_secs(2);

fn p() -> PartitionId {
    PartitionId::new("0")
}

async fn wait_for_position(store: &dyn CheckpointStore, position: i64) {
    for _ in 0..400 {
        if let Some(cp) = store.get_checkpoint(&p()).await.unwrap() {
            if cp.position == Position(position) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("checkpoint never reached {}", position);
}

// ============================================================================
// Checkpoint Store Rules
// ============================================================================

#[tokio::test]
async fn test_checkpoint_rules_across_tokens() {
    let clock: SharedClock = Arc::new(ManualClock::default());
    let (_, checkpoints) = memory_stores(clock);

    assert!(checkpoints.get_checkpoint(&p()).await.unwrap().is_none());

    let first = checkpoints.put_checkpoint(&p(), Position(10), FencingToken(1)).await.unwrap();
    assert_eq!(first.position, Position(10));

    // Regression under the same token keeps the stored value.
    let kept = checkpoints.put_checkpoint(&p(), Position(4), FencingToken(1)).await.unwrap();
    assert_eq!(kept, first);

    // A successor may re-commit the same position to raise the fence.
    let fenced = checkpoints.put_checkpoint(&p(), Position(10), FencingToken(2)).await.unwrap();
    assert_eq!(fenced.fencing_token, FencingToken(2));

    let err = checkpoints
        .put_checkpoint(&p(), Position(50), FencingToken(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::StaleFencing {
            supplied: FencingToken(1),
            stored: FencingToken(2),
            ..
        }
    ));

    let stored = checkpoints.get_checkpoint(&p()).await.unwrap().unwrap();
    assert_eq!(stored.position, Position(10));
    assert_eq!(stored.fencing_token, FencingToken(2));
}

#[tokio::test]
async fn test_concurrent_puts_keep_highest_token() {
    let clock: SharedClock = Arc::new(ManualClock::default());
    let (_, checkpoints) = memory_stores(clock);

    let mut tasks = Vec::new();
    for token in 1..=5u64 {
        let checkpoints = checkpoints.clone();
        tasks.push(tokio::spawn(async move {
            checkpoints
                .put_checkpoint(&p(), Position(token as i64 * 10), FencingToken(token))
                .await
        }));
    }
    for task in tasks {
        let _ = task.await.unwrap();
    }

    let stored = checkpoints.get_checkpoint(&p()).await.unwrap().unwrap();
    assert_eq!(stored.fencing_token, FencingToken(5));
    assert_eq!(stored.position, Position(50));
}

// ============================================================================
// Crash and Takeover
// ============================================================================

#[tokio::test]
async fn test_successor_resumes_and_zombie_is_fenced() {
    let manual = Arc::new(ManualClock::default());
    let clock: SharedClock = manual.clone();
    let (lease_store, checkpoints) = memory_stores(clock.clone());
    let leases = LeaseManager::new(lease_store, clock.clone());
    let source = MemoryEventSource::new(1);
    let settings = WorkerSettings {
        max_batch_size: 100,
        receive_timeout: Duration::from_millis(20),
        start_position: StartPosition::Earliest,
    };

    // Owner A processes positions 0..=12 and checkpoints.
    source.publish_many(&p(), 13).await;
    let owner_a = OwnerId::new("a");
    let lease_a = leases.acquire_lease(&p(), &owner_a, LEASE).await.unwrap();
    assert_eq!(lease_a.fencing_token, FencingToken(1));

    let handler_a = Arc::new(RecordingHandler::new());
    let cancel_a = CancellationToken::new();
    let worker_a = PartitionWorker::new(
        owner_a.clone(),
        LeaseGuard::new(&lease_a, clock.clone(), MARGIN),
        WorkerDeps {
            checkpoints: checkpoints.clone(),
            source: Arc::new(source.clone()),
            handler: handler_a.clone(),
            telemetry: TelemetrySink::disabled(),
        },
        settings,
        cancel_a.clone(),
    );
    let task_a = tokio::spawn(worker_a.run());
    wait_for_position(checkpoints.as_ref(), 12).await;

    // A stalls; its lease lapses and B takes over.
    cancel_a.cancel();
    assert!(matches!(task_a.await.unwrap(), WorkerOutcome::Cancelled));
    manual.advance(LEASE + Duration::from_secs(1));
    source.publish_many(&p(), 5).await;

    let owner_b = OwnerId::new("b");
    let lease_b = leases.acquire_lease(&p(), &owner_b, LEASE).await.unwrap();
    assert_eq!(lease_b.fencing_token, FencingToken(2));

    let handler_b = Arc::new(RecordingHandler::new());
    let cancel_b = CancellationToken::new();
    let worker_b = PartitionWorker::new(
        owner_b,
        LeaseGuard::new(&lease_b, clock.clone(), MARGIN),
        WorkerDeps {
            checkpoints: checkpoints.clone(),
            source: Arc::new(source.clone()),
            handler: handler_b.clone(),
            telemetry: TelemetrySink::disabled(),
        },
        settings,
        cancel_b.clone(),
    );
    let task_b = tokio::spawn(worker_b.run());
    wait_for_position(checkpoints.as_ref(), 17).await;

    let resumed: Vec<i64> = handler_b.processed(&p()).iter().map(|pos| pos.value()).collect();
    assert_eq!(resumed, vec![13, 14, 15, 16, 17]);

    // The zombie wakes up: both its renewal and its checkpoint are refused.
    let renew = leases
        .renew_lease(&p(), &owner_a, lease_a.fencing_token, LEASE)
        .await
        .unwrap_err();
    assert!(matches!(renew, ConsumerError::FencingMismatch { .. }));

    let put = checkpoints
        .put_checkpoint(&p(), Position(20), lease_a.fencing_token)
        .await
        .unwrap_err();
    assert!(matches!(put, ConsumerError::StaleFencing { .. }));

    let stored = checkpoints.get_checkpoint(&p()).await.unwrap().unwrap();
    assert_eq!(stored.position, Position(17));
    assert_eq!(stored.fencing_token, FencingToken(2));

    cancel_b.cancel();
    assert!(matches!(task_b.await.unwrap(), WorkerOutcome::Cancelled));
}

#[tokio::test]
async fn test_worker_with_superseded_token_never_processes() {
    let manual = Arc::new(ManualClock::default());
    let clock: SharedClock = manual.clone();
    let (lease_store, checkpoints) = memory_stores(clock.clone());
    let leases = LeaseManager::new(lease_store, clock.clone());
    let source = MemoryEventSource::new(1);
    source.publish_many(&p(), 3).await;

    let old = leases.acquire_lease(&p(), &OwnerId::new("a"), LEASE).await.unwrap();
    manual.advance(LEASE + Duration::from_secs(1));
    let current = leases.acquire_lease(&p(), &OwnerId::new("b"), LEASE).await.unwrap();

    // A never noticed the takeover and still believes its lease is fresh.
    let stale = PartitionLease {
        expires_at: add_duration(manual.now(), LEASE),
        ..old
    };
    checkpoints
        .put_checkpoint(&p(), Position(0), current.fencing_token)
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::new());
    let worker = PartitionWorker::new(
        OwnerId::new("a"),
        LeaseGuard::new(&stale, clock, MARGIN),
        WorkerDeps {
            checkpoints: checkpoints.clone(),
            source: Arc::new(source),
            handler: handler.clone(),
            telemetry: TelemetrySink::disabled(),
        },
        WorkerSettings {
            max_batch_size: 10,
            receive_timeout: Duration::from_millis(20),
            start_position: StartPosition::Earliest,
        },
        CancellationToken::new(),
    );

    let outcome = worker.run().await;
    assert!(matches!(outcome, WorkerOutcome::LeaseLost(_)), "{:?}", outcome);
    assert_eq!(handler.total_processed(), 0);

    let stored = checkpoints.get_checkpoint(&p()).await.unwrap().unwrap();
    assert_eq!(stored.fencing_token, current.fencing_token);
}

