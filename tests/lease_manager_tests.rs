//! Lease acquisition, renewal and release against a shared in-memory store,
//! including concurrent claimants.

use std::sync::Arc;
use std::time::Duration;

use leasehold::consumer::testing::memory_stores;
use leasehold::consumer::{Clock, ConsumerError, LeaseManager, ManualClock, SharedClock};
use leasehold::types::{FencingToken, OwnerId, PartitionId};

const LEASE: Duration = Duration::from_secs(30);

struct Fleet {
    clock: Arc<ManualClock>,
    a: LeaseManager,
    b: LeaseManager,
}

/// Two managers, as two processes would hold, over the same store.
fn fleet() -> Fleet {
    let clock = Arc::new(ManualClock::default());
    let shared: SharedClock = clock.clone();
    let (leases, _) = memory_stores(shared.clone());
    Fleet {
        a: LeaseManager::new(leases.clone(), shared.clone()),
        b: LeaseManager::new(leases, shared),
        clock,
    }
}

fn p(id: &str) -> PartitionId {
    PartitionId::new(id)
}

fn o(id: &str) -> OwnerId {
    OwnerId::new(id)
}

// ============================================================================
// Mutual Exclusion
// ============================================================================

#[tokio::test]
async fn test_concurrent_acquire_has_one_winner() {
    let fleet = fleet();
    let partition = p("0");
    let (owner_a, owner_b) = (o("a"), o("b"));

    let (ra, rb) = tokio::join!(
        fleet.a.acquire_lease(&partition, &owner_a, LEASE),
        fleet.b.acquire_lease(&partition, &owner_b, LEASE),
    );

    let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1, "exactly one claimant must win: {:?} / {:?}", ra, rb);

    let loser = if ra.is_ok() { rb } else { ra };
    assert!(matches!(loser, Err(ConsumerError::LeaseHeld { .. })));

    let stored = fleet.a.current_lease(&partition).await.unwrap().unwrap();
    assert_eq!(stored.fencing_token, FencingToken::FIRST);
}

#[tokio::test]
async fn test_many_claimants_many_partitions() {
    let clock: SharedClock = Arc::new(ManualClock::default());
    let (leases, _) = memory_stores(clock.clone());
    let partitions: Vec<PartitionId> = (0..4).map(|i| p(&i.to_string())).collect();

    let mut tasks = Vec::new();
    for owner in ["a", "b", "c", "d", "e"] {
        let manager = LeaseManager::new(leases.clone(), clock.clone());
        let partitions = partitions.clone();
        tasks.push(tokio::spawn(async move {
            let owner = o(owner);
            let mut won = Vec::new();
            for partition in &partitions {
                if manager.acquire_lease(partition, &owner, LEASE).await.is_ok() {
                    won.push(partition.clone());
                }
            }
            won
        }));
    }

    let mut claimed: Vec<PartitionId> = Vec::new();
    for task in tasks {
        claimed.extend(task.await.unwrap());
    }
    claimed.sort();
    assert_eq!(claimed, partitions, "every partition claimed exactly once");
}

#[tokio::test]
async fn test_live_lease_blocks_other_owner() {
    let fleet = fleet();
    fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();

    fleet.clock.advance(Duration::from_secs(29));
    let err = fleet.b.acquire_lease(&p("0"), &o("b"), LEASE).await.unwrap_err();
    match err {
        ConsumerError::LeaseHeld { holder, .. } => assert_eq!(holder, "a"),
        other => panic!("unexpected error: {:?}", other),
    }
}

// ============================================================================
// Fencing Tokens
// ============================================================================

#[tokio::test]
async fn test_tokens_increase_across_owners() {
    let fleet = fleet();
    let partition = p("0");

    let first = fleet.a.acquire_lease(&partition, &o("a"), LEASE).await.unwrap();
    fleet.clock.advance(LEASE + Duration::from_secs(1));
    let second = fleet.b.acquire_lease(&partition, &o("b"), LEASE).await.unwrap();
    fleet.clock.advance(LEASE + Duration::from_secs(1));
    let third = fleet.a.acquire_lease(&partition, &o("a"), LEASE).await.unwrap();

    assert!(first.fencing_token < second.fencing_token);
    assert!(second.fencing_token < third.fencing_token);
    assert_eq!(third.fencing_token, FencingToken(3));
}

#[tokio::test]
async fn test_token_survives_release() {
    let fleet = fleet();
    let partition = p("0");

    let first = fleet.a.acquire_lease(&partition, &o("a"), LEASE).await.unwrap();
    fleet
        .a
        .release_lease(&partition, &o("a"), first.fencing_token)
        .await
        .unwrap();

    let second = fleet.b.acquire_lease(&partition, &o("b"), LEASE).await.unwrap();
    assert_eq!(second.fencing_token, first.fencing_token.next());
}

#[tokio::test]
async fn test_reacquire_by_same_owner_bumps_token() {
    let fleet = fleet();
    let first = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();
    let again = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();
    assert_eq!(again.fencing_token, first.fencing_token.next());
}

// ============================================================================
// Renewal
// ============================================================================

#[tokio::test]
async fn test_renew_extends_expiry() {
    let fleet = fleet();
    let lease = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();

    fleet.clock.advance(Duration::from_secs(10));
    let renewed = fleet
        .a
        .renew_lease(&p("0"), &o("a"), lease.fencing_token, LEASE)
        .await
        .unwrap();

    assert_eq!(renewed.fencing_token, lease.fencing_token);
    assert!(renewed.expires_at > lease.expires_at);
    assert_eq!(renewed.expires_at, fleet.clock.now() + chrono::Duration::seconds(30));
}

#[tokio::test]
async fn test_renew_after_takeover_is_fencing_mismatch() {
    let fleet = fleet();
    let lease = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();

    fleet.clock.advance(LEASE + Duration::from_secs(1));
    fleet.b.acquire_lease(&p("0"), &o("b"), LEASE).await.unwrap();

    let err = fleet
        .a
        .renew_lease(&p("0"), &o("a"), lease.fencing_token, LEASE)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::FencingMismatch { .. }));
    assert!(err.is_ownership_lost());
}

#[tokio::test]
async fn test_renew_after_expiry_is_expired() {
    let fleet = fleet();
    let lease = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();

    fleet.clock.advance(LEASE + Duration::from_secs(1));
    let err = fleet
        .a
        .renew_lease(&p("0"), &o("a"), lease.fencing_token, LEASE)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::Expired { .. }));
}

// ============================================================================
// Release
// ============================================================================

#[tokio::test]
async fn test_release_frees_partition_immediately() {
    let fleet = fleet();
    let lease = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();

    fleet
        .a
        .release_lease(&p("0"), &o("a"), lease.fencing_token)
        .await
        .unwrap();

    let stored = fleet.a.current_lease(&p("0")).await.unwrap().unwrap();
    assert!(!stored.is_live(fleet.clock.now()));
    fleet.b.acquire_lease(&p("0"), &o("b"), LEASE).await.unwrap();
}

#[tokio::test]
async fn test_stale_release_leaves_new_owner_alone() {
    let fleet = fleet();
    let old = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();
    fleet.clock.advance(LEASE + Duration::from_secs(1));
    let new = fleet.b.acquire_lease(&p("0"), &o("b"), LEASE).await.unwrap();

    fleet
        .a
        .release_lease(&p("0"), &o("a"), old.fencing_token)
        .await
        .unwrap();

    let stored = fleet.b.current_lease(&p("0")).await.unwrap().unwrap();
    assert_eq!(stored, new);
    assert!(stored.is_held_by(&o("b"), fleet.clock.now()));
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let fleet = fleet();
    let lease = fleet.a.acquire_lease(&p("0"), &o("a"), LEASE).await.unwrap();

    for _ in 0..3 {
        fleet
            .a
            .release_lease(&p("0"), &o("a"), lease.fencing_token)
            .await
            .unwrap();
    }
    fleet
        .a
        .release_lease(&p("unknown"), &o("a"), lease.fencing_token)
        .await
        .unwrap();
}
