//! Criterion micro-benchmarks for the balance planner.
//!
//! These benchmarks measure the per-cycle planning cost for:
//! - Fair-share computation over large fleets
//! - Dynamic planning with a fleet snapshot of leases and members
//! - Static planning
//!
//! Run with: `cargo bench --bench balance_bench`

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use leasehold::consumer::balancer::{
    AssignmentStrategy, BalanceInput, HeldPartition, fair_share, plan,
};
use leasehold::types::{FencingToken, MemberRecord, OwnerId, PartitionId, PartitionLease};

const LEASE: Duration = Duration::from_secs(30);

struct Snapshot {
    owner: OwnerId,
    partitions: Vec<PartitionId>,
    leases: Vec<PartitionLease>,
    members: Vec<MemberRecord>,
    held: Vec<HeldPartition>,
}

/// `partitions` spread round-robin over `owners`, with owner 0 as "us".
fn snapshot(partitions: usize, owners: usize) -> Snapshot {
    let now = Utc::now();
    let expires_at = now + TimeDelta::seconds(30);
    let owner_ids: Vec<OwnerId> = (0..owners).map(|i| OwnerId::new(format!("owner-{}", i))).collect();
    let partition_ids: Vec<PartitionId> = (0..partitions).map(|i| PartitionId::new(i.to_string())).collect();

    let leases: Vec<PartitionLease> = partition_ids
        .iter()
        .enumerate()
        .map(|(i, p)| PartitionLease {
            partition_id: p.clone(),
            owner_id: owner_ids[i % owners].clone(),
            fencing_token: FencingToken(1),
            expires_at,
        })
        .collect();
    let held = leases
        .iter()
        .filter(|l| l.owner_id == owner_ids[0])
        .map(|l| HeldPartition {
            partition_id: l.partition_id.clone(),
            acquired_at: now - TimeDelta::seconds(60),
        })
        .collect();
    let members = owner_ids
        .iter()
        .map(|o| MemberRecord {
            owner_id: o.clone(),
            started_at: now,
            expires_at,
        })
        .collect();

    Snapshot {
        owner: owner_ids[0].clone(),
        partitions: partition_ids,
        leases,
        members,
        held,
    }
}

fn bench_fair_share(c: &mut Criterion) {
    let mut group = c.benchmark_group("fair_share");

    for owners in [2usize, 16, 128, 1024].iter() {
        let holdings: BTreeMap<OwnerId, usize> = (0..*owners)
            .map(|i| (OwnerId::new(format!("owner-{}", i)), i % 7))
            .collect();
        let me = OwnerId::new("owner-0");

        group.throughput(Throughput::Elements(*owners as u64));
        group.bench_with_input(BenchmarkId::from_parameter(owners), owners, |b, _| {
            b.iter(|| fair_share(black_box(4096), black_box(&holdings), black_box(&me)));
        });
    }

    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    let cooldown = HashSet::new();

    for (partitions, owners) in [(32usize, 4usize), (256, 16), (1024, 64)].iter() {
        let snap = snapshot(*partitions, *owners);
        let input = BalanceInput {
            owner: &snap.owner,
            partitions: &snap.partitions,
            leases: &snap.leases,
            members: &snap.members,
            held: &snap.held,
            cooldown: &cooldown,
            now: Utc::now(),
            lease_duration: LEASE,
        };
        let label = format!("{}p_{}o", partitions, owners);

        group.throughput(Throughput::Elements(*partitions as u64));
        group.bench_function(BenchmarkId::new("dynamic", &label), |b| {
            b.iter(|| plan(AssignmentStrategy::Dynamic, black_box(&input)));
        });
        group.bench_function(BenchmarkId::new("static", &label), |b| {
            b.iter(|| {
                plan(
                    AssignmentStrategy::Static {
                        process_index: 0,
                        process_count: *owners,
                    },
                    black_box(&input),
                )
            });
        });
    }

    group.finish();
}

/// Fresh process joining a fleet where every partition is still unleased.
fn bench_cold_start(c: &mut Criterion) {
    let partitions: Vec<PartitionId> = (0..1024).map(|i| PartitionId::new(i.to_string())).collect();
    let owner = OwnerId::new("joiner");
    let cooldown = HashSet::new();
    let input = BalanceInput {
        owner: &owner,
        partitions: &partitions,
        leases: &[],
        members: &[],
        held: &[],
        cooldown: &cooldown,
        now: Utc::now(),
        lease_duration: LEASE,
    };

    c.bench_function("plan_cold_start_1024", |b| {
        b.iter(|| plan(AssignmentStrategy::Dynamic, black_box(&input)));
    });
}

criterion_group!(benches, bench_fair_share, bench_plan, bench_cold_start);
criterion_main!(benches);
