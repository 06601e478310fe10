//! Partition assignment planning.
//!
//! Pure functions over a snapshot of the fleet: which partitions exist, which
//! live leases are stored, which members are heartbeating, and what this
//! process already holds. The dispatcher executes the resulting
//! [`BalancePlan`] through the lease manager.
//!
//! # Dynamic Strategy
//!
//! With `P` partitions and `N` live owners, every owner's fair share is
//! `P / N`, and `P % N` owners get one extra. Extras go to the owners that
//! already hold the most partitions (ties broken by owner id), so a stable
//! fleet does not shuffle partitions between cycles.
//!
//! - Below the fair share: acquire partitions with no live lease, skipping
//!   partitions in cooldown. Live leases of other owners are never stolen.
//! - Above the fair share: release at most one partition per cycle, and only
//!   one held for at least a full lease duration.
//!
//! # Static Strategy
//!
//! Partition `i` (position in the source's partition order) belongs to the
//! process with `i % process_count == process_index`.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{MemberRecord, OwnerId, PartitionId, PartitionLease};

use super::clock::add_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentStrategy {
    /// Fair share across live members.
    #[default]
    Dynamic,
    /// Fixed modulo assignment.
    Static {
        process_index: usize,
        process_count: usize,
    },
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::Dynamic => "dynamic",
            AssignmentStrategy::Static { .. } => "static",
        }
    }
}

impl std::fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentStrategy::Dynamic => f.write_str("dynamic"),
            AssignmentStrategy::Static {
                process_index,
                process_count,
            } => write!(f, "static({}/{})", process_index, process_count),
        }
    }
}

/// A partition this process holds and when it was acquired.
#[derive(Debug, Clone)]
pub struct HeldPartition {
    pub partition_id: PartitionId,
    pub acquired_at: DateTime<Utc>,
}

/// Fleet snapshot taken at the start of a balance cycle.
#[derive(Debug, Clone, Copy)]
pub struct BalanceInput<'a> {
    pub owner: &'a OwnerId,
    pub partitions: &'a [PartitionId],
    pub leases: &'a [PartitionLease],
    pub members: &'a [MemberRecord],
    pub held: &'a [HeldPartition],
    pub cooldown: &'a HashSet<PartitionId>,
    pub now: DateTime<Utc>,
    pub lease_duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancePlan {
    pub fair_share: usize,
    pub acquire: Vec<PartitionId>,
    pub release: Vec<PartitionId>,
}

impl BalancePlan {
    pub fn is_noop(&self) -> bool {
        self.acquire.is_empty() && self.release.is_empty()
    }
}

/// Target partition count for `owner` given per-owner holdings.
///
/// `holdings` must contain every live owner (with zero for owners holding
/// nothing); `owner` is counted even when absent.
pub fn fair_share(
    partition_count: usize,
    holdings: &BTreeMap<OwnerId, usize>,
    owner: &OwnerId,
) -> usize {
    let mut ranked: Vec<(&OwnerId, usize)> = holdings.iter().map(|(o, n)| (o, *n)).collect();
    if !holdings.contains_key(owner) {
        ranked.push((owner, 0));
    }
    let members = ranked.len().max(1);
    let base = partition_count / members;
    let extra = partition_count % members;

    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let rank = ranked
        .iter()
        .position(|(o, _)| *o == owner)
        .unwrap_or(members - 1);

    base + usize::from(rank < extra)
}

/// Compute what this process should acquire and release.
pub fn plan(strategy: AssignmentStrategy, input: &BalanceInput<'_>) -> BalancePlan {
    match strategy {
        AssignmentStrategy::Dynamic => plan_dynamic(input),
        AssignmentStrategy::Static {
            process_index,
            process_count,
        } => plan_static(input, process_index, process_count),
    }
}

fn plan_dynamic(input: &BalanceInput<'_>) -> BalancePlan {
    let held: HashSet<&PartitionId> = input.held.iter().map(|h| &h.partition_id).collect();
    let known: HashSet<&PartitionId> = input.partitions.iter().collect();

    // Live owners: heartbeating members plus anyone holding a live lease.
    let mut holdings: BTreeMap<OwnerId, usize> = BTreeMap::new();
    for member in input.members.iter().filter(|m| m.is_live(input.now)) {
        holdings.entry(member.owner_id.clone()).or_default();
    }
    for lease in input.leases.iter().filter(|l| l.is_live(input.now)) {
        if known.contains(&lease.partition_id) && &lease.owner_id != input.owner {
            *holdings.entry(lease.owner_id.clone()).or_default() += 1;
        }
    }
    holdings.insert(input.owner.clone(), held.len());

    let target = fair_share(input.partitions.len(), &holdings, input.owner);
    let mut plan = BalancePlan {
        fair_share: target,
        ..Default::default()
    };

    if held.len() < target {
        let leased_elsewhere: HashSet<&PartitionId> = input
            .leases
            .iter()
            .filter(|l| l.is_live(input.now) && &l.owner_id != input.owner)
            .map(|l| &l.partition_id)
            .collect();

        plan.acquire = input
            .partitions
            .iter()
            .filter(|p| !held.contains(p))
            .filter(|p| !leased_elsewhere.contains(p))
            .filter(|p| !input.cooldown.contains(*p))
            .take(target - held.len())
            .cloned()
            .collect();
    } else if held.len() > target {
        // Partitions that disappeared from the source go first.
        let release = input
            .held
            .iter()
            .filter(|h| add_duration(h.acquired_at, input.lease_duration) <= input.now)
            .max_by(|a, b| {
                let a_known = known.contains(&a.partition_id);
                let b_known = known.contains(&b.partition_id);
                b_known
                    .cmp(&a_known)
                    .then_with(|| a.partition_id.cmp(&b.partition_id))
            });
        if let Some(h) = release {
            plan.release.push(h.partition_id.clone());
        }
    }

    plan
}

fn plan_static(
    input: &BalanceInput<'_>,
    process_index: usize,
    process_count: usize,
) -> BalancePlan {
    let count = process_count.max(1);
    let assigned: Vec<&PartitionId> = input
        .partitions
        .iter()
        .enumerate()
        .filter(|(i, _)| i % count == process_index)
        .map(|(_, p)| p)
        .collect();
    let assigned_set: HashSet<&PartitionId> = assigned.iter().copied().collect();
    let held: HashSet<&PartitionId> = input.held.iter().map(|h| &h.partition_id).collect();
    let leased_elsewhere: HashSet<&PartitionId> = input
        .leases
        .iter()
        .filter(|l| l.is_live(input.now) && &l.owner_id != input.owner)
        .map(|l| &l.partition_id)
        .collect();

    BalancePlan {
        fair_share: assigned.len(),
        acquire: assigned
            .iter()
            .filter(|p| !held.contains(*p))
            .filter(|p| !leased_elsewhere.contains(*p))
            .filter(|p| !input.cooldown.contains(**p))
            .map(|p| (*p).clone())
            .collect(),
        release: input
            .held
            .iter()
            .filter(|h| !assigned_set.contains(&h.partition_id))
            .map(|h| h.partition_id.clone())
            .collect(),
    }
}
