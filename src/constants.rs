//! Centralized defaults and limits.
//!
//! Every tunable that `ConsumerConfig` exposes has its default here, next to
//! the internal limits that are deliberately not configurable.
//!
//! # Categories
//!
//! - **Lease Constants**: lease duration, renewal and balancing cadence
//! - **Consumption Constants**: batch size and receive timeout
//! - **Store Constants**: object layout and CAS retry limits
//! - **Shutdown Constants**: grace period and escalation thresholds

use std::time::Duration;

// =============================================================================
// Lease Constants
// =============================================================================

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default renewal cadence. Must stay at or below half the lease duration.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Default cadence of the dispatcher's balance loop.
pub const DEFAULT_BALANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Jitter applied to periodic loops (±15%).
pub const LOOP_JITTER_FRACTION: f64 = 0.15;

/// Lower bound on any configured lease duration.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(1);

/// A checkpoint is not attempted when the lease expires within this margin.
pub const DEFAULT_CHECKPOINT_SAFETY_MARGIN: Duration = Duration::from_secs(2);

/// Number of partitions acquired concurrently in one balance cycle.
pub const ACQUIRE_CHUNK_SIZE: usize = 8;

// =============================================================================
// Consumption Constants
// =============================================================================

/// Maximum events returned by one receive call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// How long a receive call waits for at least one event.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound accepted for `max_batch_size`.
pub const MAX_BATCH_SIZE_LIMIT: usize = 10_000;

// =============================================================================
// Store Constants
// =============================================================================

/// Default object-store prefix under which all records are written.
pub const DEFAULT_STORE_PREFIX: &str = "partitionlease";

/// Default consumer group.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Directory holding one lease record per partition.
pub const LEASES_DIR: &str = "leases";

/// Directory holding one checkpoint record per partition.
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Directory holding one heartbeat record per fleet member.
pub const MEMBERS_DIR: &str = "members";

/// Attempts made by a compare-and-swap loop before giving up.
pub const MAX_CAS_ATTEMPTS: usize = 8;

// =============================================================================
// Shutdown Constants
// =============================================================================

/// Default time granted to workers to finish their in-flight batch.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Timeout applied to each best-effort lease release during shutdown.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive store failures in the balance loop before the dispatcher gives up.
pub const DEFAULT_MAX_CONSECUTIVE_STORE_FAILURES: u32 = 10;

/// Capacity of the telemetry event channel.
pub const TELEMETRY_CHANNEL_CAPACITY: usize = 1024;
