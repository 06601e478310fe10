//! Configuration for a consumer process.
//!
//! # Configuration Profiles
//!
//! ```rust,no_run
//! use leasehold::consumer::{ConsumerConfig, ConsumerProfile};
//!
//! // Development profile - short leases, fast balancing, memory store
//! let dev_config = ConsumerConfig::from_profile(ConsumerProfile::Development);
//!
//! // Production profile - the defaults
//! let prod_config = ConsumerConfig::from_profile(ConsumerProfile::Production);
//!
//! // Low-latency profile - fast failover, small batches
//! let ll_config = ConsumerConfig::from_profile(ConsumerProfile::LowLatency);
//! ```
//!
//! # Timing Relationships
//!
//! Lease safety depends on three durations:
//!
//! - `renew_interval` must be at most half of `lease_duration`, so one failed
//!   renewal still leaves time for a second attempt before expiry.
//! - `checkpoint_safety_margin` must be smaller than the time left on a lease
//!   just before it is renewed (`lease_duration - renew_interval`), otherwise
//!   no checkpoint would ever be allowed.
//! - All processes of a fleet must share the same `lease_duration` and have
//!   synchronized clocks (NTP); expiry is a wall-clock comparison.

use std::time::Duration;

use crate::constants::{
    DEFAULT_BALANCE_INTERVAL, DEFAULT_CHECKPOINT_SAFETY_MARGIN, DEFAULT_CONSUMER_GROUP,
    DEFAULT_LEASE_DURATION, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_CONSECUTIVE_STORE_FAILURES,
    DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RENEW_INTERVAL, DEFAULT_SHUTDOWN_GRACE,
    DEFAULT_STORE_PREFIX, MAX_BATCH_SIZE_LIMIT, MIN_LEASE_DURATION,
};
use crate::types::{OwnerId, StartPosition};

use super::balancer::AssignmentStrategy;
use super::error::{ConsumerError, ConsumerResult};

/// Validated configuration profiles.
///
/// | Profile | Use Case | Failover | Batch | Store |
/// |---------|----------|----------|-------|-------|
/// | Development | Local testing | ~15s | 100 | memory |
/// | Production | General workloads | ~30s | 100 | configured |
/// | LowLatency | Real-time pipelines | ~10s | 25 | configured |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerProfile {
    /// Short leases and quick balancing for local runs.
    ///
    /// **Not suitable for production use.**
    Development,

    /// Balanced defaults.
    Production,

    /// Faster failover and smaller batches.
    ///
    /// **Warning:** tighter lease margins; clocks must be well synchronized.
    LowLatency,
}

impl ConsumerProfile {
    pub fn description(&self) -> &'static str {
        match self {
            ConsumerProfile::Development => "Local development and testing",
            ConsumerProfile::Production => "Balanced production workloads",
            ConsumerProfile::LowLatency => "Fast failover, small batches",
        }
    }

    pub fn all() -> &'static [ConsumerProfile] {
        &[
            ConsumerProfile::Development,
            ConsumerProfile::Production,
            ConsumerProfile::LowLatency,
        ]
    }
}

impl std::fmt::Display for ConsumerProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerProfile::Development => write!(f, "development"),
            ConsumerProfile::Production => write!(f, "production"),
            ConsumerProfile::LowLatency => write!(f, "low-latency"),
        }
    }
}

impl std::str::FromStr for ConsumerProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ConsumerProfile::Development),
            "production" | "prod" => Ok(ConsumerProfile::Production),
            "low-latency" | "latency" | "ll" => Ok(ConsumerProfile::LowLatency),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, low-latency",
                s
            )),
        }
    }
}

/// Backend holding lease, member and checkpoint records.
///
/// The backend must support conditional writes (create-if-absent and
/// update-if-version-matches); all four variants do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local in-memory store. Only coordinates dispatchers that share
    /// the same store instance.
    #[default]
    Memory,
    /// Amazon S3 or S3-compatible storage with conditional put support.
    S3 {
        bucket: String,
        region: String,
        /// Custom endpoint for S3-compatible services.
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
    /// Google Cloud Storage.
    Gcs {
        bucket: String,
        /// Path to a service account key file.
        service_account_key: Option<String>,
    },
    /// Azure Blob Storage.
    Azure {
        container: String,
        account: String,
        access_key: Option<String>,
    },
}

impl StoreBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::S3 { .. } => "s3",
            StoreBackend::Gcs { .. } => "gcs",
            StoreBackend::Azure { .. } => "azure",
        }
    }
}

/// Configuration for one consumer process.
///
/// Every process in a fleet uses the same `consumer_group`, `store_prefix`,
/// store backend and `lease_duration`; `owner_id` must be unique per process.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// This process's identity in lease records. Generated when not supplied.
    pub owner_id: OwnerId,

    /// Consumer group; leases and checkpoints are scoped to it.
    pub consumer_group: String,

    /// Object-store prefix for all records.
    pub store_prefix: String,

    /// Where lease, member and checkpoint records live.
    pub store: StoreBackend,

    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,

    /// Renewal cadence for held leases.
    pub renew_interval: Duration,

    /// Cadence of the balance loop (claim, release, reap).
    pub balance_interval: Duration,

    /// Maximum events per receive call.
    pub max_batch_size: usize,

    /// How long one receive call waits for events.
    pub receive_timeout: Duration,

    /// Start position for partitions without a checkpoint.
    pub start_position: StartPosition,

    /// How partitions are divided among processes.
    pub strategy: AssignmentStrategy,

    /// Time granted to workers to finish in-flight batches on shutdown.
    pub shutdown_grace: Duration,

    /// Checkpoints are refused when the lease expires within this margin.
    pub checkpoint_safety_margin: Duration,

    /// Consecutive balance-loop store failures before the run fails.
    pub max_consecutive_store_failures: u32,

    /// Fail the run if no partition could be claimed for this long while
    /// the fair share is non-zero. `None` disables the check.
    pub max_unclaimed_duration: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            owner_id: OwnerId::generate(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            store_prefix: DEFAULT_STORE_PREFIX.to_string(),
            store: StoreBackend::default(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            balance_interval: DEFAULT_BALANCE_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            start_position: StartPosition::Earliest,
            strategy: AssignmentStrategy::Dynamic,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            checkpoint_safety_margin: DEFAULT_CHECKPOINT_SAFETY_MARGIN,
            max_consecutive_store_failures: DEFAULT_MAX_CONSECUTIVE_STORE_FAILURES,
            max_unclaimed_duration: None,
        }
    }
}

impl ConsumerConfig {
    /// Create a configuration from a validated profile.
    ///
    /// Individual fields can still be overridden afterwards.
    pub fn from_profile(profile: ConsumerProfile) -> Self {
        let base = Self::default();

        match profile {
            ConsumerProfile::Development => Self {
                lease_duration: Duration::from_secs(15),
                renew_interval: Duration::from_secs(5),
                balance_interval: Duration::from_secs(2),
                receive_timeout: Duration::from_secs(5),
                shutdown_grace: Duration::from_secs(10),
                store: StoreBackend::Memory,
                ..base
            },
            ConsumerProfile::Production => base,
            ConsumerProfile::LowLatency => Self {
                lease_duration: Duration::from_secs(10),
                renew_interval: Duration::from_secs(3),
                balance_interval: Duration::from_secs(3),
                max_batch_size: 25,
                receive_timeout: Duration::from_secs(1),
                checkpoint_safety_margin: Duration::from_secs(1),
                shutdown_grace: Duration::from_secs(10),
                ..base
            },
        }
    }

    /// Create a configuration from the `CONSUMER_PROFILE` environment variable.
    ///
    /// Falls back to Production if not set or invalid.
    pub fn from_profile_env() -> Self {
        let profile = std::env::var("CONSUMER_PROFILE")
            .ok()
            .and_then(|s| s.parse::<ConsumerProfile>().ok())
            .unwrap_or(ConsumerProfile::Production);

        tracing::info!(
            profile = %profile,
            description = profile.description(),
            "Using consumer profile"
        );
        Self::from_profile(profile)
    }

    /// Validate the configuration and return every problem found.
    ///
    /// Called by the dispatcher before any lease is claimed.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.owner_id.as_str().is_empty() {
            errors.push("owner_id must not be empty".to_string());
        }

        if self.consumer_group.is_empty() {
            errors.push("consumer_group must not be empty".to_string());
        }

        if self.lease_duration < MIN_LEASE_DURATION {
            errors.push(format!(
                "lease_duration ({:?}) must be at least {:?}",
                self.lease_duration, MIN_LEASE_DURATION
            ));
        }

        if self.renew_interval.is_zero() {
            errors.push("renew_interval must be positive".to_string());
        }

        if self.renew_interval * 2 > self.lease_duration {
            errors.push(format!(
                "renew_interval ({:?}) must be at most half of lease_duration ({:?})",
                self.renew_interval, self.lease_duration
            ));
        }

        if self.checkpoint_safety_margin
            >= self.lease_duration.saturating_sub(self.renew_interval)
        {
            errors.push(format!(
                "checkpoint_safety_margin ({:?}) must be less than lease_duration - renew_interval ({:?})",
                self.checkpoint_safety_margin,
                self.lease_duration.saturating_sub(self.renew_interval)
            ));
        }

        if self.balance_interval.is_zero() {
            errors.push("balance_interval must be positive".to_string());
        }

        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            errors.push(format!(
                "max_batch_size ({}) must be between 1 and {}",
                self.max_batch_size, MAX_BATCH_SIZE_LIMIT
            ));
        }

        if self.receive_timeout.is_zero() {
            errors.push("receive_timeout must be positive".to_string());
        }

        if self.max_consecutive_store_failures == 0 {
            errors.push("max_consecutive_store_failures must be positive".to_string());
        }

        if let AssignmentStrategy::Static {
            process_index,
            process_count,
        } = self.strategy
        {
            if process_count == 0 {
                errors.push("process_count must be positive for static assignment".to_string());
            } else if process_index >= process_count {
                errors.push(format!(
                    "process_index ({}) must be less than process_count ({})",
                    process_index, process_count
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every problem into one `ConsumerError::Config`.
    pub fn validated(&self) -> ConsumerResult<()> {
        self.validate()
            .map_err(|errors| ConsumerError::Config(errors.join("; ")))
    }

    /// Create configuration from environment variables.
    ///
    /// Starts from the profile named by `CONSUMER_PROFILE` and overrides:
    /// - `CONSUMER_OWNER_ID`: owner identity (default: random UUID)
    /// - `CONSUMER_GROUP`: consumer group (default: `$Default`)
    /// - `STORE_PREFIX`: object-store prefix (default: `partitionlease`)
    /// - `LEASE_DURATION_SECS`, `LEASE_RENEW_INTERVAL_MS`, `BALANCE_INTERVAL_MS`
    /// - `MAX_BATCH_SIZE`, `RECEIVE_TIMEOUT_SECS`, `START_POSITION`
    /// - `ASSIGNMENT_STRATEGY`: `dynamic` or `static`, with `PROCESS_INDEX`
    ///   and `PROCESS_COUNT` for static
    /// - `SHUTDOWN_GRACE_SECS`, `CHECKPOINT_SAFETY_MARGIN_MS`
    /// - `MAX_CONSECUTIVE_STORE_FAILURES`, `MAX_UNCLAIMED_SECS`
    /// - `STORE_TYPE`: `memory`, `s3`, `gcs` or `azure` (default: memory)
    ///
    /// For S3:
    /// - `AWS_S3_BUCKET` or `S3_BUCKET`, `AWS_REGION`, `AWS_ENDPOINT`,
    ///   `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
    ///
    /// For GCS:
    /// - `GCS_BUCKET`, `GOOGLE_APPLICATION_CREDENTIALS`
    ///
    /// For Azure:
    /// - `PARTITION_LEASE_CONTAINER` or `AZURE_CONTAINER`
    /// - `STORAGE_ACCOUNT_NAME` or `AZURE_STORAGE_ACCOUNT`
    /// - `AZURE_STORAGE_ACCESS_KEY`
    pub fn from_env() -> ConsumerResult<Self> {
        let defaults = Self::from_profile_env();

        let owner_id = std::env::var("CONSUMER_OWNER_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .map(OwnerId::from)
            .unwrap_or(defaults.owner_id);

        let consumer_group =
            std::env::var("CONSUMER_GROUP").unwrap_or(defaults.consumer_group);

        let store_prefix = std::env::var("STORE_PREFIX").unwrap_or(defaults.store_prefix);

        let lease_duration = std::env::var("LEASE_DURATION_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_duration);

        let renew_interval = std::env::var("LEASE_RENEW_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.renew_interval);

        let balance_interval = std::env::var("BALANCE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.balance_interval);

        let max_batch_size: usize = std::env::var("MAX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_batch_size);

        let receive_timeout = std::env::var("RECEIVE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.receive_timeout);

        let start_position = match std::env::var("START_POSITION") {
            Ok(v) => v.parse::<StartPosition>().map_err(ConsumerError::Config)?,
            Err(_) => defaults.start_position,
        };

        let strategy = match std::env::var("ASSIGNMENT_STRATEGY")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            Ok("static") => {
                let process_index: usize = std::env::var("PROCESS_INDEX")
                    .map_err(|_| {
                        ConsumerError::Config(
                            "PROCESS_INDEX must be set when ASSIGNMENT_STRATEGY=static".into(),
                        )
                    })?
                    .parse()
                    .map_err(|e| ConsumerError::Config(format!("Invalid PROCESS_INDEX: {}", e)))?;
                let process_count: usize = std::env::var("PROCESS_COUNT")
                    .map_err(|_| {
                        ConsumerError::Config(
                            "PROCESS_COUNT must be set when ASSIGNMENT_STRATEGY=static".into(),
                        )
                    })?
                    .parse()
                    .map_err(|e| ConsumerError::Config(format!("Invalid PROCESS_COUNT: {}", e)))?;
                AssignmentStrategy::Static {
                    process_index,
                    process_count,
                }
            }
            Ok("dynamic") | Err(_) => defaults.strategy,
            Ok(other) => {
                return Err(ConsumerError::Config(format!(
                    "Unknown ASSIGNMENT_STRATEGY '{}', expected dynamic or static",
                    other
                )));
            }
        };

        let shutdown_grace = std::env::var("SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_grace);

        let checkpoint_safety_margin = std::env::var("CHECKPOINT_SAFETY_MARGIN_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.checkpoint_safety_margin);

        let max_consecutive_store_failures: u32 =
            std::env::var("MAX_CONSECUTIVE_STORE_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_consecutive_store_failures);

        let max_unclaimed_duration = std::env::var("MAX_UNCLAIMED_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .or(defaults.max_unclaimed_duration);

        let store = Self::store_from_env(defaults.store)?;

        Ok(Self {
            owner_id,
            consumer_group,
            store_prefix,
            store,
            lease_duration,
            renew_interval,
            balance_interval,
            max_batch_size,
            receive_timeout,
            start_position,
            strategy,
            shutdown_grace,
            checkpoint_safety_margin,
            max_consecutive_store_failures,
            max_unclaimed_duration,
        })
    }

    fn store_from_env(default: StoreBackend) -> ConsumerResult<StoreBackend> {
        let store_type = match std::env::var("STORE_TYPE") {
            Ok(v) => v.to_lowercase(),
            Err(_) => return Ok(default),
        };

        let backend = match store_type.as_str() {
            "memory" => StoreBackend::Memory,
            "s3" => {
                let bucket = std::env::var("AWS_S3_BUCKET")
                    .or_else(|_| std::env::var("S3_BUCKET"))
                    .map_err(|_| {
                        ConsumerError::Config(
                            "S3_BUCKET or AWS_S3_BUCKET must be set when STORE_TYPE=s3".into(),
                        )
                    })?;

                let region = std::env::var("AWS_REGION")
                    .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                    .unwrap_or_else(|_| "us-east-1".to_string());

                StoreBackend::S3 {
                    bucket,
                    region,
                    endpoint: std::env::var("AWS_ENDPOINT")
                        .or_else(|_| std::env::var("S3_ENDPOINT"))
                        .ok(),
                    access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                    secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                }
            }
            "gcs" => {
                let bucket = std::env::var("GCS_BUCKET").map_err(|_| {
                    ConsumerError::Config("GCS_BUCKET must be set when STORE_TYPE=gcs".into())
                })?;

                StoreBackend::Gcs {
                    bucket,
                    service_account_key: std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
                }
            }
            "azure" => {
                let container = std::env::var("PARTITION_LEASE_CONTAINER")
                    .or_else(|_| std::env::var("AZURE_CONTAINER"))
                    .map_err(|_| {
                        ConsumerError::Config(
                            "PARTITION_LEASE_CONTAINER or AZURE_CONTAINER must be set".into(),
                        )
                    })?;

                let account = std::env::var("STORAGE_ACCOUNT_NAME")
                    .or_else(|_| std::env::var("AZURE_STORAGE_ACCOUNT"))
                    .map_err(|_| {
                        ConsumerError::Config(
                            "STORAGE_ACCOUNT_NAME or AZURE_STORAGE_ACCOUNT must be set".into(),
                        )
                    })?;

                StoreBackend::Azure {
                    container,
                    account,
                    access_key: std::env::var("AZURE_STORAGE_ACCESS_KEY").ok(),
                }
            }
            other => {
                return Err(ConsumerError::Config(format!(
                    "Unknown STORE_TYPE '{}', expected memory, s3, gcs or azure",
                    other
                )));
            }
        };

        Ok(backend)
    }
}
