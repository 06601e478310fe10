//! Domain types shared by the lease, checkpoint and worker layers.
//!
//! Identifiers are newtypes so a partition id can never be passed where an
//! owner id is expected, and a fencing token never mixes with a position.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a partition of the event stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        PartitionId(Arc::from(id.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        PartitionId::new(value)
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        PartitionId(Arc::from(value))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a consumer process in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Arc<str>);

impl OwnerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        OwnerId(Arc::from(id.as_ref()))
    }

    /// Generate a fresh random owner id.
    pub fn generate() -> Self {
        OwnerId::new(uuid::Uuid::new_v4().to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        OwnerId::new(value)
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        OwnerId(Arc::from(value))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonically increasing token issued on every successful lease acquisition.
///
/// Storage writes carry the token; the store rejects any token older than
/// the one it has already seen, which is what keeps a paused ex-owner from
/// overwriting its successor's progress.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FencingToken(pub u64);

impl FencingToken {
    /// Token assigned to the first ever acquisition of a partition.
    pub const FIRST: Self = FencingToken(1);

    #[inline]
    pub const fn new(value: u64) -> Self {
        FencingToken(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The token following this one.
    #[inline]
    pub const fn next(self) -> Self {
        FencingToken(self.0.saturating_add(1))
    }
}

impl From<u64> for FencingToken {
    fn from(value: u64) -> Self {
        FencingToken(value)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event within its partition (a sequence number).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub i64);

impl Position {
    #[inline]
    pub const fn new(value: i64) -> Self {
        Position(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for Position {
    fn from(value: i64) -> Self {
        Position(value)
    }
}

impl From<Position> for i64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a partition without a checkpoint starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Oldest retained event.
    #[default]
    Earliest,
    /// Only events enqueued after the receiver opens.
    Latest,
}

impl std::str::FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            other => Err(format!(
                "unknown start position '{}', expected earliest or latest",
                other
            )),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Earliest => write!(f, "earliest"),
            StartPosition::Latest => write!(f, "latest"),
        }
    }
}

/// Where a receiver begins: strictly after a checkpoint, or at a start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    After(Position),
    Start(StartPosition),
}

impl fmt::Display for ResumeFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeFrom::After(position) => write!(f, "after {}", position),
            ResumeFrom::Start(start) => write!(f, "{}", start),
        }
    }
}

/// An immutable event read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub body: Bytes,
    pub position: Position,
    pub partition_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl Event {
    pub fn new(position: Position, body: impl Into<Bytes>) -> Self {
        Event {
            body: body.into(),
            position,
            partition_key: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

/// Time-bounded exclusive ownership claim on one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLease {
    pub partition_id: PartitionId,
    pub owner_id: OwnerId,
    pub fencing_token: FencingToken,
    pub expires_at: DateTime<Utc>,
}

impl PartitionLease {
    /// Whether the lease is still in force at `now`.
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whether `owner` holds this lease at `now`.
    #[inline]
    pub fn is_held_by(&self, owner: &OwnerId, now: DateTime<Utc>) -> bool {
        self.is_live(now) && &self.owner_id == owner
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// Durable record of the last event whose processing completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_id: PartitionId,
    pub position: Position,
    pub fencing_token: FencingToken,
    pub updated_at: DateTime<Utc>,
}

/// Heartbeat record a dispatcher keeps alive while it is part of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub owner_id: OwnerId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MemberRecord {
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    // ========================================================================
    // Identifier Tests
    // ========================================================================

    #[test]
    fn test_partition_id_display_and_eq() {
        let a = PartitionId::new("0");
        let b: PartitionId = "0".into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "0");
        assert_eq!(a.as_str(), "0");
    }

    #[test]
    fn test_owner_id_generate_is_unique() {
        assert_ne!(OwnerId::generate(), OwnerId::generate());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&PartitionId::new("p-7")).unwrap();
        assert_eq!(json, "\"p-7\"");
        let token = serde_json::to_string(&FencingToken::new(3)).unwrap();
        assert_eq!(token, "3");
    }

    // ========================================================================
    // Fencing Token Tests
    // ========================================================================

    #[test]
    fn test_fencing_token_next_increases() {
        let token = FencingToken::FIRST;
        assert!(token.next() > token);
        assert_eq!(token.next().value(), 2);
    }

    #[test]
    fn test_fencing_token_next_saturates() {
        assert_eq!(FencingToken(u64::MAX).next(), FencingToken(u64::MAX));
    }

    // ========================================================================
    // Start Position Tests
    // ========================================================================

    #[test]
    fn test_start_position_from_str() {
        assert_eq!(
            "earliest".parse::<StartPosition>().unwrap(),
            StartPosition::Earliest
        );
        assert_eq!(
            "LATEST".parse::<StartPosition>().unwrap(),
            StartPosition::Latest
        );
        assert!("middle".parse::<StartPosition>().is_err());
    }

    #[test]
    fn test_resume_from_display() {
        assert_eq!(ResumeFrom::After(Position(12)).to_string(), "after 12");
        assert_eq!(
            ResumeFrom::Start(StartPosition::Latest).to_string(),
            "latest"
        );
    }

    // ========================================================================
    // Lease Tests
    // ========================================================================

    fn lease_expiring_at(expires_at: DateTime<Utc>) -> PartitionLease {
        PartitionLease {
            partition_id: PartitionId::new("0"),
            owner_id: OwnerId::new("a"),
            fencing_token: FencingToken::FIRST,
            expires_at,
        }
    }

    #[test]
    fn test_lease_liveness() {
        let now = Utc::now();
        let lease = lease_expiring_at(now + TimeDelta::seconds(10));
        assert!(lease.is_live(now));
        assert!(lease.is_held_by(&OwnerId::new("a"), now));
        assert!(!lease.is_held_by(&OwnerId::new("b"), now));
        assert!(!lease.is_live(now + TimeDelta::seconds(10)));
    }

    #[test]
    fn test_lease_remaining_clamps_to_zero() {
        let now = Utc::now();
        let lease = lease_expiring_at(now - TimeDelta::seconds(5));
        assert_eq!(lease.remaining(now), std::time::Duration::ZERO);
        let lease = lease_expiring_at(now + TimeDelta::seconds(5));
        assert_eq!(lease.remaining(now), std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_lease_json_roundtrip_preserves_fields() {
        let lease = lease_expiring_at(Utc::now());
        let json = serde_json::to_string(&lease).unwrap();
        assert!(json.contains("\"fencing_token\":1"));
        let back: PartitionLease = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lease);
    }
}
