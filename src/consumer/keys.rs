//! Object layout for lease, member and checkpoint records.
//!
//! # Layout (v1)
//!
//! All records for one consumer group live under a common root:
//!
//! ```text
//! {prefix}/{consumer_group}/leases/{partition}.json
//! {prefix}/{consumer_group}/checkpoints/{partition}.json
//! {prefix}/{consumer_group}/members/{owner}.json
//! ```
//!
//! Each record is a single JSON document written with a conditional put, so
//! the object version doubles as the compare-and-swap token. Partition and
//! owner ids are percent-encoded by [`Path::child`]; listings therefore read
//! ids from the record body, never from the object name.

use object_store::path::Path;

use crate::constants::{CHECKPOINTS_DIR, LEASES_DIR, MEMBERS_DIR};
use crate::types::{OwnerId, PartitionId};

const RECORD_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: Path,
}

impl StoreLayout {
    pub fn new(prefix: &str, consumer_group: &str) -> Self {
        Self {
            root: Path::from(prefix).child(consumer_group),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn leases_dir(&self) -> Path {
        self.root.child(LEASES_DIR)
    }

    pub fn checkpoints_dir(&self) -> Path {
        self.root.child(CHECKPOINTS_DIR)
    }

    pub fn members_dir(&self) -> Path {
        self.root.child(MEMBERS_DIR)
    }

    pub fn lease(&self, partition: &PartitionId) -> Path {
        self.leases_dir()
            .child(format!("{}{}", partition, RECORD_SUFFIX))
    }

    pub fn checkpoint(&self, partition: &PartitionId) -> Path {
        self.checkpoints_dir()
            .child(format!("{}{}", partition, RECORD_SUFFIX))
    }

    pub fn member(&self, owner: &OwnerId) -> Path {
        self.members_dir()
            .child(format!("{}{}", owner, RECORD_SUFFIX))
    }

    /// Whether a listed object is a record (as opposed to a stray upload).
    pub fn is_record(path: &Path) -> bool {
        path.filename()
            .map(|name| name.ends_with(RECORD_SUFFIX))
            .unwrap_or(false)
    }
}
