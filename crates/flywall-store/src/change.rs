//! Change log entries and snapshots

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of mutation a change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeType::Insert),
            "update" => Some(ChangeType::Update),
            "delete" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// One committed mutation. Immutable once committed; the hash links it
/// to the change before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub bucket: String,
    pub key: String,
    /// Empty for deletes.
    pub value: String,
    pub change_type: ChangeType,
    /// Strictly monotonic within a primary.
    pub version: u64,
    pub timestamp_ns: u64,
    pub hash: String,
}

impl Change {
    /// Chain hash over `prev_hash ∥ bucket ∥ key ∥ value ∥ type ∥
    /// version ∥ timestamp`, hex-encoded. `prev_hash` is empty for the
    /// first change.
    pub fn chain_hash(&self, prev_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        for part in [
            self.bucket.as_bytes(),
            self.key.as_bytes(),
            self.value.as_bytes(),
            self.change_type.as_str().as_bytes(),
        ] {
            hasher.update([0x1f]);
            hasher.update(part);
        }
        hasher.update([0x1f]);
        hasher.update(self.version.to_be_bytes());
        hasher.update([0x1f]);
        hasher.update(self.timestamp_ns.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the recorded hash matches the chain at `prev_hash`.
    pub fn verifies_against(&self, prev_hash: &str) -> bool {
        self.hash == self.chain_hash(prev_hash)
    }
}

/// Point-in-time materialization of the full store.
///
/// Carries the chain hash at its version so a restored replica can keep
/// verifying subsequent changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub buckets: BTreeMap<String, BTreeMap<String, String>>,
    pub timestamp_ns: u64,
    pub hash: String,
}

/// Stored value plus the version that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub value: String,
    pub version: u64,
}
