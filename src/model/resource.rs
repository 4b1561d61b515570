//! Resource pools and the units claimed from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifies one pool file via the configured path template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(pub String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Pool id for the `slot`-th execution of a batch.
    pub fn for_slot(slot: usize, pool_count: usize) -> Self {
        Self((slot % pool_count.max(1)).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit handed to exactly one execution. Already marked consumed on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedUnit {
    pub pool: PoolId,
    /// Row position in the pool file at claim time.
    pub row: usize,
    /// Every column except the consumed marker.
    pub payload: BTreeMap<String, String>,
}
