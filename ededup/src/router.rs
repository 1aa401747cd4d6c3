use std::fmt;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Position of a shard registry in the pool, in `0..shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardIndex(pub usize);

impl fmt::Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map a fingerprint to the shard that owns it.
///
/// Fingerprints are uniformly distributed digests, so their leading bytes
/// modulo the shard count spread evenly over the shards.
pub fn shard_for(fingerprint: &Fingerprint, shard_count: NonZeroUsize) -> ShardIndex {
    let shard_count = shard_count.get() as u64;
    ShardIndex((fingerprint.prefix() % shard_count) as usize)
}

/// Routes fingerprints for a fixed shard count. The count never changes
/// during a run.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    shard_count: NonZeroUsize,
}

impl Router {
    pub fn new(shard_count: NonZeroUsize) -> Self {
        Self { shard_count }
    }

    pub fn shard_count(&self) -> NonZeroUsize {
        self.shard_count
    }

    pub fn route(&self, fingerprint: &Fingerprint) -> ShardIndex {
        shard_for(fingerprint, self.shard_count)
    }
}
