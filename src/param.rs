//! Compile-time configuration for the buffer cache.

/// Total number of physical buffer slots in the cache arena.
pub const NBUF: usize = 64;

/// Number of hash-table shards. Kept a small prime so the modulus is cheap
/// and sequential block numbers spread evenly across buckets.
pub const NBUCKET: usize = 13;

/// Size in bytes of one cached disk block.
pub const BSIZE: usize = 4096;
