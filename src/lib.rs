//! A sharded, concurrent buffer cache for disk-backed block storage.
//!
//! Caches fixed-size disk blocks in memory, serialises concurrent access to
//! any given block through a per-buffer sleep-lock, and recycles cold
//! buffers under an approximate least-recently-used policy. The hash table
//! is split into [`NBUCKET`] independently locked shards so that the
//! common cache-hit path never serialises behind one global lock; see
//! [`cache`] for the admission algorithm and its lock-order protocol.

mod cache;
mod console;
mod cpu;
mod device;
mod param;
mod sleeplock;
mod spinlock;
mod ticks;

pub use cache::{BCache, BufData, LockedBuffer};
pub use device::{BlockDevice, MemDevice};
pub use param::{BSIZE, NBUCKET, NBUF};
pub use ticks::tick;
