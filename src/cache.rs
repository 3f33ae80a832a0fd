//! The sharded buffer cache: a hash table of `NBUCKET` independently
//! locked shards over an `NBUF`-slot arena, each shard tracking an
//! approximate LRU ordering of its occupants by tick rather than by list
//! position.
//!
//! Lookups hash `block_no` to a home bucket. A hit bumps the reference
//! count and returns. A miss recycles an unpinned buffer from the home
//! bucket if one exists, otherwise sweeps the other buckets in ascending
//! index order and steals the coldest unpinned buffer found, re-homing it.
//! Two bucket locks are never held out of order, so the sweep cannot
//! deadlock against another thread doing the same thing from a different
//! home bucket.

use crate::device::BlockDevice;
use crate::param::{BSIZE, NBUCKET, NBUF};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::ticks;
use array_macro::array;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// One cached disk block's worth of bytes.
pub type BufData = [u8; BSIZE];

fn hash(block_no: u32) -> usize {
    block_no as usize % NBUCKET
}

/// Reference count and LRU timestamp for one buffer slot, guarded by that
/// slot's own `ref_lock` independently of whichever bucket currently owns
/// the slot. Decoupling this from the bucket lock keeps `release` and
/// `pin`/`unpin` from contending with lookups on unrelated buffers in the
/// same shard.
struct RefState {
    ref_count: usize,
    ticks: u64,
}

/// Per-slot locks and data page. Identity (`device`/`block_no`) and list
/// pointers live in `BCache::meta`, guarded by the owning bucket's lock
/// instead of by anything in this struct.
struct Buffer {
    ref_lock: SpinLock<RefState>,
    sleep_lock: SleepLock<BufData>,
    valid: AtomicBool,
}

impl Buffer {
    const fn new() -> Self {
        Self {
            ref_lock: SpinLock::new(
                RefState {
                    ref_count: 0,
                    ticks: u64::MAX,
                },
                "bcache_ref",
            ),
            sleep_lock: SleepLock::new([0u8; BSIZE], "bcache_data"),
            valid: AtomicBool::new(false),
        }
    }
}

/// Identity and intrusive list pointers for one slot. Only ever touched
/// while holding the lock of whichever bucket currently owns the slot.
/// See `BCache::meta_mut`.
struct BufMeta {
    device: u32,
    block_no: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            device: 0,
            block_no: 0,
            prev: None,
            next: None,
        }
    }
}

/// One shard: just the head of its doubly-linked occupant list. The list
/// is bookkeeping only; no ownership is conveyed by list membership, and
/// LRU never consults list position.
struct Bucket {
    head: Option<usize>,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: None }
    }
}

pub struct BCache {
    buckets: [SpinLock<Bucket>; NBUCKET],
    meta: [UnsafeCell<BufMeta>; NBUF],
    bufs: [Buffer; NBUF],
    device: Box<dyn BlockDevice>,
}

// `meta` is touched only while holding the owning bucket's `SpinLock`.
// That discipline, not the type system, is what makes the shared
// `UnsafeCell` access safe.
unsafe impl Sync for BCache {}

impl BCache {
    pub fn new(device: impl BlockDevice + 'static) -> Self {
        let cache = Self {
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache_bucket"); NBUCKET],
            meta: array![_ => UnsafeCell::new(BufMeta::new()); NBUF],
            bufs: array![_ => Buffer::new(); NBUF],
            device: Box::new(device),
        };

        // Every buffer starts unpinned and unidentified, handed out
        // round-robin to buckets.
        for idx in 0..NBUF {
            let mut bucket = cache.buckets[idx % NBUCKET].lock();
            cache.link_front(&mut bucket, idx);
        }

        crate::println!("bcache: init {} buffers across {} buckets", NBUF, NBUCKET);
        cache
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn meta_mut(&self, idx: usize) -> &mut BufMeta {
        &mut *self.meta[idx].get()
    }

    fn unlink(&self, bucket: &mut Bucket, idx: usize) {
        let (prev, next) = unsafe {
            let m = self.meta_mut(idx);
            (m.prev, m.next)
        };
        match prev {
            Some(p) => unsafe { self.meta_mut(p).next = next },
            None => bucket.head = next,
        }
        if let Some(n) = next {
            unsafe { self.meta_mut(n).prev = prev };
        }
    }

    fn link_front(&self, bucket: &mut Bucket, idx: usize) {
        let old_head = bucket.head;
        unsafe {
            let m = self.meta_mut(idx);
            m.prev = None;
            m.next = old_head;
        }
        if let Some(h) = old_head {
            unsafe { self.meta_mut(h).prev = Some(idx) };
        }
        bucket.head = Some(idx);
    }

    fn find_in_bucket(&self, bucket: &Bucket, device: u32, block_no: u32) -> Option<usize> {
        let mut cur = bucket.head;
        while let Some(idx) = cur {
            let m = unsafe { self.meta_mut(idx) };
            if m.device == device && m.block_no == block_no {
                return Some(idx);
            }
            cur = m.next;
        }
        None
    }

    /// Scans a bucket's list for the unpinned buffer with the lowest
    /// `ticks`, keeping that candidate's `ref_lock` held throughout so it
    /// cannot be re-pinned between selection and commit.
    fn scan_victim<'a>(&'a self, head: Option<usize>) -> Option<(usize, SpinLockGuard<'a, RefState>)> {
        let mut best: Option<(usize, SpinLockGuard<'a, RefState>)> = None;
        let mut cur = head;
        while let Some(idx) = cur {
            let rc = self.bufs[idx].ref_lock.lock();
            if rc.ref_count == 0 {
                let take_it = match &best {
                    None => true,
                    Some((_, best_rc)) => rc.ticks <= best_rc.ticks,
                };
                if take_it {
                    best = Some((idx, rc));
                }
            }
            cur = unsafe { self.meta_mut(idx).next };
        }
        best
    }

    fn lock_pair(&self, home: usize, other: usize) -> (SpinLockGuard<'_, Bucket>, SpinLockGuard<'_, Bucket>) {
        if other < home {
            let o = self.buckets[other].lock();
            let h = self.buckets[home].lock();
            (h, o)
        } else {
            let h = self.buckets[home].lock();
            let o = self.buckets[other].lock();
            (h, o)
        }
    }

    /// Resolves `(device, block_no)` to a locked, resident buffer.
    fn get(&self, device: u32, block_no: u32) -> LockedBuffer<'_> {
        let home = hash(block_no);

        // Phase 1 (hit) and phase 2 (local recycle), both scoped so the
        // home bucket lock is dropped before phase 3 if neither succeeds.
        {
            let home_guard = self.buckets[home].lock();

            if let Some(idx) = self.find_in_bucket(&home_guard, device, block_no) {
                self.bufs[idx].ref_lock.lock().ref_count += 1;
                drop(home_guard);
                let data = self.bufs[idx].sleep_lock.lock();
                return LockedBuffer::new(self, idx, device, block_no, data);
            }

            if let Some((idx, mut rc)) = self.scan_victim(home_guard.head) {
                let m = unsafe { self.meta_mut(idx) };
                m.device = device;
                m.block_no = block_no;
                self.bufs[idx].valid.store(false, Ordering::Relaxed);
                rc.ref_count = 1;
                drop(rc);
                drop(home_guard);
                let data = self.bufs[idx].sleep_lock.lock();
                return LockedBuffer::new(self, idx, device, block_no, data);
            }
        }

        // Phase 3: cross-bucket steal. Lower-indexed buckets first, then
        // higher-indexed, so the pair acquired in `lock_pair` is always
        // taken in ascending index order, even when home sits in the
        // middle of the sweep.
        let sweep = (0..home).chain(home + 1..NBUCKET);
        for candidate in sweep {
            let (mut home_guard, mut cand_guard) = self.lock_pair(home, candidate);

            if let Some((idx, mut rc)) = self.scan_victim(cand_guard.head) {
                self.unlink(&mut cand_guard, idx);
                self.link_front(&mut home_guard, idx);

                #[cfg(debug_assertions)]
                crate::println!(
                    "bcache: stole buffer {idx} from bucket {candidate} into bucket {home} for ({device}, {block_no})"
                );

                let m = unsafe { self.meta_mut(idx) };
                m.device = device;
                m.block_no = block_no;
                self.bufs[idx].valid.store(false, Ordering::Relaxed);
                rc.ref_count = 1;
                drop(rc);
                drop(home_guard);
                drop(cand_guard);

                let data = self.bufs[idx].sleep_lock.lock();
                return LockedBuffer::new(self, idx, device, block_no, data);
            }
        }

        panic!("bcache: no buffers");
    }

    /// Returns a locked buffer with the contents of the indicated block,
    /// issuing a device read only if the buffer wasn't already valid.
    pub fn read(&self, device: u32, block_no: u32) -> LockedBuffer<'_> {
        let mut buf = self.get(device, block_no);
        if !buf.valid() {
            self.device.read_block(device, block_no, &mut *buf);
            self.bufs[buf.index].valid.store(true, Ordering::Release);
        }
        buf
    }

    /// Writes `buf`'s data page to the device. `buf` must still hold its
    /// sleep-lock, which its type guarantees.
    pub fn write(&self, buf: &mut LockedBuffer<'_>) {
        self.device.write_block(buf.device, buf.block_no, &*buf);
    }

    /// Releases a locked buffer. The sleep-lock is dropped first, waking
    /// any thread blocked waiting for this buffer, then the reference
    /// count is decremented under `ref_lock`; if it reaches zero the
    /// current tick is latched as this buffer's LRU timestamp.
    pub fn release(&self, buf: LockedBuffer<'_>) {
        drop(buf);
    }

    /// Increments a buffer's reference count without taking its
    /// sleep-lock, keeping it resident across a logical transaction.
    pub fn pin(&self, buf: &LockedBuffer<'_>) {
        self.bufs[buf.index].ref_lock.lock().ref_count += 1;
    }

    pub fn unpin(&self, buf: &LockedBuffer<'_>) {
        self.bufs[buf.index].ref_lock.lock().ref_count -= 1;
    }

    #[cfg(test)]
    fn ref_count_of(&self, buf: &LockedBuffer<'_>) -> usize {
        self.bufs[buf.index].ref_lock.lock().ref_count
    }

    /// Checks that every pinned buffer lives in its home bucket and that
    /// no buffer is linked into more than one bucket. Intended for tests:
    /// it takes every bucket lock in ascending order, which is safe only
    /// because nothing else is concurrently stealing while a test holds
    /// this check's own external synchronization.
    #[cfg(test)]
    fn check_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        for (home_idx, bucket) in self.buckets.iter().enumerate() {
            let guard = bucket.lock();
            let mut cur = guard.head;
            while let Some(idx) = cur {
                assert!(seen.insert(idx), "buffer {idx} linked into more than one bucket");
                let m = unsafe { self.meta_mut(idx) };
                let rc = self.bufs[idx].ref_lock.lock();
                if rc.ref_count > 0 {
                    assert_eq!(
                        hash(m.block_no),
                        home_idx,
                        "pinned buffer {idx} is not in its home bucket"
                    );
                }
                drop(rc);
                cur = m.next;
            }
        }
    }
}

/// A buffer whose sleep-lock the caller holds, returned by [`BCache::read`].
/// Release is meant to be an explicit call (`BCache::release`), but `Drop`
/// performs the same logic so that forgetting to call `release()` still
/// leaves the cache consistent.
pub struct LockedBuffer<'a> {
    cache: &'a BCache,
    index: usize,
    device: u32,
    block_no: u32,
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> LockedBuffer<'a> {
    fn new(
        cache: &'a BCache,
        index: usize,
        device: u32,
        block_no: u32,
        data: SleepLockGuard<'a, BufData>,
    ) -> Self {
        Self {
            cache,
            index,
            device,
            block_no,
            data: Some(data),
        }
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn block_no(&self) -> u32 {
        self.block_no
    }

    pub fn valid(&self) -> bool {
        self.cache.bufs[self.index].valid.load(Ordering::Acquire)
    }
}

impl<'a> Deref for LockedBuffer<'a> {
    type Target = BufData;
    fn deref(&self) -> &BufData {
        self.data.as_ref().unwrap()
    }
}

impl<'a> DerefMut for LockedBuffer<'a> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap()
    }
}

impl<'a> Drop for LockedBuffer<'a> {
    fn drop(&mut self) {
        // Drop the sleep-lock first, waking anyone blocked waiting for
        // this buffer, before touching ref_lock.
        self.data.take();

        let mut rc = self.cache.bufs[self.index].ref_lock.lock();
        rc.ref_count -= 1;
        if rc.ref_count == 0 {
            rc.ticks = ticks::current();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Wraps `MemDevice` and counts reads, so tests can assert a cache hit
    /// really did skip device I/O.
    struct CountingDevice {
        inner: MemDevice,
        reads: AtomicUsize,
    }

    impl CountingDevice {
        fn new() -> Self {
            Self {
                inner: MemDevice::new(),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl BlockDevice for CountingDevice {
        fn read_block(&self, device: u32, block_no: u32, page: &mut [u8; BSIZE]) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_block(device, block_no, page);
        }

        fn write_block(&self, device: u32, block_no: u32, page: &[u8; BSIZE]) {
            self.inner.write_block(device, block_no, page);
        }
    }

    // Lets a test hold its own handle to the counter while the cache owns
    // the device through the `BlockDevice` trait object.
    impl BlockDevice for Arc<CountingDevice> {
        fn read_block(&self, device: u32, block_no: u32, page: &mut [u8; BSIZE]) {
            self.as_ref().read_block(device, block_no, page);
        }

        fn write_block(&self, device: u32, block_no: u32, page: &[u8; BSIZE]) {
            self.as_ref().write_block(device, block_no, page);
        }
    }

    #[test]
    fn fresh_read_admits_and_reads_through() {
        let cache = BCache::new(MemDevice::new());

        let buf = cache.read(1, 100);
        assert_eq!(hash(100), 9);
        assert_eq!(buf.block_no(), 100);
        assert!(buf.valid());
        assert_eq!(cache.ref_count_of(&buf), 1);
        cache.check_invariants();
        cache.release(buf);
    }

    #[test]
    fn release_then_read_is_a_hit_with_no_device_read() {
        let device = Arc::new(CountingDevice::new());
        let cache = BCache::new(Arc::clone(&device));

        let buf = cache.read(1, 100);
        cache.release(buf);

        let reads_before = device.reads.load(Ordering::SeqCst);
        let buf2 = cache.read(1, 100);
        let reads_after = device.reads.load(Ordering::SeqCst);

        assert_eq!(reads_before, reads_after, "cache hit must not touch the device");
        assert_eq!(buf2.block_no(), 100);
        cache.release(buf2);
    }

    #[test]
    fn exhaustion_panics_when_every_buffer_is_pinned() {
        let cache = BCache::new(MemDevice::new());
        let mut held = Vec::new();
        for i in 0..NBUF as u32 {
            held.push(cache.read(1, i));
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.read(1, NBUF as u32);
        }));
        assert!(result.is_err(), "get() on a novel block must panic when exhausted");

        for buf in held {
            cache.release(buf);
        }
    }

    #[test]
    fn one_free_buffer_lets_a_novel_block_steal_it() {
        let cache = BCache::new(MemDevice::new());
        let mut held = Vec::new();
        for i in 0..(NBUF as u32 - 1) {
            held.push(cache.read(1, i));
        }

        let fresh = cache.read(1, NBUF as u32);
        assert_eq!(fresh.block_no(), NBUF as u32);
        cache.check_invariants();

        for buf in held {
            cache.release(buf);
        }
        cache.release(fresh);
    }

    #[test]
    fn admitting_a_run_of_blocks_then_recycling_lands_in_the_right_bucket() {
        let cache = BCache::new(MemDevice::new());
        let mut held = Vec::new();
        for i in 0..13u32 {
            held.push(cache.read(1, i));
        }
        for buf in held {
            cache.release(buf);
        }

        // hash(13) == 0
        let buf = cache.read(1, 13);
        assert_eq!(hash(13), 0);
        assert!(!buf.valid());
        cache.check_invariants();
        cache.release(buf);
    }

    #[test]
    fn earlier_release_tick_is_recycled_first() {
        let cache = BCache::new(MemDevice::new());

        // Two buffers that collide on bucket 0: blocks 0 and NBUCKET.
        let a = cache.read(1, 0);
        let b = cache.read(1, NBUCKET as u32);
        cache.release(a); // latches an earlier tick
        crate::tick();
        cache.release(b); // latches a later tick

        let recycled = cache.read(1, 2 * NBUCKET as u32);
        // The bucket-0 victim with the lowest ticks was block 0's buffer.
        assert_eq!(recycled.block_no(), 2 * NBUCKET as u32);
        cache.check_invariants();
        cache.release(recycled);
    }

    #[test]
    fn pin_unpin_balance_leaves_ref_count_unchanged() {
        let cache = BCache::new(MemDevice::new());
        let buf = cache.read(1, 5);
        let before = cache.ref_count_of(&buf);

        cache.pin(&buf);
        cache.pin(&buf);
        cache.unpin(&buf);
        cache.unpin(&buf);

        assert_eq!(cache.ref_count_of(&buf), before);
        cache.release(buf);
    }

    #[test]
    fn concurrent_get_of_same_block_serialises_and_caches_once() {
        let device = Arc::new(CountingDevice::new());
        let cache = Arc::new(BCache::new(Arc::clone(&device)));
        let barrier = Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let buf = cache.read(7, 42);
                    assert_eq!(buf.block_no(), 42);
                    assert!(buf.valid());
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    cache.release(buf);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(
            device.reads.load(Ordering::SeqCst),
            1,
            "four racing readers of the same block must produce exactly one device read"
        );
        cache.check_invariants();
    }

    #[test]
    fn write_does_not_clear_valid() {
        let cache = BCache::new(MemDevice::new());
        let mut buf = cache.read(1, 1);
        buf[0] = 0xAB;
        cache.write(&mut buf);
        assert!(buf.valid());
        cache.release(buf);
    }
}
