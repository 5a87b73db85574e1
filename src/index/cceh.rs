//! Cache-conscious extendible hashing (`SPEC_FULL.md` §4.4), grounded
//! on `original_source/src/index/CCEH/CCEH_MSB.{hpp,cc}`.
//!
//! A directory of segment references, indexed by the top `depth` bits
//! of a key's hash, routes to one of `2^depth` segments. Each segment
//! holds a fixed array of (key, value) slots and its own `local_depth`.
//! Splitting doubles a segment's discriminating bits; when a split's
//! `local_depth` catches up with the directory's `depth`, the whole
//! directory doubles.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crc::crc32;

use crate::alloc::Allocator;
use crate::error::Result;
use crate::index::{IndexContract, Stats, Value};
use crate::key::{Key, KeyRef};
use crate::latch::Latch;
use crate::persist::PersistenceBackend;
use crate::status::Status;

const NONE: u64 = 0;
const INVALID: u64 = u64::MAX;
const CLAIMED: u64 = u64::MAX - 1;
const PROBE_LEN: usize = 32;

fn hash1(key: &[u8]) -> u64 {
    let mut h = crc32::Digest::new(crc32::IEEE);
    0xcceh_0001u64.hash(&mut h);
    key.hash(&mut h);
    h.finish()
}

fn hash2(key: &[u8]) -> u64 {
    let mut h = crc32::Digest::new(crc32::IEEE);
    0xcceh_0002u64.hash(&mut h);
    key.hash(&mut h);
    h.finish()
}

fn top_bits(hash: u64, depth: usize) -> u64 {
    if depth == 0 {
        0
    } else {
        hash >> (64 - depth)
    }
}

struct Slot {
    key: AtomicU64,
    value: AtomicU64,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            key: AtomicU64::new(NONE),
            value: AtomicU64::new(0),
        }
    }
}

struct Segment {
    local_depth: AtomicUsize,
    latch: Latch,
    slots: Vec<Slot>,
}

impl Segment {
    fn new(local_depth: usize, n_slots: usize) -> Segment {
        let mut slots = Vec::with_capacity(n_slots);
        for _ in 0..n_slots {
            slots.push(Slot::empty());
        }
        Segment {
            local_depth: AtomicUsize::new(local_depth),
            latch: Latch::new(),
            slots,
        }
    }
}

struct DirState {
    depth: usize,
    segments: Vec<Arc<Segment>>,
}

enum SlotOutcome {
    Done(Status),
    NeedSplit,
}

pub struct Cceh {
    allocator: Arc<dyn Allocator>,
    persist: Arc<dyn PersistenceBackend>,
    directory: RwLock<DirState>,
    segment_slots: usize,
}

impl Cceh {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        persist: Arc<dyn PersistenceBackend>,
        initial_depth: usize,
        segment_slots: usize,
    ) -> Cceh {
        let n = 1usize << initial_depth;
        let segments: Vec<Arc<Segment>> = (0..n)
            .map(|_| Arc::new(Segment::new(initial_depth, segment_slots)))
            .collect();
        Cceh {
            allocator,
            persist,
            directory: RwLock::new(DirState {
                depth: initial_depth,
                segments,
            }),
            segment_slots,
        }
    }

    fn dir_index(&self, h1: u64) -> (usize, usize, Arc<Segment>) {
        let dir = self.directory.read().unwrap();
        let depth = dir.depth;
        let x = top_bits(h1, depth) as usize;
        (x, depth, dir.segments[x].clone())
    }

    fn deref_key<'a>(&self, ptr: u64) -> KeyRef<'a> {
        // SAFETY: `ptr` was produced by `persist_key`, pointing at a
        // live `[len][content]` buffer in the allocator's arena, which
        // outlives every index operation (append-only, never freed).
        let raw = ptr as usize as *const u8;
        let len_bytes = unsafe { std::slice::from_raw_parts(raw, 4) };
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        let full = unsafe { std::slice::from_raw_parts(raw, 4 + len) };
        KeyRef::from_raw(full)
    }

    fn persist_key(&self, key: &[u8]) -> Result<u64> {
        let k = Key::new(key);
        let bytes = k.persisted_bytes();
        let ptr = self.allocator.allocate(bytes.len())?;
        // SAFETY: `ptr` was just allocated with exactly `bytes.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        self.persist.persist(ptr, bytes.len());
        Ok(ptr as u64)
    }

    fn probe_segment(
        &self,
        seg: &Segment,
        key: &[u8],
        value: Value,
        expected_pattern: u64,
        local_depth: usize,
        start: usize,
    ) -> Result<Option<Status>> {
        let n = seg.slots.len();
        let probe = PROBE_LEN.min(n);
        for i in 0..probe {
            let idx = (start + i) % n;
            let slot = &seg.slots[idx];
            let observed = slot.key.load(Ordering::Acquire);
            if observed == NONE || observed == INVALID {
                if slot
                    .key
                    .compare_exchange(observed, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let key_ptr = self.persist_key(key)?;
                    slot.value.store(value, Ordering::Relaxed);
                    self.persist.fence_store();
                    slot.key.store(key_ptr, Ordering::Release);
                    self.persist.fence_store();
                    return Ok(Some(Status::Ok));
                }
                continue;
            }
            if observed == CLAIMED {
                continue;
            }
            let stored = self.deref_key(observed);
            if stored.content() == key {
                return Ok(Some(Status::InsertKeyExists));
            }
            let stored_pattern = top_bits(hash1(stored.content()), local_depth);
            if stored_pattern != expected_pattern
                && slot
                    .key
                    .compare_exchange(observed, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                let key_ptr = self.persist_key(key)?;
                slot.value.store(value, Ordering::Relaxed);
                self.persist.fence_store();
                slot.key.store(key_ptr, Ordering::Release);
                self.persist.fence_store();
                return Ok(Some(Status::Ok));
            }
        }
        Ok(None)
    }

    fn try_insert(&self, key: &[u8], value: Value) -> Result<SlotOutcome> {
        let h1 = hash1(key);
        let h2 = hash2(key);
        let (x, depth, seg) = self.dir_index(h1);
        let _r = seg.latch.acquire_read();
        {
            let dir = self.directory.read().unwrap();
            if !Arc::ptr_eq(&dir.segments[x], &seg) {
                // a split published under us: let the caller retry.
                return Ok(SlotOutcome::Done(Status::Failed));
            }
        }
        let local_depth = seg.local_depth.load(Ordering::Acquire);
        let expected_pattern = top_bits(h1, local_depth);
        let f_idx = (h1 as usize) % seg.slots.len();
        if let Some(status) =
            self.probe_segment(&seg, key, value, expected_pattern, local_depth, f_idx)?
        {
            return Ok(SlotOutcome::Done(status));
        }
        let s_idx = (h2 as usize) % seg.slots.len();
        if let Some(status) =
            self.probe_segment(&seg, key, value, expected_pattern, local_depth, s_idx)?
        {
            return Ok(SlotOutcome::Done(status));
        }
        Ok(SlotOutcome::NeedSplit)
    }

    fn split(&self, x: usize, old: Arc<Segment>) -> Result<()> {
        let _w = old.latch.acquire_write();
        let local_depth = old.local_depth.load(Ordering::Acquire);
        {
            let dir = self.directory.read().unwrap();
            if dir.depth < local_depth || !Arc::ptr_eq(&dir.segments[x], &old) {
                log::warn!("cceh: split at segment {} lost the race, retrying", x);
                return Ok(());
            }
        }
        log::debug!("cceh: splitting segment {} (local_depth {} -> {})", x, local_depth, local_depth + 1);
        let new_local_depth = local_depth + 1;
        let seg0 = Arc::new(Segment::new(new_local_depth, self.segment_slots));
        let seg1 = Arc::new(Segment::new(new_local_depth, self.segment_slots));

        for slot in &old.slots {
            let k = slot.key.load(Ordering::Acquire);
            if k == NONE || k == INVALID || k == CLAIMED {
                continue;
            }
            let stored = self.deref_key(k);
            let content = stored.content();
            let h = hash1(content);
            let h2v = hash2(content);
            let bit = (h >> (64 - new_local_depth)) & 1;
            let target = if bit == 0 { &seg0 } else { &seg1 };
            let v = slot.value.load(Ordering::Acquire);
            place_linear(target, k, v, h, h2v);
        }

        let mut dir = self.directory.write().unwrap();
        if local_depth == dir.depth {
            let new_depth = dir.depth + 1;
            let mut new_segments = Vec::with_capacity(dir.segments.len() * 2);
            for s in &dir.segments {
                new_segments.push(s.clone());
                new_segments.push(s.clone());
            }
            new_segments[2 * x] = seg0;
            new_segments[2 * x + 1] = seg1;
            dir.depth = new_depth;
            dir.segments = new_segments;
            log::debug!("cceh: directory doubled to depth {}", new_depth);
        } else {
            let stride = 1usize << (dir.depth - local_depth);
            let block_start = x - (x % stride);
            let half = stride / 2;
            for i in 0..half {
                dir.segments[block_start + i] = seg0.clone();
            }
            for i in half..stride {
                dir.segments[block_start + i] = seg1.clone();
            }
        }
        Ok(())
    }

    fn unique_segments(&self) -> Vec<Arc<Segment>> {
        let dir = self.directory.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for s in &dir.segments {
            let ptr = Arc::as_ptr(s) as usize;
            if seen.insert(ptr) {
                out.push(s.clone());
            }
        }
        out
    }
}

// Places a redistributed key at its own hash-probe position, the same
// two 32-slot windows `probe_segment`/`search` scan, rather than the
// first free slot in the segment — a first-fit placement would pack
// keys outside the window their own hash dictates, making them
// unreachable once the new segment is published (`Insert4split` in
// CCEH_MSB.cc places split keys at `(f_hash & kMask) * kNumPairPerCacheLine`
// for the same reason).
fn place_linear(seg: &Arc<Segment>, key_ptr: u64, value: u64, h1: u64, h2: u64) {
    let n = seg.slots.len();
    let probe = PROBE_LEN.min(n);
    for &start in &[(h1 as usize) % n, (h2 as usize) % n] {
        for i in 0..probe {
            let idx = (start + i) % n;
            let slot = &seg.slots[idx];
            if slot.key.load(Ordering::Relaxed) == NONE {
                slot.value.store(value, Ordering::Relaxed);
                slot.key.store(key_ptr, Ordering::Relaxed);
                return;
            }
        }
    }
    // capacity invariant: a fresh split segment always has room for at
    // most half of the parent's live entries within the probe windows
    // a well-distributed hash places them in.
    unreachable!("split segment exhausted during redistribution");
}

impl IndexContract for Cceh {
    fn insert(&self, key: &[u8], value: Value) -> Result<Status> {
        log::trace!("cceh: insert {} bytes", key.len());
        loop {
            match self.try_insert(key, value)? {
                SlotOutcome::Done(Status::Failed) => continue,
                SlotOutcome::Done(status) => return Ok(status),
                SlotOutcome::NeedSplit => {
                    let (x, _depth, seg) = self.dir_index(hash1(key));
                    self.split(x, seg)?;
                    continue;
                }
            }
        }
    }

    fn search(&self, key: &[u8]) -> Result<(Status, Value)> {
        log::trace!("cceh: search {} bytes", key.len());
        let h1 = hash1(key);
        let h2 = hash2(key);
        let (x, _depth, seg) = self.dir_index(h1);
        let _r = seg.latch.acquire_read();
        let n = seg.slots.len();
        let local_depth = seg.local_depth.load(Ordering::Acquire);
        let _ = x;
        for &start in &[(h1 as usize) % n, (h2 as usize) % n] {
            let probe = PROBE_LEN.min(n);
            for i in 0..probe {
                let idx = (start + i) % n;
                let slot = &seg.slots[idx];
                let observed = slot.key.load(Ordering::Acquire);
                if observed == NONE || observed == INVALID || observed == CLAIMED {
                    continue;
                }
                let stored = self.deref_key(observed);
                if stored.content() == key {
                    return Ok((Status::Ok, slot.value.load(Ordering::Acquire)));
                }
            }
        }
        let _ = local_depth;
        Ok((Status::NotFound, 0))
    }

    fn update(&self, key: &[u8], value: Value) -> Result<Status> {
        let h1 = hash1(key);
        let h2 = hash2(key);
        let (_x, _depth, seg) = self.dir_index(h1);
        let _r = seg.latch.acquire_read();
        let n = seg.slots.len();
        for &start in &[(h1 as usize) % n, (h2 as usize) % n] {
            let probe = PROBE_LEN.min(n);
            for i in 0..probe {
                let idx = (start + i) % n;
                let slot = &seg.slots[idx];
                let observed = slot.key.load(Ordering::Acquire);
                if observed == NONE || observed == INVALID || observed == CLAIMED {
                    continue;
                }
                let stored = self.deref_key(observed);
                if stored.content() == key {
                    slot.value.store(value, Ordering::Release);
                    self.persist.persist(slot as *const Slot as *const u8, 16);
                    return Ok(Status::Ok);
                }
            }
        }
        Ok(Status::NotFound)
    }

    fn upsert(&self, key: &[u8], value: Value) -> Result<Status> {
        match self.update(key, value)? {
            Status::Ok => Ok(Status::Ok),
            Status::NotFound => match self.insert(key, value)? {
                Status::InsertKeyExists => self.update(key, value),
                other => Ok(other),
            },
            other => Ok(other),
        }
    }

    fn scan_count(&self, _start: &[u8], n: usize) -> Result<(Status, Vec<Value>)> {
        let mut out = Vec::new();
        'outer: for seg in self.unique_segments() {
            for slot in &seg.slots {
                let k = slot.key.load(Ordering::Acquire);
                if k == NONE || k == INVALID || k == CLAIMED {
                    continue;
                }
                out.push(slot.value.load(Ordering::Acquire));
                if out.len() >= n {
                    break 'outer;
                }
            }
        }
        Ok((Status::Ok, out))
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<(Status, Vec<Value>)> {
        let mut out = Vec::new();
        for seg in self.unique_segments() {
            for slot in &seg.slots {
                let k = slot.key.load(Ordering::Acquire);
                if k == NONE || k == INVALID || k == CLAIMED {
                    continue;
                }
                let stored = self.deref_key(k);
                if stored.content() >= start && stored.content() < end {
                    out.push(slot.value.load(Ordering::Acquire));
                }
            }
        }
        Ok((Status::Ok, out))
    }

    fn print(&self) -> String {
        let dir = self.directory.read().unwrap();
        let n_segments = self.unique_segments().len();
        let n_entries: usize = self
            .unique_segments()
            .iter()
            .map(|s| {
                s.slots
                    .iter()
                    .filter(|slot| {
                        let k = slot.key.load(Ordering::Relaxed);
                        k != NONE && k != INVALID && k != CLAIMED
                    })
                    .count()
            })
            .sum();
        let stats = Stats {
            name: "cceh",
            n_entries,
            mem_usage: self.allocator.mem_usage(),
            detail: format!("depth={} segments={}", dir.depth, n_segments),
        };
        format!("{}", stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{DramAllocator, PmAllocator};
    use crate::persist::NullBackend;
    use crate::region::PMRegion;

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn fresh_cceh(depth: usize, slots: usize) -> Cceh {
        let n = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "pie-cceh-test-{}-{}-{}",
            depth,
            std::process::id(),
            n
        ));
        let region = PMRegion::create(path, 64 << 20).unwrap();
        let allocator: Arc<dyn Allocator> = Arc::new(PmAllocator::new(region));
        let persist: Arc<dyn PersistenceBackend> = Arc::new(NullBackend);
        Cceh::new(allocator, persist, depth, slots)
    }

    #[test]
    fn roundtrip_hello() {
        let idx = fresh_cceh(4, 64);
        assert_eq!(idx.insert(b"Hello", 0xDEADBEEF).unwrap(), Status::Ok);
        let (status, v) = idx.search(b"Hello").unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(v, 0xDEADBEEF);
        let (status, _) = idx.search(b"Hell").unwrap();
        assert_eq!(status, Status::NotFound);
    }

    #[test]
    fn duplicate_detection() {
        let idx = fresh_cceh(4, 64);
        assert_eq!(idx.insert(b"k", 1).unwrap(), Status::Ok);
        assert_eq!(idx.insert(b"k", 2).unwrap(), Status::InsertKeyExists);
        let (status, v) = idx.search(b"k").unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(v, 1);
    }

    #[test]
    fn update_and_upsert() {
        let idx = fresh_cceh(4, 64);
        assert_eq!(idx.update(b"missing", 1).unwrap(), Status::NotFound);
        assert_eq!(idx.upsert(b"a", 1).unwrap(), Status::Ok);
        assert_eq!(idx.upsert(b"a", 2).unwrap(), Status::Ok);
        let (_, v) = idx.search(b"a").unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn forced_doubling_retains_all_keys() {
        let idx = fresh_cceh(1, 32);
        let n = 10_000usize;
        for i in 0..n {
            let k = (i as u64).to_le_bytes();
            idx.insert(&k, i as u64).unwrap();
        }
        for i in 0..n {
            let k = (i as u64).to_le_bytes();
            let (status, v) = idx.search(&k).unwrap();
            assert_eq!(status, Status::Ok);
            assert_eq!(v, i as u64);
        }
        // 10,000 keys through 32-slot segments forces the directory
        // through several doublings (`SPEC_FULL.md` §8 scenario 5);
        // the exact final depth depends on hash distribution, so this
        // only pins a conservative lower bound rather than the
        // specific depth the spec's scenario observed.
        let dir = idx.directory.read().unwrap();
        assert!(dir.depth >= 5, "expected directory to have doubled repeatedly, got depth {}", dir.depth);
    }

    #[test]
    fn contention_across_threads() {
        let idx = Arc::new(fresh_cceh(4, 256));
        let mut handles = vec![];
        for t in 0..8u64 {
            let idx = idx.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..2_000u64 {
                    let key = (t * 1_000_000 + i).to_le_bytes();
                    idx.insert(&key, t * 1_000_000 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8u64 {
            for i in 0..2_000u64 {
                let key = (t * 1_000_000 + i).to_le_bytes();
                let (status, v) = idx.search(&key).unwrap();
                assert_eq!(status, Status::Ok);
                assert_eq!(v, t * 1_000_000 + i);
            }
        }
    }

    #[test]
    fn dram_allocator_also_works_for_keys() {
        let allocator: Arc<dyn Allocator> = Arc::new(DramAllocator::new());
        let persist: Arc<dyn PersistenceBackend> = Arc::new(NullBackend);
        let idx = Cceh::new(allocator, persist, 2, 32);
        idx.insert(b"dram-key", 42).unwrap();
        let (status, v) = idx.search(b"dram-key").unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(v, 42);
    }
}
