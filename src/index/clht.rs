//! Cache-line hash table (`SPEC_FULL.md` §4.6), grounded on
//! `original_source/src/index/P-CLHT/clht-lb.hpp`.
//!
//! Each bucket holds a fixed 3 (key, value) slots plus an overflow
//! pointer, behind a one-byte spinlock for writers. Readers never take
//! the spinlock: they walk the chain re-reading (value, key) pairs and
//! only trust a match once a second read of the value agrees with the
//! first, the same race-tolerant re-read the original uses instead of
//! a lock.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crc::crc32;

use crate::alloc::Allocator;
use crate::error::Result;
use crate::index::{IndexContract, Stats, Value};
use crate::key::{Key, KeyRef};
use crate::latch::SpinLock;
use crate::persist::PersistenceBackend;
use crate::status::Status;

const SLOTS_PER_BUCKET: usize = 3;
const EMPTY: u64 = 0;

fn hash_key(key: &[u8]) -> u64 {
    let mut h = crc32::Digest::new(crc32::IEEE);
    0xc1ht_seed_u64.hash(&mut h);
    key.hash(&mut h);
    h.finish()
}

#[allow(non_upper_case_globals)]
const c1ht_seed_u64: u64 = 0x9e3779b97f4a7c15;

struct Slot {
    key: AtomicU64,
    value: AtomicU64,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            key: AtomicU64::new(EMPTY),
            value: AtomicU64::new(0),
        }
    }
}

struct Bucket {
    lock: SpinLock,
    slots: [Slot; SLOTS_PER_BUCKET],
    next: RwLock<Option<Arc<Bucket>>>,
}

impl Bucket {
    fn new() -> Bucket {
        Bucket {
            lock: SpinLock::new(),
            slots: [Slot::empty(), Slot::empty(), Slot::empty()],
            next: RwLock::new(None),
        }
    }
}

struct Table {
    buckets: Vec<Arc<Bucket>>,
    mask: usize,
}

impl Table {
    fn with_buckets(n: usize) -> Table {
        debug_assert!(n.is_power_of_two());
        Table {
            buckets: (0..n).map(|_| Arc::new(Bucket::new())).collect(),
            mask: n - 1,
        }
    }
}

pub struct Clht {
    root: RwLock<Arc<Table>>,
    allocator: Arc<dyn Allocator>,
    persist: Arc<dyn PersistenceBackend>,
    num_expands: AtomicUsize,
    perc_full_double: usize,
    resize_lock: Mutex<()>,
}

impl Clht {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        persist: Arc<dyn PersistenceBackend>,
        initial_buckets: usize,
        perc_full_double: usize,
    ) -> Clht {
        let n = initial_buckets.next_power_of_two().max(8);
        Clht {
            root: RwLock::new(Arc::new(Table::with_buckets(n))),
            allocator,
            persist,
            num_expands: AtomicUsize::new(0),
            perc_full_double,
            resize_lock: Mutex::new(()),
        }
    }

    fn count_entries(&self, table: &Table) -> usize {
        let mut total = 0;
        for bucket in &table.buckets {
            let mut node = Some(bucket.clone());
            while let Some(b) = node {
                for slot in &b.slots {
                    if slot.key.load(Ordering::Acquire) != EMPTY {
                        total += 1;
                    }
                }
                node = b.next.read().unwrap().clone();
            }
        }
        total
    }

    fn deref_key<'a>(&self, ptr: u64) -> KeyRef<'a> {
        // SAFETY: `ptr` points at a `[len][content]` buffer allocated
        // by `persist_key`, which the allocator never frees.
        let raw = ptr as usize as *const u8;
        let len = u32::from_le_bytes(
            unsafe { std::slice::from_raw_parts(raw, 4) }
                .try_into()
                .unwrap(),
        ) as usize;
        KeyRef::from_raw(unsafe { std::slice::from_raw_parts(raw, 4 + len) })
    }

    fn persist_key(&self, key: &[u8]) -> Result<u64> {
        let k = Key::new(key);
        let bytes = k.persisted_bytes();
        let ptr = self.allocator.allocate(bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        self.persist.persist(ptr, bytes.len());
        Ok(ptr as u64)
    }

    fn table(&self) -> Arc<Table> {
        self.root.read().unwrap().clone()
    }

    fn bucket_for(&self, table: &Table, key: &[u8]) -> Arc<Bucket> {
        let idx = (hash_key(key) as usize) & table.mask;
        table.buckets[idx].clone()
    }

    fn find_in_bucket(&self, bucket: &Arc<Bucket>, key: &[u8]) -> Option<u64> {
        let mut node = bucket.clone();
        loop {
            for slot in &node.slots {
                let v1 = slot.value.load(Ordering::Acquire);
                let k = slot.key.load(Ordering::Acquire);
                if k == EMPTY {
                    continue;
                }
                let stored = self.deref_key(k);
                if stored.content() == key {
                    let v2 = slot.value.load(Ordering::Acquire);
                    if v1 == v2 {
                        return Some(v1);
                    }
                }
            }
            let next = node.next.read().unwrap().clone();
            match next {
                Some(n) => node = n,
                None => return None,
            }
        }
    }

    fn maybe_resize(&self) {
        let table = self.table();
        let live = self.num_expands.load(Ordering::Relaxed);
        if live * 100 < table.buckets.len() * self.perc_full_double {
            return;
        }
        let _guard = match self.resize_lock.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let table = self.table();
        let new_n = table.buckets.len() * 2;
        log::debug!("clht: resizing {} -> {} buckets", table.buckets.len(), new_n);
        let new_table = Table::with_buckets(new_n);
        for bucket in &table.buckets {
            let mut node = Some(bucket.clone());
            while let Some(b) = node {
                for slot in &b.slots {
                    let k = slot.key.load(Ordering::Relaxed);
                    if k == EMPTY {
                        continue;
                    }
                    let v = slot.value.load(Ordering::Relaxed);
                    let stored = self.deref_key(k);
                    let idx = (hash_key(stored.content()) as usize) & new_table.mask;
                    place_in_new_table(&new_table.buckets[idx], k, v);
                }
                node = b.next.read().unwrap().clone();
            }
        }
        *self.root.write().unwrap() = Arc::new(new_table);
        self.num_expands.store(0, Ordering::Relaxed);
    }
}

fn place_in_new_table(bucket: &Arc<Bucket>, key_ptr: u64, value: u64) {
    let mut node = bucket.clone();
    loop {
        for slot in &node.slots {
            if slot.key.load(Ordering::Relaxed) == EMPTY {
                slot.value.store(value, Ordering::Relaxed);
                slot.key.store(key_ptr, Ordering::Relaxed);
                return;
            }
        }
        let mut next_guard = node.next.write().unwrap();
        if next_guard.is_none() {
            let fresh = Arc::new(Bucket::new());
            fresh.slots[0].value.store(value, Ordering::Relaxed);
            fresh.slots[0].key.store(key_ptr, Ordering::Relaxed);
            *next_guard = Some(fresh);
            return;
        }
        let n = next_guard.clone().unwrap();
        drop(next_guard);
        node = n;
    }
}

impl IndexContract for Clht {
    fn insert(&self, key: &[u8], value: Value) -> Result<Status> {
        log::trace!("clht: insert {} bytes", key.len());
        loop {
            let table = self.table();
            let head = self.bucket_for(&table, key);
            let _g = head.lock.lock();
            if !Arc::ptr_eq(&self.table(), &table) {
                log::warn!("clht: table swapped under us during insert, retrying");
                continue;
            }
            if self.find_in_bucket(&head, key).is_some() {
                return Ok(Status::InsertKeyExists);
            }
            let mut node = head.clone();
            loop {
                if let Some(slot) = node.slots.iter().find(|s| s.key.load(Ordering::Relaxed) == EMPTY) {
                    let key_ptr = self.persist_key(key)?;
                    slot.value.store(value, Ordering::Relaxed);
                    self.persist.fence_store();
                    slot.key.store(key_ptr, Ordering::Release);
                    self.persist.fence_store();
                    return Ok(Status::Ok);
                }
                let next = node.next.read().unwrap().clone();
                match next {
                    Some(n) => node = n,
                    None => {
                        let key_ptr = self.persist_key(key)?;
                        let fresh = Arc::new(Bucket::new());
                        fresh.slots[0].value.store(value, Ordering::Relaxed);
                        fresh.slots[0].key.store(key_ptr, Ordering::Relaxed);
                        self.persist.persist(
                            &fresh.slots[0] as *const Slot as *const u8,
                            16,
                        );
                        *node.next.write().unwrap() = Some(fresh);
                        self.num_expands.fetch_add(1, Ordering::Relaxed);
                        self.maybe_resize();
                        return Ok(Status::Ok);
                    }
                }
            }
        }
    }

    fn search(&self, key: &[u8]) -> Result<(Status, Value)> {
        log::trace!("clht: search {} bytes", key.len());
        let table = self.table();
        let bucket = self.bucket_for(&table, key);
        match self.find_in_bucket(&bucket, key) {
            Some(v) => Ok((Status::Ok, v)),
            None => Ok((Status::NotFound, 0)),
        }
    }

    fn update(&self, key: &[u8], value: Value) -> Result<Status> {
        let table = self.table();
        let bucket = self.bucket_for(&table, key);
        let _g = bucket.lock.lock();
        let mut node = bucket.clone();
        loop {
            for slot in &node.slots {
                let k = slot.key.load(Ordering::Acquire);
                if k == EMPTY {
                    continue;
                }
                if self.deref_key(k).content() == key {
                    slot.value.store(value, Ordering::Release);
                    self.persist.persist(slot as *const Slot as *const u8, 16);
                    return Ok(Status::Ok);
                }
            }
            let next = node.next.read().unwrap().clone();
            match next {
                Some(n) => node = n,
                None => return Ok(Status::NotFound),
            }
        }
    }

    fn upsert(&self, key: &[u8], value: Value) -> Result<Status> {
        match self.update(key, value)? {
            Status::Ok => Ok(Status::Ok),
            _ => self.insert(key, value),
        }
    }

    fn scan_count(&self, _start: &[u8], n: usize) -> Result<(Status, Vec<Value>)> {
        let table = self.table();
        let mut out = Vec::new();
        'outer: for bucket in &table.buckets {
            let mut node = Some(bucket.clone());
            while let Some(b) = node {
                for slot in &b.slots {
                    if slot.key.load(Ordering::Acquire) != EMPTY {
                        out.push(slot.value.load(Ordering::Acquire));
                        if out.len() >= n {
                            break 'outer;
                        }
                    }
                }
                node = b.next.read().unwrap().clone();
            }
        }
        Ok((Status::Ok, out))
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<(Status, Vec<Value>)> {
        let table = self.table();
        let mut out = Vec::new();
        for bucket in &table.buckets {
            let mut node = Some(bucket.clone());
            while let Some(b) = node {
                for slot in &b.slots {
                    let k = slot.key.load(Ordering::Acquire);
                    if k == EMPTY {
                        continue;
                    }
                    let stored = self.deref_key(k);
                    if stored.content() >= start && stored.content() < end {
                        out.push(slot.value.load(Ordering::Acquire));
                    }
                }
                node = b.next.read().unwrap().clone();
            }
        }
        Ok((Status::Ok, out))
    }

    fn print(&self) -> String {
        let table = self.table();
        let stats = Stats {
            name: "clht",
            n_entries: self.count_entries(&table),
            mem_usage: self.allocator.mem_usage(),
            detail: format!("buckets={}", table.buckets.len()),
        };
        format!("{}", stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::NullBackend;
    use crate::region::PMRegion;
    use crate::alloc::PmAllocator;

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn fresh(buckets: usize) -> Clht {
        let n = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("pie-clht-test-{}-{}", std::process::id(), n));
        let region = PMRegion::create(path, 64 << 20).unwrap();
        let allocator: Arc<dyn Allocator> = Arc::new(PmAllocator::new(region));
        Clht::new(allocator, Arc::new(NullBackend), buckets, 50)
    }

    #[test]
    fn roundtrip_hello() {
        let idx = fresh(16);
        assert_eq!(idx.insert(b"Hello", 0xDEADBEEF).unwrap(), Status::Ok);
        let (status, v) = idx.search(b"Hello").unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(v, 0xDEADBEEF);
    }

    #[test]
    fn duplicate_and_overflow_chain() {
        let idx = fresh(1);
        for i in 0..20u64 {
            assert_eq!(idx.insert(&i.to_le_bytes(), i).unwrap(), Status::Ok);
        }
        assert_eq!(idx.insert(&0u64.to_le_bytes(), 99).unwrap(), Status::InsertKeyExists);
        for i in 0..20u64 {
            let (status, v) = idx.search(&i.to_le_bytes()).unwrap();
            assert_eq!(status, Status::Ok);
            assert_eq!(v, i);
        }
    }

    #[test]
    fn resize_keeps_all_keys_reachable() {
        let idx = fresh(8);
        let n = 2_000u64;
        for i in 0..n {
            idx.insert(&i.to_le_bytes(), i).unwrap();
        }
        for i in 0..n {
            let (status, v) = idx.search(&i.to_le_bytes()).unwrap();
            assert_eq!(status, Status::Ok);
            assert_eq!(v, i);
        }
    }
}
