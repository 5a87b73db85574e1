//! Write-optimal radix trie (`SPEC_FULL.md` §4.8), grounded on
//! `original_source/src/index/WORT/wort.{hpp,cc}`.
//!
//! Each level dispatches on a 4-bit token (a nibble of the key); an
//! inner node's header packs `[depth][partial_len][partial tokens]`
//! into one 8-byte word so it publishes with a single atomic store,
//! exactly as `art_node`'s header does in the original. A leaf inlines
//! `[value][key_len][key bytes]` into one allocator buffer, matching
//! `art_leaf`'s flexible-array-member layout.
//!
//! One addition beyond the original: children slot 16 ("terminal") is
//! reserved for a key that ends exactly at this node's depth, so that
//! a key which is a byte-prefix of another routes distinctly from one
//! that continues past this point (the original's leaves compare full
//! key bytes and so never hit this ambiguity explicitly, but the pure
//! token-dispatch path here needs it to stay unambiguous for
//! variable-length keys — see `DESIGN.md`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::alloc::Allocator;
use crate::error::Result;
use crate::index::{IndexContract, Stats, Value};
use crate::persist::PersistenceBackend;
use crate::status::Status;

const TERMINAL: usize = 16;
const NUM_CHILDREN: usize = 17;
const MAX_PARTIAL: usize = 6;
/// Visit order for an in-order walk: a key ending here sorts before
/// any key that continues past this depth (shorter-is-less, `SPEC_FULL.md`
/// component 3).
const CHILD_ORDER: [usize; NUM_CHILDREN] = [16, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

fn token_at(key: &[u8], depth: usize) -> usize {
    let byte_idx = depth / 2;
    match key.get(byte_idx) {
        None => TERMINAL,
        Some(&b) => {
            if depth % 2 == 0 {
                (b >> 4) as usize
            } else {
                (b & 0xF) as usize
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Header {
    depth: u8,
    partial_len: u8,
    partial: [u8; MAX_PARTIAL],
}

fn pack_header(depth: u8, partial: &[u8]) -> u64 {
    debug_assert!(partial.len() <= MAX_PARTIAL);
    let mut word = (depth as u64) << 56 | (partial.len() as u64) << 48;
    for (i, &t) in partial.iter().enumerate() {
        word |= (t as u64) << (8 * (5 - i));
    }
    word
}

fn unpack_header(word: u64) -> Header {
    let depth = (word >> 56) as u8;
    let partial_len = ((word >> 48) & 0xFF) as u8;
    let mut partial = [0u8; MAX_PARTIAL];
    for (i, slot) in partial.iter_mut().enumerate() {
        *slot = ((word >> (8 * (5 - i))) & 0xFF) as u8;
    }
    Header {
        depth,
        partial_len,
        partial,
    }
}

/// Index at which `key`'s tokens (from `depth`) first diverge from
/// `header.partial`; `None` if the full stored partial matches.
fn prefix_mismatch(header: &Header, key: &[u8], depth: usize) -> Option<usize> {
    for i in 0..header.partial_len as usize {
        if token_at(key, depth + i) != header.partial[i] as usize {
            return Some(i);
        }
    }
    None
}

enum Node {
    Leaf { ptr: u64 },
    Inner(InnerNode),
}

struct InnerNode {
    header: AtomicU64,
    children: Vec<RwLock<Option<Arc<Node>>>>,
}

impl InnerNode {
    fn new(depth: u8, partial: &[u8]) -> InnerNode {
        InnerNode {
            header: AtomicU64::new(pack_header(depth, partial)),
            children: (0..NUM_CHILDREN).map(|_| RwLock::new(None)).collect(),
        }
    }
}

pub struct Wort {
    root: RwLock<Option<Arc<Node>>>,
    allocator: Arc<dyn Allocator>,
    persist: Arc<dyn PersistenceBackend>,
}

impl Wort {
    pub fn new(allocator: Arc<dyn Allocator>, persist: Arc<dyn PersistenceBackend>) -> Wort {
        Wort {
            root: RwLock::new(None),
            allocator,
            persist,
        }
    }

    fn leaf_key_value<'a>(ptr: u64) -> (&'a [u8], Value) {
        // SAFETY: `ptr` was produced by `persist_leaf`, pointing at a
        // live `[value 8][key_len 4][key bytes]` buffer in the
        // allocator's arena, which the allocator never frees.
        let raw = ptr as usize as *const u8;
        let value = u64::from_le_bytes(
            unsafe { std::slice::from_raw_parts(raw, 8) }
                .try_into()
                .unwrap(),
        );
        let key_len = u32::from_le_bytes(
            unsafe { std::slice::from_raw_parts(raw.add(8), 4) }
                .try_into()
                .unwrap(),
        ) as usize;
        let key = unsafe { std::slice::from_raw_parts(raw.add(12), key_len) };
        (key, value)
    }

    fn persist_leaf(&self, key: &[u8], value: Value) -> Result<u64> {
        let total = 12 + key.len();
        let ptr = self.allocator.allocate(total)?;
        // SAFETY: `ptr` was just allocated with exactly `total` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), ptr, 8);
            std::ptr::copy_nonoverlapping((key.len() as u32).to_le_bytes().as_ptr(), ptr.add(8), 4);
            std::ptr::copy_nonoverlapping(key.as_ptr(), ptr.add(12), key.len());
        }
        self.persist.persist(ptr, total);
        Ok(ptr as u64)
    }

    fn overwrite_value(&self, ptr: u64, value: Value) {
        let raw = ptr as usize as *mut u8;
        // SAFETY: `ptr` is a live leaf buffer; the value field is its
        // first 8 bytes and never aliases the key content that
        // follows it.
        unsafe { std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), raw, 8) };
        self.persist.persist(raw, 8);
    }

    /// Builds the minimal chain of inner nodes needed to separate
    /// `old_key` (already stored at `old_node`) from `new_key`,
    /// starting the comparison at token `depth`. Recurses only when
    /// the shared prefix between the two keys exceeds what a single
    /// header's `partial` can hold (`MAX_PARTIAL` tokens).
    fn build_branch(
        &self,
        depth: usize,
        old_node: Arc<Node>,
        old_key: &[u8],
        new_key: &[u8],
        new_value: Value,
    ) -> Result<Arc<Node>> {
        let mut lcp = 0usize;
        while token_at(old_key, depth + lcp) == token_at(new_key, depth + lcp) {
            lcp += 1;
        }
        let stored = lcp.min(MAX_PARTIAL);
        let branch_depth = depth + stored;
        let partial: Vec<u8> = (0..stored)
            .map(|i| token_at(old_key, depth + i) as u8)
            .collect();
        let inner = InnerNode::new(depth as u8, &partial);
        log::debug!("wort: branching at depth {} (lcp {}, stored {})", depth, lcp, stored);

        if stored == lcp {
            let old_tok = token_at(old_key, branch_depth);
            let new_tok = token_at(new_key, branch_depth);
            debug_assert_ne!(old_tok, new_tok);
            let new_leaf_ptr = self.persist_leaf(new_key, new_value)?;
            *inner.children[old_tok].write().unwrap() = Some(old_node);
            *inner.children[new_tok].write().unwrap() = Some(Arc::new(Node::Leaf { ptr: new_leaf_ptr }));
        } else {
            let shared_tok = token_at(old_key, branch_depth);
            let child = self.build_branch(branch_depth + 1, old_node, old_key, new_key, new_value)?;
            *inner.children[shared_tok].write().unwrap() = Some(child);
        }
        self.persist.fence_store();
        Ok(Arc::new(Node::Inner(inner)))
    }

    fn insert_at(&self, slot: &RwLock<Option<Arc<Node>>>, key: &[u8], value: Value, depth: usize) -> Result<Status> {
        loop {
            let current = slot.read().unwrap().clone();
            match current {
                None => {
                    let ptr = self.persist_leaf(key, value)?;
                    let mut w = slot.write().unwrap();
                    if w.is_none() {
                        *w = Some(Arc::new(Node::Leaf { ptr }));
                        self.persist.fence_store();
                        return Ok(Status::Ok);
                    }
                    log::warn!("wort: lost race installing leaf at depth {}, retrying", depth);
                    continue;
                }
                Some(node) => match &*node {
                    Node::Leaf { ptr } => {
                        let (ekey, _) = Self::leaf_key_value(*ptr);
                        if ekey == key {
                            return Ok(Status::InsertKeyExists);
                        }
                        let branch = self.build_branch(depth, node.clone(), ekey, key, value)?;
                        let mut w = slot.write().unwrap();
                        if w.as_ref().map(|cur| Arc::ptr_eq(cur, &node)).unwrap_or(false) {
                            *w = Some(branch);
                            return Ok(Status::Ok);
                        }
                        log::warn!("wort: lost race replacing leaf with branch at depth {}, retrying", depth);
                        continue;
                    }
                    Node::Inner(inner) => {
                        let header = unpack_header(inner.header.load(Ordering::Acquire));
                        match prefix_mismatch(&header, key, depth) {
                            None => {
                                let next_depth = depth + header.partial_len as usize;
                                let tok = token_at(key, next_depth);
                                return self.insert_at(&inner.children[tok], key, value, next_depth + 1);
                            }
                            Some(m) => {
                                let old_branch_tok = header.partial[m] as usize;
                                let new_tok = token_at(key, depth + m);
                                let mid = InnerNode::new(depth as u8, &header.partial[..m]);

                                let new_old_depth = depth + m + 1;
                                let new_old_partial_len = header.partial_len as usize - m - 1;
                                let shifted: Vec<u8> =
                                    header.partial[m + 1..m + 1 + new_old_partial_len].to_vec();
                                inner
                                    .header
                                    .store(pack_header(new_old_depth as u8, &shifted), Ordering::Release);
                                self.persist.fence_store();

                                let new_leaf_ptr = self.persist_leaf(key, value)?;
                                *mid.children[old_branch_tok].write().unwrap() = Some(node.clone());
                                *mid.children[new_tok].write().unwrap() =
                                    Some(Arc::new(Node::Leaf { ptr: new_leaf_ptr }));
                                let mid_node = Arc::new(Node::Inner(mid));

                                let mut w = slot.write().unwrap();
                                if w.as_ref().map(|cur| Arc::ptr_eq(cur, &node)).unwrap_or(false) {
                                    *w = Some(mid_node);
                                    return Ok(Status::Ok);
                                }
                                continue;
                            }
                        }
                    }
                },
            }
        }
    }

    fn find_leaf_ptr(&self, key: &[u8]) -> Option<u64> {
        let mut depth = 0usize;
        let mut current = self.root.read().unwrap().clone();
        loop {
            match current {
                None => return None,
                Some(node) => match &*node {
                    Node::Leaf { ptr } => {
                        let (ekey, _) = Self::leaf_key_value(*ptr);
                        return if ekey == key { Some(*ptr) } else { None };
                    }
                    Node::Inner(inner) => {
                        let header = unpack_header(inner.header.load(Ordering::Acquire));
                        if prefix_mismatch(&header, key, depth).is_some() {
                            return None;
                        }
                        let next_depth = depth + header.partial_len as usize;
                        let tok = token_at(key, next_depth);
                        current = inner.children[tok].read().unwrap().clone();
                        depth = next_depth + 1;
                    }
                },
            }
        }
    }

    fn walk(&self, mut f: impl FnMut(&[u8], Value) -> bool) {
        fn rec(node: &Option<Arc<Node>>, f: &mut impl FnMut(&[u8], Value) -> bool) -> bool {
            match node {
                None => true,
                Some(n) => match &**n {
                    Node::Leaf { ptr } => {
                        let (k, v) = Wort::leaf_key_value(*ptr);
                        f(k, v)
                    }
                    Node::Inner(inner) => {
                        for &idx in CHILD_ORDER.iter() {
                            let child = inner.children[idx].read().unwrap().clone();
                            if !rec(&child, f) {
                                return false;
                            }
                        }
                        true
                    }
                },
            }
        }
        let root = self.root.read().unwrap().clone();
        rec(&root, &mut f);
    }

    fn count(&self) -> usize {
        let mut n = 0;
        self.walk(|_, _| {
            n += 1;
            true
        });
        n
    }
}

impl IndexContract for Wort {
    fn insert(&self, key: &[u8], value: Value) -> Result<Status> {
        self.insert_at(&self.root, key, value, 0)
    }

    fn search(&self, key: &[u8]) -> Result<(Status, Value)> {
        match self.find_leaf_ptr(key) {
            Some(ptr) => Ok((Status::Ok, Self::leaf_key_value(ptr).1)),
            None => Ok((Status::NotFound, 0)),
        }
    }

    fn update(&self, key: &[u8], value: Value) -> Result<Status> {
        match self.find_leaf_ptr(key) {
            Some(ptr) => {
                self.overwrite_value(ptr, value);
                Ok(Status::Ok)
            }
            None => Ok(Status::NotFound),
        }
    }

    fn upsert(&self, key: &[u8], value: Value) -> Result<Status> {
        match self.update(key, value)? {
            Status::Ok => Ok(Status::Ok),
            _ => self.insert(key, value),
        }
    }

    fn scan_count(&self, start: &[u8], n: usize) -> Result<(Status, Vec<Value>)> {
        let mut out = Vec::new();
        self.walk(|k, v| {
            if k >= start {
                out.push(v);
            }
            out.len() < n
        });
        Ok((Status::Ok, out))
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<(Status, Vec<Value>)> {
        let mut out = Vec::new();
        self.walk(|k, v| {
            if k >= end {
                return false;
            }
            if k >= start {
                out.push(v);
            }
            true
        });
        Ok((Status::Ok, out))
    }

    fn print(&self) -> String {
        let stats = Stats {
            name: "wort",
            n_entries: self.count(),
            mem_usage: self.allocator.mem_usage(),
            detail: String::new(),
        };
        format!("{}", stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PmAllocator;
    use crate::persist::NullBackend;
    use crate::region::PMRegion;
    use std::sync::atomic::AtomicUsize;

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn fresh() -> Wort {
        let n = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("pie-wort-test-{}-{}", std::process::id(), n));
        let region = PMRegion::create(path, 64 << 20).unwrap();
        let allocator: Arc<dyn Allocator> = Arc::new(PmAllocator::new(region));
        Wort::new(allocator, Arc::new(NullBackend))
    }

    #[test]
    fn roundtrip_hello() {
        let idx = fresh();
        assert_eq!(idx.insert(b"Hello", 0xDEADBEEF).unwrap(), Status::Ok);
        let (status, v) = idx.search(b"Hello").unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(v, 0xDEADBEEF);
        assert_eq!(idx.search(b"Hell").unwrap().0, Status::NotFound);
    }

    #[test]
    fn duplicate_detection() {
        let idx = fresh();
        assert_eq!(idx.insert(b"k", 1).unwrap(), Status::Ok);
        assert_eq!(idx.insert(b"k", 2).unwrap(), Status::InsertKeyExists);
        assert_eq!(idx.search(b"k").unwrap().1, 1);
    }

    #[test]
    fn update_and_upsert() {
        let idx = fresh();
        assert_eq!(idx.update(b"missing", 1).unwrap(), Status::NotFound);
        assert_eq!(idx.upsert(b"a", 1).unwrap(), Status::Ok);
        assert_eq!(idx.upsert(b"a", 2).unwrap(), Status::Ok);
        assert_eq!(idx.search(b"a").unwrap().1, 2);
    }

    #[test]
    fn prefix_of_another_key_is_unambiguous() {
        let idx = fresh();
        assert_eq!(idx.insert(b"ab", 1).unwrap(), Status::Ok);
        assert_eq!(idx.insert(b"abx", 2).unwrap(), Status::Ok);
        assert_eq!(idx.insert(b"ab\0", 3).unwrap(), Status::Ok);
        assert_eq!(idx.search(b"ab").unwrap(), (Status::Ok, 1));
        assert_eq!(idx.search(b"abx").unwrap(), (Status::Ok, 2));
        assert_eq!(idx.search(b"ab\0").unwrap(), (Status::Ok, 3));
    }

    #[test]
    fn shared_prefix_beyond_header_capacity() {
        let idx = fresh();
        let mut a = vec![7u8; 10];
        a.push(1);
        let mut b = vec![7u8; 10];
        b.push(2);
        idx.insert(&a, 100).unwrap();
        idx.insert(&b, 200).unwrap();
        assert_eq!(idx.search(&a).unwrap(), (Status::Ok, 100));
        assert_eq!(idx.search(&b).unwrap(), (Status::Ok, 200));
    }

    #[test]
    fn bulk_insert_search_and_ordered_scan() {
        let idx = fresh();
        let n = 3_000u64;
        for i in 0..n {
            idx.insert(&i.to_be_bytes(), i).unwrap();
        }
        for i in 0..n {
            let (status, v) = idx.search(&i.to_be_bytes()).unwrap();
            assert_eq!(status, Status::Ok);
            assert_eq!(v, i);
        }
        let (_, values) = idx.scan(&0u64.to_be_bytes(), &n.to_be_bytes()).unwrap();
        assert_eq!(values.len(), n as usize);
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted, "WORT's natural traversal order must be key-sorted");
    }

    #[test]
    fn contention_across_threads() {
        let idx = Arc::new(fresh());
        let mut handles = vec![];
        for t in 0..8u64 {
            let idx = idx.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000u64 {
                    let key = (t * 1_000_000 + i).to_be_bytes();
                    idx.insert(&key, t * 1_000_000 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8u64 {
            for i in 0..1_000u64 {
                let key = (t * 1_000_000 + i).to_be_bytes();
                let (status, v) = idx.search(&key).unwrap();
                assert_eq!(status, Status::Ok);
                assert_eq!(v, t * 1_000_000 + i);
            }
        }
    }
}
