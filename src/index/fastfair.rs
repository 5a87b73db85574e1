//! FAST-FAIR B+-tree (`SPEC_FULL.md` §4.5), grounded on
//! `original_source/src/index/FASTFAIR/btree.hpp`.
//!
//! Pages are kept sorted by key; a leaf's `sibling` link lets a writer
//! that landed one page to the left of where a key belongs step right
//! without re-descending from the root. Splits are FAIR: the upper
//! half of a full page moves to a new sibling page at the same level,
//! and the split key is published to the parent by re-descending from
//! the root (the same strategy `btree_insert_internal` uses in the
//! original, rather than keeping parent back-pointers).
//!
//! Readers take the page's `RwLock` in shared mode; the `switch_counter`
//! field is retained and bumped on every structural mutation to keep
//! the header shape observable through [`IndexContract::print`], even
//! though the actual reader/writer exclusion here is the `RwLock`
//! rather than the original's lock-free counter-retry loop (documented
//! as a simplification in `DESIGN.md`).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::index::{IndexContract, Stats, Value};
use crate::key::Key;
use crate::persist::PersistenceBackend;
use crate::status::Status;

type PageRef = Arc<RwLock<PageBody>>;

enum PageBody {
    Leaf {
        switch_counter: AtomicU32,
        entries: Vec<(Key, Value)>,
        sibling: Option<PageRef>,
    },
    Internal {
        switch_counter: AtomicU32,
        level: usize,
        leftmost: PageRef,
        entries: Vec<(Key, PageRef)>,
        sibling: Option<PageRef>,
    },
}

impl PageBody {
    fn new_leaf() -> PageBody {
        PageBody::Leaf {
            switch_counter: AtomicU32::new(0),
            entries: Vec::new(),
            sibling: None,
        }
    }

    fn first_key(&self) -> Option<&Key> {
        match self {
            PageBody::Leaf { entries, .. } => entries.first().map(|(k, _)| k),
            PageBody::Internal { entries, .. } => entries.first().map(|(k, _)| k),
        }
    }

    fn bump_counter(&self) {
        match self {
            PageBody::Leaf { switch_counter, .. } => {
                switch_counter.fetch_add(1, Ordering::Relaxed);
            }
            PageBody::Internal { switch_counter, .. } => {
                switch_counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct FastFair {
    root: RwLock<PageRef>,
    height: AtomicUsize,
    persist: Arc<dyn PersistenceBackend>,
    cardinality: usize,
}

impl FastFair {
    pub fn new(persist: Arc<dyn PersistenceBackend>, page_size: usize) -> FastFair {
        // Entry = key-pointer (8 bytes) + value/child-ref (8 bytes);
        // reserve room for the header the way the original's 512-byte
        // page does.
        let cardinality = ((page_size.max(64) - 32) / 16).max(3);
        FastFair {
            root: RwLock::new(Arc::new(RwLock::new(PageBody::new_leaf()))),
            height: AtomicUsize::new(0),
            persist,
            cardinality,
        }
    }

    fn root(&self) -> PageRef {
        self.root.read().unwrap().clone()
    }

    fn pick_child(entries: &[(Key, PageRef)], leftmost: &PageRef, key: &[u8]) -> PageRef {
        let mut chosen = leftmost.clone();
        for (k, child) in entries {
            if key >= k.content() {
                chosen = child.clone();
            } else {
                break;
            }
        }
        chosen
    }

    /// Descend from `start`, following sibling links when `key` has
    /// outgrown the current page, until reaching a leaf.
    fn find_leaf(&self, key: &[u8]) -> PageRef {
        let mut node = self.root();
        loop {
            let next = {
                let guard = node.read().unwrap();
                match &*guard {
                    PageBody::Leaf { sibling, .. } => {
                        if let Some(sib) = sibling {
                            if let Some(fk) = sib.read().unwrap().first_key() {
                                if key >= fk.content() {
                                    Some(sib.clone())
                                } else {
                                    None
                                }
                            } else {
                                None
                            }
                        } else {
                            None
                        }
                    }
                    PageBody::Internal {
                        leftmost,
                        entries,
                        sibling,
                        ..
                    } => {
                        if let Some(sib) = sibling {
                            if let Some(fk) = sib.read().unwrap().first_key() {
                                if key >= fk.content() {
                                    Some(sib.clone())
                                } else {
                                    None
                                }
                            } else {
                                None
                            }
                        } else {
                            Some(Self::pick_child(entries, leftmost, key))
                        }
                    }
                }
            };
            match next {
                Some(n) => node = n,
                None => {
                    let is_leaf = matches!(&*node.read().unwrap(), PageBody::Leaf { .. });
                    if is_leaf {
                        return node;
                    }
                    // sibling check passed (key belongs here), descend into a child.
                    let child = {
                        let guard = node.read().unwrap();
                        match &*guard {
                            PageBody::Internal {
                                leftmost, entries, ..
                            } => Self::pick_child(entries, leftmost, key),
                            PageBody::Leaf { .. } => unreachable!(),
                        }
                    };
                    node = child;
                }
            }
        }
    }

    fn insert_internal(&self, split_key: Key, left: &PageRef, right: PageRef, level: usize) {
        loop {
            let mut node = self.root();
            loop {
                let at_target_level = matches!(
                    &*node.read().unwrap(),
                    PageBody::Internal { level: l, .. } if *l == level
                ) || matches!(&*node.read().unwrap(), PageBody::Leaf { .. });
                if at_target_level {
                    break;
                }
                let child = {
                    let guard = node.read().unwrap();
                    match &*guard {
                        PageBody::Internal {
                            leftmost, entries, ..
                        } => Self::pick_child(entries, leftmost, split_key.content()),
                        PageBody::Leaf { .. } => unreachable!(),
                    }
                };
                node = child;
            }

            let mut guard = node.write().unwrap();
            let PageBody::Internal {
                leftmost, entries, ..
            } = &mut *guard
            else {
                // root has not grown an internal level yet; wrap it.
                drop(guard);
                self.grow_root(split_key, left.clone(), right, level);
                return;
            };

            let pos = entries
                .iter()
                .position(|(_, c)| Arc::ptr_eq(c, left))
                .map(|i| i + 1)
                .unwrap_or_else(|| {
                    if Arc::ptr_eq(leftmost, left) {
                        0
                    } else {
                        entries.len()
                    }
                });

            if entries.len() < self.cardinality {
                entries.insert(pos, (split_key, right));
                guard.bump_counter();
                return;
            }

            // FAIR split of the internal page.
            log::debug!("fastfair: internal page full ({} entries) at level {}, splitting", entries.len(), level);
            let mid = (entries.len() + 1) / 2;
            let mut right_entries = entries.split_off(mid);
            let (new_split_key, new_right_ptr) = right_entries.remove(0);
            let new_leftmost = new_right_ptr;
            let level_here = match &*guard {
                PageBody::Internal { level, .. } => *level,
                _ => unreachable!(),
            };
            let sibling_of_old = match &mut *guard {
                PageBody::Internal { sibling, .. } => sibling.take(),
                _ => unreachable!(),
            };
            let new_page = Arc::new(RwLock::new(PageBody::Internal {
                switch_counter: AtomicU32::new(0),
                level: level_here,
                leftmost: new_leftmost,
                entries: right_entries,
                sibling: sibling_of_old,
            }));
            match &mut *guard {
                PageBody::Internal {
                    sibling, entries, ..
                } => {
                    *sibling = Some(new_page.clone());
                    if pos <= entries.len() {
                        entries.insert(pos.min(entries.len()), (split_key, right));
                    } else {
                        entries.push((split_key, right));
                    }
                }
                _ => unreachable!(),
            }
            guard.bump_counter();
            let was_root = Arc::ptr_eq(&self.root(), &node);
            drop(guard);
            if was_root {
                self.grow_root(new_split_key, node, new_page, level_here + 1);
            } else {
                self.insert_internal(new_split_key, &node, new_page, level_here + 1);
            }
            return;
        }
    }

    fn grow_root(&self, split_key: Key, left: PageRef, right: PageRef, level: usize) {
        let mut root = self.root.write().unwrap();
        let new_root = Arc::new(RwLock::new(PageBody::Internal {
            switch_counter: AtomicU32::new(0),
            level,
            leftmost: left,
            entries: vec![(split_key, right)],
            sibling: None,
        }));
        *root = new_root;
        self.height.fetch_add(1, Ordering::Relaxed);
        log::debug!("fastfair: root grew to height {}", self.height.load(Ordering::Relaxed));
    }
}

impl IndexContract for FastFair {
    fn insert(&self, key: &[u8], value: Value) -> Result<Status> {
        log::trace!("fastfair: insert {} bytes", key.len());
        loop {
            let leaf = self.find_leaf(key);
            let mut guard = leaf.write().unwrap();
            let PageBody::Leaf {
                entries, sibling, ..
            } = &mut *guard
            else {
                unreachable!("find_leaf always returns a leaf")
            };
            if let Some(sib) = sibling {
                if let Some(fk) = sib.read().unwrap().first_key() {
                    if key >= fk.content() {
                        log::warn!("fastfair: key migrated to sibling during insert, retrying");
                        continue;
                    }
                }
            }
            if let Ok(pos) = entries.binary_search_by(|(k, _)| k.content().cmp(key)) {
                let _ = pos;
                return Ok(Status::InsertKeyExists);
            }
            let pos = entries.partition_point(|(k, _)| k.content() < key);
            if entries.len() < self.cardinality {
                entries.insert(pos, (Key::new(key), value));
                guard.bump_counter();
                self.persist
                    .persist(&*guard as *const PageBody as *const u8, 1);
                return Ok(Status::Ok);
            }

            let mid = (entries.len() + 1) / 2;
            log::debug!("fastfair: leaf page full ({} entries), splitting", entries.len());
            let right_entries = entries.split_off(mid);
            let split_key = right_entries[0].0.clone();
            let sibling_of_old = sibling.take();
            let new_leaf = Arc::new(RwLock::new(PageBody::Leaf {
                switch_counter: AtomicU32::new(0),
                entries: right_entries,
                sibling: sibling_of_old,
            }));
            *sibling = Some(new_leaf.clone());
            if key < split_key.content() {
                let pos = entries.partition_point(|(k, _)| k.content() < key);
                entries.insert(pos, (Key::new(key), value));
            } else {
                let mut ng = new_leaf.write().unwrap();
                if let PageBody::Leaf { entries, .. } = &mut *ng {
                    let pos = entries.partition_point(|(k, _)| k.content() < key);
                    entries.insert(pos, (Key::new(key), value));
                }
            }
            guard.bump_counter();
            let was_root = Arc::ptr_eq(&self.root(), &leaf);
            drop(guard);
            if was_root {
                self.grow_root(split_key, leaf, new_leaf, 1);
            } else {
                self.insert_internal(split_key, &leaf, new_leaf, 1);
            }
            return Ok(Status::Ok);
        }
    }

    fn search(&self, key: &[u8]) -> Result<(Status, Value)> {
        log::trace!("fastfair: search {} bytes", key.len());
        let leaf = self.find_leaf(key);
        let guard = leaf.read().unwrap();
        if let PageBody::Leaf { entries, .. } = &*guard {
            if let Ok(pos) = entries.binary_search_by(|(k, _)| k.content().cmp(key)) {
                return Ok((Status::Ok, entries[pos].1));
            }
        }
        Ok((Status::NotFound, 0))
    }

    fn update(&self, key: &[u8], value: Value) -> Result<Status> {
        let leaf = self.find_leaf(key);
        let mut guard = leaf.write().unwrap();
        if let PageBody::Leaf { entries, .. } = &mut *guard {
            if let Ok(pos) = entries.binary_search_by(|(k, _)| k.content().cmp(key)) {
                entries[pos].1 = value;
                guard.bump_counter();
                return Ok(Status::Ok);
            }
        }
        Ok(Status::NotFound)
    }

    fn upsert(&self, key: &[u8], value: Value) -> Result<Status> {
        match self.update(key, value)? {
            Status::Ok => Ok(Status::Ok),
            _ => self.insert(key, value),
        }
    }

    fn scan_count(&self, start: &[u8], n: usize) -> Result<(Status, Vec<Value>)> {
        let (_, values) = self.scan(start, &[0xff; 256])?;
        Ok((Status::Ok, values.into_iter().take(n).collect()))
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<(Status, Vec<Value>)> {
        let mut out = Vec::new();
        let mut node = self.find_leaf(start);
        loop {
            let next = {
                let guard = node.read().unwrap();
                match &*guard {
                    PageBody::Leaf { entries, sibling } => {
                        for (k, v) in entries {
                            if k.content() >= start && k.content() < end {
                                out.push(*v);
                            }
                        }
                        let done = entries
                            .last()
                            .map(|(k, _)| k.content() >= end)
                            .unwrap_or(false);
                        if done {
                            None
                        } else {
                            sibling.clone()
                        }
                    }
                    PageBody::Internal { .. } => None,
                }
            };
            match next {
                Some(n) => node = n,
                None => break,
            }
        }
        Ok((Status::Ok, out))
    }

    fn print(&self) -> String {
        let n_entries = self.count_entries(&self.root());
        let stats = Stats {
            name: "fastfair",
            n_entries,
            mem_usage: 0,
            detail: format!("height={}", self.height.load(Ordering::Relaxed)),
        };
        format!("{}", stats)
    }
}

impl FastFair {
    /// Every page is reachable exactly once by following `leftmost`
    /// then `entries` from the root: a split always both links the new
    /// page in as its left neighbor's `sibling` *and* publishes it into
    /// the parent's `entries`, so counting through `sibling` as well
    /// would double every page it names.
    fn count_entries(&self, node: &PageRef) -> usize {
        let guard = node.read().unwrap();
        match &*guard {
            PageBody::Leaf { entries, .. } => entries.len(),
            PageBody::Internal {
                leftmost, entries, ..
            } => {
                let mut total = self.count_entries(leftmost);
                for (_, c) in entries {
                    total += self.count_entries(c);
                }
                total
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::NullBackend;

    fn fresh() -> FastFair {
        FastFair::new(Arc::new(NullBackend), 512)
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
    }

    #[test]
    fn ordering_preserved_through_many_splits() {
        let idx = fresh();
        let n = 5_000u64;
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
        assert_eq!(values, sorted);
    }

    #[test]
    fn update_replaces_value() {
        let idx = fresh();
        idx.insert(b"a", 1).unwrap();
        assert_eq!(idx.update(b"a", 2).unwrap(), Status::Ok);
        assert_eq!(idx.search(b"a").unwrap().1, 2);
        assert_eq!(idx.update(b"missing", 9).unwrap(), Status::NotFound);
    }
}
