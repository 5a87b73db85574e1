//! Minimal reference backend, grounded on
//! `original_source/src/index/example/example_index.{hpp,cc}` — the
//! original ships it as a printf stub meant only to document the
//! `Index` interface shape. Here it is a real, if unremarkable,
//! implementation: a single sorted vector of persisted keys under one
//! lock. It exists as the simplest possible `IndexContract` realization
//! to validate the `Scheme` façade and the CLI against, not as a
//! performance target.

use std::sync::{Arc, RwLock};

use crate::alloc::Allocator;
use crate::error::Result;
use crate::index::{IndexContract, Stats, Value};
use crate::key::{Key, KeyRef};
use crate::persist::PersistenceBackend;
use crate::status::Status;

pub struct Example {
    allocator: Arc<dyn Allocator>,
    persist: Arc<dyn PersistenceBackend>,
    entries: RwLock<Vec<(Key, Value)>>,
}

impl Example {
    pub fn new(allocator: Arc<dyn Allocator>, persist: Arc<dyn PersistenceBackend>) -> Example {
        Example {
            allocator,
            persist,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn persist_key(&self, key: &[u8]) -> Result<()> {
        let owned = Key::new(key);
        let bytes = owned.persisted_bytes();
        let ptr = self.allocator.allocate(bytes.len())?;
        // SAFETY: `ptr` was just allocated with exactly `bytes.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        self.persist.persist(ptr, bytes.len());
        Ok(())
    }
}

impl IndexContract for Example {
    fn insert(&self, key: &[u8], value: Value) -> Result<Status> {
        log::trace!("example: insert {} bytes", key.len());
        let mut entries = self.entries.write().unwrap();
        let kref = KeyRef::from_raw(Key::new(key).persisted_bytes());
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(&kref)) {
            Ok(_) => Ok(Status::InsertKeyExists),
            Err(pos) => {
                self.persist_key(key)?;
                entries.insert(pos, (Key::new(key), value));
                Ok(Status::Ok)
            }
        }
    }

    fn search(&self, key: &[u8]) -> Result<(Status, Value)> {
        let entries = self.entries.read().unwrap();
        let kref = KeyRef::from_raw(Key::new(key).persisted_bytes());
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(&kref)) {
            Ok(pos) => Ok((Status::Ok, entries[pos].1)),
            Err(_) => Ok((Status::NotFound, 0)),
        }
    }

    fn update(&self, key: &[u8], value: Value) -> Result<Status> {
        let mut entries = self.entries.write().unwrap();
        let kref = KeyRef::from_raw(Key::new(key).persisted_bytes());
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(&kref)) {
            Ok(pos) => {
                entries[pos].1 = value;
                Ok(Status::Ok)
            }
            Err(_) => Ok(Status::NotFound),
        }
    }

    fn upsert(&self, key: &[u8], value: Value) -> Result<Status> {
        let mut entries = self.entries.write().unwrap();
        let kref = KeyRef::from_raw(Key::new(key).persisted_bytes());
        match entries.binary_search_by(|(k, _)| k.as_ref().cmp(&kref)) {
            Ok(pos) => {
                entries[pos].1 = value;
            }
            Err(pos) => {
                drop(entries);
                self.persist_key(key)?;
                entries = self.entries.write().unwrap();
                let pos = entries
                    .binary_search_by(|(k, _)| k.as_ref().cmp(&kref))
                    .unwrap_or(pos);
                entries.insert(pos, (Key::new(key), value));
            }
        }
        Ok(Status::Ok)
    }

    fn scan_count(&self, start: &[u8], n: usize) -> Result<(Status, Vec<Value>)> {
        let entries = self.entries.read().unwrap();
        let kref = KeyRef::from_raw(Key::new(start).persisted_bytes());
        let pos = entries
            .binary_search_by(|(k, _)| k.as_ref().cmp(&kref))
            .unwrap_or_else(|p| p);
        let values = entries[pos..].iter().take(n).map(|(_, v)| *v).collect();
        Ok((Status::Ok, values))
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<(Status, Vec<Value>)> {
        let entries = self.entries.read().unwrap();
        let start_ref = KeyRef::from_raw(Key::new(start).persisted_bytes());
        let end_ref = KeyRef::from_raw(Key::new(end).persisted_bytes());
        let values = entries
            .iter()
            .filter(|(k, _)| k.as_ref() >= start_ref && k.as_ref() < end_ref)
            .map(|(_, v)| *v)
            .collect();
        Ok((Status::Ok, values))
    }

    fn print(&self) -> String {
        let entries = self.entries.read().unwrap();
        let stats = Stats {
            name: "example",
            n_entries: entries.len(),
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn fresh() -> Example {
        let n = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("pie-example-test-{}-{}", std::process::id(), n));
        let region = PMRegion::create(path, 16 << 20).unwrap();
        let allocator: Arc<dyn Allocator> = Arc::new(PmAllocator::new(region));
        Example::new(allocator, Arc::new(NullBackend))
    }

    #[test]
    fn roundtrip_and_duplicate() {
        let idx = fresh();
        assert_eq!(idx.insert(b"k1", 42).unwrap(), Status::Ok);
        assert_eq!(idx.insert(b"k1", 43).unwrap(), Status::InsertKeyExists);
        assert_eq!(idx.search(b"k1").unwrap(), (Status::Ok, 42));
        assert_eq!(idx.search(b"missing").unwrap().0, Status::NotFound);
    }

    #[test]
    fn update_and_upsert() {
        let idx = fresh();
        assert_eq!(idx.update(b"a", 1).unwrap(), Status::NotFound);
        assert_eq!(idx.upsert(b"a", 1).unwrap(), Status::Ok);
        assert_eq!(idx.upsert(b"a", 2).unwrap(), Status::Ok);
        assert_eq!(idx.search(b"a").unwrap(), (Status::Ok, 2));
    }

    #[test]
    fn ordered_scan() {
        let idx = fresh();
        for i in 0..20u32 {
            idx.insert(&i.to_be_bytes(), i as u64).unwrap();
        }
        let (_, values) = idx.scan(&0u32.to_be_bytes(), &20u32.to_be_bytes()).unwrap();
        assert_eq!(values, (0..20u64).collect::<Vec<_>>());
        let (_, counted) = idx.scan_count(&5u32.to_be_bytes(), 3).unwrap();
        assert_eq!(counted, vec![5, 6, 7]);
    }
}
