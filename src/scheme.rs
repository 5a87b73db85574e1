//! The façade that turns a [`Config`] into a running index, the same
//! role the teacher's `src/index.rs` plays in dispatching between
//! `Llrb`/`Robt` variants of its own `Index<K, V, B>` enum (`SPEC_FULL.md`
//! §4.9). `Scheme` owns the backing [`PMRegion`]/[`Allocator`] and
//! forwards every [`IndexContract`] call to whichever backend was
//! selected.

use std::sync::Arc;

use crate::alloc::{Allocator, DramAllocator, PmAllocator};
use crate::config::{Config, IndexType, SchemeType};
use crate::error::{Error, Result};
use crate::index::cceh::Cceh;
use crate::index::clht::Clht;
use crate::index::example::Example;
use crate::index::fastfair::FastFair;
use crate::index::rhtree::RHTree;
use crate::index::wort::Wort;
use crate::index::IndexContract;
use crate::persist::{HardwareBackend, PersistenceBackend};
use crate::region::PMRegion;
use crate::status::Status;

enum Backend {
    Example(Example),
    Cceh(Cceh),
    FastFair(FastFair),
    Clht(Clht),
    RHTree(RHTree),
    Wort(Wort),
}

impl Backend {
    fn as_contract(&self) -> &dyn IndexContract {
        match self {
            Backend::Example(b) => b,
            Backend::Cceh(b) => b,
            Backend::FastFair(b) => b,
            Backend::Clht(b) => b,
            Backend::RHTree(b) => b,
            Backend::Wort(b) => b,
        }
    }
}

/// Constructs the PM region, allocator(s) and chosen index backend from
/// a [`Config`], then exposes the map contract to callers.
pub struct Scheme {
    backend: Backend,
}

impl Scheme {
    pub fn new(config: &Config) -> Result<Scheme> {
        config.validate()?;
        if config.scheme_type != SchemeType::Single {
            return Err(Error::InvalidConfig(
                "scheme_type::Hybrid is not implemented (SPEC_FULL.md §6)".into(),
            ));
        }
        log::debug!(
            "scheme: opening {:?} ({} bytes) for index_type={:?}",
            config.pmem_file_path,
            config.pmem_file_size,
            config.index_type
        );

        let region = PMRegion::create(&config.pmem_file_path, config.pmem_file_size)?;
        let allocator: Arc<dyn Allocator> = Arc::new(PmAllocator::new(region));
        let persist: Arc<dyn PersistenceBackend> = Arc::new(HardwareBackend::new());

        let backend = match config.index_type {
            IndexType::Example => Backend::Example(Example::new(allocator, persist)),
            IndexType::Cceh => Backend::Cceh(Cceh::new(
                allocator,
                persist,
                config.cceh_initial_depth,
                config.cceh_segment_slots,
            )),
            IndexType::FastFair => Backend::FastFair(FastFair::new(persist, config.fastfair_page_size)),
            IndexType::Clht => Backend::Clht(Clht::new(
                allocator,
                persist,
                config.clht_initial_buckets,
                config.clht_perc_full_double,
            )),
            IndexType::RHTree => {
                // RHTree's internal routing nodes are volatile DRAM
                // structures (`SPEC_FULL.md` §4.9); its leaves still go
                // through the PM allocator passed in here.
                let _dram: Arc<dyn Allocator> = Arc::new(DramAllocator::new());
                Backend::RHTree(RHTree::new(
                    allocator,
                    persist,
                    config.rhtree_leaf_buckets,
                    config.rhtree_bucket_slots,
                ))
            }
            IndexType::Wort => Backend::Wort(Wort::new(allocator, persist)),
        };

        Ok(Scheme { backend })
    }

    fn contract(&self) -> &dyn IndexContract {
        self.backend.as_contract()
    }
}

impl IndexContract for Scheme {
    fn insert(&self, key: &[u8], value: crate::index::Value) -> Result<Status> {
        self.contract().insert(key, value)
    }

    fn search(&self, key: &[u8]) -> Result<(Status, crate::index::Value)> {
        self.contract().search(key)
    }

    fn update(&self, key: &[u8], value: crate::index::Value) -> Result<Status> {
        self.contract().update(key, value)
    }

    fn upsert(&self, key: &[u8], value: crate::index::Value) -> Result<Status> {
        self.contract().upsert(key, value)
    }

    fn scan_count(&self, start: &[u8], n: usize) -> Result<(Status, Vec<crate::index::Value>)> {
        self.contract().scan_count(start, n)
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<(Status, Vec<crate::index::Value>)> {
        self.contract().scan(start, end)
    }

    fn print(&self) -> String {
        self.contract().print()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(index_type: IndexType) -> Config {
        let path = std::env::temp_dir().join(format!(
            "pie-scheme-test-{:?}-{}",
            index_type,
            std::process::id()
        ));
        Config::default()
            .with_index_type(index_type)
            .with_pmem_file_path(path)
            .with_pmem_file_size(16 << 20)
    }

    #[test]
    fn selects_each_backend() {
        for index_type in [
            IndexType::Example,
            IndexType::Cceh,
            IndexType::FastFair,
            IndexType::Clht,
            IndexType::RHTree,
            IndexType::Wort,
        ] {
            let scheme = Scheme::new(&test_config(index_type)).unwrap();
            assert_eq!(scheme.insert(b"k", 7).unwrap(), Status::Ok);
            assert_eq!(scheme.search(b"k").unwrap(), (Status::Ok, 7));
        }
    }

    #[test]
    fn hybrid_scheme_type_is_rejected() {
        let cfg = Config {
            scheme_type: SchemeType::Hybrid,
            ..test_config(IndexType::Cceh)
        };
        assert!(Scheme::new(&cfg).is_err());
    }
}
