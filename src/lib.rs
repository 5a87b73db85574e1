//! A pluggable persistent-memory key-value index engine: one logical
//! byte-key to opaque-value map, backed by interchangeable persistent
//! index structures (extendible hashing, a B+-tree, a cache-line hash
//! table, a radix/hash hybrid, and a radix trie), all honoring the
//! same [`index::IndexContract`].
//!
//! Callers normally go through [`scheme::Scheme`], which builds the
//! [`region::PMRegion`]/[`alloc::Allocator`] plumbing for whichever
//! backend a [`config::Config`] selects and forwards the map contract.
//! The individual backends under [`index`] are public for callers who
//! want to construct one directly instead of through `Scheme`.

mod alloc;
mod config;
mod error;
mod index;
mod key;
mod latch;
mod persist;
mod region;
mod scheme;
mod status;

pub use crate::alloc::{Allocator, DramAllocator, PmAllocator};
pub use crate::config::{Config, IndexType, SchemeType};
pub use crate::error::{Error, Result};
pub use crate::index::{IndexContract, Stats, Value};
pub use crate::key::{Key, KeyRef, KeyScratch};
pub use crate::latch::{Latch, SpinLock};
pub use crate::persist::{HardwareBackend, NullBackend, PersistenceBackend};
pub use crate::region::PMRegion;
pub use crate::scheme::Scheme;
pub use crate::status::Status;

pub mod backends {
    //! Direct access to each index backend, for callers that don't want
    //! to go through [`crate::Scheme`]'s configuration layer.
    pub use crate::index::cceh::Cceh;
    pub use crate::index::clht::Clht;
    pub use crate::index::example::Example;
    pub use crate::index::fastfair::FastFair;
    pub use crate::index::rhtree::RHTree;
    pub use crate::index::wort::Wort;
}
