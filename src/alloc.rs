//! Bump-pointer allocators over a [`crate::region::PMRegion`], and a
//! DRAM counterpart used for RHTree's volatile routing nodes.
//!
//! Grounded on `original_source/src/include/allocator.hpp`'s
//! `PIENVMAllocator`: a region is split once, at construction, into an
//! unaligned prefix (30%) and an aligned suffix (70%), each growing
//! monotonically via an atomic counter. The allocator never frees
//! (append-only, see `SPEC_FULL.md` §9) — `free` is a documented no-op.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::region::PMRegion;

/// Below this size, allocations are routed to the unaligned arena;
/// at or above it, to the cache-line-aligned arena. Matches the
/// original's choice of the cache-line size as the routing threshold.
pub const ALIGN_THRESHOLD: usize = 64;

pub trait Allocator: Send + Sync {
    /// Allocate `n` bytes, routed to the unaligned or aligned arena by
    /// size.
    fn allocate(&self, n: usize) -> Result<*mut u8>;

    /// Allocate `n` bytes padded up to a multiple of `align` (must be a
    /// power of two), always from the aligned arena.
    fn allocate_aligned(&self, n: usize, align: usize) -> Result<*mut u8>;

    /// No-op: this allocator is append-only and never reclaims space
    /// (see `SPEC_FULL.md` §9, "append-only allocator never frees").
    fn free(&self, _ptr: *mut u8) {}

    fn mem_usage(&self) -> usize;
}

/// Splits a `PMRegion` into a 30% unaligned prefix and a 70% aligned
/// suffix, each with its own atomic bump pointer.
pub struct PmAllocator {
    base: *mut u8,
    unaligned_base: *mut u8,
    unaligned_size: usize,
    unaligned_used: AtomicUsize,
    aligned_base: *mut u8,
    aligned_size: usize,
    aligned_used: AtomicUsize,
    // Keeps the mapping alive for as long as the allocator hands out
    // pointers into it.
    _region: PMRegion,
}

// SAFETY: all mutable access goes through the atomic bump counters;
// distinct allocations never overlap.
unsafe impl Send for PmAllocator {}
unsafe impl Sync for PmAllocator {}

impl PmAllocator {
    pub fn new(region: PMRegion) -> PmAllocator {
        let base = region.base_ptr();
        let total = region.len();
        let unaligned_size = total * 3 / 10;
        let aligned_size = total - unaligned_size;
        // SAFETY: both sub-regions lie within the bounds of `base..base+total`.
        let unaligned_base = base;
        let aligned_base = unsafe { base.add(unaligned_size) };
        PmAllocator {
            base,
            unaligned_base,
            unaligned_size,
            unaligned_used: AtomicUsize::new(0),
            aligned_base,
            aligned_size,
            aligned_used: AtomicUsize::new(0),
            _region: region,
        }
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    fn bump_unaligned(&self, n: usize) -> Result<*mut u8> {
        let prev = self.unaligned_used.fetch_add(n, Ordering::Relaxed);
        if prev + n > self.unaligned_size {
            self.unaligned_used.fetch_sub(n, Ordering::Relaxed);
            log::error!("alloc: pm-unaligned arena exhausted ({} + {} > {})", prev, n, self.unaligned_size);
            return Err(Error::OutOfMemory {
                region: "pm-unaligned",
            });
        }
        log::trace!("alloc: pm-unaligned {} bytes at offset {}", n, prev);
        // SAFETY: `prev + n <= unaligned_size`, so this stays in bounds.
        Ok(unsafe { self.unaligned_base.add(prev) })
    }

    fn bump_aligned(&self, n: usize) -> Result<*mut u8> {
        let prev = self.aligned_used.fetch_add(n, Ordering::Relaxed);
        if prev + n > self.aligned_size {
            self.aligned_used.fetch_sub(n, Ordering::Relaxed);
            log::error!("alloc: pm-aligned arena exhausted ({} + {} > {})", prev, n, self.aligned_size);
            return Err(Error::OutOfMemory {
                region: "pm-aligned",
            });
        }
        log::trace!("alloc: pm-aligned {} bytes at offset {}", n, prev);
        // SAFETY: `prev + n <= aligned_size`, so this stays in bounds.
        Ok(unsafe { self.aligned_base.add(prev) })
    }
}

impl Allocator for PmAllocator {
    fn allocate(&self, n: usize) -> Result<*mut u8> {
        if n >= ALIGN_THRESHOLD {
            self.bump_aligned(n)
        } else {
            self.bump_unaligned(n)
        }
    }

    fn allocate_aligned(&self, n: usize, align: usize) -> Result<*mut u8> {
        debug_assert!(align.is_power_of_two());
        let padded = (n + align - 1) & !(align - 1);
        self.bump_aligned(padded)
    }

    fn mem_usage(&self) -> usize {
        self.unaligned_used.load(Ordering::Relaxed) + self.aligned_used.load(Ordering::Relaxed)
    }
}

/// Ordinary heap allocation behind the same contract, used for
/// RHTree's volatile internal-node arena (`SPEC_FULL.md` §4.1, §4.7).
pub struct DramAllocator {
    used: AtomicUsize,
}

impl DramAllocator {
    pub fn new() -> DramAllocator {
        DramAllocator {
            used: AtomicUsize::new(0),
        }
    }
}

impl Default for DramAllocator {
    fn default() -> Self {
        DramAllocator::new()
    }
}

impl Allocator for DramAllocator {
    fn allocate(&self, n: usize) -> Result<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(n.max(1), 8)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        // SAFETY: layout has non-zero size, result is checked for null.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            log::error!("alloc: dram allocation of {} bytes failed", n);
            return Err(Error::OutOfMemory { region: "dram" });
        }
        self.used.fetch_add(n, Ordering::Relaxed);
        Ok(ptr)
    }

    fn allocate_aligned(&self, n: usize, align: usize) -> Result<*mut u8> {
        debug_assert!(align.is_power_of_two());
        let layout = std::alloc::Layout::from_size_align(n.max(1), align)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            log::error!("alloc: dram aligned allocation of {} bytes (align {}) failed", n, align);
            return Err(Error::OutOfMemory { region: "dram" });
        }
        self.used.fetch_add(n, Ordering::Relaxed);
        Ok(ptr)
    }

    fn mem_usage(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_region(name: &str, size: usize) -> PMRegion {
        let path = std::env::temp_dir().join(format!("pie-alloc-test-{}-{}", name, std::process::id()));
        PMRegion::create(path, size).unwrap()
    }

    #[test]
    fn routes_by_size() {
        let alloc = PmAllocator::new(test_region("route", 1 << 20));
        let small = alloc.allocate(16).unwrap();
        let large = alloc.allocate(128).unwrap();
        assert!(!small.is_null());
        assert!(!large.is_null());
        assert!(alloc.mem_usage() >= 144);
    }

    #[test]
    fn exhaustion_is_recoverable_error() {
        let alloc = PmAllocator::new(test_region("exhaust", 128));
        // unaligned arena is ~38 bytes; first small alloc should fit,
        // enough further allocs should exhaust it.
        let mut failed = false;
        for _ in 0..10 {
            if alloc.allocate(8).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn aligned_allocation_is_padded() {
        let alloc = PmAllocator::new(test_region("aligned", 1 << 20));
        let p1 = alloc.allocate_aligned(1, 64).unwrap();
        let p2 = alloc.allocate_aligned(1, 64).unwrap();
        assert_eq!((p2 as usize) - (p1 as usize), 64);
    }

    #[test]
    fn dram_allocator_tracks_usage() {
        let alloc = DramAllocator::new();
        alloc.allocate(100).unwrap();
        alloc.allocate(50).unwrap();
        assert_eq!(alloc.mem_usage(), 150);
    }
}
