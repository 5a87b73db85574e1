//! Latch-and-spin reader/writer coordination.
//!
//! This is the teacher's `Gate`/`RWSpinlock` idiom (see the original
//! `gate.rs`/`spinlock.rs`), generalized into the one primitive every
//! index backend builds its concurrency control from: CCEH's segment
//! and directory `sema`, RHTree's leaf reader-count-plus-split-flag,
//! and CLHT's bucket spinlock are all instances of the same counter
//! discipline (see `SPEC_FULL.md` §4.4 / §9).
//!
//! Encoding, in one `AtomicU64`:
//! - bits [0..61]: active-reader count
//! - bit 62: latch flag (a writer is attempting to drain readers)
//! - bit 63: lock flag (a writer currently holds exclusive access)
//!
//! All operations use `Ordering::Relaxed`/`Ordering::AcqRel` as the
//! teacher's gate does; the latch itself provides no memory ordering
//! for the protected data, callers pair it with `crate::persist`
//! flush/fence calls at their own visibility boundaries.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct Latch(AtomicU64);

impl Latch {
    const LATCH_FLAG: u64 = 0x4000_0000_0000_0000;
    const LOCK_FLAG: u64 = 0x8000_0000_0000_0000;
    const LATCH_LOCK_FLAG: u64 = 0xC000_0000_0000_0000;
    const READERS_MASK: u64 = 0x3FFF_FFFF_FFFF_FFFF;

    pub fn new() -> Latch {
        Latch(AtomicU64::new(0))
    }

    /// Acquire shared (reader) access, spinning while a writer holds or
    /// is draining for the latch.
    pub fn acquire_read(&self) -> ReadGuard<'_> {
        loop {
            let c = self.0.load(Ordering::Relaxed);
            if (c & Self::LATCH_LOCK_FLAG) != 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .0
                .compare_exchange_weak(c, c + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break ReadGuard { latch: self };
            }
        }
    }

    /// Acquire exclusive (writer) access: raise the latch to block new
    /// readers and writers, then spin until all existing readers drain.
    pub fn acquire_write(&self) -> WriteGuard<'_> {
        loop {
            let c = self.0.load(Ordering::Relaxed);
            if (c & Self::LATCH_FLAG) != 0 {
                std::thread::yield_now();
                continue;
            }
            debug_assert!(
                (c & Self::LOCK_FLAG) == 0,
                "lock set while latch was clear"
            );
            if self
                .0
                .compare_exchange_weak(c, c | Self::LATCH_FLAG, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        loop {
            let c = self.0.load(Ordering::Relaxed);
            if (c & Self::READERS_MASK) > 0 {
                std::thread::yield_now();
                continue;
            }
            match self.0.compare_exchange_weak(
                c,
                c | Self::LOCK_FLAG,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break WriteGuard { latch: self },
                Err(_) => continue,
            }
        }
    }

    /// Non-blocking attempt at exclusive access, used by split/resize
    /// paths that coordinate via a separate atomic flag (e.g. RHTree's
    /// per-leaf `split_flag`) and only need a single try.
    pub fn try_acquire_write(&self) -> Option<WriteGuard<'_>> {
        let c = self.0.load(Ordering::Relaxed);
        if c != 0 {
            return None;
        }
        self.0
            .compare_exchange(0, Self::LATCH_LOCK_FLAG, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| WriteGuard { latch: self })
    }

    pub fn reader_count(&self) -> u64 {
        self.0.load(Ordering::Relaxed) & Self::READERS_MASK
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

pub struct ReadGuard<'a> {
    latch: &'a Latch,
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.latch.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WriteGuard<'a> {
    latch: &'a Latch,
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        let c = self.latch.0.load(Ordering::Relaxed);
        debug_assert!(
            (c & Latch::READERS_MASK) == 0,
            "readers appeared while latch was write-locked"
        );
        self.latch.0.store(0, Ordering::Release);
    }
}

/// A one-byte spinlock, used where a full `Latch` is overkill: CLHT's
/// per-bucket lock is exactly this in the original source.
pub struct SpinLock(std::sync::atomic::AtomicBool);

impl SpinLock {
    pub fn new() -> SpinLock {
        SpinLock(std::sync::atomic::AtomicBool::new(false))
    }

    pub fn lock(&self) -> SpinLockGuard<'_> {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        SpinLock::new()
    }
}

pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl<'a> Drop for SpinLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_concur_writer_excludes() {
        let latch = Arc::new(Latch::new());
        let r1 = latch.acquire_read();
        let r2 = latch.acquire_read();
        assert_eq!(latch.reader_count(), 2);
        drop(r1);
        drop(r2);
        let w = latch.acquire_write();
        drop(w);
    }

    #[test]
    fn spinlock_excludes_concurrent_holders() {
        let lock = Arc::new(SpinLock::new());
        let l2 = lock.clone();
        let g = lock.lock();
        assert!(l2.try_lock().is_none());
        drop(g);
        assert!(l2.try_lock().is_some());
    }

    #[test]
    fn many_threads_increment_under_write_lock() {
        let latch = Arc::new(Latch::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = latch.acquire_write();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
