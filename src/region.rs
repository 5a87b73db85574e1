//! Maps a backing file into the process address space and exposes its
//! raw base pointer and length. Grounded on the teacher's
//! `file_lock.rs` wrapper around raw OS primitives: a small safe type
//! around something inherently unsafe, rather than exposing the raw
//! mapping everywhere.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// `MAP_SHARED_VALIDATE` (Linux-only; not in every `libc` target's
/// constant set, so named here from its raw value).
#[cfg(target_os = "linux")]
const MAP_SHARED_VALIDATE: i32 = 0x03;
/// `MAP_SYNC`, the flag that makes a `mmap` fail outright unless the
/// backing file sits on a DAX-capable filesystem and the mapping can
/// bypass the page cache for synchronous persistence.
#[cfg(target_os = "linux")]
const MAP_SYNC: i32 = 0x08_0000;

/// Advisory-only: probes whether `path` can be mapped `MAP_SYNC`, i.e.
/// sits on real persistent memory, and logs the result. Never fails
/// `PMRegion::create` on a negative result — most development and CI
/// hosts have no DAX filesystem at all, and the engine is still
/// correct (just not crash-consistent on power loss) when falling
/// back to an ordinary `MAP_SHARED` mapping, which is what `memmap2`
/// gives us regardless of this probe's outcome.
#[cfg(target_os = "linux")]
fn probe_dax_capable(file: &std::fs::File, len: usize) {
    use std::os::unix::io::AsRawFd;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            MAP_SHARED_VALIDATE | MAP_SYNC,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        log::debug!(
            "region: MAP_SYNC probe failed (errno {}); backing store is not DAX-capable, falling back to page-cache-backed mmap",
            std::io::Error::last_os_error()
        );
    } else {
        log::info!("region: backing store supports MAP_SYNC (DAX-capable)");
        unsafe {
            libc::munmap(ptr, len);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_dax_capable(_file: &std::fs::File, _len: usize) {}

/// A single contiguous persistent-memory-backed region.
///
/// Construction creates (or truncates-and-reuses) the backing file at
/// `path`, sizes it to `size` bytes, and memory-maps it `MAP_SHARED`
/// so writes are visible to any other process mapping the same file
/// and survive this process's exit.
pub struct PMRegion {
    path: PathBuf,
    mmap: MmapMut,
}

impl PMRegion {
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<PMRegion> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        probe_dax_capable(&file, size);

        // SAFETY: the file was just opened by this process with an
        // exclusive intent to map it; no other code holds a reference
        // to its contents concurrently with this mapping's creation.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() != size {
            log::error!("region: mapping {:?} came back {} bytes, expected {}", path, mmap.len(), size);
            return Err(Error::NotPersistent(path));
        }
        log::debug!("region: mapped {:?} ({} bytes)", path, size);
        Ok(PMRegion { path, mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_size() {
        let dir = std::env::temp_dir().join(format!("pie-region-test-{}", std::process::id()));
        let region = PMRegion::create(&dir, 4096).unwrap();
        assert_eq!(region.len(), 4096);
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn base_ptr_is_writable() {
        let dir = std::env::temp_dir().join(format!("pie-region-test-w-{}", std::process::id()));
        let mut region = PMRegion::create(&dir, 4096).unwrap();
        region.as_mut_slice()[0] = 0xAB;
        assert_eq!(region.as_slice()[0], 0xAB);
        let _ = std::fs::remove_file(&dir);
    }
}
