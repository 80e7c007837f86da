//! Shared file mappings with explicit range flush.
//!
//! Два режима:
//! - Sync: `MAP_SHARED_VALIDATE | MAP_SYNC` (Linux DAX). Stores become durable
//!   once the covering cache lines are written back.
//! - Regular: plain shared mapping via memmap2::MmapRaw (page cache + msync).
//!
//! Bit layout on disk does not depend on the mode.
//!
//! MappedRegion hands out raw byte copies only. Callers serialize overlapping
//! writes themselves (log writer lock, heap lock, per-slot ownership).

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::config::MapModePref;
use crate::error::{PmemError, Result};
use crate::metrics::record_persist;

/// Mapping mode actually in effect for a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Sync,
    Regular,
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapMode::Sync => f.write_str("sync"),
            MapMode::Regular => f.write_str("regular"),
        }
    }
}

enum Backing {
    Regular(MmapRaw),
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    Sync { ptr: *mut u8, len: usize },
}

/// A fixed-length byte window over a file.
pub struct MappedRegion {
    backing: Backing,
    len: usize,
    mode: MapMode,
    path: PathBuf,
}

// The region is a plain byte window; concurrent access to disjoint ranges is
// allowed and overlapping access is serialized by the owners.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the first `len` bytes of `file`, trying the modes allowed by `pref` in order.
    pub fn map(file: &File, path: &Path, len: usize, pref: MapModePref) -> Result<Self> {
        if len == 0 {
            return Err(PmemError::invalid_arg("cannot map a zero-length region"));
        }
        let mut last_err: Option<PmemError> = None;
        for mode in pref.candidates() {
            match Self::map_with(file, path, len, *mode) {
                Ok(r) => return Ok(r),
                Err(e) => {
                    if pref == MapModePref::Auto && *mode == MapMode::Sync {
                        warn!(
                            "sync mapping of {} unavailable ({}), falling back to regular mmap",
                            path.display(),
                            e
                        );
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(PmemError::Unsupported("no mapping mode available")))
    }

    /// Map with exactly one mode, no fallback.
    pub fn map_with(file: &File, path: &Path, len: usize, mode: MapMode) -> Result<Self> {
        let backing = match mode {
            MapMode::Regular => {
                let raw = MmapOptions::new().len(len).map_raw(file)?;
                Backing::Regular(raw)
            }
            MapMode::Sync => map_sync(file, len)?,
        };
        debug!("mapped {} bytes of {} ({})", len, path.display(), mode);
        Ok(Self {
            backing,
            len,
            mode,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Regular(m) => m.as_mut_ptr(),
            Backing::Sync { ptr, .. } => *ptr,
        }
    }

    #[inline]
    fn check_range(&self, off: usize, len: usize) -> Result<()> {
        match off.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(PmemError::invalid_arg(format!(
                "range [{}, +{}) outside mapping of {} bytes",
                off, len, self.len
            ))),
        }
    }

    pub fn read(&self, off: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(off, buf.len())?;
        // SAFETY: range checked above; the mapping lives as long as self.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr().add(off), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn read_vec(&self, off: usize, len: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; len];
        self.read(off, &mut v)?;
        Ok(v)
    }

    pub fn write(&self, off: usize, data: &[u8]) -> Result<()> {
        self.check_range(off, data.len())?;
        // SAFETY: range checked above; the mapping is writable and shared.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base_ptr().add(off), data.len());
        }
        Ok(())
    }

    pub fn fill(&self, off: usize, len: usize, byte: u8) -> Result<()> {
        self.check_range(off, len)?;
        // SAFETY: range checked above.
        unsafe {
            std::ptr::write_bytes(self.base_ptr().add(off), byte, len);
        }
        Ok(())
    }

    pub fn read_u32(&self, off: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(off, &mut b)?;
        Ok(BigEndian::read_u32(&b))
    }

    pub fn write_u32(&self, off: usize, v: u32) -> Result<()> {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.write(off, &b)
    }

    /// Write back `[off, off+len)` to the persistence domain.
    pub fn flush(&self, off: usize, len: usize) -> Result<()> {
        self.check_range(off, len)?;
        if len == 0 {
            return Ok(());
        }
        match &self.backing {
            Backing::Regular(m) => m.flush_range(off, len)?,
            Backing::Sync { ptr, .. } => msync_range(*ptr, off, len)?,
        }
        record_persist(len);
        Ok(())
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Backing::Sync { ptr, len } = self.backing {
                // SAFETY: ptr/len came from a successful mmap and are unmapped once.
                unsafe {
                    libc::munmap(ptr as *mut libc::c_void, len);
                }
            }
        }
    }
}

// ----- MAP_SYNC -----

#[cfg(target_os = "linux")]
const MAP_SHARED_VALIDATE: libc::c_int = 0x03;
#[cfg(target_os = "linux")]
const MAP_SYNC: libc::c_int = 0x80000;

#[cfg(target_os = "linux")]
fn map_sync(file: &File, len: usize) -> Result<Backing> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: fd is valid for the duration of the call; result is checked.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            MAP_SHARED_VALIDATE | MAP_SYNC,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PmemError::Io(std::io::Error::last_os_error()));
    }
    Ok(Backing::Sync {
        ptr: ptr as *mut u8,
        len,
    })
}

#[cfg(not(target_os = "linux"))]
fn map_sync(_file: &File, _len: usize) -> Result<Backing> {
    Err(PmemError::Unsupported("MAP_SYNC mappings require Linux"))
}

#[cfg(target_os = "linux")]
fn msync_range(base: *mut u8, off: usize, len: usize) -> Result<()> {
    let page = page_size();
    let start = off - off % page;
    let span = len + (off - start);
    // SAFETY: [start, start+span) lies inside the mapping (range checked by caller,
    // base is page aligned).
    let rc = unsafe { libc::msync(base.add(start) as *mut libc::c_void, span, libc::MS_SYNC) };
    if rc != 0 {
        return Err(PmemError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn msync_range(_base: *mut u8, _off: usize, _len: usize) -> Result<()> {
    Err(PmemError::Unsupported("MAP_SYNC mappings require Linux"))
}

#[cfg(target_os = "linux")]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 {
        4096
    } else {
        v as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn regular_map_read_write_flush() {
        let path = std::env::temp_dir().join(format!("qpm-map-{}", std::process::id()));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();

        let r = MappedRegion::map_with(&file, &path, 4096, MapMode::Regular).unwrap();
        r.write(100, b"hello").unwrap();
        r.write_u32(200, 0xDEADBEEF).unwrap();
        r.flush(100, 104).unwrap();
        assert_eq!(r.read_vec(100, 5).unwrap(), b"hello");
        assert_eq!(r.read_u32(200).unwrap(), 0xDEADBEEF);

        assert!(matches!(
            r.write(4094, b"abc"),
            Err(PmemError::InvalidArgument(_))
        ));
        assert!(matches!(
            r.flush(4000, 200),
            Err(PmemError::InvalidArgument(_))
        ));
        drop(r);
        let _ = std::fs::remove_file(&path);
    }
}
