//! DAX probe and factory helpers.
//!
//! The only reliable way to learn whether a directory sits on a DAX mount is
//! to try a MAP_SYNC mapping. The probe uses a temporary file in that
//! directory so a failed map never grows or shrinks a real data file.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace};

use crate::array_store::ArrayStore;
use crate::channel::{MappedFileChannel, MetadataFile};
use crate::config::{MapModePref, PmemConfig};
use crate::error::{PmemError, Result};

static PROBE_SEQ: AtomicU64 = AtomicU64::new(0);

fn probe_file_in(dir: &Path) -> Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    loop {
        let seq = PROBE_SEQ.fetch_add(1, Ordering::Relaxed);
        let p = dir.join(format!(
            "isPmemSupportedFor-{}-{}-{}",
            std::process::id(),
            nanos,
            seq
        ));
        match OpenOptions::new().write(true).create_new(true).open(&p) {
            Ok(_) => return Ok(p),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// True if a MAP_SYNC mapping succeeds for a file in `dir`.
///
/// InvalidArgument if `dir` is missing or not a directory.
pub fn is_pmem_supported_for(dir: &Path) -> Result<bool> {
    trace!("entry with dir={}", dir.display());
    if !dir.exists() {
        return Err(PmemError::invalid_arg(format!(
            "the directory {} must exist",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(PmemError::invalid_arg(format!(
            "{} must be a directory",
            dir.display()
        )));
    }

    let probe = match probe_file_in(dir) {
        Ok(p) => p,
        Err(e) => {
            debug!("cannot create probe file in {}: {}", dir.display(), e);
            return Ok(false);
        }
    };
    let cfg = PmemConfig::default()
        .with_map_mode(MapModePref::Sync)
        .with_preallocate(false);
    let supported = match MetadataFile::open(&probe, false, &cfg) {
        Ok(meta) => {
            let closed = meta.close();
            closed.is_ok()
        }
        Err(e) => {
            debug!("mmap failed for path {}: {}", dir.display(), e);
            false
        }
    };
    if let Err(e) = fs::remove_file(&probe) {
        debug!("removing probe {}: {}", probe.display(), e);
    }
    trace!("exit returning {}", supported);
    Ok(supported)
}

fn parent_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// With a `Sync` map mode: false when the file's directory is not on DAX.
fn sync_unavailable(file: &Path, cfg: &PmemConfig) -> Result<bool> {
    Ok(cfg.map_mode == MapModePref::Sync && !is_pmem_supported_for(&parent_dir(file))?)
}

/// Open a channel over `file`.
///
/// `Ok(None)` if the configuration demands a synchronous mapping and the
/// directory does not support one. Without `create`, a missing file is an
/// I/O NotFound error. If opening fails for a file this call created, the
/// file is removed again.
pub fn channel_for(
    file: &Path,
    length: usize,
    create: bool,
    read_shared: bool,
    cfg: &PmemConfig,
) -> Result<Option<MappedFileChannel>> {
    if sync_unavailable(file, cfg)? {
        return Ok(None);
    }
    let existed = file.exists();
    if !create && !existed {
        return Err(PmemError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            file.display().to_string(),
        )));
    }
    match MappedFileChannel::open_with(file, length, read_shared, cfg) {
        Ok(ch) => Ok(Some(ch)),
        Err(e) => {
            if create && !existed {
                let _ = fs::remove_file(file);
            }
            Err(e)
        }
    }
}

/// Open an array store over `file`; `Ok(None)` as for `channel_for`.
pub fn array_store_for(
    file: &Path,
    slot_count: usize,
    slot_capacity: usize,
    cfg: &PmemConfig,
) -> Result<Option<ArrayStore>> {
    if sync_unavailable(file, cfg)? {
        return Ok(None);
    }
    ArrayStore::open(file, slot_count, slot_capacity, cfg).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("qpm-util-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&p);
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn probe_rejects_missing_and_non_dirs() {
        let d = scratch("probe-args");
        assert!(matches!(
            is_pmem_supported_for(&d.join("nope")),
            Err(PmemError::InvalidArgument(_))
        ));
        let f = d.join("plain");
        fs::write(&f, b"x").unwrap();
        assert!(matches!(
            is_pmem_supported_for(&f),
            Err(PmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn probe_leaves_no_files_behind() {
        let d = scratch("probe-clean");
        let _ = is_pmem_supported_for(&d).unwrap();
        assert_eq!(fs::read_dir(&d).unwrap().count(), 0);
    }

    #[test]
    fn channel_for_without_create_needs_existing_file() {
        let d = scratch("channel-for");
        let cfg = PmemConfig::default().with_map_mode(MapModePref::Regular);
        let err = channel_for(&d.join("missing"), 1024, false, false, &cfg).unwrap_err();
        assert!(matches!(err, PmemError::Io(ref e) if e.kind() == ErrorKind::NotFound));

        let ch = channel_for(&d.join("data"), 1024, true, false, &cfg)
            .unwrap()
            .unwrap();
        assert_eq!(ch.write(b"ab").unwrap(), 2);
        ch.close().unwrap();
    }
}
