//! pmem: mapping primitives shared by every store.
//!
//! - mapping.rs: MappedRegion (MAP_SYNC or regular shared mmap) + range flush
//! - handle.rs:  PersistenceHandle (owning Arc of the mapping, window, flush)
//! - util.rs:    DAX probe and factory helpers for channels / array stores

pub mod handle;
pub mod mapping;
pub mod util;

pub use handle::PersistenceHandle;
pub use mapping::{MapMode, MappedRegion};
pub use util::{array_store_for, channel_for, is_pmem_supported_for};

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use log::debug;

use crate::config::PmemConfig;
use crate::error::Result;

/// Open (creating if needed) `path`, grow it to at least `len` bytes and map
/// the first `len` bytes with the configured mode.
pub fn map_file(path: &Path, len: usize, cfg: &PmemConfig) -> Result<(File, Arc<MappedRegion>)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    ensure_len(&file, path, len as u64, cfg.preallocate)?;
    let region = MappedRegion::map(&file, path, len, cfg.map_mode)?;
    Ok((file, Arc::new(region)))
}

/// Grow the file to `len` bytes. Never shrinks.
pub(crate) fn ensure_len(file: &File, path: &Path, len: u64, preallocate: bool) -> Result<()> {
    let cur = file.metadata()?.len();
    if cur >= len {
        return Ok(());
    }
    if preallocate {
        if let Err(e) = file.allocate(len) {
            debug!("preallocate {} to {} failed: {}", path.display(), len, e);
        }
    }
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(())
}
