//! MetadataFile: 256-byte side file holding the durable watermark of a data file.
//!
//! Layout (big-endian):
//!   [0..8)    magic "TRBMFCM1"
//!   [8..12)   watermark u32 (bytes of valid data in the main file)
//!   [12..256) zero
//!
//! Read-shared followers re-read the watermark on every query and never write.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, trace};

use crate::config::PmemConfig;
use crate::consts::{META_FILE_SIZE, META_MAGIC, META_OFF_WATERMARK};
use crate::error::{PmemError, Result};
use crate::pmem::{map_file, MappedRegion, PersistenceHandle};

struct MetaState {
    // None after close.
    handle: Option<PersistenceHandle>,
    _file: Option<File>,
    watermark: u32,
}

pub struct MetadataFile {
    path: PathBuf,
    read_shared: bool,
    state: Mutex<MetaState>,
}

impl MetadataFile {
    pub fn open(path: &Path, read_shared: bool, cfg: &PmemConfig) -> Result<Self> {
        let (file, region) = map_file(path, META_FILE_SIZE, cfg)?;
        let handle = PersistenceHandle::new(region, 0, META_FILE_SIZE, cfg.paranoid_handles)?;
        let mut st = MetaState {
            handle: Some(handle),
            _file: Some(file),
            watermark: 0,
        };

        let mut magic = [0u8; 8];
        region_of(&st)?.read(0, &mut magic)?;
        if &magic == META_MAGIC {
            let wm = region_of(&st)?.read_u32(META_OFF_WATERMARK)?;
            st.watermark = wm;
            debug!(
                "metadata {}: existing, watermark={}",
                path.display(),
                st.watermark
            );
        } else if read_shared {
            // The writer owns initialization.
            debug!("metadata {}: no magic yet (read-shared)", path.display());
        } else {
            debug!("metadata {}: unknown content, initializing", path.display());
            clear_locked(&mut st)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            read_shared,
            state: Mutex::new(st),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_shared(&self) -> bool {
        self.read_shared
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .map(|st| st.handle.is_some())
            .unwrap_or(false)
    }

    /// Current watermark (re-read from the mapping in read-shared mode).
    pub fn persisted_length(&self) -> Result<u32> {
        let mut st = self.lock()?;
        self.refresh(&mut st)?;
        Ok(st.watermark)
    }

    /// Record that `[from, from+length)` is durable: watermark = from + length.
    pub fn persist(&self, from: u32, length: u32) -> Result<()> {
        let mut st = self.lock()?;
        self.refresh(&mut st)?;
        if self.read_shared {
            return Err(PmemError::illegal_state(
                "read-shared metadata can not be updated",
            ));
        }
        let wm = from
            .checked_add(length)
            .ok_or_else(|| PmemError::invalid_arg("watermark overflows u32"))?;
        st.watermark = wm;
        region_of(&st)?.write_u32(META_OFF_WATERMARK, wm)?;
        handle_of(&st)?.persist(META_OFF_WATERMARK, 4)?;
        trace!("metadata {}: watermark={}", self.path.display(), wm);
        Ok(())
    }

    /// Zero the whole file, then lay down the magic (each step flushed).
    pub fn clear(&self) -> Result<()> {
        let mut st = self.lock()?;
        if st.handle.is_none() {
            return Err(PmemError::Closed);
        }
        if self.read_shared {
            return Err(PmemError::illegal_state(
                "read-shared metadata can not be cleared",
            ));
        }
        clear_locked(&mut st)
    }

    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut st = self.lock()?;
        if st.handle.take().is_some() {
            st._file = None;
            debug!("metadata {}: closed", self.path.display());
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MetaState>> {
        self.state.lock().map_err(|_| PmemError::poisoned("metadata"))
    }

    fn refresh(&self, st: &mut MetaState) -> Result<()> {
        let wm = region_of(st)?.read_u32(META_OFF_WATERMARK)?;
        if self.read_shared {
            st.watermark = wm;
        }
        Ok(())
    }
}

impl Drop for MetadataFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn handle_of(st: &MetaState) -> Result<&PersistenceHandle> {
    st.handle.as_ref().ok_or(PmemError::Closed)
}

fn region_of(st: &MetaState) -> Result<&MappedRegion> {
    Ok(handle_of(st)?.region().as_ref())
}

fn clear_locked(st: &mut MetaState) -> Result<()> {
    let h = handle_of(st)?;
    let region = h.region();
    region.fill(0, META_FILE_SIZE, 0)?;
    h.persist(0, META_FILE_SIZE)?;
    region.write(0, META_MAGIC)?;
    h.persist(0, META_MAGIC.len())?;
    let wm = region.read_u32(META_OFF_WATERMARK)?;
    st.watermark = wm;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MapModePref, PmemConfigBuilder};

    fn cfg() -> PmemConfig {
        PmemConfigBuilder::from_default()
            .map_mode(MapModePref::Regular)
            .build()
    }

    fn tmp(name: &str) -> PathBuf {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("qpm-meta-{}-{}-{}", name, std::process::id(), t))
    }

    #[test]
    fn watermark_survives_reopen() {
        let p = tmp("reopen");
        {
            let m = MetadataFile::open(&p, false, &cfg()).unwrap();
            assert_eq!(m.persisted_length().unwrap(), 0);
            m.persist(10, 6).unwrap();
            assert_eq!(m.persisted_length().unwrap(), 16);
            m.close().unwrap();
            m.close().unwrap();
            assert!(matches!(m.persisted_length(), Err(PmemError::Closed)));
        }
        {
            let m = MetadataFile::open(&p, false, &cfg()).unwrap();
            assert_eq!(m.persisted_length().unwrap(), 16);
            m.clear().unwrap();
            assert_eq!(m.persisted_length().unwrap(), 0);
        }
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn read_shared_follows_writer_and_refuses_writes() {
        let p = tmp("shared");
        let writer = MetadataFile::open(&p, false, &cfg()).unwrap();
        let follower = MetadataFile::open(&p, true, &cfg()).unwrap();
        writer.persist(0, 42).unwrap();
        assert_eq!(follower.persisted_length().unwrap(), 42);
        assert!(matches!(follower.persist(42, 1), Err(PmemError::IllegalState(_))));
        assert!(matches!(follower.clear(), Err(PmemError::IllegalState(_))));
        drop(follower);
        drop(writer);
        let _ = std::fs::remove_file(&p);
    }
}
