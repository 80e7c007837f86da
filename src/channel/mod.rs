//! MappedFileChannel: positional byte channel over a fixed-size mapping.
//!
//! Writes are append-only relative to the durable watermark kept in the
//! `<file>.pmem` side file (see metadata.rs) and are durable on return:
//! copy -> flush data -> update watermark -> flush watermark.
//!
//! close() truncates the data file to the watermark (writers only).

pub mod metadata;

pub use metadata::MetadataFile;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, trace};

use crate::config::PmemConfig;
use crate::consts::{META_FILE_EXT, ZERO_CHUNK};
use crate::error::{PmemError, Result};
use crate::metrics::record_channel_write;
use crate::pmem::{map_file, PersistenceHandle};

/// Path of the metadata side file for `data`.
pub fn metadata_path(data: &Path) -> PathBuf {
    let mut s = data.as_os_str().to_os_string();
    s.push(".");
    s.push(META_FILE_EXT);
    PathBuf::from(s)
}

struct ChannelState {
    // None after close.
    handle: Option<PersistenceHandle>,
    file: Option<File>,
    position: usize,
}

pub struct MappedFileChannel {
    path: PathBuf,
    length: usize,
    metadata: MetadataFile,
    state: Mutex<ChannelState>,
}

impl MappedFileChannel {
    /// Writer channel over the first `length` bytes of `path`.
    pub fn open(path: &Path, length: usize, cfg: &PmemConfig) -> Result<Self> {
        Self::open_with(path, length, false, cfg)
    }

    /// Follower view: reads track the writer's watermark, writes fail.
    pub fn open_read_shared(path: &Path, length: usize, cfg: &PmemConfig) -> Result<Self> {
        Self::open_with(path, length, true, cfg)
    }

    pub fn open_with(path: &Path, length: usize, read_shared: bool, cfg: &PmemConfig) -> Result<Self> {
        if length > u32::MAX as usize {
            return Err(PmemError::invalid_arg(format!(
                "channel length {} exceeds the u32 watermark range",
                length
            )));
        }
        let meta_path = metadata_path(path);
        if !path.exists() && meta_path.exists() {
            debug!("removing orphan metadata {}", meta_path.display());
            fs::remove_file(&meta_path)?;
        }

        let (file, region) = map_file(path, length, cfg)?;
        let handle = PersistenceHandle::new(region, 0, length, cfg.paranoid_handles)?;
        let metadata = MetadataFile::open(&meta_path, read_shared, cfg)?;

        debug!(
            "channel {}: length={} watermark={} read_shared={}",
            path.display(),
            length,
            metadata.persisted_length()?,
            read_shared
        );

        Ok(Self {
            path: path.to_path_buf(),
            length,
            metadata,
            state: Mutex::new(ChannelState {
                handle: Some(handle),
                file: Some(file),
                position: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_shared(&self) -> bool {
        self.metadata.is_read_shared()
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .map(|st| st.handle.is_some())
            .unwrap_or(false)
    }

    // ----- read -----

    /// Read at the cursor; advances it. `None` at or past the watermark.
    pub fn read(&self, dst: &mut [u8]) -> Result<Option<usize>> {
        let mut st = self.lock_open()?;
        let pos = st.position;
        let n = self.read_locked(&st, dst, pos)?;
        if let Some(n) = n {
            st.position = pos + n;
        }
        Ok(n)
    }

    /// Positional read; the cursor is left alone.
    pub fn read_at(&self, dst: &mut [u8], pos: u64) -> Result<Option<usize>> {
        let st = self.lock_open()?;
        let pos = self.validate_position(pos)?;
        self.read_locked(&st, dst, pos)
    }

    fn read_locked(&self, st: &ChannelState, dst: &mut [u8], pos: usize) -> Result<Option<usize>> {
        let wm = self.metadata.persisted_length()? as usize;
        if pos >= wm {
            return Ok(None);
        }
        let n = (wm - pos).min(dst.len());
        if n > 0 {
            let h = handle(st)?;
            h.region().read(h.offset() + pos, &mut dst[..n])?;
        }
        Ok(Some(n))
    }

    // ----- write -----

    /// Write at the cursor; advances it by the bytes written.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        let mut st = self.lock_open()?;
        let pos = st.position;
        let n = self.write_locked(&st, src, pos)?;
        st.position = pos + n;
        Ok(n)
    }

    /// Positional write; the cursor is left alone.
    pub fn write_at(&self, src: &[u8], pos: u64) -> Result<usize> {
        let st = self.lock_open()?;
        let pos = self.validate_position(pos)?;
        self.write_locked(&st, src, pos)
    }

    fn write_locked(&self, st: &ChannelState, src: &[u8], pos: usize) -> Result<usize> {
        if self.metadata.is_read_shared() {
            return Err(PmemError::illegal_state(
                "read-shared channels can not be used for writes",
            ));
        }
        let wm = self.metadata.persisted_length()? as usize;
        if pos < wm {
            return Err(PmemError::invalid_arg(format!(
                "write position {} is before tail position {}; can not overwrite existing data",
                pos, wm
            )));
        }
        let n = src.len().min(self.length - pos);
        if n == 0 {
            return Ok(0);
        }
        let h = handle(st)?;
        h.region().write(h.offset() + pos, &src[..n])?;
        h.persist(pos, n)?;
        self.metadata.persist(pos as u32, n as u32)?;
        record_channel_write(n);
        trace!("channel {}: wrote {} bytes at {}", self.path.display(), n, pos);
        Ok(n)
    }

    // ----- cursor / sizes -----

    pub fn position(&self) -> Result<u64> {
        Ok(self.lock_open()?.position as u64)
    }

    pub fn set_position(&self, new_position: u64) -> Result<()> {
        let mut st = self.lock_open()?;
        st.position = self.validate_position(new_position)?;
        Ok(())
    }

    /// Declared (mapped) length.
    pub fn size(&self) -> Result<u64> {
        self.lock_open()?;
        Ok(self.length as u64)
    }

    /// Durable watermark.
    pub fn persisted_size(&self) -> Result<u64> {
        let _st = self.lock_open()?;
        Ok(self.metadata.persisted_length()? as u64)
    }

    /// On-disk length of the data file.
    pub fn file_size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Writes are durable on return; nothing to do.
    pub fn force(&self, _meta_data: bool) -> Result<()> {
        self.lock_open()?;
        Ok(())
    }

    // ----- lifecycle -----

    /// Invalidate the watermark first, then scrub the data area.
    pub fn clear(&self) -> Result<()> {
        let mut st = self.lock_open()?;
        self.metadata.clear()?;
        let h = handle(&st)?;
        let mut off = 0usize;
        while off < self.length {
            let n = ZERO_CHUNK.min(self.length - off);
            h.region().fill(h.offset() + off, n, 0)?;
            off += n;
        }
        h.persist(0, self.length)?;
        st.position = 0;
        info!("channel {}: cleared", self.path.display());
        Ok(())
    }

    /// Unmap, truncate to the watermark (writers), close metadata. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| PmemError::poisoned("channel"))?;
        if st.handle.is_none() {
            return Ok(());
        }
        let wm = self.metadata.persisted_length()? as u64;
        st.handle = None;
        let truncated = match st.file.take() {
            Some(file) if !self.metadata.is_read_shared() => {
                file.set_len(wm).map_err(PmemError::from)
            }
            _ => Ok(()),
        };
        // metadata is released even if the truncate failed
        let meta_closed = self.metadata.close();
        truncated?;
        meta_closed?;
        debug!("channel {}: closed at watermark {}", self.path.display(), wm);
        Ok(())
    }

    /// Remove the `.pmem` side file. Only valid once closed.
    pub fn delete_metadata(&self) -> Result<()> {
        if self.is_open() {
            return Err(PmemError::illegal_state(
                "unable to delete metadata for an open channel",
            ));
        }
        let p = metadata_path(&self.path);
        if p.exists() {
            fs::remove_file(&p)?;
        }
        Ok(())
    }

    // ----- not provided -----

    pub fn read_vectored(&self, _dsts: &mut [&mut [u8]]) -> Result<usize> {
        Err(PmemError::Unsupported("vectored read"))
    }

    pub fn write_vectored(&self, _srcs: &[&[u8]]) -> Result<usize> {
        Err(PmemError::Unsupported("vectored write"))
    }

    pub fn truncate(&self, _size: u64) -> Result<()> {
        Err(PmemError::Unsupported("truncate"))
    }

    pub fn transfer_to(&self, _position: u64, _count: u64) -> Result<u64> {
        Err(PmemError::Unsupported("transfer_to"))
    }

    pub fn transfer_from(&self, _position: u64, _count: u64) -> Result<u64> {
        Err(PmemError::Unsupported("transfer_from"))
    }

    pub fn map(&self, _position: u64, _size: u64) -> Result<()> {
        Err(PmemError::Unsupported("map"))
    }

    pub fn lock(&self, _position: u64, _size: u64, _shared: bool) -> Result<()> {
        Err(PmemError::Unsupported("file locking"))
    }

    pub fn try_lock(&self, _position: u64, _size: u64, _shared: bool) -> Result<()> {
        Err(PmemError::Unsupported("file locking"))
    }

    // ----- helpers -----

    fn lock_open(&self) -> Result<MutexGuard<'_, ChannelState>> {
        let st = self
            .state
            .lock()
            .map_err(|_| PmemError::poisoned("channel"))?;
        if st.handle.is_none() {
            return Err(PmemError::Closed);
        }
        Ok(st)
    }

    fn validate_position(&self, pos: u64) -> Result<usize> {
        if pos > self.length as u64 {
            return Err(PmemError::invalid_arg(format!(
                "position {} exceeds limit {}",
                pos, self.length
            )));
        }
        Ok(pos as usize)
    }
}

impl std::fmt::Debug for MappedFileChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFileChannel")
            .field("path", &self.path)
            .field("length", &self.length)
            .field("read_shared", &self.is_read_shared())
            .finish()
    }
}

impl Drop for MappedFileChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn handle(st: &ChannelState) -> Result<&PersistenceHandle> {
    st.handle.as_ref().ok_or(PmemError::Closed)
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
        std::env::temp_dir().join(format!("qpm-chan-{}-{}-{}", name, std::process::id(), t))
    }

    #[test]
    fn failed_truncate_still_closes_metadata() {
        let p = tmp("truncate");
        let ch = MappedFileChannel::open(&p, 4096, &cfg()).unwrap();
        ch.write(b"abc").unwrap();
        // set_len on a read-only descriptor fails
        ch.state.lock().unwrap().file = Some(File::open(&p).unwrap());

        assert!(ch.close().is_err());
        assert!(!ch.is_open());
        assert!(!ch.metadata.is_open());
        ch.close().unwrap();
        ch.delete_metadata().unwrap();
        assert!(!metadata_path(&p).exists());
        let _ = fs::remove_file(&p);
    }
}
