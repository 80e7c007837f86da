//! ArrayStore: fixed number of fixed-capacity slots in one mapped file.
//!
//! Slot layout (slot_size = align_up(capacity + 8, 256), big-endian):
//!   [len u32][crc32c u32][payload len bytes][zero pad]
//! len == 0 marks an empty slot. Slot count and capacity are not persisted;
//! reopen with the same parameters.
//!
//! The RwLock guards only open/closed state: data ops take it shared,
//! close() takes it exclusive. Same-slot writers must be serialized by the caller.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::config::PmemConfig;
use crate::consts::{BLOCK_SIZE, SLOT_HDR_SIZE};
use crate::error::{PmemError, Result};
use crate::metrics::{record_array_corrupt_read, record_array_write};
use crate::pmem::{map_file, PersistenceHandle};

/// `align_up(capacity + 8, 256)`.
pub fn slot_size_for(capacity: usize) -> usize {
    let raw = capacity + SLOT_HDR_SIZE;
    let rem = raw % BLOCK_SIZE;
    if rem == 0 {
        raw
    } else {
        raw + BLOCK_SIZE - rem
    }
}

struct StoreState {
    handle: Option<PersistenceHandle>,
    _file: Option<File>,
}

pub struct ArrayStore {
    path: PathBuf,
    slot_count: usize,
    capacity: usize,
    slot_size: usize,
    state: RwLock<StoreState>,
}

impl ArrayStore {
    pub fn open(path: &Path, slot_count: usize, capacity: usize, cfg: &PmemConfig) -> Result<Self> {
        if slot_count == 0 {
            return Err(PmemError::invalid_arg("array store needs at least one slot"));
        }
        if capacity > u32::MAX as usize {
            return Err(PmemError::invalid_arg("slot capacity exceeds u32"));
        }
        let slot_size = slot_size_for(capacity);
        let length = slot_count
            .checked_mul(slot_size)
            .ok_or_else(|| PmemError::invalid_arg("array store size overflows"))?;
        let (file, region) = map_file(path, length, cfg)?;
        let handle = PersistenceHandle::new(region, 0, length, cfg.paranoid_handles)?;
        debug!(
            "array store {}: slots={} capacity={} slot_size={}",
            path.display(),
            slot_count,
            capacity,
            slot_size
        );
        Ok(Self {
            path: path.to_path_buf(),
            slot_count,
            capacity,
            slot_size,
            state: RwLock::new(StoreState {
                handle: Some(handle),
                _file: Some(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Write `data` into `slot`, flushing header + payload.
    pub fn write(&self, slot: usize, data: &[u8]) -> Result<()> {
        self.write_with(slot, data, true)
    }

    /// Write `data` into `slot`; with `force`, flush exactly `8 + data.len()` bytes.
    pub fn write_with(&self, slot: usize, data: &[u8], force: bool) -> Result<()> {
        self.validate_slot(slot)?;
        let st = self.read_open()?;
        self.write_locked(&st, slot, data, force)
    }

    fn write_locked(&self, st: &StoreState, slot: usize, data: &[u8], force: bool) -> Result<()> {
        if data.len() > self.capacity {
            return Err(PmemError::InvalidData(format!(
                "data of size {} too big for slot of size {}",
                data.len(),
                self.capacity
            )));
        }
        let h = handle(st)?;
        let pos = slot * self.slot_size;
        let mut hdr = [0u8; SLOT_HDR_SIZE];
        BigEndian::write_u32(&mut hdr[0..4], data.len() as u32);
        BigEndian::write_u32(&mut hdr[4..8], crc32c::crc32c(data));

        let region = h.region();
        region.write(h.offset() + pos, &hdr)?;
        region.write(h.offset() + pos + SLOT_HDR_SIZE, data)?;
        if force {
            h.persist(pos, SLOT_HDR_SIZE + data.len())?;
        }
        record_array_write();
        trace!("array store: slot {} <- {} bytes", slot, data.len());
        Ok(())
    }

    /// Payload of `slot`, or None when empty or corrupt.
    pub fn read(&self, slot: usize) -> Result<Option<Vec<u8>>> {
        self.validate_slot(slot)?;
        let st = self.read_open()?;
        let h = handle(&st)?;
        let region = h.region();
        let pos = h.offset() + slot * self.slot_size;

        let mut hdr = [0u8; SLOT_HDR_SIZE];
        region.read(pos, &mut hdr)?;
        let len = BigEndian::read_u32(&hdr[0..4]) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > self.capacity {
            record_array_corrupt_read();
            return Ok(None);
        }
        let expected = BigEndian::read_u32(&hdr[4..8]);
        let payload = region.read_vec(pos + SLOT_HDR_SIZE, len)?;
        if crc32c::crc32c(&payload) != expected {
            record_array_corrupt_read();
            trace!("array store: slot {} checksum mismatch", slot);
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// Mark `slot` empty; with `scrub`, overwrite the full capacity with zeros first.
    pub fn clear(&self, slot: usize, scrub: bool) -> Result<()> {
        self.clear_with(slot, scrub, true)
    }

    pub fn clear_with(&self, slot: usize, scrub: bool, force: bool) -> Result<()> {
        self.validate_slot(slot)?;
        let st = self.read_open()?;
        if scrub {
            let zeros = vec![0u8; self.capacity];
            self.write_locked(&st, slot, &zeros, true)?;
        }
        self.write_locked(&st, slot, &[], force)
    }

    /// Unmap. Idempotent; later data operations fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut st = self
            .state
            .write()
            .map_err(|_| PmemError::poisoned("array store"))?;
        if st.handle.take().is_some() {
            st._file = None;
            debug!("array store {}: closed", self.path.display());
        }
        Ok(())
    }

    fn validate_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slot_count {
            return Err(PmemError::invalid_arg(format!(
                "slot {} out of range 0..{}",
                slot, self.slot_count
            )));
        }
        Ok(())
    }

    fn read_open(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        let st = self
            .state
            .read()
            .map_err(|_| PmemError::poisoned("array store"))?;
        if st.handle.is_none() {
            return Err(PmemError::Closed);
        }
        Ok(st)
    }
}

impl Drop for ArrayStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn handle(st: &StoreState) -> Result<&PersistenceHandle> {
    st.handle.as_ref().ok_or(PmemError::Closed)
}
