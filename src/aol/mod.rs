//! aol: AppendOnlyLog, variable-length records over a mapped window.
//!
//! Window layout (big-endian):
//!   [0..8)   magic "TRBAOL01"
//!   [8..12)  padding size (4 or 256)
//!   [12..16) checkpoint (tail position, 0 = none)
//!   [16..20) linear ordering (1/0)
//!   [20..)   records (see record.rs)
//!
//! Порядок записи:
//! - header {len, crc} and payload land under the writer lock;
//! - strict ordering flushes the whole record under the lock;
//! - relaxed ordering flushes the first cache line (header + leading payload)
//!   under the lock and copies/flushes the rest after releasing it.
//! Either way the payload is durable before put returns.
//!
//! The header's padding/ordering win over the requested config until clear().

pub mod config;
pub mod iter;
pub(crate) mod record;

pub use config::LogConfig;
pub use iter::{CopyingIter, Iter, RecordView};

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};

use crate::config::PmemConfig;
use crate::consts::{
    BLOCK_SIZE, CACHE_LINE_SIZE, INT_SIZE, LOG_FIRST_RECORD, LOG_HDR_SIZE, LOG_MAGIC,
    LOG_OFF_CHECKPOINT, LOG_OFF_LINEAR, LOG_OFF_MAGIC, LOG_OFF_PADDING, LOG_REC_HDR_SIZE,
    ZERO_CHUNK,
};
use crate::error::{PmemError, Result};
use crate::metrics::{record_log_append, record_log_clear, record_log_overflow};
use crate::pmem::{map_file, MappedRegion, PersistenceHandle};

use config::align_pad;
use record::{encode_header, padded_end, read_at, read_u32_at, scan_from, write_at};

pub(crate) struct LogState {
    pub(crate) handle: Option<PersistenceHandle>,
    file: Option<File>,
    pub(crate) position: usize,
    pub(crate) padding: usize,
    pub(crate) linear: bool,
    pub(crate) epoch: u64,
}

impl LogState {
    pub(crate) fn handle(&self) -> Result<&PersistenceHandle> {
        self.handle.as_ref().ok_or(PmemError::Closed)
    }
}

pub struct AppendOnlyLog {
    path: Option<PathBuf>,
    length: usize,
    requested: LogConfig,
    state: Mutex<LogState>,
}

impl AppendOnlyLog {
    /// Log over `[offset, offset+length)` of `region`.
    pub fn new(
        region: Arc<MappedRegion>,
        offset: usize,
        length: usize,
        block_padding: bool,
        linear_ordering: bool,
    ) -> Result<Self> {
        Self::with_config(
            region,
            offset,
            length,
            LogConfig::new(block_padding, linear_ordering),
            false,
        )
    }

    pub fn with_config(
        region: Arc<MappedRegion>,
        offset: usize,
        length: usize,
        cfg: LogConfig,
        paranoid: bool,
    ) -> Result<Self> {
        cfg.validate()?;
        if length <= LOG_HDR_SIZE + LOG_REC_HDR_SIZE {
            return Err(PmemError::invalid_arg(format!(
                "log window of {} bytes is too small",
                length
            )));
        }
        if length > u32::MAX as usize {
            return Err(PmemError::invalid_arg(format!(
                "log window of {} bytes exceeds the u32 position range",
                length
            )));
        }
        let handle = PersistenceHandle::new(region, offset, length, paranoid)?;
        let log = Self {
            path: None,
            length,
            requested: cfg,
            state: Mutex::new(LogState {
                handle: Some(handle),
                file: None,
                position: LOG_FIRST_RECORD,
                padding: cfg.padding_size(),
                linear: cfg.linear_ordering,
                epoch: 0,
            }),
        };
        log.open_existing_or_clear()?;
        Ok(log)
    }

    /// Map `path` (created/grown to `length`) and open a log over all of it.
    pub fn open_file(path: &Path, length: usize, cfg: LogConfig, pcfg: &PmemConfig) -> Result<Self> {
        let (file, region) = map_file(path, length, pcfg)?;
        let mut log = Self::with_config(region, 0, length, cfg, pcfg.paranoid_handles)?;
        log.path = Some(path.to_path_buf());
        log.lock_state()?.file = Some(file);
        Ok(log)
    }

    fn open_existing_or_clear(&self) -> Result<()> {
        let mut st = self.lock_state()?;
        let h = st.handle()?.clone();

        let mut magic = [0u8; 8];
        read_at(&h, LOG_OFF_MAGIC, &mut magic)?;
        let padding = read_u32_at(&h, LOG_OFF_PADDING)? as usize;
        if &magic == LOG_MAGIC && (padding == INT_SIZE || padding == BLOCK_SIZE) {
            st.padding = padding;
            st.linear = read_u32_at(&h, LOG_OFF_LINEAR)? == 1;
            self.recover_locked(&mut st, &h)?;
            debug!(
                "log {}: recovered, padding={} linear={} tail={}",
                self.name(),
                st.padding,
                st.linear,
                st.position
            );
        } else {
            debug!("log {}: no valid header, initializing", self.name());
            self.clear_locked(&mut st, &h)?;
        }
        Ok(())
    }

    fn recover_locked(&self, st: &mut LogState, h: &PersistenceHandle) -> Result<()> {
        let start = self.checkpoint_start(h)?;
        if self.requested.authoritative_checkpoint_on_reads && start != LOG_FIRST_RECORD {
            st.position = start;
            return Ok(());
        }
        let mut pos = start;
        let mut n = 0usize;
        while let Some(rec) = scan_from(h, st.padding, st.linear, pos, self.length)? {
            pos = rec.next;
            n += 1;
        }
        st.position = pos;
        trace!("log {}: scanned {} records from {}", self.name(), n, start);
        Ok(())
    }

    /// Stored checkpoint if it is usable, else the first record offset.
    fn checkpoint_start(&self, h: &PersistenceHandle) -> Result<usize> {
        let cp = read_u32_at(h, LOG_OFF_CHECKPOINT)? as usize;
        if cp >= LOG_FIRST_RECORD && cp <= self.length {
            Ok(cp)
        } else {
            if cp != 0 {
                warn!("log {}: ignoring out-of-range checkpoint {}", self.name(), cp);
            }
            Ok(LOG_FIRST_RECORD)
        }
    }

    fn write_header(&self, h: &PersistenceHandle, padding: usize, linear: bool) -> Result<()> {
        let mut hdr = [0u8; LOG_HDR_SIZE];
        hdr[LOG_OFF_MAGIC..LOG_OFF_MAGIC + 8].copy_from_slice(LOG_MAGIC);
        BigEndian::write_u32(&mut hdr[LOG_OFF_PADDING..LOG_OFF_PADDING + 4], padding as u32);
        BigEndian::write_u32(&mut hdr[LOG_OFF_LINEAR..LOG_OFF_LINEAR + 4], linear as u32);
        write_at(h, 0, &hdr)?;
        h.persist(0, LOG_HDR_SIZE)
    }

    fn clear_locked(&self, st: &mut LogState, h: &PersistenceHandle) -> Result<()> {
        self.write_header(h, st.padding, st.linear)?;

        let mut off = 0usize;
        while off < self.length {
            let n = ZERO_CHUNK.min(self.length - off);
            h.region().fill(h.offset() + off, n, 0)?;
            off += n;
        }
        h.persist(0, self.length)?;

        st.padding = self.requested.padding_size();
        st.linear = self.requested.linear_ordering;
        self.write_header(h, st.padding, st.linear)?;
        st.position = LOG_FIRST_RECORD;
        st.epoch += 1;
        Ok(())
    }

    // ----- append -----

    /// Append `data`; `None` if it is empty or does not fit.
    pub fn try_put(&self, data: &[u8]) -> Result<Option<usize>> {
        if data.is_empty() {
            return Ok(None);
        }
        let len = data.len();
        let crc = crc32c::crc32c(data);

        let mut st = self.lock_state()?;
        if !can_accept_in(&st, self.length, len) {
            record_log_overflow();
            trace!("log {}: no room for {} bytes", self.name(), len);
            return Ok(None);
        }
        let h = st.handle()?.clone();

        let start = st.position;
        let payload_start = start + LOG_REC_HDR_SIZE;
        write_at(&h, start, &encode_header(len as u32, crc))?;
        let end = padded_end(payload_start + len, st.padding, self.length);
        let record_len = end - start;
        st.position = end;

        let lead = payload_start % CACHE_LINE_SIZE;
        let front_capacity = if lead == 0 { 0 } else { CACHE_LINE_SIZE - lead };
        let deferred = !st.linear && front_capacity != 0 && front_capacity < len;

        if deferred {
            write_at(&h, payload_start, &data[..front_capacity])?;
            h.persist(start, LOG_REC_HDR_SIZE + front_capacity)?;
        } else {
            write_at(&h, payload_start, data)?;
            h.persist(start, record_len)?;
        }

        if self.requested.always_checkpoint {
            self.store_checkpoint(&h, st.position)?;
        }
        drop(st);

        if deferred {
            let front = LOG_REC_HDR_SIZE + front_capacity;
            write_at(&h, payload_start + front_capacity, &data[front_capacity..])?;
            h.persist(start + front, record_len - front)?;
        }

        record_log_append(record_len, deferred);
        Ok(Some(start))
    }

    /// Append `data` and return its location.
    ///
    /// Empty input is `InvalidArgument`; insufficient space is `Overflow`.
    pub fn put(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(PmemError::invalid_arg("zero-length records are not allowed"));
        }
        self.try_put(data)?.ok_or(PmemError::Overflow)
    }

    // ----- reads -----

    /// Payload of the record starting at `location`.
    pub fn read_record_at(&self, location: usize) -> Result<Vec<u8>> {
        let st = self.lock_state()?;
        let h = st.handle()?;
        if location < LOG_FIRST_RECORD
            || location > self.length
            || self.length - location < LOG_REC_HDR_SIZE
        {
            return Err(PmemError::invalid_arg(format!(
                "invalid record location {}",
                location
            )));
        }
        let len = read_u32_at(h, location)? as usize;
        let expected = read_u32_at(h, location + 4)?;
        let payload = location + LOG_REC_HDR_SIZE;
        if len > self.length - payload {
            return Err(PmemError::invalid_arg(format!(
                "record at {} claims {} bytes past the end of the log",
                location, len
            )));
        }
        let mut buf = vec![0u8; len];
        read_at(h, payload, &mut buf)?;
        if crc32c::crc32c(&buf) != expected {
            return Err(PmemError::InvalidData(format!(
                "invalid checksum for record at {}",
                location
            )));
        }
        Ok(buf)
    }

    /// Iterator of views into the log. Views fail once the log is cleared.
    pub fn iter(&self) -> Result<Iter<'_>> {
        Iter::new(self)
    }

    /// Iterator that copies each payload as it goes.
    pub fn copying_iter(&self) -> Result<CopyingIter<'_>> {
        Ok(CopyingIter::new(Iter::new(self)?))
    }

    /// All payloads, copied.
    pub fn records(&self) -> Result<Vec<Vec<u8>>> {
        self.copying_iter()?.collect()
    }

    // ----- checkpoint / clear -----

    /// Store the current tail into the header checkpoint and flush the header.
    pub fn checkpoint(&self) -> Result<()> {
        let st = self.lock_state()?;
        let h = st.handle()?;
        self.store_checkpoint(h, st.position)?;
        debug!("log {}: checkpoint at {}", self.name(), st.position);
        Ok(())
    }

    fn store_checkpoint(&self, h: &PersistenceHandle, pos: usize) -> Result<()> {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, pos as u32);
        write_at(h, LOG_OFF_CHECKPOINT, &b)?;
        h.persist(LOG_OFF_MAGIC, LOG_HDR_SIZE)
    }

    /// Stored checkpoint value (0 if none).
    pub fn stored_checkpoint(&self) -> Result<usize> {
        let st = self.lock_state()?;
        Ok(read_u32_at(st.handle()?, LOG_OFF_CHECKPOINT)? as usize)
    }

    /// Reinitialize with the requested config; live iterators become invalid.
    pub fn clear(&self) -> Result<()> {
        let mut st = self.lock_state()?;
        let h = st.handle()?.clone();
        self.clear_locked(&mut st, &h)?;
        record_log_clear();
        info!(
            "log {}: cleared (padding={}, linear={}, epoch={})",
            self.name(),
            st.padding,
            st.linear,
            st.epoch
        );
        Ok(())
    }

    /// Release the mapping. Idempotent; later operations fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| PmemError::poisoned("log"))?;
        if st.handle.take().is_some() {
            st.file = None;
            debug!("log {}: closed", self.name());
        }
        Ok(())
    }

    // ----- accounting -----

    pub fn remaining(&self) -> Result<usize> {
        let st = self.lock_state()?;
        Ok(self.length - st.position)
    }

    pub fn can_accept(&self, len: usize) -> Result<bool> {
        let st = self.lock_state()?;
        Ok(can_accept_in(&st, self.length, len))
    }

    /// Current tail position.
    pub fn position(&self) -> Result<usize> {
        Ok(self.lock_state()?.position)
    }

    pub fn len_bytes(&self) -> usize {
        self.length
    }

    pub fn is_effective_padding(&self) -> Result<bool> {
        Ok(self.lock_state()?.padding == BLOCK_SIZE)
    }

    pub fn is_requested_padding(&self) -> bool {
        self.requested.block_padding
    }

    pub fn is_effective_linear_ordering(&self) -> Result<bool> {
        Ok(self.lock_state()?.linear)
    }

    pub fn is_requested_linear_ordering(&self) -> bool {
        self.requested.linear_ordering
    }

    pub fn config(&self) -> LogConfig {
        self.requested
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ----- internals -----

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, LogState>> {
        let st = self
            .state
            .lock()
            .map_err(|_| PmemError::poisoned("log"))?;
        if st.handle.is_none() {
            return Err(PmemError::Closed);
        }
        Ok(st)
    }

    /// Iteration limit: the checkpoint when it is authoritative, else the window end.
    pub(crate) fn read_limit(&self, st: &LogState) -> Result<usize> {
        if self.requested.authoritative_checkpoint_on_reads {
            let cp = self.checkpoint_start(st.handle()?)?;
            if cp != LOG_FIRST_RECORD {
                return Ok(cp);
            }
        }
        Ok(self.length)
    }

    pub(crate) fn name(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => "<region>".to_string(),
        }
    }
}

impl Drop for AppendOnlyLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn can_accept_in(st: &LogState, length: usize, len: usize) -> bool {
    let need = len + LOG_REC_HDR_SIZE + align_pad(len, st.padding);
    length - st.position >= need
}
