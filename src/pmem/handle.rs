//! PersistenceHandle: (mapping, offset, length) with range flush.
//!
//! All flushes go through the original MappedRegion (shared via Arc), never
//! through a copy, so writes and flushes observe the same mapping.

use std::fmt;
use std::sync::Arc;

use log::trace;

use super::MappedRegion;
use crate::error::{PmemError, Result};

#[derive(Clone)]
pub struct PersistenceHandle {
    region: Arc<MappedRegion>,
    offset: usize,
    length: usize,
    paranoid: bool,
}

impl PersistenceHandle {
    /// Handle over `[offset, offset+length)` of `region`.
    ///
    /// With `paranoid`, the window must lie inside the mapping; every later
    /// flush is checked against the window as well.
    pub fn new(region: Arc<MappedRegion>, offset: usize, length: usize, paranoid: bool) -> Result<Self> {
        if paranoid {
            let end = offset.checked_add(length);
            if end.map_or(true, |e| e > region.len()) {
                return Err(PmemError::invalid_arg(format!(
                    "handle window [{}, +{}) is not inside mapping of {} bytes",
                    offset,
                    length,
                    region.len()
                )));
            }
        }
        Ok(Self {
            region,
            offset,
            length,
            paranoid,
        })
    }

    /// Handle covering the whole mapping.
    pub fn whole(region: Arc<MappedRegion>, paranoid: bool) -> Self {
        let length = region.len();
        Self {
            region,
            offset: 0,
            length,
            paranoid,
        }
    }

    /// Sub-handle sharing the same mapping; `offset` is relative to this handle.
    pub fn duplicate(&self, offset: usize, length: usize) -> Result<Self> {
        if length > self.length {
            return Err(PmemError::invalid_arg(format!(
                "given length of {} exceeds max of {}",
                length, self.length
            )));
        }
        Self::new(
            Arc::clone(&self.region),
            self.offset + offset,
            length,
            self.paranoid,
        )
    }

    /// Flush `[offset+from, offset+from+length)`.
    pub fn persist(&self, from: usize, length: usize) -> Result<()> {
        if length > self.length {
            return Err(PmemError::invalid_arg(format!(
                "given length of {} exceeds max of {}",
                length, self.length
            )));
        }
        if self.paranoid && from.checked_add(length).map_or(true, |e| e > self.length) {
            return Err(PmemError::invalid_arg(format!(
                "flush [{}, +{}) escapes handle of {} bytes",
                from, length, self.length
            )));
        }
        trace!("persist {:?} from={} length={}", self, from, length);
        self.region.flush(self.offset + from, length)
    }

    /// Flush the entire declared range.
    pub fn persist_all(&self) -> Result<()> {
        self.persist(0, self.length)
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_paranoid(&self) -> bool {
        self.paranoid
    }

    pub fn region(&self) -> &Arc<MappedRegion> {
        &self.region
    }

    /// True when both handles flush through the same mapping instance.
    pub fn same_mapping(&self, other: &PersistenceHandle) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }
}

impl fmt::Debug for PersistenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PersistenceHandle{{{}, offset={}, length={}}}",
            self.region.path().display(),
            self.offset,
            self.length
        )
    }
}
