//! RegionBitmap: uniform-size elements inside `[base, base + backing)`.
//!
//! One bit per element (1 = allocated). `next_avail` caches the last freed
//! index so a free/allocate pair reuses the same slot without scanning.
//! Not thread-safe; callers hold the heap lock.

use crate::error::{PmemError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionBitmap {
    pub(crate) base: u64,
    pub(crate) backing_size: u64,
    pub(crate) element_size: u64,
    pub(crate) max_elements: u32,
    pub(crate) bitmap: Vec<u64>,
    pub(crate) num_avail: u32,
    pub(crate) next_avail: Option<u32>,
}

#[inline]
pub(crate) fn words_for(max_elements: u32) -> usize {
    ((max_elements as usize) + 63) >> 6
}

impl RegionBitmap {
    pub fn new(base: u64, element_size: u64, backing_size: u64) -> Result<Self> {
        if element_size == 0 {
            return Err(PmemError::invalid_arg("element size must be positive"));
        }
        let n = backing_size / element_size;
        if n > i32::MAX as u64 {
            return Err(PmemError::invalid_arg(format!(
                "{} elements of {} bytes exceed the bitmap index range",
                n, element_size
            )));
        }
        let max_elements = n as u32;
        Ok(Self {
            base,
            backing_size,
            element_size,
            max_elements,
            bitmap: vec![0u64; words_for(max_elements)],
            num_avail: max_elements,
            next_avail: if max_elements > 0 { Some(0) } else { None },
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn backing_size(&self) -> u64 {
        self.backing_size
    }

    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn max_elements(&self) -> u32 {
        self.max_elements
    }

    pub fn num_avail(&self) -> u32 {
        self.num_avail
    }

    /// One past the last address served by this region.
    pub fn end(&self) -> u64 {
        self.base + self.element_size * self.max_elements as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Address of a free element, or None when full.
    pub fn allocate(&mut self) -> Option<u64> {
        if self.num_avail == 0 {
            return None;
        }
        let idx = match self.next_avail.take() {
            Some(i) if !self.bit(i) => i,
            _ => self.find_next_avail()?,
        };
        self.set_bit(idx);
        self.num_avail -= 1;
        Some(self.to_addr(idx))
    }

    /// Mark the element at `addr` allocated.
    pub fn claim(&mut self, addr: u64) -> Result<()> {
        let idx = self.index_of(addr)?;
        if self.bit(idx) {
            return Err(PmemError::invalid_arg(format!(
                "address {} is already allocated",
                addr
            )));
        }
        self.set_bit(idx);
        self.num_avail -= 1;
        if self.next_avail == Some(idx) {
            self.next_avail = None;
        }
        Ok(())
    }

    pub fn free(&mut self, addr: u64) -> Result<()> {
        let idx = self.index_of(addr)?;
        if !self.bit(idx) {
            return Err(PmemError::invalid_arg(format!(
                "address {} is not allocated",
                addr
            )));
        }
        self.bitmap[(idx >> 6) as usize] ^= 1u64 << (idx & 63);
        self.next_avail = Some(idx);
        self.num_avail += 1;
        Ok(())
    }

    pub fn is_free(&self, addr: u64) -> Result<bool> {
        let idx = self.index_of(addr)?;
        Ok(!self.bit(idx))
    }

    fn index_of(&self, addr: u64) -> Result<u32> {
        if !self.contains(addr) {
            return Err(PmemError::invalid_arg(format!(
                "address {} outside region [{}, {})",
                addr,
                self.base,
                self.end()
            )));
        }
        let delta = addr - self.base;
        if delta % self.element_size != 0 {
            return Err(PmemError::invalid_arg(format!(
                "address {} is not aligned to element size {}",
                addr, self.element_size
            )));
        }
        Ok((delta / self.element_size) as u32)
    }

    #[inline]
    fn to_addr(&self, idx: u32) -> u64 {
        self.base + self.element_size * idx as u64
    }

    #[inline]
    fn bit(&self, idx: u32) -> bool {
        (self.bitmap[(idx >> 6) as usize] >> (idx & 63)) & 1 == 1
    }

    #[inline]
    fn set_bit(&mut self, idx: u32) {
        self.bitmap[(idx >> 6) as usize] |= 1u64 << (idx & 63);
    }

    fn find_next_avail(&self) -> Option<u32> {
        for (i, &bits) in self.bitmap.iter().enumerate() {
            if !bits != 0 {
                let j = (!bits).trailing_zeros();
                let idx = ((i as u32) << 6) | j;
                return if idx < self.max_elements { Some(idx) } else { None };
            }
        }
        None
    }
}
