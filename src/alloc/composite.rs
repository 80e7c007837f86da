//! CompositeAllocator: size classes built from RegionBitmaps.
//!
//! Classes are powers of two from 8 B to 1 MiB, then the 4 MiB page. The
//! page class is backed by the whole heap and seeded with a single region at
//! `base`; every smaller class is backed by page-sized sub-regions carved out
//! of the page class on demand. Regions are kept sorted by base address (arena + index,
//! no pointers between regions).

use log::trace;

use super::region::RegionBitmap;
use crate::consts::{HEAP_PAGE_SIZE, MIN_ELEMENT_SIZE};
use crate::error::{PmemError, Result};

/// (element size, backing size of each region in the class).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SizeClass {
    pub element_size: u64,
    pub backing_size: u64,
}

pub(crate) fn size_classes(backing_size: u64) -> Vec<SizeClass> {
    let mut v = Vec::new();
    let mut e = MIN_ELEMENT_SIZE;
    while e <= HEAP_PAGE_SIZE / 4 {
        v.push(SizeClass {
            element_size: e,
            backing_size: HEAP_PAGE_SIZE,
        });
        e <<= 1;
    }
    v.push(SizeClass {
        element_size: HEAP_PAGE_SIZE,
        backing_size,
    });
    v
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeAllocator {
    pub(crate) base: u64,
    pub(crate) backing_size: u64,
    pub(crate) classes: Vec<SizeClass>,
    /// Per class, sorted by base address.
    pub(crate) regions: Vec<Vec<RegionBitmap>>,
}

impl CompositeAllocator {
    pub fn new(base: u64, backing_size: u64) -> Result<Self> {
        let mut a = Self::empty(base, backing_size)?;
        let top = a.classes.len() - 1;
        let c = a.classes[top];
        a.regions[top].push(RegionBitmap::new(base, c.element_size, c.backing_size)?);
        Ok(a)
    }

    /// Same classes, no regions (used when restoring from bytes).
    pub(crate) fn empty(base: u64, backing_size: u64) -> Result<Self> {
        if backing_size < HEAP_PAGE_SIZE {
            return Err(PmemError::invalid_arg(format!(
                "minimum heap size {}",
                HEAP_PAGE_SIZE
            )));
        }
        let classes = size_classes(backing_size);
        let regions = vec![Vec::new(); classes.len()];
        Ok(Self {
            base,
            backing_size,
            classes,
            regions,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn backing_size(&self) -> u64 {
        self.backing_size
    }

    pub fn size_classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Largest size served.
    pub fn max_size(&self) -> u64 {
        self.classes[self.classes.len() - 1].element_size
    }

    /// Element size `size` will actually occupy, or None if too large.
    pub fn rounded_size(&self, size: u64) -> Option<u64> {
        self.class_for(size).map(|x| self.classes[x].element_size)
    }

    /// Smallest class whose element size is >= `size`.
    fn class_for(&self, size: u64) -> Option<usize> {
        let x = self.classes.partition_point(|c| c.element_size < size);
        if x == self.classes.len() {
            None
        } else {
            Some(x)
        }
    }

    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let x = self.class_for(size)?;
        let got = self.allocate_in_class(x);
        trace!("allocate size={} class={} -> {:?}", size, x, got);
        got
    }

    fn allocate_in_class(&mut self, x: usize) -> Option<u64> {
        for r in self.regions[x].iter_mut().rev() {
            if let Some(a) = r.allocate() {
                return Some(a);
            }
        }
        let idx = self.grow_class(x)?;
        self.regions[x][idx].allocate()
    }

    /// Carve a new region for class `x` out of the next class up.
    fn grow_class(&mut self, x: usize) -> Option<usize> {
        if x == self.classes.len() - 1 {
            return None;
        }
        let c = self.classes[x];
        let parent = self.class_for(c.backing_size)?;
        let addr = self.allocate_in_class(parent)?;
        let region = RegionBitmap::new(addr, c.element_size, c.backing_size).ok()?;
        Some(self.insert_region(x, region))
    }

    fn insert_region(&mut self, x: usize, region: RegionBitmap) -> usize {
        let list = &mut self.regions[x];
        let idx = list.partition_point(|r| r.base < region.base);
        list.insert(idx, region);
        idx
    }

    fn find_region(&self, x: usize, addr: u64) -> Option<usize> {
        let list = &self.regions[x];
        let y = list.partition_point(|r| r.base <= addr);
        if y == 0 {
            return None;
        }
        if list[y - 1].contains(addr) {
            Some(y - 1)
        } else {
            None
        }
    }

    fn class_or_err(&self, size: u64) -> Result<usize> {
        self.class_for(size).ok_or_else(|| {
            PmemError::invalid_arg(format!(
                "size {} exceeds the largest size class {}",
                size,
                self.max_size()
            ))
        })
    }

    pub fn free(&mut self, addr: u64, size: u64) -> Result<()> {
        let x = self.class_or_err(size)?;
        let y = self.find_region(x, addr).ok_or_else(|| {
            PmemError::invalid_arg(format!("address {} was not allocated with size {}", addr, size))
        })?;
        self.regions[x][y].free(addr)?;
        trace!("free addr={} size={}", addr, size);
        Ok(())
    }

    /// True when no live allocation of `size` sits at `addr`.
    pub fn is_free(&self, addr: u64, size: u64) -> Result<bool> {
        let x = self.class_or_err(size)?;
        match self.find_region(x, addr) {
            None => Ok(true),
            Some(y) => self.regions[x][y].is_free(addr),
        }
    }

    /// Mark `[addr, addr+size)` allocated at exactly `addr`, creating the
    /// enclosing sub-region if needed. Used to replay allocations.
    pub fn claim(&mut self, addr: u64, size: u64) -> Result<()> {
        let x = self.class_or_err(size)?;
        let y = match self.find_region(x, addr) {
            Some(y) => y,
            None => {
                let c = self.classes[x];
                if x == self.classes.len() - 1 || addr < self.base {
                    return Err(PmemError::invalid_arg(format!(
                        "address {} is outside the heap",
                        addr
                    )));
                }
                let page = self.base + ((addr - self.base) / c.backing_size) * c.backing_size;
                self.claim(page, c.backing_size)?;
                let region = RegionBitmap::new(page, c.element_size, c.backing_size)?;
                self.insert_region(x, region)
            }
        };
        self.regions[x][y].claim(addr)
    }

    /// Number of regions per class, smallest class first.
    pub fn region_counts(&self) -> Vec<usize> {
        self.regions.iter().map(|l| l.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn rejects_small_heaps() {
        assert!(matches!(
            CompositeAllocator::new(0, MIB),
            Err(PmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn routes_to_smallest_fitting_class() {
        let mut a = CompositeAllocator::new(0, 16 * MIB).unwrap();
        assert_eq!(a.rounded_size(1), Some(8));
        assert_eq!(a.rounded_size(9), Some(16));
        assert_eq!(a.rounded_size(MIB), Some(MIB));
        // nothing between 1 MiB and the page
        assert_eq!(a.rounded_size(MIB + 1), Some(4 * MIB));
        assert_eq!(a.rounded_size(2 * MIB), Some(4 * MIB));
        assert_eq!(a.rounded_size(4 * MIB), Some(4 * MIB));
        assert_eq!(a.rounded_size(4 * MIB + 1), None);
        assert_eq!(a.allocate(4 * MIB + 1), None);

        let small = a.allocate(24).unwrap();
        // first small allocation carves the first page
        assert_eq!(small, 0);
        let big = a.allocate(3 * MIB).unwrap();
        assert_eq!(big, 4 * MIB);
        assert!(!a.is_free(small, 24).unwrap());
        a.free(small, 24).unwrap();
        assert!(a.is_free(small, 32).unwrap());
        assert_eq!(a.allocate(32), Some(small));
    }

    #[test]
    fn runs_out_of_pages() {
        let mut a = CompositeAllocator::new(0, 8 * MIB).unwrap();
        assert!(a.allocate(4 * MIB).is_some());
        assert!(a.allocate(4 * MIB).is_some());
        assert_eq!(a.allocate(4 * MIB), None);
        assert_eq!(a.allocate(8), None);
    }

    #[test]
    fn claim_recreates_sub_regions() {
        let mut a = CompositeAllocator::new(0, 16 * MIB).unwrap();
        a.claim(8 * MIB + 64, 64).unwrap();
        assert!(!a.is_free(8 * MIB + 64, 64).unwrap());
        assert!(!a.is_free(8 * MIB, 4 * MIB).unwrap());
        assert!(matches!(
            a.claim(8 * MIB + 64, 64),
            Err(PmemError::InvalidArgument(_))
        ));
        // ordinary allocation in that class now reuses the claimed page
        let next = a.allocate(64).unwrap();
        assert_eq!(next, 8 * MIB);
    }
}
