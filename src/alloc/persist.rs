//! Byte encoding of allocator state (big-endian).
//!
//! RegionBitmap:
//!   [base u64][backing u64][element u64][bitmap words u64 * n][num_avail u32][next_avail i32]
//! CompositeAllocator:
//!   [base u64][backing u64] then for every size class: [count u32][RegionBitmap * count]

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::composite::CompositeAllocator;
use super::region::{words_for, RegionBitmap};
use crate::error::{PmemError, Result};

fn truncated(e: std::io::Error) -> PmemError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PmemError::InvalidData("allocator image truncated".into())
    } else {
        PmemError::Io(e)
    }
}

/// Encoded size of a region.
pub fn region_encoded_len(r: &RegionBitmap) -> usize {
    8 * 3 + 8 * r.bitmap.len() + 4 + 4
}

pub fn write_region<W: Write>(r: &RegionBitmap, w: &mut W) -> Result<()> {
    w.write_u64::<BigEndian>(r.base)?;
    w.write_u64::<BigEndian>(r.backing_size)?;
    w.write_u64::<BigEndian>(r.element_size)?;
    for &word in &r.bitmap {
        w.write_u64::<BigEndian>(word)?;
    }
    w.write_u32::<BigEndian>(r.num_avail)?;
    w.write_i32::<BigEndian>(r.next_avail.map(|i| i as i32).unwrap_or(-1))?;
    Ok(())
}

pub fn read_region<R: Read>(r: &mut R) -> Result<RegionBitmap> {
    let base = r.read_u64::<BigEndian>().map_err(truncated)?;
    let backing = r.read_u64::<BigEndian>().map_err(truncated)?;
    let element = r.read_u64::<BigEndian>().map_err(truncated)?;
    let mut region = RegionBitmap::new(base, element, backing)?;
    for i in 0..words_for(region.max_elements) {
        region.bitmap[i] = r.read_u64::<BigEndian>().map_err(truncated)?;
    }
    region.num_avail = r.read_u32::<BigEndian>().map_err(truncated)?;
    let next = r.read_i32::<BigEndian>().map_err(truncated)?;
    region.next_avail = if next >= 0 && (next as u32) < region.max_elements {
        Some(next as u32)
    } else {
        None
    };
    if region.num_avail > region.max_elements {
        return Err(PmemError::InvalidData(format!(
            "region at {} claims {} free of {} elements",
            base, region.num_avail, region.max_elements
        )));
    }
    Ok(region)
}

pub fn write_allocator<W: Write>(a: &CompositeAllocator, w: &mut W) -> Result<()> {
    w.write_u64::<BigEndian>(a.base)?;
    w.write_u64::<BigEndian>(a.backing_size)?;
    for list in &a.regions {
        w.write_u32::<BigEndian>(list.len() as u32)?;
        for r in list {
            write_region(r, w)?;
        }
    }
    Ok(())
}

pub fn read_allocator<R: Read>(r: &mut R) -> Result<CompositeAllocator> {
    let base = r.read_u64::<BigEndian>().map_err(truncated)?;
    let backing = r.read_u64::<BigEndian>().map_err(truncated)?;
    let mut a = CompositeAllocator::empty(base, backing)?;
    for x in 0..a.classes.len() {
        let n = r.read_u32::<BigEndian>().map_err(truncated)?;
        for _ in 0..n {
            let region = read_region(r)?;
            if region.element_size != a.classes[x].element_size {
                return Err(PmemError::InvalidData(format!(
                    "region of element size {} listed under class {}",
                    region.element_size, a.classes[x].element_size
                )));
            }
            a.regions[x].push(region);
        }
        a.regions[x].sort_by_key(|r| r.base);
    }
    Ok(a)
}

impl RegionBitmap {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(region_encoded_len(self));
        // Vec<u8> writes are infallible.
        let _ = write_region(self, &mut v);
        v
    }

    pub fn from_bytes(mut b: &[u8]) -> Result<Self> {
        read_region(&mut b)
    }
}

impl CompositeAllocator {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let _ = write_allocator(self, &mut v);
        v
    }

    pub fn from_bytes(mut b: &[u8]) -> Result<Self> {
        read_allocator(&mut b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn region_state_survives_encoding() {
        let mut r = RegionBitmap::new(4096, 64, 64 * 100).unwrap();
        let a = r.allocate().unwrap();
        let _b = r.allocate().unwrap();
        r.free(a).unwrap();
        let bytes = r.to_bytes();
        assert_eq!(bytes.len(), region_encoded_len(&r));
        let mut back = RegionBitmap::from_bytes(&bytes).unwrap();
        assert_eq!(back, r);
        // the cached hint comes back too
        assert_eq!(back.allocate(), Some(a));
    }

    #[test]
    fn allocator_state_survives_encoding() {
        let mut a = CompositeAllocator::new(0, 12 * MIB).unwrap();
        let x = a.allocate(100).unwrap();
        let y = a.allocate(5000).unwrap();
        let bytes = a.to_bytes();
        let mut back = CompositeAllocator::from_bytes(&bytes).unwrap();
        assert_eq!(back, a);
        assert!(!back.is_free(x, 100).unwrap());
        assert!(!back.is_free(y, 5000).unwrap());
        let z = back.allocate(100).unwrap();
        assert_ne!(z, x);
    }

    #[test]
    fn truncated_image_is_invalid_data() {
        let a = CompositeAllocator::new(0, 4 * MIB).unwrap();
        let bytes = a.to_bytes();
        assert!(matches!(
            CompositeAllocator::from_bytes(&bytes[..bytes.len() - 3]),
            Err(PmemError::InvalidData(_))
        ));
    }
}
