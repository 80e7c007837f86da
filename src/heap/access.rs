//! MemoryAccess: typed big-endian accessors over one heap object.
//!
//! Every accessor funnels into `read_bytes`/`write_bytes`, which bounds-check
//! against the object size and then run the hooks:
//!   before_read -> raw_read -> after_read
//!   before_write -> raw_write -> after_write
//! Implementations decide what the hooks do (deleted-handle checks, pre-image
//! capture, range flush).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{PmemError, Result};

fn check_range(size: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(PmemError::invalid_arg(format!(
            "access [{}, +{}) outside object of {} bytes",
            offset, len, size
        ))),
    }
}

fn element_offset(offset: usize, num_elements: usize, index: usize, width: usize) -> Result<usize> {
    if index >= num_elements {
        return Err(PmemError::invalid_arg(format!(
            "index {} out of bounds for array of {}",
            index, num_elements
        )));
    }
    Ok(offset + index * width)
}

macro_rules! typed_access {
    ($t:ty, $w:expr, $get:ident, $set:ident, $get_arr:ident, $set_arr:ident,
     $get_el:ident, $set_el:ident, $rd:ident, $wr:ident) => {
        fn $get(&self, offset: usize) -> Result<$t> {
            let mut b = [0u8; $w];
            self.read_bytes(offset, &mut b)?;
            Ok(BigEndian::$rd(&b))
        }

        fn $set(&self, offset: usize, value: $t) -> Result<()> {
            let mut b = [0u8; $w];
            BigEndian::$wr(&mut b, value);
            self.write_bytes(offset, &b)
        }

        fn $get_arr(&self, offset: usize, num_elements: usize) -> Result<Vec<$t>> {
            let mut b = vec![0u8; num_elements * $w];
            self.read_bytes(offset, &mut b)?;
            Ok(b.chunks_exact($w).map(BigEndian::$rd).collect())
        }

        fn $set_arr(&self, offset: usize, values: &[$t]) -> Result<()> {
            let mut b = vec![0u8; values.len() * $w];
            for (chunk, v) in b.chunks_exact_mut($w).zip(values) {
                BigEndian::$wr(chunk, *v);
            }
            self.write_bytes(offset, &b)
        }

        fn $get_el(&self, offset: usize, num_elements: usize, index: usize) -> Result<$t> {
            self.$get(element_offset(offset, num_elements, index, $w)?)
        }

        fn $set_el(&self, offset: usize, num_elements: usize, index: usize, value: $t) -> Result<()> {
            self.$set(element_offset(offset, num_elements, index, $w)?, value)
        }
    };
}

pub trait MemoryAccess {
    /// Heap offset of the object's first byte.
    fn heap_offset(&self) -> u64;

    /// Object size in bytes (the layout size, not the size class).
    fn size(&self) -> usize;

    fn before_read(&self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn after_read(&self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn before_write(&self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn after_write(&self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    /// Unchecked copy out of the object (offsets are object-relative).
    fn raw_read(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Unchecked copy into the object.
    fn raw_write(&self, offset: usize, src: &[u8]) -> Result<()>;

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(self.size(), offset, dst.len())?;
        self.before_read(offset, dst.len())?;
        self.raw_read(offset, dst)?;
        self.after_read(offset, dst.len())
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        check_range(self.size(), offset, src.len())?;
        self.before_write(offset, src.len())?;
        self.raw_write(offset, src)?;
        self.after_write(offset, src.len())
    }

    fn get_u8(&self, offset: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(offset, &mut b)?;
        Ok(b[0])
    }

    fn set_u8(&self, offset: usize, value: u8) -> Result<()> {
        self.write_bytes(offset, &[value])
    }

    fn get_i8(&self, offset: usize) -> Result<i8> {
        Ok(self.get_u8(offset)? as i8)
    }

    fn set_i8(&self, offset: usize, value: i8) -> Result<()> {
        self.set_u8(offset, value as u8)
    }

    fn get_byte_array(&self, offset: usize, num_elements: usize) -> Result<Vec<u8>> {
        let mut b = vec![0u8; num_elements];
        self.read_bytes(offset, &mut b)?;
        Ok(b)
    }

    fn set_byte_array(&self, offset: usize, values: &[u8]) -> Result<()> {
        self.write_bytes(offset, values)
    }

    fn get_byte_element(&self, offset: usize, num_elements: usize, index: usize) -> Result<u8> {
        self.get_u8(element_offset(offset, num_elements, index, 1)?)
    }

    fn set_byte_element(&self, offset: usize, num_elements: usize, index: usize, value: u8) -> Result<()> {
        self.set_u8(element_offset(offset, num_elements, index, 1)?, value)
    }

    typed_access!(u16, 2, get_u16, set_u16, get_u16_array, set_u16_array, get_u16_element, set_u16_element, read_u16, write_u16);
    typed_access!(i16, 2, get_i16, set_i16, get_i16_array, set_i16_array, get_i16_element, set_i16_element, read_i16, write_i16);
    typed_access!(u32, 4, get_u32, set_u32, get_u32_array, set_u32_array, get_u32_element, set_u32_element, read_u32, write_u32);
    typed_access!(i32, 4, get_i32, set_i32, get_i32_array, set_i32_array, get_i32_element, set_i32_element, read_i32, write_i32);
    typed_access!(u64, 8, get_u64, set_u64, get_u64_array, set_u64_array, get_u64_element, set_u64_element, read_u64, write_u64);
    typed_access!(i64, 8, get_i64, set_i64, get_i64_array, set_i64_array, get_i64_element, set_i64_element, read_i64, write_i64);
    typed_access!(f32, 4, get_f32, set_f32, get_f32_array, set_f32_array, get_f32_element, set_f32_element, read_f32, write_f32);
    typed_access!(f64, 8, get_f64, set_f64, get_f64_array, set_f64_array, get_f64_element, set_f64_element, read_f64, write_f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// In-memory object recording hook calls.
    struct Scratch {
        bytes: RefCell<Vec<u8>>,
        hooks: RefCell<Vec<String>>,
    }

    impl Scratch {
        fn new(n: usize) -> Self {
            Self {
                bytes: RefCell::new(vec![0u8; n]),
                hooks: RefCell::new(Vec::new()),
            }
        }
    }

    impl MemoryAccess for Scratch {
        fn heap_offset(&self) -> u64 {
            0
        }

        fn size(&self) -> usize {
            self.bytes.borrow().len()
        }

        fn before_write(&self, offset: usize, len: usize) -> Result<()> {
            self.hooks.borrow_mut().push(format!("bw {} {}", offset, len));
            Ok(())
        }

        fn after_write(&self, offset: usize, len: usize) -> Result<()> {
            self.hooks.borrow_mut().push(format!("aw {} {}", offset, len));
            Ok(())
        }

        fn raw_read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
            dst.copy_from_slice(&self.bytes.borrow()[offset..offset + dst.len()]);
            Ok(())
        }

        fn raw_write(&self, offset: usize, src: &[u8]) -> Result<()> {
            self.bytes.borrow_mut()[offset..offset + src.len()].copy_from_slice(src);
            Ok(())
        }
    }

    #[test]
    fn typed_values_are_big_endian() {
        let s = Scratch::new(32);
        s.set_u32(0, 0x0102_0304).unwrap();
        assert_eq!(&s.bytes.borrow()[..4], &[1, 2, 3, 4]);
        s.set_f64(8, -2.5).unwrap();
        assert_eq!(s.get_f64(8).unwrap(), -2.5);
        s.set_i16(16, -2).unwrap();
        assert_eq!(s.get_u16(16).unwrap(), 0xFFFE);
        assert_eq!(
            s.hooks.borrow().as_slice(),
            &["bw 0 4", "aw 0 4", "bw 8 8", "aw 8 8", "bw 16 2", "aw 16 2"]
        );
    }

    #[test]
    fn arrays_and_elements() {
        let s = Scratch::new(64);
        s.set_u64_array(8, &[7, 8, 9]).unwrap();
        assert_eq!(s.get_u64_array(8, 3).unwrap(), vec![7, 8, 9]);
        assert_eq!(s.get_u64_element(8, 3, 2).unwrap(), 9);
        s.set_u64_element(8, 3, 1, 80).unwrap();
        assert_eq!(s.get_u64(16).unwrap(), 80);
        assert!(matches!(
            s.get_u64_element(8, 3, 3),
            Err(PmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn out_of_bounds_access_runs_no_hooks() {
        let s = Scratch::new(8);
        assert!(matches!(s.set_u64(4, 1), Err(PmemError::InvalidArgument(_))));
        assert!(matches!(s.get_u32(usize::MAX - 1), Err(PmemError::InvalidArgument(_))));
        assert!(s.hooks.borrow().is_empty());
    }
}
