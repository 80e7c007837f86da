//! Record framing and the look-ahead scan shared by recovery and iterators.
//!
//! Record: [len u32 BE][crc32c u32 BE][payload][pad to padding size]
//! len == 0 ends the log.

use byteorder::{BigEndian, ByteOrder};

use crate::consts::LOG_REC_HDR_SIZE;
use crate::error::Result;
use crate::pmem::PersistenceHandle;

/// A record found by `scan_from`. All positions are window-relative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Scanned {
    pub location: usize,
    pub payload: usize,
    pub len: usize,
    /// Start of the following record (after padding, capped at the limit).
    pub next: usize,
}

#[inline]
pub(crate) fn encode_header(len: u32, crc: u32) -> [u8; LOG_REC_HDR_SIZE] {
    let mut hdr = [0u8; LOG_REC_HDR_SIZE];
    BigEndian::write_u32(&mut hdr[0..4], len);
    BigEndian::write_u32(&mut hdr[4..8], crc);
    hdr
}

#[inline]
pub(crate) fn padded_end(end: usize, padding: usize, limit: usize) -> usize {
    let rem = end % padding;
    let aligned = if rem == 0 { end } else { end + (padding - rem) };
    aligned.min(limit)
}

#[inline]
pub(crate) fn read_at(h: &PersistenceHandle, pos: usize, buf: &mut [u8]) -> Result<()> {
    h.region().read(h.offset() + pos, buf)
}

#[inline]
pub(crate) fn read_u32_at(h: &PersistenceHandle, pos: usize) -> Result<u32> {
    h.region().read_u32(h.offset() + pos)
}

#[inline]
pub(crate) fn write_at(h: &PersistenceHandle, pos: usize, data: &[u8]) -> Result<()> {
    h.region().write(h.offset() + pos, data)
}

/// Next valid record at or after `pos`, reading no further than `limit`.
///
/// Strict ordering stops at the first record whose checksum fails; relaxed
/// ordering skips it and keeps looking. A zero length, a truncated header or
/// a payload running past `limit` always ends the scan.
pub(crate) fn scan_from(
    h: &PersistenceHandle,
    padding: usize,
    linear: bool,
    mut pos: usize,
    limit: usize,
) -> Result<Option<Scanned>> {
    loop {
        if pos >= limit || limit - pos < 4 {
            return Ok(None);
        }
        let len = read_u32_at(h, pos)? as usize;
        if len == 0 {
            return Ok(None);
        }
        if limit - pos < LOG_REC_HDR_SIZE {
            return Ok(None);
        }
        let expected = read_u32_at(h, pos + 4)?;
        let payload = pos + LOG_REC_HDR_SIZE;
        if len > limit - payload {
            return Ok(None);
        }
        let mut buf = vec![0u8; len];
        read_at(h, payload, &mut buf)?;
        let next = padded_end(payload + len, padding, limit);
        if crc32c::crc32c(&buf) == expected {
            return Ok(Some(Scanned {
                location: pos,
                payload,
                len,
                next,
            }));
        }
        if linear {
            return Ok(None);
        }
        pos = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_end_caps_at_limit() {
        assert_eq!(padded_end(29, 4, 1024), 32);
        assert_eq!(padded_end(32, 4, 1024), 32);
        assert_eq!(padded_end(300, 256, 1024), 512);
        assert_eq!(padded_end(900, 256, 1000), 1000);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let h = encode_header(3, 0x01020304);
        assert_eq!(h, [0, 0, 0, 3, 1, 2, 3, 4]);
    }
}
