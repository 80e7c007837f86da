//! Persistent transaction events.
//!
//! Encoding (big-endian), one event per log record:
//!   Malloc      [0xFFFF u64][offset u64][size u64][internal u32]
//!   BeforeWrite [0xFEFE u64][offset u64][size u64][preimage: size bytes]
//!   Outcome     [0xFDFD u64][commit u32]
//!   Deallocate  [0xFCFC u64][offset u64][size u64]

use byteorder::{BigEndian, ByteOrder};

use crate::error::{PmemError, Result};

pub const MALLOC_ID: u64 = 0xFFFF;
pub const BEFORE_WRITE_ID: u64 = 0xFEFE;
pub const OUTCOME_ID: u64 = 0xFDFD;
pub const DEALLOCATE_ID: u64 = 0xFCFC;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Malloc { offset: u64, size: u64, internal: bool },
    Deallocate { offset: u64, size: u64 },
    BeforeWrite { offset: u64, preimage: Vec<u8> },
    Outcome { commit: bool },
}

impl Event {
    pub fn format_id(&self) -> u64 {
        match self {
            Event::Malloc { .. } => MALLOC_ID,
            Event::Deallocate { .. } => DEALLOCATE_ID,
            Event::BeforeWrite { .. } => BEFORE_WRITE_ID,
            Event::Outcome { .. } => OUTCOME_ID,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.encoded_len());
        push_u64(&mut v, self.format_id());
        match self {
            Event::Malloc {
                offset,
                size,
                internal,
            } => {
                push_u64(&mut v, *offset);
                push_u64(&mut v, *size);
                push_u32(&mut v, *internal as u32);
            }
            Event::Deallocate { offset, size } => {
                push_u64(&mut v, *offset);
                push_u64(&mut v, *size);
            }
            Event::BeforeWrite { offset, preimage } => {
                push_u64(&mut v, *offset);
                push_u64(&mut v, preimage.len() as u64);
                v.extend_from_slice(preimage);
            }
            Event::Outcome { commit } => push_u32(&mut v, *commit as u32),
        }
        v
    }

    pub fn encoded_len(&self) -> usize {
        8 + match self {
            Event::Malloc { .. } => 20,
            Event::Deallocate { .. } => 16,
            Event::BeforeWrite { preimage, .. } => 16 + preimage.len(),
            Event::Outcome { .. } => 4,
        }
    }

    /// Decode one record. `Ok(None)` for an unknown format id; InvalidData
    /// when a known event is truncated.
    pub fn decode(buf: &[u8]) -> Result<Option<Event>> {
        let id = u64_at(buf, 0)?;
        let ev = match id {
            MALLOC_ID => Event::Malloc {
                offset: u64_at(buf, 8)?,
                size: u64_at(buf, 16)?,
                internal: u32_at(buf, 24)? != 0,
            },
            DEALLOCATE_ID => Event::Deallocate {
                offset: u64_at(buf, 8)?,
                size: u64_at(buf, 16)?,
            },
            BEFORE_WRITE_ID => {
                let offset = u64_at(buf, 8)?;
                let size = u64_at(buf, 16)? as usize;
                let body = buf
                    .get(24..)
                    .filter(|b| b.len() >= size)
                    .ok_or_else(|| truncated(id))?;
                Event::BeforeWrite {
                    offset,
                    preimage: body[..size].to_vec(),
                }
            }
            OUTCOME_ID => Event::Outcome {
                commit: u32_at(buf, 8)? != 0,
            },
            _ => return Ok(None),
        };
        Ok(Some(ev))
    }
}

fn push_u64(v: &mut Vec<u8>, x: u64) {
    let mut b = [0u8; 8];
    BigEndian::write_u64(&mut b, x);
    v.extend_from_slice(&b);
}

fn push_u32(v: &mut Vec<u8>, x: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, x);
    v.extend_from_slice(&b);
}

fn truncated(id: u64) -> PmemError {
    PmemError::InvalidData(format!("event {:#x} is truncated", id))
}

fn u64_at(buf: &[u8], at: usize) -> Result<u64> {
    buf.get(at..at + 8)
        .map(BigEndian::read_u64)
        .ok_or_else(|| PmemError::InvalidData(format!("event record of {} bytes is truncated", buf.len())))
}

fn u32_at(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(BigEndian::read_u32)
        .ok_or_else(|| PmemError::InvalidData(format!("event record of {} bytes is truncated", buf.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ids_are_distinct() {
        let mut ids = vec![MALLOC_ID, BEFORE_WRITE_ID, OUTCOME_ID, DEALLOCATE_ID];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn before_write_layout() {
        let ev = Event::BeforeWrite {
            offset: 0x10,
            preimage: vec![0xAA, 0xBB],
        };
        let b = ev.encode();
        assert_eq!(b.len(), ev.encoded_len());
        assert_eq!(&b[..8], &[0, 0, 0, 0, 0, 0, 0xFE, 0xFE]);
        assert_eq!(BigEndian::read_u64(&b[8..16]), 0x10);
        assert_eq!(BigEndian::read_u64(&b[16..24]), 2);
        assert_eq!(&b[24..], &[0xAA, 0xBB]);
        assert_eq!(Event::decode(&b).unwrap(), Some(ev));
    }

    #[test]
    fn deallocate_is_not_mistaken_for_before_write() {
        let ev = Event::Deallocate {
            offset: 64,
            size: 8,
        };
        assert_eq!(Event::decode(&ev.encode()).unwrap(), Some(ev));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let ev = Event::Outcome { commit: true };
        let mut b = ev.encode();
        b.resize(256, 0);
        assert_eq!(Event::decode(&b).unwrap(), Some(ev));
    }

    #[test]
    fn unknown_and_truncated() {
        let mut b = vec![0u8; 16];
        BigEndian::write_u64(&mut b, 0x1234);
        assert_eq!(Event::decode(&b).unwrap(), None);

        let mut m = Event::Malloc {
            offset: 1,
            size: 2,
            internal: false,
        }
        .encode();
        m.truncate(20);
        assert!(matches!(Event::decode(&m), Err(PmemError::InvalidData(_))));
    }
}
