//! Forward iteration over an AppendOnlyLog.
//!
//! Итераторы запоминают epoch лога при создании; после clear() любой вызов
//! возвращает ConcurrentModification. A successful look-ahead is cached by
//! has_next(); a failed one is not, so the tail is re-checked on each call.

use crate::consts::LOG_FIRST_RECORD;
use crate::error::{PmemError, Result};

use super::record::{read_at, scan_from, Scanned};
use super::{AppendOnlyLog, LogState};

/// Read-only view of one record. Reads fail once the log has been cleared.
#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    log: &'a AppendOnlyLog,
    rec: Scanned,
    epoch: u64,
}

impl<'a> RecordView<'a> {
    /// Byte offset of the record header inside the log window.
    pub fn location(&self) -> usize {
        self.rec.location
    }

    pub fn len(&self) -> usize {
        self.rec.len
    }

    pub fn is_empty(&self) -> bool {
        self.rec.len == 0
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut v = vec![0u8; self.rec.len];
        self.copy_to(&mut v)?;
        Ok(v)
    }

    /// Copy up to `dst.len()` payload bytes; returns the count.
    pub fn copy_to(&self, dst: &mut [u8]) -> Result<usize> {
        let st = self.log.lock_state()?;
        if st.epoch != self.epoch {
            return Err(PmemError::ConcurrentModification);
        }
        let n = dst.len().min(self.rec.len);
        read_at(st.handle()?, self.rec.payload, &mut dst[..n])?;
        Ok(n)
    }
}

impl std::fmt::Debug for RecordView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordView")
            .field("location", &self.rec.location)
            .field("len", &self.rec.len)
            .finish()
    }
}

pub struct Iter<'a> {
    log: &'a AppendOnlyLog,
    pos: usize,
    limit: usize,
    expected_epoch: u64,
    lookahead: Option<Scanned>,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(log: &'a AppendOnlyLog) -> Result<Self> {
        let st = log.lock_state()?;
        let limit = log.read_limit(&st)?;
        Ok(Self {
            log,
            pos: LOG_FIRST_RECORD,
            limit,
            expected_epoch: st.epoch,
            lookahead: None,
        })
    }

    fn check_epoch(&self, st: &LogState) -> Result<()> {
        if st.epoch != self.expected_epoch {
            return Err(PmemError::ConcurrentModification);
        }
        Ok(())
    }

    fn look(&mut self, st: &LogState) -> Result<bool> {
        if self.lookahead.is_none() {
            self.lookahead = scan_from(st.handle()?, st.padding, st.linear, self.pos, self.limit)?;
        }
        Ok(self.lookahead.is_some())
    }

    pub fn has_next(&mut self) -> Result<bool> {
        let log = self.log;
        let st = log.lock_state()?;
        self.check_epoch(&st)?;
        self.look(&st)
    }

    /// Advance; with `copy`, the payload is read under the same lock.
    fn advance(&mut self, copy: bool) -> Result<Option<(Scanned, Option<Vec<u8>>)>> {
        let log = self.log;
        let st = log.lock_state()?;
        self.check_epoch(&st)?;
        if !self.look(&st)? {
            return Ok(None);
        }
        let rec = match self.lookahead.take() {
            Some(r) => r,
            None => return Ok(None),
        };
        self.pos = rec.next;
        let data = if copy {
            let mut v = vec![0u8; rec.len];
            read_at(st.handle()?, rec.payload, &mut v)?;
            Some(v)
        } else {
            None
        };
        Ok(Some((rec, data)))
    }

    pub fn next_record(&mut self) -> Result<Option<RecordView<'a>>> {
        Ok(self.advance(false)?.map(|(rec, _)| RecordView {
            log: self.log,
            rec,
            epoch: self.expected_epoch,
        }))
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<RecordView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Iterator yielding owned copies of each payload.
pub struct CopyingIter<'a> {
    inner: Iter<'a>,
}

impl<'a> CopyingIter<'a> {
    pub(crate) fn new(inner: Iter<'a>) -> Self {
        Self { inner }
    }

    pub fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next()
    }

    /// Next payload together with its location.
    pub fn next_with_location(&mut self) -> Result<Option<(usize, Vec<u8>)>> {
        Ok(self
            .inner
            .advance(true)?
            .map(|(rec, data)| (rec.location, data.unwrap_or_default())))
    }
}

impl Iterator for CopyingIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_location()
            .map(|o| o.map(|(_, data)| data))
            .transpose()
    }
}
