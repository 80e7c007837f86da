//! TransactionManager: current transaction, commit, rollback, recovery.
//!
//! Каждое durable событие пишется в store до изменения памяти (write-ahead).
//! Volatile records (Create/Delete) only exist to fix up handles on rollback.
//!
//! Recovery runs against a fresh allocator:
//! - events are grouped by Outcome markers;
//! - committed groups are redone (Malloc -> claim, Deallocate -> free);
//! - other groups leave the allocator alone (their effects were never
//!   replayed); pre-images are restored only for the trailing group, since
//!   any earlier rollback completed before the next transaction began;
//! - a trailing group without an Outcome gets `Outcome{commit=false}`.

use std::sync::Arc;

use log::{debug, info, warn};

use super::events::Event;
use super::store::TransactionStore;
use crate::error::{PmemError, Result};
use crate::heap::{HeapCore, ObjState};
use crate::metrics::{record_tx_commit, record_tx_recovered, record_tx_rollback};

pub(crate) enum TxRecord {
    Durable(Event),
    Create(Arc<ObjState>),
    Delete(Arc<ObjState>),
}

/// Result of replaying a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: usize,
    pub rolled_back: usize,
    /// The last transaction had no outcome and was undone.
    pub unfinished: bool,
}

pub struct TransactionManager {
    store: TransactionStore,
    current: Option<Vec<TxRecord>>,
}

impl TransactionManager {
    pub fn new(store: TransactionStore) -> Self {
        Self {
            store,
            current: None,
        }
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Err(PmemError::illegal_state("transaction already active"));
        }
        self.current = Some(Vec::new());
        debug!("transaction begin");
        Ok(())
    }

    pub(crate) fn require_current(&self) -> Result<()> {
        if self.current.is_none() {
            return Err(PmemError::illegal_state("no current transaction"));
        }
        Ok(())
    }

    /// Persist `event` and remember it in the current transaction.
    pub(crate) fn record_durable(&mut self, event: Event) -> Result<()> {
        let list = self
            .current
            .as_mut()
            .ok_or_else(|| PmemError::illegal_state("no current transaction"))?;
        self.store.record(&event)?;
        list.push(TxRecord::Durable(event));
        Ok(())
    }

    /// Remember a volatile record; ignored outside a transaction.
    pub(crate) fn record_volatile(&mut self, rec: TxRecord) {
        if let Some(list) = self.current.as_mut() {
            list.push(rec);
        }
    }

    fn take_current(&mut self) -> Result<Vec<TxRecord>> {
        self.current
            .take()
            .ok_or_else(|| PmemError::illegal_state("no current transaction"))
    }

    pub(crate) fn commit(&mut self, core: &HeapCore) -> Result<()> {
        let records = self.take_current()?;
        if let Err(e) = self.store.record(&Event::Outcome { commit: true }) {
            self.current = Some(records);
            return Err(e);
        }
        // deferred frees of objects deleted in this transaction
        for rec in &records {
            if let TxRecord::Durable(Event::Deallocate { offset, size }) = rec {
                if !core.is_free(*offset, *size as usize)? {
                    core.free(*offset, *size as usize)?;
                }
            }
        }
        record_tx_commit();
        debug!("transaction commit ({} records)", records.len());
        Ok(())
    }

    pub(crate) fn rollback(&mut self, core: &HeapCore) -> Result<()> {
        let records = self.take_current()?;
        if let Err(e) = self.store.record(&Event::Outcome { commit: false }) {
            self.current = Some(records);
            return Err(e);
        }
        restore_preimages(core, records.iter().filter_map(durable))?;
        for rec in records.iter().rev() {
            match rec {
                TxRecord::Durable(Event::Malloc {
                    offset,
                    size,
                    internal: false,
                }) => {
                    if !core.is_free(*offset, *size as usize)? {
                        core.free(*offset, *size as usize)?;
                    }
                }
                TxRecord::Durable(Event::Deallocate { offset, size }) => {
                    if core.is_free(*offset, *size as usize)? {
                        core.claim(*offset, *size as usize)?;
                    }
                }
                TxRecord::Create(obj) => obj.set_deleted(true),
                TxRecord::Delete(obj) => obj.set_deleted(false),
                _ => {}
            }
        }
        record_tx_rollback();
        debug!("transaction rollback ({} records)", records.len());
        Ok(())
    }

    /// Replay the store into `core`'s fresh allocator.
    pub(crate) fn recover(&mut self, core: &HeapCore) -> Result<RecoveryReport> {
        let events = self.store.read_all()?;
        let mut groups: Vec<(Vec<Event>, Option<bool>)> = Vec::new();
        let mut cur = Vec::new();
        for ev in events {
            if let Event::Outcome { commit } = ev {
                groups.push((std::mem::take(&mut cur), Some(commit)));
            } else {
                cur.push(ev);
            }
        }
        if !cur.is_empty() {
            groups.push((cur, None));
        }

        let mut report = RecoveryReport::default();
        let last = groups.len().saturating_sub(1);
        for (i, (group, outcome)) in groups.iter().enumerate() {
            if *outcome == Some(true) {
                redo(core, group)?;
                report.committed += 1;
                record_tx_recovered(true);
                continue;
            }
            if i == last {
                restore_preimages(core, group.iter())?;
            }
            if outcome.is_none() {
                self.store.record(&Event::Outcome { commit: false })?;
                report.unfinished = true;
                warn!(
                    "transaction store {}: undid a transaction without outcome ({} events)",
                    self.store.log().name(),
                    group.len()
                );
            }
            report.rolled_back += 1;
            record_tx_recovered(false);
        }
        info!(
            "transaction store {}: recovered {} committed, {} rolled back",
            self.store.log().name(),
            report.committed,
            report.rolled_back
        );
        Ok(report)
    }
}

fn durable(rec: &TxRecord) -> Option<&Event> {
    match rec {
        TxRecord::Durable(ev) => Some(ev),
        _ => None,
    }
}

/// Write back every pre-image, newest first.
fn restore_preimages<'a, I>(core: &HeapCore, events: I) -> Result<()>
where
    I: DoubleEndedIterator<Item = &'a Event>,
{
    for ev in events.rev() {
        if let Event::BeforeWrite { offset, preimage } = ev {
            core.write_durable(*offset, preimage)?;
        }
    }
    Ok(())
}

fn redo(core: &HeapCore, group: &[Event]) -> Result<()> {
    for ev in group {
        match ev {
            Event::Malloc {
                offset,
                size,
                internal: false,
            } => core.claim(*offset, *size as usize)?,
            Event::Deallocate { offset, size } => {
                if !core.is_free(*offset, *size as usize)? {
                    core.free(*offset, *size as usize)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}
