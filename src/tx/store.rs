//! TransactionStore: the durable event log of a transactional heap.
//!
//! An AppendOnlyLog with block padding, strict ordering and a checkpoint
//! after every append; every `record` is durable when it returns.

use std::path::Path;

use log::{debug, warn};

use super::events::Event;
use crate::aol::{AppendOnlyLog, LogConfig};
use crate::config::PmemConfig;
use crate::error::Result;

pub struct TransactionStore {
    log: AppendOnlyLog,
}

impl TransactionStore {
    pub fn log_config() -> LogConfig {
        LogConfig::new(true, true).with_always_checkpoint(true)
    }

    pub fn open(path: &Path, length: usize, cfg: &PmemConfig) -> Result<Self> {
        let log = AppendOnlyLog::open_file(path, length, Self::log_config(), cfg)?;
        debug!("opened transaction store {} ({} bytes)", path.display(), length);
        Ok(Self { log })
    }

    /// Append one event; returns its location.
    pub fn record(&self, event: &Event) -> Result<usize> {
        self.log.put(&event.encode())
    }

    /// Every event in append order. Unknown format ids are skipped.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        let mut it = self.log.copying_iter()?;
        while let Some((location, payload)) = it.next_with_location()? {
            match Event::decode(&payload)? {
                Some(ev) => out.push(ev),
                None => warn!(
                    "transaction store {}: skipping unknown event at {}",
                    self.log.name(),
                    location
                ),
            }
        }
        Ok(out)
    }

    pub fn remaining(&self) -> Result<usize> {
        self.log.remaining()
    }

    pub fn log(&self) -> &AppendOnlyLog {
        &self.log
    }

    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}
