//! TransactionalHeap: MemoryHeap whose mutations go through transactions.
//!
//! Lock order: manager, then the heap core's own locks. Dropping the heap
//! without commit leaves the transaction unresolved in the store; the next
//! open undoes it.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use super::events::Event;
use super::manager::{RecoveryReport, TransactionManager, TxRecord};
use super::store::TransactionStore;
use crate::config::PmemConfig;
use crate::error::{PmemError, Result};
use crate::heap::{HeapCore, Layout, MemoryAccess, MemoryBackend, ObjState};
use crate::lock::{try_acquire_exclusive_lock, LockGuard};

struct TxShared {
    core: HeapCore,
    manager: Mutex<TransactionManager>,
    _lock: LockGuard,
}

impl TxShared {
    fn manager(&self) -> Result<MutexGuard<'_, TransactionManager>> {
        self.manager
            .lock()
            .map_err(|_| PmemError::poisoned("transaction manager"))
    }
}

#[derive(Clone)]
pub struct TransactionalHeap {
    shared: Arc<TxShared>,
    recovery: RecoveryReport,
}

impl TransactionalHeap {
    /// Open (creating if needed) a heap file and its transaction store, then
    /// replay the store. The heap file is locked for the life of the value.
    pub fn open(
        heap_path: &Path,
        heap_length: u64,
        store_path: &Path,
        store_length: usize,
        cfg: &PmemConfig,
    ) -> Result<Self> {
        let lock = try_acquire_exclusive_lock(heap_path)?;
        let core = HeapCore::open(heap_path, heap_length, cfg)?;
        let store = TransactionStore::open(store_path, store_length, cfg)?;
        let mut manager = TransactionManager::new(store);
        let recovery = manager.recover(&core)?;
        info!(
            "opened transactional heap {} with store {}",
            heap_path.display(),
            store_path.display()
        );
        Ok(Self {
            shared: Arc::new(TxShared {
                core,
                manager: Mutex::new(manager),
                _lock: lock,
            }),
            recovery,
        })
    }

    /// What the replay at open found.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    pub fn path(&self) -> &Path {
        self.shared.core.path()
    }

    pub fn length(&self) -> u64 {
        self.shared.core.length()
    }

    pub fn begin(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.manager()?.begin()
    }

    pub fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.manager()?.commit(&self.shared.core)
    }

    pub fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.manager()?.rollback(&self.shared.core)
    }

    pub fn in_transaction(&self) -> Result<bool> {
        Ok(self.shared.manager()?.in_transaction())
    }

    /// Durable events currently in the store, oldest first.
    pub fn events(&self) -> Result<Vec<Event>> {
        self.shared.manager()?.store().read_all()
    }

    /// Close the store and the heap. An open transaction is left for the
    /// next recovery to undo.
    pub fn close(&self) -> Result<()> {
        let m = self.shared.manager()?;
        if m.in_transaction() && self.shared.core.is_open() {
            warn!(
                "closing heap {} inside a transaction",
                self.shared.core.path().display()
            );
        }
        m.store().close()?;
        self.shared.core.close()
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.shared.core.is_open() {
            return Err(PmemError::Closed);
        }
        Ok(())
    }

    fn handle(&self, obj: Arc<ObjState>) -> TxHandle {
        TxHandle {
            shared: Arc::clone(&self.shared),
            obj,
        }
    }
}

impl MemoryBackend for TransactionalHeap {
    type Handle = TxHandle;

    fn new_instance(&self, layout: &Layout) -> Result<TxHandle> {
        let mut m = self.shared.manager()?;
        m.require_current()?;
        let size = layout.size();
        let addr = self.shared.core.allocate(size)?;
        let malloc = Event::Malloc {
            offset: addr,
            size: size as u64,
            internal: false,
        };
        if let Err(e) = m.record_durable(malloc) {
            self.shared.core.free(addr, size)?;
            return Err(e);
        }
        let obj = ObjState::new(addr, size);
        m.record_volatile(TxRecord::Create(Arc::clone(&obj)));
        Ok(self.handle(obj))
    }

    /// `offset` must be a live allocation of `layout`'s size.
    fn attach_instance(&self, layout: &Layout, offset: u64) -> Result<TxHandle> {
        let mut m = self.shared.manager()?;
        if self.shared.core.is_free(offset, layout.size())? {
            return Err(PmemError::invalid_arg(format!(
                "no live object of {} bytes at {}",
                layout.size(),
                offset
            )));
        }
        let obj = ObjState::new(offset, layout.size());
        m.record_volatile(TxRecord::Create(Arc::clone(&obj)));
        Ok(self.handle(obj))
    }

    /// The allocator entry is released at commit.
    fn delete(&self, handle: &TxHandle) -> Result<()> {
        let mut m = self.shared.manager()?;
        m.require_current()?;
        handle.obj.check_live()?;
        m.record_durable(Event::Deallocate {
            offset: handle.obj.offset,
            size: handle.obj.size as u64,
        })?;
        handle.obj.set_deleted(true);
        m.record_volatile(TxRecord::Delete(Arc::clone(&handle.obj)));
        Ok(())
    }

    fn is_free(&self, offset: u64, size: usize) -> Result<bool> {
        self.shared.core.is_free(offset, size)
    }
}

/// Handle to one object of a TransactionalHeap.
#[derive(Clone)]
pub struct TxHandle {
    shared: Arc<TxShared>,
    obj: Arc<ObjState>,
}

impl TxHandle {
    pub fn is_deleted(&self) -> bool {
        self.obj.is_deleted()
    }
}

impl MemoryAccess for TxHandle {
    fn heap_offset(&self) -> u64 {
        self.obj.offset
    }

    fn size(&self) -> usize {
        self.obj.size
    }

    fn before_read(&self, _offset: usize, _len: usize) -> Result<()> {
        self.obj.check_live()
    }

    /// Capture the pre-image and persist it before the write lands.
    fn before_write(&self, offset: usize, len: usize) -> Result<()> {
        self.obj.check_live()?;
        let mut m = self.shared.manager()?;
        m.require_current()?;
        let at = self.obj.offset + offset as u64;
        let preimage = self.shared.core.read_vec(at, len)?;
        m.record_durable(Event::BeforeWrite {
            offset: at,
            preimage,
        })
    }

    fn after_write(&self, offset: usize, len: usize) -> Result<()> {
        self.shared.core.persist(self.obj.offset + offset as u64, len)
    }

    fn raw_read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.shared.core.read(self.obj.offset + offset as u64, dst)
    }

    fn raw_write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.shared.core.write(self.obj.offset + offset as u64, src)
    }
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("offset", &self.obj.offset)
            .field("size", &self.obj.size)
            .field("deleted", &self.obj.is_deleted())
            .finish()
    }
}
