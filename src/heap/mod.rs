//! heap: object heap over one mapped file.
//!
//! - HeapCore:    mapping + CompositeAllocator (volatile) behind their own locks
//! - MemoryHeap:  plain heap, handles write through and flush immediately
//! - Layout:      named fixed-size object shape
//! - MemoryBackend: the seam shared with the transactional heap
//!
//! Objects are (heap, offset) pairs; a handle owns an Arc of the heap core
//! and a shared ObjState that records whether the object was deleted.

pub mod access;

pub use access::MemoryAccess;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{debug, info, warn};

use crate::alloc::CompositeAllocator;
use crate::config::PmemConfig;
use crate::consts::HEAP_PAGE_SIZE;
use crate::error::{PmemError, Result};
use crate::metrics::{record_heap_alloc, record_heap_free};
use crate::pmem::{map_file, PersistenceHandle};

/// Shape of a heap object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    name: String,
    size: usize,
}

impl Layout {
    pub fn of_size(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Layout whose size is the sum of the field widths.
    pub fn fields(name: impl Into<String>, widths: &[usize]) -> Self {
        Self::of_size(name, widths.iter().sum())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Identity and liveness of one object, shared by all its handles.
pub(crate) struct ObjState {
    pub(crate) offset: u64,
    pub(crate) size: usize,
    deleted: AtomicBool,
}

impl ObjState {
    pub(crate) fn new(offset: u64, size: usize) -> Arc<Self> {
        Arc::new(Self {
            offset,
            size,
            deleted: AtomicBool::new(false),
        })
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(PmemError::illegal_state(format!(
                "object at {} has been deleted",
                self.offset
            )));
        }
        Ok(())
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Release);
    }
}

pub(crate) struct HeapCore {
    path: PathBuf,
    length: u64,
    region: RwLock<Option<PersistenceHandle>>,
    file: Mutex<Option<File>>,
    alloc: Mutex<CompositeAllocator>,
}

impl HeapCore {
    pub(crate) fn open(path: &Path, length: u64, cfg: &PmemConfig) -> Result<Self> {
        if length < HEAP_PAGE_SIZE {
            return Err(PmemError::invalid_arg(format!(
                "heap of {} bytes is below the minimum of {}",
                length, HEAP_PAGE_SIZE
            )));
        }
        let len = usize::try_from(length)
            .map_err(|_| PmemError::invalid_arg(format!("heap of {} bytes is not mappable", length)))?;
        let (file, region) = map_file(path, len, cfg)?;
        let handle = PersistenceHandle::whole(region, cfg.paranoid_handles);
        let alloc = CompositeAllocator::new(0, length)?;
        info!("opened heap {} ({} bytes)", path.display(), length);
        Ok(Self {
            path: path.to_path_buf(),
            length,
            region: RwLock::new(Some(handle)),
            file: Mutex::new(Some(file)),
            alloc: Mutex::new(alloc),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn length(&self) -> u64 {
        self.length
    }

    fn with_handle<R>(&self, f: impl FnOnce(&PersistenceHandle) -> Result<R>) -> Result<R> {
        let g = self.region.read().map_err(|_| PmemError::poisoned("heap mapping"))?;
        match g.as_ref() {
            Some(h) => f(h),
            None => Err(PmemError::Closed),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.region.read().map(|g| g.is_some()).unwrap_or(false)
    }

    fn window(&self, offset: u64, len: usize) -> Result<usize> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.length => Ok(offset as usize),
            _ => Err(PmemError::invalid_arg(format!(
                "range [{}, +{}) outside heap of {} bytes",
                offset, len, self.length
            ))),
        }
    }

    pub(crate) fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let at = self.window(offset, dst.len())?;
        self.with_handle(|h| h.region().read(h.offset() + at, dst))
    }

    pub(crate) fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; len];
        self.read(offset, &mut v)?;
        Ok(v)
    }

    pub(crate) fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let at = self.window(offset, src.len())?;
        self.with_handle(|h| h.region().write(h.offset() + at, src))
    }

    pub(crate) fn persist(&self, offset: u64, len: usize) -> Result<()> {
        let at = self.window(offset, len)?;
        self.with_handle(|h| h.persist(at, len))
    }

    /// Write and flush.
    pub(crate) fn write_durable(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.write(offset, src)?;
        self.persist(offset, src.len())
    }

    pub(crate) fn lock_alloc(&self) -> Result<MutexGuard<'_, CompositeAllocator>> {
        if !self.is_open() {
            return Err(PmemError::Closed);
        }
        self.alloc.lock().map_err(|_| PmemError::poisoned("heap allocator"))
    }

    pub(crate) fn allocate(&self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(PmemError::invalid_arg("object size must be positive"));
        }
        let addr = self
            .lock_alloc()?
            .allocate(size as u64)
            .ok_or(PmemError::OutOfMemory { size: size as u64 })?;
        record_heap_alloc();
        debug!("heap {} allocate {} -> {}", self.path.display(), size, addr);
        Ok(addr)
    }

    pub(crate) fn free(&self, offset: u64, size: usize) -> Result<()> {
        self.lock_alloc()?.free(offset, size as u64)?;
        record_heap_free();
        debug!("heap {} free {} ({} bytes)", self.path.display(), offset, size);
        Ok(())
    }

    pub(crate) fn claim(&self, offset: u64, size: usize) -> Result<()> {
        self.lock_alloc()?.claim(offset, size as u64)
    }

    pub(crate) fn is_free(&self, offset: u64, size: usize) -> Result<bool> {
        self.lock_alloc()?.is_free(offset, size as u64)
    }

    pub(crate) fn close(&self) -> Result<()> {
        let mut g = self.region.write().map_err(|_| PmemError::poisoned("heap mapping"))?;
        if g.take().is_some() {
            if let Ok(mut f) = self.file.lock() {
                f.take();
            }
            info!("closed heap {}", self.path.display());
        }
        Ok(())
    }
}

/// Allocation seam implemented by the plain and the transactional heap.
pub trait MemoryBackend {
    type Handle: MemoryAccess;

    fn new_instance(&self, layout: &Layout) -> Result<Self::Handle>;

    fn attach_instance(&self, layout: &Layout, offset: u64) -> Result<Self::Handle>;

    fn delete(&self, handle: &Self::Handle) -> Result<()>;

    fn is_free(&self, offset: u64, size: usize) -> Result<bool>;
}

/// Non-transactional heap. Writes are flushed as they happen; the allocator
/// is volatile (see `allocator_image`/`restore_allocator` to carry it over).
pub struct MemoryHeap {
    core: Arc<HeapCore>,
}

impl MemoryHeap {
    pub fn open(path: &Path, length: u64, cfg: &PmemConfig) -> Result<Self> {
        Ok(Self {
            core: Arc::new(HeapCore::open(path, length, cfg)?),
        })
    }

    pub fn path(&self) -> &Path {
        self.core.path()
    }

    pub fn length(&self) -> u64 {
        self.core.length()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Encoded allocator state.
    pub fn allocator_image(&self) -> Result<Vec<u8>> {
        Ok(self.core.lock_alloc()?.to_bytes())
    }

    /// Replace the allocator with a previously saved image of a heap with
    /// the same length.
    pub fn restore_allocator(&self, image: &[u8]) -> Result<()> {
        let restored = CompositeAllocator::from_bytes(image)?;
        if restored.base() != 0 || restored.backing_size() != self.core.length() {
            return Err(PmemError::invalid_arg(format!(
                "allocator image covers [{}, +{}), heap is {} bytes",
                restored.base(),
                restored.backing_size(),
                self.core.length()
            )));
        }
        *self.core.lock_alloc()? = restored;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl MemoryBackend for MemoryHeap {
    type Handle = MemoryHandle;

    /// A failure after allocation but before returning leaks the element.
    fn new_instance(&self, layout: &Layout) -> Result<MemoryHandle> {
        let addr = self.core.allocate(layout.size())?;
        Ok(MemoryHandle {
            core: Arc::clone(&self.core),
            obj: ObjState::new(addr, layout.size()),
        })
    }

    fn attach_instance(&self, layout: &Layout, offset: u64) -> Result<MemoryHandle> {
        self.core.window(offset, layout.size())?;
        if !self.core.is_open() {
            return Err(PmemError::Closed);
        }
        Ok(MemoryHandle {
            core: Arc::clone(&self.core),
            obj: ObjState::new(offset, layout.size()),
        })
    }

    fn delete(&self, handle: &MemoryHandle) -> Result<()> {
        handle.obj.check_live()?;
        self.core.free(handle.obj.offset, handle.obj.size)?;
        handle.obj.set_deleted(true);
        Ok(())
    }

    fn is_free(&self, offset: u64, size: usize) -> Result<bool> {
        self.core.is_free(offset, size)
    }
}

impl Drop for MemoryHeap {
    fn drop(&mut self) {
        if let Err(e) = self.core.close() {
            warn!("closing heap {}: {}", self.core.path().display(), e);
        }
    }
}

/// Handle to one object of a MemoryHeap.
#[derive(Clone)]
pub struct MemoryHandle {
    core: Arc<HeapCore>,
    obj: Arc<ObjState>,
}

impl MemoryHandle {
    pub fn is_deleted(&self) -> bool {
        self.obj.is_deleted()
    }
}

impl MemoryAccess for MemoryHandle {
    fn heap_offset(&self) -> u64 {
        self.obj.offset
    }

    fn size(&self) -> usize {
        self.obj.size
    }

    fn before_read(&self, _offset: usize, _len: usize) -> Result<()> {
        self.obj.check_live()
    }

    fn before_write(&self, _offset: usize, _len: usize) -> Result<()> {
        self.obj.check_live()
    }

    fn after_write(&self, offset: usize, len: usize) -> Result<()> {
        self.core.persist(self.obj.offset + offset as u64, len)
    }

    fn raw_read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.core.read(self.obj.offset + offset as u64, dst)
    }

    fn raw_write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.core.write(self.obj.offset + offset as u64, src)
    }
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("offset", &self.obj.offset)
            .field("size", &self.obj.size)
            .field("deleted", &self.obj.is_deleted())
            .finish()
    }
}
