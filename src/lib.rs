#![allow(non_snake_case)]

// Базовые модули
pub mod config;
pub mod consts;
pub mod error;
pub mod lock;
pub mod metrics;

// Отображение файлов и сброс диапазонов
pub mod pmem; // src/pmem/{mod,mapping,handle,util}.rs

// Хранилища поверх отображений
pub mod array_store;
pub mod aol; // src/aol/{mod,config,record,iter}.rs
pub mod channel; // src/channel/{mod,metadata}.rs

// Куча объектов и транзакции
pub mod alloc; // src/alloc/{mod,region,composite,persist}.rs
pub mod heap; // src/heap/{mod,access}.rs
pub mod tx; // src/tx/{mod,events,store,manager,heap}.rs

// CLI (quiverpm)
pub mod cli;

// Удобные реэкспорты
pub use alloc::{CompositeAllocator, RegionBitmap};
pub use aol::{AppendOnlyLog, LogConfig};
pub use array_store::ArrayStore;
pub use channel::{MappedFileChannel, MetadataFile};
pub use config::{MapModePref, PmemConfig, PmemConfigBuilder};
pub use error::{PmemError, Result};
pub use heap::{Layout, MemoryAccess, MemoryBackend, MemoryHandle, MemoryHeap};
pub use metrics::{metrics_reset, metrics_snapshot, MetricsSnapshot};
pub use pmem::{MapMode, MappedRegion, PersistenceHandle};
pub use tx::{Event, TransactionStore, TransactionalHeap, TxHandle};
