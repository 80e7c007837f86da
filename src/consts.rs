//! Общие константы форматов (metadata file, append-only log, array store, heap).

// -------- Hardware --------
/// Flush granularity assumed for record placement.
pub const CACHE_LINE_SIZE: usize = 64;
/// Internal write block of the persistent media.
pub const BLOCK_SIZE: usize = 256;
/// Minimum padding that keeps record headers int-aligned.
pub const INT_SIZE: usize = 4;

// -------- Metadata side-file (".pmem") --------
// Layout (256 B): [magic8="TRBMFCM1"][watermark u32 BE][zero pad]
pub const META_MAGIC: &[u8; 8] = b"TRBMFCM1";
pub const META_FILE_SIZE: usize = 256;
pub const META_OFF_WATERMARK: usize = 8;
pub const META_FILE_EXT: &str = "pmem";

// -------- Append-only log --------
// Layout: [magic8="TRBAOL01"][padding u32][checkpoint u32][linear u32][records...]
// Record: [len u32][crc32c u32][payload][pad to padding size]
pub const LOG_MAGIC: &[u8; 8] = b"TRBAOL01";
pub const LOG_OFF_MAGIC: usize = 0;
pub const LOG_OFF_PADDING: usize = 8;
pub const LOG_OFF_CHECKPOINT: usize = 12;
pub const LOG_OFF_LINEAR: usize = 16;
pub const LOG_FIRST_RECORD: usize = 20;
pub const LOG_HDR_SIZE: usize = LOG_FIRST_RECORD;
pub const LOG_REC_HDR_SIZE: usize = 8;

// -------- Array store --------
// Slot: [len u32][crc32c u32][payload][zero pad to slot size]
pub const SLOT_HDR_SIZE: usize = 8;

// -------- Heap / allocator --------
/// Largest size class; also the granule smaller classes are carved from.
pub const HEAP_PAGE_SIZE: u64 = 4 * 1024 * 1024;
/// Smallest size class.
pub const MIN_ELEMENT_SIZE: u64 = 8;

// -------- Scrub --------
pub const ZERO_CHUNK: usize = 1024 * 1024;
