use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use QuiverPM::config::{MapModePref, PmemConfig};
use QuiverPM::error::PmemError;
use QuiverPM::heap::{Layout, MemoryAccess, MemoryBackend, MemoryHeap};

const MIB: u64 = 1024 * 1024;

#[test]
fn objects_are_written_through_and_survive_reopen() -> Result<()> {
    let root = unique_root("heap-basic");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("heap.bin");
    let point = Layout::fields("point", &[8, 8, 4]);
    assert_eq!(point.size(), 20);

    let (offset, image) = {
        let heap = MemoryHeap::open(&path, 8 * MIB, &cfg)?;
        let p = heap.new_instance(&point)?;
        p.set_i64(0, -42)?;
        p.set_f64(8, 1.5)?;
        p.set_u32(16, 0xDEAD_BEEF)?;
        let image = heap.allocator_image()?;
        heap.close()?;
        (p.heap_offset(), image)
    };

    let heap = MemoryHeap::open(&path, 8 * MIB, &cfg)?;
    // the allocator is volatile until an image is restored
    assert!(heap.is_free(offset, point.size())?);
    heap.restore_allocator(&image)?;
    assert!(!heap.is_free(offset, point.size())?);

    let p = heap.attach_instance(&point, offset)?;
    assert_eq!(p.get_i64(0)?, -42);
    assert_eq!(p.get_f64(8)?, 1.5);
    assert_eq!(p.get_u32(16)?, 0xDEAD_BEEF);
    assert!(matches!(p.get_u32(17), Err(PmemError::InvalidArgument(_))));
    Ok(())
}

#[test]
fn deleted_handles_refuse_access() -> Result<()> {
    let root = unique_root("heap-delete");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let heap = MemoryHeap::open(&root.join("heap.bin"), 4 * MIB, &cfg)?;
    let layout = Layout::of_size("blob", 64);
    let h = heap.new_instance(&layout)?;
    let alias = h.clone();
    h.set_byte_array(0, b"abc")?;

    heap.delete(&h)?;
    assert!(alias.is_deleted());
    assert!(heap.is_free(h.heap_offset(), 64)?);
    assert!(matches!(alias.get_u8(0), Err(PmemError::IllegalState(_))));
    assert!(matches!(h.set_u8(0, 1), Err(PmemError::IllegalState(_))));
    assert!(matches!(heap.delete(&h), Err(PmemError::IllegalState(_))));

    // the freed element is handed out again
    let again = heap.new_instance(&layout)?;
    assert_eq!(again.heap_offset(), h.heap_offset());
    Ok(())
}

#[test]
fn exhausted_heap_reports_out_of_memory() -> Result<()> {
    let root = unique_root("heap-oom");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let heap = MemoryHeap::open(&root.join("heap.bin"), 4 * MIB, &cfg)?;
    let page = Layout::of_size("page", (4 * MIB) as usize);
    let _all = heap.new_instance(&page)?;
    match heap.new_instance(&Layout::of_size("tiny", 8)) {
        Err(PmemError::OutOfMemory { size }) => assert_eq!(size, 8),
        other => panic!("expected OutOfMemory, got {:?}", other.map(|h| h.heap_offset())),
    }
    assert!(matches!(
        heap.new_instance(&Layout::of_size("huge", (8 * MIB) as usize)),
        Err(PmemError::OutOfMemory { .. })
    ));
    assert!(matches!(
        heap.new_instance(&Layout::of_size("empty", 0)),
        Err(PmemError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn small_heaps_and_stray_offsets_are_rejected() -> Result<()> {
    let root = unique_root("heap-args");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    assert!(matches!(
        MemoryHeap::open(&root.join("small.bin"), MIB, &cfg),
        Err(PmemError::InvalidArgument(_))
    ));
    let heap = MemoryHeap::open(&root.join("heap.bin"), 4 * MIB, &cfg)?;
    assert!(matches!(
        heap.attach_instance(&Layout::of_size("x", 16), 4 * MIB - 8),
        Err(PmemError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn close_is_idempotent_and_final() -> Result<()> {
    let root = unique_root("heap-close");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let heap = MemoryHeap::open(&root.join("heap.bin"), 4 * MIB, &cfg)?;
    let h = heap.new_instance(&Layout::of_size("x", 8))?;
    heap.close()?;
    heap.close()?;
    assert!(!heap.is_open());
    assert!(matches!(h.get_u64(0), Err(PmemError::Closed)));
    assert!(matches!(heap.new_instance(&Layout::of_size("x", 8)), Err(PmemError::Closed)));
    Ok(())
}

fn test_cfg() -> PmemConfig {
    let cfg = PmemConfig::from_env().with_preallocate(false);
    if cfg.map_mode == MapModePref::Sync {
        cfg
    } else {
        cfg.with_map_mode(MapModePref::Regular)
    }
}

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    test_cfg()
        .scratch_dir()
        .join(format!("qpm-{}-{}-{}", prefix, pid, t))
}
