use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use QuiverPM::array_store::{slot_size_for, ArrayStore};
use QuiverPM::config::{MapModePref, PmemConfig};
use QuiverPM::error::PmemError;
use QuiverPM::pmem::array_store_for;

#[test]
fn write_read_clear_slot() -> Result<()> {
    let root = unique_root("as-s3");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let store = ArrayStore::open(&root.join("slots.bin"), 100, 96, &cfg)?;
    assert_eq!(store.slot_size(), 256);

    store.write(7, &[7, 7, 7, 7])?;
    assert_eq!(store.read(7)?, Some(vec![7, 7, 7, 7]));
    store.clear(7, false)?;
    assert_eq!(store.read(7)?, None);

    store.write(8, &[1])?;
    store.write(8, &[])?;
    assert_eq!(store.read(8)?, None);
    Ok(())
}

#[test]
fn slots_survive_reopen_and_stay_independent() -> Result<()> {
    let root = unique_root("as-reopen");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("slots.bin");
    {
        let store = ArrayStore::open(&path, 16, 300, &cfg)?;
        for slot in 0..16 {
            store.write(slot, &vec![slot as u8; 10 + slot * 10])?;
        }
        store.close()?;
    }
    let store = ArrayStore::open(&path, 16, 300, &cfg)?;
    assert_eq!(store.slot_size(), slot_size_for(300));
    for slot in 0..16 {
        assert_eq!(store.read(slot)?, Some(vec![slot as u8; 10 + slot * 10]));
    }
    Ok(())
}

#[test]
fn corrupted_payload_reads_as_empty() -> Result<()> {
    let root = unique_root("as-corrupt");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("slots.bin");
    {
        let store = ArrayStore::open(&path, 4, 96, &cfg)?;
        store.write(2, b"hello")?;
        store.write(3, b"world")?;
        store.close()?;
    }

    // flip one payload byte of slot 2, leave the checksum alone
    let mut bytes = fs::read(&path)?;
    bytes[2 * 256 + 8] ^= 0xFF;
    fs::write(&path, &bytes)?;

    let store = ArrayStore::open(&path, 4, 96, &cfg)?;
    assert_eq!(store.read(2)?, None);
    assert_eq!(store.read(3)?, Some(b"world".to_vec()));
    Ok(())
}

#[test]
fn scrub_clears_only_the_requested_slot() -> Result<()> {
    let root = unique_root("as-scrub");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("slots.bin");
    let store = ArrayStore::open(&path, 4, 96, &cfg)?;
    store.write(0, b"slot zero")?;
    store.write(3, b"secret payload")?;
    store.clear(3, true)?;
    assert_eq!(store.read(3)?, None);
    assert_eq!(store.read(0)?, Some(b"slot zero".to_vec()));
    store.close()?;

    let bytes = fs::read(&path)?;
    assert!(bytes[3 * 256..4 * 256].iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn rejects_bad_slots_and_oversized_data() -> Result<()> {
    let root = unique_root("as-args");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let store = ArrayStore::open(&root.join("slots.bin"), 4, 96, &cfg)?;
    assert!(matches!(store.write(4, b"x"), Err(PmemError::InvalidArgument(_))));
    assert!(matches!(store.read(9), Err(PmemError::InvalidArgument(_))));
    assert!(matches!(store.write(0, &[0u8; 97]), Err(PmemError::InvalidData(_))));
    store.write(0, &[0u8; 96])?;

    store.close()?;
    store.close()?;
    assert!(matches!(store.read(0), Err(PmemError::Closed)));
    Ok(())
}

#[test]
fn factory_opens_store_with_regular_mapping() -> Result<()> {
    let root = unique_root("as-factory");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg().with_map_mode(MapModePref::Regular);
    let store = array_store_for(&root.join("slots.bin"), 8, 32, &cfg)?.expect("store");
    store.write(1, b"ok")?;
    assert_eq!(store.read(1)?, Some(b"ok".to_vec()));
    Ok(())
}

fn test_cfg() -> PmemConfig {
    let cfg = PmemConfig::from_env();
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
