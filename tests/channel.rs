use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use QuiverPM::channel::{metadata_path, MappedFileChannel, MetadataFile};
use QuiverPM::config::{MapModePref, PmemConfig};
use QuiverPM::error::PmemError;

#[test]
fn sequential_writes_then_read_back() -> Result<()> {
    let root = unique_root("ch-s4");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("data.bin");

    let ch = MappedFileChannel::open(&path, 1024, &cfg)?;
    assert_eq!(ch.write(&[0x41])?, 1);
    assert_eq!(ch.write(&[0x42])?, 1);
    ch.set_position(0)?;
    let mut buf = [0u8; 2];
    assert_eq!(ch.read(&mut buf)?, Some(2));
    assert_eq!(buf, [0x41, 0x42]);
    assert_eq!(ch.read(&mut buf)?, None);

    assert!(matches!(ch.write_at(&[0x43], 0), Err(PmemError::InvalidArgument(_))));
    ch.close()?;
    assert_eq!(fs::metadata(&path)?.len(), 2);
    Ok(())
}

#[test]
fn watermark_grows_with_each_write() -> Result<()> {
    let root = unique_root("ch-watermark");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let ch = MappedFileChannel::open(&root.join("data.bin"), 4096, &cfg)?;

    let mut total = 0u64;
    let mut last = ch.persisted_size()?;
    for n in [1usize, 7, 64, 300, 13] {
        ch.write(&vec![0x5A; n])?;
        total += n as u64;
        let now = ch.persisted_size()?;
        assert!(now >= last);
        assert_eq!(now, total);
        last = now;
    }
    for pos in [0u64, 1, total - 1] {
        assert!(matches!(ch.write_at(b"x", pos), Err(PmemError::InvalidArgument(_))));
    }
    // writes stop at the declared length
    ch.set_position(4090)?;
    assert_eq!(ch.write(&[1u8; 100])?, 6);
    assert!(matches!(ch.set_position(4097), Err(PmemError::InvalidArgument(_))));
    Ok(())
}

#[test]
fn reopen_resumes_from_watermark() -> Result<()> {
    let root = unique_root("ch-reopen");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("data.bin");
    {
        let ch = MappedFileChannel::open(&path, 1024, &cfg)?;
        ch.write(b"hello ")?;
        ch.close()?;
    }
    let ch = MappedFileChannel::open(&path, 1024, &cfg)?;
    assert_eq!(ch.persisted_size()?, 6);
    ch.write_at(b"world", 6)?;
    let mut buf = [0u8; 16];
    assert_eq!(ch.read_at(&mut buf, 0)?, Some(11));
    assert_eq!(&buf[..11], b"hello world");
    Ok(())
}

#[test]
fn read_shared_follower_tracks_writer() -> Result<()> {
    let root = unique_root("ch-follower");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("data.bin");

    let writer = MappedFileChannel::open(&path, 1024, &cfg)?;
    writer.write(b"abc")?;
    let follower = MappedFileChannel::open_read_shared(&path, 1024, &cfg)?;
    assert!(follower.is_read_shared());
    assert_eq!(follower.persisted_size()?, 3);

    writer.write(b"def")?;
    let mut buf = [0u8; 8];
    assert_eq!(follower.read_at(&mut buf, 0)?, Some(6));
    assert_eq!(&buf[..6], b"abcdef");
    assert!(matches!(follower.write(b"x"), Err(PmemError::IllegalState(_))));

    // followers never truncate
    follower.close()?;
    assert_eq!(fs::metadata(&path)?.len(), 1024);
    Ok(())
}

#[test]
fn clear_resets_watermark_and_data() -> Result<()> {
    let root = unique_root("ch-clear");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let ch = MappedFileChannel::open(&root.join("data.bin"), 512, &cfg)?;
    ch.write(b"to be scrubbed")?;
    ch.clear()?;
    assert_eq!(ch.persisted_size()?, 0);
    assert_eq!(ch.position()?, 0);
    ch.write(b"new")?;
    let mut buf = [0u8; 3];
    assert_eq!(ch.read_at(&mut buf, 0)?, Some(3));
    assert_eq!(&buf, b"new");
    Ok(())
}

#[test]
fn metadata_lifecycle() -> Result<()> {
    let root = unique_root("ch-meta");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let path = root.join("data.bin");
    let meta = metadata_path(&path);
    assert_eq!(meta, root.join("data.bin.pmem"));

    // orphan metadata without a data file is discarded
    {
        let m = MetadataFile::open(&meta, false, &cfg)?;
        m.persist(0, 77)?;
        m.close()?;
    }
    let ch = MappedFileChannel::open(&path, 256, &cfg)?;
    assert_eq!(ch.persisted_size()?, 0);

    assert!(matches!(ch.delete_metadata(), Err(PmemError::IllegalState(_))));
    ch.close()?;
    assert!(meta.exists());
    ch.delete_metadata()?;
    assert!(!meta.exists());
    assert!(matches!(ch.position(), Err(PmemError::Closed)));
    Ok(())
}

#[test]
fn unsupported_operations() -> Result<()> {
    let root = unique_root("ch-unsupported");
    fs::create_dir_all(&root)?;
    let cfg = test_cfg();
    let ch = MappedFileChannel::open(&root.join("data.bin"), 256, &cfg)?;
    assert!(matches!(ch.truncate(0), Err(PmemError::Unsupported(_))));
    assert!(matches!(ch.write_vectored(&[&b"a"[..]]), Err(PmemError::Unsupported(_))));
    assert!(matches!(ch.lock(0, 1, false), Err(PmemError::Unsupported(_))));
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
