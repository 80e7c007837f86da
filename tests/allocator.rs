use anyhow::Result;
use oorandom::Rand64;
use std::collections::BTreeMap;

use QuiverPM::alloc::CompositeAllocator;
use QuiverPM::error::PmemError;

const MIB: u64 = 1024 * 1024;

/// Live allocations never overlap, and their rounded extents stay inside the heap.
fn assert_disjoint(live: &BTreeMap<u64, u64>, heap: u64) {
    let mut prev_end = 0u64;
    for (&addr, &extent) in live {
        assert!(addr >= prev_end, "allocation at {} overlaps previous ending at {}", addr, prev_end);
        prev_end = addr + extent;
    }
    assert!(prev_end <= heap);
}

#[test]
fn random_allocate_free_keeps_allocations_distinct() -> Result<()> {
    let heap = 32 * MIB;
    let mut a = CompositeAllocator::new(0, heap)?;
    let mut rng = Rand64::new(0xA110C);
    // addr -> requested size
    let mut sizes: BTreeMap<u64, u64> = BTreeMap::new();
    // addr -> rounded extent
    let mut live: BTreeMap<u64, u64> = BTreeMap::new();

    for step in 0..4000 {
        let dice = rng.rand_u64() % 10;
        if dice < 6 || live.is_empty() {
            let size = match rng.rand_u64() % 4 {
                0 => 1 + rng.rand_u64() % 64,
                1 => 1 + rng.rand_u64() % 4096,
                2 => 1 + rng.rand_u64() % (256 * 1024),
                _ => 1 + rng.rand_u64() % (2 * MIB),
            };
            if let Some(addr) = a.allocate(size) {
                let extent = a.rounded_size(size).expect("size class");
                assert!(!live.contains_key(&addr), "step {}: {} handed out twice", step, addr);
                assert!(!a.is_free(addr, size)?);
                live.insert(addr, extent);
                sizes.insert(addr, size);
            }
        } else {
            let idx = (rng.rand_u64() as usize) % live.len();
            let addr = *live.keys().nth(idx).expect("live entry");
            let size = sizes.remove(&addr).expect("size");
            live.remove(&addr);
            a.free(addr, size)?;
            assert!(a.is_free(addr, size)?);
        }
        if step % 250 == 0 {
            assert_disjoint(&live, heap);
        }
    }
    assert_disjoint(&live, heap);
    Ok(())
}

#[test]
fn free_then_allocate_reuses_address() -> Result<()> {
    let mut a = CompositeAllocator::new(0, 8 * MIB)?;
    let x = a.allocate(100).expect("x");
    let _y = a.allocate(100).expect("y");
    a.free(x, 100)?;
    assert_eq!(a.allocate(120), Some(x));
    Ok(())
}

#[test]
fn invalid_frees_are_rejected() -> Result<()> {
    let mut a = CompositeAllocator::new(0, 8 * MIB)?;
    let x = a.allocate(64).expect("x");
    assert!(matches!(a.free(x + 8, 64), Err(PmemError::InvalidArgument(_))));
    assert!(matches!(a.free(x, 5 * MIB), Err(PmemError::InvalidArgument(_))));
    a.free(x, 64)?;
    assert!(matches!(a.free(x, 64), Err(PmemError::InvalidArgument(_))));
    Ok(())
}

#[test]
fn exhaustion_returns_none_not_error() -> Result<()> {
    let mut a = CompositeAllocator::new(0, 4 * MIB)?;
    // one page: either a 4 MiB object or a sub-region, never both
    let small = a.allocate(16).expect("small");
    assert_eq!(a.allocate(4 * MIB), None);
    a.free(small, 16)?;
    // the sub-region stays carved out
    assert_eq!(a.allocate(4 * MIB), None);
    assert_eq!(a.allocate(16), Some(small));
    Ok(())
}

#[test]
fn image_restores_allocation_state() -> Result<()> {
    let mut a = CompositeAllocator::new(0, 32 * MIB)?;
    let mut taken = Vec::new();
    for size in [8u64, 24, 1000, 70_000, 3 * MIB] {
        taken.push((a.allocate(size).expect("alloc"), size));
    }
    let mut b = CompositeAllocator::from_bytes(&a.to_bytes())?;
    for (addr, size) in &taken {
        assert!(!b.is_free(*addr, *size)?);
    }
    // both copies now make the same decisions
    assert_eq!(a.allocate(24), b.allocate(24));
    assert_eq!(a.region_counts(), b.region_counts());
    Ok(())
}
