use std::sync::Arc;

use xom_seal::{
    bytes_to_subpages, DomainConfig, GroupStats, GuestAddr, IsolationDomain, PageState,
    PoolConfig, RegClearType, SubpagePool, SubpageWriteCommand, XomClient, XomError, XomOp,
    PAGE_SIZE, SUBPAGE_SIZE,
};

fn pool_with(nr_pages: usize, config: PoolConfig) -> SubpagePool<XomClient> {
    let _ = env_logger::builder().is_test(true).try_init();
    let domain = IsolationDomain::new(DomainConfig {
        nr_pages,
        ..Default::default()
    })
    .unwrap();
    let client = XomClient::new(Arc::new(domain)).unwrap();
    SubpagePool::with_config(client, config).unwrap()
}

fn pool(nr_pages: usize) -> SubpagePool<XomClient> {
    pool_with(nr_pages, PoolConfig::default())
}

#[test]
fn scenario() {
    let mut pool = pool(64);
    let config = pool.config().clone();
    assert_eq!(config.capacity(), 512);
    assert_eq!(bytes_to_subpages(200), 2);

    let blob_a = vec![0x5a; 200];
    let a = pool.acquire(&blob_a).unwrap();
    assert_eq!(pool.group_count(), 1);
    assert_eq!(
        pool.stats()[0],
        GroupStats {
            addr: a,
            consumed: 2,
            live_units: 2,
            live_blobs: 1,
        }
    );

    // Writing again into the sub-page blob A landed on is refused:
    let d = pool.provider().domain().clone();
    let a_addr = GuestAddr(a as u64);
    let buf = xom_seal::Gfn(63);
    let mut cmd = SubpageWriteCommand::new();
    cmd.push(a_addr.subpage() as u8, &[0xff; SUBPAGE_SIZE]).unwrap();
    d.memory().guest_write(buf.addr(), &cmd.encode()).unwrap();
    let out = d.handle_xom_seal(
        &[XomOp::write_subpages(a_addr.gfn(), buf)],
        &xom_seal::NoPreempt,
    );
    assert_eq!(out.result, Err(XomError::InvalidArgument));
    assert_eq!(&d.memory().fetch(a_addr, 200).unwrap(), &blob_a);

    // Two units of 512 are far below the threshold, so the drained group
    // stays sealed until the pool is torn down:
    pool.release(a).unwrap();
    assert_eq!(pool.group_count(), 1);
    assert_eq!(pool.stats()[0].live_blobs, 0);
    assert_eq!(d.page_state(a_addr.gfn()), Some(PageState::SealedSubpageMode));

    pool.destroy_all().unwrap();
    assert_eq!(pool.group_count(), 0);
    assert_eq!(d.page_state(a_addr.gfn()), Some(PageState::Normal));
    assert_eq!(d.record_counts(), (0, 0));
}

#[test]
fn packs_until_capacity() {
    // 512 units per group, 3 units per blob: 170 blobs fit, the 171st opens
    // a second group.
    let mut pool = pool(64);
    let blob = vec![0x90; 3 * SUBPAGE_SIZE];
    let k = bytes_to_subpages(blob.len());
    let per_group = pool.config().capacity() / k;

    let mut addrs = vec![];
    for i in 0..per_group {
        addrs.push(pool.acquire(&blob).unwrap());
        assert_eq!(pool.group_count(), 1, "blob {} opened a new group", i);
    }
    assert_eq!(pool.stats()[0].consumed, per_group * k);

    let next = pool.acquire(&blob).unwrap();
    assert_eq!(pool.group_count(), 2);
    assert_eq!(pool.stats()[1].addr, next);

    // Blobs are packed back to back:
    for pair in addrs.windows(2) {
        assert_eq!(pair[1] - pair[0], k * SUBPAGE_SIZE);
    }

    // The newest group is tried first, even though the older one has a
    // couple of units left:
    let small = pool.acquire(&[0xc3]).unwrap();
    assert_eq!(small, next + k * SUBPAGE_SIZE);
}

#[test]
fn lightly_used_group_is_kept() {
    let mut pool = pool(64);
    let d = pool.provider().domain().clone();
    let flushes = d.memory().tlb_flushes();

    // Churn does not unseal and reseal a group for every blob:
    let mut last = None;
    for i in 0..5u8 {
        let a = pool.acquire(&[i; 200]).unwrap();
        if let Some(prev) = last {
            assert_eq!(a, prev + 2 * SUBPAGE_SIZE);
        }
        pool.release(a).unwrap();
        last = Some(a);
    }
    assert_eq!(pool.group_count(), 1);
    assert_eq!(pool.stats()[0].consumed, 10);
    assert_eq!(d.memory().tlb_flushes(), flushes + 1);
}

#[test]
fn used_up_group_is_reclaimed() {
    let mut pool = pool(64);
    let threshold = pool.config().free_threshold;
    let d = pool.provider().domain().clone();

    let a = pool.acquire(&[1; 100]).unwrap();
    let b = pool.acquire(&vec![2; threshold * SUBPAGE_SIZE]).unwrap();
    let gfn = GuestAddr(a as u64).gfn();

    // Still in use:
    pool.release(a).unwrap();
    assert_eq!(pool.group_count(), 1);
    assert_eq!(d.page_state(gfn), Some(PageState::SealedSubpageMode));

    pool.release(b).unwrap();
    assert_eq!(pool.group_count(), 0);
    assert_eq!(d.page_state(gfn), Some(PageState::Normal));
    assert_eq!(d.record_counts(), (0, 0));

    // A reclaimed group is not scanned again; the next blob gets a fresh
    // group, starting at its first sub-page:
    let c = pool.acquire(&[3; 100]).unwrap();
    assert_eq!(pool.group_count(), 1);
    assert_eq!(pool.stats()[0].consumed, 1);
    assert_eq!(GuestAddr(c as u64).page_offset(), 0);
}

#[test]
fn release_of_unknown_address() {
    let mut pool = pool(64);
    let a = pool.acquire(&[1; 10]).unwrap();
    assert_eq!(pool.release(a + SUBPAGE_SIZE), Err(XomError::InvalidArgument));
    pool.release(a).unwrap();
    assert_eq!(pool.release(a), Err(XomError::InvalidArgument));
    assert_eq!(pool.group_count(), 1);
}

#[test]
fn custom_configuration() {
    let config = PoolConfig {
        group_size: 2 * PAGE_SIZE,
        free_threshold: 0,
        reg_clear: RegClearType::Full,
    };
    let mut pool = pool_with(16, config);
    let a = pool.acquire(&[0x90; PAGE_SIZE + 1]).unwrap();
    let d = pool.provider().domain().clone();
    let gfn = GuestAddr(a as u64).gfn();
    assert_eq!(d.register_clear_type(gfn), RegClearType::Full);
    assert_eq!(
        d.register_clear_type(xom_seal::Gfn(gfn.0 + 1)),
        RegClearType::Full
    );

    // 33 of 64 units used, so the next 32-unit blob needs a second group:
    pool.acquire(&[0x90; PAGE_SIZE]).unwrap();
    assert_eq!(pool.group_count(), 2);

    assert!(pool_with_err(PoolConfig {
        group_size: 0,
        ..Default::default()
    }));
}

fn pool_with_err(config: PoolConfig) -> bool {
    let domain = IsolationDomain::new(DomainConfig {
        nr_pages: 4,
        ..Default::default()
    })
    .unwrap();
    let client = XomClient::new(Arc::new(domain)).unwrap();
    matches!(
        SubpagePool::with_config(client, config),
        Err(XomError::InvalidArgument)
    )
}

#[test]
fn ineligible_domain_has_no_pool() {
    let domain = IsolationDomain::new(DomainConfig {
        nr_pages: 4,
        mode: xom_seal::XomMode::Unsupported,
        ..Default::default()
    })
    .unwrap();
    assert!(matches!(
        XomClient::new(Arc::new(domain)),
        Err(XomError::Unsupported)
    ));
}

#[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
#[test]
fn page_key_pool() {
    let Ok(xom) = xom_seal::PkeyXom::new() else {
        eprintln!("protection keys unavailable, skipping");
        return;
    };
    let mut pool = SubpagePool::new(xom);

    // mov eax, edi; ret
    let a = pool.acquire(&[0x89, 0xf8, 0xc3]).unwrap();
    let f: extern "C" fn(u32) -> u32 = unsafe { std::mem::transmute(a) };
    assert_eq!(f(7), 7);

    let b = pool.acquire(&[0x90; 300]).unwrap();
    assert_eq!(b, a + SUBPAGE_SIZE);
    assert_eq!(pool.group_count(), 1);

    pool.release(a).unwrap();
    pool.release(b).unwrap();
    assert_eq!(pool.group_count(), 1);
    pool.destroy_all().unwrap();
    assert_eq!(pool.group_count(), 0);
}
