use std::sync::Arc;

use xom_seal::{
    detect, DomainConfig, IsolationDomain, SubpagePool, XomBackend, XomError, XomMode,
    XOM_MODE_ENV,
};

// Detection is cached per process, so this binary holds a single test.
#[test]
fn mode_override_selects_backend() {
    let _ = env_logger::builder().is_test(true).try_init();
    std::env::set_var(XOM_MODE_ENV, "none");

    assert_eq!(detect(), XomMode::Unsupported);
    assert!(!detect().is_supported());

    let domain = Arc::new(
        IsolationDomain::new(DomainConfig {
            nr_pages: 32,
            ..Default::default()
        })
        .unwrap(),
    );
    assert!(matches!(
        XomBackend::detect(domain.clone()),
        Err(XomError::Unsupported)
    ));

    // Naming the mode explicitly still works on the same domain:
    let backend = XomBackend::for_mode(XomMode::AddressTranslationBased, domain).unwrap();
    let mut pool = SubpagePool::new(backend);
    let a = pool.acquire(&[0xc3]).unwrap();
    pool.release(a).unwrap();
}
