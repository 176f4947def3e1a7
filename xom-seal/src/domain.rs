use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::capability::XomMode;
use crate::error::{XomError, XomResult};
use crate::frame::{Gfn, LockBitmap, PageState};
use crate::guest::{GuestMemory, P2mAccess};
use crate::index::FrameIndex;
use crate::regclear::RegClearType;

static XOM_DOMAIN_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Debug)]
pub struct DomainConfig {
    /// Guest size, in frames.
    pub nr_pages: usize,
    /// Upper bound on records per XOM index. Running into it makes the
    /// operation that needed a new record fail with `ResourceExhausted`.
    pub max_records: usize,
    /// Backend the domain is enforced with. Only address-translation based
    /// domains accept sealing hypercalls.
    pub mode: XomMode,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            nr_pages: 256,
            max_records: 4096,
            mode: XomMode::AddressTranslationBased,
        }
    }
}

/// XOM metadata of one domain. Only ever accessed with the domain's XOM lock
/// held.
#[derive(Debug)]
pub(crate) struct XomMetadata {
    /// Lock bitmaps of the frames in sub-page mode.
    pub(crate) subpages: FrameIndex<LockBitmap>,
    /// Register-clear markings of sealed frames.
    pub(crate) reg_clear: FrameIndex<RegClearType>,
}

/// One virtual machine, as seen by the XOM enforcement layer.
///
/// Owns the guest frames, both XOM indexes, and the lock serialising every
/// sealing operation. Lock order is XOM lock first, then the guest memory
/// (p2m) lock.
pub struct IsolationDomain {
    id: usize,
    log_prefix: String,
    mode: XomMode,
    memory: GuestMemory,
    xom: Mutex<XomMetadata>,
}

impl IsolationDomain {
    pub fn new(config: DomainConfig) -> XomResult<Self> {
        let id = XOM_DOMAIN_COUNT.fetch_add(1, Ordering::Relaxed);
        let log_prefix = format!("XomDomain[#{}]:", id);
        info!(
            "{} Creating domain with {} frames, mode {:?}",
            log_prefix, config.nr_pages, config.mode
        );

        let memory = GuestMemory::new(&log_prefix, config.nr_pages)?;

        Ok(IsolationDomain {
            id,
            log_prefix,
            mode: config.mode,
            memory,
            xom: Mutex::new(XomMetadata {
                subpages: FrameIndex::with_limit(config.max_records),
                reg_clear: FrameIndex::with_limit(config.max_records),
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn mode(&self) -> XomMode {
        self.mode
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Whether sealing hypercalls are accepted for this domain.
    pub fn is_xom_capable(&self) -> bool {
        self.mode == XomMode::AddressTranslationBased
    }

    pub(crate) fn check_capable(&self) -> XomResult<()> {
        if self.is_xom_capable() {
            Ok(())
        } else {
            Err(XomError::Unsupported)
        }
    }

    pub(crate) fn lock_xom(&self) -> MutexGuard<'_, XomMetadata> {
        // Every element commits atomically before the lock is released, so
        // the metadata is consistent even if a holder panicked:
        self.xom.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current enforcement state of `gfn`, or `None` if it is not mapped.
    pub fn page_state(&self, gfn: Gfn) -> Option<PageState> {
        let xom = self.lock_xom();
        let access = self.memory.access(gfn)?;
        Some(match (access, xom.subpages.contains(gfn)) {
            (P2mAccess::X, true) => PageState::SealedSubpageMode,
            (P2mAccess::X, false) => PageState::SealedWholePage,
            (P2mAccess::Rwx, _) => PageState::Normal,
        })
    }

    /// Lock bitmap of a frame in sub-page mode.
    pub fn lock_bitmap(&self, gfn: Gfn) -> Option<LockBitmap> {
        self.lock_xom().subpages.get(gfn).copied()
    }

    /// Register-clear marking of `gfn`, without any address translation.
    pub fn register_clear_type(&self, gfn: Gfn) -> RegClearType {
        self.lock_xom()
            .reg_clear
            .get(gfn)
            .copied()
            .unwrap_or(RegClearType::None)
    }

    /// Number of (lock-bitmap, register-clear) records currently held.
    pub fn record_counts(&self) -> (usize, usize) {
        let xom = self.lock_xom();
        (xom.subpages.len(), xom.reg_clear.len())
    }
}

impl Drop for IsolationDomain {
    fn drop(&mut self) {
        let xom = self.xom.get_mut().unwrap_or_else(PoisonError::into_inner);
        let subpages = xom.subpages.clear();
        let reg_clear = xom.reg_clear.clear();
        debug!(
            "{} Freed {} lock-bitmap and {} register-clear records",
            self.log_prefix, subpages, reg_clear
        );
        info!("{} Domain destroyed", self.log_prefix);
    }
}
