//! Execute-only memory (XOM) sealing.
//!
//! This crate contains both halves of the XOM enforcement protocol:
//!
//! - the privileged half, an [`IsolationDomain`] that owns a guest's frames,
//!   their second-level access rights and the XOM metadata (the lock-bitmap
//!   index and the register-clear index), driven through
//!   [`IsolationDomain::handle_xom_seal`];
//! - the unprivileged half, a [`SubpagePool`] that packs many small,
//!   independently lockable blobs into shared execute-only page groups,
//!   talking to the privileged half through an [`XomClient`] (or, on hosts
//!   with protection keys, to the [`PkeyXom`] backend instead).
//!
//! Sealed content can be fetched as instructions but never read or written
//! again. Sub-pages are write-once: the only way to reuse one is to unseal the
//! whole page, which scrubs it.

// x86-64 always uses 4k pages for the frames we seal:
pub const PAGE_SIZE: usize = 4096;

// Each page is split into as many sub-pages as a lock bitmap has bits:
pub const SUBPAGES_PER_PAGE: usize = LockBitmap::BITS;
pub const SUBPAGE_SIZE: usize = PAGE_SIZE / SUBPAGES_PER_PAGE;

// A sub-page write command is one count byte, followed by (index, payload)
// entries packed back to back, all of it fitting into a single page:
pub const SUBPAGE_WRITE_ENTRY_SIZE: usize = 1 + SUBPAGE_SIZE;
pub const MAX_SUBPAGES_PER_CMD: usize = (PAGE_SIZE - 1) / SUBPAGE_WRITE_ENTRY_SIZE;

// Byte pattern written over a page when it is unsealed (INT3):
pub const SCRUB_BYTE: u8 = 0xcc;

const _: () = assert!(PAGE_SIZE % SUBPAGES_PER_PAGE == 0);
const _: () = assert!(SUBPAGE_SIZE == 128);
// Sub-page indices travel as a single byte on the wire:
const _: () = assert!(SUBPAGES_PER_PAGE <= u8::MAX as usize);
// The entry count travels as a single byte as well:
const _: () = assert!(MAX_SUBPAGES_PER_CMD <= u8::MAX as usize);

pub mod capability;
pub mod client;
pub mod domain;
pub mod error;
pub mod frame;
pub mod guest;
pub mod hypercall;
pub mod index;
pub mod ledger;
#[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
pub mod pkey;
pub mod pool;
pub mod regclear;
mod seal;

pub use capability::{detect, XomMode, XOM_MODE_ENV};
pub use client::{FrameAllocator, SubpageGroup, XomBuffer, XomClient};
pub use domain::{DomainConfig, IsolationDomain};
pub use error::{XomError, XomResult};
pub use frame::{Gfn, GuestAddr, LockBitmap, PageState};
pub use guest::{GuestMemory, P2mAccess, PageType};
pub use hypercall::{HypercallOutcome, NoPreempt, PreemptCheck, SubpageWriteCommand, XomCmd, XomOp};
pub use ledger::{GroupLedger, PageRun};
#[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
pub use pkey::{PkeyGroup, PkeyXom};
pub use pool::{BackendGroup, GroupStats, PoolConfig, SubpagePool, SubpageProvider, XomBackend};
pub use regclear::{
    GuestRegisters, GuestTranslator, IdentityTranslator, RegClearType, RegisterClearPolicy,
};

/// Number of sub-pages needed to hold `bytes` bytes.
pub const fn bytes_to_subpages(bytes: usize) -> usize {
    bytes.div_ceil(SUBPAGE_SIZE)
}
