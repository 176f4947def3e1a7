use std::fmt;

use crate::{PAGE_SIZE, SUBPAGE_SIZE, SUBPAGES_PER_PAGE};

/// Guest frame number: a domain's logical page address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gfn(pub u64);

impl Gfn {
    pub fn addr(self) -> GuestAddr {
        GuestAddr(self.0 * PAGE_SIZE as u64)
    }

    /// The frame `n` frames after this one, if that is representable.
    pub fn checked_add(self, n: u64) -> Option<Gfn> {
        self.0.checked_add(n).map(Gfn)
    }
}

impl fmt::Display for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Guest (physical) address. Inside a domain, sealed code is invoked through
/// addresses of this kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    pub fn gfn(self) -> Gfn {
        Gfn(self.0 / PAGE_SIZE as u64)
    }

    pub fn page_offset(self) -> usize {
        (self.0 % PAGE_SIZE as u64) as usize
    }

    /// Index of the sub-page this address falls into, within its page.
    pub fn subpage(self) -> usize {
        self.page_offset() / SUBPAGE_SIZE
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-page record of which sub-pages have been written and locked.
///
/// Bits only ever get set. A record is dropped as a whole when its page is
/// unsealed, which also scrubs the page content.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockBitmap(u32);

impl LockBitmap {
    pub const BITS: usize = u32::BITS as usize;
    pub const FULL: LockBitmap = LockBitmap(u32::MAX);

    pub const fn empty() -> Self {
        LockBitmap(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_locked(self, subpage: usize) -> bool {
        subpage < SUBPAGES_PER_PAGE && self.0 & (1 << subpage) != 0
    }

    /// Lock `subpage`. Returns `false` if it is out of range or was already
    /// locked, in which case the bitmap is left as it was.
    pub fn lock(&mut self, subpage: usize) -> bool {
        if subpage >= SUBPAGES_PER_PAGE || self.is_locked(subpage) {
            return false;
        }
        self.0 |= 1 << subpage;
        true
    }

    pub fn count_locked(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_full(self) -> bool {
        self == Self::FULL
    }
}

/// Enforcement state of a single guest frame. A frame is in exactly one of
/// these at any time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageState {
    Normal,
    SealedWholePage,
    SealedSubpageMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_bits_are_monotonic() {
        let mut bm = LockBitmap::empty();
        assert!(bm.lock(0));
        assert!(bm.lock(31));
        assert!(!bm.lock(31));
        assert!(!bm.lock(32));
        assert_eq!(bm.count_locked(), 2);
        assert!(bm.is_locked(0) && bm.is_locked(31));
        assert!(!bm.is_locked(1));
        assert!(!bm.is_locked(40));
    }

    #[test]
    fn full_bitmap() {
        let mut bm = LockBitmap::empty();
        for i in 0..SUBPAGES_PER_PAGE {
            assert!(bm.lock(i));
        }
        assert!(bm.is_full());
        assert_eq!(bm.count_locked(), SUBPAGES_PER_PAGE);
    }

    #[test]
    fn address_decomposition() {
        let addr = GuestAddr(0x5000 + 3 * SUBPAGE_SIZE as u64 + 7);
        assert_eq!(addr.gfn(), Gfn(5));
        assert_eq!(addr.subpage(), 3);
        assert_eq!(addr.page_offset(), 3 * SUBPAGE_SIZE + 7);
        assert_eq!(Gfn(5).addr(), GuestAddr(0x5000));
    }
}
