//! Guest frames of an isolation domain and their second-level access rights.
//!
//! The frames live in a single `memfd`, mapped once into the host. Every frame
//! carries an access entry (read-write-execute, or execute-only once sealed)
//! and a page type. The guest-facing accessors honour the access entry the
//! way the hardware would for a guest; the privileged accessors used by the
//! sealing protocol map frames regardless of it, as the hypervisor does.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use crate::error::{XomError, XomResult};
use crate::frame::{Gfn, GuestAddr};
use crate::PAGE_SIZE;

/// Second-level permission of a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum P2mAccess {
    Rwx,
    /// Instruction fetch only.
    X,
}

/// Type/ownership of a frame. Only `Writable` frames may be written by the
/// privileged layer; `Pinned` stands for frames held with another type (page
/// tables, grant mappings, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageType {
    Writable,
    Pinned,
}

#[derive(Copy, Clone, Debug)]
struct P2mEntry {
    access: P2mAccess,
    page_type: PageType,
}

pub(crate) struct P2m {
    base: *mut u8,
    p2m: Vec<P2mEntry>,
}

// The mapping is only ever touched through the mutex that owns this struct:
unsafe impl Send for P2m {}

impl P2m {
    fn entry(&self, gfn: Gfn) -> Option<&P2mEntry> {
        usize::try_from(gfn.0).ok().and_then(|i| self.p2m.get(i))
    }

    pub(crate) fn access(&self, gfn: Gfn) -> Option<P2mAccess> {
        self.entry(gfn).map(|e| e.access)
    }

    pub(crate) fn page_type(&self, gfn: Gfn) -> Option<PageType> {
        self.entry(gfn).map(|e| e.page_type)
    }

    pub(crate) fn set_access(&mut self, gfn: Gfn, access: P2mAccess) -> XomResult<()> {
        let entry = usize::try_from(gfn.0)
            .ok()
            .and_then(|i| self.p2m.get_mut(i))
            .ok_or(XomError::Range)?;
        entry.access = access;
        Ok(())
    }

    fn page_offset(&self, gfn: Gfn) -> XomResult<usize> {
        match usize::try_from(gfn.0) {
            Ok(i) if i < self.p2m.len() => Ok(i * PAGE_SIZE),
            _ => Err(XomError::Range),
        }
    }

    /// Map a frame for reading, ignoring its access rights.
    pub(crate) fn map_page(&self, gfn: Gfn) -> XomResult<&[u8]> {
        let offset = self.page_offset(gfn)?;
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), PAGE_SIZE) })
    }

    /// Map a frame for writing, ignoring its access rights. The frame must be
    /// of the writable type.
    pub(crate) fn map_page_mut(&mut self, gfn: Gfn) -> XomResult<&mut [u8]> {
        let offset = self.page_offset(gfn)?;
        if self.page_type(gfn) != Some(PageType::Writable) {
            return Err(XomError::PermissionDenied);
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), PAGE_SIZE) })
    }

    // Walk `len` bytes starting at `addr` page by page, calling `f` with each
    // frame and the byte range inside it.
    fn for_each_chunk(
        &self,
        addr: GuestAddr,
        len: usize,
        mut f: impl FnMut(&Self, Gfn, std::ops::Range<usize>, usize) -> XomResult<()>,
    ) -> XomResult<()> {
        let mut done = 0;
        while done < len {
            let cur = GuestAddr(addr.0.checked_add(done as u64).ok_or(XomError::Range)?);
            let start = cur.page_offset();
            let chunk = (PAGE_SIZE - start).min(len - done);
            f(self, cur.gfn(), start..start + chunk, done)?;
            done += chunk;
        }
        Ok(())
    }
}

pub struct GuestMemory {
    log_prefix: String,
    p2m: Mutex<P2m>,
    nr_pages: usize,
    tlb_flushes: AtomicUsize,
    // Keeps the backing file alive for as long as it is mapped:
    backing: memfd::Memfd,
}

impl GuestMemory {
    /// Create `nr_pages` zeroed, read-write-execute guest frames.
    pub fn new(log_prefix: &str, nr_pages: usize) -> XomResult<Self> {
        let len = nr_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(XomError::ResourceExhausted)?;
        if len == 0 {
            return Err(XomError::InvalidArgument);
        }

        let backing = memfd::MemfdOptions::default()
            .allow_sealing(true)
            .create(&format!("xom_guest_{}", nr_pages))
            .map_err(|e| {
                warn!("{} Unable to create guest memory memfd: {}", log_prefix, e);
                XomError::ResourceExhausted
            })?;
        backing.as_file().set_len(len as u64).map_err(|e| {
            warn!("{} Unable to size guest memory to {} bytes: {}", log_prefix, len, e);
            XomError::ResourceExhausted
        })?;

        // The guest's physical size is fixed from here on:
        backing
            .add_seals(&[
                memfd::FileSeal::SealShrink,
                memfd::FileSeal::SealGrow,
                memfd::FileSeal::SealSeal,
            ])
            .map_err(|e| {
                warn!("{} Failed to seal guest memory memfd: {}", log_prefix, e);
                XomError::ResourceExhausted
            })?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                backing.as_file().as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            warn!(
                "{} Failed mmapping {} guest frames: {}",
                log_prefix,
                nr_pages,
                std::io::Error::last_os_error()
            );
            return Err(XomError::ResourceExhausted);
        }
        debug!(
            "{} Mapped {} guest frames at {:p}",
            log_prefix, nr_pages, base
        );

        Ok(GuestMemory {
            log_prefix: log_prefix.to_string(),
            p2m: Mutex::new(P2m {
                base: base as *mut u8,
                p2m: vec![
                    P2mEntry {
                        access: P2mAccess::Rwx,
                        page_type: PageType::Writable,
                    };
                    nr_pages
                ],
            }),
            nr_pages,
            tlb_flushes: AtomicUsize::new(0),
            backing,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, P2m> {
        self.p2m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    /// Highest mapped frame.
    pub fn max_mapped_gfn(&self) -> Gfn {
        Gfn(self.nr_pages as u64 - 1)
    }

    /// Check that `count` frames starting at `gfn` are all mapped.
    pub fn check_range(&self, gfn: Gfn, count: u64) -> XomResult<()> {
        match gfn.0.checked_add(count) {
            Some(end) if end <= self.nr_pages as u64 => Ok(()),
            _ => Err(XomError::Range),
        }
    }

    pub fn access(&self, gfn: Gfn) -> Option<P2mAccess> {
        self.lock().access(gfn)
    }

    pub fn page_type(&self, gfn: Gfn) -> Option<PageType> {
        self.lock().page_type(gfn)
    }

    pub fn set_page_type(&self, gfn: Gfn, page_type: PageType) -> XomResult<()> {
        let mut p2m = self.lock();
        let i = usize::try_from(gfn.0).map_err(|_| XomError::Range)?;
        let entry = p2m.p2m.get_mut(i).ok_or(XomError::Range)?;
        entry.page_type = page_type;
        Ok(())
    }

    /// Guest data read. Faults on execute-only frames.
    pub fn guest_read(&self, addr: GuestAddr, len: usize) -> XomResult<Vec<u8>> {
        let p2m = self.lock();
        let mut out = vec![0u8; len];
        p2m.for_each_chunk(addr, len, |p2m, gfn, range, done| {
            if p2m.access(gfn).ok_or(XomError::Fault(gfn))? != P2mAccess::Rwx {
                return Err(XomError::Fault(gfn));
            }
            let page = p2m.map_page(gfn)?;
            out[done..done + range.len()].copy_from_slice(&page[range]);
            Ok(())
        })?;
        Ok(out)
    }

    /// Guest data write. Faults on execute-only frames; nothing is written
    /// unless every touched frame is writable.
    pub fn guest_write(&self, addr: GuestAddr, data: &[u8]) -> XomResult<()> {
        let p2m = self.lock();
        p2m.for_each_chunk(addr, data.len(), |p2m, gfn, _, _| {
            match p2m.access(gfn) {
                Some(P2mAccess::Rwx) => Ok(()),
                _ => Err(XomError::Fault(gfn)),
            }
        })?;

        let mut done = 0;
        while done < data.len() {
            let cur = GuestAddr(addr.0 + done as u64);
            let start = cur.page_offset();
            let chunk = (PAGE_SIZE - start).min(data.len() - done);
            let offset = p2m.page_offset(cur.gfn())?;
            // Guest stores go through the guest's own mapping, so the page
            // type does not matter here:
            let page = unsafe { std::slice::from_raw_parts_mut(p2m.base.add(offset), PAGE_SIZE) };
            page[start..start + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Instruction fetch. Permitted on both read-write-execute and
    /// execute-only frames.
    pub fn fetch(&self, addr: GuestAddr, len: usize) -> XomResult<Vec<u8>> {
        let p2m = self.lock();
        let mut out = vec![0u8; len];
        p2m.for_each_chunk(addr, len, |p2m, gfn, range, done| {
            let page = p2m.map_page(gfn).map_err(|_| XomError::Fault(gfn))?;
            out[done..done + range.len()].copy_from_slice(&page[range]);
            Ok(())
        })?;
        Ok(out)
    }

    /// Invalidate cached translations for the whole domain.
    pub fn flush_tlb(&self) {
        let n = self.tlb_flushes.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("{} TLB flush #{}", self.log_prefix, n);
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.load(Ordering::Relaxed)
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        let p2m = self.p2m.get_mut().unwrap_or_else(PoisonError::into_inner);
        let res = unsafe { libc::munmap(p2m.base as *mut libc::c_void, self.nr_pages * PAGE_SIZE) };
        if res != 0 {
            warn!(
                "{} Failed to unmap guest memory (memfd {}): {}",
                self.log_prefix,
                self.backing.as_file().as_raw_fd(),
                std::io::Error::last_os_error()
            );
        }
    }
}
