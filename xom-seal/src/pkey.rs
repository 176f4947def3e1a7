//! Execute-only memory from protection keys, without a hypervisor.
//!
//! Groups are mapped read-write-execute and tagged with a key whose data
//! access is disabled in PKRU. Instruction fetches are not subject to
//! protection keys, so the content can be executed but neither read nor
//! written. To fill a sub-page, the key is opened on the current thread for
//! the duration of the copy only. Write-once is enforced in process, through
//! the same ledger the hypervisor-backed client keeps.

use std::ffi::c_int;

use log::{debug, info, trace, warn};

use crate::error::{XomError, XomResult};
use crate::ledger::GroupLedger;
use crate::{bytes_to_subpages, PAGE_SIZE, SCRUB_BYTE, SUBPAGE_SIZE};

// Initial PKRU rights for a freshly allocated key:
const PKEY_DISABLE_ACCESS: libc::c_ulong = 0x1;

// Two PKRU bits per key: access-disable and write-disable.
const PKRU_ALLOW_ALL: u32 = 0b11;

#[inline]
fn rdpkru() -> u32 {
    let pkru: u32;
    unsafe {
        std::arch::asm!(
            "rdpkru",
            in("ecx") 0,
            out("eax") pkru,
            out("edx") _,
            options(nostack, preserves_flags),
        );
    }
    pkru
}

#[inline]
unsafe fn wrpkru(pkru: u32) {
    std::arch::asm!(
        "wrpkru",
        in("eax") pkru,
        in("ecx") 0,
        in("edx") 0,
        options(nostack, preserves_flags),
    );
}

/// A group of pages tagged with the backend's key.
#[derive(Debug)]
pub struct PkeyGroup {
    base: *mut u8,
    nr_pages: usize,
    ledger: GroupLedger,
}

// The mapping is owned by the group and only written through `PkeyXom`:
unsafe impl Send for PkeyGroup {}

impl PkeyGroup {
    pub fn addr(&self) -> usize {
        self.base as usize
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub fn ledger(&self) -> &GroupLedger {
        &self.ledger
    }

    fn len(&self) -> usize {
        self.nr_pages * PAGE_SIZE
    }

    fn unit_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.addr())?;
        if offset >= self.len() {
            return None;
        }
        GroupLedger::offset_unit(offset)
    }
}

pub struct PkeyXom {
    log_prefix: String,
    pkey: c_int,
}

impl PkeyXom {
    /// Allocate a protection key for execute-only groups. `Unsupported` if
    /// the CPU or kernel has no protection keys, or none is left.
    pub fn new() -> XomResult<Self> {
        let pkey = unsafe {
            libc::syscall(
                libc::SYS_pkey_alloc,
                // Reserved flags argument, must be zero:
                0 as libc::c_ulong,
                PKEY_DISABLE_ACCESS,
            )
        };

        if pkey <= 0 {
            warn!(
                "PkeyXom: Failed to allocate a pkey: {}",
                std::io::Error::last_os_error()
            );
            return Err(XomError::Unsupported);
        }

        let pkey = pkey as c_int;
        let log_prefix = format!("PkeyXom[pkey {}]:", pkey);
        info!("{} Allocated protection key", log_prefix);

        Ok(PkeyXom { log_prefix, pkey })
    }

    pub fn pkey(&self) -> c_int {
        self.pkey
    }

    /// Run `f` with data access through this backend's key enabled on the
    /// current thread.
    pub(crate) fn with_key_open<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = rdpkru();
        let open = saved & !(PKRU_ALLOW_ALL << (self.pkey * 2));
        unsafe { wrpkru(open) };
        let res = f();
        unsafe { wrpkru(saved) };
        res
    }

    pub fn alloc_group(&mut self, size: usize) -> XomResult<PkeyGroup> {
        if size == 0 {
            return Err(XomError::InvalidArgument);
        }
        let nr_pages = size.div_ceil(PAGE_SIZE);
        let len = nr_pages * PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            warn!(
                "{} Failed mmapping {} pages: {}",
                self.log_prefix,
                nr_pages,
                std::io::Error::last_os_error()
            );
            return Err(XomError::ResourceExhausted);
        }

        // Unused sub-pages trap when executed:
        unsafe { std::ptr::write_bytes(base as *mut u8, SCRUB_BYTE, len) };

        let res = unsafe {
            libc::syscall(
                libc::SYS_pkey_mprotect,
                base,
                len,
                (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as libc::c_ulong,
                self.pkey as libc::c_ulong,
            )
        };
        if res != 0 {
            warn!(
                "{} Failed to pkey_mprotect {} pages at {:p}: {}",
                self.log_prefix,
                nr_pages,
                base,
                std::io::Error::last_os_error()
            );
            unsafe { libc::munmap(base, len) };
            return Err(XomError::PermissionDenied);
        }

        debug!(
            "{} Created group at {:p} with {} pages",
            self.log_prefix, base, nr_pages
        );
        Ok(PkeyGroup {
            base: base as *mut u8,
            nr_pages,
            ledger: GroupLedger::new(nr_pages),
        })
    }

    pub fn fill_and_lock(&mut self, group: &mut PkeyGroup, data: &[u8]) -> XomResult<usize> {
        let units = bytes_to_subpages(data.len());
        if units == 0 {
            return Err(XomError::InvalidArgument);
        }
        let start = group
            .ledger
            .find_free_run(units)
            .ok_or(XomError::ResourceExhausted)?;
        group.ledger.commit(start, units)?;

        let offset = GroupLedger::unit_offset(start);
        let padded = units * SUBPAGE_SIZE;
        self.with_key_open(|| unsafe {
            let dst = group.base.add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            std::ptr::write_bytes(dst.add(data.len()), SCRUB_BYTE, padded - data.len());
        });

        group.ledger.record(start, units);
        let addr = group.addr() + offset;
        trace!(
            "{} Locked {} bytes into {} sub-pages at {:#x}",
            self.log_prefix,
            data.len(),
            units,
            addr
        );
        Ok(addr)
    }

    /// Forget the blob at `addr`. Returns whether the group has no live blobs
    /// left.
    pub fn release(&mut self, group: &mut PkeyGroup, addr: usize) -> XomResult<bool> {
        let unit = group.unit_of(addr).ok_or(XomError::InvalidArgument)?;
        group.ledger.release(unit).ok_or(XomError::InvalidArgument)
    }

    pub fn free_group(&mut self, group: PkeyGroup) -> XomResult<()> {
        self.unmap_group(&group)
    }

    /// Unmap `group`. On failure it stays mapped and can be freed again.
    pub(crate) fn unmap_group(&mut self, group: &PkeyGroup) -> XomResult<()> {
        let res = unsafe { libc::munmap(group.base as *mut libc::c_void, group.len()) };
        if res != 0 {
            warn!(
                "{} Failed to unmap group at {:p}: {}",
                self.log_prefix,
                group.base,
                std::io::Error::last_os_error()
            );
            return Err(XomError::ResourceExhausted);
        }
        debug!(
            "{} Freed group at {:p} with {} pages",
            self.log_prefix, group.base, group.nr_pages
        );
        Ok(())
    }
}

impl Drop for PkeyXom {
    fn drop(&mut self) {
        let res = unsafe { libc::syscall(libc::SYS_pkey_free, self.pkey as libc::c_ulong) };
        if res != 0 {
            warn!(
                "{} Failed to free protection key: {}",
                self.log_prefix,
                std::io::Error::last_os_error()
            );
        }
    }
}
