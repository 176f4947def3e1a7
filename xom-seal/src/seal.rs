//! The sealing state machine.
//!
//! A frame is Normal (read-write-execute), sealed as a whole page
//! (execute-only, never written again), or sealed in sub-page mode
//! (execute-only, with a lock bitmap allowing each sub-page to be written
//! exactly once through the hypervisor). Unsealing scrubs the frame and drops
//! all of its metadata.
//!
//! Range operations validate every frame before touching any of them, so a
//! failed request never leaves a partially sealed range behind. All of the
//! `*_locked` functions expect the domain's XOM lock to be held by the caller.

use log::{debug, trace};

use crate::domain::{IsolationDomain, XomMetadata};
use crate::error::{XomError, XomResult};
use crate::frame::{Gfn, LockBitmap};
use crate::guest::{P2mAccess, PageType};
use crate::hypercall::SubpageWriteCommand;
use crate::regclear::{GuestTranslator, RegClearType};
use crate::{SCRUB_BYTE, SUBPAGE_SIZE};

fn frames(gfn: Gfn, count: u64) -> impl Iterator<Item = Gfn> {
    (gfn.0..gfn.0 + count).map(Gfn)
}

impl IsolationDomain {
    /// Make `count` frames starting at `gfn` execute-only, for good.
    pub fn seal_whole_pages(&self, gfn: Gfn, count: u64) -> XomResult<()> {
        self.check_capable()?;
        let mut xom = self.lock_xom();
        self.seal_whole_pages_locked(&mut xom, gfn, count)
    }

    /// Scrub and release every sealed frame in the range. Frames that are not
    /// sealed are skipped.
    pub fn unseal_pages(&self, gfn: Gfn, count: u64) -> XomResult<()> {
        self.check_capable()?;
        let mut xom = self.lock_xom();
        self.unseal_pages_locked(&mut xom, gfn, count)
    }

    /// Seal `count` frames in sub-page mode, each with an empty lock bitmap.
    pub fn create_subpages(&self, gfn: Gfn, count: u64) -> XomResult<()> {
        self.check_capable()?;
        let mut xom = self.lock_xom();
        self.create_subpages_locked(&mut xom, gfn, count)
    }

    /// Apply the [`SubpageWriteCommand`] found in `command_buffer` to `dest`.
    /// Either every entry is written and locked, or none is.
    pub fn write_subpages(&self, dest: Gfn, command_buffer: Gfn) -> XomResult<()> {
        self.check_capable()?;
        let mut xom = self.lock_xom();
        self.write_subpages_locked(&mut xom, dest, command_buffer)
    }

    /// Record, once, which registers must be zeroed after code on `gfn`
    /// returns.
    pub fn mark_register_clear(&self, gfn: Gfn, clear: RegClearType) -> XomResult<()> {
        self.check_capable()?;
        let mut xom = self.lock_xom();
        self.mark_register_clear_locked(&mut xom, gfn, clear)
    }

    /// Register-clear marking for the frame executing at `rip`. `None` if the
    /// address does not translate, or the frame is unsealed or unmarked.
    pub fn lookup_register_clear<T: GuestTranslator + ?Sized>(
        &self,
        rip: u64,
        translator: &T,
    ) -> RegClearType {
        if !self.is_xom_capable() {
            return RegClearType::None;
        }

        let Some(gfn) = translator.instruction_gfn(rip) else {
            return RegClearType::None;
        };

        let xom = self.lock_xom();
        xom.reg_clear
            .get(gfn)
            .copied()
            .unwrap_or(RegClearType::None)
    }

    pub(crate) fn seal_whole_pages_locked(
        &self,
        _xom: &mut XomMetadata,
        gfn: Gfn,
        count: u64,
    ) -> XomResult<()> {
        debug!(
            "{} seal_whole_pages: gfn {} for {} pages, max mapped {}",
            self.log_prefix(),
            gfn,
            count,
            self.memory().max_mapped_gfn()
        );

        if count == 0 {
            return Err(XomError::InvalidArgument);
        }
        self.memory().check_range(gfn, count)?;

        let mut p2m = self.memory().lock();

        // A frame cannot be sealed twice, in either mode:
        if frames(gfn, count).any(|g| p2m.access(g) == Some(P2mAccess::X)) {
            return Err(XomError::InvalidArgument);
        }

        for g in frames(gfn, count) {
            p2m.set_access(g, P2mAccess::X)?;
        }
        drop(p2m);

        // One flush for the whole batch:
        self.memory().flush_tlb();
        Ok(())
    }

    pub(crate) fn unseal_pages_locked(
        &self,
        xom: &mut XomMetadata,
        gfn: Gfn,
        count: u64,
    ) -> XomResult<()> {
        debug!(
            "{} unseal_pages: gfn {} for {} pages, max mapped {}",
            self.log_prefix(),
            gfn,
            count,
            self.memory().max_mapped_gfn()
        );

        if count == 0 {
            return Err(XomError::InvalidArgument);
        }
        self.memory().check_range(gfn, count)?;

        let mut p2m = self.memory().lock();

        let sealed: Vec<Gfn> = frames(gfn, count)
            .filter(|g| p2m.access(*g) == Some(P2mAccess::X))
            .collect();
        if sealed.is_empty() {
            return Ok(());
        }

        // Every sealed frame must be scrubbable before we scrub any:
        if sealed
            .iter()
            .any(|g| p2m.page_type(*g) != Some(PageType::Writable))
        {
            return Err(XomError::PermissionDenied);
        }

        for g in sealed.iter().copied() {
            p2m.map_page_mut(g)?.fill(SCRUB_BYTE);
            p2m.set_access(g, P2mAccess::Rwx)?;
            xom.subpages.remove(g);
            xom.reg_clear.remove(g);
            trace!("{} unsealed gfn {}", self.log_prefix(), g);
        }
        drop(p2m);

        self.memory().flush_tlb();
        Ok(())
    }

    pub(crate) fn create_subpages_locked(
        &self,
        xom: &mut XomMetadata,
        gfn: Gfn,
        count: u64,
    ) -> XomResult<()> {
        debug!(
            "{} create_subpages: gfn {} for {} pages, max mapped {}",
            self.log_prefix(),
            gfn,
            count,
            self.memory().max_mapped_gfn()
        );

        if count == 0 {
            return Err(XomError::InvalidArgument);
        }
        self.memory().check_range(gfn, count)?;

        let mut p2m = self.memory().lock();

        for g in frames(gfn, count) {
            if p2m.access(g) == Some(P2mAccess::X) || xom.subpages.contains(g) {
                return Err(XomError::InvalidArgument);
            }
            // Sub-pages are filled later through the hypervisor's mapping,
            // which needs a writable frame:
            if p2m.page_type(g) != Some(PageType::Writable) {
                return Err(XomError::PermissionDenied);
            }
        }
        if (xom.subpages.headroom() as u64) < count {
            return Err(XomError::ResourceExhausted);
        }

        for g in frames(gfn, count) {
            p2m.set_access(g, P2mAccess::X)?;
            xom.subpages.insert(g, LockBitmap::empty())?;
        }
        drop(p2m);

        self.memory().flush_tlb();
        Ok(())
    }

    pub(crate) fn write_subpages_locked(
        &self,
        xom: &mut XomMetadata,
        dest: Gfn,
        command_buffer: Gfn,
    ) -> XomResult<()> {
        let locked = *xom.subpages.get(dest).ok_or(XomError::InvalidArgument)?;
        self.memory().check_range(command_buffer, 1)?;

        let mut p2m = self.memory().lock();

        // Take a private copy of the command first, so the guest cannot
        // change it between validation and commit:
        let command = SubpageWriteCommand::decode(p2m.map_page(command_buffer)?)?;

        debug!(
            "{} write_subpages: {} sub-pages from {} into {}",
            self.log_prefix(),
            command.len(),
            command_buffer,
            dest
        );

        // Validate the whole batch, including duplicates inside it:
        let mut pending = locked;
        for (target, _) in command.entries() {
            if !pending.lock(target as usize) {
                return Err(XomError::InvalidArgument);
            }
        }

        let page = p2m.map_page_mut(dest)?;
        for (target, data) in command.entries() {
            let off = target as usize * SUBPAGE_SIZE;
            page[off..off + SUBPAGE_SIZE].copy_from_slice(data);
        }
        drop(p2m);

        if let Some(bitmap) = xom.subpages.get_mut(dest) {
            *bitmap = pending;
        }
        Ok(())
    }

    pub(crate) fn mark_register_clear_locked(
        &self,
        xom: &mut XomMetadata,
        gfn: Gfn,
        clear: RegClearType,
    ) -> XomResult<()> {
        debug!(
            "{} mark_register_clear: gfn {} as {:?}",
            self.log_prefix(),
            gfn,
            clear
        );

        if clear == RegClearType::None {
            return Err(XomError::InvalidArgument);
        }

        // A frame is marked at most once:
        if xom.reg_clear.contains(gfn) {
            return Err(XomError::InvalidArgument);
        }

        // Only sealed frames can be marked:
        if self.memory().access(gfn) != Some(P2mAccess::X) {
            return Err(XomError::InvalidArgument);
        }

        xom.reg_clear.insert(gfn, clear)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainConfig;
    use crate::frame::{GuestAddr, PageState};
    use crate::regclear::IdentityTranslator;
    use crate::{PAGE_SIZE, SUBPAGES_PER_PAGE};

    fn domain(nr_pages: usize) -> IsolationDomain {
        IsolationDomain::new(DomainConfig {
            nr_pages,
            ..Default::default()
        })
        .unwrap()
    }

    fn put_command(d: &IsolationDomain, buf: Gfn, cmd: &SubpageWriteCommand) {
        d.memory().guest_write(buf.addr(), &cmd.encode()).unwrap();
    }

    #[test]
    fn seal_and_unseal_whole_pages() {
        let d = domain(16);
        d.memory().guest_write(Gfn(2).addr(), b"secret").unwrap();

        d.seal_whole_pages(Gfn(2), 3).unwrap();
        assert_eq!(d.memory().tlb_flushes(), 1);
        for g in 2..5 {
            assert_eq!(d.page_state(Gfn(g)), Some(PageState::SealedWholePage));
        }
        assert_eq!(d.page_state(Gfn(5)), Some(PageState::Normal));
        assert!(d.memory().guest_read(Gfn(2).addr(), 6).is_err());
        assert_eq!(d.memory().fetch(Gfn(2).addr(), 6).unwrap(), b"secret");

        // Unsealing a wider range skips the frames that were never sealed:
        d.unseal_pages(Gfn(0), 8).unwrap();
        for g in 0..8 {
            assert_eq!(d.page_state(Gfn(g)), Some(PageState::Normal));
        }
        let scrubbed = d.memory().guest_read(Gfn(2).addr(), PAGE_SIZE).unwrap();
        assert!(scrubbed.iter().all(|b| *b == SCRUB_BYTE));
        // Untouched frames keep their content:
        assert!(d
            .memory()
            .guest_read(Gfn(0).addr(), PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn argument_and_range_errors() {
        let d = domain(8);
        assert_eq!(d.seal_whole_pages(Gfn(0), 0), Err(XomError::InvalidArgument));
        assert_eq!(d.seal_whole_pages(Gfn(6), 3), Err(XomError::Range));
        assert_eq!(d.create_subpages(Gfn(8), 1), Err(XomError::Range));
        assert_eq!(d.unseal_pages(Gfn(0), 0), Err(XomError::InvalidArgument));
        assert_eq!(d.unseal_pages(Gfn(7), 2), Err(XomError::Range));
        // Nothing was sealed by the failed requests:
        assert_eq!(d.page_state(Gfn(6)), Some(PageState::Normal));
        assert_eq!(d.page_state(Gfn(7)), Some(PageState::Normal));
        assert_eq!(d.memory().tlb_flushes(), 0);
    }

    #[test]
    fn no_double_sealing() {
        let d = domain(8);
        d.seal_whole_pages(Gfn(1), 1).unwrap();
        assert_eq!(d.seal_whole_pages(Gfn(0), 2), Err(XomError::InvalidArgument));
        assert_eq!(d.create_subpages(Gfn(0), 2), Err(XomError::InvalidArgument));
        // Validation happens before any frame changes state:
        assert_eq!(d.page_state(Gfn(0)), Some(PageState::Normal));
        assert_eq!(d.record_counts(), (0, 0));

        d.create_subpages(Gfn(4), 1).unwrap();
        assert_eq!(d.seal_whole_pages(Gfn(4), 1), Err(XomError::InvalidArgument));
        assert_eq!(d.page_state(Gfn(4)), Some(PageState::SealedSubpageMode));
    }

    #[test]
    fn subpage_write_locks_and_commits() {
        let d = domain(8);
        d.create_subpages(Gfn(1), 1).unwrap();
        assert_eq!(d.lock_bitmap(Gfn(1)), Some(LockBitmap::empty()));

        let mut cmd = SubpageWriteCommand::new();
        cmd.push(0, &[0x11; SUBPAGE_SIZE]).unwrap();
        cmd.push(5, &[0x55; 16]).unwrap();
        put_command(&d, Gfn(0), &cmd);
        d.write_subpages(Gfn(1), Gfn(0)).unwrap();

        let bm = d.lock_bitmap(Gfn(1)).unwrap();
        assert!(bm.is_locked(0) && bm.is_locked(5));
        assert_eq!(bm.count_locked(), 2);

        let sub5 = d
            .memory()
            .fetch(GuestAddr(Gfn(1).addr().0 + 5 * SUBPAGE_SIZE as u64), SUBPAGE_SIZE)
            .unwrap();
        assert_eq!(&sub5[..16], &[0x55; 16]);
        assert!(sub5[16..].iter().all(|b| *b == SCRUB_BYTE));
    }

    #[test]
    fn subpage_write_is_all_or_nothing() {
        let d = domain(8);
        d.create_subpages(Gfn(1), 1).unwrap();

        let mut first = SubpageWriteCommand::new();
        first.push(2, &[0x22; SUBPAGE_SIZE]).unwrap();
        put_command(&d, Gfn(0), &first);
        d.write_subpages(Gfn(1), Gfn(0)).unwrap();

        // One good entry, one entry hitting a locked sub-page:
        let mut bad = SubpageWriteCommand::new();
        bad.push(3, &[0x33; SUBPAGE_SIZE]).unwrap();
        bad.push(2, &[0x44; SUBPAGE_SIZE]).unwrap();
        put_command(&d, Gfn(0), &bad);
        assert_eq!(d.write_subpages(Gfn(1), Gfn(0)), Err(XomError::InvalidArgument));

        // Out-of-range index:
        let mut oob = SubpageWriteCommand::new();
        oob.push(4, &[0x44; SUBPAGE_SIZE]).unwrap();
        oob.push(SUBPAGES_PER_PAGE as u8, &[0x44; SUBPAGE_SIZE]).unwrap();
        put_command(&d, Gfn(0), &oob);
        assert_eq!(d.write_subpages(Gfn(1), Gfn(0)), Err(XomError::InvalidArgument));

        // The same index twice in one batch:
        let mut dup = SubpageWriteCommand::new();
        dup.push(6, &[0x66; SUBPAGE_SIZE]).unwrap();
        dup.push(6, &[0x67; SUBPAGE_SIZE]).unwrap();
        put_command(&d, Gfn(0), &dup);
        assert_eq!(d.write_subpages(Gfn(1), Gfn(0)), Err(XomError::InvalidArgument));

        let bm = d.lock_bitmap(Gfn(1)).unwrap();
        assert_eq!(bm.count_locked(), 1);
        let page = d.memory().fetch(Gfn(1).addr(), PAGE_SIZE).unwrap();
        assert!(page[2 * SUBPAGE_SIZE..3 * SUBPAGE_SIZE].iter().all(|b| *b == 0x22));
        assert!(page[3 * SUBPAGE_SIZE..5 * SUBPAGE_SIZE].iter().all(|b| *b == 0));
        assert!(page[6 * SUBPAGE_SIZE..7 * SUBPAGE_SIZE].iter().all(|b| *b == 0));
    }

    #[test]
    fn subpage_write_needs_subpage_mode() {
        let d = domain(8);
        put_command(&d, Gfn(0), &SubpageWriteCommand::new());
        assert_eq!(d.write_subpages(Gfn(1), Gfn(0)), Err(XomError::InvalidArgument));
        d.seal_whole_pages(Gfn(1), 1).unwrap();
        assert_eq!(d.write_subpages(Gfn(1), Gfn(0)), Err(XomError::InvalidArgument));

        d.create_subpages(Gfn(2), 1).unwrap();
        assert_eq!(d.write_subpages(Gfn(2), Gfn(99)), Err(XomError::Range));
    }

    #[test]
    fn pinned_frames() {
        let d = domain(8);
        d.memory().set_page_type(Gfn(3), PageType::Pinned).unwrap();
        assert_eq!(d.create_subpages(Gfn(2), 2), Err(XomError::PermissionDenied));
        assert_eq!(d.page_state(Gfn(2)), Some(PageState::Normal));

        // Whole-page sealing never writes the frame, so it is allowed, but
        // the frame cannot be scrubbed afterwards:
        d.seal_whole_pages(Gfn(2), 2).unwrap();
        assert_eq!(d.unseal_pages(Gfn(2), 2), Err(XomError::PermissionDenied));
        assert_eq!(d.page_state(Gfn(2)), Some(PageState::SealedWholePage));

        d.memory().set_page_type(Gfn(3), PageType::Writable).unwrap();
        d.unseal_pages(Gfn(2), 2).unwrap();
        assert_eq!(d.page_state(Gfn(3)), Some(PageState::Normal));
    }

    #[test]
    fn register_clear_marking() {
        let d = domain(8);
        let t = IdentityTranslator::default();

        assert_eq!(
            d.mark_register_clear(Gfn(1), RegClearType::Full),
            Err(XomError::InvalidArgument)
        );

        d.seal_whole_pages(Gfn(1), 1).unwrap();
        assert_eq!(
            d.mark_register_clear(Gfn(1), RegClearType::None),
            Err(XomError::InvalidArgument)
        );
        d.mark_register_clear(Gfn(1), RegClearType::Full).unwrap();
        assert_eq!(
            d.mark_register_clear(Gfn(1), RegClearType::VectorOnly),
            Err(XomError::InvalidArgument)
        );

        let rip = Gfn(1).addr().0 + 0x40;
        assert_eq!(d.lookup_register_clear(rip, &t), RegClearType::Full);
        assert_eq!(d.lookup_register_clear(Gfn(2).addr().0, &t), RegClearType::None);

        d.unseal_pages(Gfn(1), 1).unwrap();
        assert_eq!(d.lookup_register_clear(rip, &t), RegClearType::None);
        assert_eq!(d.record_counts(), (0, 0));
    }

    #[test]
    fn metadata_exhaustion() {
        let d = IsolationDomain::new(DomainConfig {
            nr_pages: 8,
            max_records: 2,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(d.create_subpages(Gfn(0), 3), Err(XomError::ResourceExhausted));
        assert_eq!(d.page_state(Gfn(0)), Some(PageState::Normal));
        d.create_subpages(Gfn(0), 2).unwrap();

        d.seal_whole_pages(Gfn(4), 3).unwrap();
        d.mark_register_clear(Gfn(4), RegClearType::Full).unwrap();
        d.mark_register_clear(Gfn(5), RegClearType::Full).unwrap();
        assert_eq!(
            d.mark_register_clear(Gfn(6), RegClearType::Full),
            Err(XomError::ResourceExhausted)
        );
    }

    #[test]
    fn ineligible_domain() {
        let d = IsolationDomain::new(DomainConfig {
            nr_pages: 4,
            mode: crate::XomMode::PageKeyBased,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.seal_whole_pages(Gfn(0), 1), Err(XomError::Unsupported));
        assert_eq!(
            d.lookup_register_clear(0, &IdentityTranslator::default()),
            RegClearType::None
        );
    }
}
