//! Guest-side use of the sealing hypercall.
//!
//! An [`XomClient`] owns a range of the domain's frames and hands them out
//! either as whole-page [`XomBuffer`]s (write, then seal) or as
//! [`SubpageGroup`]s (seal first, then fill write-once sub-pages through the
//! hypervisor). Every request is submitted through
//! [`IsolationDomain::handle_xom_seal`], and resubmitted from where it
//! stopped when the hypervisor asks for a restart.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::domain::IsolationDomain;
use crate::error::{XomError, XomResult};
use crate::frame::{Gfn, GuestAddr};
use crate::hypercall::{NoPreempt, PreemptCheck, SubpageWriteCommand, XomOp};
use crate::ledger::GroupLedger;
use crate::regclear::RegClearType;
use crate::{bytes_to_subpages, MAX_SUBPAGES_PER_CMD, PAGE_SIZE, SUBPAGES_PER_PAGE, SUBPAGE_SIZE};

static XOM_CLIENT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// First-fit allocator over guest frame numbers.
#[derive(Clone, Debug)]
pub struct FrameAllocator {
    // Sorted, non-overlapping, never adjacent:
    free: Vec<Range<u64>>,
}

impl FrameAllocator {
    pub fn new(frames: Range<u64>) -> Self {
        let free = if frames.is_empty() { vec![] } else { vec![frames] };
        FrameAllocator { free }
    }

    pub fn free_frames(&self) -> u64 {
        self.free.iter().map(|r| r.end - r.start).sum()
    }

    pub fn alloc(&mut self, count: u64) -> Option<Gfn> {
        if count == 0 {
            return None;
        }
        let i = self.free.iter().position(|r| r.end - r.start >= count)?;
        let start = self.free[i].start;
        self.free[i].start += count;
        if self.free[i].is_empty() {
            self.free.remove(i);
        }
        Some(Gfn(start))
    }

    pub fn free(&mut self, gfn: Gfn, count: u64) {
        if count == 0 {
            return;
        }
        let range = gfn.0..gfn.0 + count;
        let i = self.free.partition_point(|r| r.start < range.start);
        self.free.insert(i, range);

        if i + 1 < self.free.len() && self.free[i].end == self.free[i + 1].start {
            self.free[i].end = self.free[i + 1].end;
            self.free.remove(i + 1);
        }
        if i > 0 && self.free[i - 1].end == self.free[i].start {
            self.free[i - 1].end = self.free[i].end;
            self.free.remove(i);
        }
    }
}

/// Pages sealed in sub-page mode, plus the client's view of which sub-pages
/// are used up and which blobs are live.
#[derive(Debug)]
pub struct SubpageGroup {
    base: Gfn,
    ledger: GroupLedger,
}

impl SubpageGroup {
    pub fn base(&self) -> Gfn {
        self.base
    }

    pub fn addr(&self) -> GuestAddr {
        self.base.addr()
    }

    pub fn nr_pages(&self) -> usize {
        self.ledger.nr_pages()
    }

    pub fn ledger(&self) -> &GroupLedger {
        &self.ledger
    }

    pub fn contains(&self, addr: GuestAddr) -> bool {
        let start = self.addr().0;
        addr.0 >= start && addr.0 < start + (self.nr_pages() * PAGE_SIZE) as u64
    }

    fn unit_of(&self, addr: GuestAddr) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        GroupLedger::offset_unit((addr.0 - self.addr().0) as usize)
    }
}

/// Whole pages that are written by the guest and then sealed.
#[derive(Debug)]
pub struct XomBuffer {
    base: Gfn,
    nr_pages: usize,
    locked: bool,
}

impl XomBuffer {
    pub fn base(&self) -> Gfn {
        self.base
    }

    pub fn addr(&self) -> GuestAddr {
        self.base.addr()
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub fn size(&self) -> usize {
        self.nr_pages * PAGE_SIZE
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

pub struct XomClient {
    id: usize,
    log_prefix: String,
    domain: Arc<IsolationDomain>,
    frames: FrameAllocator,
    command_buffer: Gfn,
}

impl XomClient {
    /// Client owning every frame of `domain`.
    pub fn new(domain: Arc<IsolationDomain>) -> XomResult<Self> {
        let frames = 0..domain.memory().nr_pages() as u64;
        Self::with_frames(domain, frames)
    }

    /// Client owning the frames in `frames`. One of them is kept as the
    /// buffer sub-page write commands are passed in.
    pub fn with_frames(domain: Arc<IsolationDomain>, frames: Range<u64>) -> XomResult<Self> {
        let id = XOM_CLIENT_COUNT.fetch_add(1, Ordering::Relaxed);
        let log_prefix = format!("XomClient[#{}]:", id);

        if !domain.is_xom_capable() {
            warn!(
                "{} {} does not accept sealing requests (mode {:?})",
                log_prefix,
                domain.log_prefix(),
                domain.mode()
            );
            return Err(XomError::Unsupported);
        }
        domain.memory().check_range(Gfn(frames.start), frames.end.saturating_sub(frames.start))?;

        let mut frames = FrameAllocator::new(frames);
        let command_buffer = frames.alloc(1).ok_or(XomError::ResourceExhausted)?;

        info!(
            "{} Attached to {} with {} frames, command buffer at {}",
            log_prefix,
            domain.log_prefix(),
            frames.free_frames() + 1,
            command_buffer
        );

        Ok(XomClient {
            id,
            log_prefix,
            domain,
            frames,
            command_buffer,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn domain(&self) -> &Arc<IsolationDomain> {
        &self.domain
    }

    pub fn free_frames(&self) -> u64 {
        self.frames.free_frames()
    }

    /// Submit a batch, never yielding.
    pub fn submit(&self, ops: &[XomOp]) -> XomResult<()> {
        self.submit_with(ops, &NoPreempt)
    }

    /// Submit a batch, resubmitting the rest whenever the hypervisor stops
    /// early to yield.
    pub fn submit_with<P: PreemptCheck + ?Sized>(
        &self,
        ops: &[XomOp],
        preempt: &P,
    ) -> XomResult<()> {
        let mut next = 0;
        while next < ops.len() {
            let outcome = self.domain.handle_xom_seal(&ops[next..], preempt);
            next += outcome.done;
            match outcome.result {
                Ok(()) => break,
                Err(XomError::NeedsRestart) => {
                    trace!(
                        "{} Restarting batch at op {} of {}",
                        self.log_prefix,
                        next,
                        ops.len()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn alloc_frames(&mut self, size: usize) -> XomResult<(Gfn, usize)> {
        if size == 0 {
            return Err(XomError::InvalidArgument);
        }
        let nr_pages = size.div_ceil(PAGE_SIZE);
        let base = self
            .frames
            .alloc(nr_pages as u64)
            .ok_or(XomError::ResourceExhausted)?;
        Ok((base, nr_pages))
    }

    /// Seal `size` bytes worth of pages in sub-page mode.
    pub fn alloc_subpages(&mut self, size: usize) -> XomResult<SubpageGroup> {
        let (base, nr_pages) = self.alloc_frames(size)?;

        if let Err(e) = self.submit(&[XomOp::create_subpages(base, nr_pages as u64)]) {
            self.frames.free(base, nr_pages as u64);
            return Err(e);
        }

        debug!(
            "{} Created sub-page group at {} with {} pages",
            self.log_prefix, base, nr_pages
        );
        Ok(SubpageGroup {
            base,
            ledger: GroupLedger::new(nr_pages),
        })
    }

    /// Write `data` into the first run of free sub-pages of `group` large
    /// enough to hold it, lock them, and return where it landed. The tail of
    /// the last sub-page is padded with the scrub pattern.
    pub fn fill_and_lock(&mut self, group: &mut SubpageGroup, data: &[u8]) -> XomResult<GuestAddr> {
        let units = bytes_to_subpages(data.len());
        if units == 0 {
            return Err(XomError::InvalidArgument);
        }
        let start = group
            .ledger
            .find_free_run(units)
            .ok_or(XomError::ResourceExhausted)?;

        for run in GroupLedger::page_runs(start, units) {
            let dest = Gfn(group.base.0 + run.page as u64);
            let page_unit = run.page * SUBPAGES_PER_PAGE;

            // A page holds one more sub-page than a command has entries:
            let mut subpage = run.first_subpage;
            let end = run.first_subpage + run.count;
            while subpage < end {
                let n = (end - subpage).min(MAX_SUBPAGES_PER_CMD);
                let mut command = SubpageWriteCommand::new();
                for s in subpage..subpage + n {
                    let from = (page_unit + s - start) * SUBPAGE_SIZE;
                    let to = (from + SUBPAGE_SIZE).min(data.len());
                    command.push(s as u8, &data[from..to])?;
                }

                self.domain
                    .memory()
                    .guest_write(self.command_buffer.addr(), &command.encode())?;
                self.submit(&[XomOp::write_subpages(dest, self.command_buffer)])?;

                group.ledger.commit(page_unit + subpage, n)?;
                subpage += n;
            }
        }

        group.ledger.record(start, units);
        let addr = GuestAddr(group.addr().0 + GroupLedger::unit_offset(start) as u64);
        trace!(
            "{} Locked {} bytes into {} sub-pages at {}",
            self.log_prefix,
            data.len(),
            units,
            addr
        );
        Ok(addr)
    }

    /// Forget the blob at `addr`. Its sub-pages stay locked. Returns whether
    /// the group has no live blobs left.
    pub fn free_subpages(&mut self, group: &mut SubpageGroup, addr: GuestAddr) -> XomResult<bool> {
        let unit = group.unit_of(addr).ok_or(XomError::InvalidArgument)?;
        group.ledger.release(unit).ok_or(XomError::InvalidArgument)
    }

    /// Mark page `page` of `group` for register clearing.
    pub fn mark_register_clear(
        &self,
        group: &SubpageGroup,
        page: usize,
        clear: RegClearType,
    ) -> XomResult<()> {
        if page >= group.nr_pages() {
            return Err(XomError::Range);
        }
        self.submit(&[XomOp::mark_register_clear(
            Gfn(group.base.0 + page as u64),
            clear,
        )])
    }

    /// Unseal (and thereby scrub) the whole group and take its frames back.
    pub fn free_all_subpages(&mut self, group: SubpageGroup) -> XomResult<()> {
        self.unseal_group(&group)
    }

    /// Unseal `group` and take its frames back. On failure the frames stay
    /// sealed and `group` can be unsealed again later.
    pub(crate) fn unseal_group(&mut self, group: &SubpageGroup) -> XomResult<()> {
        self.release_frames(group.base, group.nr_pages(), true)
    }

    fn release_frames(&mut self, base: Gfn, nr_pages: usize, sealed: bool) -> XomResult<()> {
        if sealed {
            if let Err(e) = self.submit(&[XomOp::unseal_pages(base, nr_pages as u64)]) {
                // The frames stay sealed and are not handed out again:
                warn!(
                    "{} Failed to unseal {} pages at {}: {}",
                    self.log_prefix, nr_pages, base, e
                );
                return Err(e);
            }
        }
        self.frames.free(base, nr_pages as u64);
        debug!("{} Freed {} pages at {}", self.log_prefix, nr_pages, base);
        Ok(())
    }

    /// Allocate `size` bytes of pages to be filled and then sealed whole.
    pub fn alloc(&mut self, size: usize) -> XomResult<XomBuffer> {
        let (base, nr_pages) = self.alloc_frames(size)?;
        Ok(XomBuffer {
            base,
            nr_pages,
            locked: false,
        })
    }

    /// Copy `data` into `buf` at `offset`. Returns the number of bytes
    /// written.
    pub fn write(&self, buf: &XomBuffer, offset: usize, data: &[u8]) -> XomResult<usize> {
        if buf.locked {
            return Err(XomError::PermissionDenied);
        }
        match offset.checked_add(data.len()) {
            Some(end) if end <= buf.size() => {}
            _ => return Err(XomError::Range),
        }
        self.domain
            .memory()
            .guest_write(GuestAddr(buf.addr().0 + offset as u64), data)?;
        Ok(data.len())
    }

    /// Seal `buf`, returning the address its content can be executed from.
    pub fn lock(&self, buf: &mut XomBuffer) -> XomResult<GuestAddr> {
        if buf.locked {
            return Err(XomError::InvalidArgument);
        }
        self.submit(&[XomOp::seal_whole_pages(buf.base, buf.nr_pages as u64)])?;
        buf.locked = true;
        debug!(
            "{} Sealed {} pages at {}",
            self.log_prefix, buf.nr_pages, buf.base
        );
        Ok(buf.addr())
    }

    pub fn mark_register_clear_buffer(
        &self,
        buf: &XomBuffer,
        page: usize,
        clear: RegClearType,
    ) -> XomResult<()> {
        if page >= buf.nr_pages {
            return Err(XomError::Range);
        }
        self.submit(&[XomOp::mark_register_clear(
            Gfn(buf.base.0 + page as u64),
            clear,
        )])
    }

    pub fn free(&mut self, buf: XomBuffer) -> XomResult<()> {
        self.release_frames(buf.base, buf.nr_pages, buf.locked)
    }
}
