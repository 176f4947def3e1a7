//! The sealing hypercall: a batch of commands processed in order.
//!
//! A guest hands the hypervisor an array of [`XomOp`]s. They are processed
//! one at a time, each with the domain's XOM lock held for its whole critical
//! section. Between two elements the hypervisor may be asked to yield; the
//! call then stops with [`XomError::NeedsRestart`] and reports how many
//! elements were completed, so that the guest can resubmit the rest. An
//! element that was started always completes (or fails) before that check.

use log::{debug, log_enabled, trace};

use crate::domain::{IsolationDomain, XomMetadata};
use crate::error::{XomError, XomResult};
use crate::frame::Gfn;
use crate::regclear::RegClearType;
use crate::{MAX_SUBPAGES_PER_CMD, PAGE_SIZE, SCRUB_BYTE, SUBPAGE_SIZE, SUBPAGE_WRITE_ENTRY_SIZE};

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XomCmd {
    SealWholePage = 1,
    UnsealWholePage = 2,
    CreateSubpages = 3,
    WriteSubpages = 4,
    MarkRegisterClear = 5,
}

impl TryFrom<u32> for XomCmd {
    type Error = XomError;

    fn try_from(cmd: u32) -> XomResult<Self> {
        Ok(match cmd {
            1 => XomCmd::SealWholePage,
            2 => XomCmd::UnsealWholePage,
            3 => XomCmd::CreateSubpages,
            4 => XomCmd::WriteSubpages,
            5 => XomCmd::MarkRegisterClear,
            _ => return Err(XomError::Unsupported),
        })
    }
}

/// One element of a sealing hypercall.
///
/// `arg` is the page count for the range commands, the frame holding the
/// [`SubpageWriteCommand`] for `WriteSubpages`, and the register-clear type
/// code for `MarkRegisterClear`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct XomOp {
    pub cmd: u32,
    pub gfn: Gfn,
    pub arg: u64,
}

impl XomOp {
    fn new(cmd: XomCmd, gfn: Gfn, arg: u64) -> Self {
        XomOp {
            cmd: cmd as u32,
            gfn,
            arg,
        }
    }

    pub fn seal_whole_pages(gfn: Gfn, count: u64) -> Self {
        Self::new(XomCmd::SealWholePage, gfn, count)
    }

    pub fn unseal_pages(gfn: Gfn, count: u64) -> Self {
        Self::new(XomCmd::UnsealWholePage, gfn, count)
    }

    pub fn create_subpages(gfn: Gfn, count: u64) -> Self {
        Self::new(XomCmd::CreateSubpages, gfn, count)
    }

    pub fn write_subpages(dest: Gfn, command_buffer: Gfn) -> Self {
        Self::new(XomCmd::WriteSubpages, dest, command_buffer.0)
    }

    pub fn mark_register_clear(gfn: Gfn, clear: RegClearType) -> Self {
        Self::new(XomCmd::MarkRegisterClear, gfn, clear.code() as u64)
    }
}

/// A batch of sub-page writes into one frame, in its in-memory layout: an
/// entry count byte, then per entry the target sub-page index and
/// `SUBPAGE_SIZE` bytes of payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubpageWriteCommand {
    entries: Vec<(u8, [u8; SUBPAGE_SIZE])>,
}

impl SubpageWriteCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a write of `data` into sub-page `target`. Short payloads are
    /// padded with the scrub pattern. Indices are not validated here; that is
    /// the hypervisor's job.
    pub fn push(&mut self, target: u8, data: &[u8]) -> XomResult<()> {
        if data.len() > SUBPAGE_SIZE || self.entries.len() >= MAX_SUBPAGES_PER_CMD {
            return Err(XomError::InvalidArgument);
        }
        let mut payload = [SCRUB_BYTE; SUBPAGE_SIZE];
        payload[..data.len()].copy_from_slice(data);
        self.entries.push((target, payload));
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (u8, &[u8; SUBPAGE_SIZE])> {
        self.entries.iter().map(|(target, data)| (*target, data))
    }

    /// Serialise into a full page.
    pub fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = self.entries.len() as u8;
        for (i, (target, data)) in self.entries.iter().enumerate() {
            let off = 1 + i * SUBPAGE_WRITE_ENTRY_SIZE;
            page[off] = *target;
            page[off + 1..off + SUBPAGE_WRITE_ENTRY_SIZE].copy_from_slice(data);
        }
        page
    }

    /// Parse a command from the page it was placed in. A count larger than
    /// fits in a page is rejected; the entries themselves are not checked.
    pub fn decode(page: &[u8]) -> XomResult<Self> {
        let count = *page.first().ok_or(XomError::InvalidArgument)? as usize;
        if count > MAX_SUBPAGES_PER_CMD || page.len() < 1 + count * SUBPAGE_WRITE_ENTRY_SIZE {
            return Err(XomError::InvalidArgument);
        }

        let entries = page[1..1 + count * SUBPAGE_WRITE_ENTRY_SIZE]
            .chunks_exact(SUBPAGE_WRITE_ENTRY_SIZE)
            .map(|entry| {
                let mut data = [0u8; SUBPAGE_SIZE];
                data.copy_from_slice(&entry[1..]);
                (entry[0], data)
            })
            .collect();

        Ok(SubpageWriteCommand { entries })
    }
}

/// Asked between two elements of a batch whether the hypervisor should stop
/// and let other work run.
pub trait PreemptCheck {
    fn should_yield(&self) -> bool;
}

/// Never yields.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoPreempt;

impl PreemptCheck for NoPreempt {
    fn should_yield(&self) -> bool {
        false
    }
}

impl<F: Fn() -> bool> PreemptCheck for F {
    fn should_yield(&self) -> bool {
        self()
    }
}

/// Result of a sealing hypercall: how many elements were fully processed,
/// and the status. On error, `done` is the index of the element that failed
/// (or, for `NeedsRestart`, the first element not yet started).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HypercallOutcome {
    pub done: usize,
    pub result: XomResult<()>,
}

impl IsolationDomain {
    /// Process a batch of sealing commands for this domain.
    pub fn handle_xom_seal<P: PreemptCheck + ?Sized>(
        &self,
        ops: &[XomOp],
        preempt: &P,
    ) -> HypercallOutcome {
        if let Err(e) = self.check_capable() {
            return HypercallOutcome { done: 0, result: Err(e) };
        }

        for (i, op) in ops.iter().enumerate() {
            if i > 0 && preempt.should_yield() {
                debug!(
                    "{} Preempted after {} of {} ops",
                    self.log_prefix(),
                    i,
                    ops.len()
                );
                return HypercallOutcome {
                    done: i,
                    result: Err(XomError::NeedsRestart),
                };
            }

            if log_enabled!(log::Level::Trace) {
                trace!("{} op #{}: {:x?}", self.log_prefix(), i, op);
            }

            let rc = {
                let mut xom = self.lock_xom();
                self.dispatch(&mut xom, op)
            };

            if let Err(e) = rc {
                debug!(
                    "{} op #{} ({:x?}) failed: {}",
                    self.log_prefix(),
                    i,
                    op,
                    e
                );
                return HypercallOutcome {
                    done: i,
                    result: Err(e),
                };
            }
        }

        HypercallOutcome {
            done: ops.len(),
            result: Ok(()),
        }
    }

    fn dispatch(&self, xom: &mut XomMetadata, op: &XomOp) -> XomResult<()> {
        match XomCmd::try_from(op.cmd)? {
            XomCmd::SealWholePage => self.seal_whole_pages_locked(xom, op.gfn, op.arg),
            XomCmd::UnsealWholePage => self.unseal_pages_locked(xom, op.gfn, op.arg),
            XomCmd::CreateSubpages => self.create_subpages_locked(xom, op.gfn, op.arg),
            XomCmd::WriteSubpages => self.write_subpages_locked(xom, op.gfn, Gfn(op.arg)),
            XomCmd::MarkRegisterClear => {
                let clear = RegClearType::from_code(op.arg).ok_or(XomError::InvalidArgument)?;
                self.mark_register_clear_locked(xom, op.gfn, clear)
            }
        }
    }
}
