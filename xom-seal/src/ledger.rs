//! Bookkeeping for one group of sub-page sealed pages.
//!
//! The privileged layer holds the authoritative lock bitmaps. A backend keeps
//! a shadow copy here, so that it can find free runs of sub-pages without
//! asking, and tracks the blobs that are still in use. A sub-page is addressed
//! by its unit index inside the group: `page * SUBPAGES_PER_PAGE + subpage`.

use std::collections::HashMap;

use crate::error::{XomError, XomResult};
use crate::frame::LockBitmap;
use crate::{SUBPAGES_PER_PAGE, SUBPAGE_SIZE};

#[derive(Clone, Debug)]
pub struct GroupLedger {
    pages: Vec<LockBitmap>,
    // First unit of each live blob -> number of units it occupies:
    live: HashMap<usize, usize>,
}

/// Part of a run of units that falls into a single page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRun {
    pub page: usize,
    pub first_subpage: usize,
    pub count: usize,
}

impl GroupLedger {
    pub fn new(nr_pages: usize) -> Self {
        GroupLedger {
            pages: vec![LockBitmap::empty(); nr_pages],
            live: HashMap::new(),
        }
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    /// Size of the group, in sub-page units.
    pub fn capacity(&self) -> usize {
        self.pages.len() * SUBPAGES_PER_PAGE
    }

    pub fn locked_units(&self) -> usize {
        self.pages.iter().map(|bm| bm.count_locked()).sum()
    }

    pub fn live_blobs(&self) -> usize {
        self.live.len()
    }

    pub fn live_units(&self) -> usize {
        self.live.values().sum()
    }

    pub fn is_locked(&self, unit: usize) -> bool {
        self.pages
            .get(unit / SUBPAGES_PER_PAGE)
            .map(|bm| bm.is_locked(unit % SUBPAGES_PER_PAGE))
            .unwrap_or(false)
    }

    /// First run of `units` consecutive unlocked units, searching from the
    /// start of the group. Runs may cross page boundaries.
    pub fn find_free_run(&self, units: usize) -> Option<usize> {
        if units == 0 || units > self.capacity() {
            return None;
        }

        let mut start = 0;
        let mut len = 0;
        for unit in 0..self.capacity() {
            if self.is_locked(unit) {
                len = 0;
                start = unit + 1;
                continue;
            }
            len += 1;
            if len == units {
                return Some(start);
            }
        }
        None
    }

    /// Mark `units` units starting at `start` as locked. Nothing changes
    /// unless every one of them was still free.
    pub fn commit(&mut self, start: usize, units: usize) -> XomResult<()> {
        let end = start.checked_add(units).ok_or(XomError::Range)?;
        if end > self.capacity() {
            return Err(XomError::Range);
        }
        if (start..end).any(|unit| self.is_locked(unit)) {
            return Err(XomError::InvalidArgument);
        }

        for unit in start..end {
            self.pages[unit / SUBPAGES_PER_PAGE].lock(unit % SUBPAGES_PER_PAGE);
        }
        Ok(())
    }

    pub fn record(&mut self, start: usize, units: usize) {
        self.live.insert(start, units);
    }

    pub fn is_live(&self, start: usize) -> bool {
        self.live.contains_key(&start)
    }

    /// Forget the blob starting at `start`. Returns `None` if there is no
    /// such blob, otherwise whether the group now has no live blobs left.
    /// The units stay locked.
    pub fn release(&mut self, start: usize) -> Option<bool> {
        self.live.remove(&start)?;
        Some(self.live.is_empty())
    }

    /// Split a run of units into its per-page parts.
    pub fn page_runs(start: usize, units: usize) -> impl Iterator<Item = PageRun> {
        let end = start + units;
        let mut unit = start;
        std::iter::from_fn(move || {
            if unit >= end {
                return None;
            }
            let page = unit / SUBPAGES_PER_PAGE;
            let first_subpage = unit % SUBPAGES_PER_PAGE;
            let count = (SUBPAGES_PER_PAGE - first_subpage).min(end - unit);
            unit += count;
            Some(PageRun {
                page,
                first_subpage,
                count,
            })
        })
    }

    /// Byte offset of a unit from the start of the group.
    pub fn unit_offset(unit: usize) -> usize {
        unit * SUBPAGE_SIZE
    }

    /// Unit at a byte offset from the start of the group, if the offset is
    /// aligned to a sub-page.
    pub fn offset_unit(offset: usize) -> Option<usize> {
        (offset % SUBPAGE_SIZE == 0).then_some(offset / SUBPAGE_SIZE)
    }
}
