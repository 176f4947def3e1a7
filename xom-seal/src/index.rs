//! Ordered per-frame metadata index.
//!
//! Both XOM indexes of a domain (lock bitmaps and register-clear records) are
//! instances of [`FrameIndex`]. Lookups, inserts and removals are logarithmic
//! in the number of records; iteration is in frame order, which teardown and
//! debug dumps rely on.

use std::collections::btree_map::{self, BTreeMap};

use crate::error::{XomError, XomResult};
use crate::frame::Gfn;

#[derive(Debug)]
pub struct FrameIndex<T> {
    records: BTreeMap<Gfn, T>,
    limit: usize,
}

impl<T> FrameIndex<T> {
    /// An empty index that refuses to grow beyond `limit` records.
    pub fn with_limit(limit: usize) -> Self {
        FrameIndex {
            records: BTreeMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records that can still be inserted.
    pub fn headroom(&self) -> usize {
        self.limit.saturating_sub(self.records.len())
    }

    pub fn contains(&self, gfn: Gfn) -> bool {
        self.records.contains_key(&gfn)
    }

    pub fn get(&self, gfn: Gfn) -> Option<&T> {
        self.records.get(&gfn)
    }

    pub fn get_mut(&mut self, gfn: Gfn) -> Option<&mut T> {
        self.records.get_mut(&gfn)
    }

    /// Insert a new record. An existing record for `gfn` is never replaced:
    /// that is an `InvalidArgument`. A full index is `ResourceExhausted`.
    pub fn insert(&mut self, gfn: Gfn, record: T) -> XomResult<&mut T> {
        if self.records.len() >= self.limit && !self.records.contains_key(&gfn) {
            return Err(XomError::ResourceExhausted);
        }

        match self.records.entry(gfn) {
            btree_map::Entry::Occupied(_) => Err(XomError::InvalidArgument),
            btree_map::Entry::Vacant(v) => Ok(v.insert(record)),
        }
    }

    pub fn remove(&mut self, gfn: Gfn) -> Option<T> {
        self.records.remove(&gfn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gfn, &T)> {
        self.records.iter().map(|(gfn, record)| (*gfn, record))
    }

    /// Drop every record, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let freed = self.records.len();
        self.records.clear();
        freed
    }
}
