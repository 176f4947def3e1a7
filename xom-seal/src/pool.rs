//! Packing of small blobs into shared execute-only groups.
//!
//! Sealing is expensive (a hypercall and a translation-cache flush), and a
//! sub-page can only ever be written once. A [`SubpagePool`] therefore fills
//! groups of sub-page sealed pages blob by blob, reusing the most recently
//! created group first, and only gives a group back as a whole once none of
//! its blobs are in use any more and enough of it has been used up. A drained
//! group that still has most of its sub-pages left stays for the next blobs.
//!
//! The pool does no locking of its own. Callers sharing one pool between
//! threads must serialise `acquire` and `release` themselves.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::capability::{detect, XomMode};
use crate::client::{SubpageGroup, XomClient};
use crate::domain::IsolationDomain;
use crate::error::{XomError, XomResult};
use crate::frame::GuestAddr;
use crate::regclear::RegClearType;
use crate::{bytes_to_subpages, PAGE_SIZE, SUBPAGE_SIZE};

/// A source of sub-page sealed groups.
pub trait SubpageProvider {
    type Group;

    fn alloc_group(&mut self, size: usize) -> XomResult<Self::Group>;

    /// Address of the first byte of `group`.
    fn group_addr(&self, group: &Self::Group) -> usize;

    /// Write and lock `data` into free sub-pages of `group`, returning its
    /// address.
    fn fill_and_lock(&mut self, group: &mut Self::Group, data: &[u8]) -> XomResult<usize>;

    /// Forget the blob at `addr`. Returns whether `group` has no live blobs
    /// left.
    fn release(&mut self, group: &mut Self::Group, addr: usize) -> XomResult<bool>;

    fn mark_register_clear(
        &mut self,
        group: &Self::Group,
        page: usize,
        clear: RegClearType,
    ) -> XomResult<()>;

    /// Unseal `group` and give its memory back. On failure `group` is left
    /// as it was, so freeing it can be retried.
    fn free_group(&mut self, group: &Self::Group) -> XomResult<()>;

    /// Whether the pages a blob lands on have to be marked for register
    /// clearing.
    fn needs_register_clear(&self) -> bool;
}

impl SubpageProvider for XomClient {
    type Group = SubpageGroup;

    fn alloc_group(&mut self, size: usize) -> XomResult<SubpageGroup> {
        self.alloc_subpages(size)
    }

    fn group_addr(&self, group: &SubpageGroup) -> usize {
        group.addr().0 as usize
    }

    fn fill_and_lock(&mut self, group: &mut SubpageGroup, data: &[u8]) -> XomResult<usize> {
        XomClient::fill_and_lock(self, group, data).map(|addr| addr.0 as usize)
    }

    fn release(&mut self, group: &mut SubpageGroup, addr: usize) -> XomResult<bool> {
        self.free_subpages(group, GuestAddr(addr as u64))
    }

    fn mark_register_clear(
        &mut self,
        group: &SubpageGroup,
        page: usize,
        clear: RegClearType,
    ) -> XomResult<()> {
        XomClient::mark_register_clear(self, group, page, clear)
    }

    fn free_group(&mut self, group: &SubpageGroup) -> XomResult<()> {
        self.unseal_group(group)
    }

    fn needs_register_clear(&self) -> bool {
        true
    }
}

#[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
impl SubpageProvider for crate::pkey::PkeyXom {
    type Group = crate::pkey::PkeyGroup;

    fn alloc_group(&mut self, size: usize) -> XomResult<Self::Group> {
        crate::pkey::PkeyXom::alloc_group(self, size)
    }

    fn group_addr(&self, group: &Self::Group) -> usize {
        group.addr()
    }

    fn fill_and_lock(&mut self, group: &mut Self::Group, data: &[u8]) -> XomResult<usize> {
        crate::pkey::PkeyXom::fill_and_lock(self, group, data)
    }

    fn release(&mut self, group: &mut Self::Group, addr: usize) -> XomResult<bool> {
        crate::pkey::PkeyXom::release(self, group, addr)
    }

    fn mark_register_clear(
        &mut self,
        _group: &Self::Group,
        _page: usize,
        _clear: RegClearType,
    ) -> XomResult<()> {
        // Page keys do not protect register state; nothing to record.
        Ok(())
    }

    fn free_group(&mut self, group: &Self::Group) -> XomResult<()> {
        self.unmap_group(group)
    }

    fn needs_register_clear(&self) -> bool {
        false
    }
}

/// Whichever backend this machine supports.
pub enum XomBackend {
    AddressTranslation(XomClient),
    #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
    PageKey(crate::pkey::PkeyXom),
}

pub enum BackendGroup {
    AddressTranslation(SubpageGroup),
    #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
    PageKey(crate::pkey::PkeyGroup),
}

impl XomBackend {
    /// Backend for the mode [`detect`] reports. `domain` is only used when
    /// the hypervisor enforces execute-only memory.
    pub fn detect(domain: Arc<IsolationDomain>) -> XomResult<Self> {
        Self::for_mode(detect(), domain)
    }

    pub fn for_mode(mode: XomMode, domain: Arc<IsolationDomain>) -> XomResult<Self> {
        let backend = match mode {
            XomMode::AddressTranslationBased => {
                XomBackend::AddressTranslation(XomClient::new(domain)?)
            }
            XomMode::PageKeyBased => Self::page_key()?,
            XomMode::Unsupported => {
                warn!("SubpagePool: No execute-only memory on this machine");
                return Err(XomError::Unsupported);
            }
        };
        info!("SubpagePool: Using the {:?} backend", backend.mode());
        Ok(backend)
    }

    #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
    fn page_key() -> XomResult<Self> {
        crate::pkey::PkeyXom::new().map(XomBackend::PageKey)
    }

    #[cfg(not(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux")))]
    fn page_key() -> XomResult<Self> {
        warn!("SubpagePool: Built without the page-key backend");
        Err(XomError::Unsupported)
    }

    pub fn mode(&self) -> XomMode {
        match self {
            XomBackend::AddressTranslation(_) => XomMode::AddressTranslationBased,
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            XomBackend::PageKey(_) => XomMode::PageKeyBased,
        }
    }
}

impl SubpageProvider for XomBackend {
    type Group = BackendGroup;

    fn alloc_group(&mut self, size: usize) -> XomResult<BackendGroup> {
        match self {
            XomBackend::AddressTranslation(c) => {
                c.alloc_subpages(size).map(BackendGroup::AddressTranslation)
            }
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            XomBackend::PageKey(x) => x.alloc_group(size).map(BackendGroup::PageKey),
        }
    }

    fn group_addr(&self, group: &BackendGroup) -> usize {
        match group {
            BackendGroup::AddressTranslation(g) => g.addr().0 as usize,
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            BackendGroup::PageKey(g) => g.addr(),
        }
    }

    fn fill_and_lock(&mut self, group: &mut BackendGroup, data: &[u8]) -> XomResult<usize> {
        match (self, group) {
            (XomBackend::AddressTranslation(c), BackendGroup::AddressTranslation(g)) => {
                SubpageProvider::fill_and_lock(c, g, data)
            }
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            (XomBackend::PageKey(x), BackendGroup::PageKey(g)) => x.fill_and_lock(g, data),
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            _ => Err(XomError::InvalidArgument),
        }
    }

    fn release(&mut self, group: &mut BackendGroup, addr: usize) -> XomResult<bool> {
        match (self, group) {
            (XomBackend::AddressTranslation(c), BackendGroup::AddressTranslation(g)) => {
                SubpageProvider::release(c, g, addr)
            }
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            (XomBackend::PageKey(x), BackendGroup::PageKey(g)) => x.release(g, addr),
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            _ => Err(XomError::InvalidArgument),
        }
    }

    fn mark_register_clear(
        &mut self,
        group: &BackendGroup,
        page: usize,
        clear: RegClearType,
    ) -> XomResult<()> {
        match (self, group) {
            (XomBackend::AddressTranslation(c), BackendGroup::AddressTranslation(g)) => {
                XomClient::mark_register_clear(c, g, page, clear)
            }
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            (XomBackend::PageKey(_), BackendGroup::PageKey(_)) => Ok(()),
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            _ => Err(XomError::InvalidArgument),
        }
    }

    fn free_group(&mut self, group: &BackendGroup) -> XomResult<()> {
        match (self, group) {
            (XomBackend::AddressTranslation(c), BackendGroup::AddressTranslation(g)) => {
                c.unseal_group(g)
            }
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            (XomBackend::PageKey(x), BackendGroup::PageKey(g)) => x.unmap_group(g),
            #[cfg(all(feature = "pkey_backend", target_arch = "x86_64", target_os = "linux"))]
            _ => Err(XomError::InvalidArgument),
        }
    }

    fn needs_register_clear(&self) -> bool {
        self.mode() == XomMode::AddressTranslationBased
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes per group. A multiple of the page size.
    pub group_size: usize,
    /// Once its last blob is released, a group that has handed out at least
    /// this many sub-page units is given back. Groups below it are kept and
    /// filled further.
    pub free_threshold: usize,
    /// Marking applied to every page a blob lands on, when the provider
    /// needs one.
    pub reg_clear: RegClearType,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let group_size = PAGE_SIZE * 16;
        PoolConfig {
            group_size,
            free_threshold: (group_size / SUBPAGE_SIZE) * 4 / 5,
            reg_clear: RegClearType::VectorOnly,
        }
    }
}

impl PoolConfig {
    /// Capacity of a group, in sub-page units.
    pub fn capacity(&self) -> usize {
        self.group_size / SUBPAGE_SIZE
    }

    pub fn validate(&self) -> XomResult<()> {
        if self.group_size == 0 || self.group_size % PAGE_SIZE != 0 {
            return Err(XomError::InvalidArgument);
        }
        if self.free_threshold > self.capacity() {
            return Err(XomError::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PoolEntry<G> {
    group: G,
    // Units handed out so far. They are never handed out again.
    consumed: usize,
    // Highest page already marked for register clearing:
    marked_up_to: Option<usize>,
    // Live blob address -> units:
    live: HashMap<usize, usize>,
}

impl<G> PoolEntry<G> {
    fn new(group: G) -> Self {
        PoolEntry {
            group,
            consumed: 0,
            marked_up_to: None,
            live: HashMap::new(),
        }
    }

    fn usage(&self) -> usize {
        self.live.values().sum()
    }
}

/// Occupancy of one group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GroupStats {
    pub addr: usize,
    pub consumed: usize,
    pub live_units: usize,
    pub live_blobs: usize,
}

pub struct SubpagePool<P: SubpageProvider> {
    config: PoolConfig,
    provider: P,
    // In order of creation:
    groups: Vec<PoolEntry<P::Group>>,
}

impl<P: SubpageProvider> SubpagePool<P> {
    pub fn new(provider: P) -> Self {
        SubpagePool {
            config: PoolConfig::default(),
            provider,
            groups: Vec::new(),
        }
    }

    pub fn with_config(provider: P, config: PoolConfig) -> XomResult<Self> {
        config.validate()?;
        Ok(SubpagePool {
            config,
            provider,
            groups: Vec::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn stats(&self) -> Vec<GroupStats> {
        self.groups
            .iter()
            .map(|entry| GroupStats {
                addr: self.provider.group_addr(&entry.group),
                consumed: entry.consumed,
                live_units: entry.usage(),
                live_blobs: entry.live.len(),
            })
            .collect()
    }

    /// Seal `data` into some group and return the address it can be executed
    /// from. The address stays valid until it is released.
    pub fn acquire(&mut self, data: &[u8]) -> XomResult<usize> {
        let units = bytes_to_subpages(data.len());
        if units == 0 || units > self.config.capacity() {
            return Err(XomError::InvalidArgument);
        }

        let capacity = self.config.capacity();
        let SubpagePool {
            config,
            provider,
            groups,
        } = self;

        // Most recent group first, so that older groups can drain:
        for entry in groups.iter_mut().rev() {
            if capacity - entry.consumed < units {
                continue;
            }
            match provider.fill_and_lock(&mut entry.group, data) {
                Ok(addr) => {
                    Self::update_entry(provider, config, entry, addr, units)?;
                    return Ok(addr);
                }
                Err(e) => {
                    warn!(
                        "SubpagePool: Filling group at {:#x} failed ({}), trying the next one",
                        provider.group_addr(&entry.group),
                        e
                    );
                }
            }
        }

        let group = provider.alloc_group(config.group_size)?;
        let mut entry = PoolEntry::new(group);
        match provider.fill_and_lock(&mut entry.group, data) {
            Ok(addr) => {
                debug!(
                    "SubpagePool: New group at {:#x}, {} groups in total",
                    provider.group_addr(&entry.group),
                    groups.len() + 1
                );
                let res = Self::update_entry(provider, config, &mut entry, addr, units);
                groups.push(entry);
                res.map(|()| addr)
            }
            Err(e) => {
                if let Err(free_err) = provider.free_group(&entry.group) {
                    warn!("SubpagePool: Failed to free new group: {}", free_err);
                }
                Err(e)
            }
        }
    }

    fn update_entry(
        provider: &mut P,
        config: &PoolConfig,
        entry: &mut PoolEntry<P::Group>,
        addr: usize,
        units: usize,
    ) -> XomResult<()> {
        // Locked units are used up whether or not the blob is handed out:
        entry.consumed += units;
        entry.live.insert(addr, units);

        if !provider.needs_register_clear() {
            return Ok(());
        }

        let offset = addr - provider.group_addr(&entry.group);
        let first = offset / PAGE_SIZE;
        let last = (offset + units * SUBPAGE_SIZE - 1) / PAGE_SIZE;
        let from = entry.marked_up_to.map_or(first, |m| first.max(m + 1));

        for page in from..=last {
            if let Err(e) = provider.mark_register_clear(&entry.group, page, config.reg_clear) {
                warn!(
                    "SubpagePool: Marking page {} for register clearing failed: {}",
                    page, e
                );
                entry.live.remove(&addr);
                if let Err(release_err) = provider.release(&mut entry.group, addr) {
                    warn!(
                        "SubpagePool: Failed to drop unmarked blob at {:#x}: {}",
                        addr, release_err
                    );
                }
                return Err(e);
            }
            entry.marked_up_to = Some(page);
        }
        Ok(())
    }

    /// Give up the blob at `addr`. Releasing an address the pool does not
    /// know is `InvalidArgument`.
    pub fn release(&mut self, addr: usize) -> XomResult<()> {
        let Some(idx) = self
            .groups
            .iter()
            .position(|entry| entry.live.contains_key(&addr))
        else {
            warn!("SubpagePool: Release of unknown blob at {:#x}", addr);
            return Err(XomError::InvalidArgument);
        };

        let entry = &mut self.groups[idx];
        let empty = self.provider.release(&mut entry.group, addr)?;
        entry.live.remove(&addr);

        if !empty || !entry.live.is_empty() || entry.consumed < self.config.free_threshold {
            return Ok(());
        }

        // The group stays in the pool until it is really unsealed, so a
        // failure here can be retried by `destroy_all`:
        self.provider.free_group(&entry.group)?;
        let entry = self.groups.remove(idx);
        debug!(
            "SubpagePool: Reclaimed group at {:#x} ({} units consumed), {} groups left",
            self.provider.group_addr(&entry.group),
            entry.consumed,
            self.groups.len()
        );
        Ok(())
    }

    /// Give back every group, whether blobs in it are still in use or not.
    /// Groups that fail to be freed stay in the pool.
    pub fn destroy_all(&mut self) -> XomResult<()> {
        let mut res = Ok(());
        let provider = &mut self.provider;
        self.groups.retain(|entry| match provider.free_group(&entry.group) {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    "SubpagePool: Failed to free group at {:#x}: {}",
                    provider.group_addr(&entry.group),
                    e
                );
                res = res.and(Err(e));
                true
            }
        });
        res
    }
}

impl<P: SubpageProvider> Drop for SubpagePool<P> {
    fn drop(&mut self) {
        if !self.groups.is_empty() {
            debug!("SubpagePool: Dropping {} groups", self.groups.len());
            if self.destroy_all().is_err() {
                warn!("SubpagePool: Leaking {} groups", self.groups.len());
            }
        }
    }
}
