// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use log::{debug, warn};
use page_tracking::{HwMemMap, MemRange, PageInfo, PageMap, PagePool};
use pkvm_page_tables::{
    default_host_prot, prot_rwx, HostS2PageTable, Level, PageTableError, PageTableResult, Prot,
    ProtSet, Pte, WalkFlags,
};
use pkvm_pages::{OwnerId, PageSize, PageState, PageStateFlag, PhysPageAddr, RawAddr, PAGE_SIZE};

use crate::error::{Error, Result};

/// Proof that a range of the host view was found in the state a transition expects. Consumed by
/// the mutation that follows the check, while the host lock is still held.
#[must_use]
pub(crate) struct HostRangeChecked {
    addr: u64,
    size: u64,
}

/// Returns the addresses of the 4kB pages in `[addr, addr + size)`.
pub(crate) fn pages_in(addr: u64, size: u64) -> impl Iterator<Item = PhysPageAddr> {
    (0..size / PAGE_SIZE).filter_map(move |i| PhysPageAddr::phys(addr + i * PAGE_SIZE))
}

/// Returns true if `[addr, addr + size)` is a non-empty page-aligned range.
pub(crate) fn is_page_range(addr: u64, size: u64) -> bool {
    size != 0
        && PageSize::Size4k.is_aligned(addr)
        && PageSize::Size4k.is_aligned(size)
        && addr.checked_add(size).is_some()
}

/// Derives the host's state for an MMIO page from its stage-2 entry. There is no metadata for
/// MMIO, so the tree is the only record.
fn mmio_state(pte: &Pte) -> PageState {
    match pte {
        Pte::Leaf { prot, state, .. } => {
            if *prot & prot_rwx() != Prot::R | Prot::W {
                state.with(PageStateFlag::RestrictedProt)
            } else {
                *state
            }
        }
        p if p.is_empty() => PageState::owned(),
        _ => PageState::nopage(),
    }
}

/// The host stage-2 identity map together with the per-page metadata for RAM. Both are only ever
/// changed together, under the host lock.
pub(crate) struct HostMmu {
    pgt: HostS2PageTable,
    pool: PagePool,
    pages: PageMap,
    mem_map: Arc<HwMemMap>,
    max_owner_id: u8,
}

impl HostMmu {
    pub fn new(
        pgt: HostS2PageTable,
        pool: PagePool,
        pages: PageMap,
        mem_map: Arc<HwMemMap>,
        max_owner_id: u8,
    ) -> Self {
        Self {
            pgt,
            pool,
            pages,
            mem_map,
            max_owner_id,
        }
    }

    pub fn mem_map(&self) -> &HwMemMap {
        &self.mem_map
    }

    pub fn pgt(&self) -> &HostS2PageTable {
        &self.pgt
    }

    /// Returns the metadata of the RAM page containing `addr`.
    pub fn page_info(&self, addr: u64) -> Option<&PageInfo> {
        self.pages
            .get(PhysPageAddr::with_round_down(RawAddr::phys(addr), PageSize::Size4k))
    }

    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, Level)> {
        Ok(self.pgt.get_leaf(addr)?)
    }

    /// Checks that every page in the range is in `state` and unpinned.
    pub fn check_range(&self, addr: u64, size: u64, state: PageState) -> Result<HostRangeChecked> {
        self.check(addr, size, state, false)
    }

    /// Like `check_range()` but tolerates pinned pages.
    pub fn check_range_pinned_ok(
        &self,
        addr: u64,
        size: u64,
        state: PageState,
    ) -> Result<HostRangeChecked> {
        self.check(addr, size, state, true)
    }

    fn check(
        &self,
        addr: u64,
        size: u64,
        state: PageState,
        allow_pinned: bool,
    ) -> Result<HostRangeChecked> {
        if !is_page_range(addr, size) {
            return Err(Error::Inval);
        }
        let end = addr + size;
        let (reg, range) = self.mem_map.find(addr);
        if !range.contains(end - 1) {
            return Err(Error::Inval);
        }
        match reg {
            None => {
                self.pgt.walk(addr, size, WalkFlags::Leaf as u8, |ctx| {
                    if mmio_state(&ctx.pte) != state {
                        return Err(Error::Perm);
                    }
                    Ok(())
                })?;
            }
            Some(reg) if reg.no_map() => return Err(Error::Perm),
            Some(_) => {
                for page in pages_in(addr, size) {
                    let info = self.pages.get(page).ok_or(Error::Inval)?;
                    if info.host_state() != state {
                        return Err(Error::Perm);
                    }
                    if !allow_pinned && info.refcount() != 0 {
                        return Err(Error::Busy);
                    }
                }
            }
        }
        Ok(HostRangeChecked { addr, size })
    }

    /// Hands the checked range to `owner`.
    pub fn set_owner(&mut self, checked: HostRangeChecked, owner: OwnerId) -> Result<()> {
        self.set_owner_locked(checked.addr, checked.size, owner)
    }

    /// Moves the checked range to `state`, mapping it back in if it was absent from the host view.
    pub fn set_state(&mut self, checked: HostRangeChecked, state: PageState) -> Result<()> {
        let (addr, size) = (checked.addr, checked.size);
        if !self.mem_map.range_is_memory(addr, addr + size) {
            return self.try_op(|pgt, pool| {
                pgt.map(addr, size, addr, default_host_prot(false), state, pool)
            });
        }
        if self.page_info(addr).map_or(false, |p| p.host_state().is_nopage()) {
            self.idmap_locked(addr, size, default_host_prot(true))?;
        }
        self.update_pages(addr, size, |info| {
            info.set_owner(OwnerId::HOST);
            info.set_host_state(state);
        });
        Ok(())
    }

    /// Pins every page of the checked range.
    pub fn pin(&mut self, checked: HostRangeChecked) -> Result<()> {
        let (addr, size) = (checked.addr, checked.size);
        if !self.mem_map.range_is_memory(addr, addr + size) {
            return Ok(());
        }
        for page in pages_in(addr, size) {
            let info = self.pages.get(page).ok_or(Error::Inval)?;
            if info.refcount() == u16::MAX {
                return Err(Error::Inval);
            }
        }
        for page in pages_in(addr, size) {
            if let Some(info) = self.pages.get_mut(page) {
                info.pin()?;
            }
        }
        Ok(())
    }

    /// Drops a pin on every page of the range. Fails without changing anything if any page is
    /// not pinned.
    pub fn unpin(&mut self, addr: u64, size: u64) -> Result<()> {
        for page in pages_in(addr, size) {
            let info = self.pages.get(page).ok_or(Error::Inval)?;
            if info.refcount() == 0 {
                return Err(Error::Inval);
            }
        }
        for page in pages_in(addr, size) {
            if let Some(info) = self.pages.get_mut(page) {
                info.unpin()?;
            }
        }
        Ok(())
    }

    /// Applies `f` to the metadata of every RAM page in the range.
    pub fn update_pages(&mut self, addr: u64, size: u64, mut f: impl FnMut(&mut PageInfo)) {
        for page in pages_in(addr, size) {
            if let Some(info) = self.pages.get_mut(page) {
                f(info);
            }
        }
    }

    /// Records `owner` as the owner of `[addr, addr + size)`. The host gets the range back as a
    /// default identity mapping; anyone else gets an annotation and the host loses access.
    pub fn set_owner_locked(&mut self, addr: u64, size: u64, owner: OwnerId) -> Result<()> {
        if owner.raw() > self.max_owner_id {
            return Err(Error::Inval);
        }
        let is_memory = self.mem_map.range_is_memory(addr, addr + size);
        if owner.is_host() {
            self.idmap_locked(addr, size, default_host_prot(is_memory))?;
        } else {
            self.try_op(|pgt, pool| pgt.annotate(addr, size, Pte::owned_by(owner), pool))?;
        }
        if is_memory {
            let state = if owner.is_host() {
                PageState::owned()
            } else {
                PageState::nopage()
            };
            self.update_pages(addr, size, |info| {
                info.set_owner(owner);
                info.set_host_state(state);
            });
        }
        Ok(())
    }

    /// Identity-maps `[addr, addr + size)` with `prot`.
    pub fn idmap_locked(&mut self, addr: u64, size: u64, prot: ProtSet) -> Result<()> {
        self.try_op(|pgt, pool| pgt.map(addr, size, addr, prot, PageState::owned(), pool))
    }

    /// Narrows `range`, the region or MMIO gap containing `addr`, to the largest block that can
    /// be identity-mapped around `addr` without touching any existing entry.
    pub fn adjust_range(&self, addr: u64, range: MemRange) -> Result<MemRange> {
        let (pte, mut level) = self.pgt.get_leaf(addr)?;
        if pte.is_valid() {
            // Someone else mapped it first.
            return Err(Error::Again);
        }
        if !pte.is_empty() {
            return Err(Error::Perm);
        }
        loop {
            let granule = level.granule();
            let start = addr & !(granule - 1);
            let end = start + granule;
            let fits = range.start <= start && end <= range.end;
            if fits && (level.block_allowed() || level.is_last()) {
                return Ok(MemRange { start, end });
            }
            level = level.next().ok_or(Error::Inval)?;
        }
    }

    /// Runs `op` against the tree. If the node pool runs dry, drops the mappings of every range
    /// the host can't move and tries once more.
    fn try_op<F>(&mut self, mut op: F) -> Result<()>
    where
        F: FnMut(&mut HostS2PageTable, &mut PagePool) -> PageTableResult<()>,
    {
        match op(&mut self.pgt, &mut self.pool) {
            Err(PageTableError::InsufficientPtePages) => {
                warn!("host stage-2 pool exhausted, reclaiming unmoveable mappings");
                self.unmap_unmoveable()?;
                Ok(op(&mut self.pgt, &mut self.pool)?)
            }
            r => Ok(r?),
        }
    }

    /// Reclaims the default mappings outside every moveable range, freeing the nodes that only
    /// held those.
    pub(crate) fn unmap_unmoveable(&mut self) -> Result<()> {
        let ia_end = 1u64 << self.pgt.ia_bits();
        let mem_map = self.mem_map.clone();
        let mut cur = 0;
        for m in mem_map.moveable_regions() {
            let start = m.start.min(ia_end);
            if start > cur {
                self.pgt.reclaim_leaves(cur, start - cur, &mut self.pool)?;
            }
            cur = cur.max(m.start.saturating_add(m.size).min(ia_end));
        }
        if cur < ia_end {
            self.pgt.reclaim_leaves(cur, ia_end - cur, &mut self.pool)?;
        }
        debug!(
            "host stage-2 holds {} nodes, {} free",
            self.pgt.num_nodes(),
            self.pool.len()
        );
        Ok(())
    }

    /// Makes sure the node pool can back any update of `[addr, addr + size)`, reclaiming the
    /// unmoveable mappings once if it can't. Fails with `ENOMEM` and the range untouched
    /// otherwise.
    pub fn reserve(&mut self, addr: u64, size: u64) -> Result<()> {
        if self.pool.len() >= self.pgt.nodes_needed(addr, size)? {
            return Ok(());
        }
        warn!("host stage-2 pool short for {:#x}-{:#x}", addr, addr + size);
        self.unmap_unmoveable()?;
        if self.pool.len() < self.pgt.nodes_needed(addr, size)? {
            return Err(Error::NoMem);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;

    #[test]
    fn mmio_states() {
        assert_eq!(mmio_state(&Pte::EMPTY), PageState::owned());
        assert_eq!(mmio_state(&Pte::owned_by(OwnerId::HYP)), PageState::nopage());
        let default = Pte::Leaf {
            phys: 0x1000,
            prot: default_host_prot(false),
            state: PageState::shared_owned(),
        };
        assert_eq!(mmio_state(&default), PageState::shared_owned());
        let ro = Pte::Leaf {
            phys: 0x1000,
            prot: Prot::R.into(),
            state: PageState::owned(),
        };
        assert_eq!(
            mmio_state(&ro),
            PageState::from_flags(PageStateFlag::RestrictedProt)
        );
    }

    #[test]
    fn checks_ram() {
        let mp = stub_mem_protect();
        let mut host = mp.host.lock();
        let addr = RAM_BASE + 0x10_0000;
        assert!(host.check_range(addr, 0x3000, PageState::owned()).is_ok());
        assert_eq!(
            host.check_range(addr, 0x3000, PageState::nopage()).err(),
            Some(Error::Perm)
        );
        assert_eq!(
            host.check_range(addr + 1, 0x1000, PageState::owned()).err(),
            Some(Error::Inval)
        );
        assert_eq!(
            host.check_range(addr, 0, PageState::owned()).err(),
            Some(Error::Inval)
        );
        // The carve-out split the region, so a range running into it isn't one region.
        let carveout = mp.carveout();
        assert_eq!(
            host.check_range(carveout.start - 0x1000, 0x2000, PageState::owned())
                .err(),
            Some(Error::Inval)
        );
        assert!(host
            .check_range(carveout.start, 0x1000, PageState::nopage())
            .is_ok());

        let checked = host.check_range(addr, 0x1000, PageState::owned()).unwrap();
        host.pin(checked).unwrap();
        assert_eq!(
            host.check_range(addr, 0x1000, PageState::owned()).err(),
            Some(Error::Busy)
        );
        assert!(host
            .check_range_pinned_ok(addr, 0x1000, PageState::owned())
            .is_ok());
        host.unpin(addr, 0x1000).unwrap();
        assert_eq!(host.unpin(addr, 0x1000), Err(Error::Inval));
    }

    #[test]
    fn no_map_region_is_refused() {
        let mp = stub_mem_protect();
        let host = mp.host.lock();
        assert_eq!(
            host.check_range(FW_RESERVED_BASE, 0x1000, PageState::owned())
                .err(),
            Some(Error::Perm)
        );
    }

    #[test]
    fn set_owner_round_trip() {
        let mp = stub_mem_protect();
        let mut host = mp.host.lock();
        let addr = RAM_BASE + 0x20_0000;
        let checked = host.check_range(addr, 0x2000, PageState::owned()).unwrap();
        host.set_owner(checked, OwnerId::HYP).unwrap();
        assert_eq!(host.page_info(addr).unwrap().owner(), OwnerId::HYP);
        assert!(host.page_info(addr + 0x1000).unwrap().host_state().is_nopage());
        assert_eq!(host.get_leaf(addr).unwrap().0, Pte::owned_by(OwnerId::HYP));

        let checked = host.check_range(addr, 0x2000, PageState::nopage()).unwrap();
        host.set_owner(checked, OwnerId::HOST).unwrap();
        assert!(host.page_info(addr).unwrap().host_state().is_owned());
        assert!(host.get_leaf(addr).unwrap().0.is_leaf());

        let too_big = OwnerId::from_raw(u8::MAX);
        let mut limited = stub_mem_protect_with(|c| c.max_owner_id = 100);
        let checked = limited
            .host
            .get_mut()
            .check_range(addr, 0x1000, PageState::owned())
            .unwrap();
        assert_eq!(
            limited.host.get_mut().set_owner(checked, too_big),
            Err(Error::Inval)
        );
    }

    #[test]
    fn mmio_state_from_tree() {
        let mp = stub_mem_protect();
        let mut host = mp.host.lock();
        assert!(host
            .check_range(MMIO_BASE, 0x2000, PageState::owned())
            .is_ok());
        let checked = host
            .check_range(MMIO_BASE, 0x1000, PageState::owned())
            .unwrap();
        host.set_state(checked, PageState::shared_owned()).unwrap();
        assert!(host
            .check_range(MMIO_BASE, 0x1000, PageState::shared_owned())
            .is_ok());
        assert_eq!(
            host.check_range(MMIO_BASE, 0x2000, PageState::owned()).err(),
            Some(Error::Perm)
        );
    }

    #[test]
    fn adjusts_to_blocks() {
        let mp = stub_mem_protect();
        let mut host = mp.host.lock();
        // A 2MB-aligned gap that is at least 4MB wide gets a block.
        let gap = MemRange {
            start: MMIO_BASE,
            end: MMIO_BASE + 0x40_0000,
        };
        let adjusted = host.adjust_range(MMIO_BASE + 0x12_3000, gap).unwrap();
        assert_eq!(adjusted.start, MMIO_BASE);
        assert_eq!(adjusted.size(), 0x20_0000);

        // A narrow range only gets the page.
        let narrow = MemRange {
            start: MMIO_BASE + 0x12_0000,
            end: MMIO_BASE + 0x12_8000,
        };
        let adjusted = host.adjust_range(MMIO_BASE + 0x12_3000, narrow).unwrap();
        assert_eq!(adjusted.start, MMIO_BASE + 0x12_3000);
        assert_eq!(adjusted.size(), 0x1000);

        host.idmap_locked(MMIO_BASE, 0x1000, default_host_prot(false))
            .unwrap();
        assert_eq!(host.adjust_range(MMIO_BASE, gap), Err(Error::Again));
        host.set_owner_locked(MMIO_BASE + 0x1000, 0x1000, OwnerId::HYP)
            .unwrap();
        assert_eq!(host.adjust_range(MMIO_BASE + 0x1000, gap), Err(Error::Perm));
    }

    #[test]
    fn reclaims_unmoveable_when_pool_runs_dry() {
        let mp = stub_mem_protect();
        let mut host = mp.host.lock();
        // Map MMIO pages one per 2MB block until the pool is exhausted. Each needs a fresh L3
        // node, and only the reclaim of unmoveable ranges can give those back.
        let free = host.pool_len() as u64;
        for i in 0..free + 4 {
            let addr = MMIO_BASE + i * 0x20_0000;
            host.idmap_locked(addr, 0x1000, default_host_prot(false))
                .unwrap();
        }
        // RAM mappings survived.
        assert!(host.get_leaf(RAM_BASE).unwrap().0.is_leaf());
    }
}
