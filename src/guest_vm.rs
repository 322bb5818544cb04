// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use page_tracking::PagePool;
use pkvm_page_tables::{
    collect_leaves, prot_rwx, GuestS2PageTable, GuestS2Policy, Level, ProtSet, Pte, WalkCtx,
    WalkFlags,
};
use pkvm_pages::{OwnerId, PageState, PageStateFlag, PhysPageAddr, PAGE_SIZE};
use sync::Mutex;

use crate::coalesce::{coalesce, Request, Run};
use crate::error::{Error, Result};
use crate::host_mmu::is_page_range;

/// Derives a guest's state for the page behind `pte`.
pub(crate) fn guest_state(pte: &Pte) -> PageState {
    match pte {
        Pte::Leaf { prot, state, .. } if *prot & prot_rwx() != prot_rwx() => {
            state.with(PageStateFlag::RestrictedProt)
        }
        Pte::Leaf { state, .. } => *state,
        p if p.is_mmio_note() => PageState::nopage().with(PageStateFlag::Mmio),
        _ => PageState::nopage(),
    }
}

/// Proof that a range of a guest's stage-2 is in the state a transition expects.
#[must_use]
pub(crate) struct GuestRangeChecked {
    ipa: u64,
    size: u64,
}

/// A guest's stage-2 table and the pages that back it.
///
/// New nodes come from the memcache of the vCPU on whose behalf the mapping is made. Nodes freed
/// by unmapping land in `pool` and go back to the host at teardown.
pub(crate) struct GuestMmu {
    pgt: GuestS2PageTable,
    pool: PagePool,
    memcaches: Vec<PagePool>,
}

impl GuestMmu {
    fn new(ia_bits: u32, pgd: PhysPageAddr, nr_vcpus: usize) -> Result<Self> {
        let mut pool = PagePool::with_range(pgd, 1);
        let pgt = GuestS2PageTable::new(ia_bits, GuestS2Policy, &mut pool)?;
        let memcaches = (0..nr_vcpus).map(|_| PagePool::new()).collect();
        Ok(Self {
            pgt,
            pool,
            memcaches,
        })
    }

    pub fn pgt(&self) -> &GuestS2PageTable {
        &self.pgt
    }

    pub fn get_leaf(&self, ipa: u64) -> Result<(Pte, Level)> {
        Ok(self.pgt.get_leaf(ipa)?)
    }

    pub fn check_range(&self, ipa: u64, size: u64, state: PageState) -> Result<GuestRangeChecked> {
        if !is_page_range(ipa, size) {
            return Err(Error::Inval);
        }
        self.pgt.walk(ipa, size, WalkFlags::Leaf as u8, |ctx| {
            if guest_state(&ctx.pte) != state {
                return Err(Error::Perm);
            }
            Ok(())
        })?;
        Ok(GuestRangeChecked { ipa, size })
    }

    /// Coalesces entries from `ipa` in the state `req` asks for. The returned proof covers the
    /// requested pages the run spans.
    pub fn request_transition(
        &self,
        ipa: u64,
        nr_pages: u64,
        req: &Request,
    ) -> Result<(Run, GuestRangeChecked)> {
        let run = coalesce(&self.pgt, ipa, nr_pages, req, guest_state)?;
        let checked = GuestRangeChecked {
            ipa,
            size: run.nr_pages * PAGE_SIZE,
        };
        Ok((run, checked))
    }

    /// Makes sure the memcache of `vcpu_idx` holds enough pages for any mapping in
    /// `[ipa, ipa + size)` to succeed.
    pub fn reserve(&self, vcpu_idx: usize, ipa: u64, size: u64) -> Result<()> {
        let memcache = self.memcaches.get(vcpu_idx).ok_or(Error::Inval)?;
        if memcache.len() < self.pgt.nodes_needed(ipa, size)? {
            return Err(Error::NoMem);
        }
        Ok(())
    }

    pub fn map(
        &mut self,
        checked: GuestRangeChecked,
        phys: u64,
        prot: ProtSet,
        state: PageState,
        vcpu_idx: usize,
    ) -> Result<()> {
        let memcache = self.memcaches.get_mut(vcpu_idx).ok_or(Error::Inval)?;
        Ok(self
            .pgt
            .map(checked.ipa, checked.size, phys, prot, state, memcache)?)
    }

    pub fn annotate(
        &mut self,
        checked: GuestRangeChecked,
        pte: Pte,
        vcpu_idx: usize,
    ) -> Result<()> {
        let memcache = self.memcaches.get_mut(vcpu_idx).ok_or(Error::Inval)?;
        Ok(self.pgt.annotate(checked.ipa, checked.size, pte, memcache)?)
    }

    /// Rewrites the sharing state recorded in the checked leaves.
    pub fn set_state(&mut self, checked: GuestRangeChecked, state: PageState) -> Result<()> {
        Ok(self.pgt.set_leaf_state(checked.ipa, checked.size, state)?)
    }

    pub fn unmap(&mut self, checked: GuestRangeChecked) -> Result<()> {
        Ok(self.pgt.unmap(checked.ipa, checked.size, &mut self.pool)?)
    }

    pub fn relax_perms(&mut self, checked: GuestRangeChecked, prot: ProtSet) -> Result<()> {
        Ok(self.pgt.relax_perms(checked.ipa, prot)?)
    }

    pub fn wrprotect(&mut self, checked: GuestRangeChecked) -> Result<()> {
        Ok(self.pgt.wrprotect(checked.ipa, checked.size)?)
    }

    /// Returns a proof for the single page at `ipa` without checking it; for paths that have
    /// already inspected the entry with `get_leaf()`.
    pub fn page_at(&self, ipa: u64) -> GuestRangeChecked {
        GuestRangeChecked {
            ipa,
            size: PAGE_SIZE,
        }
    }

    /// Adds donated pages to the memcache of `vcpu_idx`.
    pub fn topup(
        &mut self,
        vcpu_idx: usize,
        pages: impl IntoIterator<Item = PhysPageAddr>,
    ) -> Result<()> {
        let memcache = self.memcaches.get_mut(vcpu_idx).ok_or(Error::Inval)?;
        memcache.refill(pages);
        Ok(())
    }

    /// Returns every valid leaf of the table.
    pub fn leaves(&self) -> Result<Vec<WalkCtx>> {
        let size = 1u64 << self.pgt.ia_bits();
        Ok(collect_leaves(&self.pgt, 0, size)?)
    }

    /// Returns the number of pages backing the table and its caches.
    #[cfg(test)]
    pub fn backing_pages(&self) -> usize {
        let cached: usize = self.memcaches.iter().map(|m| m.len()).sum();
        self.pgt.num_nodes() + self.pool.len() + cached
    }

    /// Destroys the table and returns every page that backed it.
    pub fn into_pages(self) -> Vec<PhysPageAddr> {
        let Self {
            pgt,
            mut pool,
            memcaches,
        } = self;
        pgt.destroy(&mut pool);
        let mut pages = pool.drain();
        for mut memcache in memcaches {
            pages.extend(memcache.drain());
        }
        pages
    }
}

/// Creation parameters of a VM.
#[derive(Clone, Copy, Debug)]
pub struct VmParams {
    pub nr_vcpus: usize,
    /// Protected VMs own their memory; the host only gets pages back poisoned.
    pub protected: bool,
    /// Restricts the guest's MMIO accesses to ranges it guarded first.
    pub mmio_guard: bool,
    /// Guest address at which the platform firmware image is staged, if any.
    pub firmware_load_ipa: Option<u64>,
    /// Page the host donates for the root of the stage-2 table.
    pub pgd_pfn: u64,
}

/// The hypervisor's view of a guest.
pub struct HypVm {
    handle: u64,
    owner_id: OwnerId,
    params: VmParams,
    pub(crate) mmu: Mutex<Option<GuestMmu>>,
    vcpu_loaded: Vec<AtomicBool>,
    refcount: AtomicUsize,
    dying: AtomicBool,
}

impl HypVm {
    pub(crate) fn new(
        handle: u64,
        owner_id: OwnerId,
        params: VmParams,
        ia_bits: u32,
        pgd: PhysPageAddr,
    ) -> Result<Self> {
        let mmu = GuestMmu::new(ia_bits, pgd, params.nr_vcpus)?;
        Ok(Self {
            handle,
            owner_id,
            params,
            mmu: Mutex::new(Some(mmu)),
            vcpu_loaded: (0..params.nr_vcpus).map(|_| AtomicBool::new(false)).collect(),
            refcount: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn nr_vcpus(&self) -> usize {
        self.params.nr_vcpus
    }

    pub fn is_protected(&self) -> bool {
        self.params.protected
    }

    pub fn has_mmio_guard(&self) -> bool {
        self.params.mmio_guard
    }

    pub fn firmware_load_ipa(&self) -> Option<u64> {
        self.params.firmware_load_ipa
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// Marks the VM as dying. Fails if it already was.
    pub(crate) fn set_dying(&self) -> Result<()> {
        self.dying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Inval)
    }

    /// Claims vCPU `idx` for loading on a physical CPU.
    pub(crate) fn claim_vcpu(&self, idx: usize) -> Result<()> {
        let loaded = self.vcpu_loaded.get(idx).ok_or(Error::Inval)?;
        loaded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    pub(crate) fn release_vcpu(&self, idx: usize) {
        if let Some(loaded) = self.vcpu_loaded.get(idx) {
            loaded.store(false, Ordering::Release);
        }
    }

    /// Runs `f` with the guest's stage-2 locked. Fails with `ENOENT` once the table has been torn
    /// down.
    pub(crate) fn with_mmu<T>(&self, f: impl FnOnce(&mut GuestMmu) -> Result<T>) -> Result<T> {
        let mut mmu = self.mmu.lock();
        let mmu = mmu.as_mut().ok_or(Error::NoEnt)?;
        f(mmu)
    }
}

/// A vCPU of a guest: the VM it belongs to and its index.
#[derive(Clone)]
pub struct Vcpu {
    vm: Arc<HypVm>,
    idx: usize,
}

impl Vcpu {
    pub(crate) fn new(vm: Arc<HypVm>, idx: usize) -> Self {
        Self { vm, idx }
    }

    pub fn vm(&self) -> &Arc<HypVm> {
        &self.vm
    }

    pub fn idx(&self) -> usize {
        self.idx
    }
}
