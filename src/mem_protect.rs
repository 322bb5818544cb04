// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use log::info;
use page_tracking::{HwMemMap, MemRange, PageInfo};
use pkvm_page_tables::{page_hyp, page_hyp_device, Level, ProtSet, Pte};
use pkvm_pages::{OwnerId, PageState, PageStateFlag, PAGE_SIZE};
use sync::Mutex;

use crate::config::MemProtectConfig;
use crate::error::{Error, OrHalt, Result};
use crate::handler_slot::HandlerSlots;
use crate::host_mmu::{is_page_range, HostMmu};
use crate::hyp_mmu::HypMmu;
use crate::per_cpu::PerCpu;
use crate::phys_mem::PhysMem;
use crate::vm_table::VmTable;

/// Converts a page frame number to its address.
pub(crate) fn pfn_to_addr(pfn: u64) -> Result<u64> {
    pfn.checked_mul(PAGE_SIZE).ok_or(Error::Inval)
}

/// Converts `nr` pages from `pfn` to an address and size, rejecting empty or wrapping ranges.
pub(crate) fn pfn_range(pfn: u64, nr: u64) -> Result<(u64, u64)> {
    let addr = pfn_to_addr(pfn)?;
    let size = nr
        .checked_mul(PAGE_SIZE)
        .filter(|s| *s != 0)
        .ok_or(Error::Inval)?;
    addr.checked_add(size).ok_or(Error::Inval)?;
    Ok((addr, size))
}

/// Gives hyp-owned pages back to the host. Both locks must be held.
pub(crate) fn donate_hyp_to_host_locked(
    host: &mut HostMmu,
    hyp: &mut HypMmu,
    addr: u64,
    size: u64,
) -> Result<()> {
    let host_ok = host.check_range(addr, size, PageState::nopage())?;
    let hyp_ok = hyp.check_range(addr, size, PageState::owned())?;
    hyp.reserve(addr, size)?;
    host.reserve(addr, size)?;
    hyp.unmap(hyp_ok).or_halt("hyp unmap of donated pages");
    host.set_owner(host_ok, OwnerId::HOST)
        .or_halt("host remap of donated pages");
    Ok(())
}

/// Hands host-owned pages to the hypervisor, mapped with `prot`. Both locks must be held.
pub(crate) fn donate_host_to_hyp_locked(
    host: &mut HostMmu,
    hyp: &mut HypMmu,
    addr: u64,
    size: u64,
    prot: ProtSet,
) -> Result<()> {
    let host_ok = host.check_range(addr, size, PageState::owned())?;
    let hyp_ok = hyp.check_range(addr, size, PageState::nopage())?;
    hyp.reserve(addr, size)?;
    host.reserve(addr, size)?;
    hyp.map(hyp_ok, prot, PageState::owned())
        .or_halt("hyp map of donated pages");
    host.set_owner(host_ok, OwnerId::HYP)
        .or_halt("host annotation of donated pages");
    Ok(())
}

/// The memory protection state of the whole machine: the host stage-2 and page metadata, the
/// hypervisor's own mappings, the guests and the per-CPU state.
///
/// Locks are always taken host first, then hyp, then the guest's.
pub struct MemProtect {
    pub(crate) config: MemProtectConfig,
    pub(crate) mem_map: Arc<HwMemMap>,
    pub(crate) host: Mutex<HostMmu>,
    pub(crate) hyp: Mutex<HypMmu>,
    pub(crate) vms: VmTable,
    pub(crate) cpus: PerCpu,
    pub(crate) phys: PhysMem,
    pub(crate) protected_pages: AtomicU64,
    pub(crate) module_registration_open: AtomicBool,
    pub(crate) handlers: HandlerSlots,
    pub(crate) carveout: MemRange,
}

impl MemProtect {
    pub fn config(&self) -> &MemProtectConfig {
        &self.config
    }

    pub fn mem_map(&self) -> &HwMemMap {
        &self.mem_map
    }

    /// Returns the hypervisor's private memory.
    pub fn carveout(&self) -> MemRange {
        self.carveout
    }

    /// Returns the contents of physical memory.
    pub fn phys_mem(&self) -> &PhysMem {
        &self.phys
    }

    /// Returns the number of pages currently owned by protected guests.
    pub fn protected_pages(&self) -> u64 {
        self.protected_pages.load(Ordering::Acquire)
    }

    pub(crate) fn protected_pages_add(&self, nr: u64) {
        self.protected_pages.fetch_add(nr, Ordering::AcqRel);
    }

    pub(crate) fn protected_pages_sub(&self, nr: u64) {
        // Saturates: pages of non-protected guests are counted the same way.
        let _ = self
            .protected_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(nr))
            });
    }

    /// Returns a copy of the metadata of the RAM page containing `phys`.
    pub fn host_page_info(&self, phys: u64) -> Option<PageInfo> {
        self.host.lock().page_info(phys).copied()
    }

    /// Looks up the host stage-2 entry covering `phys`.
    pub fn host_stage2_get_leaf(&self, phys: u64) -> Result<(Pte, Level)> {
        self.host.lock().get_leaf(phys)
    }

    /// Checks that the metadata of the RAM page at `phys` agrees with the host stage-2.
    ///
    /// A page annotated with an owner must be recorded as that owner's and absent from the host
    /// view, unless a module owns it. Any other page must be the host's.
    pub fn verify_host_page(&self, phys: u64) -> Result<()> {
        let host = self.host.lock();
        let info = *host.page_info(phys).ok_or(Error::Inval)?;
        let (pte, _) = host.get_leaf(phys)?;
        let state = info.host_state();
        let consistent = match pte {
            Pte::Invalid { .. } if !pte.is_empty() => {
                !pte.owner_id().is_host()
                    && info.owner() == pte.owner_id()
                    && (state.is_nopage() || state.contains(PageStateFlag::ModuleOwned))
            }
            _ => info.owner().is_host() && !state.is_nopage(),
        };
        if !consistent {
            return Err(Error::Fault);
        }
        Ok(())
    }

    /// Shares a host page with the hypervisor.
    pub fn host_share_hyp(&self, pfn: u64) -> Result<()> {
        let addr = pfn_to_addr(pfn)?;
        let mut host = self.host.lock();
        let mut hyp = self.hyp.lock();
        let prot = if host.mem_map().is_memory(addr) {
            page_hyp()
        } else {
            page_hyp_device()
        };
        let host_ok = host.check_range(addr, PAGE_SIZE, PageState::owned())?;
        let hyp_ok = hyp.check_range(addr, PAGE_SIZE, PageState::nopage())?;
        hyp.reserve(addr, PAGE_SIZE)?;
        host.reserve(addr, PAGE_SIZE)?;
        hyp.map(hyp_ok, prot, PageState::shared_borrowed())
            .or_halt("hyp map of shared page");
        host.set_state(host_ok, PageState::shared_owned())
            .or_halt("host update of shared page");
        Ok(())
    }

    /// Takes back a page shared with the hypervisor. Fails with `EBUSY` while the hypervisor
    /// holds a pin on it.
    pub fn host_unshare_hyp(&self, pfn: u64) -> Result<()> {
        let addr = pfn_to_addr(pfn)?;
        let mut host = self.host.lock();
        let mut hyp = self.hyp.lock();
        let host_ok = host.check_range(addr, PAGE_SIZE, PageState::shared_owned())?;
        let hyp_ok = hyp.check_range(addr, PAGE_SIZE, PageState::shared_borrowed())?;
        hyp.reserve(addr, PAGE_SIZE)?;
        host.reserve(addr, PAGE_SIZE)?;
        hyp.unmap(hyp_ok).or_halt("hyp unmap of shared page");
        host.set_state(host_ok, PageState::owned())
            .or_halt("host update of unshared page");
        Ok(())
    }

    /// Donates `nr` RAM pages from `pfn` to the hypervisor.
    pub fn host_donate_hyp(&self, pfn: u64, nr: u64) -> Result<()> {
        self.host_donate_hyp_prot(pfn, nr, page_hyp(), false)
    }

    /// Donates `nr` pages from `pfn` to the hypervisor, which maps them with `prot`. MMIO is
    /// refused with `EPERM` unless `accept_mmio` is set.
    pub fn host_donate_hyp_prot(
        &self,
        pfn: u64,
        nr: u64,
        prot: ProtSet,
        accept_mmio: bool,
    ) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr)?;
        let mut host = self.host.lock();
        let mut hyp = self.hyp.lock();
        if !accept_mmio && !host.mem_map().range_is_memory(addr, addr + size) {
            return Err(Error::Perm);
        }
        donate_host_to_hyp_locked(&mut host, &mut hyp, addr, size, prot)
    }

    /// Gives `nr` hypervisor pages from `pfn` back to the host.
    pub fn hyp_donate_host(&self, pfn: u64, nr: u64) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr)?;
        let mut host = self.host.lock();
        let mut hyp = self.hyp.lock();
        donate_hyp_to_host_locked(&mut host, &mut hyp, addr, size)
    }

    /// Marks `nr` host pages as shared with the secure firmware.
    pub fn host_share_ffa(&self, pfn: u64, nr: u64) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr)?;
        let mut host = self.host.lock();
        let host_ok = host.check_range(addr, size, PageState::owned())?;
        host.reserve(addr, size)?;
        host.set_state(host_ok, PageState::shared_owned())
            .or_halt("host update of firmware-shared pages");
        Ok(())
    }

    pub fn host_unshare_ffa(&self, pfn: u64, nr: u64) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr)?;
        let mut host = self.host.lock();
        let host_ok = host.check_range(addr, size, PageState::shared_owned())?;
        host.reserve(addr, size)?;
        host.set_state(host_ok, PageState::owned())
            .or_halt("host update of firmware-unshared pages");
        Ok(())
    }

    /// Pins host-owned pages the host is about to use for DMA, so they can't be donated away in
    /// the meantime.
    pub fn host_use_dma(&self, phys: u64, size: u64) -> Result<()> {
        if !is_page_range(phys, size) {
            return Err(Error::Inval);
        }
        let mut host = self.host.lock();
        let host_ok = host.check_range_pinned_ok(phys, size, PageState::owned())?;
        host.pin(host_ok)
    }

    /// Drops the pins taken by `host_use_dma()`. Does nothing for MMIO.
    pub fn host_unuse_dma(&self, phys: u64, size: u64) -> Result<()> {
        if !is_page_range(phys, size) {
            return Err(Error::Inval);
        }
        let mut host = self.host.lock();
        if !host.mem_map().range_is_memory(phys, phys + size) {
            return Ok(());
        }
        host.unpin(phys, size)
    }

    /// Pins pages the host shared with the hypervisor while the hypervisor uses them.
    pub fn hyp_pin_shared_mem(&self, addr: u64, size: u64) -> Result<()> {
        let mut host = self.host.lock();
        let hyp = self.hyp.lock();
        let host_ok = host.check_range_pinned_ok(addr, size, PageState::shared_owned())?;
        // Only needed as a check.
        let _hyp_ok = hyp.check_range(addr, size, PageState::shared_borrowed())?;
        host.pin(host_ok)
    }

    pub fn hyp_unpin_shared_mem(&self, addr: u64, size: u64) -> Result<()> {
        if !is_page_range(addr, size) {
            return Err(Error::Inval);
        }
        self.host.lock().unpin(addr, size)
    }

    /// Finalizes protection on `cpu`. Once any CPU has finalized, modules can no longer register
    /// pages.
    pub fn prot_finalize(&self, cpu: usize) -> Result<()> {
        self.cpus.finalize(cpu)?;
        if self.module_registration_open.swap(false, Ordering::AcqRel) {
            info!("stage-2 protection finalized; module registration closed");
        }
        Ok(())
    }

    /// Returns true once protection has been finalized on any CPU.
    pub fn is_finalized(&self) -> bool {
        self.cpus.any_finalized()
    }
}
