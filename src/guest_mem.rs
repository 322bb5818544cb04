// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use flagset::FlagSet;
use pkvm_page_tables::{prot_rwx, Level, ProtSet, Pte};
use pkvm_pages::{OwnerId, PageState, PageStateFlag, PageSize, PAGE_SIZE};

use crate::coalesce::Request;
use crate::error::{halt, Error, OrHalt, Result};
use crate::guest_vm::{guest_state, GuestMmu, HypVm, Vcpu};
use crate::host_mmu::HostMmu;
use crate::mem_protect::{pfn_to_addr, MemProtect};

/// Finds the page-sized leaf at `ipa` of a page the host shared with the guest and returns its
/// physical address.
fn host_shared_leaf(guest: &GuestMmu, ipa: u64) -> Result<u64> {
    let (pte, level) = guest.get_leaf(ipa)?;
    if !pte.is_valid() {
        return Err(Error::NoEnt);
    }
    if level.granule() != PAGE_SIZE {
        return Err(Error::TooBig);
    }
    match pte.state() {
        Some(state) if state.sharing() == PageState::shared_borrowed() => (),
        _ => return Err(Error::Perm),
    }
    pte.output_addr(ipa, level).ok_or(Error::NoEnt)
}

fn locked_mmu(guard: &mut Option<GuestMmu>) -> Result<&mut GuestMmu> {
    guard.as_mut().ok_or(Error::NoEnt)
}

impl MemProtect {
    fn run_request(&self, desired: PageState) -> Request {
        Request {
            desired,
            ignore: FlagSet::default(),
            max_ptes: self.config.max_coalesce_ptes,
        }
    }

    /// Shares up to `nr_pages` guest-owned pages from `ipa` with the host. Returns the number of
    /// pages shared; the guest retries from there for the rest.
    pub fn guest_share_host(&self, vcpu: &Vcpu, ipa: u64, nr_pages: u64) -> Result<u64> {
        if !PageSize::Size4k.is_aligned(ipa) {
            return Err(Error::Inval);
        }
        let mut host = self.host.lock();
        let mut guard = vcpu.vm().mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let req = self.run_request(PageState::owned());
        let (run, guest_ok) = guest.request_transition(ipa, nr_pages, &req)?;
        let phys = run.phys().ok_or(Error::Inval)?;
        if run.ipa != ipa {
            return Err(Error::Inval);
        }
        let size = run.nr_pages * PAGE_SIZE;
        if !host.mem_map().range_is_allowed_memory(phys, phys + size) {
            return Err(Error::Inval);
        }
        let host_ok = host.check_range(phys, size, PageState::nopage())?;
        host.reserve(phys, size)?;
        guest
            .set_state(guest_ok, PageState::shared_owned())
            .or_halt("guest update of shared pages");
        host.set_state(host_ok, PageState::shared_borrowed())
            .or_halt("host map of guest-shared pages");
        self.protected_pages_sub(run.nr_pages);
        Ok(run.nr_pages)
    }

    /// Takes back up to `nr_pages` pages from `ipa` the guest shared with the host. Returns the
    /// number of pages unshared.
    pub fn guest_unshare_host(&self, vcpu: &Vcpu, ipa: u64, nr_pages: u64) -> Result<u64> {
        if !PageSize::Size4k.is_aligned(ipa) {
            return Err(Error::Inval);
        }
        let vm = vcpu.vm();
        let mut host = self.host.lock();
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let req = self.run_request(PageState::shared_owned());
        let (run, guest_ok) = guest.request_transition(ipa, nr_pages, &req)?;
        let phys = run.phys().ok_or(Error::Inval)?;
        if run.ipa != ipa {
            return Err(Error::Inval);
        }
        let size = run.nr_pages * PAGE_SIZE;
        let host_ok = host.check_range(phys, size, PageState::shared_borrowed())?;
        host.reserve(phys, size)?;
        guest
            .set_state(guest_ok, PageState::owned())
            .or_halt("guest update of unshared pages");
        host.set_owner(host_ok, vm.owner_id())
            .or_halt("host unmap of guest-unshared pages");
        self.protected_pages_add(run.nr_pages);
        Ok(run.nr_pages)
    }

    /// Copies the firmware image page matching `ipa` into `phys` if `ipa` falls in the VM's
    /// firmware window.
    fn stage_firmware(&self, vm: &HypVm, phys: u64, ipa: u64) -> Result<()> {
        let Some(base) = vm.firmware_load_ipa() else {
            return Ok(());
        };
        let window = self.config.firmware.map_or(PAGE_SIZE, |fw| fw.size());
        let Some(offset) = ipa.checked_sub(base).filter(|o| *o < window) else {
            return Ok(());
        };
        let fw = self.config.firmware.ok_or(Error::Inval)?;
        self.phys.copy_page(phys, fw.start + offset);
        Ok(())
    }

    /// Donates the host page at `pfn` to `vcpu`'s guest, mapped at `gfn`.
    pub fn host_donate_guest(&self, pfn: u64, gfn: u64, vcpu: &Vcpu) -> Result<()> {
        let phys = pfn_to_addr(pfn)?;
        let ipa = pfn_to_addr(gfn)?;
        let vm = vcpu.vm();
        let mut host = self.host.lock();
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let host_ok = host.check_range(phys, PAGE_SIZE, PageState::owned())?;
        if !host.mem_map().is_memory(phys) {
            return Err(Error::Perm);
        }
        let guest_ok = guest.check_range(ipa, PAGE_SIZE, PageState::nopage())?;
        guest.reserve(vcpu.idx(), ipa, PAGE_SIZE)?;
        host.reserve(phys, PAGE_SIZE)?;
        self.protected_pages_add(1);
        if let Err(e) = self.stage_firmware(vm, phys, ipa) {
            self.protected_pages_sub(1);
            return Err(e);
        }
        host.set_owner(host_ok, vm.owner_id())
            .or_halt("host annotation of donated page");
        guest
            .map(guest_ok, phys, prot_rwx(), PageState::owned(), vcpu.idx())
            .or_halt("guest map of donated page");
        Ok(())
    }

    /// Shares the host page at `pfn` with `vcpu`'s guest, mapped at `gfn` with `prot`.
    pub fn host_share_guest(&self, pfn: u64, gfn: u64, vcpu: &Vcpu, prot: ProtSet) -> Result<()> {
        if prot & prot_rwx() != prot {
            return Err(Error::Inval);
        }
        let phys = pfn_to_addr(pfn)?;
        let ipa = pfn_to_addr(gfn)?;
        let mut host = self.host.lock();
        let mut guard = vcpu.vm().mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let host_ok = host.check_range(phys, PAGE_SIZE, PageState::owned())?;
        if !host.mem_map().is_memory(phys) {
            return Err(Error::Perm);
        }
        let guest_ok = guest.check_range(ipa, PAGE_SIZE, PageState::nopage())?;
        guest.reserve(vcpu.idx(), ipa, PAGE_SIZE)?;
        host.reserve(phys, PAGE_SIZE)?;
        guest
            .map(guest_ok, phys, prot, PageState::shared_borrowed(), vcpu.idx())
            .or_halt("guest map of shared page");
        host.set_state(host_ok, PageState::shared_owned())
            .or_halt("host update of shared page");
        Ok(())
    }

    /// Takes back the page the host shared with `vm` at `gfn`.
    pub fn host_unshare_guest(&self, vm: &HypVm, gfn: u64) -> Result<()> {
        let ipa = pfn_to_addr(gfn)?;
        let mut host = self.host.lock();
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let phys = host_shared_leaf(guest, ipa)?;
        let host_ok = host.check_range(phys, PAGE_SIZE, PageState::shared_owned())?;
        host.reserve(phys, PAGE_SIZE)?;
        let guest_ok = guest.page_at(ipa);
        guest.unmap(guest_ok).or_halt("guest unmap of unshared page");
        host.set_state(host_ok, PageState::owned())
            .or_halt("host update of unshared page");
        Ok(())
    }

    /// Adds the `prot` permissions to the guest mapping of a page the host shared at `gfn`.
    pub fn host_relax_guest_perms(&self, gfn: u64, prot: ProtSet, vcpu: &Vcpu) -> Result<()> {
        if prot & prot_rwx() != prot {
            return Err(Error::Perm);
        }
        let ipa = pfn_to_addr(gfn)?;
        let host = self.host.lock();
        let mut guard = vcpu.vm().mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let phys = host_shared_leaf(guest, ipa)?;
        // Only needed as a check.
        let _host_ok = host.check_range_pinned_ok(phys, PAGE_SIZE, PageState::shared_owned())?;
        let guest_ok = guest.page_at(ipa);
        guest
            .relax_perms(guest_ok, prot)
            .or_halt("guest relax of shared page");
        Ok(())
    }

    /// Removes write access from the guest mapping of a page the host shared at `gfn`.
    pub fn host_wrprotect_guest(&self, vm: &HypVm, gfn: u64) -> Result<()> {
        let ipa = pfn_to_addr(gfn)?;
        let host = self.host.lock();
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let phys = host_shared_leaf(guest, ipa)?;
        let _host_ok = host.check_range_pinned_ok(phys, PAGE_SIZE, PageState::shared_owned())?;
        let guest_ok = guest.page_at(ipa);
        guest
            .wrprotect(guest_ok)
            .or_halt("guest wrprotect of shared page");
        Ok(())
    }

    /// Returns the guest page at `ipa` to the host. Protected guests give back pages they own,
    /// which are zeroed first; other guests give back pages the host shared with them.
    ///
    /// Returns the physical address of the page, or 0 if nothing was mapped.
    pub fn guest_relinquish_to_host(&self, vcpu: &Vcpu, ipa: u64) -> Result<u64> {
        if !PageSize::Size4k.is_aligned(ipa) {
            return Err(Error::Inval);
        }
        let vm = vcpu.vm();
        let mut host = self.host.lock();
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let (pte, level) = guest.get_leaf(ipa)?;
        if !pte.is_valid() {
            return Ok(0);
        }
        let (expected, host_expected) = if vm.is_protected() {
            (PageState::owned(), PageState::nopage())
        } else {
            (PageState::shared_borrowed(), PageState::shared_owned())
        };
        // Restricted permissions don't matter here, only who owns the page.
        if guest_state(&pte).sharing() != expected {
            return Err(Error::Perm);
        }
        let phys = pte.output_addr(ipa, level).ok_or(Error::Inval)?;
        let host_ok = host.check_range_pinned_ok(phys, PAGE_SIZE, host_expected)?;
        host.reserve(phys, PAGE_SIZE)?;
        if vm.is_protected() {
            self.phys.poison(phys);
            self.protected_pages_sub(1);
        }
        let guest_ok = guest.page_at(ipa);
        guest.unmap(guest_ok).or_halt("guest unmap of relinquished page");
        host.set_owner(host_ok, OwnerId::HOST)
            .or_halt("host remap of relinquished page");
        Ok(phys)
    }

    /// Returns a page a guest had mapped to the host, zeroing it if the guest owned it. Both the
    /// host lock and the guest's lock must be held.
    pub(crate) fn reclaim_guest_page_locked(
        &self,
        host: &mut HostMmu,
        phys: u64,
        state: PageState,
    ) {
        let state = state.sharing();
        let host_state = if state == PageState::owned() {
            PageState::nopage()
        } else if state == PageState::shared_borrowed() {
            PageState::shared_owned()
        } else if state == PageState::shared_owned() {
            PageState::shared_borrowed()
        } else {
            halt("reclaim of guest page in unexpected state", &state)
        };
        let host_ok = host
            .check_range_pinned_ok(phys, PAGE_SIZE, host_state)
            .or_halt("host state of reclaimed guest page");
        if state == PageState::owned() {
            self.phys.poison(phys);
            self.protected_pages_sub(1);
        }
        host.set_owner(host_ok, OwnerId::HOST)
            .or_halt("host remap of reclaimed guest page");
    }

    /// Reclaims the page at `pfn` that `vm` maps at `ipa`.
    pub fn host_reclaim_page(&self, vm: &HypVm, pfn: u64, gfn: u64) -> Result<()> {
        let phys = pfn_to_addr(pfn)?;
        let ipa = pfn_to_addr(gfn)?;
        let mut host = self.host.lock();
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let (pte, level) = guest.get_leaf(ipa)?;
        if !pte.is_valid() {
            return Err(Error::Inval);
        }
        if pte.output_addr(ipa, level) != Some(phys) {
            return Err(Error::Perm);
        }
        let state = pte.state().ok_or(Error::Inval)?;
        host.reserve(phys, PAGE_SIZE)?;
        self.reclaim_guest_page_locked(&mut host, phys, state);
        let guest_ok = guest.page_at(ipa);
        guest.unmap(guest_ok).or_halt("guest unmap of reclaimed page");
        Ok(())
    }

    /// Marks up to `nr_pages` unmapped pages from `ipa` as MMIO the guest may access. Returns the
    /// number of pages guarded.
    pub fn install_ioguard_page(&self, vcpu: &Vcpu, ipa: u64, nr_pages: u64) -> Result<u64> {
        let vm = vcpu.vm();
        if !vm.has_mmio_guard() || !PageSize::Size4k.is_aligned(ipa) {
            return Err(Error::Inval);
        }
        let mut guard = vm.mmu.lock();
        let guest = locked_mmu(&mut guard)?;
        let req = Request {
            desired: PageState::nopage(),
            ignore: PageStateFlag::Mmio.into(),
            max_ptes: self.config.max_coalesce_ptes,
        };
        let (run, guest_ok) = guest.request_transition(ipa, nr_pages, &req)?;
        guest.reserve(vcpu.idx(), ipa, run.nr_pages * PAGE_SIZE)?;
        guest
            .annotate(guest_ok, Pte::mmio_guard(), vcpu.idx())
            .or_halt("guest annotation of MMIO guard");
        Ok(run.nr_pages)
    }

    /// Returns true if the guest may access `[ipa, ipa + len)` as MMIO: both ends must lie in
    /// guarded pages. Guests without the MMIO guard may access any MMIO.
    pub fn check_ioguard_page(&self, vcpu: &Vcpu, ipa: u64, len: u64) -> bool {
        let vm = vcpu.vm();
        if !vm.has_mmio_guard() {
            return true;
        }
        let Some(last) = len.checked_sub(1).and_then(|l| ipa.checked_add(l)) else {
            return false;
        };
        let guarded = |guest: &GuestMmu, addr: u64| {
            let leaf = guest.get_leaf(addr);
            matches!(leaf, Ok((pte, level)) if pte.is_mmio_note() && level.is_last())
        };
        vm.with_mmu(|guest| Ok(guarded(guest, ipa) && guarded(guest, last)))
            .unwrap_or(false)
    }

    /// Looks up the stage-2 entry of VM `handle` covering `ipa`.
    pub fn guest_stage2_get_leaf(&self, handle: u64, ipa: u64) -> Result<(Pte, Level)> {
        let vm = self.vms.get(handle).ok_or(Error::NoEnt)?;
        vm.with_mmu(|guest| guest.get_leaf(ipa))
    }
}
