// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use log::info;
use pkvm_pages::{PageSize, PhysPageAddr, PAGE_SIZE};
use sync::RwLock;

use crate::error::{Error, OrHalt, Result};
use crate::guest_vm::{HypVm, Vcpu, VmParams};
use crate::mem_protect::{donate_hyp_to_host_locked, pfn_range, pfn_to_addr, MemProtect};

/// VM handles are table indices offset by this so that zero never names a VM.
pub(crate) const HANDLE_OFFSET: u64 = 0x1000;

/// The table of guests known to the hypervisor.
pub(crate) struct VmTable {
    slots: RwLock<Vec<Option<Arc<HypVm>>>>,
}

impl VmTable {
    pub fn new(max_vms: usize) -> Self {
        Self {
            slots: RwLock::new((0..max_vms).map(|_| None).collect()),
        }
    }

    fn index(handle: u64) -> Option<usize> {
        handle
            .checked_sub(HANDLE_OFFSET)
            .and_then(|i| usize::try_from(i).ok())
    }

    /// Returns the VM named by `handle`.
    pub fn get(&self, handle: u64) -> Option<Arc<HypVm>> {
        let slots = self.slots.read();
        slots.get(Self::index(handle)?)?.clone()
    }

    /// Creates a VM in the first free slot with `create(index, handle)`.
    fn insert<F>(&self, create: F) -> Result<Arc<HypVm>>
    where
        F: FnOnce(usize, u64) -> Result<HypVm>,
    {
        let mut slots = self.slots.write();
        let index = slots.iter().position(Option::is_none).ok_or(Error::NoMem)?;
        let vm = Arc::new(create(index, index as u64 + HANDLE_OFFSET)?);
        slots[index] = Some(vm.clone());
        Ok(vm)
    }

    /// Takes a reference to a live VM, or fails with `ENOENT` if it is unknown or dying.
    fn get_live(&self, handle: u64) -> Result<Arc<HypVm>> {
        let slots = self.slots.read();
        let vm = Self::index(handle)
            .and_then(|i| slots.get(i))
            .and_then(Option::as_ref)
            .ok_or(Error::NoEnt)?;
        if vm.is_dying() {
            return Err(Error::NoEnt);
        }
        // Taken under the table lock so that teardown can't start in between.
        vm.get();
        Ok(vm.clone())
    }

    /// Marks a VM as dying, provided nobody holds a reference to it.
    fn start_teardown(&self, handle: u64) -> Result<()> {
        let slots = self.slots.write();
        let vm = Self::index(handle)
            .and_then(|i| slots.get(i))
            .and_then(Option::as_ref)
            .ok_or(Error::NoEnt)?;
        if vm.refcount() > 0 {
            return Err(Error::Busy);
        }
        vm.set_dying()
    }

    /// Removes a dying VM from the table.
    fn remove_dying(&self, handle: u64) -> Result<Arc<HypVm>> {
        let mut slots = self.slots.write();
        let slot = Self::index(handle)
            .and_then(|i| slots.get_mut(i))
            .ok_or(Error::NoEnt)?;
        let vm = slot.as_ref().ok_or(Error::NoEnt)?;
        if !vm.is_dying() {
            return Err(Error::Busy);
        }
        slot.take().ok_or(Error::NoEnt)
    }
}

/// A vCPU loaded on a physical CPU. Dropping it unloads the vCPU and releases the reference on
/// its VM.
pub struct LoadedVcpu<'a> {
    mp: &'a MemProtect,
    cpu: usize,
    vcpu: Vcpu,
}

impl<'a> LoadedVcpu<'a> {
    /// Returns the physical CPU the vCPU is loaded on.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn mem_protect(&self) -> &'a MemProtect {
        self.mp
    }
}

impl Deref for LoadedVcpu<'_> {
    type Target = Vcpu;

    fn deref(&self) -> &Vcpu {
        &self.vcpu
    }
}

impl Drop for LoadedVcpu<'_> {
    fn drop(&mut self) {
        self.mp.vcpu_put(self.cpu);
    }
}

impl MemProtect {
    /// Creates a VM, taking ownership of the page the host provided for its stage-2 root.
    /// Returns the new VM's handle.
    pub fn init_vm(&self, params: VmParams) -> Result<u64> {
        if params.nr_vcpus == 0 {
            return Err(Error::Inval);
        }
        if let Some(ipa) = params.firmware_load_ipa {
            if !PageSize::Size4k.is_aligned(ipa) {
                return Err(Error::Inval);
            }
        }
        let pgd = PhysPageAddr::phys(pfn_to_addr(params.pgd_pfn)?).ok_or(Error::Inval)?;
        self.host_donate_hyp(params.pgd_pfn, 1)?;
        let created = self.vms.insert(|index, handle| {
            let owner = self.config.owner_for_slot(index).ok_or(Error::NoMem)?;
            HypVm::new(handle, owner, params, self.config.guest_ia_bits, pgd)
        });
        match created {
            Ok(vm) => {
                info!(
                    "created VM {:#x} ({}) with {} vcpus{}",
                    vm.handle(),
                    vm.owner_id(),
                    vm.nr_vcpus(),
                    if vm.is_protected() { ", protected" } else { "" }
                );
                Ok(vm.handle())
            }
            Err(e) => {
                self.hyp_donate_host(params.pgd_pfn, 1)
                    .or_halt("return of unused VM pgd");
                Err(e)
            }
        }
    }

    /// Loads vCPU `vcpu_idx` of VM `handle` on physical CPU `cpu`, holding a reference on the VM
    /// until the returned guard is dropped.
    pub fn load_vcpu(&self, handle: u64, vcpu_idx: usize, cpu: usize) -> Result<LoadedVcpu<'_>> {
        let slot = self.cpus.loaded_slot(cpu).ok_or(Error::Inval)?;
        let mut loaded = slot.lock();
        if loaded.is_some() {
            return Err(Error::Busy);
        }
        let vm = self.vms.get_live(handle)?;
        if let Err(e) = vm.claim_vcpu(vcpu_idx) {
            vm.put();
            return Err(e);
        }
        let vcpu = Vcpu::new(vm, vcpu_idx);
        *loaded = Some(vcpu.clone());
        Ok(LoadedVcpu {
            mp: self,
            cpu,
            vcpu,
        })
    }

    fn vcpu_put(&self, cpu: usize) {
        let Some(slot) = self.cpus.loaded_slot(cpu) else {
            return;
        };
        if let Some(vcpu) = slot.lock().take() {
            vcpu.vm().release_vcpu(vcpu.idx());
            vcpu.vm().put();
        }
    }

    /// Returns the vCPU loaded on `cpu`, if any.
    pub fn loaded_vcpu(&self, cpu: usize) -> Option<Vcpu> {
        self.cpus.loaded_vcpu(cpu)
    }

    /// Takes `nr` host pages from `pfn` to back future stage-2 nodes of `vcpu`'s VM.
    pub fn topup_vcpu_memcache(&self, vcpu: &Vcpu, pfn: u64, nr: u64) -> Result<()> {
        let (addr, _) = pfn_range(pfn, nr)?;
        let first = PhysPageAddr::phys(addr).ok_or(Error::Inval)?;
        self.host_donate_hyp(pfn, nr)?;
        let pages = first.iter_from().take(nr as usize);
        if let Err(e) = vcpu.vm().with_mmu(|mmu| mmu.topup(vcpu.idx(), pages)) {
            self.hyp_donate_host(pfn, nr)
                .or_halt("return of unused memcache pages");
            return Err(e);
        }
        Ok(())
    }

    /// Marks VM `handle` as dying. No vCPU may be loaded while this happens, and none can be
    /// loaded afterwards.
    pub fn start_teardown_vm(&self, handle: u64) -> Result<()> {
        self.vms.start_teardown(handle)?;
        info!("VM {:#x} is dying", handle);
        Ok(())
    }

    /// Reclaims a single page of a dying VM ahead of `finalize_teardown_vm()`.
    pub fn reclaim_dying_guest_page(&self, handle: u64, pfn: u64, gfn: u64) -> Result<()> {
        let vm = self.vms.get(handle).ok_or(Error::NoEnt)?;
        if !vm.is_dying() {
            return Err(Error::Inval);
        }
        self.host_reclaim_page(&vm, pfn, gfn)
    }

    /// Destroys a dying VM: every page still mapped in its stage-2 goes back to the host, as does
    /// every page that backed the table itself.
    pub fn finalize_teardown_vm(&self, handle: u64) -> Result<()> {
        let vm = self.vms.remove_dying(handle)?;
        let mut host = self.host.lock();
        let mut hyp = self.hyp.lock();
        let mmu = vm.mmu.lock().take().ok_or(Error::NoEnt)?;
        let leaves = mmu.leaves().or_halt("walk of dying guest stage-2");
        for leaf in &leaves {
            let (Some(phys), Some(state)) = (
                leaf.pte.output_addr(leaf.addr, leaf.level),
                leaf.pte.state(),
            ) else {
                continue;
            };
            self.reclaim_guest_page_locked(&mut host, phys, state);
        }
        let pages = mmu.into_pages();
        for page in &pages {
            donate_hyp_to_host_locked(&mut host, &mut hyp, page.bits(), PAGE_SIZE)
                .or_halt("return of guest stage-2 page");
        }
        info!(
            "VM {:#x} torn down: {} pages reclaimed, {} table pages returned",
            handle,
            leaves.len(),
            pages.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use pkvm_pages::OwnerId;

    #[test]
    fn create_and_lookup() {
        let mp = stub_mem_protect();
        let mut params = stub_vm_params(VM_PAGES_PFN, true);
        params.nr_vcpus = 0;
        assert_eq!(mp.init_vm(params), Err(Error::Inval));

        let handle = mp.init_vm(stub_vm_params(VM_PAGES_PFN, true)).unwrap();
        assert_eq!(handle, HANDLE_OFFSET);
        let pgd = VM_PAGES_PFN << 12;
        assert_eq!(mp.host_page_info(pgd).unwrap().owner(), OwnerId::HYP);
        let vm = mp.vms.get(handle).unwrap();
        assert_eq!(vm.owner_id(), OwnerId::guest(0).unwrap());
        assert!(mp.vms.get(handle + 1).is_none());
        assert!(mp.vms.get(0).is_none());

        // The pgd can't be used twice.
        assert_eq!(
            mp.init_vm(stub_vm_params(VM_PAGES_PFN, true)),
            Err(Error::Perm)
        );
    }

    #[test]
    fn full_table_returns_pgd() {
        let mp = stub_mem_protect_with(|c| c.max_vms = 1);
        mp.init_vm(stub_vm_params(VM_PAGES_PFN, false)).unwrap();
        assert_eq!(
            mp.init_vm(stub_vm_params(VM_PAGES_PFN + 1, false)),
            Err(Error::NoMem)
        );
        let info = mp.host_page_info((VM_PAGES_PFN + 1) << 12).unwrap();
        assert!(info.owner().is_host());
        assert!(info.host_state().is_owned());
    }

    #[test]
    fn load_and_put() {
        let mp = stub_mem_protect();
        let handle = mp.init_vm(stub_vm_params(VM_PAGES_PFN, true)).unwrap();
        assert_eq!(mp.load_vcpu(handle, 0, 99).err(), Some(Error::Inval));
        assert_eq!(mp.load_vcpu(handle + 1, 0, 0).err(), Some(Error::NoEnt));
        assert_eq!(mp.load_vcpu(handle, 2, 0).err(), Some(Error::Inval));
        {
            let vcpu = mp.load_vcpu(handle, 0, 0).unwrap();
            assert_eq!(vcpu.idx(), 0);
            assert_eq!(mp.loaded_vcpu(0).map(|v| v.idx()), Some(0));
            // Busy CPU, then busy vCPU.
            assert_eq!(mp.load_vcpu(handle, 1, 0).err(), Some(Error::Busy));
            assert_eq!(mp.load_vcpu(handle, 0, 1).err(), Some(Error::Busy));
            assert_eq!(mp.start_teardown_vm(handle), Err(Error::Busy));
        }
        assert!(mp.loaded_vcpu(0).is_none());
        assert_eq!(mp.vms.get(handle).unwrap().refcount(), 0);
        let vcpu = mp.load_vcpu(handle, 0, 1).unwrap();
        assert_eq!(vcpu.cpu(), 1);
    }

    #[test]
    fn teardown_sequence() {
        let mp = stub_mem_protect();
        let handle = mp.init_vm(stub_vm_params(VM_PAGES_PFN, true)).unwrap();
        {
            let vcpu = mp.load_vcpu(handle, 0, 0).unwrap();
            mp.topup_vcpu_memcache(&vcpu, VM_PAGES_PFN + 1, 4).unwrap();
        }
        assert_eq!(mp.finalize_teardown_vm(handle), Err(Error::Busy));
        assert_eq!(mp.reclaim_dying_guest_page(handle, 0, 0), Err(Error::Inval));
        assert_eq!(mp.start_teardown_vm(handle), Ok(()));
        assert_eq!(mp.start_teardown_vm(handle), Err(Error::Inval));
        assert_eq!(mp.load_vcpu(handle, 0, 0).err(), Some(Error::NoEnt));
        assert_eq!(mp.finalize_teardown_vm(handle), Ok(()));
        assert_eq!(mp.finalize_teardown_vm(handle), Err(Error::NoEnt));
        assert_eq!(mp.start_teardown_vm(handle), Err(Error::NoEnt));
        for pfn in VM_PAGES_PFN..VM_PAGES_PFN + 5 {
            let info = mp.host_page_info(pfn << 12).unwrap();
            assert!(info.owner().is_host());
            assert_eq!(mp.verify_host_page(pfn << 12), Ok(()));
        }
        // The slot is free again.
        assert_eq!(
            mp.init_vm(stub_vm_params(VM_PAGES_PFN, true)),
            Ok(HANDLE_OFFSET)
        );
    }
}
