// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::Ordering;
use log::debug;
use pkvm_page_tables::{prot_from_bits, prot_rwx, ProtSet};
use pkvm_pages::{OwnerId, PageState, PageStateFlag};

use crate::error::{Error, Result};
use crate::host_mmu::{pages_in, HostMmu};
use crate::mem_protect::{pfn_range, MemProtect};

/// Returns the host state of a page a module restricted.
fn module_owned() -> PageState {
    PageState::owned().with(PageStateFlag::ModuleOwned)
}

/// Checks that every RAM page in the range is either already under module control or is the
/// host's and untouched.
fn check_module_range(host: &HostMmu, addr: u64, size: u64) -> Result<()> {
    let mut module = None;
    for page in pages_in(addr, size) {
        let info = host.page_info(page.bits()).ok_or(Error::Perm)?;
        let state = info.host_state();
        let is_module = state.contains(PageStateFlag::ModuleOwned);
        let pristine = info.owner().is_host() && state.is_owned() && info.refcount() == 0;
        if !is_module && !pristine {
            return Err(Error::Perm);
        }
        // No mixing of the two within one call.
        if *module.get_or_insert(is_module) != is_module {
            return Err(Error::Perm);
        }
    }
    Ok(())
}

impl MemProtect {
    /// Donates `nr` pages from `pfn` to the hypervisor on behalf of a loadable module, mapped
    /// with the module's `prot_bits`. Only possible until protection is finalized.
    pub fn register_module_pages(&self, pfn: u64, nr: u64, prot_bits: u16) -> Result<()> {
        if !self.module_registration_open.load(Ordering::Acquire) {
            return Err(Error::Perm);
        }
        let prot = prot_from_bits(prot_bits).ok_or(Error::Inval)?;
        self.host_donate_hyp_prot(pfn, nr, prot, true)
    }

    /// Changes the host's own access to `nr` pages from `pfn` to `prot_bits`. An empty prot
    /// takes the pages away from the host entirely; RWX gives them back.
    pub fn module_change_host_page_prot(&self, pfn: u64, prot_bits: u16, nr: u64) -> Result<()> {
        let prot: ProtSet = prot_from_bits(prot_bits).ok_or(Error::Inval)?;
        let (addr, size) = pfn_range(pfn, nr)?;
        let end = addr + size;
        let mut host = self.host.lock();
        let (reg, range) = host.mem_map().find(addr);
        if !range.contains(end - 1) {
            return Err(Error::Perm);
        }
        let is_memory = reg.is_some();
        if is_memory {
            check_module_range(&host, addr, size)?;
        }

        let owner = if prot.is_empty() {
            host.set_owner_locked(addr, size, OwnerId::PROTECTED)?;
            OwnerId::PROTECTED
        } else {
            host.idmap_locked(addr, size, prot)?;
            OwnerId::HOST
        };
        let state = if prot == prot_rwx() {
            PageState::owned()
        } else {
            module_owned()
        };
        host.update_pages(addr, size, |info| {
            info.set_owner(owner);
            info.set_host_state(state);
        });
        debug!(
            "module set host prot {:#x} on {:#x}-{:#x}",
            prot.bits(),
            addr,
            end
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use pkvm_page_tables::{default_host_prot, Prot, Pte};
    use pkvm_pages::PAGE_SIZE;

    const PFN: u64 = HOST_PAGES_PFN;
    const ADDR: u64 = PFN << 12;

    #[test]
    fn register_until_finalized() {
        let mp = stub_mem_protect();
        assert_eq!(mp.register_module_pages(PFN, 2, 0x80), Err(Error::Inval));
        let rx = (Prot::R | Prot::X).bits();
        assert_eq!(mp.register_module_pages(PFN, 2, rx), Ok(()));
        let (pte, _) = mp.hyp.lock().get_leaf(ADDR).unwrap();
        assert_eq!(pte.prot(), Some(Prot::R | Prot::X));
        assert_eq!(mp.host_page_info(ADDR).unwrap().owner(), OwnerId::HYP);

        let device = (Prot::R | Prot::W | Prot::Device).bits();
        assert_eq!(mp.register_module_pages(MMIO_BASE >> 12, 1, device), Ok(()));

        mp.prot_finalize(0).unwrap();
        assert_eq!(mp.register_module_pages(PFN + 2, 1, rx), Err(Error::Perm));
        assert_eq!(mp.verify_host_page(ADDR), Ok(()));
        // Not mapped the way plain hyp memory is, so it can't be handed back as such.
        assert_eq!(mp.hyp_donate_host(PFN, 2), Err(Error::Perm));
    }

    #[test]
    fn restrict_and_restore() {
        let mp = stub_mem_protect();
        let ro = ProtSet::from(Prot::R).bits();
        assert_eq!(mp.module_change_host_page_prot(PFN, 0x100, 1), Err(Error::Inval));
        assert_eq!(mp.module_change_host_page_prot(PFN, ro, 2), Ok(()));
        let (pte, _) = mp.host_stage2_get_leaf(ADDR).unwrap();
        assert_eq!(pte.prot(), Some(Prot::R.into()));
        let info = mp.host_page_info(ADDR).unwrap();
        assert!(info.host_state().contains(PageStateFlag::ModuleOwned));
        assert!(info.owner().is_host());
        assert_eq!(mp.verify_host_page(ADDR), Ok(()));
        // Module pages can't be handed on by the host.
        assert_eq!(mp.host_donate_hyp(PFN, 1), Err(Error::Perm));
        // A mix of module and plain pages is refused.
        assert_eq!(mp.module_change_host_page_prot(PFN + 1, ro, 2), Err(Error::Perm));

        // Take the pages away from the host altogether.
        assert_eq!(mp.module_change_host_page_prot(PFN, 0, 2), Ok(()));
        assert_eq!(
            mp.host_stage2_get_leaf(ADDR).unwrap().0,
            Pte::owned_by(OwnerId::PROTECTED)
        );
        let info = mp.host_page_info(ADDR).unwrap();
        assert_eq!(info.owner(), OwnerId::PROTECTED);
        assert!(info.host_state().contains(PageStateFlag::ModuleOwned));
        assert_eq!(mp.verify_host_page(ADDR), Ok(()));

        assert_eq!(mp.module_change_host_page_prot(PFN, 0x7, 2), Ok(()));
        let (pte, _) = mp.host_stage2_get_leaf(ADDR).unwrap();
        assert_eq!(pte.prot(), Some(default_host_prot(true)));
        let info = mp.host_page_info(ADDR).unwrap();
        assert!(info.owner().is_host());
        assert_eq!(info.host_state(), PageState::owned());
        assert_eq!(mp.host_donate_hyp(PFN, 1), Ok(()));
    }

    #[test]
    fn busy_or_foreign_pages_refused() {
        let mp = stub_mem_protect();
        mp.host_use_dma(ADDR, PAGE_SIZE).unwrap();
        assert_eq!(mp.module_change_host_page_prot(PFN, 0, 1), Err(Error::Perm));
        mp.host_share_hyp(PFN + 1).unwrap();
        assert_eq!(mp.module_change_host_page_prot(PFN + 1, 0, 1), Err(Error::Perm));
        // Runs off the end of the carve-out.
        let carveout = mp.carveout();
        assert_eq!(
            mp.module_change_host_page_prot((carveout.end >> 12) - 1, 0, 2),
            Err(Error::Perm)
        );
    }
}
