// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64};
use log::{debug, info};
use page_tracking::{HwMemMap, HypPageAlloc, PageInfo, PageMap, PagePool};
use pkvm_page_tables::{
    default_host_prot, max_table_pages, page_hyp, HostS2Policy, HypS1Policy, PageTable,
};
use pkvm_pages::{OwnerId, PageState, PAGE_SIZE};
use sync::Mutex;

use crate::config::MemProtectConfig;
use crate::error::{Error, Result};
use crate::handler_slot::HandlerSlots;
use crate::host_mmu::HostMmu;
use crate::hyp_mmu::HypMmu;
use crate::mem_protect::{donate_host_to_hyp_locked, MemProtect};
use crate::per_cpu::PerCpu;
use crate::phys_mem::PhysMem;
use crate::vm_table::VmTable;

/// Input address bits of the hypervisor's own stage-1.
const HYP_VA_BITS: u32 = 48;

// Slack on top of the worst case for page-granular mappings of all of RAM, for blocks being
// split and re-formed.
const POOL_SLACK_PAGES: u64 = 16;

fn pool_pages(configured: u64, ram_pages: u64) -> u64 {
    if configured != 0 {
        configured
    } else {
        max_table_pages(ram_pages) + POOL_SLACK_PAGES
    }
}

impl MemProtect {
    /// Brings up memory protection for the machine described by `mem_map`.
    ///
    /// Reserves the hypervisor carve-out at the top of RAM, builds the page metadata, maps the
    /// carve-out in the hypervisor's stage-1 and identity-maps the host with the carve-out
    /// annotated as hyp-owned. The firmware image, if any, is handed to the hypervisor as well.
    pub fn new(config: MemProtectConfig, mut mem_map: HwMemMap) -> Result<Self> {
        config.validate()?;
        if mem_map.moveable_regions().len() > config.max_moveable_regions {
            return Err(Error::Inval);
        }

        let ram_pages = mem_map.total_ram() / PAGE_SIZE;
        let hyp_pool_pages = pool_pages(config.hyp_pool_pages, ram_pages);
        let host_pool_pages = pool_pages(config.host_pool_pages, ram_pages);
        let metadata_bytes = ram_pages * core::mem::size_of::<PageInfo>() as u64;
        let metadata_pages = (metadata_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        // One more page for the VM table.
        let carveout_pages = hyp_pool_pages + host_pool_pages + metadata_pages + 1;

        let mut alloc = HypPageAlloc::new(&mut mem_map, carveout_pages)?;
        let carveout = alloc.range();
        let mut hyp_pool = PagePool::with_range(alloc.take_pages(hyp_pool_pages)?, hyp_pool_pages);
        let mut host_pool =
            PagePool::with_range(alloc.take_pages(host_pool_pages)?, host_pool_pages);
        debug!(
            "carve-out {:#x}-{:#x}: {} hyp, {} host, {} metadata pages",
            carveout.start,
            carveout.end,
            hyp_pool_pages,
            host_pool_pages,
            metadata_pages + 1
        );

        let pages = PageMap::build_from(&mem_map)?;
        let mem_map = Arc::new(mem_map);

        let hyp_pgt = PageTable::new(HYP_VA_BITS, HypS1Policy, &mut hyp_pool)?;
        let mut hyp = HypMmu::new(hyp_pgt, hyp_pool);
        hyp.map_locked(
            carveout.start,
            carveout.size(),
            page_hyp(),
            PageState::owned(),
        )?;

        let host_pgt = PageTable::new(
            config.host_ia_bits,
            HostS2Policy::new(mem_map.clone()),
            &mut host_pool,
        )?;
        let mut host = HostMmu::new(
            host_pgt,
            host_pool,
            pages,
            mem_map.clone(),
            config.max_owner_id,
        );
        for reg in mem_map.regions().filter(|r| !r.no_map()) {
            host.idmap_locked(reg.base().bits(), reg.size(), default_host_prot(true))?;
        }
        host.set_owner_locked(carveout.start, carveout.size(), OwnerId::HYP)?;

        if let Some(fw) = config.firmware {
            donate_host_to_hyp_locked(&mut host, &mut hyp, fw.start, fw.size(), page_hyp())?;
        }

        info!(
            "memory protection up: {} MiB of RAM, carve-out {:#x}-{:#x}, host ia {} bits",
            mem_map.total_ram() >> 20,
            carveout.start,
            carveout.end,
            config.host_ia_bits
        );
        Ok(Self {
            vms: VmTable::new(config.max_vms),
            cpus: PerCpu::new(config.max_cpus),
            config,
            mem_map,
            host: Mutex::new(host),
            hyp: Mutex::new(hyp),
            phys: PhysMem::new(),
            protected_pages: AtomicU64::new(0),
            module_registration_open: AtomicBool::new(true),
            handlers: HandlerSlots::default(),
            carveout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use page_tracking::{HwMemMapBuilder, MemRange};
    use pkvm_page_tables::Pte;
    use pkvm_pages::RawAddr;

    #[test]
    fn boot_state() {
        let mp = stub_mem_protect();
        let carveout = mp.carveout();
        assert_eq!(carveout.end, RAM_BASE + RAM_SIZE);
        for addr in [carveout.start, carveout.end - PAGE_SIZE] {
            let info = mp.host_page_info(addr).unwrap();
            assert_eq!(info.owner(), OwnerId::HYP);
            assert!(info.host_state().is_nopage());
            assert_eq!(mp.host_stage2_get_leaf(addr).unwrap().0, Pte::owned_by(OwnerId::HYP));
            assert_eq!(mp.verify_host_page(addr), Ok(()));
            let (pte, _) = mp.hyp.lock().get_leaf(addr).unwrap();
            assert_eq!(pte.state(), Some(PageState::owned()));
        }
        // RAM is mapped up front, reserved firmware memory never is.
        let (pte, level) = mp.host_stage2_get_leaf(RAM_BASE).unwrap();
        assert_eq!(pte.prot(), Some(default_host_prot(true)));
        assert!(!level.is_last());
        assert_eq!(mp.verify_host_page(RAM_BASE), Ok(()));
        assert!(mp.host_stage2_get_leaf(FW_RESERVED_BASE).unwrap().0.is_empty());
        assert!(mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.is_empty());
        assert!(!mp.is_finalized());
        assert_eq!(mp.protected_pages(), 0);
    }

    #[test]
    fn firmware_image_goes_to_hyp() {
        let mp = stub_mem_protect_with(|c| c.firmware = Some(FW_IMAGE));
        let info = mp.host_page_info(FW_IMAGE.start).unwrap();
        assert_eq!(info.owner(), OwnerId::HYP);
        assert_eq!(mp.host_page_info(FW_IMAGE.end).unwrap().owner(), OwnerId::HOST);
    }

    #[test]
    fn bad_configs() {
        let config = MemProtectConfig {
            max_moveable_regions: 1,
            ..Default::default()
        };
        let mem_map = HwMemMapBuilder::new(PAGE_SIZE)
            .add_memory_region(RawAddr::phys(RAM_BASE), RAM_SIZE)
            .unwrap()
            .add_memory_region(RawAddr::phys(2 * RAM_BASE), RAM_SIZE)
            .unwrap()
            .build();
        assert_eq!(MemProtect::new(config, mem_map).err(), Some(Error::Inval));

        let config = MemProtectConfig {
            max_vms: 0,
            ..Default::default()
        };
        assert_eq!(
            MemProtect::new(config, stub_mem_map()).err(),
            Some(Error::Inval)
        );

        // No room for the carve-out.
        let config = MemProtectConfig {
            hyp_pool_pages: RAM_SIZE / PAGE_SIZE,
            ..Default::default()
        };
        assert_eq!(
            MemProtect::new(config, stub_mem_map()).err(),
            Some(Error::NoMem)
        );

        // A firmware image inside reserved memory can't be donated.
        let config = MemProtectConfig {
            firmware: Some(MemRange {
                start: FW_RESERVED_BASE,
                end: FW_RESERVED_BASE + PAGE_SIZE,
            }),
            ..Default::default()
        };
        assert_eq!(
            MemProtect::new(config, stub_mem_map()).err(),
            Some(Error::Perm)
        );
    }
}
