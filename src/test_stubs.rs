// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use page_tracking::{HwMemMap, HwMemMapBuilder, HwReservedMemType, MemRange};
use pkvm_pages::{RawAddr, PAGE_SIZE};

use crate::config::MemProtectConfig;
use crate::guest_vm::VmParams;
use crate::mem_protect::MemProtect;
use crate::vm_table::LoadedVcpu;

pub const RAM_BASE: u64 = 0x8000_0000;
pub const RAM_SIZE: u64 = 0x400_0000;
/// A megabyte of RAM the firmware keeps for itself.
pub const FW_RESERVED_BASE: u64 = RAM_BASE + 0x80_0000;
pub const FW_RESERVED_SIZE: u64 = 0x10_0000;
/// Device space well below RAM.
pub const MMIO_BASE: u64 = 0x1000_0000;

/// Pages the tests hand out as VM roots and memcaches.
pub const VM_PAGES_PFN: u64 = (RAM_BASE + 0x100_0000) >> 12;
/// Pages the tests move between the host, the hypervisor and guests.
pub const HOST_PAGES_PFN: u64 = (RAM_BASE + 0x200_0000) >> 12;
pub const MEMCACHE_PAGES: u64 = 16;

/// Where the tests put a guest firmware image.
pub const FW_IMAGE: MemRange = MemRange {
    start: RAM_BASE + 0x300_0000,
    end: RAM_BASE + 0x300_0000 + 2 * PAGE_SIZE,
};

pub fn stub_mem_map() -> HwMemMap {
    HwMemMapBuilder::new(PAGE_SIZE)
        .add_memory_region(RawAddr::phys(RAM_BASE), RAM_SIZE)
        .unwrap()
        .reserve_region(
            HwReservedMemType::FirmwareReserved,
            RawAddr::phys(FW_RESERVED_BASE),
            FW_RESERVED_SIZE,
        )
        .unwrap()
        .build()
}

pub fn stub_mem_protect_with(f: impl FnOnce(&mut MemProtectConfig)) -> MemProtect {
    let mut config = MemProtectConfig::default();
    f(&mut config);
    MemProtect::new(config, stub_mem_map()).unwrap()
}

pub fn stub_mem_protect() -> MemProtect {
    stub_mem_protect_with(|_| {})
}

/// Parameters of a two-vCPU VM whose root is the page at `pgd_pfn`.
pub fn stub_vm_params(pgd_pfn: u64, protected: bool) -> VmParams {
    VmParams {
        nr_vcpus: 2,
        protected,
        mmio_guard: false,
        firmware_load_ipa: None,
        pgd_pfn,
    }
}

/// Creates a VM from `params` and loads its first vCPU on `cpu`, with the memcache filled from
/// the pages following the root.
pub fn stub_guest(mp: &MemProtect, params: VmParams, cpu: usize) -> (u64, LoadedVcpu<'_>) {
    let handle = mp.init_vm(params).unwrap();
    let vcpu = mp.load_vcpu(handle, 0, cpu).unwrap();
    mp.topup_vcpu_memcache(&vcpu, params.pgd_pfn + 1, MEMCACHE_PAGES)
        .unwrap();
    (handle, vcpu)
}
