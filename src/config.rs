// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use page_tracking::{MemRange, MAX_MOVEABLE_REGIONS};
use pkvm_page_tables::Level;
use pkvm_pages::{OwnerId, PageSize};

use crate::error::{Error, Result};

/// Platform tuning for the memory protection layer.
///
/// None of these are architectural; they only bound table sizes and the time spent in a single
/// call.
#[derive(Clone, Debug)]
pub struct MemProtectConfig {
    /// Largest owner id that may be written into a host annotation.
    pub max_owner_id: u8,
    /// Most entries a single range walk will coalesce before stopping with a partial result.
    pub max_coalesce_ptes: u64,
    /// Most moveable ranges the memory map may declare.
    pub max_moveable_regions: usize,
    /// Number of slots in the VM table.
    pub max_vms: usize,
    /// Number of physical CPUs that may enter the hypervisor.
    pub max_cpus: usize,
    /// Input address bits of the host stage-2 table.
    pub host_ia_bits: u32,
    /// Input address bits of each guest stage-2 table.
    pub guest_ia_bits: u32,
    /// Pages in the hypervisor stage-1 pool. Zero sizes it from the memory map.
    pub hyp_pool_pages: u64,
    /// Pages in the host stage-2 pool. Zero sizes it from the memory map.
    pub host_pool_pages: u64,
    /// Physical location of the guest firmware image, copied into VMs that declare a firmware
    /// load address.
    pub firmware: Option<MemRange>,
}

impl Default for MemProtectConfig {
    fn default() -> Self {
        Self {
            max_owner_id: u8::MAX,
            max_coalesce_ptes: 512,
            max_moveable_regions: MAX_MOVEABLE_REGIONS,
            max_vms: 64,
            max_cpus: 8,
            host_ia_bits: 40,
            guest_ia_bits: 40,
            hyp_pool_pages: 0,
            host_pool_pages: 0,
            firmware: None,
        }
    }
}

impl MemProtectConfig {
    /// Checks that the caps are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if self.max_owner_id < OwnerId::FIRST_GUEST {
            return Err(Error::Inval);
        }
        if self.max_vms == 0
            || self.max_cpus == 0
            || self.max_coalesce_ptes == 0
            || self.max_moveable_regions == 0
            || self.max_moveable_regions > MAX_MOVEABLE_REGIONS
        {
            return Err(Error::Inval);
        }
        // Every VM slot needs an owner id of its own.
        let last_guest = OwnerId::guest(self.max_vms - 1).ok_or(Error::Inval)?;
        if last_guest.raw() > self.max_owner_id {
            return Err(Error::Inval);
        }
        for bits in [self.host_ia_bits, self.guest_ia_bits] {
            Level::start_for_ia_bits(bits).ok_or(Error::Inval)?;
        }
        if let Some(fw) = self.firmware {
            let aligned =
                PageSize::Size4k.is_aligned(fw.start) && PageSize::Size4k.is_aligned(fw.end);
            if !aligned || fw.end <= fw.start {
                return Err(Error::Inval);
            }
        }
        Ok(())
    }

    /// Returns the owner id of VM table slot `index`.
    pub fn owner_for_slot(&self, index: usize) -> Option<OwnerId> {
        OwnerId::guest(index).filter(|id| index < self.max_vms && id.raw() <= self.max_owner_id)
    }
}
