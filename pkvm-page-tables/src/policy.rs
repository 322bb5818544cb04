// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use page_tracking::HwMemMap;

use crate::{default_host_prot, Level, PageTable, Pte, ProtSet, PtePolicy};

/// Policy for the host stage-2 identity map.
///
/// Blocks are only used for mappings with the default prot of the range, so a block can never
/// hide page-granular ownership. Default mappings are not counted: a node holding nothing else can
/// be dropped and rebuilt on the next fault.
pub struct HostS2Policy {
    mem_map: Arc<HwMemMap>,
}

impl HostS2Policy {
    pub fn new(mem_map: Arc<HwMemMap>) -> Self {
        Self { mem_map }
    }

    /// Returns the memory map the policy classifies addresses with.
    pub fn mem_map(&self) -> &HwMemMap {
        &self.mem_map
    }
}

impl PtePolicy for HostS2Policy {
    fn force_pte(&self, addr: u64, end: u64, prot: ProtSet) -> bool {
        prot != default_host_prot(self.mem_map.range_is_memory(addr, end))
    }

    fn pte_is_counted(&self, pte: &Pte, _level: Level) -> bool {
        match pte {
            Pte::Leaf { phys, prot, state } => {
                *prot != default_host_prot(self.mem_map.is_memory(*phys)) || !state.is_owned()
            }
            // Any annotation.
            _ => true,
        }
    }
}

/// Policy for guest stage-2 tables: always single pages, every entry counted.
pub struct GuestS2Policy;

impl PtePolicy for GuestS2Policy {
    fn force_pte(&self, _addr: u64, _end: u64, _prot: ProtSet) -> bool {
        true
    }

    fn pte_is_counted(&self, _pte: &Pte, _level: Level) -> bool {
        true
    }
}

/// Policy for the hypervisor's stage-1 table: blocks wherever they fit, every entry counted.
pub struct HypS1Policy;

impl PtePolicy for HypS1Policy {
    fn force_pte(&self, _addr: u64, _end: u64, _prot: ProtSet) -> bool {
        false
    }

    fn pte_is_counted(&self, _pte: &Pte, _level: Level) -> bool {
        true
    }
}

/// The host stage-2 table.
pub type HostS2PageTable = PageTable<HostS2Policy>;
/// A guest stage-2 table.
pub type GuestS2PageTable = PageTable<GuestS2Policy>;
/// The hypervisor stage-1 table.
pub type HypS1PageTable = PageTable<HypS1Policy>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::stub_pool;
    use crate::{prot_rwx, Prot};
    use page_tracking::HwMemMapBuilder;
    use pkvm_pages::{OwnerId, PageSize, PageState, RawAddr};

    fn host_policy() -> HostS2Policy {
        let mem_map = HwMemMapBuilder::new(PageSize::Size4k as u64)
            .add_memory_region(RawAddr::phys(0x8000_0000), 0x4000_0000)
            .unwrap()
            .build();
        HostS2Policy::new(Arc::new(mem_map))
    }

    #[test]
    fn host_force_pte() {
        let policy = host_policy();
        assert!(!policy.force_pte(0x8000_0000, 0x8020_0000, prot_rwx()));
        assert!(policy.force_pte(0x8000_0000, 0x8020_0000, Prot::R | Prot::W));
        assert!(!policy.force_pte(0x0, 0x20_0000, default_host_prot(false)));
        assert!(policy.force_pte(0x0, 0x20_0000, prot_rwx()));
    }

    #[test]
    fn host_counting() {
        let policy = host_policy();
        let l3 = Level::LAST;
        let default_mem = Pte::Leaf {
            phys: 0x8000_0000,
            prot: prot_rwx(),
            state: PageState::owned(),
        };
        assert!(!policy.pte_is_counted(&default_mem, l3));
        let shared = Pte::Leaf {
            phys: 0x8000_0000,
            prot: prot_rwx(),
            state: PageState::shared_owned(),
        };
        assert!(policy.pte_is_counted(&shared, l3));
        let default_mmio = Pte::Leaf {
            phys: 0x1000,
            prot: default_host_prot(false),
            state: PageState::owned(),
        };
        assert!(!policy.pte_is_counted(&default_mmio, l3));
        assert!(policy.pte_is_counted(&Pte::owned_by(OwnerId::HYP), l3));
    }

    #[test]
    fn host_tree_blocks_for_default_only() {
        let mut pool = stub_pool(16);
        let mut pgt = HostS2PageTable::new(40, host_policy(), &mut pool).unwrap();
        pgt.map(
            0x8000_0000,
            0x20_0000,
            0x8000_0000,
            prot_rwx(),
            PageState::owned(),
            &mut pool,
        )
        .unwrap();
        assert_eq!(pgt.get_leaf(0x8000_0000).unwrap().1.raw(), 2);
        pgt.map(
            0x8020_0000,
            0x20_0000,
            0x8020_0000,
            Prot::R.into(),
            PageState::owned(),
            &mut pool,
        )
        .unwrap();
        assert!(pgt.get_leaf(0x8020_0000).unwrap().1.is_last());
    }
}
