// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use page_tracking::PagePool;
#[cfg(test)]
use pkvm_page_tables::Level;
use pkvm_page_tables::{page_hyp, prot_rwx, HypS1PageTable, ProtSet, Pte, WalkFlags};
use pkvm_pages::{PageState, PageStateFlag};

use crate::error::{Error, Result};
use crate::host_mmu::is_page_range;

/// Proof that a range of the hypervisor's own mappings is in the state a transition expects.
#[must_use]
pub(crate) struct HypRangeChecked {
    addr: u64,
    size: u64,
}

fn hyp_state(pte: &Pte) -> PageState {
    match pte {
        Pte::Leaf { prot, state, .. } if *prot & prot_rwx() != page_hyp() => {
            state.with(PageStateFlag::RestrictedProt)
        }
        Pte::Leaf { state, .. } => *state,
        _ => PageState::nopage(),
    }
}

/// The hypervisor's stage-1 table. Virtual addresses equal physical ones.
pub(crate) struct HypMmu {
    pgt: HypS1PageTable,
    pool: PagePool,
}

impl HypMmu {
    pub fn new(pgt: HypS1PageTable, pool: PagePool) -> Self {
        Self { pgt, pool }
    }

    pub fn check_range(&self, addr: u64, size: u64, state: PageState) -> Result<HypRangeChecked> {
        if !is_page_range(addr, size) {
            return Err(Error::Inval);
        }
        self.pgt.walk(addr, size, WalkFlags::Leaf as u8, |ctx| {
            if hyp_state(&ctx.pte) != state {
                return Err(Error::Perm);
            }
            Ok(())
        })?;
        Ok(HypRangeChecked { addr, size })
    }

    /// Maps the checked range at its own address.
    pub fn map(&mut self, checked: HypRangeChecked, prot: ProtSet, state: PageState) -> Result<()> {
        self.map_locked(checked.addr, checked.size, prot, state)
    }

    pub fn unmap(&mut self, checked: HypRangeChecked) -> Result<()> {
        Ok(self
            .pgt
            .unmap(checked.addr, checked.size, &mut self.pool)?)
    }

    pub fn map_locked(
        &mut self,
        addr: u64,
        size: u64,
        prot: ProtSet,
        state: PageState,
    ) -> Result<()> {
        Ok(self.pgt.map(addr, size, addr, prot, state, &mut self.pool)?)
    }

    /// Makes sure the node pool can back a mapping of `[addr, addr + size)`.
    pub fn reserve(&self, addr: u64, size: u64) -> Result<()> {
        if self.pool.len() < self.pgt.nodes_needed(addr, size)? {
            return Err(Error::NoMem);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, Level)> {
        Ok(self.pgt.get_leaf(addr)?)
    }
}
