// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use page_tracking::PagePool;
use pkvm_pages::PhysPageAddr;

use crate::{prot_rwx, Level, Pte, ProtSet, PtePolicy};

/// Pool pages live well away from anything the tests map.
const POOL_BASE: u64 = 0x10_0000_0000;

pub fn stub_pool(pages: u64) -> PagePool {
    PagePool::with_range(PhysPageAddr::phys(POOL_BASE).unwrap(), pages)
}

/// A policy whose behaviour the tests choose. Leaves mapped RWX are never counted, to exercise
/// reclaim.
pub struct StubPolicy {
    force_pte: bool,
}

impl StubPolicy {
    pub fn blocks() -> Self {
        Self { force_pte: false }
    }

    pub fn pages() -> Self {
        Self { force_pte: true }
    }
}

impl PtePolicy for StubPolicy {
    fn force_pte(&self, _addr: u64, _end: u64, _prot: ProtSet) -> bool {
        self.force_pte
    }

    fn pte_is_counted(&self, pte: &Pte, _level: Level) -> bool {
        !(self.force_pte && pte.prot() == Some(prot_rwx()))
    }
}
