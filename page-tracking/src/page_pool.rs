// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use pkvm_pages::PhysPageAddr;

/// A pool of free 4kB pages used to back page-table nodes. Pools are filled from the hypervisor
/// carve-out at boot, or topped up at run time with pages the host donated.
#[derive(Default)]
pub struct PagePool {
    free: Vec<PhysPageAddr>,
}

impl PagePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Creates a pool holding `count` pages starting at `base`.
    pub fn with_range(base: PhysPageAddr, count: u64) -> Self {
        let mut pool = Self::new();
        pool.refill(base.iter_from().take(count as usize));
        pool
    }

    /// Takes a page out of the pool. The page's previous contents are unspecified.
    pub fn alloc(&mut self) -> Option<PhysPageAddr> {
        self.free.pop()
    }

    /// Returns a page to the pool.
    pub fn free(&mut self, page: PhysPageAddr) {
        self.free.push(page);
    }

    /// Adds pages to the pool.
    pub fn refill(&mut self, pages: impl IntoIterator<Item = PhysPageAddr>) {
        self.free.extend(pages);
    }

    /// Empties the pool, returning every page it held.
    pub fn drain(&mut self) -> Vec<PhysPageAddr> {
        core::mem::take(&mut self.free)
    }

    /// Returns the number of free pages in the pool.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}
