// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::result;
use pkvm_pages::*;

use crate::{HwMemMap, HwMemRegionType, HwReservedMemType, MemRange};

/// Errors related to tracking and allocating pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The given page isn't physically present.
    InvalidPage(PhysPageAddr),
    /// No region of RAM is large enough for the hypervisor carve-out.
    NoCarveoutSpace,
    /// The carve-out has been used up.
    OutOfPages,
    /// The page metadata table could not be allocated.
    InsufficientMemory,
    /// The memory map is too fragmented to be described by the page map.
    TooManyRanges,
    /// The ref count was at u16::MAX.
    RefCountOverflow,
    /// The ref count was already 0.
    RefCountUnderflow,
}

/// Holds the result of page tracking operations.
pub type Result<T> = result::Result<T, Error>;

/// Boot-time allocator for the hypervisor's private memory. Reserves a contiguous carve-out at the
/// top of RAM in the memory map and hands it out in order. Pages are never returned; anything that
/// needs recycling is handed on to a `PagePool`.
pub struct HypPageAlloc {
    next_page: PhysPageAddr,
    range: MemRange,
}

impl HypPageAlloc {
    /// Reserves `num_pages` pages from the highest region of `mem_map` that can hold them and marks
    /// them as the hypervisor carve-out.
    pub fn new(mem_map: &mut HwMemMap, num_pages: u64) -> Result<Self> {
        let size = num_pages
            .checked_mul(PageSize::Size4k as u64)
            .ok_or(Error::NoCarveoutSpace)?;
        let region = mem_map
            .regions()
            .rev()
            .find(|r| r.region_type() == HwMemRegionType::Available && r.size() >= size)
            .ok_or(Error::NoCarveoutSpace)?;
        let base = region.end() - size;
        mem_map
            .reserve_region(
                HwReservedMemType::HypervisorCarveout,
                RawAddr::phys(base),
                size,
            )
            .map_err(|_| Error::NoCarveoutSpace)?;
        let next_page = PhysPageAddr::phys(base).ok_or(Error::NoCarveoutSpace)?;
        Ok(Self {
            next_page,
            range: MemRange {
                start: base,
                end: base + size,
            },
        })
    }

    /// Takes `count` contiguous pages from the carve-out, returning the first one.
    pub fn take_pages(&mut self, count: u64) -> Result<PhysPageAddr> {
        if count > self.pages_remaining() {
            return Err(Error::OutOfPages);
        }
        let first = self.next_page;
        self.next_page = first
            .checked_add_pages(count)
            .ok_or(Error::InvalidPage(first))?;
        Ok(first)
    }

    /// Returns the number of pages not yet handed out.
    pub fn pages_remaining(&self) -> u64 {
        (self.range.end - self.next_page.bits()) / PageSize::Size4k as u64
    }

    /// Returns the whole physical range of the carve-out.
    pub fn range(&self) -> MemRange {
        self.range
    }
}
