// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Physical memory tracking
//!
//! ## Key types
//!
//! - `HwMemMap` - Map of system RAM, sorted and binary-searchable. Addresses outside of it are
//!   MMIO. Also holds the list of moveable ranges.
//! - `HypPageAlloc` - Boot-time allocator for the hypervisor carve-out.
//! - `PageMap` - Dense table of `PageInfo`, one per page of RAM, holding the owner, the host view
//!   of its sharing state and its pin count.
//! - `PagePool` - Free pages backing page-table nodes.
//!
//! ## Initialization
//!
//! `HwMemMap` -> `HypPageAlloc` ---> `PagePool`s for the hypervisor and host page tables
//!            \
//!             -----------------> `PageMap`

#![no_std]

extern crate alloc;

mod hw_mem_map;
mod hyp_page_alloc;
mod page_info;
mod page_pool;

pub use hw_mem_map::Error as MemMapError;
pub use hw_mem_map::Result as MemMapResult;
pub use hw_mem_map::{
    HwMemMap, HwMemMapBuilder, HwMemRegion, HwMemRegionType, HwReservedMemType, MemRange,
    MoveableRegion, MAX_MOVEABLE_REGIONS,
};
pub use hyp_page_alloc::Error as PageTrackingError;
pub use hyp_page_alloc::Result as PageTrackingResult;
pub use hyp_page_alloc::HypPageAlloc;
pub use page_info::{PageInfo, PageInfoWithAddr, PageMap, PageMapIter};
pub use page_pool::PagePool;

#[cfg(test)]
#[macro_use]
extern crate std;
