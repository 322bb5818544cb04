// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use pkvm_pages::*;

use crate::{HwMemMap, PageTrackingError, PageTrackingResult};

/// Holds ownership and pinning details about a particular page of RAM.
///
/// `owner_id` is the party the host stage-2 view attributes the page to and `host_state` is the
/// sharing state of the page from the host's point of view. The two change together with the host
/// page table, under the host lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    owner_id: OwnerId,
    host_state: PageState,
    refcount: u16,
    order: u8,
}

impl PageInfo {
    /// Creates a new `PageInfo` for a page the host owns outright.
    pub fn new() -> Self {
        Self {
            owner_id: OwnerId::HOST,
            host_state: PageState::owned(),
            refcount: 0,
            order: 0,
        }
    }

    /// Returns the current owner.
    pub fn owner(&self) -> OwnerId {
        self.owner_id
    }

    pub fn set_owner(&mut self, owner_id: OwnerId) {
        self.owner_id = owner_id;
    }

    /// Returns the page's state in the host's view.
    pub fn host_state(&self) -> PageState {
        self.host_state
    }

    pub fn set_host_state(&mut self, state: PageState) {
        self.host_state = state;
    }

    /// Returns the number of live pins on the page.
    pub fn refcount(&self) -> u16 {
        self.refcount
    }

    /// Takes a pin on the page.
    pub fn pin(&mut self) -> PageTrackingResult<()> {
        self.refcount = self
            .refcount
            .checked_add(1)
            .ok_or(PageTrackingError::RefCountOverflow)?;
        Ok(())
    }

    /// Drops a pin on the page.
    pub fn unpin(&mut self) -> PageTrackingResult<()> {
        self.refcount = self
            .refcount
            .checked_sub(1)
            .ok_or(PageTrackingError::RefCountUnderflow)?;
        Ok(())
    }

    /// Returns the order of the allocation this page heads, zero for single pages.
    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn set_order(&mut self, order: u8) {
        self.order = order;
    }
}

impl Default for PageInfo {
    fn default() -> Self {
        Self::new()
    }
}

const MAX_SPARSE_MAP_ENTRIES: usize = 16;

/// Maps a contiguous range of memory to a subset of the `PageMap`.
#[derive(Clone, Copy, Debug)]
struct SparseMapEntry {
    base_pfn: usize,
    num_pages: usize,
    page_map_index: usize,
}

/// Keeps information for all pages of RAM in the system. There are no entries for MMIO.
pub struct PageMap {
    pages: Vec<PageInfo>,
    sparse_map: ArrayVec<SparseMapEntry, MAX_SPARSE_MAP_ENTRIES>,
}

impl PageMap {
    /// Builds a new `PageMap` from a populated `HwMemMap`. Every page starts out owned by the host.
    pub fn build_from(mem_map: &HwMemMap) -> PageTrackingResult<Self> {
        let total_pages = mem_map
            .regions()
            .fold(0, |pages, r| pages + r.size() / PageSize::Size4k as u64);
        let mut page_map = Self {
            pages: Vec::new(),
            sparse_map: ArrayVec::new(),
        };
        page_map
            .pages
            .try_reserve_exact(total_pages as usize)
            .map_err(|_| PageTrackingError::InsufficientMemory)?;
        page_map.populate_from(mem_map)?;
        Ok(page_map)
    }

    /// Populates the map with one entry per page in each region of `mem_map`, merging adjacent
    /// regions into a single sparse-map entry.
    fn populate_from(&mut self, mem_map: &HwMemMap) -> PageTrackingResult<()> {
        let mut current: Option<SparseMapEntry> = None;
        for r in mem_map.regions() {
            let base = r.base().index();
            let num_pages = (r.size() / PageSize::Size4k as u64) as usize;
            match current.as_mut() {
                Some(entry) if entry.base_pfn + entry.num_pages == base => {
                    entry.num_pages += num_pages;
                }
                _ => {
                    if let Some(entry) = current.take() {
                        self.sparse_map
                            .try_push(entry)
                            .map_err(|_| PageTrackingError::TooManyRanges)?;
                    }
                    current = Some(SparseMapEntry {
                        base_pfn: base,
                        num_pages,
                        page_map_index: self.pages.len(),
                    });
                }
            }
            self.pages
                .extend(core::iter::repeat(PageInfo::new()).take(num_pages));
        }
        if let Some(entry) = current {
            self.sparse_map
                .try_push(entry)
                .map_err(|_| PageTrackingError::TooManyRanges)?;
        }
        Ok(())
    }

    /// Returns a reference to the `PageInfo` struct for the 4k page at `addr`.
    pub fn get(&self, addr: PhysPageAddr) -> Option<&PageInfo> {
        let index = self.get_map_index(addr)?;
        self.pages.get(index)
    }

    /// Returns a mutable reference to the `PageInfo` struct for the 4k page at `addr`.
    pub fn get_mut(&mut self, addr: PhysPageAddr) -> Option<&mut PageInfo> {
        let index = self.get_map_index(addr)?;
        self.pages.get_mut(index)
    }

    /// Returns the total number of tracked pages.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Returns an iterator over every tracked page.
    pub fn iter(&self) -> PageMapIter<'_> {
        PageMapIter {
            page_map: self,
            cur_sparse_entry: 0,
            cur_index: 0,
        }
    }

    /// Returns the index in the `PageMap` for the given address.
    fn get_map_index(&self, addr: PhysPageAddr) -> Option<usize> {
        self.sparse_map
            .iter()
            .find(|s| s.base_pfn <= addr.index() && addr.index() < s.base_pfn + s.num_pages)
            .map(|entry| entry.page_map_index + addr.index() - entry.base_pfn)
    }
}

/// An iterator over `PageMap` in (PageInfo, address) pairs.
pub struct PageMapIter<'a> {
    page_map: &'a PageMap,
    cur_sparse_entry: usize,
    cur_index: usize,
}

/// A (`PageInfo`, address) pair returned by `PageMapIter`.
pub struct PageInfoWithAddr<'a> {
    pub page: &'a PageInfo,
    pub addr: PhysPageAddr,
}

impl<'a> Iterator for PageMapIter<'a> {
    type Item = PageInfoWithAddr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.page_map.sparse_map.get(self.cur_sparse_entry)?;
        let page = self.page_map.pages.get(self.cur_index)?;
        let pfn = Pfn::phys((entry.base_pfn + self.cur_index - entry.page_map_index) as u64);

        self.cur_index += 1;
        if self.cur_index >= entry.num_pages + entry.page_map_index {
            self.cur_sparse_entry += 1;
        }

        Some(Self::Item {
            page,
            addr: pfn.addr(),
        })
    }
}
