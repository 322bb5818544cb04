// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use pkvm_pages::{PAGE_SHIFT, PAGE_SIZE};
use sync::Mutex;

use crate::error::{Error, Result};

type PageBuf = [u8; PAGE_SIZE as usize];

/// Contents of physical pages, for the few paths that touch data: poisoning, firmware staging
/// and the ptdump log. Pages that were never written read as zero.
pub struct PhysMem {
    pages: Mutex<BTreeMap<u64, Box<PageBuf>>>,
}

fn check_span(offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_SIZE as usize => Ok(()),
        _ => Err(Error::Inval),
    }
}

impl PhysMem {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Zeroes the page at `addr`.
    pub fn poison(&self, addr: u64) {
        self.pages.lock().remove(&(addr >> PAGE_SHIFT));
    }

    /// Copies `buf.len()` bytes at `offset` into the page at `addr` out to `buf`.
    pub fn read(&self, addr: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_span(offset, buf.len())?;
        match self.pages.lock().get(&(addr >> PAGE_SHIFT)) {
            Some(page) => buf.copy_from_slice(&page[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
        Ok(())
    }

    /// Writes `data` at `offset` into the page at `addr`.
    pub fn write(&self, addr: u64, offset: usize, data: &[u8]) -> Result<()> {
        check_span(offset, data.len())?;
        let mut pages = self.pages.lock();
        let page = pages
            .entry(addr >> PAGE_SHIFT)
            .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
        page[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies the whole page at `src` over the page at `dst`.
    pub fn copy_page(&self, dst: u64, src: u64) {
        let mut pages = self.pages.lock();
        match pages.get(&(src >> PAGE_SHIFT)).cloned() {
            Some(contents) => {
                pages.insert(dst >> PAGE_SHIFT, contents);
            }
            None => {
                pages.remove(&(dst >> PAGE_SHIFT));
            }
        }
    }

    /// Returns true if every byte of the page at `addr` is zero.
    pub fn is_zero(&self, addr: u64) -> bool {
        self.pages
            .lock()
            .get(&(addr >> PAGE_SHIFT))
            .map_or(true, |page| page.iter().all(|b| *b == 0))
    }
}

impl Default for PhysMem {
    fn default() -> Self {
        Self::new()
    }
}
