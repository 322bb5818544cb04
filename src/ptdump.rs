// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Dumps of the host and guest stage-2 tables into a chain of host-provided log pages.

use alloc::vec::Vec;
use core::mem::size_of;
use log::debug;
use pkvm_page_tables::{Prot, Pte, WalkCtx, WalkFlags};
use pkvm_pages::{PageStateFlag, PAGE_SHIFT, PAGE_SIZE};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, OrHalt, Result};
use crate::mem_protect::{pfn_to_addr, MemProtect};
use crate::phys_mem::PhysMem;

/// Terminates the chain of log pages.
pub const INVALID_PTDUMP_PFN: u64 = u64::MAX;

/// Header at the start of every log page.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PtdumpLogHeader {
    /// Frame of the next log page, or `INVALID_PTDUMP_PFN`.
    pub pfn_next: u64,
    /// Bytes of records written after the header.
    pub w_index: u32,
    _pad: u32,
}

impl PtdumpLogHeader {
    pub fn new(pfn_next: u64) -> Self {
        Self {
            pfn_next,
            ..Default::default()
        }
    }
}

/// One table entry in the log.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PtdumpRecord {
    /// Frame of the first input address the entry covers.
    pub pfn: u64,
    pub valid: u8,
    pub r: u8,
    pub w: u8,
    /// Set when the mapping is not executable.
    pub xn: u8,
    /// Descriptor type bit: set for page entries, clear for blocks.
    pub table: u8,
    pub level: u8,
    /// Sharing state bits of a valid entry.
    pub page_state: u8,
    /// Owner annotated in an invalid entry.
    pub owner_id: u8,
}

const_assert_eq!(size_of::<PtdumpLogHeader>(), 16);
const_assert_eq!(size_of::<PtdumpRecord>(), 16);

const HEADER_SIZE: usize = size_of::<PtdumpLogHeader>();
const RECORD_SIZE: usize = size_of::<PtdumpRecord>();

/// What `ptdump_get_config()` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtdumpOp {
    /// The level the walk starts at.
    Level,
    /// Input address bits.
    IaBits,
}

impl From<&WalkCtx> for PtdumpRecord {
    fn from(ctx: &WalkCtx) -> Self {
        let mut rec = PtdumpRecord {
            pfn: ctx.addr >> PAGE_SHIFT,
            level: ctx.level.raw(),
            ..Default::default()
        };
        match ctx.pte {
            Pte::Leaf { prot, state, .. } => {
                rec.valid = 1;
                rec.r = prot.contains(Prot::R).into();
                rec.w = prot.contains(Prot::W).into();
                rec.xn = (!prot.contains(Prot::X)).into();
                rec.table = ctx.level.is_last().into();
                rec.page_state = (state.flags()
                    & (PageStateFlag::SharedOwned | PageStateFlag::SharedBorrowed))
                    .bits();
            }
            pte => rec.owner_id = pte.owner_id().raw(),
        }
        rec
    }
}

/// Appends records to the log chain, moving to the next page when one fills up.
struct LogWriter<'a> {
    phys: &'a PhysMem,
    page: u64,
    hdr: PtdumpLogHeader,
}

impl<'a> LogWriter<'a> {
    fn new(phys: &'a PhysMem, page: u64) -> Result<Self> {
        let mut hdr = PtdumpLogHeader::new_zeroed();
        phys.read(page, 0, hdr.as_mut_bytes())?;
        Ok(Self { phys, page, hdr })
    }

    fn push(&mut self, rec: &PtdumpRecord) -> Result<()> {
        if HEADER_SIZE + self.hdr.w_index as usize + RECORD_SIZE > PAGE_SIZE as usize {
            if self.hdr.pfn_next == INVALID_PTDUMP_PFN {
                return Err(Error::NoMem);
            }
            self.flush()?;
            *self = Self::new(self.phys, pfn_to_addr(self.hdr.pfn_next)?)?;
        }
        let offset = HEADER_SIZE + self.hdr.w_index as usize;
        self.phys.write(self.page, offset, rec.as_bytes())?;
        self.hdr.w_index += RECORD_SIZE as u32;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.phys.write(self.page, 0, self.hdr.as_bytes())
    }
}

impl MemProtect {
    /// Returns the start level or input address size of the host stage-2 (`handle` 0) or of a
    /// guest's.
    pub fn ptdump_get_config(&self, handle: u64, op: PtdumpOp) -> Result<u64> {
        let pick = |level: u8, ia_bits: u32| match op {
            PtdumpOp::Level => level as u64,
            PtdumpOp::IaBits => ia_bits as u64,
        };
        if handle == 0 {
            let host = self.host.lock();
            return Ok(pick(host.pgt().start_level().raw(), host.pgt().ia_bits()));
        }
        let vm = self.vms.get(handle).ok_or(Error::Inval)?;
        vm.with_mmu(|mmu| Ok(pick(mmu.pgt().start_level().raw(), mmu.pgt().ia_bits())))
    }

    /// Writes a record for every non-empty entry of the host stage-2 (`handle` 0) or of a guest's
    /// into the chain of log pages starting at `log_pfn`. The pages belong to the hypervisor for
    /// the duration of the walk.
    pub fn ptdump_walk_range(&self, handle: u64, log_pfn: u64) -> Result<()> {
        let donated = self.ptdump_setup_log(log_pfn)?;
        let ret = self.ptdump_walk(handle, log_pfn);
        for pfn in donated {
            self.hyp_donate_host(pfn, 1).or_halt("return of ptdump log page");
        }
        ret
    }

    /// Takes every page of the chain from the host and clears its write index. On failure the
    /// pages taken so far are given back.
    fn ptdump_setup_log(&self, log_pfn: u64) -> Result<Vec<u64>> {
        let mut donated = Vec::new();
        let mut pfn = log_pfn;
        loop {
            // A chain that loops back on itself fails here, the page being the hypervisor's.
            let ret = pfn_to_addr(pfn).and_then(|addr| {
                self.host_donate_hyp(pfn, 1)?;
                donated.push(pfn);
                let mut hdr = PtdumpLogHeader::new_zeroed();
                self.phys.read(addr, 0, hdr.as_mut_bytes())?;
                hdr.w_index = 0;
                self.phys.write(addr, 0, hdr.as_bytes())?;
                Ok(hdr.pfn_next)
            });
            match ret {
                Ok(INVALID_PTDUMP_PFN) => return Ok(donated),
                Ok(next) => pfn = next,
                Err(e) => {
                    for pfn in donated {
                        self.hyp_donate_host(pfn, 1).or_halt("return of ptdump log page");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn ptdump_walk(&self, handle: u64, log_pfn: u64) -> Result<()> {
        let mut writer = LogWriter::new(&self.phys, pfn_to_addr(log_pfn)?)?;
        let mut visit = |ctx: &WalkCtx| {
            if ctx.pte.is_empty() {
                return Ok(());
            }
            writer.push(&PtdumpRecord::from(ctx))
        };
        let ret = if handle == 0 {
            let host = self.host.lock();
            let pgt = host.pgt();
            pgt.walk(0, 1 << pgt.ia_bits(), WalkFlags::Leaf as u8, &mut visit)
        } else {
            match self.vms.get(handle) {
                Some(vm) => vm.with_mmu(|mmu| {
                    let pgt = mmu.pgt();
                    pgt.walk(0, 1 << pgt.ia_bits(), WalkFlags::Leaf as u8, &mut visit)
                }),
                None => Err(Error::Inval),
            }
        };
        writer.flush()?;
        debug!("ptdump of {:#x}: {:?}", handle, ret);
        ret
    }
}
