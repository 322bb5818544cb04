// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use core::{fmt, result};
use pkvm_pages::{MemType, PageAddr, PageSize, PhysAddr, PhysPageAddr, RawAddr};

/// The maximum number of regions in a `HwMemMap`. Statically sized since the map is built before
/// any dynamic allocation is possible.
const MAX_HW_MEM_REGIONS: usize = 32;

/// The maximum number of entries in the moveable-region list. Platforms may configure a lower cap.
pub const MAX_MOVEABLE_REGIONS: usize = 64;

type RegionVec = ArrayVec<HwMemRegion, MAX_HW_MEM_REGIONS>;
type MoveableVec = ArrayVec<MoveableRegion, MAX_MOVEABLE_REGIONS>;

/// Represents the raw system memory map: every range of RAM the firmware reported, with the
/// reserved sub-ranges carved out of it. Anything not covered by a region is MMIO.
///
/// The map also records the moveable ranges: RAM plus any platform-declared protected ranges. The
/// host stage-2 tree only needs to keep table pages for those; everything else can be torn down
/// and lazily rebuilt when the page-table pool runs dry.
///
/// Use `HwMemMapBuilder` to populate it. The map is immutable once built.
#[derive(Default)]
pub struct HwMemMap {
    // Maintained in sorted order.
    regions: RegionVec,
    // Sorted by base, larger first on ties.
    moveable: MoveableVec,
    // Alignment required for physical memory regions (and reserved sub-regions) in the map. Must be
    // a multiple of the system page size.
    min_ram_alignment: u64,
}

/// A builder for a `HwMemMap`. Call `add_memory_region()` once for each range of physical memory
/// in the system, `reserve_region()` for each range that firmware or the hypervisor sets aside and
/// `add_moveable_region()` for extra ranges the host may remap at will.
pub struct HwMemMapBuilder {
    inner: HwMemMap,
}

/// Describes a contiguous region in the hardware memory map.
#[derive(Debug, Clone, Copy)]
pub struct HwMemRegion {
    region_type: HwMemRegionType,
    base: PhysPageAddr,
    size: u64,
}

/// Describes the usage of a region in the hardware memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwMemRegionType {
    /// Physical memory the host may use freely.
    Available,

    /// Physical memory that is set aside for a particular purpose.
    Reserved(HwReservedMemType),
}

impl From<HwMemRegionType> for MemType {
    fn from(_: HwMemRegionType) -> MemType {
        // Every region in the map is RAM; MMIO only exists in the gaps.
        MemType::Ram
    }
}

/// Describes the purpose of a reserved region in the hardware memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwReservedMemType {
    /// Firmware says this region must never be mapped.
    FirmwareReserved,

    /// The hypervisor's private memory: its own page tables, the host stage-2 pool, the VM table
    /// and the page metadata.
    HypervisorCarveout,
}

/// A half-open range of physical addresses `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
}

impl MemRange {
    /// Returns true if `addr` is within the range.
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns the size of the range in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// A physical range the host may remap freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveableRegion {
    pub start: u64,
    pub size: u64,
}

/// Errors that can be raised while building the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Memory region size is unaligned.
    UnalignedRegion,

    /// Memory region overlaps with another one.
    OverlappingRegion,

    /// Reserved region isn't a subset of an existing memory region.
    InvalidReservedRegion,

    /// No more entries available in the memory map.
    OutOfSpace,

    /// The region has zero size.
    EmptyRegion,
}

/// Holds the result of memory map operations.
pub type Result<T> = result::Result<T, Error>;

impl HwMemRegion {
    /// Returns the type of the memory region.
    pub fn region_type(&self) -> HwMemRegionType {
        self.region_type
    }

    /// Returns the 4kB page-aligned base adddress of the region.
    pub fn base(&self) -> PhysPageAddr {
        self.base
    }

    /// Returns the total size of the region.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the page-aligned end address of the region.
    pub fn end(&self) -> u64 {
        self.base.bits() + self.size
    }

    /// Returns the address range covered by the region.
    pub fn range(&self) -> MemRange {
        MemRange {
            start: self.base.bits(),
            end: self.end(),
        }
    }

    /// Returns true if the region must never be mapped.
    pub fn no_map(&self) -> bool {
        self.region_type == HwMemRegionType::Reserved(HwReservedMemType::FirmwareReserved)
    }
}

impl HwMemMapBuilder {
    /// Creates an empty system memory map with a minimum physical memory region alignment of
    /// `min_ram_alignment`.
    pub fn new(min_ram_alignment: u64) -> Self {
        assert!(PageSize::Size4k.is_aligned(min_ram_alignment));
        let inner = HwMemMap {
            regions: RegionVec::default(),
            moveable: MoveableVec::default(),
            min_ram_alignment,
        };
        Self { inner }
    }

    /// Adds a range of RAM to the system map. The base address must be aligned to
    /// `min_ram_alignment`; `size` will be rounded down if un-aligned. Must not overlap with any
    /// previously-added regions. The range is also recorded as moveable.
    pub fn add_memory_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        if !self.inner.is_aligned(base.bits()) {
            return Err(Error::UnalignedRegion);
        }
        let base = PageAddr::new(base).ok_or(Error::UnalignedRegion)?;
        let size = self.inner.align_down(size);
        if size == 0 {
            return Err(Error::EmptyRegion);
        }
        let region = HwMemRegion {
            region_type: HwMemRegionType::Available,
            base,
            size,
        };
        let mut index = 0;
        for other in &self.inner.regions {
            if other.base() > region.base() {
                if region.end() > other.base().bits() {
                    return Err(Error::OverlappingRegion);
                }
                break;
            } else if region.base().bits() < other.end() {
                return Err(Error::OverlappingRegion);
            }
            index += 1;
        }
        self.inner
            .regions
            .try_insert(index, region)
            .map_err(|_| Error::OutOfSpace)?;
        self.inner.add_moveable(base.bits(), size)?;
        Ok(self)
    }

    /// Reserves a range of RAM for the specified purpose. The range must be a subset of
    /// a previously-added available memory region and must not overlap any other reserved
    /// regions. `base` and `size` will be rounded to the nearest `min_ram_alignment` boundary.
    pub fn reserve_region(
        mut self,
        resv_type: HwReservedMemType,
        base: PhysAddr,
        size: u64,
    ) -> Result<Self> {
        self.inner.reserve_region(resv_type, base, size)?;
        Ok(self)
    }

    /// Declares an extra range the host may remap freely, e.g. a protected range from the
    /// platform description. Ranges may overlap each other and the RAM regions.
    pub fn add_moveable_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        if !PageSize::Size4k.is_aligned(base.bits()) || !PageSize::Size4k.is_aligned(size) {
            return Err(Error::UnalignedRegion);
        }
        if size == 0 {
            return Err(Error::EmptyRegion);
        }
        self.inner.add_moveable(base.bits(), size)?;
        Ok(self)
    }

    /// Returns the constructed HwMemMap.
    pub fn build(self) -> HwMemMap {
        self.inner
    }
}

impl HwMemMap {
    /// Reserves a range of memory. See `HwMemMapBuilder::reserve_region()`.
    pub fn reserve_region(
        &mut self,
        resv_type: HwReservedMemType,
        base: PhysAddr,
        size: u64,
    ) -> Result<()> {
        let base = PageAddr::new(RawAddr::phys(self.align_down(base.bits())))
            .ok_or(Error::UnalignedRegion)?;
        let size = self.align_up(size);
        if size == 0 {
            return Err(Error::EmptyRegion);
        }
        let region = HwMemRegion {
            region_type: HwMemRegionType::Reserved(resv_type),
            base,
            size,
        };
        let mut index = self
            .regions
            .iter()
            .position(|other| {
                other.region_type() == HwMemRegionType::Available
                    && region.base() >= other.base()
                    && region.end() <= other.end()
            })
            .ok_or(Error::InvalidReservedRegion)?;

        // Now insert, splitting if necessary.
        if region.base() > self.regions[index].base() {
            let other = self.regions[index];
            let before = HwMemRegion {
                region_type: HwMemRegionType::Available,
                base: other.base(),
                size: region.base().bits() - other.base().bits(),
            };
            self.regions
                .try_insert(index, before)
                .map_err(|_| Error::OutOfSpace)?;
            index += 1;
        }
        let end = self.regions[index].end();
        self.regions[index] = region;
        index += 1;
        if region.end() < end {
            let after = HwMemRegion {
                region_type: HwMemRegionType::Available,
                // Aligned: both ends come from aligned regions.
                base: PageAddr::new(RawAddr::phys(region.end())).ok_or(Error::UnalignedRegion)?,
                size: end - region.end(),
            };
            self.regions
                .try_insert(index, after)
                .map_err(|_| Error::OutOfSpace)?;
        }
        Ok(())
    }

    /// Returns an iterator over all regions in the memory map.
    pub fn regions(&self) -> core::slice::Iter<'_, HwMemRegion> {
        self.regions.iter()
    }

    /// Returns the moveable ranges, sorted by base address with larger ranges first on ties.
    pub fn moveable_regions(&self) -> core::slice::Iter<'_, MoveableRegion> {
        self.moveable.iter()
    }

    /// Returns the total number of bytes of RAM in the map.
    pub fn total_ram(&self) -> u64 {
        self.regions.iter().map(|r| r.size()).sum()
    }

    /// Looks up the region containing `addr`. Returns the region, if any, together with the
    /// range it spans. When `addr` is in a gap the range is the gap between the neighbouring
    /// regions, which is how callers size identity mappings of MMIO.
    pub fn find(&self, addr: u64) -> (Option<&HwMemRegion>, MemRange) {
        let mut range = MemRange {
            start: 0,
            end: u64::MAX,
        };
        let (mut left, mut right) = (0, self.regions.len());
        while left < right {
            let cur = (left + right) / 2;
            let reg = &self.regions[cur];
            if addr < reg.base().bits() {
                right = cur;
                range.end = reg.base().bits();
            } else if addr >= reg.end() {
                left = cur + 1;
                range.start = reg.end();
            } else {
                return (Some(reg), reg.range());
            }
        }
        (None, range)
    }

    /// Returns true if `addr` is RAM.
    pub fn is_memory(&self, addr: u64) -> bool {
        self.find(addr).0.is_some()
    }

    /// Returns the memory type backing `addr`.
    pub fn mem_type(&self, addr: u64) -> MemType {
        match self.find(addr).0 {
            Some(r) => r.region_type().into(),
            None => MemType::Mmio,
        }
    }

    /// Returns true if `[start, end)` is RAM entirely within one region.
    pub fn range_is_memory(&self, start: u64, end: u64) -> bool {
        match self.find(start) {
            (Some(_), range) => end > start && range.contains(end - 1),
            (None, _) => false,
        }
    }

    /// Like `range_is_memory()`, but also requires the region to be mappable.
    pub fn range_is_allowed_memory(&self, start: u64, end: u64) -> bool {
        match self.find(start) {
            (Some(reg), range) => end > start && range.contains(end - 1) && !reg.no_map(),
            (None, _) => false,
        }
    }

    fn add_moveable(&mut self, start: u64, size: u64) -> Result<()> {
        let index = self
            .moveable
            .iter()
            .position(|m| m.start > start || (m.start == start && m.size < size))
            .unwrap_or(self.moveable.len());
        self.moveable
            .try_insert(index, MoveableRegion { start, size })
            .map_err(|_| Error::OutOfSpace)
    }

    /// Returns true if the value is aligned to the minimum alignment.
    fn is_aligned(&self, val: u64) -> bool {
        val & (self.min_ram_alignment - 1) == 0
    }

    /// Rounds up the given value to the minimum alignment.
    fn align_up(&self, val: u64) -> u64 {
        (val + self.min_ram_alignment - 1) & !(self.min_ram_alignment - 1)
    }

    /// Rounds down the given value to the minimum alignment.
    fn align_down(&self, val: u64) -> u64 {
        val & !(self.min_ram_alignment - 1)
    }
}

impl fmt::Display for HwMemRegionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match &self {
            HwMemRegionType::Available => write!(f, "available"),
            HwMemRegionType::Reserved(r) => write!(f, "reserved ({r})"),
        }
    }
}

impl fmt::Display for HwReservedMemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match &self {
            HwReservedMemType::FirmwareReserved => write!(f, "firmware"),
            HwReservedMemType::HypervisorCarveout => write!(f, "hypervisor carve-out"),
        }
    }
}

impl fmt::Display for HwMemRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{:#x}-{:#x} {}",
            self.base.bits(),
            self.end(),
            self.region_type
        )
    }
}
