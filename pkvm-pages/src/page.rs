// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::{AddressSpace, Phys};

/// Shift of the 4kB translation granule.
pub const PAGE_SHIFT: u64 = 12;
/// Size in bytes of the 4kB translation granule.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

// 48-bit output addresses with a 4kB granule.
const PFN_BITS: u64 = 36;
const PFN_MASK: u64 = (1 << PFN_BITS) - 1;

/// Sizes of the leaf mappings a 4-level, 4kB-granule translation regime can describe.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 4 * 1024,
    Size2M = 2 * 1024 * 1024,
    Size1G = 1024 * 1024 * 1024,
    Size512G = 512 * 1024 * 1024 * 1024,
}

impl PageSize {
    /// Checks if the given quantity is aligned to this page size.
    pub fn is_aligned(&self, val: u64) -> bool {
        (val & (*self as u64 - 1)) == 0
    }

    /// Rounds down the quantity to the nearest multiple of this page size.
    pub fn round_down(&self, val: u64) -> u64 {
        val & !(*self as u64 - 1)
    }
}

/// A raw address in an address space.
#[derive(Copy, Clone, Debug)]
pub struct RawAddr<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> RawAddr<AS> {
    pub fn new(addr: u64, address_space: AS) -> Self {
        Self(addr, address_space)
    }

    /// Returns the inner 64 address.
    pub fn bits(&self) -> u64 {
        self.0
    }

    fn checked_increment(&self, increment: u64) -> Option<Self> {
        let addr = self.0.checked_add(increment)?;
        Some(Self(addr, self.1))
    }
}

impl RawAddr<Phys> {
    pub fn phys(addr: u64) -> Self {
        Self(addr, Phys)
    }
}

pub type PhysAddr = RawAddr<Phys>;

impl<AS: AddressSpace> From<PageAddr<AS>> for RawAddr<AS> {
    fn from(p: PageAddr<AS>) -> RawAddr<AS> {
        p.addr
    }
}

impl<AS: AddressSpace> PartialEq for RawAddr<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<AS: AddressSpace> PartialOrd for RawAddr<AS> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

/// The address of a 4kB page. It is guaranteed to be aligned to a page boundary.
#[derive(Copy, Clone, Debug)]
pub struct PageAddr<AS: AddressSpace> {
    addr: RawAddr<AS>,
}

pub type PhysPageAddr = PageAddr<Phys>;

impl<AS: AddressSpace> PageAddr<AS> {
    /// Creates a `PageAddr` from a `RawAddr`, returning `None` if the address isn't aligned.
    pub fn new(addr: RawAddr<AS>) -> Option<Self> {
        PageSize::Size4k
            .is_aligned(addr.bits())
            .then_some(PageAddr { addr })
    }

    /// Creates a `PageAddr` from a `RawAddr`, rounding down to the nearest multiple of
    /// `alignment`.
    pub fn with_round_down(addr: RawAddr<AS>, alignment: PageSize) -> Self {
        Self {
            addr: RawAddr(alignment.round_down(addr.0), addr.1),
        }
    }

    /// Gets the raw bits of the page address.
    pub fn bits(&self) -> u64 {
        self.addr.0
    }

    /// Returns if this address is aligned to the given page size.
    pub fn is_aligned(&self, alignment: PageSize) -> bool {
        alignment.is_aligned(self.addr.0)
    }

    /// Iterates from this address in 4kB steps.
    pub fn iter_from(&self) -> PageAddrIter<AS> {
        PageAddrIter { next: Some(*self) }
    }

    /// Gets the pfn of the page address.
    pub fn pfn(&self) -> Pfn<AS> {
        Pfn((self.addr.0 >> PAGE_SHIFT) & PFN_MASK, self.addr.1)
    }

    /// Adds `n` 4kB pages to the current address.
    pub fn checked_add_pages(&self, n: u64) -> Option<Self> {
        n.checked_mul(PAGE_SIZE)
            .and_then(|inc| self.addr.checked_increment(inc))
            .map(|addr| Self { addr })
    }

    /// Gets the index of the page in the system (the linear page count from address 0).
    pub fn index(&self) -> usize {
        self.pfn().bits() as usize
    }
}

impl PageAddr<Phys> {
    /// Creates a physical page address from a raw address, returning `None` if unaligned.
    pub fn phys(addr: u64) -> Option<Self> {
        Self::new(RawAddr::phys(addr))
    }
}

impl<AS: AddressSpace> PartialEq for PageAddr<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<AS: AddressSpace> Eq for PageAddr<AS> {}

impl<AS: AddressSpace> PartialOrd for PageAddr<AS> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        self.addr.partial_cmp(&other.addr)
    }
}

/// Walks consecutive 4kB pages until the end of the address space.
pub struct PageAddrIter<AS: AddressSpace> {
    next: Option<PageAddr<AS>>,
}

impl<AS: AddressSpace> Iterator for PageAddrIter<AS> {
    type Item = PageAddr<AS>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next;
        if let Some(n) = self.next {
            self.next = n.checked_add_pages(1);
        }
        next
    }
}

/// The page number of a page.
#[derive(Copy, Clone, Debug)]
pub struct Pfn<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> Pfn<AS> {
    /// Returns the raw bits of the page number.
    pub fn bits(&self) -> u64 {
        self.0
    }
}

impl Pfn<Phys> {
    /// Creates a PFN from raw bits.
    pub fn phys(bits: u64) -> Self {
        Pfn(bits, Phys)
    }

    /// Returns the base physical address of the frame.
    pub fn addr(&self) -> PhysPageAddr {
        PageAddr {
            addr: RawAddr::phys(self.0 << PAGE_SHIFT),
        }
    }
}

impl<AS: AddressSpace> PartialEq for Pfn<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

pub type PhysPfn = Pfn<Phys>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_phys() {
        assert!(PhysPageAddr::new(RawAddr::phys(0x01)).is_none());
        assert!(PhysPageAddr::new(RawAddr::phys(0x1000)).is_some());
        let addr = PhysPageAddr::phys(0x20_0000).unwrap();
        assert!(addr.is_aligned(PageSize::Size2M));
        assert!(!addr.is_aligned(PageSize::Size1G));
    }

    #[test]
    fn round_down() {
        assert_eq!(
            PageAddr::with_round_down(RawAddr::phys(0x4567_9521), PageSize::Size4k).bits(),
            0x4567_9000
        );
        assert_eq!(
            PageAddr::with_round_down(RawAddr::phys(0x4567_9521), PageSize::Size2M).bits(),
            0x4560_0000
        );
    }

    #[test]
    fn page_iter() {
        let addr = PhysPageAddr::phys(0).unwrap();
        let mut addrs = addr.iter_from();
        assert_eq!(addrs.next(), Some(addr));
        assert_eq!(addrs.next(), PhysPageAddr::phys(4096));
        assert_eq!(addrs.next(), PhysPageAddr::phys(8192));

        // Stops at the end of the address space.
        let last = PhysPageAddr::phys(0_u64.wrapping_sub(4096)).unwrap();
        let mut addrs = last.iter_from();
        assert_eq!(addrs.next(), Some(last));
        assert_eq!(addrs.next(), None);
    }

    #[test]
    fn pfn_to_addr() {
        let pfn = Pfn::phys(0x8_0123);
        assert_eq!(pfn.addr().bits(), 0x8_0123_000);
        assert_eq!(pfn.addr().pfn(), pfn);
        assert_eq!(pfn.addr().index(), 0x8_0123);
    }
}
