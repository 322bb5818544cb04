// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use flagset::{flags, FlagSet};

flags! {
    /// Attribute bits of a leaf mapping.
    #[repr(u16)]
    pub enum Prot: u16 {
        R = 1,
        W = 2,
        X = 4,
        /// Device-nGnRE memory attributes.
        Device = 8,
        /// Normal non-cacheable memory attributes.
        NormalNc = 16,
        /// Privileged execute-never.
        Pxn = 32,
        /// Unprivileged execute-never.
        Uxn = 64,
    }
}

/// A set of `Prot` bits.
pub type ProtSet = FlagSet<Prot>;

/// Read, write and execute.
pub fn prot_rwx() -> ProtSet {
    Prot::R | Prot::W | Prot::X
}

/// Default hypervisor stage-1 prot for memory.
pub fn page_hyp() -> ProtSet {
    Prot::R | Prot::W
}

/// Default hypervisor stage-1 prot for MMIO.
pub fn page_hyp_device() -> ProtSet {
    Prot::R | Prot::W | Prot::Device
}

/// Default host stage-2 prot for RAM (`is_memory`) or MMIO.
pub fn default_host_prot(is_memory: bool) -> ProtSet {
    if is_memory {
        prot_rwx()
    } else {
        Prot::R | Prot::W | Prot::Device
    }
}

/// Parses raw prot bits, rejecting any bit outside the known set.
pub fn prot_from_bits(bits: u16) -> Option<ProtSet> {
    FlagSet::new(bits).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bits() {
        assert_eq!(prot_from_bits(0x7), Some(prot_rwx()));
        assert_eq!(prot_from_bits(0), Some(ProtSet::default()));
        assert_eq!(
            prot_from_bits(0x7f).map(|p| p.bits()),
            Some(0x7f),
        );
        assert!(prot_from_bits(0x80).is_none());
        assert!(prot_from_bits(0x101).is_none());
    }

    #[test]
    fn defaults() {
        assert!(default_host_prot(true).contains(Prot::X));
        assert!(default_host_prot(false).contains(Prot::Device));
        assert!(!default_host_prot(false).contains(Prot::X));
        assert!(prot_rwx().contains(page_hyp()));
    }
}
