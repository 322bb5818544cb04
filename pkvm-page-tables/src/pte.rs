// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use pkvm_pages::{OwnerId, PageSize, PageState, PhysPageAddr, PAGE_SHIFT};

use crate::ProtSet;

/// Number of entries in one page-table node with a 4kB granule.
pub const ENTRIES_PER_TABLE: usize = 512;
const TABLE_INDEX_BITS: u64 = 9;

/// The deepest level, where every entry maps a single 4kB page.
const LAST_LEVEL: u8 = 3;

/// A level of a 4-level, 4kB-granule translation table. Level 0 is the topmost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Level(u8);

impl Level {
    /// The level whose entries map single pages.
    pub const LAST: Level = Level(LAST_LEVEL);

    /// Returns level `level`, if it exists.
    pub fn new(level: u8) -> Option<Self> {
        (level <= LAST_LEVEL).then_some(Self(level))
    }

    /// Returns the first level needed to translate an input address space of `ia_bits` bits.
    pub fn start_for_ia_bits(ia_bits: u32) -> Option<Self> {
        let ia_bits = ia_bits as u64;
        if !(PAGE_SHIFT + 1..=PAGE_SHIFT + 4 * TABLE_INDEX_BITS).contains(&ia_bits) {
            return None;
        }
        let levels = (ia_bits - PAGE_SHIFT + TABLE_INDEX_BITS - 1) / TABLE_INDEX_BITS;
        Some(Self(LAST_LEVEL + 1 - levels as u8))
    }

    /// Returns the size mapped by one entry at this level.
    pub fn leaf_page_size(&self) -> PageSize {
        match self.0 {
            0 => PageSize::Size512G,
            1 => PageSize::Size1G,
            2 => PageSize::Size2M,
            _ => PageSize::Size4k,
        }
    }

    /// Returns the size mapped by one entry at this level in bytes.
    pub fn granule(&self) -> u64 {
        self.leaf_page_size() as u64
    }

    fn shift(&self) -> u64 {
        PAGE_SHIFT + TABLE_INDEX_BITS * (LAST_LEVEL - self.0) as u64
    }

    /// Returns the index into a node at this level selected by `addr`.
    pub fn index(&self, addr: u64) -> usize {
        ((addr >> self.shift()) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    /// Returns the next level down, or `None` at the last level.
    pub fn next(&self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    /// Returns true if entries at this level map single pages.
    pub fn is_last(&self) -> bool {
        self.0 == LAST_LEVEL
    }

    /// Returns true if a block mapping may be installed at this level.
    pub fn block_allowed(&self) -> bool {
        self.0 == 1 || self.0 == 2
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// One translation-table entry.
///
/// Invalid entries can carry an annotation instead of a translation: the id of the party owning
/// the range, or a note that the range is guarded MMIO. The empty entry is an invalid entry owned
/// by the host with no note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pte {
    Invalid { owner_id: OwnerId, mmio_note: bool },
    Leaf {
        phys: u64,
        prot: ProtSet,
        state: PageState,
    },
    Table(PhysPageAddr),
}

impl Pte {
    pub const EMPTY: Pte = Pte::Invalid {
        owner_id: OwnerId::HOST,
        mmio_note: false,
    };

    /// Returns an annotation recording `owner_id` as the owner of the range.
    pub fn owned_by(owner_id: OwnerId) -> Self {
        Pte::Invalid {
            owner_id,
            mmio_note: false,
        }
    }

    /// Returns an annotation marking the range as guarded MMIO.
    pub fn mmio_guard() -> Self {
        Pte::Invalid {
            owner_id: OwnerId::HOST,
            mmio_note: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Returns true for entries that translate or point at a table.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Pte::Invalid { .. })
    }

    /// Returns true for valid leaf entries.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Pte::Leaf { .. })
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Pte::Table(_))
    }

    /// Returns the owner recorded in an annotation. Valid entries and empty entries report the
    /// host.
    pub fn owner_id(&self) -> OwnerId {
        match self {
            Pte::Invalid { owner_id, .. } => *owner_id,
            _ => OwnerId::HOST,
        }
    }

    /// Returns true if this is an MMIO-guard annotation.
    pub fn is_mmio_note(&self) -> bool {
        matches!(self, Pte::Invalid { mmio_note: true, .. })
    }

    /// Returns the sharing state recorded in a leaf.
    pub fn state(&self) -> Option<PageState> {
        match self {
            Pte::Leaf { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn prot(&self) -> Option<ProtSet> {
        match self {
            Pte::Leaf { prot, .. } => Some(*prot),
            _ => None,
        }
    }

    /// Returns the output address for `addr` when this leaf maps it at `level`.
    pub fn output_addr(&self, addr: u64, level: Level) -> Option<u64> {
        match self {
            Pte::Leaf { phys, .. } => Some(phys + (addr & (level.granule() - 1))),
            _ => None,
        }
    }

    /// Returns the entry for the `index`th child when an entry at `level` is split into a table.
    pub(crate) fn child(&self, index: usize, level: Level) -> Pte {
        match *self {
            Pte::Leaf { phys, prot, state } => {
                let child_size = level.next().map_or(0, |l| l.granule());
                Pte::Leaf {
                    phys: phys + index as u64 * child_size,
                    prot,
                    state,
                }
            }
            other => other,
        }
    }
}

impl Default for Pte {
    fn default() -> Self {
        Self::EMPTY
    }
}
