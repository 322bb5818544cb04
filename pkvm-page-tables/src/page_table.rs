// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use flagset::FlagSet;
use page_tracking::PagePool;
use pkvm_pages::{PageSize, PageState, PhysPageAddr};

use crate::pte::{Level, Pte, ENTRIES_PER_TABLE};
use crate::{prot_rwx, Prot, ProtSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page pool ran out of pages for table nodes.
    InsufficientPtePages,
    /// The range is unaligned or empty.
    Misaligned,
    /// The range doesn't fit in the input address space.
    OutOfBounds,
    /// The input address size can't be described by this format.
    UnsupportedIaBits(u32),
    /// No valid leaf maps the address.
    NotMapped,
    /// Only invalid entries can be used as annotations.
    NotAnnotation,
    /// A table entry points at a node the tree doesn't hold.
    MissingTable(u64),
}
pub type Result<T> = core::result::Result<T, Error>;

/// Per-tree behaviour of the generic table code.
pub trait PtePolicy {
    /// Returns true if `[addr, end)` must be mapped with single pages when installed with `prot`.
    fn force_pte(&self, addr: u64, end: u64, prot: ProtSet) -> bool;

    /// Returns true if a non-empty, non-table `pte` at `level` should keep its node alive.
    fn pte_is_counted(&self, pte: &Pte, level: Level) -> bool;
}

/// Which kinds of entries a `walk()` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WalkFlags {
    /// Every non-table entry, valid or not.
    Leaf = 1,
    /// Table entries, before descending into them.
    TablePre = 2,
    /// Table entries, after their subtree was visited.
    TablePost = 4,
}

impl WalkFlags {
    fn is_set(self, flags: u8) -> bool {
        flags & self as u8 != 0
    }
}

/// An entry reported by `walk()`.
#[derive(Clone, Copy, Debug)]
pub struct WalkCtx {
    /// First input address covered by the entry.
    pub addr: u64,
    /// The entry's level.
    pub level: Level,
    pub pte: Pte,
}

impl WalkCtx {
    /// Returns the end of the input range covered by the entry.
    pub fn end(&self) -> u64 {
        self.addr + self.level.granule()
    }
}

/// One node of the tree.
struct TableNode {
    entries: [Pte; ENTRIES_PER_TABLE],
    // Number of counted entries, see `PtePolicy::pte_is_counted`.
    live: u16,
}

impl TableNode {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: [Pte::EMPTY; ENTRIES_PER_TABLE],
            live: 0,
        })
    }
}

/// What `install()` writes into the covered entries.
#[derive(Clone, Copy)]
enum Install {
    Leaf {
        phys: u64,
        prot: ProtSet,
        state: PageState,
    },
    Annotation(Pte),
}

impl Install {
    fn prot(&self) -> ProtSet {
        match self {
            Install::Leaf { prot, .. } => *prot,
            Install::Annotation(_) => FlagSet::default(),
        }
    }

    fn pte_for(&self, offset: u64) -> Pte {
        match *self {
            Install::Leaf { phys, prot, state } => Pte::Leaf {
                phys: phys + offset,
                prot,
                state,
            },
            Install::Annotation(pte) => pte,
        }
    }

    fn aligned(&self, offset: u64, granule: u64) -> bool {
        match self {
            Install::Leaf { phys, .. } => (phys + offset) & (granule - 1) == 0,
            Install::Annotation(_) => true,
        }
    }
}

/// A multi-level translation table with a 4kB granule.
///
/// Nodes are held by the tree and keyed by the address of the pool page backing them, so every
/// node accounts for exactly one page taken from a `PagePool`. Callers pass the pool in for any
/// operation that may need to allocate or release nodes.
pub struct PageTable<P: PtePolicy> {
    root: PhysPageAddr,
    nodes: BTreeMap<u64, Box<TableNode>>,
    start_level: Level,
    ia_bits: u32,
    policy: P,
}

impl<P: PtePolicy> PageTable<P> {
    /// Creates an empty tree translating `ia_bits` of input address, taking the root node from
    /// `pool`.
    pub fn new(ia_bits: u32, policy: P, pool: &mut PagePool) -> Result<Self> {
        let start_level =
            Level::start_for_ia_bits(ia_bits).ok_or(Error::UnsupportedIaBits(ia_bits))?;
        let root = pool.alloc().ok_or(Error::InsufficientPtePages)?;
        let mut nodes = BTreeMap::new();
        nodes.insert(root.bits(), TableNode::new());
        Ok(Self {
            root,
            nodes,
            start_level,
            ia_bits,
            policy,
        })
    }

    /// Returns the address of the root node.
    pub fn root(&self) -> PhysPageAddr {
        self.root
    }

    pub fn start_level(&self) -> Level {
        self.start_level
    }

    pub fn ia_bits(&self) -> u32 {
        self.ia_bits
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Returns the number of nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the addresses of the pages backing the nodes.
    pub fn node_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }

    /// Returns an upper bound on the nodes that mapping or annotating `[addr, addr + size)` can
    /// allocate, given the tables already in the tree.
    pub fn nodes_needed(&self, addr: u64, size: u64) -> Result<usize> {
        let end = self.check_range(addr, size)?;
        self.nodes_needed_in(self.root.bits(), self.start_level, addr, end)
    }

    /// Maps `[addr, addr + size)` to `phys` with `prot`, recording `state` in the leaves. Block
    /// mappings are used where alignment and the tree's policy allow.
    pub fn map(
        &mut self,
        addr: u64,
        size: u64,
        phys: u64,
        prot: ProtSet,
        state: PageState,
        pool: &mut PagePool,
    ) -> Result<()> {
        self.install(addr, size, Install::Leaf { phys, prot, state }, pool)
    }

    /// Replaces the entries for `[addr, addr + size)` with the invalid entry `annotation`.
    pub fn annotate(
        &mut self,
        addr: u64,
        size: u64,
        annotation: Pte,
        pool: &mut PagePool,
    ) -> Result<()> {
        if annotation.is_valid() {
            return Err(Error::NotAnnotation);
        }
        self.install(addr, size, Install::Annotation(annotation), pool)
    }

    /// Clears every entry, valid or annotated, in `[addr, addr + size)` and frees nodes left with
    /// nothing counted in them.
    pub fn unmap(&mut self, addr: u64, size: u64, pool: &mut PagePool) -> Result<()> {
        let end = self.check_range(addr, size)?;
        self.clear_range(self.root, self.start_level, 0, addr, end, false, pool)
    }

    /// Drops the leaves in `[addr, addr + size)` the policy doesn't count, then frees every node
    /// with nothing counted in it.
    pub fn reclaim_leaves(&mut self, addr: u64, size: u64, pool: &mut PagePool) -> Result<()> {
        let end = self.check_range(addr, size)?;
        self.clear_range(self.root, self.start_level, 0, addr, end, true, pool)
    }

    /// Returns the entry translating `addr` and its level.
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, Level)> {
        if addr >= self.ia_size() {
            return Err(Error::OutOfBounds);
        }
        let mut table = self.root.bits();
        let mut level = self.start_level;
        loop {
            let pte = self.node(table)?.entries[level.index(addr)];
            match (pte, level.next()) {
                (Pte::Table(child), Some(next)) => {
                    table = child.bits();
                    level = next;
                }
                _ => return Ok((pte, level)),
            }
        }
    }

    /// Calls `visitor` for the entries covering `[addr, addr + size)` selected by `flags` (a mask
    /// of `WalkFlags`). An error from the visitor stops the walk and is returned.
    pub fn walk<E, F>(
        &self,
        addr: u64,
        size: u64,
        flags: u8,
        mut visitor: F,
    ) -> core::result::Result<(), E>
    where
        F: FnMut(&WalkCtx) -> core::result::Result<(), E>,
        E: From<Error>,
    {
        let end = self.check_range(addr, size)?;
        self.walk_node(
            self.root.bits(),
            self.start_level,
            0,
            addr,
            end,
            flags,
            &mut visitor,
        )
    }

    /// Adds the `R`, `W` and `X` bits of `prot` to the leaf mapping `addr`.
    pub fn relax_perms(&mut self, addr: u64, prot: ProtSet) -> Result<()> {
        let (table, index, level) = self.leaf_slot(addr)?;
        match self.node(table)?.entries[index] {
            Pte::Leaf {
                phys,
                prot: old,
                state,
            } => {
                let new = Pte::Leaf {
                    phys,
                    prot: old | (prot & prot_rwx()),
                    state,
                };
                self.set_entry(table, index, level, new)
            }
            _ => Err(Error::NotMapped),
        }
    }

    /// Clears write permission from every valid leaf in `[addr, addr + size)`.
    pub fn wrprotect(&mut self, addr: u64, size: u64) -> Result<()> {
        let end = self.check_range(addr, size)?;
        self.update_leaves(self.root.bits(), self.start_level, 0, addr, end, &mut |pte| {
            if let Pte::Leaf { prot, .. } = pte {
                *prot -= Prot::W;
            }
        })
    }

    /// Sets the recorded sharing state of every valid leaf in `[addr, addr + size)`.
    pub fn set_leaf_state(&mut self, addr: u64, size: u64, new_state: PageState) -> Result<()> {
        let end = self.check_range(addr, size)?;
        self.update_leaves(self.root.bits(), self.start_level, 0, addr, end, &mut |pte| {
            if let Pte::Leaf { state, .. } = pte {
                *state = new_state;
            }
        })
    }

    /// Frees every node, root included, back to `pool`.
    pub fn destroy(self, pool: &mut PagePool) {
        for addr in self.nodes.into_keys() {
            // Keys are pool page addresses and so always aligned.
            if let Some(page) = PhysPageAddr::phys(addr) {
                pool.free(page);
            }
        }
    }

    fn ia_size(&self) -> u64 {
        1u64 << self.ia_bits
    }

    fn check_range(&self, addr: u64, size: u64) -> Result<u64> {
        if !PageSize::Size4k.is_aligned(addr) || !PageSize::Size4k.is_aligned(size) || size == 0 {
            return Err(Error::Misaligned);
        }
        let end = addr.checked_add(size).ok_or(Error::OutOfBounds)?;
        if end > self.ia_size() {
            return Err(Error::OutOfBounds);
        }
        Ok(end)
    }

    fn node(&self, table: u64) -> Result<&TableNode> {
        self.nodes
            .get(&table)
            .map(|n| n.as_ref())
            .ok_or(Error::MissingTable(table))
    }

    fn node_mut(&mut self, table: u64) -> Result<&mut TableNode> {
        self.nodes
            .get_mut(&table)
            .map(|n| n.as_mut())
            .ok_or(Error::MissingTable(table))
    }

    fn is_counted(&self, pte: &Pte, level: Level) -> bool {
        match pte {
            Pte::Table(_) => true,
            p if p.is_empty() => false,
            p => self.policy.pte_is_counted(p, level),
        }
    }

    /// Writes `new` into slot `index` of `table`, keeping the node's live count in step.
    fn set_entry(&mut self, table: u64, index: usize, level: Level, new: Pte) -> Result<()> {
        let old = self.node(table)?.entries[index];
        let was_counted = self.is_counted(&old, level);
        let counted = self.is_counted(&new, level);
        let node = self.node_mut(table)?;
        node.entries[index] = new;
        match (was_counted, counted) {
            (false, true) => node.live += 1,
            (true, false) => node.live -= 1,
            _ => (),
        }
        Ok(())
    }

    /// Allocates a node for the entries beneath `pte`, a non-table entry at `level`. A non-empty
    /// `pte` is replicated into every child so the split preserves what it described.
    fn split(&mut self, pte: Pte, level: Level, pool: &mut PagePool) -> Result<PhysPageAddr> {
        let page = pool.alloc().ok_or(Error::InsufficientPtePages)?;
        let mut node = TableNode::new();
        if !pte.is_empty() {
            let child_level = level.next().ok_or(Error::Misaligned)?;
            for (i, entry) in node.entries.iter_mut().enumerate() {
                *entry = pte.child(i, level);
            }
            let live = node
                .entries
                .iter()
                .filter(|e| self.is_counted(e, child_level))
                .count();
            node.live = live as u16;
        }
        self.nodes.insert(page.bits(), node);
        Ok(page)
    }

    /// Removes the subtree rooted at `table` and returns its pages to `pool`.
    fn free_subtree(&mut self, table: u64, pool: &mut PagePool) {
        if let Some(node) = self.nodes.remove(&table) {
            for entry in node.entries.iter() {
                if let Pte::Table(child) = entry {
                    self.free_subtree(child.bits(), pool);
                }
            }
            if let Some(page) = PhysPageAddr::phys(table) {
                pool.free(page);
            }
        }
    }

    fn install(&mut self, addr: u64, size: u64, what: Install, pool: &mut PagePool) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let force_pte = self.policy.force_pte(addr, end, what.prot());
        let mut cur = addr;
        while cur < end {
            cur += self.install_one(cur, addr, end, &what, force_pte, pool)?;
        }
        Ok(())
    }

    /// Installs the entry covering `cur` at the highest level that fits and returns the number of
    /// bytes it covers.
    fn install_one(
        &mut self,
        cur: u64,
        base: u64,
        end: u64,
        what: &Install,
        force_pte: bool,
        pool: &mut PagePool,
    ) -> Result<u64> {
        let mut table = self.root.bits();
        let mut level = self.start_level;
        loop {
            let index = level.index(cur);
            let granule = level.granule();
            let fits = (level.block_allowed() && !force_pte)
                && cur & (granule - 1) == 0
                && cur + granule <= end
                && what.aligned(cur - base, granule);
            let old = self.node(table)?.entries[index];
            if level.is_last() || fits {
                self.set_entry(table, index, level, what.pte_for(cur - base))?;
                if let Pte::Table(child) = old {
                    self.free_subtree(child.bits(), pool);
                }
                return Ok(granule);
            }
            let next = level.next().ok_or(Error::Misaligned)?;
            let child = match old {
                Pte::Table(child) => child,
                other => {
                    let child = self.split(other, level, pool)?;
                    self.set_entry(table, index, level, Pte::Table(child))?;
                    child
                }
            };
            table = child.bits();
            level = next;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn clear_range(
        &mut self,
        table: PhysPageAddr,
        level: Level,
        base: u64,
        start: u64,
        end: u64,
        only_uncounted: bool,
        pool: &mut PagePool,
    ) -> Result<()> {
        let granule = level.granule();
        let first = ((start - base) / granule) as usize;
        let last = ((end - 1 - base) / granule) as usize;
        for index in first..=last.min(ENTRIES_PER_TABLE - 1) {
            let entry_start = base + index as u64 * granule;
            let entry_end = entry_start + granule;
            let covered = start <= entry_start && entry_end <= end;
            let old = self.node(table.bits())?.entries[index];
            let child = match old {
                Pte::Table(child) => Some(child),
                p if p.is_empty() => None,
                p if only_uncounted => {
                    if covered && !self.is_counted(&p, level) {
                        self.set_entry(table.bits(), index, level, Pte::EMPTY)?;
                    }
                    None
                }
                _ if covered => {
                    self.set_entry(table.bits(), index, level, Pte::EMPTY)?;
                    None
                }
                p => {
                    let child = self.split(p, level, pool)?;
                    self.set_entry(table.bits(), index, level, Pte::Table(child))?;
                    Some(child)
                }
            };
            if let (Some(child), Some(next)) = (child, level.next()) {
                self.clear_range(
                    child,
                    next,
                    entry_start,
                    start.max(entry_start),
                    end.min(entry_end),
                    only_uncounted,
                    pool,
                )?;
                if self.node(child.bits())?.live == 0 {
                    self.set_entry(table.bits(), index, level, Pte::EMPTY)?;
                    self.free_subtree(child.bits(), pool);
                }
            }
        }
        Ok(())
    }

    fn update_leaves(
        &mut self,
        table: u64,
        level: Level,
        base: u64,
        start: u64,
        end: u64,
        f: &mut dyn FnMut(&mut Pte),
    ) -> Result<()> {
        let granule = level.granule();
        let first = ((start - base) / granule) as usize;
        let last = ((end - 1 - base) / granule) as usize;
        for index in first..=last.min(ENTRIES_PER_TABLE - 1) {
            let entry_start = base + index as u64 * granule;
            match self.node(table)?.entries[index] {
                Pte::Table(child) => {
                    if let Some(next) = level.next() {
                        self.update_leaves(
                            child.bits(),
                            next,
                            entry_start,
                            start.max(entry_start),
                            end.min(entry_start + granule),
                            f,
                        )?;
                    }
                }
                mut pte @ Pte::Leaf { .. } => {
                    f(&mut pte);
                    self.set_entry(table, index, level, pte)?;
                }
                Pte::Invalid { .. } => (),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_node<E, F>(
        &self,
        table: u64,
        level: Level,
        base: u64,
        start: u64,
        end: u64,
        flags: u8,
        visitor: &mut F,
    ) -> core::result::Result<(), E>
    where
        F: FnMut(&WalkCtx) -> core::result::Result<(), E>,
        E: From<Error>,
    {
        let granule = level.granule();
        let first = ((start - base) / granule) as usize;
        let last = ((end - 1 - base) / granule) as usize;
        let node = self.node(table)?;
        for index in first..=last.min(ENTRIES_PER_TABLE - 1) {
            let entry_start = base + index as u64 * granule;
            let ctx = WalkCtx {
                addr: entry_start,
                level,
                pte: node.entries[index],
            };
            match (ctx.pte, level.next()) {
                (Pte::Table(child), Some(next)) => {
                    if WalkFlags::TablePre.is_set(flags) {
                        visitor(&ctx)?;
                    }
                    self.walk_node(
                        child.bits(),
                        next,
                        entry_start,
                        start.max(entry_start),
                        end.min(entry_start + granule),
                        flags,
                        visitor,
                    )?;
                    if WalkFlags::TablePost.is_set(flags) {
                        visitor(&ctx)?;
                    }
                }
                _ => {
                    if WalkFlags::Leaf.is_set(flags) {
                        visitor(&ctx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn nodes_needed_in(&self, table: u64, level: Level, addr: u64, end: u64) -> Result<usize> {
        let next = match level.next() {
            Some(next) => next,
            None => return Ok(0),
        };
        let node = self.node(table)?;
        let granule = level.granule();
        let mut needed = 0;
        let mut cur = addr;
        while cur < end {
            let slot_end = ((cur & !(granule - 1)) + granule).min(end);
            needed += match node.entries[level.index(cur)] {
                Pte::Table(child) => self.nodes_needed_in(child.bits(), next, cur, slot_end)?,
                _ => fresh_nodes(level, cur, slot_end),
            };
            cur = slot_end;
        }
        Ok(needed)
    }

    /// Returns the node, index and level of the entry translating `addr`.
    fn leaf_slot(&self, addr: u64) -> Result<(u64, usize, Level)> {
        if addr >= self.ia_size() {
            return Err(Error::OutOfBounds);
        }
        let mut table = self.root.bits();
        let mut level = self.start_level;
        loop {
            let index = level.index(addr);
            match (self.node(table)?.entries[index], level.next()) {
                (Pte::Table(child), Some(next)) => {
                    table = child.bits();
                    level = next;
                }
                _ => return Ok((table, index, level)),
            }
        }
    }
}

// Nodes needed to split a non-table entry at `level` down to single pages over `[addr, end)`.
fn fresh_nodes(level: Level, addr: u64, end: u64) -> usize {
    let mut nodes = 0;
    let mut level = level;
    while let Some(next) = level.next() {
        let granule = level.granule();
        nodes += ((end - 1) / granule - addr / granule + 1) as usize;
        level = next;
    }
    nodes
}

/// Returns an upper bound on the number of table nodes needed to map `nr_pages` pages with single
/// page entries, root excluded.
pub fn max_table_pages(nr_pages: u64) -> u64 {
    let mut total = 0;
    let mut entries = nr_pages;
    for _ in 0..3 {
        entries = (entries + ENTRIES_PER_TABLE as u64 - 1) / ENTRIES_PER_TABLE as u64;
        total += entries;
    }
    total
}

/// Returns the leaves of `pgt` in `[addr, addr + size)` that are valid mappings.
pub fn collect_leaves<P: PtePolicy>(
    pgt: &PageTable<P>,
    addr: u64,
    size: u64,
) -> Result<Vec<WalkCtx>> {
    let mut leaves = Vec::new();
    pgt.walk(addr, size, WalkFlags::Leaf as u8, |ctx| {
        if ctx.pte.is_leaf() {
            leaves.push(*ctx);
        }
        Ok::<(), Error>(())
    })?;
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use pkvm_pages::OwnerId;

    const MB2: u64 = 0x20_0000;

    #[test]
    fn map_uses_blocks() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::blocks(), &mut pool).unwrap();
        pgt.map(0x4000_0000, 2 * MB2, 0x8000_0000, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        let (pte, level) = pgt.get_leaf(0x4020_1000).unwrap();
        assert_eq!(level.raw(), 2);
        assert_eq!(pte.output_addr(0x4020_1000, level), Some(0x8020_1000));
        // root + level 1 + level 2 node.
        assert_eq!(pgt.num_nodes(), 3);
    }

    #[test]
    fn forced_pages() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        pgt.map(0, MB2, 0x8000_0000, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        let (_, level) = pgt.get_leaf(0x1000).unwrap();
        assert!(level.is_last());
        assert_eq!(pgt.num_nodes(), 4);
    }

    #[test]
    fn misaligned_phys_falls_back_to_pages() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::blocks(), &mut pool).unwrap();
        pgt.map(0, MB2, 0x8000_1000, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        let (pte, level) = pgt.get_leaf(0x3000).unwrap();
        assert!(level.is_last());
        assert_eq!(pte.output_addr(0x3000, level), Some(0x8000_4000));
    }

    #[test]
    fn annotate_splits_block() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::blocks(), &mut pool).unwrap();
        pgt.map(0, MB2, 0, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        let nodes = pgt.num_nodes();
        pgt.annotate(0x5000, 0x1000, Pte::owned_by(OwnerId::HYP), &mut pool)
            .unwrap();
        assert_eq!(pgt.num_nodes(), nodes + 1);
        let (pte, level) = pgt.get_leaf(0x5000).unwrap();
        assert!(level.is_last());
        assert_eq!(pte.owner_id(), OwnerId::HYP);
        // Neighbours keep the block's translation.
        let (pte, level) = pgt.get_leaf(0x6000).unwrap();
        assert_eq!(pte.output_addr(0x6000, level), Some(0x6000));
        assert!(pgt
            .annotate(0, 0x1000, Pte::Table(PhysPageAddr::phys(0).unwrap()), &mut pool)
            .is_err_and(|e| e == Error::NotAnnotation));
    }

    #[test]
    fn unmap_frees_nodes() {
        let mut pool = stub_pool(16);
        let free_before = pool.len();
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        pgt.map(0x1000, 0x3000, 0x9000, Prot::R | Prot::W, PageState::owned(), &mut pool)
            .unwrap();
        assert_eq!(pgt.num_nodes(), 4);
        pgt.unmap(0x2000, 0x1000, &mut pool).unwrap();
        assert!(pgt.get_leaf(0x2000).unwrap().0.is_empty());
        assert_eq!(pgt.num_nodes(), 4);
        pgt.unmap(0x1000, 0x3000, &mut pool).unwrap();
        assert_eq!(pgt.num_nodes(), 1);
        pgt.destroy(&mut pool);
        assert_eq!(pool.len(), free_before);
    }

    #[test]
    fn unmap_part_of_block() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::blocks(), &mut pool).unwrap();
        pgt.map(0, MB2, 0, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        pgt.unmap(0x1000, 0x1000, &mut pool).unwrap();
        assert!(pgt.get_leaf(0x1000).unwrap().0.is_empty());
        assert!(pgt.get_leaf(0x2000).unwrap().0.is_leaf());
        assert!(pgt.get_leaf(0).unwrap().0.is_leaf());
    }

    #[test]
    fn reclaim_drops_uncounted() {
        let mut pool = stub_pool(16);
        // Leaves mapped with RWX are not counted by the stub policy.
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        pgt.map(0, 0x4000, 0, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        pgt.annotate(0x4000, 0x1000, Pte::owned_by(OwnerId::HYP), &mut pool)
            .unwrap();
        pgt.reclaim_leaves(0, 0x10_0000, &mut pool).unwrap();
        assert!(pgt.get_leaf(0).unwrap().0.is_empty());
        assert_eq!(pgt.get_leaf(0x4000).unwrap().0.owner_id(), OwnerId::HYP);
        assert_eq!(pgt.num_nodes(), 4);

        pgt.unmap(0x4000, 0x1000, &mut pool).unwrap();
        pgt.map(0, 0x4000, 0, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        pgt.reclaim_leaves(0, 0x10_0000, &mut pool).unwrap();
        assert_eq!(pgt.num_nodes(), 1);
    }

    #[test]
    fn out_of_pool_pages() {
        let mut pool = stub_pool(2);
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        assert_eq!(
            pgt.map(0, 0x1000, 0, prot_rwx(), PageState::owned(), &mut pool),
            Err(Error::InsufficientPtePages)
        );
    }

    #[test]
    fn bounds_and_alignment() {
        let mut pool = stub_pool(4);
        let mut pgt = PageTable::new(32, StubPolicy::pages(), &mut pool).unwrap();
        assert_eq!(
            pgt.map(0x800, 0x1000, 0, prot_rwx(), PageState::owned(), &mut pool),
            Err(Error::Misaligned)
        );
        assert_eq!(
            pgt.map(1 << 32, 0x1000, 0, prot_rwx(), PageState::owned(), &mut pool),
            Err(Error::OutOfBounds)
        );
        assert_eq!(pgt.get_leaf(1 << 32).err(), Some(Error::OutOfBounds));
        assert_eq!(pgt.start_level().raw(), 1);
    }

    #[test]
    fn walk_flags() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        pgt.map(0, 0x2000, 0, Prot::R.into(), PageState::owned(), &mut pool)
            .unwrap();
        let mut leaves = 0;
        let mut tables = 0;
        pgt.walk(0, 0x4000, WalkFlags::Leaf as u8 | WalkFlags::TablePost as u8, |ctx| {
            if ctx.pte.is_table() {
                tables += 1;
            } else {
                leaves += 1;
            }
            Ok::<(), Error>(())
        })
        .unwrap();
        // Four level-3 entries (two mapped, two empty) and three table entries above them.
        assert_eq!(leaves, 4);
        assert_eq!(tables, 3);

        let res: Result<()> = pgt.walk(0, 0x4000, WalkFlags::Leaf as u8, |_| Err(Error::NotMapped));
        assert_eq!(res, Err(Error::NotMapped));
        assert_eq!(collect_leaves(&pgt, 0, 0x4000).unwrap().len(), 2);
    }

    #[test]
    fn perms() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        pgt.map(0, 0x2000, 0, Prot::R | Prot::W, PageState::shared_borrowed(), &mut pool)
            .unwrap();
        pgt.wrprotect(0, 0x2000).unwrap();
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0.prot(), Some(Prot::R.into()));
        pgt.relax_perms(0x1000, Prot::W | Prot::Device).unwrap();
        assert_eq!(
            pgt.get_leaf(0x1000).unwrap().0.prot(),
            Some(Prot::R | Prot::W)
        );
        assert_eq!(pgt.relax_perms(0x3000, Prot::W.into()), Err(Error::NotMapped));
        pgt.set_leaf_state(0, 0x1000, PageState::owned()).unwrap();
        assert_eq!(pgt.get_leaf(0).unwrap().0.state(), Some(PageState::owned()));
    }

    #[test]
    fn block_over_table_frees_subtree() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::blocks(), &mut pool).unwrap();
        pgt.map(0, 0x1000, 0, Prot::R.into(), PageState::owned(), &mut pool)
            .unwrap();
        assert_eq!(pgt.num_nodes(), 4);
        pgt.map(0, MB2, 0, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        assert_eq!(pgt.num_nodes(), 3);
    }

    #[test]
    fn nodes_needed_counts_missing_tables() {
        let mut pool = stub_pool(16);
        let mut pgt = PageTable::new(40, StubPolicy::pages(), &mut pool).unwrap();
        assert_eq!(pgt.nodes_needed(0x4000_0000, 0x1000), Ok(3));
        // Crosses a 2MB boundary: two leaf tables.
        assert_eq!(pgt.nodes_needed(0x401f_f000, 0x2000), Ok(4));
        pgt.map(0x4000_0000, 0x1000, 0x8000_0000, prot_rwx(), PageState::owned(), &mut pool)
            .unwrap();
        assert_eq!(pgt.num_nodes(), 4);
        assert_eq!(pgt.nodes_needed(0x4000_1000, 0x1000), Ok(0));
        assert_eq!(pgt.nodes_needed(0x401f_f000, 0x2000), Ok(1));
        assert_eq!(pgt.nodes_needed(0x8000_0000, 0x1000), Ok(2));
        assert_eq!(pgt.nodes_needed(0x4000_0001, 0x1000), Err(Error::Misaligned));
    }

    #[test]
    fn table_page_bound() {
        assert_eq!(max_table_pages(1), 3);
        assert_eq!(max_table_pages(512), 3);
        assert_eq!(max_table_pages(513), 4);
    }
}
