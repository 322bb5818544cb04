// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Translation tables for the protected-memory hypervisor.
//!
//! ## Key types
//!
//! - `PageTable` is a generic 4-level, 4kB-granule tree. Its nodes come from a `PagePool`
//!   provided by the `page-tracking` crate and are returned there when the tree shrinks.
//! - `Pte` is a single entry: a translation, a pointer to the next level, or an invalid entry that
//!   may carry an owner or MMIO-guard annotation.
//! - `PtePolicy` decides when block mappings are allowed and which entries keep a node alive.
//!   `HostS2Policy`, `GuestS2Policy` and `HypS1Policy` are the policies of the three kinds of
//!   tree in the system.
//!
//! The tables are a model of the hardware format: entries are typed values, not raw descriptors,
//! and nodes are held by the tree itself rather than written into the backing pages.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

mod page_table;
mod policy;
mod prot;
/// Entry and level definitions.
mod pte;
/// Provides stubs for test harnesses.
#[cfg(test)]
mod test_stubs;

pub use page_table::Error as PageTableError;
pub use page_table::Result as PageTableResult;
pub use page_table::{collect_leaves, max_table_pages, PageTable, PtePolicy, WalkCtx, WalkFlags};
pub use policy::{
    GuestS2PageTable, GuestS2Policy, HostS2PageTable, HostS2Policy, HypS1PageTable, HypS1Policy,
};
pub use prot::{
    default_host_prot, page_hyp, page_hyp_device, prot_from_bits, prot_rwx, Prot, ProtSet,
};
pub use pte::{Level, Pte, ENTRIES_PER_TABLE};
