// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Physical page vocabulary for the protected-memory hypervisor
//!
//! - `PageAddr` / `RawAddr` / `Pfn` are physical addresses, tagged with their address space so
//!   they can't be mixed up with guest IPAs, which are plain `u64`s.
//! - `OwnerId` names the party that owns a page: the host, the hypervisor, a guest or the
//!   "protected" sentinel used for module-owned memory.
//! - `PageState` is the sharing state of a page as seen from one owner's page table.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod memory_type;
mod owner_id;
mod page;
mod page_state;

pub use memory_type::MemType;
pub use owner_id::{AddressSpace, OwnerId, Phys};
pub use page::*;
pub use page_state::{PageState, PageStateFlag};
