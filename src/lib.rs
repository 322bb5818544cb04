// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Memory ownership and stage-2 protection for a protected-KVM style hypervisor.
//!
//! Every physical page belongs to exactly one of the host, the hypervisor, a guest or a module,
//! and may additionally be shared with one borrower. `MemProtect` is the single owner of that
//! state. It keeps three kinds of view consistent with each other:
//!
//! - the host stage-2, an identity map whose invalid entries record who else owns a range, plus
//!   per-page metadata for RAM (`page-tracking`);
//! - the hypervisor's own stage-1;
//! - one stage-2 per guest, held in the VM table.
//!
//! Every transition first checks that all the views involved are in the expected state, with the
//! locks taken host first, then hyp, then the guest's. Only then does it mutate them. A mutation
//! that fails after its checks passed means the state can no longer be trusted, and the
//! hypervisor halts.
//!
//! Host accesses to memory it doesn't own end up in `MemProtect::handle_host_mem_abort()`, which
//! either maps the memory in lazily or reflects the fault back to the host kernel.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

mod coalesce;
mod config;
mod error;
mod guest_mem;
mod guest_vm;
mod handler_slot;
mod host_abort;
mod host_mmu;
mod hyp_mmu;
/// The host and guest call boundary.
pub mod hypercalls;
mod mem_protect;
mod modules;
mod per_cpu;
mod phys_mem;
mod ptdump;
mod setup;
/// Provides stubs for test harnesses.
#[cfg(test)]
mod test_stubs;
mod vm_table;

pub use config::MemProtectConfig;
pub use error::{Error, Result};
pub use guest_vm::{HypVm, Vcpu, VmParams};
pub use handler_slot::{HostIommuHandler, IllegalAbortNotifier, ModulePermFaultHandler};
pub use host_abort::{AbortOutcome, El1FaultRegs, HostCpuContext};
pub use mem_protect::MemProtect;
pub use phys_mem::PhysMem;
pub use ptdump::{PtdumpLogHeader, PtdumpOp, PtdumpRecord, INVALID_PTDUMP_PFN};
pub use vm_table::LoadedVcpu;
