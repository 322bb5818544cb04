// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The call boundary the host kernel and guests reach the memory protection layer through. Every
//! call completes with an errno-style status and, for calls that produce one, a value.

use log::trace;
use pkvm_page_tables::prot_from_bits;

use crate::error::{Error, Result};
use crate::guest_vm::{Vcpu, VmParams};
use crate::mem_protect::MemProtect;
use crate::ptdump::PtdumpOp;
use crate::vm_table::LoadedVcpu;

/// Memory protection calls made by the host kernel.
#[derive(Clone, Copy, Debug)]
pub enum HostHcall {
    ShareHyp { pfn: u64 },
    UnshareHyp { pfn: u64 },
    DonateHyp { pfn: u64, nr: u64 },
    ShareFfa { pfn: u64, nr: u64 },
    UnshareFfa { pfn: u64, nr: u64 },
    UseDma { phys: u64, size: u64 },
    UnuseDma { phys: u64, size: u64 },
    /// Calls that act on a guest through the vCPU loaded on the calling CPU.
    DonateGuest { pfn: u64, gfn: u64 },
    ShareGuest { pfn: u64, gfn: u64, prot: u16 },
    RelaxGuestPerms { gfn: u64, prot: u16 },
    TopupMemcache { pfn: u64, nr: u64 },
    UnshareGuest { handle: u64, gfn: u64 },
    WrprotectGuest { handle: u64, gfn: u64 },
    InitVm { params: VmParams },
    StartTeardownVm { handle: u64 },
    ReclaimDyingGuestPage { handle: u64, pfn: u64, gfn: u64 },
    FinalizeTeardownVm { handle: u64 },
    RegisterModulePages { pfn: u64, nr: u64, prot: u16 },
    ModuleChangeHostProt { pfn: u64, prot: u16, nr: u64 },
    PtdumpGetConfig { handle: u64, op: PtdumpOp },
    PtdumpWalkRange { handle: u64, log_pfn: u64 },
    ProtFinalize,
}

/// Memory protection calls made by a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestHcall {
    MemShare { ipa: u64, nr: u64 },
    MemUnshare { ipa: u64, nr: u64 },
    MemRelinquish { ipa: u64 },
    IoguardMap { ipa: u64, nr: u64 },
}

/// The outcome of a call: zero or a negative errno in `status`, and the call's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HcallResult {
    pub status: i64,
    pub value: u64,
}

impl From<Result<u64>> for HcallResult {
    fn from(ret: Result<u64>) -> Self {
        match ret {
            Ok(value) => Self { status: 0, value },
            Err(e) => Self {
                status: e.to_code(),
                value: 0,
            },
        }
    }
}

impl HcallResult {
    /// Returns the call's error, if it failed.
    pub fn error(&self) -> Option<Error> {
        Error::from_code(self.status)
    }
}

fn done(ret: Result<()>) -> Result<u64> {
    ret.map(|()| 0)
}

fn loaded(mp: &MemProtect, cpu: usize) -> Result<Vcpu> {
    mp.loaded_vcpu(cpu).ok_or(Error::Inval)
}

fn dispatch_host(mp: &MemProtect, cpu: usize, call: HostHcall) -> Result<u64> {
    use HostHcall::*;
    match call {
        ShareHyp { pfn } => done(mp.host_share_hyp(pfn)),
        UnshareHyp { pfn } => done(mp.host_unshare_hyp(pfn)),
        DonateHyp { pfn, nr } => done(mp.host_donate_hyp(pfn, nr)),
        ShareFfa { pfn, nr } => done(mp.host_share_ffa(pfn, nr)),
        UnshareFfa { pfn, nr } => done(mp.host_unshare_ffa(pfn, nr)),
        UseDma { phys, size } => done(mp.host_use_dma(phys, size)),
        UnuseDma { phys, size } => done(mp.host_unuse_dma(phys, size)),
        DonateGuest { pfn, gfn } => done(mp.host_donate_guest(pfn, gfn, &loaded(mp, cpu)?)),
        ShareGuest { pfn, gfn, prot } => {
            let prot = prot_from_bits(prot).ok_or(Error::Inval)?;
            done(mp.host_share_guest(pfn, gfn, &loaded(mp, cpu)?, prot))
        }
        RelaxGuestPerms { gfn, prot } => {
            let prot = prot_from_bits(prot).ok_or(Error::Perm)?;
            done(mp.host_relax_guest_perms(gfn, prot, &loaded(mp, cpu)?))
        }
        TopupMemcache { pfn, nr } => done(mp.topup_vcpu_memcache(&loaded(mp, cpu)?, pfn, nr)),
        UnshareGuest { handle, gfn } => {
            let vm = mp.vms.get(handle).ok_or(Error::NoEnt)?;
            done(mp.host_unshare_guest(&vm, gfn))
        }
        WrprotectGuest { handle, gfn } => {
            let vm = mp.vms.get(handle).ok_or(Error::NoEnt)?;
            done(mp.host_wrprotect_guest(&vm, gfn))
        }
        InitVm { params } => mp.init_vm(params),
        StartTeardownVm { handle } => done(mp.start_teardown_vm(handle)),
        ReclaimDyingGuestPage { handle, pfn, gfn } => {
            done(mp.reclaim_dying_guest_page(handle, pfn, gfn))
        }
        FinalizeTeardownVm { handle } => done(mp.finalize_teardown_vm(handle)),
        RegisterModulePages { pfn, nr, prot } => done(mp.register_module_pages(pfn, nr, prot)),
        ModuleChangeHostProt { pfn, prot, nr } => {
            done(mp.module_change_host_page_prot(pfn, prot, nr))
        }
        PtdumpGetConfig { handle, op } => mp.ptdump_get_config(handle, op),
        PtdumpWalkRange { handle, log_pfn } => done(mp.ptdump_walk_range(handle, log_pfn)),
        ProtFinalize => done(mp.prot_finalize(cpu)),
    }
}

/// Runs a call the host made on physical CPU `cpu`.
pub fn handle_host_hcall(mp: &MemProtect, cpu: usize, call: HostHcall) -> HcallResult {
    let ret = dispatch_host(mp, cpu, call);
    trace!("host hcall {:?} on cpu {}: {:?}", call, cpu, ret);
    ret.into()
}

/// Runs a call made by the guest vCPU `vcpu`. Share, unshare and ioguard calls report the
/// number of pages they got through; relinquish reports the address it released.
pub fn handle_guest_hcall(vcpu: &LoadedVcpu<'_>, call: GuestHcall) -> HcallResult {
    let mp = vcpu.mem_protect();
    let ret = match call {
        GuestHcall::MemShare { ipa, nr } => mp.guest_share_host(vcpu, ipa, nr),
        GuestHcall::MemUnshare { ipa, nr } => mp.guest_unshare_host(vcpu, ipa, nr),
        GuestHcall::MemRelinquish { ipa } => mp.guest_relinquish_to_host(vcpu, ipa),
        GuestHcall::IoguardMap { ipa, nr } => mp.install_ioguard_page(vcpu, ipa, nr),
    };
    trace!(
        "guest hcall {:?} from VM {:#x} vcpu {}: {:?}",
        call,
        vcpu.vm().handle(),
        vcpu.idx(),
        ret
    );
    ret.into()
}
