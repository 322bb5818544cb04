// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use hyp_regs::{esr, spsr, EsrHelpers, FaultKind, HostFault, LocalRegisterCopy};
use log::{debug, warn};
use pkvm_page_tables::default_host_prot;

use crate::error::{halt, Error, Result};
use crate::mem_protect::MemProtect;

// Offsets of the synchronous exception vectors from VBAR_EL1.
const CURRENT_EL_SP_EL0_VECTOR: u64 = 0x0;
const CURRENT_EL_SP_ELX_VECTOR: u64 = 0x200;
const LOWER_EL_AARCH64_VECTOR: u64 = 0x400;

/// The EL1 registers that describe a synchronous exception to the host kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct El1FaultRegs {
    pub esr: u64,
    pub spsr: u64,
    pub elr: u64,
    pub far: u64,
    pub vbar: u64,
}

/// The host CPU state saved on entry to the hypervisor.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostCpuContext {
    pub regs: [u64; 31],
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub el1: El1FaultRegs,
}

/// What became of a host stage-2 abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The access can be replayed.
    Handled,
    /// Nothing was done; the access faults again if it still needs to.
    Retry,
    /// The access was illegal and was reflected to the host kernel with this syndrome.
    Injected { esr: u64 },
}

/// Makes the host take the abort as if it had happened at EL1, by pointing its exception
/// return at its own vector table. Returns the syndrome the host will see.
fn inject_host_exception(ctx: &mut HostCpuContext, fault: &HostFault) -> u64 {
    let old: LocalRegisterCopy<u64, spsr::Register> = LocalRegisterCopy::new(ctx.spsr_el2);
    let mode = old.read_as_enum(spsr::m);
    let offset = match mode {
        Some(spsr::m::Value::El1h) => CURRENT_EL_SP_ELX_VECTOR,
        Some(spsr::m::Value::El1t) => CURRENT_EL_SP_EL0_VECTOR,
        Some(spsr::m::Value::El0t) => LOWER_EL_AARCH64_VECTOR,
        _ => halt("host abort from unexpected mode", &ctx.spsr_el2),
    };

    let mut syndrome = fault.esr();
    if mode != Some(spsr::m::Value::El0t) {
        syndrome.repaint_as_current_el();
    }
    syndrome.modify(esr::s1ptw::SET);

    ctx.el1.esr = syndrome.get();
    ctx.el1.spsr = ctx.spsr_el2;
    ctx.el1.elr = ctx.elr_el2;
    ctx.el1.far = fault.far();
    ctx.elr_el2 = ctx.el1.vbar + offset;

    let mut new: LocalRegisterCopy<u64, spsr::Register> = LocalRegisterCopy::new(0);
    new.write(
        spsr::m::El1h
            + spsr::d::SET
            + spsr::a::SET
            + spsr::i::SET
            + spsr::f::SET
            + spsr::nzcv.val(old.read(spsr::nzcv)),
    );
    ctx.spsr_el2 = new.get();
    syndrome.get()
}

impl MemProtect {
    /// Handles a stage-2 abort taken by the host.
    ///
    /// Accesses to unmapped memory the host owns are resolved by mapping it in. Anything else
    /// the registered handlers don't claim is reflected back to the host.
    pub fn handle_host_mem_abort(
        &self,
        ctx: &mut HostCpuContext,
        fault: &HostFault,
    ) -> AbortOutcome {
        let Some(addr) = fault.fault_addr() else {
            // The address translation raced with a change to the host's stage-1.
            return AbortOutcome::Retry;
        };
        let esr = fault.esr().get();
        if fault.is_dabt_low() && !self.mem_map.is_memory(addr) {
            if let Some(handler) = self.handlers.iommu.get() {
                if handler.handle_dabt(ctx, esr, addr) {
                    return AbortOutcome::Handled;
                }
            }
        }

        let ret = match fault.kind() {
            FaultKind::Translation => self.host_stage2_idmap(addr),
            FaultKind::Permission => match self.handlers.perm_fault.get() {
                Some(handler) if handler.handle_perm_fault(ctx, esr, addr) => Ok(()),
                _ => Err(Error::Perm),
            },
            FaultKind::Other => Err(Error::Perm),
        };
        match ret {
            Ok(()) => AbortOutcome::Handled,
            Err(Error::Again) => AbortOutcome::Retry,
            Err(Error::Perm) => {
                warn!(
                    "illegal host access to {:#x} (esr {:#x}, {})",
                    addr,
                    esr,
                    if fault.is_write() { "write" } else { "read" }
                );
                if let Some(notifier) = self.handlers.illegal_abort.get() {
                    notifier.notify(ctx);
                }
                AbortOutcome::Injected {
                    esr: inject_host_exception(ctx, fault),
                }
            }
            Err(e) => halt("host stage-2 abort", &e),
        }
    }

    /// Maps the largest block around `addr` that the host may access by default.
    pub fn host_stage2_idmap(&self, addr: u64) -> Result<()> {
        let mut host = self.host.lock();
        let (reg, range) = host.mem_map().find(addr);
        if reg.map_or(false, |r| r.no_map()) {
            return Err(Error::Perm);
        }
        let mem_type = host.mem_map().mem_type(addr);
        let range = host.adjust_range(addr, range)?;
        debug!("host idmap {:#x}-{:#x} ({})", range.start, range.end, mem_type);
        host.idmap_locked(
            range.start,
            range.size(),
            default_host_prot(mem_type.is_memory()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_slot::{HostIommuHandler, IllegalAbortNotifier, ModulePermFaultHandler};
    use crate::test_stubs::*;
    use hyp_regs::ESR_EC_SHIFT;
    use pkvm_page_tables::{Level, Pte};
    use std::boxed::Box;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const DABT_LOW: u64 = 0x24 << ESR_EC_SHIFT;
    const TRANSLATION_L3: u64 = 0x07;
    const PERMISSION_L3: u64 = 0x0f;

    fn abort_at(addr: u64, fsc: u64) -> HostFault {
        HostFault::new(DABT_LOW | fsc, addr, Some((addr >> 12) << 4))
    }

    fn el1h_ctx() -> HostCpuContext {
        HostCpuContext {
            elr_el2: 0xffff_8000_1000_0000,
            spsr_el2: 0x6000_0005,
            el1: El1FaultRegs {
                vbar: 0xffff_8000_0800_0000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn lazy_idmap() {
        let mp = stub_mem_protect();
        let mut ctx = el1h_ctx();
        let addr = MMIO_BASE + 0x12_3000;
        assert!(mp.host_stage2_get_leaf(addr).unwrap().0.is_empty());
        assert_eq!(
            mp.handle_host_mem_abort(&mut ctx, &abort_at(addr, TRANSLATION_L3)),
            AbortOutcome::Handled
        );
        let (pte, level) = mp.host_stage2_get_leaf(addr).unwrap();
        assert!(pte.is_leaf());
        assert_eq!(pte.prot(), Some(default_host_prot(false)));
        assert_eq!(level, Level::new(1).unwrap());
        // A second CPU faulting on the same address finds it mapped.
        assert_eq!(
            mp.handle_host_mem_abort(&mut ctx, &abort_at(addr, TRANSLATION_L3)),
            AbortOutcome::Retry
        );
        // No valid IPA.
        let no_ipa = HostFault::new(DABT_LOW | TRANSLATION_L3, addr, None);
        assert_eq!(mp.handle_host_mem_abort(&mut ctx, &no_ipa), AbortOutcome::Retry);
    }

    #[test]
    fn reclaimed_mmio_is_remapped() {
        let mp = stub_mem_protect();
        let addr = MMIO_BASE + 0x1000;
        assert_eq!(mp.host_stage2_idmap(addr), Ok(()));
        mp.host.lock().unmap_unmoveable().unwrap();
        assert!(mp.host_stage2_get_leaf(addr).unwrap().0.is_empty());
        assert_eq!(mp.host_stage2_idmap(addr), Ok(()));
        let (pte, level) = mp.host_stage2_get_leaf(addr).unwrap();
        assert_eq!(pte.output_addr(addr, level), Some(addr));
        assert_eq!(pte.prot(), Some(default_host_prot(false)));
        assert_eq!(mp.host_stage2_idmap(addr), Err(Error::Again));
        assert_eq!(mp.host_stage2_idmap(FW_RESERVED_BASE), Err(Error::Perm));
    }

    #[test]
    fn illegal_access_is_injected() {
        let mp = stub_mem_protect();
        let notified = Arc::new(AtomicUsize::new(0));
        struct Count(Arc<AtomicUsize>);
        impl IllegalAbortNotifier for Count {
            fn notify(&self, _ctx: &HostCpuContext) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        mp.register_illegal_abort_notifier(Box::new(Count(notified.clone())))
            .unwrap();

        let carveout = mp.carveout();
        let fault = abort_at(carveout.start, TRANSLATION_L3);
        let mut ctx = el1h_ctx();
        let saved = ctx;
        let outcome = mp.handle_host_mem_abort(&mut ctx, &fault);
        let AbortOutcome::Injected { esr } = outcome else {
            panic!("expected injection, got {outcome:?}");
        };
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        // Repainted as an abort from the current EL, with S1PTW set.
        assert_eq!(esr >> ESR_EC_SHIFT & 0x3f, 0x25);
        assert_ne!(esr & (1 << 7), 0);
        assert_eq!(ctx.el1.esr, esr);
        assert_eq!(ctx.el1.elr, saved.elr_el2);
        assert_eq!(ctx.el1.spsr, saved.spsr_el2);
        assert_eq!(ctx.el1.far, carveout.start);
        assert_eq!(ctx.elr_el2, saved.el1.vbar + 0x200);
        let pstate: LocalRegisterCopy<u64, spsr::Register> = LocalRegisterCopy::new(ctx.spsr_el2);
        assert!(pstate.read_as_enum(spsr::m) == Some(spsr::m::Value::El1h));
        assert!(pstate.is_set(spsr::d) && pstate.is_set(spsr::a));
        assert!(pstate.is_set(spsr::i) && pstate.is_set(spsr::f));
        assert_eq!(pstate.read(spsr::nzcv), 0x6);
        // Nothing was mapped.
        assert_eq!(
            mp.host_stage2_get_leaf(carveout.start).unwrap().0,
            Pte::owned_by(pkvm_pages::OwnerId::HYP)
        );
    }

    #[test]
    fn user_fault_goes_to_lower_el_vector() {
        let mp = stub_mem_protect();
        let mut ctx = el1h_ctx();
        ctx.spsr_el2 = 0;
        let fault = abort_at(FW_RESERVED_BASE, TRANSLATION_L3);
        let outcome = mp.handle_host_mem_abort(&mut ctx, &fault);
        let AbortOutcome::Injected { esr } = outcome else {
            panic!("expected injection, got {outcome:?}");
        };
        // Left as a lower-EL abort.
        assert_eq!(esr >> ESR_EC_SHIFT & 0x3f, 0x24);
        assert_eq!(ctx.elr_el2, ctx.el1.vbar + 0x400);
    }

    #[test]
    fn handlers_get_first_look() {
        let mp = stub_mem_protect();
        struct Iommu;
        impl HostIommuHandler for Iommu {
            fn handle_dabt(&self, _ctx: &mut HostCpuContext, _esr: u64, addr: u64) -> bool {
                addr == MMIO_BASE
            }
        }
        struct Module;
        impl ModulePermFaultHandler for Module {
            fn handle_perm_fault(&self, ctx: &mut HostCpuContext, _esr: u64, _addr: u64) -> bool {
                ctx.regs[0] = 1;
                true
            }
        }
        let mut ctx = el1h_ctx();
        // Unhandled permission faults are illegal.
        let perm = abort_at(RAM_BASE, PERMISSION_L3);
        assert!(matches!(
            mp.handle_host_mem_abort(&mut ctx, &perm),
            AbortOutcome::Injected { .. }
        ));

        mp.register_host_iommu_handler(Box::new(Iommu)).unwrap();
        mp.register_host_perm_fault_handler(Box::new(Module)).unwrap();
        let mut ctx = el1h_ctx();
        assert_eq!(
            mp.handle_host_mem_abort(&mut ctx, &abort_at(MMIO_BASE, TRANSLATION_L3)),
            AbortOutcome::Handled
        );
        // The IOMMU claimed it, so nothing was mapped.
        assert!(mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.is_empty());
        assert_eq!(
            mp.handle_host_mem_abort(&mut ctx, &perm),
            AbortOutcome::Handled
        );
        assert_eq!(ctx.regs[0], 1);
    }
}
