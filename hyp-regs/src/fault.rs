// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use tock_registers::LocalRegisterCopy;

use crate::defs::*;

/// How a stage-2 abort should be resolved, from its fault status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Nothing is mapped at the faulting address.
    Translation,
    /// A mapping exists but does not allow the access.
    Permission,
    /// Any other fault status.
    Other,
}

/// The syndrome registers captured when the host takes a stage-2 abort.
#[derive(Clone, Copy)]
pub struct HostFault {
    esr: LocalRegisterCopy<u64, esr::Register>,
    far: u64,
    hpfar: Option<LocalRegisterCopy<u64, hpfar::Register>>,
}

impl HostFault {
    /// Captures a fault. `hpfar` is `None` when the hardware did not report a valid IPA, in
    /// which case the faulting instruction is simply retried.
    pub fn new(esr: u64, far: u64, hpfar: Option<u64>) -> Self {
        Self {
            esr: LocalRegisterCopy::new(esr),
            far,
            hpfar: hpfar.map(LocalRegisterCopy::new),
        }
    }

    pub fn esr(&self) -> LocalRegisterCopy<u64, esr::Register> {
        self.esr
    }

    pub fn far(&self) -> u64 {
        self.far
    }

    /// Returns the faulting IPA: the page from HPFAR with the page offset taken from FAR.
    pub fn fault_addr(&self) -> Option<u64> {
        let page = self.hpfar?.fault_ipa_page();
        Some(page | (self.far & 0xfff))
    }

    /// Classifies the fault status code.
    pub fn kind(&self) -> FaultKind {
        match self.esr.get() & ESR_FSC_TYPE {
            ESR_FSC_FAULT => FaultKind::Translation,
            ESR_FSC_PERM => FaultKind::Permission,
            _ => FaultKind::Other,
        }
    }

    pub fn is_dabt_low(&self) -> bool {
        self.esr.is_dabt_low()
    }

    /// Returns true if the faulting access was a write.
    pub fn is_write(&self) -> bool {
        self.esr.is_set(esr::wnr)
    }
}
