// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use sync::OnceSlot;

use crate::error::Result;
use crate::host_abort::HostCpuContext;
use crate::mem_protect::MemProtect;

/// Handles host data aborts on MMIO that belong to an IOMMU.
pub trait HostIommuHandler: Send + Sync {
    /// Returns true if the abort was dealt with and the host can resume.
    fn handle_dabt(&self, ctx: &mut HostCpuContext, esr: u64, addr: u64) -> bool;
}

/// Handles host permission faults on pages a module restricted.
pub trait ModulePermFaultHandler: Send + Sync {
    /// Returns true if the fault was dealt with and the host can resume.
    fn handle_perm_fault(&self, ctx: &mut HostCpuContext, esr: u64, addr: u64) -> bool;
}

/// Told about every illegal host access before the fault is reflected back to the host.
pub trait IllegalAbortNotifier: Send + Sync {
    fn notify(&self, ctx: &HostCpuContext);
}

/// The callbacks modules may install, each at most once.
#[derive(Default)]
pub(crate) struct HandlerSlots {
    pub iommu: OnceSlot<Box<dyn HostIommuHandler>>,
    pub perm_fault: OnceSlot<Box<dyn ModulePermFaultHandler>>,
    pub illegal_abort: OnceSlot<Box<dyn IllegalAbortNotifier>>,
}

impl MemProtect {
    /// Installs the IOMMU data-abort handler. Fails with `EBUSY` if one is already installed.
    pub fn register_host_iommu_handler(&self, handler: Box<dyn HostIommuHandler>) -> Result<()> {
        Ok(self.handlers.iommu.set(handler)?)
    }

    /// Installs the module permission-fault handler. Fails with `EBUSY` if one is already
    /// installed.
    pub fn register_host_perm_fault_handler(
        &self,
        handler: Box<dyn ModulePermFaultHandler>,
    ) -> Result<()> {
        Ok(self.handlers.perm_fault.set(handler)?)
    }

    /// Installs the illegal-abort notifier. Fails with `EBUSY` if one is already installed.
    pub fn register_illegal_abort_notifier(
        &self,
        notifier: Box<dyn IllegalAbortNotifier>,
    ) -> Result<()> {
        Ok(self.handlers.illegal_abort.set(notifier)?)
    }
}
