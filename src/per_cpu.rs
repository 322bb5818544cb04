// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use sync::Mutex;

use crate::error::{Error, Result};
use crate::guest_vm::Vcpu;

/// State kept for each physical CPU that enters the hypervisor.
pub(crate) struct PerCpu {
    loaded: Vec<Mutex<Option<Vcpu>>>,
    finalized: Vec<AtomicBool>,
}

impl PerCpu {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            loaded: (0..nr_cpus).map(|_| Mutex::new(None)).collect(),
            finalized: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Returns the "loaded vCPU" slot of `cpu`.
    pub fn loaded_slot(&self, cpu: usize) -> Option<&Mutex<Option<Vcpu>>> {
        self.loaded.get(cpu)
    }

    /// Returns the vCPU currently loaded on `cpu`, if any.
    pub fn loaded_vcpu(&self, cpu: usize) -> Option<Vcpu> {
        self.loaded.get(cpu)?.lock().clone()
    }

    /// Records that `cpu` finalized its protection. Fails with `EPERM` on the second call.
    pub fn finalize(&self, cpu: usize) -> Result<()> {
        let finalized = self.finalized.get(cpu).ok_or(Error::Inval)?;
        finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Perm)
    }

    /// Returns true once any CPU has finalized.
    pub fn any_finalized(&self) -> bool {
        self.finalized.iter().any(|f| f.load(Ordering::Acquire))
    }
}
