// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Describes the type of memory a physical address is backed by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    /// Ordinary, idempotent system RAM registered in the memory map.
    Ram,

    /// Anything outside the registered RAM regions. Reads and writes may have side-effects and
    /// there is no per-page metadata for it.
    Mmio,
}

impl MemType {
    /// Returns true if this is RAM.
    pub fn is_memory(&self) -> bool {
        matches!(self, MemType::Ram)
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match &self {
            MemType::Ram => write!(f, "RAM"),
            MemType::Mmio => write!(f, "MMIO"),
        }
    }
}
