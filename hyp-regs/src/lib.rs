// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]
#![allow(missing_docs)]

//! Field definitions for the EL2 system registers the abort path reads and writes.
//! defs - ESR, SPSR and HPFAR layouts
//! fault - decoding of a stage-2 abort into an address and a fault kind

mod defs;
mod fault;

pub use defs::*;
pub use fault::*;
pub use tock_registers::interfaces::ReadWriteable;
pub use tock_registers::interfaces::Readable;
pub use tock_registers::interfaces::Writeable;
pub use tock_registers::LocalRegisterCopy;
