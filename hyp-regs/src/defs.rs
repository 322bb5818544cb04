// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

// Exception syndrome register, for the EL2 and EL1 copies alike.
register_bitfields![u64,
    pub esr [
        // Exception class.
        ec OFFSET(26) NUMBITS(6) [
            Unknown = 0x00,
            Hvc64 = 0x16,
            Smc64 = 0x17,
            IabtLow = 0x20,
            IabtCur = 0x21,
            DabtLow = 0x24,
            DabtCur = 0x25,
        ],
        // Instruction length.
        il OFFSET(25) NUMBITS(1) [],
        // Instruction specific syndrome.
        iss OFFSET(0) NUMBITS(25) [],
        // Abort ISS: the fault happened on a stage-1 table walk.
        s1ptw OFFSET(7) NUMBITS(1) [],
        // Abort ISS: write not read.
        wnr OFFSET(6) NUMBITS(1) [],
        // Abort ISS: fault status code type, without the level bits.
        fsc_type OFFSET(2) NUMBITS(4) [
            AddressSize = 0,
            Translation = 1,
            AccessFlag = 2,
            Permission = 3,
        ],
        // Abort ISS: level of the faulting lookup.
        fsc_level OFFSET(0) NUMBITS(2) [],
    ]
];

/// Exception class field shift.
pub const ESR_EC_SHIFT: u64 = 26;
/// Fault status code type mask, level bits excluded.
pub const ESR_FSC_TYPE: u64 = 0x3c;
/// Fault status code of a translation fault.
pub const ESR_FSC_FAULT: u64 = 0x04;
/// Fault status code of a permission fault.
pub const ESR_FSC_PERM: u64 = 0x0c;

pub trait EsrHelpers {
    /// Returns true for data aborts taken from a lower exception level.
    fn is_dabt_low(&self) -> bool;

    /// Returns true for instruction or data aborts from a lower exception level.
    fn is_abort_low(&self) -> bool;

    /// Rewrites a lower-EL abort class as the equivalent current-EL class. Returns false, leaving
    /// the value alone, for any other class.
    fn repaint_as_current_el(&mut self) -> bool;
}

impl EsrHelpers for LocalRegisterCopy<u64, esr::Register> {
    fn is_dabt_low(&self) -> bool {
        self.read_as_enum(esr::ec) == Some(esr::ec::Value::DabtLow)
    }

    fn is_abort_low(&self) -> bool {
        use esr::ec::Value::*;
        matches!(self.read_as_enum(esr::ec), Some(DabtLow) | Some(IabtLow))
    }

    fn repaint_as_current_el(&mut self) -> bool {
        use esr::ec::Value::*;
        match self.read_as_enum(esr::ec) {
            Some(DabtLow) => self.modify(esr::ec::DabtCur),
            Some(IabtLow) => self.modify(esr::ec::IabtCur),
            _ => return false,
        }
        true
    }
}

// Saved program status.
register_bitfields![u64,
    pub spsr [
        // Exception level and stack pointer selection.
        m OFFSET(0) NUMBITS(4) [
            El0t = 0b0000,
            El1t = 0b0100,
            El1h = 0b0101,
            El2t = 0b1000,
            El2h = 0b1001,
        ],
        // Interrupt masks.
        f OFFSET(6) NUMBITS(1) [],
        i OFFSET(7) NUMBITS(1) [],
        a OFFSET(8) NUMBITS(1) [],
        d OFFSET(9) NUMBITS(1) [],
        // Condition flags.
        nzcv OFFSET(28) NUMBITS(4) [],
    ]
];

// Hypervisor IPA fault address.
register_bitfields![u64,
    pub hpfar [
        // Bits [51:12] of the faulting IPA.
        fipa OFFSET(4) NUMBITS(40) [],
    ]
];

pub trait HpfarHelpers {
    /// Returns the page-aligned faulting IPA.
    fn fault_ipa_page(&self) -> u64;
}

impl HpfarHelpers for LocalRegisterCopy<u64, hpfar::Register> {
    fn fault_ipa_page(&self) -> u64 {
        self.read(hpfar::fipa) << 12
    }
}
