// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// `OwnerId` represents the entity that owns a given page.
/// 0 = host
/// 1 = hypervisor
/// 2 = protected (memory handed to a hypervisor module, tracked as owned by nobody in particular)
/// 3..=max = guest ids, one per VM table slot
///
/// The id has to fit in the owner field of an invalid page-table entry, so it is a `u8`. The
/// effective maximum is a platform configuration value that may be lower.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u8);

impl OwnerId {
    /// The untrusted host kernel.
    pub const HOST: OwnerId = OwnerId(0);
    /// The hypervisor itself.
    pub const HYP: OwnerId = OwnerId(1);
    /// Memory reserved for hypervisor modules.
    pub const PROTECTED: OwnerId = OwnerId(2);
    /// The first id handed out to guests.
    pub const FIRST_GUEST: u8 = 3;

    /// Creates an `OwnerId` from its raw value.
    pub const fn from_raw(id: u8) -> Self {
        Self(id)
    }

    /// Returns the id of the guest occupying VM table slot `index`, or `None` if that would not
    /// fit in the owner field.
    pub fn guest(index: usize) -> Option<Self> {
        let id = (Self::FIRST_GUEST as usize).checked_add(index)?;
        u8::try_from(id).ok().map(Self)
    }

    /// Returns true if this is the host.
    pub fn is_host(&self) -> bool {
        *self == Self::HOST
    }

    /// Returns true if this id names a guest.
    pub fn is_guest(&self) -> bool {
        self.0 >= Self::FIRST_GUEST
    }

    /// Returns the raw value of the OwnerId.
    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::HOST => write!(f, "host"),
            Self::HYP => write!(f, "hyp"),
            Self::PROTECTED => write!(f, "protected"),
            OwnerId(id) => write!(f, "guest {}", id - Self::FIRST_GUEST),
        }
    }
}

/// `AddressSpace` identifies the address space that a raw address is in.
pub trait AddressSpace: Clone + Copy {
    /// Returns the `OwnerId` for the address space.
    fn id(&self) -> OwnerId;
}

/// Represents the real physical address space. The host stage-2 and the hypervisor stage-1 are
/// both identity maps of it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Phys;

impl AddressSpace for Phys {
    fn id(&self) -> OwnerId {
        OwnerId::HYP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_ids() {
        assert_eq!(OwnerId::guest(0).unwrap().raw(), OwnerId::FIRST_GUEST);
        assert!(OwnerId::guest(0).unwrap().is_guest());
        assert!(OwnerId::guest(252).is_some());
        assert!(OwnerId::guest(253).is_none());
        assert!(!OwnerId::HOST.is_guest());
        assert!(!OwnerId::PROTECTED.is_guest());
        assert!(OwnerId::HOST.is_host());
    }
}
