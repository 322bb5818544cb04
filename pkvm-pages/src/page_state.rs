// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use flagset::{flags, FlagSet};

flags! {
    /// Bits layered on top of page ownership. A page with none of them set is exclusively owned
    /// by whoever's view is being inspected.
    #[repr(u8)]
    pub enum PageStateFlag: u8 {
        /// Owned, with a borrowed mapping granted to another party.
        SharedOwned = 1,
        /// Owned by someone else and mapped here on loan.
        SharedBorrowed = 2,
        /// Not present in this view; only tracked by metadata or an annotation.
        NoPage = 4,
        /// Mapped with less than the default permissions.
        RestrictedProt = 8,
        /// Handed over to a hypervisor module.
        ModuleOwned = 16,
        /// Device memory, or an MMIO-guard annotation in a guest view.
        Mmio = 32,
    }
}

/// The sharing state of a page as seen from one party's view.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PageState(FlagSet<PageStateFlag>);

impl PageState {
    /// Exclusively owned.
    pub fn owned() -> Self {
        Self(FlagSet::default())
    }

    pub fn shared_owned() -> Self {
        Self(PageStateFlag::SharedOwned.into())
    }

    pub fn shared_borrowed() -> Self {
        Self(PageStateFlag::SharedBorrowed.into())
    }

    pub fn nopage() -> Self {
        Self(PageStateFlag::NoPage.into())
    }

    /// Creates a state from an explicit set of flags.
    pub fn from_flags(flags: impl Into<FlagSet<PageStateFlag>>) -> Self {
        Self(flags.into())
    }

    /// Rebuilds a state from its raw bits, dropping any unknown bit.
    pub fn from_bits_truncate(bits: u8) -> Self {
        Self(FlagSet::new_truncated(bits))
    }

    /// Returns the raw bits of the state.
    pub fn bits(&self) -> u8 {
        self.0.bits()
    }

    /// Returns the flag set.
    pub fn flags(&self) -> FlagSet<PageStateFlag> {
        self.0
    }

    /// Returns a copy of this state with `flags` added.
    pub fn with(self, flags: impl Into<FlagSet<PageStateFlag>>) -> Self {
        Self(self.0 | flags.into())
    }

    /// Returns a copy of this state with `flags` removed.
    pub fn without(self, flags: impl Into<FlagSet<PageStateFlag>>) -> Self {
        Self(self.0 - flags.into())
    }

    /// Returns true if all of `flags` are set.
    pub fn contains(&self, flags: impl Into<FlagSet<PageStateFlag>>) -> bool {
        self.0.contains(flags)
    }

    pub fn is_owned(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_nopage(&self) -> bool {
        self.0.contains(PageStateFlag::NoPage)
    }

    /// Returns the state without the bits that only describe the mapping's permissions, which
    /// is what the transition checks compare against.
    pub fn sharing(self) -> Self {
        self.without(PageStateFlag::RestrictedProt)
    }
}

impl From<PageStateFlag> for PageState {
    fn from(flag: PageStateFlag) -> Self {
        Self(flag.into())
    }
}

impl fmt::Debug for PageState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "Owned");
        }
        let mut first = true;
        for flag in self.0.into_iter() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{:?}", flag)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_is_empty() {
        assert!(PageState::owned().is_owned());
        assert_eq!(PageState::owned().bits(), 0);
        assert!(!PageState::shared_owned().is_owned());
        assert!(PageState::nopage().is_nopage());
    }

    #[test]
    fn with_and_without() {
        let s = PageState::nopage().with(PageStateFlag::Mmio);
        assert!(s.contains(PageStateFlag::Mmio));
        assert!(s.contains(PageStateFlag::NoPage));
        assert_eq!(s.without(PageStateFlag::Mmio), PageState::nopage());
        let restricted = PageState::shared_borrowed().with(PageStateFlag::RestrictedProt);
        assert_eq!(restricted.sharing(), PageState::shared_borrowed());
        assert_eq!(PageState::from_bits_truncate(restricted.bits()), restricted);
    }

    #[test]
    fn debug_names() {
        assert_eq!(format!("{:?}", PageState::owned()), "Owned");
        assert_eq!(
            format!("{:?}", PageState::nopage().with(PageStateFlag::ModuleOwned)),
            "NoPage|ModuleOwned"
        );
    }
}
