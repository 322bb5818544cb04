// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use log::error;
use page_tracking::{MemMapError, PageTrackingError};
use pkvm_page_tables::PageTableError;
use sync::SlotTaken;

/// Status codes returned to the host and to guests. The values are the negated errno numbers the
/// callers already understand.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page is not in the state the operation requires.
    Perm = -1,
    /// Nothing is mapped at the address.
    NoEnt = -2,
    /// The request covers more than can be handled in one go; retry with a smaller one.
    TooBig = -7,
    /// Raced with another update; the access should simply be retried.
    Again = -11,
    /// Ran out of page-table pages.
    NoMem = -12,
    /// The page is not present in the caller's view.
    Fault = -14,
    /// The page or object is in use.
    Busy = -16,
    /// Malformed request.
    Inval = -22,
}

impl Error {
    /// Parses an error code, returning `None` for codes that don't map to an `Error`.
    pub fn from_code(code: i64) -> Option<Self> {
        use Error::*;
        match code {
            -1 => Some(Perm),
            -2 => Some(NoEnt),
            -7 => Some(TooBig),
            -11 => Some(Again),
            -12 => Some(NoMem),
            -14 => Some(Fault),
            -16 => Some(Busy),
            -22 => Some(Inval),
            _ => None,
        }
    }

    /// Returns the code passed back over the call boundary.
    pub fn to_code(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Error::Perm => "EPERM",
            Error::NoEnt => "ENOENT",
            Error::TooBig => "E2BIG",
            Error::Again => "EAGAIN",
            Error::NoMem => "ENOMEM",
            Error::Fault => "EFAULT",
            Error::Busy => "EBUSY",
            Error::Inval => "EINVAL",
        };
        write!(f, "{name}")
    }
}

impl From<PageTableError> for Error {
    fn from(e: PageTableError) -> Self {
        use PageTableError::*;
        match e {
            InsufficientPtePages => Error::NoMem,
            NotMapped => Error::NoEnt,
            Misaligned | OutOfBounds | UnsupportedIaBits(_) | NotAnnotation => Error::Inval,
            MissingTable(_) => Error::Fault,
        }
    }
}

impl From<PageTrackingError> for Error {
    fn from(e: PageTrackingError) -> Self {
        use PageTrackingError::*;
        match e {
            NoCarveoutSpace | OutOfPages | InsufficientMemory => Error::NoMem,
            InvalidPage(_) | TooManyRanges | RefCountOverflow | RefCountUnderflow => Error::Inval,
        }
    }
}

impl From<MemMapError> for Error {
    fn from(_: MemMapError) -> Self {
        Error::Inval
    }
}

impl From<SlotTaken> for Error {
    fn from(_: SlotTaken) -> Self {
        Error::Busy
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Stops the hypervisor after an update that had already been validated failed to apply. The
/// ownership state can no longer be trusted at that point.
#[track_caller]
pub(crate) fn halt(what: &str, err: &dyn fmt::Debug) -> ! {
    error!("{what}: {err:?}");
    panic!("inconsistent memory ownership state: {what}");
}

/// Unwraps the result of the mutation half of a transition, halting on failure.
pub(crate) trait OrHalt<T> {
    fn or_halt(self, what: &str) -> T;
}

impl<T, E: fmt::Debug> OrHalt<T> for core::result::Result<T, E> {
    #[track_caller]
    fn or_halt(self, what: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => halt(what, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        for e in [
            Error::Perm,
            Error::NoEnt,
            Error::TooBig,
            Error::Again,
            Error::NoMem,
            Error::Fault,
            Error::Busy,
            Error::Inval,
        ] {
            assert_eq!(Error::from_code(e.to_code()), Some(e));
        }
        assert_eq!(Error::Busy.to_code(), -16);
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(-3), None);
    }

    #[test]
    fn lower_level_errors() {
        assert_eq!(
            Error::from(PageTableError::InsufficientPtePages),
            Error::NoMem
        );
        assert_eq!(Error::from(PageTableError::Misaligned), Error::Inval);
        assert_eq!(
            Error::from(PageTrackingError::RefCountUnderflow),
            Error::Inval
        );
        assert_eq!(Error::from(SlotTaken), Error::Busy);
    }

    #[test]
    #[should_panic]
    fn halts() {
        let r: core::result::Result<(), Error> = Err(Error::Perm);
        r.or_halt("commit");
    }
}
