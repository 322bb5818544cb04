// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use flagset::FlagSet;
use log::debug;
use pkvm_page_tables::{PageTable, Pte, PtePolicy, WalkFlags};
use pkvm_pages::{PageState, PageStateFlag, PAGE_SHIFT, PAGE_SIZE};

use crate::error::{Error, Result};

/// A run of entries found in the same state, starting at `ipa`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Run {
    /// The first entry of the run.
    pub start: Pte,
    /// Input address of the first entry, which may lie below the requested address when the
    /// entry is a large invalid one.
    pub ipa: u64,
    /// Bytes covered by the entries of the run.
    pub size: u64,
    /// Requested pages the run covers.
    pub nr_pages: u64,
}

impl Run {
    /// Returns the output address of the run, if it is made of valid leaves.
    pub fn phys(&self) -> Option<u64> {
        match self.start {
            Pte::Leaf { phys, .. } => Some(phys),
            _ => None,
        }
    }
}

/// What a range walk is looking for.
pub(crate) struct Request {
    /// State every entry must be in, once the `ignore` flags are dropped.
    pub desired: PageState,
    pub ignore: FlagSet<PageStateFlag>,
    /// Most entries to take before stopping.
    pub max_ptes: u64,
}

/// Walks `nr_pages` pages of `pgt` from `ipa` and collects the longest run of entries that are
/// all in the requested state, physically contiguous and mapped with the same prot.
///
/// A run cut short by a discontinuity or by `max_ptes` is still a success: the caller handles
/// `nr_pages` of the returned run and comes back for the rest.
pub(crate) fn coalesce<P, F>(
    pgt: &PageTable<P>,
    ipa: u64,
    nr_pages: u64,
    req: &Request,
    state_of: F,
) -> Result<Run>
where
    P: PtePolicy,
    F: Fn(&Pte) -> PageState,
{
    let size = nr_pages
        .checked_mul(PAGE_SIZE)
        .filter(|s| *s != 0)
        .ok_or(Error::Inval)?;
    let mut run: Option<Run> = None;
    let mut taken = 0;
    let walked = pgt.walk(ipa, size, WalkFlags::Leaf as u8, |ctx| {
        let state = state_of(&ctx.pte);
        if state.without(req.ignore) != req.desired {
            return Err(if state.is_nopage() {
                Error::Fault
            } else {
                Error::Perm
            });
        }
        match run.as_mut() {
            None => {
                run = Some(Run {
                    start: ctx.pte,
                    ipa: ctx.addr,
                    size: 0,
                    nr_pages: 0,
                });
            }
            Some(r) => {
                if r.start.prot() != ctx.pte.prot() {
                    return Err(Error::Inval);
                }
                let phys = ctx.pte.output_addr(ctx.addr, ctx.level);
                if let (Some(first), Some(phys)) = (r.phys(), phys) {
                    if first + r.size != phys {
                        return Err(Error::TooBig);
                    }
                }
            }
        }
        if let Some(r) = run.as_mut() {
            r.size += ctx.level.granule();
        }
        taken += 1;
        if taken >= req.max_ptes {
            return Err(Error::TooBig);
        }
        Ok(())
    });
    match walked {
        Ok(()) | Err(Error::TooBig) => (),
        Err(e) => return Err(e),
    }
    let mut run = run.ok_or(Error::Inval)?;
    let covered = (run.ipa + run.size).saturating_sub(ipa) >> PAGE_SHIFT;
    run.nr_pages = covered.min(nr_pages);
    if run.nr_pages < nr_pages {
        debug!(
            "coalesced {} of {} pages at {:#x}",
            run.nr_pages, nr_pages, ipa
        );
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use page_tracking::PagePool;
    use pkvm_page_tables::{prot_rwx, GuestS2PageTable, GuestS2Policy, Prot};
    use pkvm_pages::PhysPageAddr;

    fn guest_state(pte: &Pte) -> PageState {
        match pte {
            Pte::Leaf { state, .. } => *state,
            p if p.is_mmio_note() => PageState::nopage().with(PageStateFlag::Mmio),
            _ => PageState::nopage(),
        }
    }

    fn owned(max_ptes: u64) -> Request {
        Request {
            desired: PageState::owned(),
            ignore: FlagSet::default(),
            max_ptes,
        }
    }

    fn stub_tree() -> (GuestS2PageTable, PagePool) {
        let mut pool = PagePool::with_range(PhysPageAddr::phys(0x10_0000_0000).unwrap(), 16);
        let pgt = GuestS2PageTable::new(40, GuestS2Policy, &mut pool).unwrap();
        (pgt, pool)
    }

    fn map(pgt: &mut GuestS2PageTable, pool: &mut PagePool, ipa: u64, phys: u64, pages: u64) {
        pgt.map(
            ipa,
            pages * PAGE_SIZE,
            phys,
            prot_rwx(),
            PageState::owned(),
            pool,
        )
        .unwrap();
    }

    #[test]
    fn contiguous_run() {
        let (mut pgt, mut pool) = stub_tree();
        map(&mut pgt, &mut pool, 0x4000_0000, 0x8000_0000, 4);
        let run = coalesce(&pgt, 0x4000_0000, 4, &owned(512), guest_state).unwrap();
        assert_eq!(run.nr_pages, 4);
        assert_eq!(run.size, 4 * PAGE_SIZE);
        assert_eq!(run.phys(), Some(0x8000_0000));
        assert_eq!(run.ipa, 0x4000_0000);
    }

    #[test]
    fn stops_at_discontinuity() {
        let (mut pgt, mut pool) = stub_tree();
        map(&mut pgt, &mut pool, 0x4000_0000, 0x8000_0000, 2);
        map(&mut pgt, &mut pool, 0x4000_2000, 0x9000_0000, 2);
        let run = coalesce(&pgt, 0x4000_0000, 4, &owned(512), guest_state).unwrap();
        assert_eq!(run.nr_pages, 2);
        assert_eq!(run.phys(), Some(0x8000_0000));
        // The next call picks up the second run.
        let run = coalesce(&pgt, 0x4000_2000, 2, &owned(512), guest_state).unwrap();
        assert_eq!(run.phys(), Some(0x9000_0000));
        assert_eq!(run.nr_pages, 2);
    }

    #[test]
    fn capped() {
        let (mut pgt, mut pool) = stub_tree();
        map(&mut pgt, &mut pool, 0x4000_0000, 0x8000_0000, 8);
        let run = coalesce(&pgt, 0x4000_0000, 8, &owned(3), guest_state).unwrap();
        assert_eq!(run.nr_pages, 3);
        let run = coalesce(&pgt, 0x4000_0000, 2, &owned(3), guest_state).unwrap();
        assert_eq!(run.nr_pages, 2);
    }

    #[test]
    fn state_and_prot_mismatches() {
        let (mut pgt, mut pool) = stub_tree();
        map(&mut pgt, &mut pool, 0x4000_0000, 0x8000_0000, 1);
        pgt.map(
            0x4000_1000,
            PAGE_SIZE,
            0x8000_1000,
            Prot::R.into(),
            PageState::owned(),
            &mut pool,
        )
        .unwrap();
        pgt.map(
            0x4000_2000,
            PAGE_SIZE,
            0x8000_2000,
            prot_rwx(),
            PageState::shared_owned(),
            &mut pool,
        )
        .unwrap();
        assert_eq!(
            coalesce(&pgt, 0x4000_0000, 2, &owned(512), guest_state).err(),
            Some(Error::Inval)
        );
        assert_eq!(
            coalesce(&pgt, 0x4000_2000, 1, &owned(512), guest_state).err(),
            Some(Error::Perm)
        );
        assert_eq!(
            coalesce(&pgt, 0x4000_3000, 1, &owned(512), guest_state).err(),
            Some(Error::Fault)
        );
    }

    #[test]
    fn large_invalid_entries() {
        let (pgt, _pool) = stub_tree();
        let req = Request {
            desired: PageState::nopage(),
            ignore: PageStateFlag::Mmio.into(),
            max_ptes: 512,
        };
        // A single empty top-level entry covers the whole request.
        let run = coalesce(&pgt, 0x4000_5000, 16, &req, guest_state).unwrap();
        assert_eq!(run.ipa, 0);
        assert_eq!(run.nr_pages, 16);
        assert!(run.phys().is_none());
    }
}
