// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;

/// Returned by `OnceSlot::set` when the slot already holds a value.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotTaken;

/// A cell that can be claimed exactly once by any CPU. Claiming is a single compare-and-swap so
/// two racing registrations can never both succeed.
pub struct OnceSlot<T> {
    claimed: AtomicBool,
    value: Once<T>,
}

impl<T> OnceSlot<T> {
    /// Creates an empty slot.
    pub const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            value: Once::new(),
        }
    }

    /// Stores `value` in the slot, failing if another caller got there first.
    pub fn set(&self, value: T) -> Result<(), SlotTaken> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SlotTaken)?;
        self.value.call_once(|| value);
        Ok(())
    }

    /// Returns the registered value, if the slot has been filled.
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Returns true if the slot has been claimed.
    pub fn is_set(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl<T> Default for OnceSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
