// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Synchronization primitives.
//!
//! Synchronization primitves like mutexes and read/write-locks that are
//! usable in bare-metal environments. The locks are re-exported from the
//! `spin` crate; `OnceSlot` is a write-once cell for registering callbacks.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod once_slot;

pub use once_slot::{OnceSlot, SlotTaken};
pub use spin::{Mutex, RwLock};
