//! # Kernel synchronization primitives
//!
//! The memory-management core runs in a single execution context, so its
//! global state needs exclusivity checking rather than locking.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod exclusive_cell;

pub use exclusive_cell::{ExclusiveCell, ExclusiveGuard};
