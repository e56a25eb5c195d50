#![cfg_attr(feature = "nightly", feature(core_intrinsics))]

//! An open-addressed, group-probed hash table engine in the style of
//! Abseil's SwissTable: a byte-per-slot control array scanned a
//! `Group::WIDTH` at a time (SSE2 where available, SWAR elsewhere) steers
//! probing away from scanning individual slots one at a time.
//!
//! This crate ships the engine only: hashing, equality, and the
//! type-specialized map/set surface are left to callers. Slot storage
//! (inline vs. indirected) and memory acquisition are pluggable via
//! [`policy::SlotStrategy`] and [`policy::Allocator`].

/// The table engine: control bytes, probing, growth.
pub mod raw;

/// Slot storage strategies and the allocator trait `RawTable` is generic
/// over.
pub mod policy;

/// The crate's one recoverable error.
pub mod error;

/// Set of compiler hints.
mod hint;

pub use error::{RawTableError, Result};
pub use raw::{Bucket, RawIter, RawTable};
