//! Atomics used by the allocator, swapped for loom's instrumented
//! versions when the `loom` feature is on.

#[cfg(not(feature = "loom"))]
pub(crate) use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicU32, Ordering};
