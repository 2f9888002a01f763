//! Atomic primitives, routed through `portable-atomic` on targets that need it.

#[cfg(feature = "portable-atomic")]
pub(crate) use portable_atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(not(feature = "portable-atomic"))]
pub(crate) use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
