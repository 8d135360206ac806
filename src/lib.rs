//! Safe memory reclamation for lock-free data structures, built on hazard
//! pointers, plus the sequence lock the same publication-parity reasoning
//! applies to.
//!
//! Readers create a [`HazardPointer`] and load shared pointers through it;
//! while a load is protected, the referent cannot be destroyed. Writers
//! unlink objects from their structure and [`retire`] them; the domain
//! destroys a retired object only once a scan of every published hazard
//! shows that no reader can still be holding it.
//!
//! ```
//! use quarantine::HazardPointer;
//! use std::sync::atomic::AtomicPtr;
//!
//! let x = AtomicPtr::new(Box::into_raw(Box::new(42usize)));
//!
//! // As a reader:
//! let mut h = HazardPointer::new();
//! // Safety: the pointer came from a Box, and writers retire it through
//! // the global domain.
//! let val = unsafe { h.protect(&x) }.expect("not null");
//! assert_eq!(*val, 42);
//! drop(h);
//!
//! // As a writer:
//! // Safety: the Box pointer is unreachable to new readers from here on.
//! unsafe { quarantine::retire(x.into_inner()) };
//! quarantine::reclaim();
//! ```
//!
//! Reclamation is amortized: a retire occasionally triggers a bulk pass
//! over everything retired so far, either because enough garbage
//! accumulated or because a periodic deadline lapsed. [`reclaim`] forces a
//! pass. Each thread keeps a small cache of hazard slots so that handle
//! creation is usually a couple of thread-local operations;
//! [`evict_hazard_ptr`] flushes the cache and [`delete_hazard_ptr`] shrinks
//! the process-wide slot directory.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

mod cache;
mod deleter;
mod domain;
mod hazard;
mod list;
mod rwlock;
mod seqlock;
mod slot;
mod sync;

pub use deleter::{deleters, Deleter, Reclaim};
pub use domain::Domain;
pub use hazard::{HazardPointer, HazardPointerArray};
pub use seqlock::{SeqLock, SeqWriteGuard};

/// Create a hazard pointer in the [global domain](Domain::global).
///
/// Equivalent to [`HazardPointer::new`].
pub fn make_hazard_ptr() -> HazardPointer<'static> {
    HazardPointer::new()
}

/// Create `N` hazard pointers in the [global domain](Domain::global) with a
/// single bulk acquisition.
///
/// Equivalent to [`HazardPointer::many`].
pub fn make_hazard_ptr_array<const N: usize>() -> HazardPointerArray<'static, N> {
    HazardPointer::many::<N>()
}

/// Pre-populate the calling thread's cache with at least `n` free slots.
pub fn reserve_hazp(n: usize) {
    cache::reserve(n);
}

/// Retire `ptr` into the global domain, to be dropped as a `Box` once no
/// hazard pointer protects it.
///
/// Returns the number of objects destroyed by any reclamation pass this
/// call triggered.
///
/// # Safety
///
/// As for [`Domain::retire_ptr`].
pub unsafe fn retire<T: Send>(ptr: *mut T) -> usize {
    // Safety: forwarded from our own contract.
    unsafe { Domain::global().retire_ptr(ptr) }
}

/// Retire `ptr` into the global domain with a caller-supplied deleter.
///
/// # Safety
///
/// As for [`Domain::retire_ptr_with`].
pub unsafe fn retire_with<T: Send>(ptr: *mut T, deleter: &'static dyn Deleter) -> usize {
    // Safety: forwarded from our own contract.
    unsafe { Domain::global().retire_ptr_with(ptr, deleter) }
}

/// Run a reclamation pass on the global domain and wait for every in-flight
/// pass to finish.
///
/// Returns the number of retired objects destroyed by this pass.
pub fn reclaim() -> usize {
    Domain::global().reclaim()
}

/// Flush the calling thread's slot cache back to the global domain.
///
/// A no-op if the cache is empty.
pub fn evict_hazard_ptr() {
    cache::evict();
}

/// Compact the global domain's slot directory, destroying every slot that
/// has been returned to the global free list.
pub fn delete_hazard_ptr() {
    Domain::global().compact();
}
