use crate::list::Link;
use crate::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::atomic::Ordering;

/// A single hazard slot: one publication word plus two intrusive links.
///
/// The publication word holds one of three things:
///
/// - [`Slot::IN_USE`] (0): the slot is owned by a handle (or waiting in a
///   free list) but does not currently protect anything.
/// - [`Slot::ORPHANED`] (1): the owning thread exited; the slot is awaiting
///   directory compaction.
/// - any other value: the address the owning handle currently protects.
///
/// Reclaimers treat everything that is neither `IN_USE` nor `ORPHANED` as a
/// protected address; the word is never compared against anything else.
///
/// `next` threads the slot into the domain's slot directory, where it stays
/// from creation until compaction destroys it. `free_next` threads it into
/// whichever free list (thread-local cache or the domain's global one)
/// currently holds it while no handle does. Distinct links let both
/// memberships exist at once.
pub(crate) struct Slot {
    ptr: AtomicUsize,
    next: AtomicPtr<Slot>,
    free_next: AtomicPtr<Slot>,
}

impl Slot {
    pub(crate) const IN_USE: usize = 0;
    pub(crate) const ORPHANED: usize = 1;

    pub(crate) fn new() -> Self {
        Self {
            ptr: AtomicUsize::new(Self::IN_USE),
            next: AtomicPtr::new(std::ptr::null_mut()),
            free_next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Announce that the owning handle is about to dereference `addr`.
    pub(crate) fn publish(&self, addr: *mut u8) {
        self.ptr.store(addr as usize, Ordering::Release);
    }

    pub(crate) fn load(&self) -> usize {
        self.ptr.load(Ordering::Acquire)
    }

    /// Withdraw any publication, returning the slot to `IN_USE`.
    pub(crate) fn reset(&self) {
        self.ptr.store(Self::IN_USE, Ordering::Release);
    }

    /// Mark the slot as abandoned by a dying thread.
    pub(crate) fn orphan(&self) {
        self.ptr.store(Self::ORPHANED, Ordering::Release);
    }

    pub(crate) fn is_protecting(value: usize) -> bool {
        value != Self::IN_USE && value != Self::ORPHANED
    }
}

/// Traverses the slot directory chain.
pub(crate) struct DirLink;

impl Link<Slot> for DirLink {
    fn next(node: &Slot) -> &AtomicPtr<Slot> {
        &node.next
    }
}

/// Traverses free-list chains (global free list and thread-local caches).
pub(crate) struct FreeLink;

impl Link<Slot> for FreeLink {
    fn next(node: &Slot) -> &AtomicPtr<Slot> {
        &node.free_next
    }
}
