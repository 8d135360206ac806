use crate::domain::Domain;
use crate::list::Chain;
use crate::slot::{FreeLink, Slot};
use std::cell::RefCell;
use std::collections::HashSet;

type SlotSet = HashSet<*const Slot, foldhash::fast::RandomState>;

crate::sync::thread_local! {
    static CACHE: RefCell<LocalCache> = RefCell::new(LocalCache::new());
}

/// Per-thread pool of slots from the global domain.
///
/// `free` holds slots ready for the next handle this thread creates;
/// `storage` tracks every slot the thread currently stewards, including
/// those held by live handles, so that thread exit can orphan all of them.
/// The cache is unshared, so none of this needs synchronization.
struct LocalCache {
    free: Chain<Slot, FreeLink>,
    storage: SlotSet,
}

impl LocalCache {
    fn new() -> Self {
        Self {
            free: Chain::new(),
            storage: SlotSet::default(),
        }
    }

    fn get(&mut self) -> &'static Slot {
        if let Some(slot) = self.free.pop() {
            // Safety: a cached slot cannot reach the global free list (and
            // therefore compaction) until its next owner releases it.
            return unsafe { &*slot };
        }
        let slot = Domain::global().acquire_slot();
        self.storage.insert(slot as *const Slot);
        slot
    }

    fn get_many<const N: usize>(&mut self) -> [&'static Slot; N] {
        self.reserve(N);
        [(); N].map(|()| {
            let slot = self.free.pop().expect("reserve put at least N slots in the cache");
            // Safety: as in `get`.
            unsafe { &*slot }
        })
    }

    fn reserve(&mut self, n: usize) {
        while self.free.len() < n {
            let slot = Domain::global().acquire_slot();
            self.storage.insert(slot as *const Slot);
            // Safety: freshly acquired, so on no free list.
            unsafe { self.free.push(slot as *const Slot as *mut Slot) };
        }
    }

    fn reuse(&mut self, slot: *mut Slot) {
        // Safety: the releasing handle was the slot's only owner.
        unsafe { self.free.push(slot) };
    }

    fn evict(&mut self) {
        while let Some(slot) = self.free.pop() {
            self.storage.remove(&(slot as *const Slot));
            // Safety: ours until pushed onto the global free list below.
            let slot = unsafe { &*slot };
            slot.orphan();
            Domain::global().release_slot(slot);
        }
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        // Idle slots go straight back to the domain, available for reuse by
        // other threads or for destruction by compaction.
        while let Some(slot) = self.free.pop() {
            self.storage.remove(&(slot as *const Slot));
            // Safety: as in `evict`.
            let slot = unsafe { &*slot };
            slot.orphan();
            Domain::global().release_slot(slot);
        }
        // Anything left is held by a live handle on this (dying) thread.
        // Orphan it now so no snapshot mistakes it for a protection; the
        // handle's own destructor forwards it to the domain.
        for &slot in &self.storage {
            // Safety: the live handle keeps the slot out of compaction's
            // reach until it drops.
            unsafe { &*slot }.orphan();
        }
    }
}

pub(crate) fn slot() -> &'static Slot {
    CACHE.with(|cache| cache.borrow_mut().get())
}

pub(crate) fn slots<const N: usize>() -> [&'static Slot; N] {
    CACHE.with(|cache| cache.borrow_mut().get_many::<N>())
}

pub(crate) fn reserve(n: usize) {
    CACHE.with(|cache| cache.borrow_mut().reserve(n))
}

pub(crate) fn evict() {
    // A no-op both on an empty cache and during thread teardown, where the
    // cache destructor has already flushed everything.
    let _ = CACHE.try_with(|cache| cache.borrow_mut().evict());
}

/// Hand a slot back to the calling thread's cache.
///
/// Returns `false` if the cache is already gone (thread teardown), in which
/// case the caller must release the slot to the domain instead.
pub(crate) fn release(slot: &Slot) -> bool {
    CACHE
        .try_with(|cache| cache.borrow_mut().reuse(slot as *const Slot as *mut Slot))
        .is_ok()
}
