use crate::deleter::{deleters, Deleter, Reclaim};
use crate::list::{Chain, Link, Stack};
use crate::rwlock::RwSpinLock;
use crate::slot::{DirLink, FreeLink, Slot};
use crate::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize};
use crossbeam_utils::CachePadded;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

#[cfg(not(loom))]
use crate::sync::atomic::AtomicU64;

#[cfg(doc)]
use crate::*;

// Reclamation triggers on two signals: the retired count crossing
// RECLAIM_THRESHOLD, and a coarse periodic deadline (`due_time`) read from a
// monotonic clock, so that a quiet process still frees its garbage about
// every SYNC_PERIOD_NS nanoseconds. Loom has no notion of time, and its
// models need far smaller constants to stay tractable.

#[cfg(not(loom))]
const RECLAIM_THRESHOLD: isize = 1000;
#[cfg(loom)]
const RECLAIM_THRESHOLD: isize = 5;

#[cfg(not(loom))]
const NUM_SHARDS: usize = 8;
#[cfg(loom)]
const NUM_SHARDS: usize = 2;

// Shard selection is a mask, so the count must stay a power of two.
const _: () = assert!(NUM_SHARDS.is_power_of_two());
const SHARD_MASK: usize = NUM_SHARDS - 1;
const IGNORED_LOW_BITS: u32 = 8;

#[cfg(not(loom))]
const SYNC_PERIOD_NS: u64 = 2_000_000_000;

type PtrSet = HashSet<usize, foldhash::fast::RandomState>;

#[cfg(not(loom))]
static SHARED_DOMAIN: Domain = Domain::new();

#[cfg(loom)]
loom::lazy_static! {
    static ref SHARED_DOMAIN: Domain = Domain::new();
    static ref SHARD: loom::sync::atomic::AtomicUsize = loom::sync::atomic::AtomicUsize::new(0);
}

/// Synchronization point between hazard pointers and the writers they guard
/// against.
///
/// A [`HazardPointer`] can only guard against reclamation of objects that
/// are retired through the same domain the hazard pointer was created in.
/// Code that reads through hazard pointers from one domain while retiring
/// through another gets no protection whatsoever.
///
/// Most users want the process-wide domain returned by [`Domain::global`],
/// which the crate-level free functions ([`make_hazard_ptr`], [`retire`],
/// [`reclaim`], ...) are bound to; the global domain also feeds each
/// thread's slot cache, so handle churn there is cheap. Separate `Domain`
/// instances are still useful for tests and for data structures that want
/// their garbage isolated -- a domain reclaims everything it still holds
/// when dropped.
///
/// ## Reclamation
///
/// Retiring an object only marks it as logically deleted. Physical
/// destruction happens during a reclamation pass, which runs when enough
/// objects have accumulated, when a periodic deadline lapses, or when
/// [`Domain::reclaim`] forces one. A pass snapshots every slot in the
/// domain's directory and destroys exactly the retired records whose
/// address no snapshot entry protects; survivors wait for a later pass.
pub struct Domain {
    directory: Directory,
    free: Stack<Slot, FreeLink>,
    shards: [CachePadded<Stack<Retired, RetiredLink>>; NUM_SHARDS],
    count: AtomicIsize,
    #[cfg(not(loom))]
    due_time: AtomicU64,
    nbulk_reclaims: AtomicUsize,
}

// Macro so `new` can be a const fn except under loom, where the atomics
// have runtime constructors.
macro_rules! new {
    ($($decl:tt)*) => {
        /// Construct a fresh, empty domain.
        ///
        /// Prefer [`Domain::global`] unless you need isolated reclamation;
        /// see the type-level docs.
        pub $($decl)*() -> Self {
            #[cfg(not(loom))]
            let shards = {
                #[allow(clippy::declare_interior_mutable_const)]
                const SHARD: CachePadded<Stack<Retired, RetiredLink>> =
                    CachePadded::new(Stack::new());
                [SHARD; NUM_SHARDS]
            };
            #[cfg(loom)]
            let shards = [(); NUM_SHARDS].map(|()| CachePadded::new(Stack::new()));
            Self {
                directory: Directory::new(),
                free: Stack::new(),
                shards,
                count: AtomicIsize::new(0),
                #[cfg(not(loom))]
                due_time: AtomicU64::new(0),
                nbulk_reclaims: AtomicUsize::new(0),
            }
        }
    };
}

impl Domain {
    #[cfg(not(loom))]
    new!(const fn new);
    #[cfg(loom)]
    new!(fn new);

    /// Get a handle to the process-wide domain.
    pub fn global() -> &'static Self {
        &SHARED_DOMAIN
    }

    /// Hand out a slot, reusing a free one when possible.
    ///
    /// The free list only supports bulk drain (see [`Stack`]), so a reuse
    /// takes the whole list, keeps the head, and pushes the rest back. A
    /// thread that races with the drain simply allocates a fresh slot.
    pub(crate) fn acquire_slot(&self) -> &Slot {
        let head = self.free.pop_all();
        if head.is_null() {
            return self.acquire_new_slot();
        }
        // Safety: the drained sublist is exclusively ours.
        let slot = unsafe { &*head };
        let rest = FreeLink::next(slot).load(Ordering::Relaxed);
        // Safety: `rest` is the remainder of the drained sublist.
        unsafe { self.free.push_all(rest) };
        // The slot may carry an orphan marker from a dead thread.
        slot.reset();
        slot
    }

    fn acquire_new_slot(&self) -> &Slot {
        let slot = Box::into_raw(Box::new(Slot::new()));
        self.directory.push(slot);
        // Safety: directory slots are destroyed only by compaction, and
        // compaction only sees a slot once its last owner has pushed it onto
        // the free list.
        unsafe { &*slot }
    }

    /// Return a slot to the global free list, where it is available for
    /// reuse by any thread and for destruction by compaction.
    pub(crate) fn release_slot(&self, slot: &Slot) {
        // Safety: the caller was the slot's only owner and relinquishes it.
        unsafe { self.free.push(slot as *const Slot as *mut Slot) };
    }

    /// Retire `ptr`, destroying it through the global allocator (as a `Box`)
    /// once no hazard pointer protects it.
    ///
    /// Returns the number of objects destroyed by any reclamation pass this
    /// call triggered.
    ///
    /// `T: Send` because the object may be destroyed by a different thread.
    ///
    /// # Safety
    ///
    /// 1. `ptr` came out of `Box::into_raw`.
    /// 2. `ptr` will never again be handed to readers, and has not already
    ///    been retired (unless reclaimed since).
    /// 3. `ptr` remains valid as `&T` until this domain reclaims it or is
    ///    dropped.
    pub unsafe fn retire_ptr<T: Send>(&self, ptr: *mut T) -> usize {
        // Safety: forwarded from our own contract.
        unsafe { self.retire_ptr_with(ptr, &deleters::drop_box) }
    }

    /// Retire `ptr` with a caller-supplied deleter.
    ///
    /// # Safety
    ///
    /// As [`Domain::retire_ptr`], except that instead of coming from a
    /// `Box`, `ptr` must satisfy the allocation contract of `deleter`.
    pub unsafe fn retire_ptr_with<T: Send>(
        &self,
        ptr: *mut T,
        deleter: &'static dyn Deleter,
    ) -> usize {
        // Safety: the caller guarantees `ptr` stays valid until the deleter
        // runs, which happens before the domain goes away.
        let retired = Box::new(unsafe { Retired::new(ptr as *mut (dyn Reclaim + '_), deleter) });
        self.push_retired(retired)
    }

    fn push_retired(&self, retired: Box<Retired>) -> usize {
        // Pairs with the fence in `try_protect_ptr`: every write to the
        // object before retirement happens-before any snapshot that could
        // still observe a hazard naming it.
        crate::sync::atomic::fence(Ordering::SeqCst);
        let retired = Box::into_raw(retired);
        // Safety: `retired` is fresh and stays alive until a reclamation
        // pass drains it.
        unsafe { self.shards[Self::shard_of(retired)].push(retired) };
        self.count.fetch_add(1, Ordering::Release);
        self.check_threshold_and_reclaim()
    }

    #[cfg(not(loom))]
    fn shard_of(retired: *mut Retired) -> usize {
        // The low bits of a heap address carry no entropy.
        (retired as usize >> IGNORED_LOW_BITS) & SHARD_MASK
    }

    #[cfg(loom)]
    fn shard_of(_retired: *mut Retired) -> usize {
        SHARD.fetch_add(1, Ordering::Relaxed) & SHARD_MASK
    }

    /// Run a reclamation pass now and wait until no pass is in flight.
    ///
    /// Returns the number of retired objects destroyed by this pass.
    pub fn reclaim(&self) -> usize {
        self.nbulk_reclaims.fetch_add(1, Ordering::Acquire);
        let reclaimed = self.do_reclamation(0);
        self.wait_for_zero_bulk_reclaims();
        reclaimed
    }

    /// Compact the slot directory.
    ///
    /// Drains the global free list and removes every drained slot from the
    /// directory before destroying it. Slots still owned by handles or
    /// thread caches are untouched.
    pub fn compact(&self) {
        let head = self.free.pop_all();
        if head.is_null() {
            return;
        }
        let mut victims = PtrSet::default();
        let mut node = head;
        while !node.is_null() {
            victims.insert(node as usize);
            // Safety: the drained sublist is exclusively ours.
            node = FreeLink::next(unsafe { &*node }).load(Ordering::Relaxed);
        }
        self.directory.compact(&victims);
        let mut node = head;
        while !node.is_null() {
            let next = FreeLink::next(unsafe { &*node }).load(Ordering::Relaxed);
            // Safety: the slot is out of the directory and off every free
            // list, and the exclusive lock inside `compact` has drained all
            // snapshots that could still have been reading it.
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }

    fn check_count_threshold(&self) -> isize {
        let mut rcount = self.count.load(Ordering::Acquire);
        while rcount >= RECLAIM_THRESHOLD {
            match self
                .count
                .compare_exchange_weak(rcount, 0, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    #[cfg(not(loom))]
                    self.due_time
                        .store(Self::now() + SYNC_PERIOD_NS, Ordering::Release);
                    return rcount;
                }
                Err(now) => rcount = now,
            }
        }
        0
    }

    #[cfg(not(loom))]
    fn check_due_time(&self) -> isize {
        let time = Self::now();
        let due = self.due_time.load(Ordering::Acquire);
        if time < due
            || self
                .due_time
                .compare_exchange(
                    due,
                    time + SYNC_PERIOD_NS,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
        {
            // Not due yet, or another thread claimed this period.
            return 0;
        }
        let rcount = self.count.swap(0, Ordering::AcqRel);
        if rcount < 0 {
            // A concurrent pass had over-consumed; give the debt back.
            self.count.fetch_add(rcount, Ordering::Release);
            return 0;
        }
        rcount
    }

    #[cfg(not(loom))]
    fn now() -> u64 {
        use once_cell::sync::Lazy;
        use std::time::Instant;
        static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
        Instant::now().duration_since(*EPOCH).as_nanos() as u64
    }

    fn check_threshold_and_reclaim(&self) -> usize {
        #[allow(unused_mut)]
        let mut rcount = self.check_count_threshold();
        #[cfg(not(loom))]
        if rcount == 0 {
            rcount = self.check_due_time();
        }
        if rcount == 0 {
            return 0;
        }
        self.nbulk_reclaims.fetch_add(1, Ordering::Acquire);
        self.do_reclamation(rcount)
    }

    fn do_reclamation(&self, mut rcount: isize) -> usize {
        let mut total_reclaimed = 0;
        loop {
            let mut drained: [*mut Retired; NUM_SHARDS] = [std::ptr::null_mut(); NUM_SHARDS];
            let mut empty = true;
            for (shard, head) in self.shards.iter().zip(drained.iter_mut()) {
                *head = shard.pop_all();
                if !head.is_null() {
                    empty = false;
                }
            }

            let mut done = true;
            if !empty {
                // The heart of the scheme: this fence orders the drain above
                // against the directory snapshot below, pairing with the
                // fence in `try_protect_ptr`. A reader that loaded the
                // pointer before our snapshot has published it where the
                // snapshot will see it; a reader that publishes after the
                // snapshot must reload, and can no longer observe a pointer
                // we drained.
                crate::sync::atomic::fence(Ordering::SeqCst);
                let protected = self.directory.snapshot();
                let (reclaimed, finished) = self.match_reclaim(drained, &protected);
                done = finished;
                rcount -= reclaimed as isize;
                total_reclaimed += reclaimed;
            }

            if rcount != 0 {
                self.count.fetch_add(rcount, Ordering::Release);
            }
            rcount = self.check_count_threshold();
            if rcount == 0 && done {
                break;
            }
        }
        self.nbulk_reclaims.fetch_sub(1, Ordering::Release);
        total_reclaimed
    }

    fn match_reclaim(
        &self,
        drained: [*mut Retired; NUM_SHARDS],
        protected: &PtrSet,
    ) -> (usize, bool) {
        let mut kept = Chain::<Retired, RetiredLink>::new();
        let mut reclaimed = 0;
        for mut node in drained {
            let mut matched = Chain::<Retired, RetiredLink>::new();
            let mut unmatched = Chain::<Retired, RetiredLink>::new();
            while !node.is_null() {
                // Safety: the drained sublists are owned by this call.
                let record = unsafe { &*node };
                let next = RetiredLink::next(record).load(Ordering::Relaxed);
                debug_assert_ne!(node, next);
                if protected.contains(&record.raw_addr()) {
                    // Safety: `node` came off the drained sublist.
                    unsafe { matched.push(node) };
                } else {
                    // Safety: as above.
                    unsafe { unmatched.push(node) };
                    reclaimed += 1;
                }
                node = next;
            }
            let (unmatched_head, _) = unmatched.into_raw_parts();
            // Safety: no slot protects these records and we own them
            // outright.
            unsafe { self.reclaim_unprotected(unmatched_head) };
            kept.splice(matched);
        }
        // Deleters may retire more records; a clean exit requires seeing
        // every shard empty before the survivors go back.
        let done = self.shards.iter().all(|shard| shard.is_empty());
        // Survivors all land in shard 0: one exchange instead of eight.
        // Safety: `kept` is owned and its records are still live.
        unsafe { self.shards[0].push_chain(kept) };
        (reclaimed, done)
    }

    /// Destroy an owned sublist of retired records.
    ///
    /// Iterative on purpose: a deleter is allowed to retire further objects
    /// (which land back in the shards and are drained by the caller's
    /// loop), so reclamation must never recurse per record.
    ///
    /// # Safety
    ///
    /// Every record in `head` is valid, unaliased, unprotected, and owned
    /// by the caller.
    unsafe fn reclaim_unprotected(&self, mut head: *mut Retired) {
        while !head.is_null() {
            // Safety: ownership of each record transfers to us here; it was
            // allocated by `push_retired` via Box and never freed since.
            let record = unsafe { Box::from_raw(head) };
            head = record.next.load(Ordering::Relaxed);
            // Safety: the pointer/deleter pairing was established by
            // `retire_ptr_with`, and each record is destroyed exactly once.
            unsafe { record.deleter.delete(record.ptr) };
        }
    }

    fn wait_for_zero_bulk_reclaims(&self) {
        while self.nbulk_reclaims.load(Ordering::Acquire) > 0 {
            crate::sync::yield_now();
        }
    }

    fn reclaim_all_objects(&mut self) {
        for shard in &self.shards {
            let head = shard.pop_all();
            // Safety: `&mut self` means no hazard pointer into this domain
            // can still exist, so every record is unprotected.
            unsafe { self.reclaim_unprotected(head) };
        }
    }

    fn free_slots(&mut self) {
        let mut node = self.directory.head.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: `&mut self` means no handle or cache still references
            // any slot; the directory owns them all.
            let slot = unsafe { Box::from_raw(node) };
            node = DirLink::next(&*slot).load(Ordering::Relaxed);
            drop(slot);
        }
    }

    #[cfg(test)]
    pub(crate) fn directory_len(&self) -> usize {
        self.directory.len()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // A final pass that ignores both the threshold and the hazard scan:
        // with `&mut self` nothing can be protected any more.
        self.reclaim_all_objects();
        self.free_slots();
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

/// The slot directory: an intrusive list of every live slot, with a size
/// counter and the spinlock that arbitrates publication against compaction.
struct Directory {
    head: AtomicPtr<Slot>,
    len: AtomicUsize,
    lock: RwSpinLock,
}

impl Directory {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicUsize::new(0),
            lock: RwSpinLock::new(),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicUsize::new(0),
            lock: RwSpinLock::new(),
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Publish a freshly allocated slot.
    ///
    /// Shared mode suffices: publication only ever extends the chain, and
    /// the one operation that unlinks or destroys (compaction) takes the
    /// lock exclusively.
    fn push(&self, slot: *mut Slot) {
        self.lock.lock_shared();
        self.len.fetch_add(1, Ordering::Relaxed);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: `slot` is not shared until the exchange below.
            unsafe { DirLink::next(&*slot).store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, slot, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
        self.lock.unlock_shared();
    }

    /// Collect every address currently published by any slot.
    fn snapshot(&self) -> PtrSet {
        self.lock.lock_shared();
        let mut protected =
            PtrSet::with_capacity_and_hasher(self.len(), foldhash::fast::RandomState::default());
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: the shared lock keeps compaction from destroying any
            // directory slot while we walk.
            let slot = unsafe { &*node };
            let value = slot.load();
            if Slot::is_protecting(value) {
                protected.insert(value);
            }
            node = DirLink::next(slot).load(Ordering::Acquire);
        }
        self.lock.unlock_shared();
        protected
    }

    /// Rebuild the directory without the victim slots.
    ///
    /// Exclusive mode: holding the lock here guarantees no snapshot or
    /// publication is mid-walk when the victims are unlinked, which is what
    /// makes destroying them afterwards sound.
    fn compact(&self, victims: &PtrSet) {
        self.lock.lock();
        let mut node = self.head.load(Ordering::Acquire);
        let mut new_head: *mut Slot = std::ptr::null_mut();
        let mut tail: *mut Slot = std::ptr::null_mut();
        let mut len = 0;
        while !node.is_null() {
            // Safety: we hold the lock exclusively; every node is live.
            let next = DirLink::next(unsafe { &*node }).load(Ordering::Acquire);
            if !victims.contains(&(node as usize)) {
                if tail.is_null() {
                    new_head = node;
                } else {
                    unsafe { DirLink::next(&*tail).store(node, Ordering::Relaxed) };
                }
                tail = node;
                len += 1;
            }
            node = next;
        }
        if !tail.is_null() {
            unsafe { DirLink::next(&*tail).store(std::ptr::null_mut(), Ordering::Relaxed) };
        }
        self.head.store(new_head, Ordering::Release);
        self.len.store(len, Ordering::Relaxed);
        self.lock.unlock();
    }
}

/// A retired object: the type-erased pointer, the deleter that will destroy
/// it, and the link that threads it through a shard.
pub(crate) struct Retired {
    ptr: *mut dyn Reclaim,
    deleter: &'static dyn Deleter,
    next: AtomicPtr<Retired>,
}

impl Retired {
    /// # Safety
    ///
    /// `ptr` must stay valid until `deleter` runs on it.
    unsafe fn new(ptr: *mut (dyn Reclaim + '_), deleter: &'static dyn Deleter) -> Self {
        Retired {
            // Safety: the caller promises the referent outlives the record,
            // which is exactly what erasing the lifetime requires.
            ptr: unsafe { std::mem::transmute::<_, *mut (dyn Reclaim + 'static)>(ptr) },
            deleter,
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The raw address a hazard slot would publish to protect this object.
    fn raw_addr(&self) -> usize {
        self.ptr as *mut u8 as usize
    }
}

pub(crate) struct RetiredLink;

impl Link<Retired> for RetiredLink {
    fn next(node: &Retired) -> &AtomicPtr<Retired> {
        &node.next
    }
}
