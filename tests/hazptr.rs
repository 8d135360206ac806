#![cfg(not(loom))]

use quarantine::*;

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[derive(Default, Debug)]
struct Count {
    ctors: AtomicUsize,
    dtors: AtomicUsize,
}

impl Count {
    fn test_local() -> &'static Count {
        Box::leak(Box::new(Self::default()))
    }

    fn ctors(&self) -> usize {
        self.ctors.load(Ordering::SeqCst)
    }

    fn dtors(&self) -> usize {
        self.dtors.load(Ordering::SeqCst)
    }
}

struct Node {
    count: &'static Count,
    val: usize,
    next: AtomicPtr<Node>,
}

impl Node {
    fn new(count: &'static Count, val: usize, next: *mut Node) -> Self {
        count.ctors.fetch_add(1, Ordering::AcqRel);
        Self {
            count,
            val,
            next: AtomicPtr::new(next),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.count.dtors.fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn basic_protection() {
    let count = Count::test_local();
    let domain = Domain::new();

    let obj = Box::into_raw(Box::new(Node::new(count, 0, null_mut())));
    let p = AtomicPtr::new(obj);

    let mut h = HazardPointer::new_in_domain(&domain);
    let protected = unsafe { h.protect(&p) }.expect("not null");
    assert_eq!(protected.val, 0);
    assert_eq!(count.ctors(), 1);

    unsafe { domain.retire_ptr(p.into_inner()) };
    domain.reclaim();
    assert_eq!(count.dtors(), 0);

    h.reset_protection();
    domain.reclaim();
    assert_eq!(count.dtors(), 1);
}

#[test]
fn basic_protection_via_global_domain() {
    let count = Count::test_local();

    let obj = Box::into_raw(Box::new(Node::new(count, 0, null_mut())));
    let p = AtomicPtr::new(obj);

    let mut h = make_hazard_ptr();
    let protected = unsafe { h.protect(&p) }.expect("not null");
    assert_eq!(protected.val, 0);

    unsafe { retire(p.into_inner()) };
    reclaim();
    assert_eq!(count.dtors(), 0);

    h.reset_protection();
    // Other tests share the global domain, so our record may be riding in a
    // concurrent pass; keep reclaiming until it lands.
    while count.dtors() == 0 {
        reclaim();
    }
    assert_eq!(count.dtors(), 1);
}

fn hand_over_hand(head: &AtomicPtr<Node>, target: usize, domain: &Domain) -> bool {
    let mut array = HazardPointer::many_in_domain::<2>(domain);
    let handles = array.as_refs();
    let mut i = 0;
    'restart: loop {
        let mut prev: &AtomicPtr<Node> = head;
        let mut curr = prev.load(Ordering::Acquire);
        while !curr.is_null() {
            handles[i].protect_raw(curr);
            std::sync::atomic::fence(Ordering::SeqCst);
            // An unlink of `curr` strictly precedes its retirement, so as
            // long as `prev` still points at it, the publication above is
            // valid.
            if prev.load(Ordering::Acquire) != curr {
                continue 'restart;
            }
            // Safety: published and revalidated above.
            let node = unsafe { &*curr };
            if node.val == target {
                return true;
            }
            prev = &node.next;
            curr = node.next.load(Ordering::Acquire);
            i = 1 - i;
        }
        return false;
    }
}

#[test]
fn hand_over_hand_traversal() {
    const LEN: usize = 10;
    const THREADS: usize = 6;
    const TRAVERSALS: usize = 100;

    let count = Count::test_local();
    let domain: &'static Domain = Box::leak(Box::new(Domain::new()));

    let mut head = null_mut();
    for val in (0..LEN).rev() {
        head = Box::into_raw(Box::new(Node::new(count, val, head)));
    }
    let list: &'static AtomicPtr<Node> = Box::leak(Box::new(AtomicPtr::new(head)));

    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..TRAVERSALS {
                    assert!(hand_over_hand(list, LEN - 1, domain));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // Teardown: unlink everything and let the domain destroy it.
    let mut node = list.swap(null_mut(), Ordering::AcqRel);
    while !node.is_null() {
        let next = unsafe { &*node }.next.load(Ordering::Acquire);
        unsafe { domain.retire_ptr(node) };
        node = next;
    }
    domain.reclaim();
    assert_eq!(count.ctors(), LEN);
    assert_eq!(count.dtors(), LEN);
}

#[test]
fn cleanup_after_bulk_retire() {
    const THREADS: usize = 5;
    const PER_THREAD: usize = 100;

    let count = Count::test_local();
    let domain: &'static Domain = Box::leak(Box::new(Domain::new()));

    let threads: Vec<_> = (0..THREADS)
        .map(|tid| {
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let node = Box::into_raw(Box::new(Node::new(count, tid * PER_THREAD + i, null_mut())));
                    unsafe { domain.retire_ptr(node) };
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(count.ctors(), THREADS * PER_THREAD);
    domain.reclaim();
    assert_eq!(count.dtors(), THREADS * PER_THREAD);
}

#[test]
fn move_semantics() {
    let count = Count::test_local();
    let domain = Domain::new();

    let obj = Box::into_raw(Box::new(Node::new(count, 7, null_mut())));
    let p = AtomicPtr::new(obj);

    let mut h1 = HazardPointer::new_in_domain(&domain);
    let (node, _) = h1.protect_ptr(&p).expect("not null");

    // Protection follows the slot, not the binding.
    let h2 = h1;

    unsafe { domain.retire_ptr(p.into_inner()) };
    domain.reclaim();
    assert_eq!(count.dtors(), 0);
    // Safety: still protected by the slot now owned by h2.
    assert_eq!(unsafe { node.as_ref() }.val, 7);

    drop(h2);
    domain.reclaim();
    assert_eq!(count.dtors(), 1);
}

#[test]
fn recursive_retirement_in_deleter() {
    const DEPTH: usize = 2000;

    struct ChainNode {
        next: *mut ChainNode,
        domain: &'static Domain,
        dtors: &'static AtomicUsize,
    }
    // The raw pointer is uniquely owned; nodes only cross threads whole.
    unsafe impl Send for ChainNode {}

    impl Drop for ChainNode {
        fn drop(&mut self) {
            self.dtors.fetch_add(1, Ordering::AcqRel);
            if !self.next.is_null() {
                // Runs inside the reclamation pass that is destroying us;
                // the pass must keep draining iteratively rather than
                // recursing.
                unsafe { self.domain.retire_ptr(self.next) };
            }
        }
    }

    let domain: &'static Domain = Box::leak(Box::new(Domain::new()));
    let dtors: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));

    let mut last: *mut ChainNode = null_mut();
    for _ in 0..DEPTH {
        last = Box::into_raw(Box::new(ChainNode {
            next: last,
            domain,
            dtors,
        }));
    }
    unsafe { domain.retire_ptr(last) };
    domain.reclaim();
    assert_eq!(dtors.load(Ordering::SeqCst), DEPTH);
}

#[test]
fn threshold_triggers_reclamation_without_explicit_call() {
    const OBJECTS: usize = 2500;

    let count = Count::test_local();
    let domain = Domain::new();

    for i in 0..OBJECTS {
        let node = Box::into_raw(Box::new(Node::new(count, i, null_mut())));
        unsafe { domain.retire_ptr(node) };
    }
    assert!(count.dtors() > 0, "no pass triggered by retirement pressure");

    domain.reclaim();
    assert_eq!(count.dtors(), OBJECTS);
}

#[test]
fn reclaim_twice_destroys_nothing_new() {
    let count = Count::test_local();
    let domain = Domain::new();

    let node = Box::into_raw(Box::new(Node::new(count, 0, null_mut())));
    let at_retire = unsafe { domain.retire_ptr(node) };
    let first = domain.reclaim();
    assert_eq!(at_retire + first, 1);
    assert_eq!(domain.reclaim(), 0);
    assert_eq!(count.dtors(), 1);
}

#[test]
fn try_protect_detects_replacement() {
    let count = Count::test_local();
    let domain = Domain::new();

    let first = Box::into_raw(Box::new(Node::new(count, 1, null_mut())));
    let second = Box::into_raw(Box::new(Node::new(count, 2, null_mut())));
    let src = AtomicPtr::new(first);

    let mut h = HazardPointer::new_in_domain(&domain);
    let stale = src.load(Ordering::Acquire);
    src.store(second, Ordering::Release);

    match unsafe { h.try_protect(stale, &src) } {
        Err(now) => assert_eq!(now, second),
        Ok(_) => panic!("validated a stale pointer"),
    }

    unsafe { domain.retire_ptr(first) };
    unsafe { domain.retire_ptr(second) };
    domain.reclaim();
    assert_eq!(count.dtors(), 2);
}

#[test]
fn protects_multiple_sources_at_once() {
    let count = Count::test_local();
    let domain = Domain::new();

    let x = AtomicPtr::new(Box::into_raw(Box::new(Node::new(count, 1, null_mut()))));
    let y = AtomicPtr::new(Box::into_raw(Box::new(Node::new(count, 2, null_mut()))));

    let mut array = HazardPointer::many_in_domain::<2>(&domain);
    let [my_x, my_y] = unsafe { array.protect_all([&x, &y]) };
    assert_eq!(my_x.expect("not null").val, 1);
    assert_eq!(my_y.expect("not null").val, 2);

    unsafe { domain.retire_ptr(x.into_inner()) };
    unsafe { domain.retire_ptr(y.into_inner()) };
    domain.reclaim();
    assert_eq!(count.dtors(), 0);

    array.reset_protection();
    domain.reclaim();
    assert_eq!(count.dtors(), 2);
}

#[test]
fn individual_handles_from_an_array() {
    let count = Count::test_local();
    let domain = Domain::new();

    let x = AtomicPtr::new(Box::into_raw(Box::new(Node::new(count, 3, null_mut()))));

    let mut array = HazardPointer::many_in_domain::<3>(&domain);
    let [_, _, three] = array.as_refs();
    let my_x = unsafe { three.protect(&x) }.expect("not null");
    assert_eq!(my_x.val, 3);

    unsafe { domain.retire_ptr(x.into_inner()) };
    domain.reclaim();
    assert_eq!(count.dtors(), 0);

    drop(array);
    domain.reclaim();
    assert_eq!(count.dtors(), 1);
}

#[test]
fn custom_deleter_runs_instead_of_drop_box() {
    static FREED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn free_and_count(ptr: *mut (dyn Reclaim + 'static)) {
        FREED.fetch_add(1, Ordering::AcqRel);
        let _ = unsafe { Box::from_raw(ptr) };
    }
    const FREE_AND_COUNT: unsafe fn(*mut dyn Reclaim) = free_and_count;

    let domain = Domain::new();
    let p = Box::into_raw(Box::new(77u64));
    let at_retire = unsafe { domain.retire_ptr_with(p, &FREE_AND_COUNT) };
    let later = domain.reclaim();
    assert_eq!(at_retire + later, 1);
    assert_eq!(FREED.load(Ordering::SeqCst), 1);
}

#[test]
fn reserve_then_evict_round_trips_the_cache() {
    reserve_hazp(4);
    {
        let _hs = make_hazard_ptr_array::<4>();
    }
    evict_hazard_ptr();
    // Evicting the now-empty cache is a no-op.
    evict_hazard_ptr();

    // The evicted slots are back in the domain and reusable.
    let count = Count::test_local();
    let mut h = make_hazard_ptr();
    let p = AtomicPtr::new(Box::into_raw(Box::new(Node::new(count, 9, null_mut()))));
    assert_eq!(unsafe { h.protect(&p) }.expect("not null").val, 9);
    drop(h);
    unsafe { retire(p.into_inner()) };
    while count.dtors() == 0 {
        reclaim();
    }
}

#[test]
fn directory_survives_thread_churn_and_compaction() {
    let count = Count::test_local();
    let p: &'static AtomicPtr<Node> = Box::leak(Box::new(AtomicPtr::new(Box::into_raw(
        Box::new(Node::new(count, 11, null_mut())),
    ))));

    // A protection held on the main thread...
    let mut h = make_hazard_ptr();
    let protected = unsafe { h.protect(p) }.expect("not null");

    // ...while other threads churn handles through their caches and exit,
    // orphaning their slots.
    for _ in 0..4 {
        std::thread::spawn(|| {
            let mut hs = make_hazard_ptr_array::<3>();
            let mut one = make_hazard_ptr();
            one.protect_raw(0x1000 as *mut u8);
            one.reset_protection();
            hs.reset_protection();
        })
        .join()
        .unwrap();
    }

    // Compacting must only destroy the orphans, never the live slot.
    delete_hazard_ptr();

    unsafe { retire(p.swap(null_mut(), Ordering::AcqRel)) };
    reclaim();
    assert_eq!(count.dtors(), 0);
    assert_eq!(protected.val, 11);

    h.reset_protection();
    while count.dtors() == 0 {
        reclaim();
    }
    assert_eq!(count.dtors(), 1);
}
