use crate::sync::atomic::AtomicU32;
use crate::sync::yield_now;
use std::sync::atomic::Ordering;

const WRITER: u32 = 1 << 31;

/// Reader-writer spinlock packed into one 32-bit word: the high bit is the
/// writer flag, the low 31 bits count shared holders.
///
/// Writers can starve under an unbounded reader stream. That is acceptable
/// here: the lock guards only short directory operations (publication,
/// snapshot, compaction) and no holder ever blocks while holding it.
pub(crate) struct RwSpinLock {
    state: AtomicU32,
}

impl RwSpinLock {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    pub(crate) fn try_lock_shared(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        state & WRITER == 0
            && self
                .state
                .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn lock_shared(&self) {
        while !self.try_lock_shared() {
            yield_now();
        }
    }

    pub(crate) fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(prev & !WRITER, 0);
    }

    pub(crate) fn lock(&self) {
        while self
            .state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            yield_now();
        }
    }

    pub(crate) fn unlock(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);
    }
}
