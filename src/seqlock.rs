use crate::sync::atomic::AtomicU32;
use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A sequence lock: a value cell guarded by a publication-parity counter.
///
/// Writers are serialized by a mutex and bracket every store with two
/// counter increments, so the counter is odd exactly while a write is in
/// progress. Readers copy the value out optimistically and accept the copy
/// only if the counter was even and unchanged around the read; otherwise
/// they retry (or report "unavailable", for the bounded variants).
///
/// Readers never block writers, a reader never observes a half-written
/// value, and the single writer always makes progress.
///
/// `T: Copy` because a discarded torn read must be free of side effects.
pub struct SeqLock<T> {
    seq: AtomicU32,
    writer: Mutex<()>,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is mediated by the sequence protocol; readers
// only ever copy `T` out, so sharing the lock requires no more than being
// able to move values of `T` between threads.
unsafe impl<T: Send + Copy> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    /// Create a sequence lock holding `value`.
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            writer: Mutex::new(()),
            value: UnsafeCell::new(value),
        }
    }

    /// Create a sequence lock holding `value`.
    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            writer: Mutex::new(()),
            value: UnsafeCell::new(value),
        }
    }

    /// Attempt one optimistic read.
    ///
    /// Returns `None` if a write was in progress or completed while we were
    /// reading.
    pub fn try_read(&self) -> Option<T> {
        let seq1 = self.seq.load(Ordering::Acquire);
        if seq1 & 1 == 1 {
            return None;
        }
        // Possibly racing with a writer; the parity check below discards
        // any torn copy before it is ever used.
        let value = unsafe { std::ptr::read_volatile(self.value.get()) };
        // Keeps the value read above from drifting past the re-check.
        crate::sync::atomic::fence(Ordering::Acquire);
        let seq2 = self.seq.load(Ordering::Relaxed);
        (seq1 == seq2).then_some(value)
    }

    /// Read the value, retrying until a consistent copy is observed.
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.try_read() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Read with a bounded number of attempts.
    ///
    /// Returns `None` if no attempt observed a consistent value, e.g.
    /// because a writer held the sequence odd the whole time.
    pub fn read_bounded(&self, attempts: usize) -> Option<T> {
        for _ in 0..attempts {
            if let Some(value) = self.try_read() {
                return Some(value);
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Store a new value.
    pub fn write(&self, value: T) {
        self.start_write().store(value);
    }

    /// Begin a write, holding the sequence odd until the guard drops.
    ///
    /// While the guard lives, concurrent `try_read`s report unavailable and
    /// `read` spins. Several stores may be issued through one guard; they
    /// are published together when the guard drops.
    pub fn start_write(&self) -> SeqWriteGuard<'_, T> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        // Odd mark first, stores after: pairs with the fence in `try_read`.
        crate::sync::atomic::fence(Ordering::Release);
        SeqWriteGuard {
            lock: self,
            seq,
            _writer: guard,
        }
    }
}

/// An in-progress write on a [`SeqLock`]. See [`SeqLock::start_write`].
pub struct SeqWriteGuard<'lock, T: Copy> {
    lock: &'lock SeqLock<T>,
    seq: u32,
    _writer: MutexGuard<'lock, ()>,
}

impl<T: Copy> SeqWriteGuard<'_, T> {
    /// Store a value. Visible to readers once the guard drops.
    pub fn store(&mut self, value: T) {
        // Safety: the mutex makes this the only writer, and readers only
        // copy; the sequence parity invalidates their racing copies.
        unsafe { std::ptr::write_volatile(self.lock.value.get(), value) };
    }
}

impl<T: Copy> Drop for SeqWriteGuard<'_, T> {
    fn drop(&mut self) {
        // Back to even; publishes every store issued under the guard.
        self.lock
            .seq
            .store(self.seq.wrapping_add(2), Ordering::Release);
    }
}
