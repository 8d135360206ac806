use crate::domain::Domain;
use crate::slot::Slot;
use crate::sync::atomic::AtomicPtr;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

#[cfg(doc)]
use crate::*;

/// A type that can protect a referenced object from reclamation.
///
/// Protects up to a single address from concurrent reclamation in its
/// [`Domain`]. A hazard pointer does nothing when first constructed; load a
/// pointer through it with [`HazardPointer::protect`] to protect the
/// referent. The protection is tied to the exclusive (`&mut`) borrow that
/// `protect` takes: when the borrow ends, so does the protection.
///
/// Protection only works against writers that retire through the *same*
/// domain the handle was created in.
///
/// Handles are move-only owners of their slot and are deliberately not
/// `Send`: the destructor returns the slot to the creating thread's cache,
/// so a handle must die on the thread that made it.
pub struct HazardPointer<'domain> {
    slot: &'domain Slot,
    domain: &'domain Domain,
    _not_send: PhantomData<*mut ()>,
}

impl Default for HazardPointer<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl HazardPointer<'static> {
    /// Create a hazard pointer in the global domain.
    ///
    /// The slot comes from the calling thread's cache; the domain is only
    /// consulted when the cache is empty.
    pub fn new() -> Self {
        Self::from_parts(Domain::global(), crate::cache::slot())
    }

    /// Create `N` hazard pointers in the global domain in one bulk
    /// acquisition from the thread cache.
    pub fn many<const N: usize>() -> HazardPointerArray<'static, N> {
        assert!(N > 0);
        let slots = crate::cache::slots::<N>();
        HazardPointerArray {
            haz_ptrs: slots.map(|slot| Self::from_parts(Domain::global(), slot)),
        }
    }
}

impl<'domain> HazardPointer<'domain> {
    pub(crate) fn from_parts(domain: &'domain Domain, slot: &'domain Slot) -> Self {
        Self {
            slot,
            domain,
            _not_send: PhantomData,
        }
    }

    /// Create a hazard pointer in the given domain.
    ///
    /// Bypasses the thread cache; the slot comes straight from `domain`.
    pub fn new_in_domain(domain: &'domain Domain) -> Self {
        Self::from_parts(domain, domain.acquire_slot())
    }

    /// Create `N` hazard pointers in the given domain.
    pub fn many_in_domain<const N: usize>(domain: &'domain Domain) -> HazardPointerArray<'domain, N> {
        assert!(N > 0);
        HazardPointerArray {
            haz_ptrs: [(); N].map(|()| Self::new_in_domain(domain)),
        }
    }

    /// Protect the value loaded from `src` and dereference it to `&T`.
    ///
    /// Loads `src`, publishes the loaded pointer, then re-loads to check
    /// that the pointer did not change in between; on a change the loop
    /// starts over with the new value. Returns `None` if the loaded pointer
    /// is null.
    ///
    /// `T` must be `Sync` since we do not know which thread stored the
    /// pointer in the first place.
    ///
    /// # Safety
    ///
    /// 1. The value loaded from `src` is a valid `&T`, or null.
    /// 2. The referent is only ever deallocated through `retire` calls on
    ///    the same [`Domain`] this handle belongs to.
    pub unsafe fn protect<'l, T>(&'l mut self, src: &AtomicPtr<T>) -> Option<&'l T>
    where
        T: Sync,
    {
        let (ptr, _proof): (_, PhantomData<&'l T>) = self.protect_ptr(src)?;
        // Safety: `ptr` is protected for 'l, and valid by requirement 1.
        Some(unsafe { ptr.as_ref() })
    }

    /// Protect the value loaded from `src` and return it as `NonNull<T>`.
    ///
    /// Same loop as [`HazardPointer::protect`], without the dereference.
    /// The `PhantomData` in the return value witnesses how long the
    /// protection lasts.
    pub fn protect_ptr<'l, T>(
        &'l mut self,
        src: &AtomicPtr<T>,
    ) -> Option<(NonNull<T>, PhantomData<&'l T>)> {
        let mut ptr = src.load(Ordering::Acquire);
        loop {
            match self.try_protect_ptr(ptr, src) {
                Ok(None) => break None,
                Ok(Some((ptr, _))) => break Some((ptr, PhantomData)),
                Err(now) => ptr = now,
            }
        }
    }

    /// Protect `ptr` and dereference it to `&T` if `src` still holds it.
    ///
    /// Single-attempt variant of [`HazardPointer::protect`]: if `src` no
    /// longer holds `ptr`, the new value is returned in `Err` and nothing
    /// is protected.
    ///
    /// Returns `Ok(None)` if `ptr` is null.
    ///
    /// # Safety
    ///
    /// As for [`HazardPointer::protect`].
    pub unsafe fn try_protect<'l, T>(
        &'l mut self,
        ptr: *mut T,
        src: &AtomicPtr<T>,
    ) -> Result<Option<&'l T>, *mut T>
    where
        T: Sync,
    {
        let ptr: Option<(_, PhantomData<&'l T>)> = self.try_protect_ptr(ptr, src)?;
        // Safety: protected for 'l, and valid by the caller's guarantee.
        Ok(ptr.map(|(ptr, _)| unsafe { ptr.as_ref() }))
    }

    /// Protect `ptr` if `src` still holds it, returning it as `NonNull<T>`.
    ///
    /// Single-attempt variant of [`HazardPointer::protect_ptr`].
    #[allow(clippy::type_complexity)]
    pub fn try_protect_ptr<'l, T>(
        &'l mut self,
        ptr: *mut T,
        src: &AtomicPtr<T>,
    ) -> Result<Option<(NonNull<T>, PhantomData<&'l T>)>, *mut T> {
        self.slot.publish(ptr as *mut u8);

        // Pairs with the fence a reclaimer issues between draining the
        // retired shards and snapshotting the slot directory: either that
        // snapshot observes this publication, or the load below observes
        // the update that made `ptr` stale.
        crate::sync::atomic::fence(Ordering::SeqCst);

        let now = src.load(Ordering::Acquire);
        if ptr != now {
            self.slot.reset();
            Err(now)
        } else {
            Ok(NonNull::new(ptr).map(|ptr| (ptr, PhantomData)))
        }
    }

    /// Publish `ptr` without any validation.
    ///
    /// This only writes the address into the slot. On its own that does
    /// not make dereferencing `ptr` safe: the publication may not yet be
    /// visible to a reclaimer that has already drained the retired lists,
    /// and `ptr` may already have been retired. Callers must follow the
    /// publication with a `SeqCst` fence and then re-validate, through
    /// whatever invariant their data structure provides, that `ptr` had
    /// not been retired -- re-loading the source pointer and comparing, in
    /// the common case. The validated-protect methods above do exactly
    /// this; prefer them unless the validation needs structure-specific
    /// knowledge (hand-over-hand traversal is the classic case).
    pub fn protect_raw<T>(&mut self, ptr: *mut T) {
        self.slot.publish(ptr as *mut u8);
    }

    /// Release the protection awarded by this hazard pointer, if any.
    pub fn reset_protection(&mut self) {
        self.slot.reset();
    }
}

impl Drop for HazardPointer<'_> {
    fn drop(&mut self) {
        self.slot.reset();
        if std::ptr::eq(self.domain, Domain::global()) && crate::cache::release(self.slot) {
            return;
        }
        // Non-global domain, or the thread cache is already tearing down:
        // the slot goes back to the domain's free list.
        self.domain.release_slot(self.slot);
    }
}

/// `N` hazard pointers, acquired and released in bulk.
///
/// Construct with [`HazardPointer::many`] /
/// [`HazardPointer::many_in_domain`], or [`make_hazard_ptr_array`]. Use the
/// individual handles through [`HazardPointerArray::as_refs`], or protect
/// `N` sources at once with [`HazardPointerArray::protect_all`].
pub struct HazardPointerArray<'domain, const N: usize> {
    haz_ptrs: [HazardPointer<'domain>; N],
}

impl<const N: usize> Default for HazardPointerArray<'static, N> {
    fn default() -> Self {
        HazardPointer::many::<N>()
    }
}

impl<'domain, const N: usize> HazardPointerArray<'domain, N> {
    /// Reference the `N` allocated [`HazardPointer`]s individually.
    ///
    /// Slicing into the array directly would mutably borrow the whole
    /// array; the returned per-element borrows can be used independently.
    pub fn as_refs<'array>(&'array mut self) -> [&'array mut HazardPointer<'domain>; N] {
        self.haz_ptrs.each_mut()
    }

    /// Protect the value loaded from each source, and dereference each to
    /// `&T`.
    ///
    /// The order of the returned references matches `sources`. Produces
    /// `None` at an index whose loaded pointer was null.
    ///
    /// # Safety
    ///
    /// As for [`HazardPointer::protect`], for every source.
    pub unsafe fn protect_all<'l, T>(
        &'l mut self,
        sources: [&AtomicPtr<T>; N],
    ) -> [Option<&'l T>; N]
    where
        T: Sync,
    {
        let mut out = [None; N];
        for (i, (hazptr, src)) in self.haz_ptrs.iter_mut().zip(sources).enumerate() {
            // Safety: forwarded from our own contract.
            out[i] = unsafe { hazptr.protect(src) };
        }
        out
    }

    /// Release the protection of every contained hazard pointer.
    pub fn reset_protection(&mut self) {
        for hazptr in self.haz_ptrs.iter_mut() {
            hazptr.reset_protection();
        }
    }
}
