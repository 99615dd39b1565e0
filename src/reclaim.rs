//! Typed atomic pointers on top of `seize`.
//!
//! Every allocation that concurrent readers may still be looking at (tables, bin entries
//! and values) is created through a [`Collector`] and only ever freed by retiring it
//! through a [`Guard`]. [`Shared`] is a pointer loaded under a guard and is only valid
//! for as long as that guard lives.

pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::{fmt, ptr};

/// An atomic pointer to a `T` allocated by a [`Collector`].
pub(crate) struct Atomic<T>(seize::AtomicPtr<T>);

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Self(seize::AtomicPtr::default())
    }

    /// Loads the pointer, protecting the pointee for the lifetime of `guard`.
    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        guard.protect(&self.0, ordering).into()
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ordering: Ordering) {
        self.0.store(new.ptr, ordering);
    }

    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        ordering: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        self.0.swap(new.ptr, ordering).into()
    }

    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'g, T>,
        success: Ordering,
        failure: Ordering,
        _: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, CompareExchangeError<'g, T>> {
        match self
            .0
            .compare_exchange(current.ptr, new.ptr, success, failure)
        {
            Ok(ptr) => Ok(ptr.into()),
            Err(current) => Err(CompareExchangeError {
                current: current.into(),
                new,
            }),
        }
    }

    /// Takes ownership of the pointee.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, and no other thread may be able to reach the pointee.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.0.into_inner()) }
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic(shared.ptr.into())
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0.load(Ordering::SeqCst))
    }
}

/// The outcome of a failed [`Atomic::compare_exchange`].
///
/// `new` is handed back so that the caller can reuse or free it.
pub(crate) struct CompareExchangeError<'g, T> {
    pub(crate) current: Shared<'g, T>,
    pub(crate) new: Shared<'g, T>,
}

/// A pointer that is protected for the lifetime `'g` of the guard it was loaded with.
pub(crate) struct Shared<'g, T> {
    ptr: *mut Linked<T>,
    _guard: PhantomData<&'g ()>,
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    /// Allocates `value` through `collector` so that it can later be retired.
    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    /// Takes ownership of the pointee.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and must never have been visible to another thread,
    /// or every thread that could see it must be gone.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.ptr) }
    }

    /// # Safety
    ///
    /// The pointer must be null or point to a live allocation protected by `'g`.
    pub(crate) unsafe fn as_ref(&self) -> Option<&'g Linked<T>> {
        unsafe { self.ptr.as_ref() }
    }

    /// # Safety
    ///
    /// The pointer must be non-null and point to a live allocation protected by `'g`.
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.ptr }
    }

    #[cfg(test)]
    pub(crate) fn as_ptr(&self) -> *mut Linked<T> {
        self.ptr
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<T> PartialEq for Shared<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(ptr: *mut Linked<T>) -> Self {
        Shared {
            ptr,
            _guard: PhantomData,
        }
    }
}

pub(crate) trait RetireShared {
    /// Hands `shared` to the collector, which frees it once no guard can observe it.
    ///
    /// # Safety
    ///
    /// `shared` must be non-null, must already be unreachable for threads that enter
    /// after this call, and must not be retired twice.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);
}

impl RetireShared for Guard<'_> {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.retire(shared.ptr, seize::reclaim::boxed::<T>) }
    }
}

/// A guard that protects nothing, for code paths that own the whole structure.
///
/// # Safety
///
/// No other thread may be accessing any pointer loaded through the returned guard.
pub(crate) unsafe fn unprotected() -> Guard<'static> {
    unsafe { Guard::unprotected() }
}
