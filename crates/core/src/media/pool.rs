use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Default number of idle records a pool keeps.
pub const DEFAULT_POOL_SIZE: usize = 64;

struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    size: AtomicUsize,
}

impl<T> PoolInner<T> {
    fn recycle(&self, value: T) {
        let mut free = self.free.lock();
        if free.len() < self.size.load(Ordering::Relaxed) {
            free.push(value);
        }
    }
}

/// A bounded free list of reusable records.
///
/// [`obtain`](Self::obtain) hands out an idle record, or a fresh
/// `T::default()` when none is idle. The returned [`Pooled`] goes back to
/// the pool when dropped, unless the pool already holds `size` idle records
/// or has itself been dropped. The size bounds memory, never correctness.
///
/// Records come back with their previous contents; callers overwrite them.
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Default> ResourcePool<T> {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(size)),
                size: AtomicUsize::new(size),
            }),
        }
    }

    pub fn obtain(&self) -> Pooled<T> {
        let value = self.inner.free.lock().pop().unwrap_or_default();
        Pooled {
            value: Some(value),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Change the idle limit. Shrinking drops surplus idle records.
    pub fn set_size(&self, size: usize) {
        self.inner.size.store(size, Ordering::Relaxed);
        self.inner.free.lock().truncate(size);
    }

    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl<T: Default> Default for ResourcePool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl<T> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("size", &self.inner.size.load(Ordering::Relaxed))
            .field("idle", &self.inner.free.lock().len())
            .finish()
    }
}

/// A record checked out of a [`ResourcePool`].
pub struct Pooled<T> {
    value: Option<T>,
    pool: Weak<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Take the record out of pool management.
    pub fn into_inner(mut self) -> Option<T> {
        self.pool = Weak::new();
        self.value.take()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `into_inner` and `drop` take the value, and both consume `self`.
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value taken"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value taken"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(pool)) = (self.value.take(), self.pool.upgrade()) {
            pool.recycle(value);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}
