//! Typed facade over a segregated pool.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::error::{MemoryError, MemoryResult};
use crate::segregated::{RawPool, SegregatedPool, SegregatedPoolConfig};

/// Alignment the backing slots guarantee.
const SLOT_ALIGN: usize = mem::align_of::<usize>();

/// Typed object pool backed by any segregated pool shape.
///
/// The pool hands out raw storage for `T`; it never runs constructors or
/// destructors itself. [`allocate_with`](Self::allocate_with) and
/// [`free_value`](Self::free_value) are the convenience pair that writes
/// and drops values in place for callers who want the whole lifecycle.
///
/// # Example
/// ```
/// use strata_memory::object::ObjectPool;
///
/// #[derive(Debug, PartialEq)]
/// struct Node {
///     value: u64,
///     next: u64,
/// }
///
/// let pool: ObjectPool<Node> = ObjectPool::new()?;
/// let node = pool.allocate_with(Node { value: 7, next: 0 })?;
/// unsafe {
///     assert_eq!(node.as_ref().value, 7);
///     pool.free_value(node)?;
/// }
/// # Ok::<(), strata_memory::MemoryError>(())
/// ```
pub struct ObjectPool<T, P: RawPool = SegregatedPool> {
    pool: P,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> ObjectPool<T, SegregatedPool> {
    /// Creates a single-threaded pool sized for `T` with the default block
    /// capacity.
    pub fn new() -> MemoryResult<Self> {
        Self::from_pool(SegregatedPool::with_config(SegregatedPoolConfig::for_type::<T>())?)
    }

    /// Creates a single-threaded pool sized for `T` holding
    /// `items_per_block` values per block.
    pub fn with_items_per_block(items_per_block: usize) -> MemoryResult<Self> {
        Self::from_pool(SegregatedPool::with_config(
            SegregatedPoolConfig::for_type::<T>().with_items_per_block(items_per_block),
        )?)
    }
}

impl<T, P: RawPool> ObjectPool<T, P> {
    /// Wraps an existing segregated pool, checking that its slots can hold
    /// a `T`.
    pub fn from_pool(pool: P) -> MemoryResult<Self> {
        if mem::align_of::<T>() > SLOT_ALIGN {
            return Err(MemoryError::UnsupportedAlignment {
                required: mem::align_of::<T>(),
                supported: SLOT_ALIGN,
            });
        }
        // Slots are at least a pointer wide and pointer-granular, so the
        // usable capacity can exceed the configured item size.
        let capacity = crate::utils::align_up(
            pool.item_size().max(mem::size_of::<usize>()),
            SLOT_ALIGN,
        );
        if mem::size_of::<T>() > capacity {
            return Err(MemoryError::ExceedsMaxSize {
                requested: mem::size_of::<T>(),
                max: capacity,
            });
        }

        Ok(Self {
            pool,
            _marker: PhantomData,
        })
    }

    /// Hands out uninitialized storage for one `T`.
    pub fn allocate(&self) -> MemoryResult<NonNull<T>> {
        Ok(self.pool.allocate()?.cast())
    }

    /// Returns storage to the pool without touching its contents.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this pool's [`allocate`](Self::allocate) and
    /// must not be used afterwards. Any value still in the storage is not
    /// dropped.
    pub unsafe fn free(&self, ptr: NonNull<T>) -> MemoryResult<()> {
        self.pool.free(ptr.cast())
    }

    /// Allocates storage and moves `value` into it.
    pub fn allocate_with(&self, value: T) -> MemoryResult<NonNull<T>> {
        let ptr = self.allocate()?;
        // SAFETY: fresh storage, properly sized and aligned for `T`.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drops the value in place and returns its storage to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this pool and hold a live `T`; it must not be
    /// used afterwards.
    pub unsafe fn free_value(&self, ptr: NonNull<T>) -> MemoryResult<()> {
        ptr::drop_in_place(ptr.as_ptr());
        self.free(ptr)
    }

    /// Allocates `value` behind an RAII handle that drops it and frees the
    /// storage when it goes out of scope.
    pub fn allocate_boxed(&self, value: T) -> MemoryResult<PooledBox<'_, T, P>> {
        Ok(PooledBox {
            value: self.allocate_with(value)?,
            pool: self,
        })
    }

    /// The backing segregated pool.
    pub fn inner(&self) -> &P {
        &self.pool
    }
}

/// RAII handle to a pool-resident value.
///
/// Dereferences to `T`; dropping the handle drops the value in place and
/// returns its storage to the pool.
pub struct PooledBox<'pool, T, P: RawPool = SegregatedPool> {
    value: NonNull<T>,
    pool: &'pool ObjectPool<T, P>,
}

impl<T, P: RawPool> PooledBox<'_, T, P> {
    /// Releases the handle without dropping or freeing the value.
    ///
    /// The caller takes over the storage and is responsible for eventually
    /// passing the pointer to [`ObjectPool::free_value`].
    pub fn detach(self) -> NonNull<T> {
        let value = self.value;
        mem::forget(self);
        value
    }
}

impl<T, P: RawPool> std::ops::Deref for PooledBox<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the handle owns a live, initialized value.
        unsafe { self.value.as_ref() }
    }
}

impl<T, P: RawPool> std::ops::DerefMut for PooledBox<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the handle owns a live, initialized value exclusively.
        unsafe { self.value.as_mut() }
    }
}

impl<T, P: RawPool> Drop for PooledBox<'_, T, P> {
    fn drop(&mut self) {
        // SAFETY: the handle owns the value and its storage; both came
        // from this pool.
        unsafe {
            let _ = self.pool.free_value(self.value);
        }
    }
}

impl<T: std::fmt::Debug, P: RawPool> std::fmt::Debug for PooledBox<'_, T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        T::fmt(self, f)
    }
}
