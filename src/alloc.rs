//! Allocator capability used to place control blocks
//!
//! A control block is always allocated through a [`RawAlloc`]. The detached
//! layout uses the allocator only for the block itself. The inline layout also
//! routes construction and destruction of the managed value through it.

use crate::error::AllocError;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// Raw storage provider for control blocks
///
/// # Safety
///
/// `allocate` must return memory valid for reads and writes of
/// `layout.size()` bytes and aligned to `layout.align()`, which stays valid
/// until passed back to `deallocate` with the same layout. Allocators are
/// moved into the blocks they create, so `deallocate` must accept memory
/// returned by any clone of `self` (or by `self` before it was moved).
pub unsafe trait RawAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` with the same `layout` and must not be
    /// used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Move `value` into uninitialized storage.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes and properly aligned for `T`.
    unsafe fn construct<T>(&self, ptr: NonNull<T>, value: T) {
        unsafe { ptr.as_ptr().write(value) }
    }

    /// Drop the value at `ptr` in place, leaving the storage allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `T` that is not used afterwards.
    unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        unsafe { ptr::drop_in_place(ptr.as_ptr()) }
    }
}

/// Backed by `std::alloc`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Global;

unsafe impl RawAlloc for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return NonNull::new(ptr::without_provenance_mut(layout.align()))
                .ok_or(AllocError::out_of_memory(layout));
        }
        // SAFETY: layout has a non-zero size
        let raw = unsafe { std::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(AllocError::out_of_memory(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Never provides memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exhausted;

unsafe impl RawAlloc for Exhausted {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError::out_of_memory(layout))
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        unreachable!("Exhausted never hands out memory")
    }
}

/// Snapshot of the traffic seen by a [`CountingAlloc`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: usize,
    pub deallocations: usize,
    pub constructs: usize,
    pub destroys: usize,
    pub bytes_live: usize,
}

impl AllocStats {
    /// Number of allocations not yet returned.
    pub fn live(&self) -> usize {
        self.allocations - self.deallocations
    }
}

/// Allocator wrapper recording every call it forwards
///
/// All clones share one statistics record, so a clone moved into a control
/// block keeps reporting to the handle the caller kept.
///
/// ```
/// use shareptr::{CountingAlloc, Shared};
///
/// let alloc = CountingAlloc::new();
/// let ptr = Shared::new_in(7, alloc.clone()).unwrap();
/// assert_eq!(alloc.stats().live(), 1);
/// drop(ptr);
/// assert_eq!(alloc.stats().live(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CountingAlloc<A = Global> {
    inner: A,
    limit: Option<usize>,
    stats: Arc<Mutex<AllocStats>>,
}

impl CountingAlloc<Global> {
    pub fn new() -> Self {
        Self::wrap(Global)
    }

    /// Refuses allocation while `limit` allocations are outstanding.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }
}

impl<A> CountingAlloc<A> {
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            limit: None,
            stats: Arc::new(Mutex::new(AllocStats::default())),
        }
    }

    pub fn stats(&self) -> AllocStats {
        *self.stats.lock()
    }
}

unsafe impl<A: RawAlloc> RawAlloc for CountingAlloc<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let mut stats = self.stats.lock();
        if let Some(limit) = self.limit {
            if stats.live() >= limit {
                return Err(AllocError::limit_reached(limit, layout));
            }
        }
        let ptr = self.inner.allocate(layout)?;
        stats.allocations += 1;
        stats.bytes_live += layout.size();
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        {
            let mut stats = self.stats.lock();
            stats.deallocations += 1;
            stats.bytes_live -= layout.size();
        }
        unsafe { self.inner.deallocate(ptr, layout) }
    }

    unsafe fn construct<T>(&self, ptr: NonNull<T>, value: T) {
        self.stats.lock().constructs += 1;
        unsafe { self.inner.construct(ptr, value) }
    }

    unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        // the lock is released before T::drop runs; it may free further blocks
        self.stats.lock().destroys += 1;
        unsafe { self.inner.destroy(ptr) }
    }
}
