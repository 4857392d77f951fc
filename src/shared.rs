//! Strong owning handle
//!
//! `Shared<T>` keeps the managed object alive. Every live non-empty handle
//! accounts for one unit of its block's strong count; when the last one goes
//! away the object is destroyed, and the block follows once no `Weak` is
//! left either.

use crate::alloc::{Global, RawAlloc};
use crate::block::{self, BlockHeader, RawRef};
use crate::deleter::{DefaultDelete, Deleter};
use crate::error::AllocError;
use crate::self_ref::EnableSharedFromThis;
use crate::weak::Weak;
use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};

/// Shared owning pointer
///
/// A handle is either empty or points at a live object together with the
/// control block counting it. It is not `Send`/`Sync`: counters are plain
/// cells.
///
/// ```
/// use shareptr::Shared;
///
/// let first = Shared::new(String::from("hello"));
/// let second = first.clone();
/// assert_eq!(first.use_count(), 2);
/// assert_eq!(*second, "hello");
/// ```
pub struct Shared<T: ?Sized> {
    raw: Option<RawRef<T>>,
    _owns: PhantomData<T>,
}

impl<T: ?Sized> Shared<T> {
    /// Handle owning nothing. Does not allocate.
    pub const fn empty() -> Self {
        Self {
            raw: None,
            _owns: PhantomData,
        }
    }

    /// Adopts one strong unit already accounted for in `raw.block`.
    pub(crate) fn from_raw_ref(raw: RawRef<T>) -> Self {
        Self {
            raw: Some(raw),
            _owns: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> Option<RawRef<T>> {
        self.raw
    }

    fn header(&self) -> Option<&BlockHeader> {
        // SAFETY: this handle owns a strong unit, so the block is live
        self.raw.as_ref().map(|raw| unsafe { raw.block.as_ref() })
    }

    /// Take ownership of a boxed object through a detached block.
    pub fn from_box(value: Box<T>) -> Self {
        let object = NonNull::from(Box::leak(value));
        // SAFETY: the pointer came out of a Box, which DefaultDelete reclaims
        match unsafe { Self::from_raw_in(object, DefaultDelete, Global) } {
            Ok(this) => this,
            Err(err) => err.handle(),
        }
    }

    /// Take ownership of `ptr`, to be disposed of by `deleter`.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until `deleter` runs on it, and nothing else may
    /// free it or hand it to another owning constructor.
    pub unsafe fn from_raw_with<D>(ptr: NonNull<T>, deleter: D) -> Self
    where
        D: Deleter<T> + 'static,
    {
        match unsafe { Self::from_raw_in(ptr, deleter, Global) } {
            Ok(this) => this,
            Err(err) => err.handle(),
        }
    }

    /// Take ownership of `ptr`, placing the control block with `alloc`.
    ///
    /// If no block can be allocated, `deleter` is run on `ptr` and the error
    /// is returned.
    ///
    /// # Safety
    ///
    /// Same as [`Shared::from_raw_with`].
    pub unsafe fn from_raw_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where
        D: Deleter<T> + 'static,
        A: RawAlloc + 'static,
    {
        let raw = unsafe { block::allocate_detached(ptr, deleter, alloc) }?;
        Ok(Self::from_raw_ref(raw))
    }

    pub fn get(&self) -> Option<&T> {
        // SAFETY: a strong unit keeps the object alive
        self.raw.as_ref().map(|raw| unsafe { raw.ptr.as_ref() })
    }

    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.raw.map(|raw| raw.ptr)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    /// Number of strong handles sharing this block, 0 for an empty handle.
    pub fn use_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::strong)
    }

    /// Number of weak handles observing this block.
    pub fn weak_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::weak)
    }

    /// Whether both handles point at the same object (or are both empty).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.raw, other.raw) {
            (Some(a), Some(b)) => ptr::addr_eq(a.ptr.as_ptr(), b.ptr.as_ptr()),
            (None, None) => true,
            _ => false,
        }
    }

    /// Release ownership, leaving the handle empty.
    pub fn reset(&mut self) {
        drop(mem::take(self));
    }

    /// Release ownership and take over `value` instead.
    pub fn reset_box(&mut self, value: Box<T>) {
        *self = Self::from_box(value);
    }

    /// Release ownership and take over `ptr` as [`Shared::from_raw_in`] does.
    ///
    /// On failure the handle keeps its previous contents.
    ///
    /// # Safety
    ///
    /// Same as [`Shared::from_raw_with`].
    pub unsafe fn reset_raw_in<D, A>(&mut self, ptr: NonNull<T>, deleter: D, alloc: A) -> Result<(), AllocError>
    where
        D: Deleter<T> + 'static,
        A: RawAlloc + 'static,
    {
        *self = unsafe { Self::from_raw_in(ptr, deleter, alloc) }?;
        Ok(())
    }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.raw, &mut other.raw);
    }

    pub fn downgrade(&self) -> Weak<T> {
        Weak::from(self)
    }

    /// Convert into a handle to something reachable from the object, sharing
    /// its block. Typically an upcast to a trait object or a field.
    ///
    /// No counter changes. An empty handle stays empty.
    ///
    /// ```
    /// use shareptr::Shared;
    /// use std::fmt::Display;
    ///
    /// let number = Shared::new(42);
    /// let shown: Shared<dyn Display> = Shared::project(number, |n| n as &dyn Display);
    /// assert_eq!(shown.to_string(), "42");
    /// ```
    pub fn project<U, F>(this: Self, f: F) -> Shared<U>
    where
        U: ?Sized,
        F: for<'x> FnOnce(&'x T) -> &'x U,
    {
        let Some(raw) = this.raw else {
            return Shared::empty();
        };
        // SAFETY: `this` still holds its strong unit while `f` runs
        let target = NonNull::from(f(unsafe { raw.ptr.as_ref() }));
        mem::forget(this);
        Shared::from_raw_ref(RawRef {
            ptr: target,
            block: raw.block,
        })
    }

    /// Like [`Shared::project`] but keeps `this`, adding a strong unit.
    pub fn project_ref<U, F>(this: &Self, f: F) -> Shared<U>
    where
        U: ?Sized,
        F: for<'x> FnOnce(&'x T) -> &'x U,
    {
        Shared::project(this.clone(), f)
    }
}

impl<T> Shared<T> {
    /// Construct `value` inside a freshly allocated inline block.
    pub fn new(value: T) -> Self {
        match Self::new_in(value, Global) {
            Ok(this) => this,
            Err(err) => err.handle(),
        }
    }

    pub fn new_in<A>(value: T, alloc: A) -> Result<Self, AllocError>
    where
        A: RawAlloc + 'static,
    {
        Self::new_with_in(alloc, move || value)
    }

    /// Allocate an inline block with `alloc`, then build the object in it.
    ///
    /// A panic in `init` frees the block before unwinding further.
    pub fn new_with_in<A, F>(alloc: A, init: F) -> Result<Self, AllocError>
    where
        A: RawAlloc + 'static,
        F: FnOnce() -> T,
    {
        let raw = block::allocate_inline(alloc, init)?;
        Ok(Self::from_raw_ref(raw))
    }
}

impl<T: EnableSharedFromThis> Shared<T> {
    /// [`Shared::new`], registering the handle with the object's [`SelfRef`].
    ///
    /// [`SelfRef`]: crate::SelfRef
    pub fn new_enabled(value: T) -> Self {
        let this = Self::new(value);
        this.register_self_ref();
        this
    }

    /// [`Shared::from_box`], registering the handle with the object's
    /// [`SelfRef`](crate::SelfRef).
    pub fn from_box_enabled(value: Box<T>) -> Self {
        let object = NonNull::from(Box::leak(value));
        // SAFETY: see `from_box`
        match unsafe { Self::from_raw_enabled_in(object, DefaultDelete, Global) } {
            Ok(this) => this,
            Err(err) => err.handle(),
        }
    }

    /// [`Shared::from_raw_in`] for objects carrying a self-reference.
    ///
    /// If the object already reports a live owner, that owner's block is
    /// shared instead of allocating a second one, and `deleter` and `alloc`
    /// are dropped unused. Otherwise the new handle is registered with the
    /// object.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object. Unless it is already owned by a
    /// live `Shared`, the requirements of [`Shared::from_raw_with`] apply.
    pub unsafe fn from_raw_enabled_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where
        D: Deleter<T> + 'static,
        A: RawAlloc + 'static,
    {
        let existing = unsafe { ptr.as_ref() }.shared_from_this();
        if existing.use_count() != 0 {
            log::debug!("{} is already owned, sharing its control block", type_name::<T>());
            return Ok(existing);
        }
        let this = unsafe { Self::from_raw_in(ptr, deleter, alloc) }?;
        this.register_self_ref();
        Ok(this)
    }

    fn register_self_ref(&self) {
        if let Some(value) = self.get() {
            value.self_ref().set_pointer(self);
        }
    }
}

impl Shared<dyn Any> {
    /// Recover the concrete type behind a `dyn Any` handle.
    ///
    /// A mismatch (or an empty handle) hands the original back untouched.
    pub fn downcast<U: Any>(self) -> Result<Shared<U>, Self> {
        let Some(raw) = self.raw else {
            return Err(self);
        };
        // SAFETY: the strong unit held by `self` keeps the object alive
        if !unsafe { raw.ptr.as_ref() }.is::<U>() {
            return Err(self);
        }
        mem::forget(self);
        Ok(Shared::from_raw_ref(RawRef {
            ptr: raw.ptr.cast::<U>(),
            block: raw.block,
        }))
    }
}

/// Construct `value` in an inline block using the global allocator.
pub fn make_shared<T>(value: T) -> Shared<T> {
    Shared::new(value)
}

/// Construct the result of `init` in an inline block placed with `alloc`.
pub fn allocate_shared<T, A, F>(alloc: A, init: F) -> Result<Shared<T>, AllocError>
where
    A: RawAlloc + 'static,
    F: FnOnce() -> T,
{
    Shared::new_with_in(alloc, init)
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        if let Some(header) = self.header() {
            header.inc_strong();
        }
        Self {
            raw: self.raw,
            _owns: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        let mut copy = source.clone();
        self.swap(&mut copy);
    }
}

impl<T: ?Sized> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: the unit owned by this handle is given up exactly once
            unsafe { block::release_strong(raw.block) }
        }
    }
}

impl<T: ?Sized> Default for Shared<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an empty Shared<{}>", type_name::<T>()),
        }
    }
}

impl<T> From<T> for Shared<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized> From<Box<T>> for Shared<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Shared").field(&value).finish(),
            None => f.write_str("Shared(<empty>)"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_ptr() {
            Some(ptr) => fmt::Pointer::fmt(&ptr, f),
            None => fmt::Pointer::fmt(&ptr::null::<u8>(), f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{CountingAlloc, Exhausted};
    use std::cell::Cell;
    use std::rc::Rc;

    trait Shape {
        fn area(&self) -> f64;
    }

    struct Square(f64);

    impl Shape for Square {
        fn area(&self) -> f64 {
            self.0 * self.0
        }
    }

    #[test]
    fn empty_handle() {
        let empty: Shared<u32> = Shared::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.use_count(), 0);
        assert_eq!(empty.get(), None);
        assert!(empty.ptr_eq(&Shared::default()));
    }

    #[test]
    #[should_panic(expected = "dereferenced an empty Shared")]
    fn deref_empty_panics() {
        let empty: Shared<u32> = Shared::empty();
        let _value: u32 = *empty;
    }

    #[test]
    fn clone_from_releases_previous() {
        let alloc = CountingAlloc::new();
        let mut target = Shared::new_in(1, alloc.clone()).unwrap();
        let source = Shared::new_in(2, alloc.clone()).unwrap();
        target.clone_from(&source);
        assert_eq!(*target, 2);
        assert_eq!(source.use_count(), 2);
        assert_eq!(alloc.stats().live(), 1);
    }

    #[test]
    fn project_to_trait_object_shares_block() {
        let square = Shared::new(Square(3.0));
        let shape: Shared<dyn Shape> = Shared::project_ref(&square, |s| s as &dyn Shape);
        assert_eq!(shape.area(), 9.0);
        assert_eq!(square.use_count(), 2);
        drop(square);
        assert_eq!(shape.use_count(), 1);
        assert_eq!(shape.area(), 9.0);
    }

    #[test]
    fn project_to_field() {
        let pair = Shared::new((String::from("left"), 7u8));
        let left = Shared::project(pair, |p| p.0.as_str());
        assert_eq!(&*left, "left");
        assert_eq!(left.use_count(), 1);
    }

    #[test]
    fn project_empty_stays_empty() {
        let empty: Shared<(u8, u8)> = Shared::empty();
        let field = Shared::project(empty, |p| &p.1);
        assert!(field.is_empty());
    }

    #[test]
    fn downcast_match_and_mismatch() {
        let any: Shared<dyn Any> = Shared::project(Shared::new(5i32), |v| v as &dyn Any);
        let any = match any.downcast::<String>() {
            Ok(_) => panic!("i32 downcast to String"),
            Err(back) => back,
        };
        assert_eq!(any.use_count(), 1);
        let number = any.downcast::<i32>().ok().unwrap();
        assert_eq!(*number, 5);
        assert_eq!(number.use_count(), 1);
    }

    #[test]
    fn reset_raw_in_failure_keeps_old_value() {
        let mut handle = Shared::new(10u64);
        let deleted = Rc::new(Cell::new(false));
        let seen = Rc::clone(&deleted);
        let fresh = NonNull::from(Box::leak(Box::new(20u64)));
        let result = unsafe {
            handle.reset_raw_in(
                fresh,
                move |ptr: NonNull<u64>| {
                    seen.set(true);
                    drop(unsafe { Box::from_raw(ptr.as_ptr()) });
                },
                Exhausted,
            )
        };
        assert!(result.is_err());
        assert!(deleted.get());
        assert_eq!(*handle, 10);
    }

    #[test]
    fn reset_raw_in_takes_over_new_pointer() {
        let alloc = CountingAlloc::new();
        let mut handle = Shared::new_in(String::from("old"), alloc.clone()).unwrap();
        let keep = handle.downgrade();
        let fresh = NonNull::from(Box::leak(Box::new(String::from("new"))));
        unsafe { handle.reset_raw_in(fresh, DefaultDelete, alloc.clone()) }.unwrap();

        assert!(keep.expired());
        assert_eq!(alloc.stats().destroys, 1);
        assert_eq!(*handle, "new");
        assert_eq!(handle.use_count(), 1);
        assert_eq!(handle.weak_count(), 0);
        assert_eq!(handle.as_ptr(), Some(fresh));

        drop(keep);
        drop(handle);
        assert_eq!(alloc.stats().live(), 0);
    }

    #[test]
    fn unsized_box() {
        let text: Shared<str> = Shared::from_box(Box::from("boxed str"));
        assert_eq!(&*text, "boxed str");
        let slice: Shared<[u8]> = Shared::from(vec![1u8, 2, 3].into_boxed_slice());
        assert_eq!(slice.len(), 3);
    }

    #[test]
    fn debug_output() {
        assert_eq!(format!("{:?}", Shared::new(3)), "Shared(3)");
        assert_eq!(format!("{:?}", Shared::<i32>::empty()), "Shared(<empty>)");
    }
}
