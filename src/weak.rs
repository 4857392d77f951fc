//! Non-owning observer handle

use crate::block::{self, BlockHeader, RawRef};
use crate::shared::Shared;
use std::fmt;
use std::mem;
use std::ptr;

/// Weak observer of a [`Shared`] object
///
/// Counts toward the block's weak count only, so it never keeps the object
/// alive. The block itself stays allocated while any `Weak` exists.
///
/// ```
/// use shareptr::{Shared, Weak};
///
/// let strong = Shared::new(5);
/// let weak = Weak::from(&strong);
/// assert_eq!(*weak.lock(), 5);
/// drop(strong);
/// assert!(weak.expired());
/// assert!(weak.lock().is_empty());
/// ```
pub struct Weak<T: ?Sized> {
    raw: Option<RawRef<T>>,
}

impl<T: ?Sized> Weak<T> {
    /// Observer of nothing. Always expired.
    pub const fn new() -> Self {
        Self { raw: None }
    }

    fn header(&self) -> Option<&BlockHeader> {
        // SAFETY: the weak unit owned by this handle keeps the block allocated
        self.raw.as_ref().map(|raw| unsafe { raw.block.as_ref() })
    }

    /// Obtain a strong handle if the object is still alive.
    ///
    /// Returns an empty handle, leaving every counter untouched, once the
    /// strong count has reached zero.
    pub fn lock(&self) -> Shared<T> {
        match (self.raw, self.header()) {
            (Some(raw), Some(header)) if header.strong() > 0 => {
                header.inc_strong();
                Shared::from_raw_ref(raw)
            }
            _ => Shared::empty(),
        }
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Strong count of the observed block, 0 for an empty handle.
    pub fn use_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::strong)
    }

    pub fn weak_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::weak)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    /// Whether both handles observe the same object (or are both empty).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.raw, other.raw) {
            (Some(a), Some(b)) => ptr::addr_eq(a.ptr.as_ptr(), b.ptr.as_ptr()),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.raw, &mut other.raw);
    }
}

impl<T: ?Sized> From<&Shared<T>> for Weak<T> {
    fn from(shared: &Shared<T>) -> Self {
        let raw = shared.raw();
        if let Some(raw) = raw {
            // SAFETY: `shared` holds a strong unit
            unsafe { raw.block.as_ref() }.inc_weak();
        }
        Self { raw }
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        if let Some(header) = self.header() {
            header.inc_weak();
        }
        Self { raw: self.raw }
    }

    fn clone_from(&mut self, source: &Self) {
        let mut copy = source.clone();
        self.swap(&mut copy);
    }
}

impl<T: ?Sized> Drop for Weak<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: the unit owned by this handle is given up exactly once
            unsafe { block::release_weak(raw.block) }
        }
    }
}

impl<T: ?Sized> Default for Weak<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAlloc;

    #[test]
    fn empty_weak_is_expired() {
        let weak: Weak<u8> = Weak::new();
        assert!(weak.expired());
        assert!(weak.lock().is_empty());
        assert_eq!(weak.weak_count(), 0);
    }

    #[test]
    fn weak_from_empty_shared_stays_empty() {
        let weak = Shared::<u8>::empty().downgrade();
        assert!(weak.is_empty());
    }

    #[test]
    fn lock_after_expiry_leaves_counts() {
        let alloc = CountingAlloc::new();
        let strong = Shared::new_in(String::from("gone"), alloc.clone()).unwrap();
        let weak = strong.downgrade();
        drop(strong);

        let locked = weak.lock();
        assert!(locked.is_empty());
        assert_eq!(weak.use_count(), 0);
        assert_eq!(weak.weak_count(), 1);
        assert_eq!(alloc.stats().destroys, 1);
        assert_eq!(alloc.stats().live(), 1);

        drop(weak);
        assert_eq!(alloc.stats().live(), 0);
    }

    #[test]
    fn clone_and_swap() {
        let a = Shared::new(1);
        let b = Shared::new(2);
        let mut wa = a.downgrade();
        let mut wb = wa.clone();
        assert_eq!(a.weak_count(), 2);

        wb.clone_from(&b.downgrade());
        assert_eq!(a.weak_count(), 1);
        assert_eq!(b.weak_count(), 1);

        wa.swap(&mut wb);
        assert_eq!(*wa.lock(), 2);
        assert_eq!(*wb.lock(), 1);
        assert!(!wa.ptr_eq(&wb));
    }

    #[test]
    fn ptr_eq_follows_object_like_shared() {
        let pair = Shared::new((1u32, 2u32));
        let first = Shared::project_ref(&pair, |p| &p.0);
        let second = Shared::project_ref(&pair, |p| &p.1);
        assert!(!first.ptr_eq(&second));
        assert!(!first.downgrade().ptr_eq(&second.downgrade()));
        assert!(first.downgrade().ptr_eq(&first.downgrade()));
    }
}
