//! Destruction strategies for objects owned through a detached block

use std::ptr::NonNull;

/// Disposes of an object the control block does not store itself
///
/// Closures taking `NonNull<T>` implement this trait, which is the usual way
/// to plug in custom cleanup.
pub trait Deleter<T: ?Sized> {
    /// # Safety
    ///
    /// Called at most once per managed pointer, with the pointer that was
    /// handed to the owning constructor. Nothing accesses the object after.
    unsafe fn delete(&mut self, ptr: NonNull<T>);
}

/// Reclaims a pointer obtained from `Box::into_raw`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultDelete;

impl<T: ?Sized> Deleter<T> for DefaultDelete {
    unsafe fn delete(&mut self, ptr: NonNull<T>) {
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

impl<T: ?Sized, F: FnMut(NonNull<T>)> Deleter<T> for F {
    unsafe fn delete(&mut self, ptr: NonNull<T>) {
        self(ptr)
    }
}
