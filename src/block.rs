//! Control block layout and the counting protocol
//!
//! Every managed object is tracked by one control block. The block starts with
//! a type-erased [`BlockHeader`] so handles can count and dispose without
//! knowing which layout they point at. Two layouts exist:
//!
//! - [`DetachedBlock`]: the object lives elsewhere and is disposed of by a
//!   [`Deleter`]. The allocator only provides the block itself.
//! - [`InlineBlock`]: the object is stored inside the block. One allocation
//!   serves both, and the allocator also constructs and destroys the object.

use crate::alloc::RawAlloc;
use crate::deleter::Deleter;
use crate::error::AllocError;
use std::alloc::Layout;
use std::any::type_name;
use std::cell::Cell;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr::NonNull;

/// Type-erased disposal operations of one block layout
///
/// One static instance exists per instantiated layout.
pub(crate) struct BlockVTable {
    /// Drops the managed object. A no-op once the object is gone.
    destroy: unsafe fn(NonNull<BlockHeader>),
    /// Returns the block's memory to its allocator.
    deallocate: unsafe fn(NonNull<BlockHeader>),
}

/// Counters shared by every block layout
///
/// Strong and weak counts are independent: live strong handles do not hold
/// an implicit weak unit.
pub(crate) struct BlockHeader {
    strong: Cell<usize>,
    weak: Cell<usize>,
    /// Set while `destroy` runs; weak releases then leave the block alone.
    destroying: Cell<bool>,
    vtable: &'static BlockVTable,
}

impl BlockHeader {
    fn new(vtable: &'static BlockVTable) -> Self {
        Self {
            strong: Cell::new(1),
            weak: Cell::new(0),
            destroying: Cell::new(false),
            vtable,
        }
    }

    #[inline]
    pub(crate) fn strong(&self) -> usize {
        self.strong.get()
    }

    #[inline]
    pub(crate) fn weak(&self) -> usize {
        self.weak.get()
    }

    #[inline]
    pub(crate) fn inc_strong(&self) {
        let strong = self.strong.get();
        // abort instead of wrapping; a wrapped count would free a live object
        if strong == usize::MAX {
            std::process::abort();
        }
        self.strong.set(strong + 1);
    }

    #[inline]
    fn dec_strong(&self) {
        self.strong.set(self.strong.get() - 1);
    }

    #[inline]
    pub(crate) fn inc_weak(&self) {
        let weak = self.weak.get();
        if weak == usize::MAX {
            std::process::abort();
        }
        self.weak.set(weak + 1);
    }

    #[inline]
    fn dec_weak(&self) {
        self.weak.set(self.weak.get() - 1);
    }
}

/// Give up one strong unit.
///
/// Destroys the object when the strong count reaches zero, and frees the
/// block if no weak unit remains either.
///
/// # Safety
///
/// `block` must be live and the caller must own one strong unit of it, which
/// is consumed.
pub(crate) unsafe fn release_strong(block: NonNull<BlockHeader>) {
    let header = unsafe { block.as_ref() };
    header.dec_strong();
    if header.strong() != 0 {
        return;
    }
    header.destroying.set(true);
    let finish = FinishDestroy { block };
    let destroy = header.vtable.destroy;
    unsafe { destroy(block) };
    drop(finish);
}

/// Ends the destroy phase of a block, freeing it if no weak unit is left
///
/// Runs on unwind too, so a panicking deleter or `Drop` still releases the
/// block exactly once.
struct FinishDestroy {
    block: NonNull<BlockHeader>,
}

impl Drop for FinishDestroy {
    fn drop(&mut self) {
        // SAFETY: weak releases during destroy never free the block
        let header = unsafe { self.block.as_ref() };
        header.destroying.set(false);
        if header.weak() == 0 {
            let deallocate = header.vtable.deallocate;
            unsafe { deallocate(self.block) };
        }
    }
}

/// Give up one weak unit, freeing the block once both counts are zero.
///
/// # Safety
///
/// `block` must be live and the caller must own one weak unit of it, which
/// is consumed.
pub(crate) unsafe fn release_weak(block: NonNull<BlockHeader>) {
    let header = unsafe { block.as_ref() };
    header.dec_weak();
    if header.weak() == 0 && header.strong() == 0 && !header.destroying.get() {
        let deallocate = header.vtable.deallocate;
        unsafe { deallocate(block) };
    }
}

/// Object pointer plus the block that counts it
pub(crate) struct RawRef<T: ?Sized> {
    pub(crate) ptr: NonNull<T>,
    pub(crate) block: NonNull<BlockHeader>,
}

impl<T: ?Sized> Clone for RawRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for RawRef<T> {}

/// Block for an object allocated elsewhere
///
/// SAFETY: repr(C) keeps `header` at offset 0, so a `NonNull<BlockHeader>`
/// derived from the block pointer can be cast back.
#[repr(C)]
struct DetachedBlock<T: ?Sized, D, A> {
    header: BlockHeader,
    object: Cell<Option<NonNull<T>>>,
    deleter: ManuallyDrop<D>,
    alloc: ManuallyDrop<A>,
}

const _: () = assert!(std::mem::offset_of!(DetachedBlock<u8, (), ()>, header) == 0);

impl<T: ?Sized, D: Deleter<T>, A: RawAlloc> DetachedBlock<T, D, A> {
    const VTABLE: &'static BlockVTable = &BlockVTable {
        destroy: Self::destroy,
        deallocate: Self::deallocate,
    };

    unsafe fn destroy(block: NonNull<BlockHeader>) {
        let this = block.cast::<Self>().as_ptr();
        unsafe {
            if let Some(object) = (*this).object.take() {
                log::trace!("destroying {} of detached block {:p}", type_name::<T>(), this);
                Deleter::<T>::delete(&mut *(*this).deleter, object);
            }
        }
    }

    unsafe fn deallocate(block: NonNull<BlockHeader>) {
        let this = block.cast::<Self>().as_ptr();
        log::trace!("deallocating detached block {:p}", this);
        unsafe {
            ManuallyDrop::drop(&mut (*this).deleter);
            let alloc = ManuallyDrop::take(&mut (*this).alloc);
            alloc.deallocate(block.cast(), Layout::new::<Self>());
        }
    }
}

/// Allocate a detached block taking ownership of `object`.
///
/// The block starts with one strong unit and no weak unit. If the allocator
/// fails, `deleter` is run on `object` before the error is returned.
///
/// # Safety
///
/// `object` must be valid until `deleter` disposes of it, and `deleter` must
/// be the right way to dispose of it.
pub(crate) unsafe fn allocate_detached<T, D, A>(
    object: NonNull<T>,
    mut deleter: D,
    alloc: A,
) -> Result<RawRef<T>, AllocError>
where
    T: ?Sized,
    D: Deleter<T> + 'static,
    A: RawAlloc + 'static,
{
    let layout = Layout::new::<DetachedBlock<T, D, A>>();
    let memory = match alloc.allocate(layout) {
        Ok(memory) => memory,
        Err(err) => {
            log::trace!("detached block for {} failed: {}", type_name::<T>(), err);
            unsafe { deleter.delete(object) };
            return Err(err);
        }
    };

    let block = memory.cast::<DetachedBlock<T, D, A>>();
    unsafe {
        block.as_ptr().write(DetachedBlock {
            header: BlockHeader::new(DetachedBlock::<T, D, A>::VTABLE),
            object: Cell::new(Some(object)),
            deleter: ManuallyDrop::new(deleter),
            alloc: ManuallyDrop::new(alloc),
        });
    }
    log::trace!("allocated detached block {:p} for {}", block, type_name::<T>());

    Ok(RawRef {
        ptr: object,
        block: block.cast(),
    })
}

/// Block storing its object in place
///
/// SAFETY: repr(C) keeps `header` at offset 0, see [`DetachedBlock`].
#[repr(C)]
struct InlineBlock<T, A> {
    header: BlockHeader,
    live: Cell<bool>,
    alloc: ManuallyDrop<A>,
    value: MaybeUninit<T>,
}

const _: () = assert!(std::mem::offset_of!(InlineBlock<u8, ()>, header) == 0);

impl<T, A: RawAlloc> InlineBlock<T, A> {
    const VTABLE: &'static BlockVTable = &BlockVTable {
        destroy: Self::destroy,
        deallocate: Self::deallocate,
    };

    /// Pointer to the value slot, keeping the provenance of the whole block.
    unsafe fn value_ptr(this: *mut Self) -> NonNull<T> {
        unsafe { NonNull::new_unchecked((&raw mut (*this).value).cast::<T>()) }
    }

    unsafe fn destroy(block: NonNull<BlockHeader>) {
        let this = block.cast::<Self>().as_ptr();
        unsafe {
            if (*this).live.replace(false) {
                log::trace!("destroying {} of inline block {:p}", type_name::<T>(), this);
                (*this).alloc.destroy(Self::value_ptr(this));
            }
        }
    }

    unsafe fn deallocate(block: NonNull<BlockHeader>) {
        let this = block.cast::<Self>().as_ptr();
        log::trace!("deallocating inline block {:p}", this);
        unsafe {
            let alloc = ManuallyDrop::take(&mut (*this).alloc);
            alloc.deallocate(block.cast(), Layout::new::<Self>());
        }
    }
}

/// Returns block memory to the allocator unless forgotten
struct FreeOnUnwind<'a, A: RawAlloc> {
    alloc: &'a A,
    memory: NonNull<u8>,
    layout: Layout,
}

impl<A: RawAlloc> Drop for FreeOnUnwind<'_, A> {
    fn drop(&mut self) {
        unsafe { self.alloc.deallocate(self.memory, self.layout) }
    }
}

/// Allocate an inline block and construct the object produced by `init` in it.
///
/// `init` runs after the block memory is obtained. If it (or the allocator's
/// `construct`) panics, the memory is released before the panic continues.
pub(crate) fn allocate_inline<T, A, F>(alloc: A, init: F) -> Result<RawRef<T>, AllocError>
where
    A: RawAlloc + 'static,
    F: FnOnce() -> T,
{
    let layout = Layout::new::<InlineBlock<T, A>>();
    let memory = alloc.allocate(layout).inspect_err(|err| {
        log::trace!("inline block for {} failed: {}", type_name::<T>(), err);
    })?;
    let block = memory.cast::<InlineBlock<T, A>>().as_ptr();

    let guard = FreeOnUnwind {
        alloc: &alloc,
        memory,
        layout,
    };
    let value = unsafe { InlineBlock::value_ptr(block) };
    unsafe { alloc.construct(value, init()) };
    mem::forget(guard);

    unsafe {
        (&raw mut (*block).header).write(BlockHeader::new(InlineBlock::<T, A>::VTABLE));
        (&raw mut (*block).live).write(Cell::new(true));
        (&raw mut (*block).alloc).write(ManuallyDrop::new(alloc));
    }
    log::trace!("allocated inline block {:p} for {}", block, type_name::<T>());

    Ok(RawRef {
        ptr: value,
        block: memory.cast(),
    })
}
