//! Allocation errors
//!
//! Block construction is the only fallible operation in the crate. Everything
//! else is bookkeeping on counters that cannot fail.

use std::alloc::Layout;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error(
        "allocator could not provide {} bytes aligned to {}",
        .layout.size(),
        .layout.align()
    )]
    OutOfMemory { layout: Layout },

    #[error("allocator refused a block: limit of {limit} live blocks reached")]
    LimitReached { limit: usize, layout: Layout },
}

impl AllocError {
    #[cold]
    pub fn out_of_memory(layout: Layout) -> Self {
        AllocError::OutOfMemory { layout }
    }

    #[cold]
    pub fn limit_reached(limit: usize, layout: Layout) -> Self {
        AllocError::LimitReached { limit, layout }
    }

    /// Layout of the request that failed.
    pub fn layout(&self) -> Layout {
        match *self {
            AllocError::OutOfMemory { layout } => layout,
            AllocError::LimitReached { layout, .. } => layout,
        }
    }

    /// Diverge through the global allocation error handler.
    pub(crate) fn handle(self) -> ! {
        std::alloc::handle_alloc_error(self.layout())
    }
}
