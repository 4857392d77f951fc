//! Shareptr - shared and weak pointers over an explicit control block
//!
//! This library implements single-threaded shared ownership with two handle
//! types built on a heap-allocated control block that counts strong and weak
//! references independently.
//!
//! # Features
//!
//! - **Two block layouts**: take ownership of an existing pointer with a
//!   custom deleter ([`Shared::from_raw_in`]), or construct the object inside
//!   the block with one allocation ([`make_shared`], [`allocate_shared`])
//! - **Explicit allocators**: every block is placed through a [`RawAlloc`]
//!   passed at construction time
//! - **Weak observers**: [`Weak`] never keeps the object alive and can be
//!   upgraded with [`Weak::lock`]
//! - **Self references**: objects embedding a [`SelfRef`] obtain handles to
//!   themselves that share their owner's block
//!
//! Counters are plain cells. Handles are neither `Send` nor `Sync`, and cyclic
//! strong references leak.
//!
//! # Example
//!
//! ```
//! use shareptr::{make_shared, Weak};
//!
//! let value = make_shared(42);
//! let observer = Weak::from(&value);
//!
//! assert_eq!(*value, 42);
//! assert_eq!(value.use_count(), 1);
//! assert!(!observer.expired());
//!
//! drop(value);
//! assert!(observer.expired());
//! ```

mod alloc;
mod block;
mod deleter;
mod error;
mod self_ref;
mod shared;
mod weak;

pub use alloc::{AllocStats, CountingAlloc, Exhausted, Global, RawAlloc};
pub use deleter::{DefaultDelete, Deleter};
pub use error::AllocError;
pub use self_ref::{EnableSharedFromThis, SelfRef};
pub use shared::{Shared, allocate_shared, make_shared};
pub use weak::Weak;
