//! Self-reference capability
//!
//! A type that embeds a [`SelfRef`] and implements [`EnableSharedFromThis`]
//! can hand out strong handles to itself that share the block of the handle
//! that owns it.
//!
//! ```
//! use shareptr::{EnableSharedFromThis, SelfRef, Shared};
//!
//! struct Session {
//!     id: u32,
//!     this: SelfRef<Session>,
//! }
//!
//! impl EnableSharedFromThis for Session {
//!     fn self_ref(&self) -> &SelfRef<Self> {
//!         &self.this
//!     }
//! }
//!
//! let owner = Shared::from_box_enabled(Box::new(Session { id: 7, this: SelfRef::new() }));
//! let again = owner.shared_from_this();
//! assert_eq!(again.id, 7);
//! assert_eq!(owner.use_count(), 2);
//! ```

use crate::shared::Shared;
use crate::weak::Weak;
use std::cell::RefCell;
use std::fmt;

/// Weak handle an object keeps to itself
///
/// Empty until an owning constructor registers itself. Cloning yields an
/// unregistered `SelfRef`, since the clone is a different object.
pub struct SelfRef<T> {
    weak: RefCell<Weak<T>>,
}

impl<T> SelfRef<T> {
    pub const fn new() -> Self {
        Self {
            weak: RefCell::new(Weak::new()),
        }
    }

    /// Strong handle to the owning object, empty if none was registered or
    /// the owner is being destroyed.
    pub fn shared_from_this(&self) -> Shared<T> {
        self.weak.borrow().lock()
    }

    pub fn weak_from_this(&self) -> Weak<T> {
        self.weak.borrow().clone()
    }

    /// Point at the block of `shared`, replacing any earlier registration.
    pub(crate) fn set_pointer(&self, shared: &Shared<T>) {
        // the old weak is dropped after the borrow ends
        let previous = self.weak.replace(shared.downgrade());
        drop(previous);
    }
}

impl<T> Default for SelfRef<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SelfRef<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SelfRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfRef")
            .field("registered", &!self.weak.borrow().is_empty())
            .finish()
    }
}

/// Capability of objects that can produce strong handles to themselves
///
/// Only the `*_enabled` constructors of [`Shared`] register the handle; the
/// plain constructors leave the [`SelfRef`] empty.
pub trait EnableSharedFromThis: Sized {
    fn self_ref(&self) -> &SelfRef<Self>;

    fn shared_from_this(&self) -> Shared<Self> {
        self.self_ref().shared_from_this()
    }

    fn weak_from_this(&self) -> Weak<Self> {
        self.self_ref().weak_from_this()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node {
        this: SelfRef<Node>,
    }

    impl EnableSharedFromThis for Node {
        fn self_ref(&self) -> &SelfRef<Self> {
            &self.this
        }
    }

    #[test]
    fn unregistered_is_empty() {
        let node = Node::default();
        assert!(node.shared_from_this().is_empty());
        assert!(node.weak_from_this().expired());
    }

    #[test]
    fn plain_constructor_does_not_register() {
        let owner = Shared::new(Node::default());
        assert!(owner.shared_from_this().is_empty());
        assert_eq!(owner.weak_count(), 0);
    }

    #[test]
    fn enabled_inline_registers() {
        let owner = Shared::new_enabled(Node::default());
        assert_eq!(owner.weak_count(), 1);
        let again = owner.shared_from_this();
        assert!(again.ptr_eq(&owner));
        assert_eq!(owner.use_count(), 2);
    }

    #[test]
    fn clone_is_unregistered() {
        let owner = Shared::new_enabled(Node::default());
        let copy = owner.this.clone();
        assert!(copy.shared_from_this().is_empty());
        assert_eq!(format!("{:?}", owner.this), "SelfRef { registered: true }");
    }
}
