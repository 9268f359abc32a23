//! Thread-confined state cell.
//!
//! [`Confined<T>`] lets state that is only ever touched by one thread be
//! shared by reference with tasks built on other threads. Access is checked
//! at runtime: the owning thread gets `&mut T`, every other thread gets
//! [`DispatchError::WrongThread`].

use std::cell::RefCell;
use std::fmt;
use std::thread::{self, ThreadId};

use crate::error::DispatchError;

/// Single-thread state with a runtime owner check.
pub struct Confined<T> {
    owner: ThreadId,
    value: RefCell<T>,
}

// SAFETY: the `RefCell` is only borrowed after `with` has verified the caller
// is the owning thread, so it is never reached from two threads. `T: Send`
// covers the value being dropped on whichever thread releases the last
// reference.
unsafe impl<T: Send> Send for Confined<T> {}
unsafe impl<T: Send> Sync for Confined<T> {}

impl<T> Confined<T> {
    /// Confine `value` to `owner`.
    pub fn new(owner: ThreadId, value: T) -> Self {
        Self {
            owner,
            value: RefCell::new(value),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Run `f` against the value.
    ///
    /// Fails with `WrongThread` off the owning thread and with `Busy` when the
    /// value is already borrowed further up the owning thread's stack.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, DispatchError> {
        if !self.is_owner() {
            return Err(DispatchError::WrongThread);
        }
        let mut value = self
            .value
            .try_borrow_mut()
            .map_err(|_| DispatchError::Busy)?;
        Ok(f(&mut value))
    }
}

impl<T> fmt::Debug for Confined<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confined")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
