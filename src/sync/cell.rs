//! Interior mutability for state owned by a single thread role.

use std::cell::UnsafeCell;

/// A cell for slot state that is mutated through shared references by exactly
/// one designated thread role at a time.
///
/// The slot tables hand the audio thread and the network thread shared access
/// to a slot (both hold the slot's spinlock in shared mode), but each field
/// group inside the slot is touched by only one of the two. Control threads
/// get unique access by holding the spinlock exclusively, which excludes all
/// shared holders.
///
/// # Safety contract
///
/// `get_mut` callers must be the owning role for this cell and must hold at
/// least a shared lock on the enclosing slot; `get_mut_exclusive` callers must
/// hold the slot's exclusive lock.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct RoleCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for RoleCell<T> {}

impl<T> RoleCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Mutable access for the owning thread role while the enclosing slot is
    /// locked (shared or exclusive).
    ///
    /// # Safety
    /// Only the owning role may call this, and no other reference to the
    /// contents may exist for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.0.get()
    }

    /// Shared access for non-owning observers where the owning role only
    /// mutates disjoint fields, or while the slot is locked exclusively.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent mutable access to the data it
    /// reads through this reference.
    pub unsafe fn get(&self) -> &T {
        &*self.0.get()
    }

    /// Unique access through ordinary borrow-checked mutability.
    pub fn get_plain_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}
