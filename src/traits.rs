#![forbid(unsafe_code)]

use crate::{
    controller::{on_commit, with_ctrl},
    error::TrellisError,
    observer::create_observer,
};
use futures::channel::mpsc::{self, UnboundedReceiver};
use std::{cell::Cell as StdCell, rc::Rc};

/// Clones the current value out of a readable cell, tracking it as a
/// dependency of the running rule.
pub trait CellGet<T> {
    /// Clones and returns the current value. Inside a rule, the read is
    /// recorded and the rule re-runs when the value changes.
    ///
    /// # Panics
    /// Panics if the cell was disposed or belongs to another thread.
    #[track_caller]
    fn get(&self) -> T;

    /// Clones and returns the current value, or `None` if the cell is gone.
    fn try_get(&self) -> Option<T>;
}

/// Borrows the current value of a readable cell without cloning, tracking
/// it as a dependency of the running rule.
pub trait CellWith<T> {
    /// Applies `f` to the current value.
    ///
    /// # Panics
    /// Panics if the cell was disposed or belongs to another thread.
    #[track_caller]
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O;

    /// Applies `f` to the current value, or returns `None` if the cell is
    /// gone.
    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O>;
}

/// Writes a value into a writable cell, starting an atomic operation if
/// none is active.
pub trait CellSet<T> {
    /// Sets the value. Writing the current value back (by `==`) is a no-op
    /// that notifies no one.
    ///
    /// # Panics
    /// Panics if this call started the atomic operation and the resulting
    /// pulse failed. Inside an enclosing operation, failures abort the
    /// whole operation and surface from
    /// [`try_atomically`](crate::try_atomically) instead.
    #[track_caller]
    fn set(&self, value: T);

    /// Sets the value, surfacing pulse failures such as
    /// [`TrellisError::InputConflict`].
    fn try_set(&self, value: T) -> Result<(), TrellisError>;
}

/// Updates a writable cell in place via clone-mutate-compare.
pub trait CellUpdate<T> {
    /// Applies `f` to a copy of the current value and writes the result
    /// back. The write behaves like [`CellSet::set`]: unchanged values
    /// notify no one.
    #[track_caller]
    fn update(&self, f: impl FnOnce(&mut T));

    /// Like [`CellUpdate::update`], surfacing pulse failures.
    fn try_update(&self, f: impl FnOnce(&mut T)) -> Result<(), TrellisError>;
}

/// Reads a cell without creating a dependency on it.
pub trait CellWithUntracked<T> {
    /// Applies `f` to the current value without tracking the read.
    ///
    /// # Panics
    /// Panics if the cell was disposed or belongs to another thread.
    #[track_caller]
    fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O;

    /// Applies `f` to the current value without tracking the read, or
    /// returns `None` if the cell is gone.
    fn try_with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O>;
}

/// Clones a cell's value without creating a dependency on it.
pub trait CellGetUntracked<T> {
    /// Clones the current value without tracking the read.
    ///
    /// # Panics
    /// Panics if the cell was disposed or belongs to another thread.
    #[track_caller]
    fn get_untracked(&self) -> T;

    /// Clones the current value without tracking the read, or returns
    /// `None` if the cell is gone.
    fn try_get_untracked(&self) -> Option<T>;
}

/// Writes a cell without notifying its listeners.
pub trait CellSetUntracked<T> {
    /// Replaces the value without waking any listener. The write is still
    /// undo-logged when an atomic operation is active.
    fn set_untracked(&self, value: T);
}

impl<T: Clone, S: CellWith<T>> CellGet<T> for S {
    fn get(&self) -> T {
        self.with(T::clone)
    }

    fn try_get(&self) -> Option<T> {
        self.try_with(T::clone)
    }
}

impl<T: Clone, S: CellWithUntracked<T>> CellGetUntracked<T> for S {
    fn get_untracked(&self) -> T {
        self.with_untracked(T::clone)
    }

    fn try_get_untracked(&self) -> Option<T> {
        self.try_with_untracked(T::clone)
    }
}

/// Turns a readable cell into an async stream of its values.
pub trait CellStream<T> {
    /// Returns a stream that yields the cell's current value immediately
    /// and then every changed value, one item per pulse. The internal
    /// observer disposes itself once the receiver is dropped.
    fn to_stream(&self) -> UnboundedReceiver<T>;
}

impl<T, S> CellStream<T> for S
where
    T: Clone + 'static,
    S: CellGet<T> + Copy + 'static,
{
    fn to_stream(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        let source = *self;
        let self_id = Rc::new(StdCell::new(None));
        let observer = create_observer({
            let self_id = Rc::clone(&self_id);
            move || {
                if tx.is_closed() {
                    if let Some(id) = self_id.get() {
                        on_commit(move || with_ctrl(|c| c.dispose_node(id)));
                    }
                    return;
                }
                if let Some(value) = source.try_get() {
                    let _ = tx.unbounded_send(value);
                }
            }
        });
        self_id.set(Some(observer.id));
        rx
    }
}
