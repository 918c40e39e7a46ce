#![forbid(unsafe_code)]

use crate::error::TrellisError;
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

pub(crate) type Thunk = Box<dyn FnOnce()>;

/// An opaque position in the undo log, obtained from
/// [`savepoint`](crate::savepoint) and consumed by
/// [`rollback_to`](crate::rollback_to).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Savepoint(pub(crate) usize);

/// A scoped resource tied to a subject: a lock to take, a transaction to
/// open. The first use of the subject inside an atomic block calls `enter`;
/// every entered manager is exited, in reverse order, when the pulse
/// commits or fails.
pub trait Manager {
    fn enter(&self);

    /// Called at the end of the atomic operation. `error` is `Some` when the
    /// operation is being unwound; returning `Err` replaces the error that
    /// will be propagated.
    fn exit(&self, error: Option<&TrellisError>) -> Result<(), TrellisError>;
}

/// The transactional substrate of the controller: an undo log, commit
/// hooks, and the managers entered during the current atomic operation.
#[derive(Default)]
pub(crate) struct History {
    pub active: Cell<bool>,
    pub in_cleanup: Cell<bool>,
    pub in_rollback: Cell<bool>,
    pub undo: RefCell<Vec<Thunk>>,
    pub at_commit: RefCell<Vec<Thunk>>,
    managers: RefCell<Vec<Rc<dyn Manager>>>,
}

impl History {
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.undo.borrow().len())
    }

    pub fn push_undo(&self, thunk: Thunk) {
        debug_assert!(self.active.get(), "undo recorded outside an atomic operation");
        assert!(
            !self.in_rollback.get(),
            "undo entries may not be recorded during a rollback"
        );
        self.undo.borrow_mut().push(thunk);
    }

    /// Registers `thunk` to run when the pulse commits, and an undo entry
    /// that unregisters it again, so a rollback also erases the pending
    /// commit work.
    pub fn push_commit(&self, thunk: Thunk) {
        debug_assert!(self.active.get(), "commit hook outside an atomic operation");
        self.at_commit.borrow_mut().push(thunk);
        self.push_undo(Box::new(|| {
            crate::controller::with_ctrl(|c| {
                c.history.at_commit.borrow_mut().pop();
            });
        }));
    }

    /// Pops and runs undo entries until the log is `sp` entries long.
    pub fn rollback_to(&self, sp: Savepoint) {
        assert!(self.active.get(), "rollback outside an atomic operation");
        assert!(!self.in_rollback.get(), "rollback_to() is not re-entrant");
        let _guard = FlagGuard::set(&self.in_rollback);
        loop {
            let thunk = {
                let mut undo = self.undo.borrow_mut();
                if undo.len() <= sp.0 {
                    break;
                }
                undo.pop()
            };
            if let Some(thunk) = thunk {
                thunk();
            }
        }
    }

    /// Enters `m` if this atomic operation has not entered it yet. Managers
    /// are identified by pointer, held in insertion order, and are not
    /// undo-logged: a partial rollback keeps them entered for the rest of
    /// the block.
    pub fn manage(&self, m: Rc<dyn Manager>) {
        assert!(self.active.get(), "managers require an active atomic operation");
        let entered = self
            .managers
            .borrow()
            .iter()
            .any(|held| Rc::ptr_eq(held, &m));
        if !entered {
            m.enter();
            self.managers.borrow_mut().push(m);
        }
    }

    pub fn take_managers(&self) -> Vec<Rc<dyn Manager>> {
        self.managers.borrow_mut().drain(..).collect()
    }

    pub fn has_commit_hooks(&self) -> bool {
        !self.at_commit.borrow().is_empty()
    }

    /// Removes and returns the commit hook at `index`, if any. Hooks are
    /// consumed by index so that hooks registered while earlier hooks run
    /// are still picked up, in registration order.
    pub fn take_commit_hook(&self, index: usize) -> Option<Thunk> {
        let mut hooks = self.at_commit.borrow_mut();
        if index < hooks.len() {
            Some(std::mem::replace(&mut hooks[index], Box::new(|| {})))
        } else {
            None
        }
    }

    pub fn clear_logs(&self) {
        self.at_commit.borrow_mut().clear();
        self.undo.borrow_mut().clear();
    }
}

/// Sets a flag for a scope and clears it again even if the scope unwinds.
pub(crate) struct FlagGuard<'a>(&'a Cell<bool>);

impl<'a> FlagGuard<'a> {
    pub fn set(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        FlagGuard(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
