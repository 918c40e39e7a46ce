#![forbid(unsafe_code)]

use crate::{
    atomically,
    controller::with_ctrl,
    graph::CellId,
    node::{CellKind, CellNode, Layer},
};
use std::rc::Rc;

/// An observer: side-effect code that runs during the commit phase of every
/// pulse in which one of its dependencies changed.
///
/// Observers run at [`Layer::MAX`], after all rules have settled, with the
/// commit-phase write lock held: reading cells is fine, writing them fails
/// the pulse with [`ReadOnlyPhase`](crate::TrellisError::ReadOnlyPhase)
/// unless the observer is an action ([`create_action`]) or the write goes
/// through [`modify`](crate::modify).
///
/// Observers scheduled in the same pulse run in the order they were
/// enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Observer {
    pub(crate) id: CellId,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

/// Creates an observer and runs it once immediately (in the enclosing
/// atomic operation, or one of its own), subscribing it to every cell the
/// body reads.
///
/// ```
/// use trellis_reactive::*;
/// # use std::{cell::RefCell, rc::Rc};
///
/// let name = create_value("world");
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let o = create_observer({
///     let seen = Rc::clone(&seen);
///     move || seen.borrow_mut().push(format!("hello, {}", name.get()))
/// });
/// name.set("trellis");
/// assert_eq!(*seen.borrow(), ["hello, world", "hello, trellis"]);
/// # o.dispose();
/// ```
#[track_caller]
pub fn create_observer(f: impl Fn() + 'static) -> Observer {
    new_observer(Rc::new(f), false)
}

/// Creates an *action*: an observer that additionally holds the write
/// permission, so its body may set cells. Reads made by the body still
/// subscribe it; writes propagate once it finishes, without dragging the
/// written cells' readers up to the commit layer.
#[track_caller]
pub fn create_action(f: impl Fn() + 'static) -> Observer {
    new_observer(Rc::new(f), true)
}

#[track_caller]
fn new_observer(f: Rc<dyn Fn()>, action: bool) -> Observer {
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Observer { f, action }).with_layer(Layer::MAX),
        )
    });
    atomically(|| with_ctrl(|c| c.schedule(id, None)));
    Observer {
        id,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

impl Observer {
    /// The commit-phase layer.
    pub fn layer(&self) -> Layer {
        Layer::MAX
    }

    /// Stops the observer and removes it from the graph.
    #[cfg_attr(
        debug_assertions,
        tracing::instrument(
            level = "trace",
            skip_all,
            fields(id = ?self.id, defined_at = %self.defined_at)
        )
    )]
    pub fn dispose(self) {
        with_ctrl(|c| c.dispose_node(self.id));
    }
}
