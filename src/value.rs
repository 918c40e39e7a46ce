#![forbid(unsafe_code)]

use crate::{
    controller::{with_ctrl, Controller},
    error::TrellisError,
    graph::CellId,
    macros::debug_warn,
    node::{CellKind, CellNode, Setter},
    traits::{CellSet, CellSetUntracked, CellUpdate, CellWith, CellWithUntracked},
};
use std::{any::Any, cell::RefCell, fmt, fmt::Debug, marker::PhantomData, rc::Rc};

/// An input cell: a readable, writable value with no rule.
///
/// Reading a `Value` inside a rule records a dependency, so the rule re-runs
/// whenever the value changes. Writes are arbitrated per pulse: once one
/// writer has changed the cell, a different writer changing it again in the
/// same pulse fails the pulse with [`TrellisError::InputConflict`].
///
/// `Value` is `Copy` and `'static`, so it moves freely into rule closures.
///
/// ```
/// use trellis_reactive::*;
///
/// let count = create_value(0);
/// let doubled = create_rule_cell(move |_| count.get() * 2);
/// assert_eq!(doubled.get(), 0);
/// count.set(3);
/// assert_eq!(doubled.get(), 6);
/// ```
pub struct Value<T>
where
    T: 'static,
{
    pub(crate) id: CellId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Value<T> {}

impl<T> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value").field("id", &self.id).finish()
    }
}

impl<T> PartialEq for Value<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Value<T> {}

impl<T> std::hash::Hash for Value<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Creates an input cell holding `value`.
#[track_caller]
pub fn create_value<T>(value: T) -> Value<T>
where
    T: PartialEq + 'static,
{
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Value)
                .with_value(Rc::new(RefCell::new(Some(value))) as Rc<RefCell<dyn Any>>),
        )
    });
    Value {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// Creates a *discrete* (event) input cell.
///
/// The cell starts at `reset` and automatically reverts to `reset` when the
/// pulse that set it commits, so a listener that observes the event value in
/// pulse *n* is guaranteed to observe `reset` again in pulse *n + 1*.
///
/// ```
/// use trellis_reactive::*;
/// # use std::{cell::RefCell, rc::Rc};
///
/// let fired = create_discrete(false);
/// let log = Rc::new(RefCell::new(Vec::new()));
/// let o = create_observer({
///     let log = Rc::clone(&log);
///     move || log.borrow_mut().push(fired.get())
/// });
/// fired.set(true);
/// assert_eq!(*log.borrow(), [false, true, false]);
/// assert_eq!(fired.get(), false);
/// # o.dispose();
/// ```
#[track_caller]
pub fn create_discrete<T>(reset: T) -> Value<T>
where
    T: PartialEq + Clone + 'static,
{
    let factory = reset_factory(reset.clone());
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Value)
                .with_value(Rc::new(RefCell::new(Some(reset))) as Rc<RefCell<dyn Any>>)
                .with_reset(factory),
        )
    });
    Value {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// Creates an input cell whose writes pass through `writer` before being
/// stored, e.g. to clamp or normalize incoming values.
#[track_caller]
pub fn create_value_with_writer<T>(
    value: T,
    writer: impl Fn(T) -> T + 'static,
) -> Value<T>
where
    T: PartialEq + 'static,
{
    let writer: Rc<dyn Any> = Rc::new(Box::new(writer) as Box<dyn Fn(T) -> T>);
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Value)
                .with_value(Rc::new(RefCell::new(Some(value))) as Rc<RefCell<dyn Any>>)
                .with_writer(writer),
        )
    });
    Value {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

pub(crate) fn reset_factory<T>(reset: T) -> Rc<dyn Fn() -> Box<dyn Any>>
where
    T: Clone + 'static,
{
    Rc::new(move || Box::new(reset.clone()) as Box<dyn Any>)
}

impl<T> Value<T> {
    /// Removes the cell from the reactive graph. Reads through other
    /// handles return `None` afterwards.
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

    /// Attaches a scoped [`Manager`](crate::Manager) to this cell: the
    /// first read or write inside an atomic operation enters it, and it
    /// exits when the operation ends.
    pub fn attach_manager(&self, manager: Rc<dyn crate::Manager>) {
        with_ctrl(|c| {
            if let Some(node) = c.nodes.borrow_mut().get_mut(self.id) {
                node.manager = Some(manager);
            }
        });
    }
}

impl<T> CellWith<T> for Value<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with(f)
            .expect("cell was disposed or belongs to another thread")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        with_ctrl(|c| {
            if c.history.active.get() {
                c.used(self.id);
            }
            let slot = c.value_slot(self.id)?;
            let borrow = slot.borrow();
            borrow.downcast_ref::<Option<T>>()?.as_ref().map(f)
        })
    }
}

impl<T> CellWithUntracked<T> for Value<T> {
    fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with_untracked(f)
            .expect("cell was disposed or belongs to another thread")
    }

    fn try_with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        with_ctrl(|c| {
            let slot = c.value_slot(self.id)?;
            let borrow = slot.borrow();
            borrow.downcast_ref::<Option<T>>()?.as_ref().map(f)
        })
    }
}

impl<T> CellSet<T> for Value<T>
where
    T: PartialEq + Debug + 'static,
{
    #[track_caller]
    fn set(&self, value: T) {
        let was_active = with_ctrl(|c| c.history.active.get());
        if let Err(e) = self.try_set(value) {
            // inside an enclosing operation the pulse is already poisoned
            // and the error surfaces from its try_atomically
            if !was_active {
                panic!("set failed: {e}");
            }
        }
    }

    fn try_set(&self, value: T) -> Result<(), TrellisError> {
        write_cell(self.id, value, false)
    }
}

impl<T> CellUpdate<T> for Value<T>
where
    T: PartialEq + Clone + Debug + 'static,
{
    fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.with_untracked(T::clone);
        f(&mut value);
        self.set(value);
    }

    fn try_update(&self, f: impl FnOnce(&mut T)) -> Result<(), TrellisError> {
        let Some(mut value) = self.try_with_untracked(T::clone) else {
            return Ok(());
        };
        f(&mut value);
        self.try_set(value)
    }
}

impl<T> CellSetUntracked<T> for Value<T>
where
    T: PartialEq + 'static,
{
    fn set_untracked(&self, value: T) {
        with_ctrl(|c| {
            let Some(slot) = c.value_slot(self.id) else {
                return;
            };
            let previous = slot
                .borrow_mut()
                .downcast_mut::<Option<T>>()
                .expect("cell value type")
                .replace(value);
            if c.history.active.get() {
                let undo_slot = Rc::clone(&slot);
                c.push_undo(Box::new(move || {
                    if let Some(v) = undo_slot.borrow_mut().downcast_mut::<Option<T>>() {
                        *v = previous;
                    }
                }));
            }
        });
    }
}

/// Writes `id`, autostarting an atomic operation when none is active.
/// `schedule_init` additionally queues the cell's rule when the write lands
/// before the cell's first run (writable rule cells).
pub(crate) fn write_cell<T>(
    id: CellId,
    value: T,
    schedule_init: bool,
) -> Result<(), TrellisError>
where
    T: PartialEq + Debug + 'static,
{
    let active = with_ctrl(|c| c.history.active.get());
    if active {
        with_ctrl(|c| {
            let result = set_value_inner(c, id, value);
            if result.is_ok() && schedule_init && c.needs_init(id) {
                c.schedule(id, None);
            }
            result
        })
    } else {
        with_ctrl(|c| c.atomic(|| write_cell(id, value, schedule_init)))
            .and_then(|inner| inner)
    }
}

/// The write path shared by input cells and writable rule cells: claim the
/// pulse's writer slot, ignore equal writes, reject conflicting writers,
/// then store with undo and propagate.
pub(crate) fn set_value_inner<T>(
    c: &Controller,
    id: CellId,
    value: T,
) -> Result<(), TrellisError>
where
    T: PartialEq + Debug + 'static,
{
    c.lock(id);
    if c.readonly.get() {
        let e = TrellisError::ReadOnlyPhase;
        c.set_pending(e.clone());
        return Err(e);
    }
    let value = {
        let interceptor = c.nodes.borrow().get(id).and_then(|n| n.writer.clone());
        match interceptor {
            Some(interceptor) => match interceptor.downcast_ref::<Box<dyn Fn(T) -> T>>() {
                Some(interceptor) => interceptor(value),
                None => value,
            },
            None => value,
        }
    };
    let writer = match c.current_listener.get() {
        Some(listener) => Setter::Listener(listener),
        None => Setter::External,
    };
    if c.claim_set_by(id, writer) {
        c.push_commit(Box::new(move || finish_value::<T>(id)));
    }
    let Some(slot) = c.value_slot(id) else {
        debug_warn!("write to a disposed cell ignored");
        return Ok(());
    };
    {
        let borrow = slot.borrow();
        let current = borrow
            .downcast_ref::<Option<T>>()
            .expect("cell value type");
        if current.as_ref() == Some(&value) {
            // no change, no conflict
            return Ok(());
        }
    }
    if c.set_by_of(id) != Some(writer) {
        let current = {
            let borrow = slot.borrow();
            borrow
                .downcast_ref::<Option<T>>()
                .and_then(|v| v.as_ref().map(|v| format!("{v:?}")))
                .unwrap_or_else(|| "<unset>".to_owned())
        };
        let e = TrellisError::InputConflict {
            current,
            attempted: format!("{value:?}"),
        };
        c.set_pending(e.clone());
        return Err(e);
    }
    let previous = slot
        .borrow_mut()
        .downcast_mut::<Option<T>>()
        .expect("cell value type")
        .replace(value);
    let undo_slot = Rc::clone(&slot);
    c.push_undo(Box::new(move || {
        if let Some(v) = undo_slot.borrow_mut().downcast_mut::<Option<T>>() {
            *v = previous;
        }
    }));
    c.changed(id);
    Ok(())
}

/// Commit hook for written cells: releases the pulse's writer slot and, for
/// discrete cells, reverts the value to its reset so the next pulse
/// observes the event as over.
pub(crate) fn finish_value<T>(id: CellId)
where
    T: PartialEq + 'static,
{
    with_ctrl(|c| {
        if c.set_by_of(id).is_some() {
            c.set_set_by(id, None);
        }
        let (slot, factory) = {
            let nodes = c.nodes.borrow();
            let Some(node) = nodes.get(id) else {
                return;
            };
            (node.value.clone(), node.reset.clone())
        };
        let (Some(slot), Some(factory)) = (slot, factory) else {
            return;
        };
        let Ok(fresh) = factory().downcast::<T>() else {
            return;
        };
        let differs = {
            let borrow = slot.borrow();
            borrow
                .downcast_ref::<Option<T>>()
                .map(|v| v.as_ref() != Some(&*fresh))
                .unwrap_or(false)
        };
        if differs {
            let previous = slot
                .borrow_mut()
                .downcast_mut::<Option<T>>()
                .expect("cell value type")
                .replace(*fresh);
            let undo_slot = Rc::clone(&slot);
            c.push_undo(Box::new(move || {
                if let Some(v) = undo_slot.borrow_mut().downcast_mut::<Option<T>>() {
                    *v = previous;
                }
            }));
            c.changed(id);
        }
    });
}
