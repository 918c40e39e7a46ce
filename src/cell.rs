#![forbid(unsafe_code)]

use crate::{
    atomically,
    controller::{with_ctrl, Controller},
    error::TrellisError,
    graph::CellId,
    node::{CellKind, CellNode, Layer, Setter},
    traits::{CellSet, CellSetUntracked, CellUpdate, CellWith, CellWithUntracked},
    value::{finish_value, reset_factory, write_cell},
};
use std::{
    any::Any,
    cell::RefCell,
    fmt,
    fmt::Debug,
    marker::PhantomData,
    rc::Rc,
};

/// A rule cell: its value is computed by a rule over other cells.
///
/// The rule receives its previous output (or `None` before the first run)
/// and whatever cells it reads become its dependencies, re-derived on every
/// run. The cell runs lazily on first read, re-runs once per pulse when a
/// dependency changed, and notifies its own listeners only when the output
/// actually differs (by `PartialEq`).
///
/// A rule whose latest run read nothing at all can never change again; at
/// commit the cell retires into a constant and is dropped from its former
/// listeners' dependency sets.
///
/// ```
/// use trellis_reactive::*;
///
/// let src = create_value(2);
/// let squared = create_rule_cell(move |_| {
///     let v = src.get();
///     v * v
/// });
/// assert_eq!(squared.get(), 4);
/// src.set(5);
/// assert_eq!(squared.get(), 25);
/// ```
pub struct ReadOnlyCell<T>
where
    T: 'static,
{
    pub(crate) id: CellId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

/// A writable rule cell.
///
/// Behaves like [`ReadOnlyCell`] until written; a write overrides the
/// rule's output for the rest of the pulse, and the rule does not re-run on
/// dependency changes while the written value is in force.
///
/// ```
/// use trellis_reactive::*;
///
/// let src = create_value(1);
/// let mirror = create_cell(move |_| src.get(), 0);
/// assert_eq!(mirror.get(), 1);
/// mirror.set(10); // overrides the rule for this pulse
/// assert_eq!(mirror.get(), 10);
/// ```
pub struct Cell<T>
where
    T: 'static,
{
    pub(crate) id: CellId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

/// An immutable value. Reads never create dependencies.
pub struct Constant<T>
where
    T: 'static,
{
    pub(crate) id: CellId,
    pub(crate) ty: PhantomData<T>,
}

macro_rules! impl_handle_traits {
    ($($ty:ident),*) => {
        $(
            impl<T> Clone for $ty<T> {
                fn clone(&self) -> Self {
                    *self
                }
            }

            impl<T> Copy for $ty<T> {}

            impl<T> fmt::Debug for $ty<T> {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($ty)).field("id", &self.id).finish()
                }
            }

            impl<T> PartialEq for $ty<T> {
                fn eq(&self, other: &Self) -> bool {
                    self.id == other.id
                }
            }

            impl<T> Eq for $ty<T> {}

            impl<T> std::hash::Hash for $ty<T> {
                fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                    self.id.hash(state);
                }
            }
        )*
    };
}

impl_handle_traits![ReadOnlyCell, Cell, Constant];

/// Creates a read-only rule cell. The rule runs lazily, on first read.
#[track_caller]
pub fn create_rule_cell<T>(
    rule: impl Fn(Option<&T>) -> T + 'static,
) -> ReadOnlyCell<T>
where
    T: PartialEq + 'static,
{
    let state: Rc<dyn AnyRule> = Rc::new(RuleState {
        f: rule,
        writable: false,
        ty: PhantomData,
    });
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Rule { f: state })
                .with_value(Rc::new(RefCell::new(None::<T>)) as Rc<RefCell<dyn Any>>)
                .needing_init(),
        )
    });
    ReadOnlyCell {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// Creates a discrete rule cell: the rule's output reverts to `reset` one
/// pulse after any run that produced something else, modelling a derived
/// event.
#[track_caller]
pub fn create_discrete_rule<T>(
    rule: impl Fn(Option<&T>) -> T + 'static,
    reset: T,
) -> ReadOnlyCell<T>
where
    T: PartialEq + Clone + 'static,
{
    let state: Rc<dyn AnyRule> = Rc::new(RuleState {
        f: rule,
        writable: false,
        ty: PhantomData,
    });
    let factory = reset_factory(reset.clone());
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Rule { f: state })
                .with_value(Rc::new(RefCell::new(Some(reset))) as Rc<RefCell<dyn Any>>)
                .with_reset(factory)
                .needing_init(),
        )
    });
    ReadOnlyCell {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// Creates a writable rule cell seeded with `value`.
#[track_caller]
pub fn create_cell<T>(
    rule: impl Fn(Option<&T>) -> T + 'static,
    value: T,
) -> Cell<T>
where
    T: PartialEq + 'static,
{
    let state: Rc<dyn AnyRule> = Rc::new(RuleState {
        f: rule,
        writable: true,
        ty: PhantomData,
    });
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::RuleValue { f: state })
                .with_value(Rc::new(RefCell::new(Some(value))) as Rc<RefCell<dyn Any>>)
                .needing_init(),
        )
    });
    Cell {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// Creates a constant. Reads return the value without creating any
/// dependency.
pub fn constant<T>(value: T) -> Constant<T>
where
    T: PartialEq + 'static,
{
    let id = with_ctrl(|c| {
        c.insert_node(
            CellNode::new(CellKind::Constant)
                .with_value(Rc::new(RefCell::new(Some(value))) as Rc<RefCell<dyn Any>>),
        )
    });
    Constant { id, ty: PhantomData }
}

impl<T> ReadOnlyCell<T> {
    /// The cell's current evaluation layer; always above the layers of
    /// everything it reads.
    pub fn layer(&self) -> Layer {
        with_ctrl(|c| c.node_layer(self.id))
    }

    /// Whether the cell has retired into a constant.
    pub fn is_constant(&self) -> bool {
        with_ctrl(|c| matches!(c.kind_of(self.id), Some(CellKind::Constant)))
    }

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

impl<T> Cell<T> {
    pub fn layer(&self) -> Layer {
        with_ctrl(|c| c.node_layer(self.id))
    }

    /// Attaches a scoped [`Manager`](crate::Manager) to this cell; see
    /// [`Value::attach_manager`](crate::Value::attach_manager).
    pub fn attach_manager(&self, manager: Rc<dyn crate::Manager>) {
        with_ctrl(|c| {
            if let Some(node) = c.nodes.borrow_mut().get_mut(self.id) {
                node.manager = Some(manager);
            }
        });
    }

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

impl<T> Constant<T> {
    pub fn dispose(self) {
        with_ctrl(|c| c.dispose_node(self.id));
    }
}

/// Shared read path for rule cells: make sure the rule has run once, track
/// the read (unless the cell has become constant), then borrow the value.
fn rule_cell_with<T, O>(
    id: CellId,
    init_if: impl Fn(&Controller) -> bool,
    f: impl FnOnce(&T) -> O,
) -> Option<O>
where
    T: 'static,
{
    let needs_atomic_init = with_ctrl(|c| {
        c.needs_init(id) && init_if(c) && !c.history.active.get()
    });
    if needs_atomic_init {
        // initialization must be atomic
        return atomically(|| rule_cell_with(id, init_if, f));
    }
    with_ctrl(|c| {
        if c.needs_init(id) && init_if(c) {
            c.run_listener(id);
        }
        let is_constant = matches!(c.kind_of(id), Some(CellKind::Constant));
        if !is_constant && c.current_listener.get().is_some() {
            c.used(id);
        }
        let slot = c.value_slot(id)?;
        let borrow = slot.borrow();
        borrow.downcast_ref::<Option<T>>()?.as_ref().map(f)
    })
}

impl<T> CellWith<T> for ReadOnlyCell<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with(f)
            .expect("cell was disposed or belongs to another thread")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        rule_cell_with(self.id, |_| true, f)
    }
}

impl<T> CellWith<T> for Cell<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with(f)
            .expect("cell was disposed or belongs to another thread")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        // a value written before the first read takes precedence over the
        // rule, which then only runs to pick up its dependencies
        let id = self.id;
        rule_cell_with(id, move |c| c.set_by_of(id).is_none(), f)
    }
}

impl<T> CellWith<T> for Constant<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with(f)
            .expect("cell was disposed or belongs to another thread")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        with_ctrl(|c| {
            let slot = c.value_slot(self.id)?;
            let borrow = slot.borrow();
            borrow.downcast_ref::<Option<T>>()?.as_ref().map(f)
        })
    }
}

macro_rules! impl_with_untracked {
    ($($ty:ident),*) => {
        $(
            impl<T> CellWithUntracked<T> for $ty<T> {
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
        )*
    };
}

impl_with_untracked![ReadOnlyCell, Cell, Constant];

impl<T> CellSet<T> for Cell<T>
where
    T: PartialEq + Debug + 'static,
{
    #[track_caller]
    fn set(&self, value: T) {
        let was_active = with_ctrl(|c| c.history.active.get());
        if let Err(e) = self.try_set(value) {
            if !was_active {
                panic!("set failed: {e}");
            }
        }
    }

    fn try_set(&self, value: T) -> Result<(), TrellisError> {
        write_cell(self.id, value, true)
    }
}

impl<T> CellUpdate<T> for Cell<T>
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

impl<T> CellSetUntracked<T> for Cell<T>
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

// ---- rule execution ---------------------------------------------------------

/// Type-erased rule body. `run` performs the whole update step: compute the
/// next value from the previous one, store it with undo if it differs, and
/// propagate the change. `run_discarding` only runs the body to establish
/// dependencies, leaving the stored value alone.
pub(crate) trait AnyRule {
    fn run(&self, c: &Controller, id: CellId);
    fn run_discarding(&self, c: &Controller, id: CellId);
}

pub(crate) struct RuleState<T, F>
where
    T: 'static,
    F: Fn(Option<&T>) -> T,
{
    pub f: F,
    /// Writable rule cells never retire into constants.
    pub writable: bool,
    pub ty: PhantomData<fn() -> T>,
}

/// Holds the value taken out of a cell's slot while its rule runs, and puts
/// it back if the rule unwinds, so a rollback sees a consistent slot.
struct SlotGuard<T: 'static> {
    slot: Rc<RefCell<dyn Any>>,
    value: Option<Option<T>>,
}

impl<T> SlotGuard<T> {
    fn take(slot: &Rc<RefCell<dyn Any>>) -> Self {
        let value = slot
            .borrow_mut()
            .downcast_mut::<Option<T>>()
            .expect("cell value type")
            .take();
        SlotGuard {
            slot: Rc::clone(slot),
            value: Some(value),
        }
    }

    fn previous(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.as_ref())
    }

    fn disarm(mut self) -> Option<T> {
        self.value.take().expect("slot guard already disarmed")
    }
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Some(slot) = self.slot.borrow_mut().downcast_mut::<Option<T>>() {
                *slot = value;
            }
        }
    }
}

impl<T, F> AnyRule for RuleState<T, F>
where
    T: PartialEq + 'static,
    F: Fn(Option<&T>) -> T,
{
    fn run(&self, c: &Controller, id: CellId) {
        let Some(slot) = c.value_slot(id) else {
            return;
        };
        let guard = SlotGuard::<T>::take(&slot);
        let next = (self.f)(guard.previous());
        let previous = guard.disarm();
        if previous.as_ref() == Some(&next) {
            *slot
                .borrow_mut()
                .downcast_mut::<Option<T>>()
                .expect("cell value type") = previous;
            return;
        }
        if c.claim_set_by(id, Setter::Listener(id)) {
            let finish: Box<dyn FnOnce()> = if self.writable {
                Box::new(move || finish_value::<T>(id))
            } else {
                Box::new(move || finish_rule::<T>(id))
            };
            c.push_commit(finish);
        }
        let undo_slot = Rc::clone(&slot);
        c.push_undo(Box::new(move || {
            if let Some(v) = undo_slot.borrow_mut().downcast_mut::<Option<T>>() {
                *v = previous;
            }
        }));
        *slot
            .borrow_mut()
            .downcast_mut::<Option<T>>()
            .expect("cell value type") = Some(next);
        c.changed(id);
    }

    fn run_discarding(&self, c: &Controller, id: CellId) {
        let Some(slot) = c.value_slot(id) else {
            return;
        };
        let guard = SlotGuard::<T>::take(&slot);
        let _ = (self.f)(guard.previous());
        drop(guard); // puts the value back
    }
}

/// Commit hook for read-only rule cells: after the discrete reset has been
/// delivered, a cell whose latest run read nothing retires into a constant.
pub(crate) fn finish_rule<T>(id: CellId)
where
    T: PartialEq + 'static,
{
    finish_value::<T>(id);
    with_ctrl(|c| {
        if c.graph.borrow().has_sources(id) {
            return;
        }
        let (slot, factory) = {
            let nodes = c.nodes.borrow();
            let Some(node) = nodes.get(id) else {
                return;
            };
            if !matches!(node.kind, CellKind::Rule { .. }) {
                return;
            }
            (node.value.clone(), node.reset.clone())
        };
        let Some(slot) = slot else {
            return;
        };
        let at_rest = match factory {
            None => true,
            Some(factory) => match factory().downcast::<T>() {
                Ok(fresh) => {
                    let borrow = slot.borrow();
                    borrow
                        .downcast_ref::<Option<T>>()
                        .map(|v| v.as_ref() == Some(&*fresh))
                        .unwrap_or(false)
                }
                Err(_) => false,
            },
        };
        if !at_rest {
            return;
        }
        c.set_kind(id, CellKind::Constant);
        let orphaned = c.graph.borrow_mut().take_subscribers(id);
        if !orphaned.is_empty() {
            c.push_undo(Box::new(move || {
                with_ctrl(|c| {
                    let mut graph = c.graph.borrow_mut();
                    for listener in &orphaned {
                        graph.link(id, *listener);
                    }
                });
            }));
        }
    });
}
