use crate::{cell::AnyRule, graph::CellId, history::Manager, task::TaskState};
use std::{any::Any, cell::RefCell, fmt, rc::Rc};

/// The evaluation layer of a listener.
///
/// A listener always runs after every subject it (transitively) reads, which
/// the controller guarantees by keeping each listener's layer strictly above
/// the layers of its subjects and draining the pulse queue lowest layer
/// first. Observers run at [`Layer::MAX`], after all ordinary rules.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Layer(pub(crate) u32);

impl Layer {
    /// The commit-phase layer reserved for observers and tasks.
    pub const MAX: Layer = Layer(u32::MAX);

    pub(crate) fn succ(self) -> Layer {
        Layer(self.0.saturating_add(1))
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Layer::MAX {
            write!(f, "Layer(MAX)")
        } else {
            write!(f, "Layer({})", self.0)
        }
    }
}

/// Who wrote a value cell during the current pulse.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Setter {
    /// A plain write from outside any rule.
    External,
    /// A write made while the given listener was running.
    Listener(CellId),
}

#[derive(Clone)]
pub(crate) enum CellKind {
    /// An input value with no rule.
    Value,
    /// A read-only rule cell.
    Rule { f: Rc<dyn AnyRule> },
    /// A writable rule cell: writes override the rule for one pulse.
    RuleValue { f: Rc<dyn AnyRule> },
    /// An immutable value, either born constant or a retired rule cell.
    Constant,
    /// Commit-phase side effects. Actions additionally hold the write
    /// permission that plain observers lack.
    Observer { f: Rc<dyn Fn()>, action: bool },
    /// A resumable coroutine stepped once per pulse.
    Task { state: Rc<RefCell<TaskState>> },
}

pub(crate) struct CellNode {
    /// Current value, stored as `Option<T>` behind `dyn Any`. `None` for
    /// observers and tasks, and for rule cells before their first run.
    pub value: Option<Rc<RefCell<dyn Any>>>,
    pub kind: CellKind,
    pub layer: Layer,
    pub set_by: Option<Setter>,
    /// Discrete cells: produces a fresh copy of the reset value the cell
    /// reverts to when the pulse that set it commits.
    pub reset: Option<Rc<dyn Fn() -> Box<dyn Any>>>,
    /// Write interceptor, stored as `Box<dyn Fn(T) -> T>` behind `dyn Any`.
    pub writer: Option<Rc<dyn Any>>,
    pub needs_init: bool,
    pub manager: Option<Rc<dyn Manager>>,
}

impl CellNode {
    pub fn new(kind: CellKind) -> Self {
        Self {
            value: None,
            kind,
            layer: Layer::default(),
            set_by: None,
            reset: None,
            writer: None,
            needs_init: false,
            manager: None,
        }
    }

    pub fn with_value(mut self, value: Rc<RefCell<dyn Any>>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_reset(mut self, reset: Rc<dyn Fn() -> Box<dyn Any>>) -> Self {
        self.reset = Some(reset);
        self
    }

    pub fn with_writer(mut self, writer: Rc<dyn Any>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn needing_init(mut self) -> Self {
        self.needs_init = true;
        self
    }

    /// Whether a dependency change should enqueue this node.
    pub fn dirty(&self, id: CellId) -> bool {
        match &self.kind {
            CellKind::Value | CellKind::Constant => false,
            CellKind::Rule { .. } | CellKind::Observer { .. } | CellKind::Task { .. } => true,
            // A writable rule cell that was set by something other than its
            // own rule holds that value for the rest of the pulse.
            CellKind::RuleValue { .. } => match self.set_by {
                None => true,
                Some(Setter::Listener(l)) => l == id,
                Some(Setter::External) => false,
            },
        }
    }
}
