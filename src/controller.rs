#![forbid(unsafe_code)]

use crate::{
    error::{Routes, TrellisError},
    graph::{CellId, DepGraph, FxIndexSet},
    history::{FlagGuard, History, Manager, Savepoint, Thunk},
    macros::debug_warn,
    node::{CellKind, CellNode, Layer, Setter},
};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::SlotMap;
use std::{
    any::Any,
    cell::{Cell, RefCell},
    cmp::Reverse,
    collections::{hash_map::Entry, BinaryHeap},
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    rc::Rc,
};

thread_local! {
    static CONTROLLER: Controller = Controller::default();
}

/// Runs `f` with this thread's controller. Every cell belongs to the
/// controller of the thread it was created on; ids from another thread
/// simply fail to resolve in this arena.
#[inline(always)]
pub(crate) fn with_ctrl<T>(f: impl FnOnce(&Controller) -> T) -> T {
    CONTROLLER.with(f)
}

// The data structure that owns all the cells, their dependency links, and
// the transactional state of the pulse in progress.
#[derive(Default)]
pub(crate) struct Controller {
    pub history: History,
    pub nodes: RefCell<SlotMap<CellId, CellNode>>,
    pub graph: RefCell<DepGraph>,
    /// Subjects read by the listener currently running.
    reads: RefCell<FxIndexSet<CellId>>,
    /// Subjects changed by the listener currently running.
    writes: RefCell<FxIndexSet<CellId>>,
    /// Listeners that have completed in this pulse, mapped to the enclosing
    /// top-level listener they ran under.
    pub has_run: RefCell<FxHashMap<CellId, CellId>>,
    layers: RefCell<BinaryHeap<Reverse<Layer>>>,
    queues: RefCell<FxHashMap<Layer, FxIndexSet<CellId>>>,
    to_retry: RefCell<FxIndexSet<CellId>>,
    /// Per-pulse notification edges (runner → listeners it scheduled),
    /// consulted by cycle detection when a listener is re-triggered.
    notified: RefCell<FxHashMap<CellId, FxIndexSet<CellId>>>,
    /// Parked listeners (paused tasks, polling rules), re-queued at the
    /// start of the next top-level atomic operation.
    pub paused: RefCell<Vec<CellId>>,
    /// First error raised inside the current pulse; aborts the block.
    pending: RefCell<Option<TrellisError>>,
    pub current_listener: Cell<Option<CellId>>,
    pub readonly: Cell<bool>,
    /// Component construction scopes currently collecting created cells.
    capture: RefCell<Vec<Vec<CellId>>>,
}

impl Controller {
    // ---- atomic operations -------------------------------------------------

    pub fn atomic<T>(&self, f: impl FnOnce() -> T) -> Result<T, TrellisError> {
        if self.history.in_cleanup.get() {
            return Err(TrellisError::NoReentrantRun);
        }
        if self.history.active.get() {
            return Ok(f());
        }
        self.history.active.set(true);
        match catch_unwind(AssertUnwindSafe(|| self.process(f))) {
            Ok(result) => {
                self.history.active.set(false);
                result
            }
            Err(payload) => {
                // A rule or commit hook panicked: unwind the transaction and
                // release managers before resuming the panic.
                self.history.in_cleanup.set(false);
                self.history.in_rollback.set(false);
                self.clear_schedule();
                let _ = self.cleanup(Err(TrellisError::RulePanicked));
                self.reset_scratch();
                self.history.active.set(false);
                resume_unwind(payload)
            }
        }
    }

    /// The pulse loop: run the user function, then drain the layer queues
    /// lowest-first to a fixed point. Each commit round (hooks + manager
    /// exit) ends one pulse; hooks may schedule more work, which runs as a
    /// fresh pulse within the same atomic block.
    fn process<T>(&self, f: impl FnOnce() -> T) -> Result<T, TrellisError> {
        self.resume_paused();
        let retval = f();
        if let Some(e) = self.take_pending() {
            return Err(self.fail(e));
        }
        loop {
            while let Some(layer) = self.peek_layer() {
                if !self.to_retry.borrow().is_empty() {
                    if let Err(e) = self.retry() {
                        return Err(self.fail(e));
                    }
                }
                match self.pop_queued(layer) {
                    Some(listener) => {
                        // a rollback past this point re-queues the listener
                        self.push_undo(Box::new(move || {
                            with_ctrl(|c| c.schedule_inner(listener, None, true));
                        }));
                        self.run_listener(listener);
                        if let Some(e) = self.take_pending() {
                            return Err(self.fail(e));
                        }
                    }
                    None => self.drop_layer(layer),
                }
            }
            if let Err(e) = self.cleanup(Ok(())) {
                self.clear_schedule();
                return Err(e);
            }
            if self.peek_layer().is_none() && !self.history.has_commit_hooks() {
                break;
            }
        }
        Ok(retval)
    }

    fn fail(&self, error: TrellisError) -> TrellisError {
        self.clear_schedule();
        match self.cleanup(Err(error.clone())) {
            Err(chained) => chained,
            Ok(()) => error,
        }
    }

    /// Ends one pulse: clears the run record, executes commit hooks (or
    /// rolls back on error), exits managers in reverse order, and empties
    /// the logs and per-pulse scratch state.
    fn cleanup(&self, outcome: Result<(), TrellisError>) -> Result<(), TrellisError> {
        self.has_run.borrow_mut().clear();
        let result = self.cleanup_history(outcome);
        self.current_listener.set(None);
        self.readonly.set(false);
        self.notified.borrow_mut().clear();
        self.to_retry.borrow_mut().clear();
        self.reads.borrow_mut().clear();
        self.writes.borrow_mut().clear();
        result
    }

    fn cleanup_history(
        &self,
        outcome: Result<(), TrellisError>,
    ) -> Result<(), TrellisError> {
        let h = &self.history;
        assert!(h.active.get(), "cleanup outside an atomic operation");
        assert!(!h.in_cleanup.get(), "cleanup is not re-entrant");
        let guard = FlagGuard::set(&h.in_cleanup);
        let mut error = outcome.err();
        if error.is_none() {
            // hooks registered while earlier hooks run are picked up too
            let mut index = 0;
            while let Some(hook) = h.take_commit_hook(index) {
                index += 1;
                hook();
                if let Some(e) = self.take_pending() {
                    error = Some(e);
                    break;
                }
            }
        }
        if error.is_some() {
            h.rollback_to(Savepoint(0));
        }
        let managers = h.take_managers();
        for m in managers.into_iter().rev() {
            if let Err(e) = m.exit(error.as_ref()) {
                error = Some(e);
            }
        }
        h.clear_logs();
        drop(guard);
        match error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn reset_scratch(&self) {
        self.current_listener.set(None);
        self.readonly.set(false);
        self.reads.borrow_mut().clear();
        self.writes.borrow_mut().clear();
        self.has_run.borrow_mut().clear();
        self.notified.borrow_mut().clear();
        self.to_retry.borrow_mut().clear();
        self.pending.borrow_mut().take();
        self.clear_schedule();
    }

    // ---- read/write tracking ----------------------------------------------

    /// Records that the running listener read `subject`, raising the
    /// listener's layer above the subject's. Reads of a cell by its own
    /// rule do not link.
    pub fn used(&self, subject: CellId) {
        self.lock(subject);
        let Some(current) = self.current_listener.get() else {
            return;
        };
        if current == subject || self.reads.borrow().contains(&subject) {
            return;
        }
        self.reads.borrow_mut().insert(subject);
        let subject_layer = self.node_layer(subject);
        if subject_layer >= self.node_layer(current) {
            // layers rise monotonically; deliberately not undo-logged
            self.set_layer_raw(current, subject_layer.succ());
        }
    }

    /// Records that `subject` changed. Inside a rule the write is buffered
    /// and propagated when the rule finishes; a plain external write
    /// enqueues the dirty listeners immediately.
    pub fn changed(&self, subject: CellId) {
        self.lock(subject);
        if self.readonly.get() {
            self.set_pending(TrellisError::ReadOnlyPhase);
            return;
        }
        if self.current_listener.get().is_some() {
            self.writes.borrow_mut().insert(subject);
        } else {
            let listeners = self.graph.borrow().listeners_of(subject);
            for listener in listeners {
                if self.dirty_query(listener) {
                    self.schedule(listener, None);
                }
            }
        }
    }

    /// Enters the subject's manager, if it has one this block has not
    /// entered yet.
    pub fn lock(&self, subject: CellId) {
        debug_assert!(
            self.history.active.get(),
            "cells must be accessed inside an atomic operation"
        );
        let manager = self
            .nodes
            .borrow()
            .get(subject)
            .and_then(|n| n.manager.clone());
        if let Some(m) = manager {
            self.history.manage(m);
        }
    }

    // ---- scheduling --------------------------------------------------------

    pub fn schedule(&self, listener: CellId, source_layer: Option<Layer>) {
        self.schedule_inner(listener, source_layer, false);
    }

    fn schedule_inner(
        &self,
        listener: CellId,
        source_layer: Option<Layer>,
        reschedule: bool,
    ) {
        let old = self.node_layer(listener);
        debug_assert!(
            !self.readonly.get() || old == Layer::MAX,
            "scheduling a non-observer during the commit phase"
        );
        let mut new = old;
        if let Some(source) = source_layer {
            if source >= old {
                new = source.succ();
            }
        }
        if let Some(&top) = self.has_run.borrow().get(&listener) {
            self.to_retry.borrow_mut().insert(top);
        }
        let queued_at_old = self
            .queues
            .borrow()
            .get(&old)
            .map_or(false, |q| q.contains(&listener));
        if queued_at_old {
            if new != old {
                self.cancel(listener);
            }
        } else if self.history.active.get() && !reschedule {
            self.push_undo(Box::new(move || with_ctrl(|c| c.cancel(listener))));
        }
        if new != old {
            // the elevation itself is not transactional state
            self.set_layer_raw(listener, new);
        }
        let mut queues = self.queues.borrow_mut();
        match queues.entry(new) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().insert(listener);
            }
            Entry::Vacant(entry) => {
                let mut queue = FxIndexSet::default();
                queue.insert(listener);
                entry.insert(queue);
                self.layers.borrow_mut().push(Reverse(new));
            }
        }
    }

    /// Removes the listener from its layer's queue, if queued.
    pub fn cancel(&self, listener: CellId) {
        let layer = self.node_layer(listener);
        let mut queues = self.queues.borrow_mut();
        if let Some(queue) = queues.get_mut(&layer) {
            if queue.shift_remove(&listener) && queue.is_empty() {
                queues.remove(&layer);
                self.layers.borrow_mut().retain(|r| r.0 != layer);
            }
        }
    }

    fn peek_layer(&self) -> Option<Layer> {
        self.layers.borrow().peek().map(|r| r.0)
    }

    fn pop_queued(&self, layer: Layer) -> Option<CellId> {
        self.queues
            .borrow_mut()
            .get_mut(&layer)
            .and_then(|q| q.shift_remove_index(0))
    }

    fn drop_layer(&self, layer: Layer) {
        self.queues.borrow_mut().remove(&layer);
        let mut layers = self.layers.borrow_mut();
        if layers.peek().map(|r| r.0) == Some(layer) {
            layers.pop();
        } else {
            layers.retain(|r| r.0 != layer);
        }
    }

    fn clear_schedule(&self) {
        self.layers.borrow_mut().clear();
        self.queues.borrow_mut().clear();
    }

    // ---- running listeners -------------------------------------------------

    /// Runs one listener. Top-level runs propagate their writes and
    /// reconcile their reads; nested runs (a cell initialized while another
    /// rule reads it) fork a fresh read set and leave write propagation to
    /// the enclosing top-level run.
    pub fn run_listener(&self, id: CellId) {
        let enclosing = self.current_listener.replace(Some(id));
        let was_readonly = self.readonly.get();
        // actions and tasks keep the write permission plain observers lack
        let writes_allowed = matches!(
            self.kind_of(id),
            Some(CellKind::Observer { action: true, .. }) | Some(CellKind::Task { .. })
        );
        if self.node_layer(id) == Layer::MAX && !writes_allowed {
            self.readonly.set(true);
        }
        debug_assert!(
            !self.has_run.borrow().contains_key(&id),
            "re-run of a rule without retry"
        );
        match enclosing {
            Some(outer) => {
                let top = self
                    .has_run
                    .borrow()
                    .get(&outer)
                    .copied()
                    .unwrap_or(outer);
                self.has_run.borrow_mut().insert(id, top);
                self.push_undo(Box::new(move || {
                    with_ctrl(|c| {
                        c.has_run.borrow_mut().remove(&id);
                    });
                }));
                let outer_reads = self.reads.replace(FxIndexSet::default());
                self.run_node(id);
                self.process_reads(id);
                self.reads.replace(outer_reads);
            }
            None => {
                self.has_run.borrow_mut().insert(id, id);
                self.push_undo(Box::new(move || {
                    with_ctrl(|c| {
                        c.has_run.borrow_mut().remove(&id);
                    });
                }));
                self.run_node(id);
                self.process_writes(id);
                self.process_reads(id);
            }
        }
        self.current_listener.set(enclosing);
        self.readonly.set(was_readonly);
    }

    fn run_node(&self, id: CellId) {
        let kind = {
            let nodes = self.nodes.borrow();
            match nodes.get(id) {
                Some(node) => node.kind.clone(),
                None => return,
            }
        };
        match kind {
            CellKind::Rule { f } => {
                self.clear_needs_init(id);
                f.run(self, id);
            }
            CellKind::RuleValue { f } => {
                if self.dirty_query(id) {
                    self.clear_needs_init(id);
                    f.run(self, id);
                } else if self.needs_init(id) {
                    // value was written before the first read: keep it, but
                    // run the rule once so future changes are noticed
                    self.clear_needs_init(id);
                    f.run_discarding(self, id);
                } else {
                    debug_warn!("externally-set rule cell ran without being dirty");
                }
            }
            CellKind::Observer { f, .. } => f(),
            CellKind::Task { state } => crate::task::step(self, id, &state),
            CellKind::Value | CellKind::Constant => {}
        }
    }

    /// Drains the write set of a finished top-level run and enqueues every
    /// dirty listener of each written subject, recording who notified whom
    /// for cycle diagnostics.
    fn process_writes(&self, runner: CellId) {
        let layer = self.node_layer(runner);
        // writes made during the commit phase must not drag their readers
        // up to the observer layer
        let source = if layer == Layer::MAX { None } else { Some(layer) };
        loop {
            let subject = self.writes.borrow_mut().shift_remove_index(0);
            let Some(subject) = subject else { break };
            let listeners = self.graph.borrow().listeners_of(subject);
            for dependent in listeners {
                if self.has_run.borrow().get(&dependent).copied() == Some(runner) {
                    continue;
                }
                if self.dirty_query(dependent) {
                    self.schedule(dependent, source);
                    self.notified
                        .borrow_mut()
                        .entry(runner)
                        .or_default()
                        .insert(dependent);
                }
            }
        }
    }

    /// Reconciles the fresh read set of a finished run against the
    /// listener's existing dependency links: stale links are dropped, new
    /// ones created, and both are undo-logged so a rollback restores the
    /// previous dependency set.
    fn process_reads(&self, listener: CellId) {
        let mut fresh = self.reads.replace(FxIndexSet::default());
        let existing = self.graph.borrow().subjects_of(listener);
        for subject in existing {
            if fresh.shift_remove(&subject) {
                continue;
            }
            self.graph.borrow_mut().unlink(subject, listener);
            self.push_undo(Box::new(move || {
                with_ctrl(|c| c.graph.borrow_mut().link(subject, listener));
            }));
        }
        for subject in fresh {
            self.graph.borrow_mut().link(subject, listener);
            self.push_undo(Box::new(move || {
                with_ctrl(|c| c.graph.borrow_mut().unlink(subject, listener));
            }));
        }
    }

    // ---- cycle detection ---------------------------------------------------

    /// A listener that already completed this pulse has been re-triggered.
    /// If the pulse's notification edges contain a path from the trigger
    /// back to itself, the rules are arranged in a loop; otherwise the
    /// trigger's run record is cleared and the queue re-runs it.
    fn retry(&self) -> Result<(), TrellisError> {
        let triggers: Vec<CellId> = self.to_retry.borrow_mut().drain(..).collect();
        for &trigger in &triggers {
            if let Some(routes) = self.find_cycle(trigger) {
                tracing::debug!(?trigger, "circular dependency detected");
                return Err(TrellisError::Circularity { routes });
            }
        }
        let triggered: FxHashSet<CellId> = triggers.into_iter().collect();
        self.has_run
            .borrow_mut()
            .retain(|_, top| !triggered.contains(top));
        Ok(())
    }

    fn find_cycle(&self, trigger: CellId) -> Option<Routes> {
        let edges = self.notified.borrow();
        let mut forward: FxHashSet<CellId> = FxHashSet::default();
        let mut stack = vec![trigger];
        let mut closes = false;
        while let Some(node) = stack.pop() {
            let Some(successors) = edges.get(&node) else {
                continue;
            };
            for &next in successors {
                if next == trigger {
                    closes = true;
                }
                if forward.insert(next) {
                    stack.push(next);
                }
            }
        }
        if !closes {
            return None;
        }
        // restrict to nodes that both follow from and lead back to the
        // trigger; those are the cycle for diagnostic purposes
        let mut backward: FxHashSet<CellId> = FxHashSet::default();
        backward.insert(trigger);
        let mut grew = true;
        while grew {
            grew = false;
            for (&from, successors) in edges.iter() {
                if !backward.contains(&from)
                    && successors.iter().any(|s| backward.contains(s))
                {
                    backward.insert(from);
                    grew = true;
                }
            }
        }
        let mut on_cycle: FxHashSet<CellId> =
            forward.intersection(&backward).copied().collect();
        on_cycle.insert(trigger);
        let mut routes = Vec::new();
        for &node in &on_cycle {
            if let Some(successors) = edges.get(&node) {
                let via: Vec<CellId> = successors
                    .iter()
                    .copied()
                    .filter(|s| on_cycle.contains(s))
                    .collect();
                if !via.is_empty() {
                    routes.push((node, via));
                }
            }
        }
        routes.sort_unstable_by_key(|(node, _)| *node);
        Some(Routes(routes))
    }

    // ---- tasks -------------------------------------------------------------

    fn resume_paused(&self) {
        let parked: Vec<CellId> = self.paused.borrow_mut().drain(..).collect();
        for id in parked {
            let alive = self.nodes.borrow().contains_key(id);
            if alive {
                self.schedule(id, None);
            }
        }
    }

    // ---- node bookkeeping --------------------------------------------------

    pub fn insert_node(&self, node: CellNode) -> CellId {
        let id = self.nodes.borrow_mut().insert(node);
        if let Some(scope) = self.capture.borrow_mut().last_mut() {
            scope.push(id);
        }
        id
    }

    pub fn dispose_node(&self, id: CellId) {
        self.cancel(id);
        self.graph.borrow_mut().drop_node(id);
        self.nodes.borrow_mut().remove(id);
        self.paused.borrow_mut().retain(|p| *p != id);
    }

    pub fn value_slot(&self, id: CellId) -> Option<Rc<RefCell<dyn Any>>> {
        self.nodes.borrow().get(id).and_then(|n| n.value.clone())
    }

    pub fn node_layer(&self, id: CellId) -> Layer {
        self.nodes
            .borrow()
            .get(id)
            .map(|n| n.layer)
            .unwrap_or_default()
    }

    fn set_layer_raw(&self, id: CellId, layer: Layer) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.layer = layer;
        }
    }

    pub fn kind_of(&self, id: CellId) -> Option<CellKind> {
        self.nodes.borrow().get(id).map(|n| n.kind.clone())
    }

    pub fn needs_init(&self, id: CellId) -> bool {
        self.nodes
            .borrow()
            .get(id)
            .map(|n| n.needs_init)
            .unwrap_or(false)
    }

    pub fn set_by_of(&self, id: CellId) -> Option<Setter> {
        self.nodes.borrow().get(id).and_then(|n| n.set_by)
    }

    pub fn dirty_query(&self, id: CellId) -> bool {
        self.nodes
            .borrow()
            .get(id)
            .map(|n| n.dirty(id))
            .unwrap_or(false)
    }

    /// Undo-logged update of a node's `set_by`.
    pub fn set_set_by(&self, id: CellId, set_by: Option<Setter>) {
        let old = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else { return };
            std::mem::replace(&mut node.set_by, set_by)
        };
        self.push_undo(Box::new(move || {
            with_ctrl(|c| {
                if let Some(node) = c.nodes.borrow_mut().get_mut(id) {
                    node.set_by = old;
                }
            });
        }));
    }

    /// Claims `set_by` for `setter` if no one has written the cell this
    /// pulse. Returns whether the claim succeeded (the caller registers the
    /// cell's commit hook exactly once, on the first claim).
    pub fn claim_set_by(&self, id: CellId, setter: Setter) -> bool {
        if self.set_by_of(id).is_none() {
            self.set_set_by(id, Some(setter));
            true
        } else {
            false
        }
    }

    /// Undo-logged update of a node's kind (rule cell retiring to constant,
    /// task completing).
    pub fn set_kind(&self, id: CellId, kind: CellKind) {
        let old = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else { return };
            std::mem::replace(&mut node.kind, kind)
        };
        self.push_undo(Box::new(move || {
            with_ctrl(|c| {
                if let Some(node) = c.nodes.borrow_mut().get_mut(id) {
                    node.kind = old;
                }
            });
        }));
    }

    fn clear_needs_init(&self, id: CellId) {
        if !self.needs_init(id) {
            return;
        }
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.needs_init = false;
        }
        self.push_undo(Box::new(move || {
            with_ctrl(|c| {
                if let Some(node) = c.nodes.borrow_mut().get_mut(id) {
                    node.needs_init = true;
                }
            });
        }));
    }

    pub fn push_undo(&self, thunk: Thunk) {
        self.history.push_undo(thunk);
    }

    pub fn push_commit(&self, thunk: Thunk) {
        self.history.push_commit(thunk);
    }

    pub fn set_pending(&self, error: TrellisError) {
        let mut pending = self.pending.borrow_mut();
        if pending.is_none() {
            *pending = Some(error);
        }
    }

    fn take_pending(&self) -> Option<TrellisError> {
        self.pending.borrow_mut().take()
    }

    // ---- component capture -------------------------------------------------

    pub fn begin_capture(&self) {
        self.capture.borrow_mut().push(Vec::new());
    }

    pub fn end_capture(&self) -> Vec<CellId> {
        self.capture.borrow_mut().pop().unwrap_or_default()
    }
}

// ---- public entry points ---------------------------------------------------

/// Runs `f` as one atomic operation: writes made inside it are buffered,
/// every rule that (transitively) read a changed cell is recalculated to a
/// fixed point, and observers run once the graph has settled. Re-entrant
/// calls simply run `f` inside the enclosing operation.
///
/// # Panics
/// Panics if the operation fails (see [`TrellisError`]); use
/// [`try_atomically`] to handle failures.
///
/// ```
/// use trellis_reactive::*;
///
/// let a = create_value(1);
/// let b = create_value(2);
/// atomically(|| {
///     a.set(10);
///     b.set(20);
/// });
/// assert_eq!(a.get(), 10);
/// assert_eq!(b.get(), 20);
/// ```
#[track_caller]
pub fn atomically<T>(f: impl FnOnce() -> T) -> T {
    match try_atomically(f) {
        Ok(value) => value,
        Err(e) => panic!("atomic operation failed: {e}"),
    }
}

/// Like [`atomically`], but surfaces pulse failures instead of panicking.
#[cfg_attr(
    debug_assertions,
    tracing::instrument(level = "trace", skip_all)
)]
pub fn try_atomically<T>(f: impl FnOnce() -> T) -> Result<T, TrellisError> {
    with_ctrl(|c| c.atomic(f))
}

struct RestoreContext {
    listener: Option<CellId>,
    readonly: bool,
}

impl Drop for RestoreContext {
    fn drop(&mut self) {
        with_ctrl(|c| {
            c.current_listener.set(self.listener);
            c.readonly.set(self.readonly);
        });
    }
}

/// Runs `f` without dependency tracking: cells read inside it do not become
/// dependencies of the rule that called it.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    let restore = with_ctrl(|c| RestoreContext {
        listener: c.current_listener.take(),
        readonly: c.readonly.get(),
    });
    let value = f();
    drop(restore);
    value
}

/// Runs `f` as a *modifier*: the current listener and the commit-phase
/// write lock are suspended, so observers and tasks may write cells.
/// Reads inside `f` do not attach as dependencies of the caller, and an
/// atomic operation is started if none is active.
pub fn modify<T>(f: impl FnOnce() -> T) -> T {
    atomically(|| {
        let restore = with_ctrl(|c| {
            let ctx = RestoreContext {
                listener: c.current_listener.take(),
                readonly: c.readonly.get(),
            };
            c.readonly.set(false);
            ctx
        });
        let value = f();
        drop(restore);
        value
    })
}

/// Schedules the currently-running rule to run again at the next top-level
/// atomic operation, whether or not its dependencies change. Rules that
/// track external state poll so every externally-driven pulse refreshes
/// them. No-op outside a rule.
pub fn poll() {
    with_ctrl(|c| {
        let Some(current) = c.current_listener.get() else {
            debug_warn!("poll() called outside a rule");
            return;
        };
        let mut paused = c.paused.borrow_mut();
        if !paused.contains(&current) {
            paused.push(current);
        }
    });
}

/// Returns the current position of the undo log. Rolling back to it reverts
/// every operation performed since.
pub fn savepoint() -> Savepoint {
    with_ctrl(|c| c.history.savepoint())
}

/// Pops and runs undo entries until the log is back at `sp`.
///
/// # Panics
/// Panics outside an atomic operation, or when invoked from an undo entry.
pub fn rollback_to(sp: Savepoint) {
    with_ctrl(|c| c.history.rollback_to(sp));
}

/// Registers `f` to run if the current atomic operation is rolled back.
pub fn on_undo(f: impl FnOnce() + 'static) {
    with_ctrl(|c| c.history.push_undo(Box::new(f)));
}

/// Registers `f` to run when the current pulse commits. A rollback erases
/// the registration.
pub fn on_commit(f: impl FnOnce() + 'static) {
    with_ctrl(|c| c.history.push_commit(Box::new(f)));
}

/// Enters `m` for the remainder of the current atomic operation; see
/// [`Manager`].
pub fn manage(m: Rc<dyn Manager>) {
    with_ctrl(|c| c.history.manage(m));
}
