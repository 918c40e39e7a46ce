#![forbid(unsafe_code)]

use core::hash::BuildHasherDefault;
use indexmap::IndexSet;
use rustc_hash::FxHasher;
use slotmap::SecondaryMap;

slotmap::new_key_type! {
    /// Unique ID assigned to a cell.
    pub struct CellId;
}

pub(crate) type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

/// The dependency graph: which listeners each subject notifies, and which
/// subjects each listener read on its latest run.
///
/// Edges are kept in two mirrored index sets so that either endpoint can be
/// unlinked in O(1) while iteration order (the order dependencies were
/// created in) is preserved. A `CellId` whose node has been disposed simply
/// stops resolving, so stale edges are skipped rather than dangling.
#[derive(Default)]
pub(crate) struct DepGraph {
    /// subject → listeners that currently read it
    subscribers: SecondaryMap<CellId, FxIndexSet<CellId>>,
    /// listener → subjects it read on its latest run
    sources: SecondaryMap<CellId, FxIndexSet<CellId>>,
}

impl DepGraph {
    pub fn link(&mut self, subject: CellId, listener: CellId) {
        if let Some(entry) = self.subscribers.entry(subject) {
            entry.or_insert_with(FxIndexSet::default).insert(listener);
        }
        if let Some(entry) = self.sources.entry(listener) {
            entry.or_insert_with(FxIndexSet::default).insert(subject);
        }
    }

    pub fn unlink(&mut self, subject: CellId, listener: CellId) {
        if let Some(subs) = self.subscribers.get_mut(subject) {
            subs.shift_remove(&listener);
        }
        if let Some(srcs) = self.sources.get_mut(listener) {
            srcs.shift_remove(&subject);
        }
    }

    /// Snapshot of the listeners of `subject`, in link order. Taking a
    /// snapshot keeps propagation safe against unlinks that happen while the
    /// listeners run.
    pub fn listeners_of(&self, subject: CellId) -> Vec<CellId> {
        self.subscribers
            .get(subject)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the subjects `listener` read on its latest run.
    pub fn subjects_of(&self, listener: CellId) -> Vec<CellId> {
        self.sources
            .get(listener)
            .map(|srcs| srcs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_sources(&self, listener: CellId) -> bool {
        self.sources
            .get(listener)
            .map(|srcs| !srcs.is_empty())
            .unwrap_or(false)
    }

    /// Detaches every listener of `subject`, returning the edges so the
    /// caller can undo-log their restoration. Used when a rule cell retires
    /// into a constant: its value can never change again, so its listeners
    /// need not keep it alive in their dependency sets.
    pub fn take_subscribers(&mut self, subject: CellId) -> Vec<CellId> {
        let listeners: Vec<CellId> = self
            .subscribers
            .get_mut(subject)
            .map(|subs| subs.drain(..).collect())
            .unwrap_or_default();
        for &listener in &listeners {
            if let Some(srcs) = self.sources.get_mut(listener) {
                srcs.shift_remove(&subject);
            }
        }
        listeners
    }

    /// Removes every edge touching `id`, in both roles.
    pub fn drop_node(&mut self, id: CellId) {
        if let Some(srcs) = self.sources.remove(id) {
            for subject in srcs {
                if let Some(subs) = self.subscribers.get_mut(subject) {
                    subs.shift_remove(&id);
                }
            }
        }
        if let Some(subs) = self.subscribers.remove(id) {
            for listener in subs {
                if let Some(srcs) = self.sources.get_mut(listener) {
                    srcs.shift_remove(&id);
                }
            }
        }
    }
}
