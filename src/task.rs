#![forbid(unsafe_code)]

use crate::{
    atomically,
    controller::{with_ctrl, Controller},
    graph::CellId,
    macros::debug_warn,
    node::{CellKind, CellNode, Layer},
};
use std::{any::Any, cell::RefCell, rc::Rc};

/// A value passed between task frames.
pub type TaskValue = Box<dyn Any>;

/// One resumable step of a task. The frame is called once per pulse with
/// what happened since it last ran, and answers with a [`Step`].
pub type TaskFrame = Box<dyn FnMut(TaskResume) -> Step>;

/// Why a task frame is being resumed.
pub enum TaskResume {
    /// First call, or the frame paused and the next pulse arrived.
    Tick,
    /// The subtask this frame called returned a value.
    Value(TaskValue),
    /// The subtask this frame called failed. A frame that does not handle
    /// the failure should answer [`Step::Throw`] to propagate it.
    Failed(String),
}

/// A task frame's answer: what the task should do next.
pub enum Step {
    /// Push a subtask; this frame resumes with the subtask's result.
    Call(TaskFrame),
    /// Suspend until the next top-level pulse.
    Pause,
    /// Finish this frame, delivering a result to the calling frame.
    Return(TaskValue),
    /// Fail this frame, delivering the error to the calling frame. An
    /// error unhandled at the top of the stack panics the pulse.
    Throw(String),
}

pub(crate) struct TaskState {
    frames: Vec<TaskFrame>,
    resume: Option<TaskResume>,
}

/// A handle on a running task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Task {
    pub(crate) id: CellId,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

/// Starts a task: a resumable coroutine driven one step per pulse at the
/// commit layer.
///
/// Each step, the top frame runs with dependency tracking (cells it reads
/// re-trigger the task when they change) and the commit-phase write
/// permission of an action. While frames keep answering [`Step::Call`] /
/// [`Step::Return`] the task re-schedules itself pulse after pulse;
/// [`Step::Pause`] parks it until the next top-level atomic operation. When
/// the last frame returns, the task completes and is never run again.
///
/// Cancellation is cooperative: a task observes an input cell and winds
/// itself down when asked.
#[track_caller]
pub fn create_task(
    frame: impl FnMut(TaskResume) -> Step + 'static,
) -> Task {
    let state = Rc::new(RefCell::new(TaskState {
        frames: vec![Box::new(frame)],
        resume: None,
    }));
    let id = with_ctrl(|c| {
        c.insert_node(CellNode::new(CellKind::Task { state }).with_layer(Layer::MAX))
    });
    atomically(|| with_ctrl(|c| c.schedule(id, None)));
    Task {
        id,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

impl Task {
    /// Whether the task has run to completion.
    pub fn is_complete(&self) -> bool {
        with_ctrl(|c| matches!(c.kind_of(self.id), Some(CellKind::Constant)))
    }

    /// Drops the task without running it further.
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

/// Runs one step of the task's top frame and acts on its answer.
pub(crate) fn step(c: &Controller, id: CellId, state: &Rc<RefCell<TaskState>>) {
    let answer = {
        let mut task = state.borrow_mut();
        let resume = task.resume.take().unwrap_or(TaskResume::Tick);
        let Some(frame) = task.frames.last_mut() else {
            drop(task);
            complete(c, id);
            return;
        };
        frame(resume)
    };
    match answer {
        Step::Call(subtask) => {
            state.borrow_mut().frames.push(subtask);
            ensure_continue(c, id);
        }
        Step::Pause => {
            c.paused.borrow_mut().push(id);
        }
        Step::Return(value) => {
            let finished = {
                let mut task = state.borrow_mut();
                task.frames.pop();
                task.resume = Some(TaskResume::Value(value));
                task.frames.is_empty()
            };
            if finished {
                complete(c, id);
            } else {
                ensure_continue(c, id);
            }
        }
        Step::Throw(error) => {
            let unhandled = {
                let mut task = state.borrow_mut();
                task.frames.pop();
                task.resume = Some(TaskResume::Failed(error.clone()));
                task.frames.is_empty()
            };
            if unhandled {
                complete(c, id);
                panic!("task failed: {error}");
            }
            ensure_continue(c, id);
        }
    }
}

/// Keeps the task moving while it has pending work: a commit hook queues
/// the next step in a fresh pulse, so a task with no cell dependencies
/// cannot freeze.
fn ensure_continue(c: &Controller, id: CellId) {
    c.push_commit(Box::new(move || {
        with_ctrl(|c| {
            let alive = c.nodes.borrow().contains_key(id);
            if alive {
                c.schedule(id, None);
            } else {
                debug_warn!("completed task left in the schedule");
            }
        });
    }));
}

fn complete(c: &Controller, id: CellId) {
    c.set_kind(id, CellKind::Constant);
}
