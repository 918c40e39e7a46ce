#![forbid(unsafe_code)]

//! Event-driven, reactive cells over a software-transactional-memory
//! substrate.
//!
//! A *cell* holds either an input value or the result of a rule. Reading a
//! cell inside a rule records a dependency automatically; changing a cell
//! schedules every rule that (transitively) read it. Changes apply
//! atomically: writes are buffered, dirty rules run to a fixed point in
//! layer order under one logical *pulse*, and only consistent states are
//! ever visible from outside.
//!
//! The building blocks:
//!
//! 1. *Inputs:* [`create_value`], and [`create_discrete`] for one-shot
//!    event cells that reset themselves a pulse after being set.
//! 2. *Rules:* [`create_rule_cell`] for derived values, [`create_cell`]
//!    for derived values that writes may override.
//! 3. *Observers:* [`create_observer`] to push settled state out of the
//!    graph, [`create_action`] when the side effect must write back in.
//! 4. *Tasks:* [`create_task`] for multi-pulse, resumable procedures.
//! 5. *Time and loops:* the [`time`] service and the [`EventLoop`]
//!    implementations connect pulses to timers and external reactors.
//!
//! ```
//! use trellis_reactive::*;
//!
//! let celsius = create_value(0.0);
//! let fahrenheit = create_rule_cell(move |_| celsius.get() * 9.0 / 5.0 + 32.0);
//!
//! assert_eq!(fahrenheit.get(), 32.0);
//! celsius.set(100.0);
//! assert_eq!(fahrenheit.get(), 212.0);
//! ```
//!
//! Multiple writes batch into one pulse with [`atomically`]; failures such
//! as conflicting writes or circular rules roll the whole pulse back and
//! surface from [`try_atomically`] as a [`TrellisError`].

mod cell;
mod component;
mod controller;
mod error;
mod event_loop;
mod graph;
mod history;
mod macros;
mod node;
mod observer;
#[cfg(feature = "serde")]
mod serde;
mod task;
pub mod time;
mod traits;
mod value;

pub use cell::{
    constant, create_cell, create_discrete_rule, create_rule_cell, Cell, Constant,
    ReadOnlyCell,
};
pub use component::Component;
pub use controller::{
    atomically, manage, modify, on_commit, on_undo, poll, rollback_to, savepoint,
    try_atomically, untracked,
};
pub use error::{Routes, TrellisError};
pub use event_loop::{Callback, EventLoop, PollingLoop, Reactor, ReactorLoop};
pub use graph::CellId;
pub use history::{Manager, Savepoint};
pub use node::Layer;
pub use observer::{create_action, create_observer, Observer};
pub use task::{create_task, Step, Task, TaskFrame, TaskResume, TaskValue};
pub use time::Timer;
pub use traits::{
    CellGet, CellGetUntracked, CellSet, CellSetUntracked, CellStream, CellUpdate,
    CellWith, CellWithUntracked,
};
pub use value::{create_discrete, create_value, create_value_with_writer, Value};
