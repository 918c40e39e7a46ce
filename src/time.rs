#![forbid(unsafe_code)]

//! A logical clock for the reactive graph.
//!
//! Time is a thread-local service, like the controller itself. Rules ask
//! whether a moment has been [`reached`]; future moments become latched
//! event cells that fire (once) when the clock passes them, so a rule that
//! asked re-runs exactly then. The clock only moves when told to, via
//! [`advance`] for simulated time or [`tick`] to follow the wall clock,
//! and each movement is one pulse.
//!
//! ```
//! use trellis_reactive::*;
//!
//! let deadline = time::after(10.0);
//! let due = create_rule_cell(move |_| deadline.reached());
//! assert_eq!(due.get(), false);
//! time::advance(11.0);
//! assert_eq!(due.get(), true);
//! ```

use crate::{
    cell::{create_rule_cell, ReadOnlyCell},
    controller::with_ctrl,
    traits::{CellGet, CellGetUntracked, CellSet},
    value::{create_value, Value},
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    cell::{Cell, RefCell},
    cmp::Reverse,
    collections::BinaryHeap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// A moment on the service's clock, in seconds.
///
/// Timers order and compare by instant. [`Timer::NOT_YET`] is the moment
/// that never arrives; it is later than every real moment.
#[derive(Copy, Clone)]
pub struct Timer(f64);

impl Timer {
    /// The zero point of simulated time.
    pub const EPOCH: Timer = Timer(0.0);

    /// A moment that never arrives.
    pub const NOT_YET: Timer = Timer(f64::INFINITY);

    /// The timer `seconds` after this one.
    pub fn offset(self, seconds: f64) -> Timer {
        Timer(self.0 + seconds)
    }

    /// Seconds between two timers.
    pub fn elapsed_since(self, earlier: Timer) -> f64 {
        self.0 - earlier.0
    }

    /// The instant in seconds.
    pub fn when(self) -> f64 {
        self.0
    }

    /// Whether the clock has reached this moment. Asking from inside a
    /// rule subscribes the rule to the moment's arrival.
    pub fn reached(self) -> bool {
        reached(self)
    }

    /// Tracks the moment `flag` most recently became true: while `flag`
    /// holds, returns the earliest of `self` and now; once it drops,
    /// returns [`Timer::NOT_YET`]. Feeding a rule's previous output back in
    /// gives "how long has this condition held":
    ///
    /// ```
    /// use trellis_reactive::*;
    ///
    /// let busy = create_value(false);
    /// let idle_since = create_cell(
    ///     move |prev: Option<&Timer>| {
    ///         prev.copied()
    ///             .unwrap_or(Timer::NOT_YET)
    ///             .begins_with(!busy.get())
    ///     },
    ///     Timer::NOT_YET,
    /// );
    /// assert_eq!(idle_since.get(), Timer::EPOCH.offset(time::now()));
    /// ```
    pub fn begins_with(self, flag: bool) -> Timer {
        if flag {
            self.min(after(0.0))
        } else {
            Timer::NOT_YET
        }
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0).is_eq()
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::hash::Hash for Timer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Timer::NOT_YET {
            write!(f, "Timer(NOT_YET)")
        } else {
            write!(f, "Timer({})", self.0)
        }
    }
}

struct TimeState {
    now: Cell<f64>,
    auto_update: Cell<bool>,
    /// Input cell bumped on every clock movement; what rules depend on.
    /// A counter rather than the reading itself, so even a zero-length
    /// movement is a change and re-fires the pump.
    tick: RefCell<Option<Value<u64>>>,
    /// Rule cell that drains due instants and wakes their event cells.
    pump: RefCell<Option<ReadOnlyCell<()>>>,
    /// Min-heap of instants someone is waiting for.
    schedule: RefCell<BinaryHeap<Reverse<Timer>>>,
    /// Pending event cells, keyed by instant bits. Entries leave the map
    /// when they fire; a fired moment is simply in the past afterwards.
    events: RefCell<FxHashMap<u64, ReadOnlyCell<bool>>>,
    /// Instants that fired on the latest clock movement.
    fired: RefCell<FxHashSet<u64>>,
}

thread_local! {
    static TIME: TimeState = TimeState {
        now: Cell::new(0.0),
        auto_update: Cell::new(true),
        tick: RefCell::new(None),
        pump: RefCell::new(None),
        schedule: RefCell::new(BinaryHeap::new()),
        events: RefCell::new(FxHashMap::default()),
        fired: RefCell::new(FxHashSet::default()),
    };
}

/// The current clock reading, in seconds. Not a reactive read; rules that
/// should re-run as time moves use [`reached`] or [`next_event_time`].
pub fn now() -> f64 {
    TIME.with(|ts| ts.now.get())
}

/// The timer `seconds` from now.
pub fn after(seconds: f64) -> Timer {
    Timer(now() + seconds)
}

/// Moves the clock forward by `seconds` of simulated time, firing every
/// timer whose moment is reached, in one pulse.
pub fn advance(seconds: f64) {
    let next = now() + seconds;
    set_now(next);
}

/// Moves the clock to the wall clock's current reading and fires what
/// became due. With [`auto_update`] off the reading is left alone; the
/// call still fires timers that a preceding [`advance`] made due, so
/// reactor wake-ups behave identically under simulated time.
pub fn tick() {
    if auto_update() {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        set_now(wall);
    } else {
        set_now(now());
    }
}

/// Whether event loops should follow the wall clock on their own.
pub fn auto_update() -> bool {
    TIME.with(|ts| ts.auto_update.get())
}

/// Controls [`auto_update`]. Turn it off to drive simulated time with
/// [`advance`].
pub fn set_auto_update(on: bool) {
    TIME.with(|ts| ts.auto_update.set(on));
}

fn set_now(when: f64) {
    TIME.with(|ts| ts.now.set(when));
    let tick = tick_value();
    let next = tick.get_untracked().wrapping_add(1);
    tick.set(next);
}

/// Whether `timer`'s moment has been reached.
///
/// Past moments are plainly true. A future moment allocates (or reuses) a
/// latched event cell: false now, true from the pulse the clock passes the
/// moment, notifying its readers exactly once.
pub fn reached(timer: Timer) -> bool {
    let key = timer.0.to_bits();
    let existing = TIME.with(|ts| ts.events.borrow().get(&key).copied());
    if let Some(cell) = existing {
        return cell.get();
    }
    if TIME.with(|ts| ts.now.get() >= timer.0) {
        return true;
    }
    TIME.with(|ts| ts.schedule.borrow_mut().push(Reverse(timer)));
    let pump = pump_cell();
    let cell = create_rule_cell(move |prev: Option<&bool>| {
        let _ = pump.get();
        prev.copied().unwrap_or(false)
            || TIME.with(|ts| ts.fired.borrow().contains(&key))
    });
    TIME.with(|ts| ts.events.borrow_mut().insert(key, cell));
    cell.get()
}

/// The next scheduled instant, or `None` when nothing is pending. With
/// `relative`, the number of seconds until it. Event loops use this to pick
/// their sleep interval; rules that call it re-run whenever the clock
/// moves.
pub fn next_event_time(relative: bool) -> Option<f64> {
    let active = with_ctrl(|c| c.history.active.get());
    if active {
        // reactive read, so callers recalculate as time advances
        let _ = tick_value().get();
    }
    let reference = now();
    TIME.with(|ts| {
        let schedule = ts.schedule.borrow();
        match schedule.peek() {
            Some(Reverse(next)) if next.0.is_finite() => {
                if relative {
                    Some(next.0 - reference)
                } else {
                    Some(next.0)
                }
            }
            _ => None,
        }
    })
}

fn tick_value() -> Value<u64> {
    TIME.with(|ts| {
        let mut tick = ts.tick.borrow_mut();
        *tick.get_or_insert_with(|| create_value(0))
    })
}

fn pump_cell() -> ReadOnlyCell<()> {
    let existing = TIME.with(|ts| *ts.pump.borrow());
    if let Some(pump) = existing {
        return pump;
    }
    let tick = tick_value();
    let pump = create_rule_cell(move |_| {
        let _ = tick.get();
        let current = now();
        let due = TIME.with(|ts| {
            ts.fired.borrow_mut().clear();
            let mut schedule = ts.schedule.borrow_mut();
            let mut due = Vec::new();
            while let Some(Reverse(next)) = schedule.peek().copied() {
                if next.0 > current {
                    break;
                }
                schedule.pop();
                let key = next.0.to_bits();
                if let Some(cell) = ts.events.borrow_mut().remove(&key) {
                    ts.fired.borrow_mut().insert(key);
                    due.push(cell);
                }
            }
            due
        });
        // wake exactly the cells whose moment arrived; the pump's own
        // output never changes, so nothing else recalculates
        for cell in due {
            with_ctrl(|c| c.schedule(cell.id, None));
        }
    });
    TIME.with(|ts| *ts.pump.borrow_mut() = Some(pump));
    pump
}
