#![forbid(unsafe_code)]

use crate::{
    atomically,
    controller::with_ctrl,
    macros::debug_warn,
    observer::{create_observer, Observer},
    time,
    traits::{CellGetUntracked, CellSet},
    value::{create_value, Value},
};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

/// A queued unit of work; each one runs as its own pulse.
pub type Callback = Box<dyn FnOnce()>;

/// The contract every event loop offers the reactive graph: schedule
/// callbacks, drive time, deliver work one atomic pulse at a time.
pub trait EventLoop {
    /// Enqueues `f` to run in the near future, as its own pulse. FIFO with
    /// respect to other queued callbacks.
    fn call(&self, f: Callback);

    /// Runs the loop until [`stop`](EventLoop::stop): alternates between
    /// advancing time, delivering one queued callback, and waking parked
    /// tasks.
    fn run(&self);

    /// Asks the loop to return from [`run`](EventLoop::run).
    fn stop(&self);

    /// Delivers one queued callback, if any. Returns whether one ran.
    fn poll(&self) -> bool;

    /// Delivers up to `limit` queued callbacks (`0` = everything queued
    /// right now). When nothing is queued, runs one empty pulse so parked
    /// tasks and pending resets still make progress.
    fn flush(&self, limit: usize);
}

// ---- polling loop -----------------------------------------------------------

/// An event loop that owns its main loop.
///
/// With [`time::auto_update`] on (the default) the loop follows the wall
/// clock, sleeping until the next scheduled instant. With it off the loop
/// *simulates* time, jumping the clock straight to the next instant, which
/// makes timer-driven programs fully deterministic under test.
///
/// The loop returns from [`run`](EventLoop::run) when stopped, or when
/// nothing is left that could ever wake it (no callbacks, no timers, no
/// parked tasks).
pub struct PollingLoop {
    inner: Rc<PollingInner>,
}

struct PollingInner {
    queue: RefCell<VecDeque<Callback>>,
    running: Value<bool>,
}

impl PollingLoop {
    pub fn new() -> Self {
        PollingLoop {
            inner: Rc::new(PollingInner {
                queue: RefCell::new(VecDeque::new()),
                running: create_value(false),
            }),
        }
    }

    /// Whether the loop is inside [`run`](EventLoop::run). Reactive:
    /// rules and observers that read this re-run when the loop starts or
    /// stops.
    pub fn running(&self) -> Value<bool> {
        self.inner.running
    }
}

impl Default for PollingLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PollingLoop {
    fn clone(&self) -> Self {
        PollingLoop {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl EventLoop for PollingLoop {
    fn call(&self, f: Callback) {
        self.inner.queue.borrow_mut().push_back(f);
    }

    fn run(&self) {
        let running = self.inner.running;
        running.set(true);
        while running.get_untracked() {
            // every iteration is at least one pulse, so parked tasks and
            // discrete resets keep moving
            atomically(|| {});
            if !running.get_untracked() {
                break;
            }
            if self.poll() {
                continue;
            }
            match time::next_event_time(true) {
                Some(delay) => {
                    if time::auto_update() {
                        if delay > 0.0 {
                            std::thread::sleep(Duration::from_secs_f64(delay));
                        }
                        time::tick();
                    } else {
                        time::advance(delay.max(0.0));
                    }
                }
                None => {
                    let parked = with_ctrl(|c| !c.paused.borrow().is_empty());
                    if self.inner.queue.borrow().is_empty() && !parked {
                        debug_warn!(
                            "event loop stopping: no callbacks, timers, or tasks pending"
                        );
                        break;
                    }
                }
            }
        }
        running.set(false);
    }

    fn stop(&self) {
        self.inner.running.set(false);
    }

    fn poll(&self) -> bool {
        let next = self.inner.queue.borrow_mut().pop_front();
        match next {
            Some(f) => {
                atomically(f);
                true
            }
            None => false,
        }
    }

    fn flush(&self, limit: usize) {
        let pending = self.inner.queue.borrow().len();
        let count = if limit == 0 { pending } else { limit.min(pending) };
        let mut delivered = 0;
        for _ in 0..count {
            if !self.poll() {
                break;
            }
            delivered += 1;
        }
        if delivered == 0 {
            atomically(|| {});
        }
    }
}

// ---- reactor integration ----------------------------------------------------

/// An external reactor (async runtime, GUI toolkit main thread) the graph
/// can delegate its scheduling to. GUI toolkits implement `call_soon` with
/// their "run on UI thread" primitive.
pub trait Reactor {
    /// Schedules `f` after `delay` seconds.
    fn call_later(&self, delay: f64, f: Callback);

    /// Schedules `f` as soon as possible.
    fn call_soon(&self, f: Callback);

    /// Runs the reactor until stopped.
    fn run(&self);

    /// Stops the reactor.
    fn stop(&self);
}

/// Adapts an external [`Reactor`] to the [`EventLoop`] contract.
///
/// Queued callbacks ride a single pending reactor callback that delivers
/// one item and re-posts itself while more remain, so FIFO order holds even
/// on reactors that don't guarantee it. A *ticker* observer keeps exactly
/// one pending time wake-up synchronized with [`time::next_event_time`]:
/// whenever the schedule changes, the previous wake-up is superseded.
pub struct ReactorLoop<R: Reactor + 'static> {
    inner: Rc<ReactorInner<R>>,
}

struct ReactorInner<R> {
    reactor: R,
    queue: RefCell<VecDeque<Callback>>,
    drain_pending: Cell<bool>,
    tick_epoch: Cell<u64>,
    ticker: RefCell<Option<Observer>>,
    running: Value<bool>,
}

impl<R: Reactor + 'static> ReactorLoop<R> {
    pub fn new(reactor: R) -> Self {
        ReactorLoop {
            inner: Rc::new(ReactorInner {
                reactor,
                queue: RefCell::new(VecDeque::new()),
                drain_pending: Cell::new(false),
                tick_epoch: Cell::new(0),
                ticker: RefCell::new(None),
                running: create_value(false),
            }),
        }
    }

    /// Whether the loop is inside [`run`](EventLoop::run). Reactive.
    pub fn running(&self) -> Value<bool> {
        self.inner.running
    }

    fn request_drain(&self) {
        if self.inner.drain_pending.replace(true) {
            return;
        }
        let inner = Rc::clone(&self.inner);
        self.inner
            .reactor
            .call_soon(Box::new(move || drain_one(inner)));
    }

    fn ensure_ticker(&self) {
        if self.inner.ticker.borrow().is_some() {
            return;
        }
        let inner = Rc::clone(&self.inner);
        let ticker = create_observer(move || {
            let Some(delay) = time::next_event_time(true) else {
                return;
            };
            let epoch = inner.tick_epoch.get() + 1;
            inner.tick_epoch.set(epoch);
            let wake = Rc::clone(&inner);
            inner.reactor.call_later(
                delay.max(0.0),
                Box::new(move || {
                    // superseded wake-ups fall through silently
                    if wake.tick_epoch.get() == epoch {
                        atomically(time::tick);
                    }
                }),
            );
        });
        *self.inner.ticker.borrow_mut() = Some(ticker);
    }
}

impl<R: Reactor + 'static> Clone for ReactorLoop<R> {
    fn clone(&self) -> Self {
        ReactorLoop {
            inner: Rc::clone(&self.inner),
        }
    }
}

fn drain_one<R: Reactor + 'static>(inner: Rc<ReactorInner<R>>) {
    inner.drain_pending.set(false);
    let next = inner.queue.borrow_mut().pop_front();
    if let Some(f) = next {
        atomically(f);
    }
    let more = !inner.queue.borrow().is_empty();
    if more && !inner.drain_pending.replace(true) {
        let again = Rc::clone(&inner);
        inner
            .reactor
            .call_soon(Box::new(move || drain_one(again)));
    }
}

impl<R: Reactor + 'static> EventLoop for ReactorLoop<R> {
    fn call(&self, f: Callback) {
        self.inner.queue.borrow_mut().push_back(f);
        self.request_drain();
    }

    fn run(&self) {
        self.ensure_ticker();
        self.inner.running.set(true);
        self.inner.reactor.run();
        self.inner.running.set(false);
    }

    fn stop(&self) {
        self.inner.running.set(false);
        self.inner.reactor.stop();
    }

    fn poll(&self) -> bool {
        let next = self.inner.queue.borrow_mut().pop_front();
        match next {
            Some(f) => {
                atomically(f);
                true
            }
            None => false,
        }
    }

    fn flush(&self, limit: usize) {
        let pending = self.inner.queue.borrow().len();
        let count = if limit == 0 { pending } else { limit.min(pending) };
        let mut delivered = 0;
        for _ in 0..count {
            if !self.poll() {
                break;
            }
            delivered += 1;
        }
        if delivered == 0 {
            atomically(|| {});
        }
    }
}
