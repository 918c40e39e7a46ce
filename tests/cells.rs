use std::{cell::Cell as StdCell, rc::Rc};
use trellis_reactive::*;

#[test]
fn basic_value() {
    let v = create_value(7);
    assert_eq!(v.get(), 7);
    v.set(9);
    assert_eq!(v.get(), 9);
}

#[test]
fn derived_rule() {
    let a = create_value(0);
    let b = create_value(0);
    let sum = create_rule_cell(move |_| a.get() + b.get());
    assert_eq!(sum.get(), 0);
    a.set(5);
    assert_eq!(sum.get(), 5);
    b.set(1);
    assert_eq!(sum.get(), 6);
}

#[test]
fn nested_rules() {
    let a = create_value(0);
    let b = create_value(0);
    let c = create_rule_cell(move |_| a.get() + b.get());
    let d = create_rule_cell(move |_| c.get() * 2);
    let e = create_rule_cell(move |_| d.get() + 1);
    assert_eq!(d.get(), 0);
    a.set(5);
    assert_eq!(e.get(), 11);
    assert_eq!(d.get(), 10);
    assert_eq!(c.get(), 5);
    b.set(1);
    assert_eq!(e.get(), 13);
    assert_eq!(d.get(), 12);
    assert_eq!(c.get(), 6);
}

#[test]
fn rule_runs_only_when_inputs_change() {
    let runs = Rc::new(StdCell::new(0));
    let a = create_value(0);
    let doubled = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            a.get() * 2
        }
    });

    // lazy: no run until first read
    assert_eq!(runs.get(), 0);

    assert_eq!(doubled.get(), 0);
    assert_eq!(doubled.get(), 0);
    assert_eq!(doubled.get(), 0);
    assert_eq!(runs.get(), 1);

    a.set(1);
    assert_eq!(doubled.get(), 2);
    assert_eq!(runs.get(), 2);
}

// the temperature-conversion pair: two writable rule cells that each derive
// from the other, kept mutually consistent whichever one is written
#[test]
fn fahrenheit_celsius() {
    fn create_cell_pair() -> (Cell<f64>, Cell<f64>) {
        let slot: Rc<StdCell<Option<Cell<f64>>>> = Rc::new(StdCell::new(None));
        let c = create_cell(
            {
                let slot = Rc::clone(&slot);
                move |prev: Option<&f64>| match slot.get() {
                    Some(f) => (f.get() - 32.0) * 5.0 / 9.0,
                    None => prev.copied().unwrap_or(-40.0),
                }
            },
            -40.0,
        );
        let f = create_cell(move |_| c.get() * 9.0 / 5.0 + 32.0, -40.0);
        slot.set(Some(f));
        (c, f)
    }

    let (c, f) = create_cell_pair();
    assert_eq!(c.get(), -40.0);
    assert_eq!(f.get(), -40.0);

    c.set(0.0);
    assert_eq!(f.get(), 32.0);
    assert_eq!(c.get(), 0.0);

    f.set(212.0);
    assert_eq!(c.get(), 100.0);
    assert_eq!(f.get(), 212.0);
}

// dependents run after the cells they read, and the layers prove it
#[test]
fn layered_scheduling() {
    let src = create_value(0);
    let mid = create_rule_cell(move |_| src.get() * 2);
    let out = create_rule_cell(move |_| mid.get() + 1);

    assert_eq!(out.get(), 1);
    src.set(5);
    assert_eq!(mid.get(), 10);
    assert_eq!(out.get(), 11);
    assert!(mid.layer() < out.layer());
}

// writing a cell to its current value schedules nobody
#[test]
fn equal_write_is_noop() {
    let runs = Rc::new(StdCell::new(0));
    let v = create_value(3);
    let watcher = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            v.get()
        }
    });
    assert_eq!(watcher.get(), 3);
    assert_eq!(runs.get(), 1);

    v.set(3);
    assert_eq!(runs.get(), 1);

    v.set(4);
    assert_eq!(runs.get(), 2);
}

// a rule that re-reads the same cell holds a single dependency link, so a
// change still runs it exactly once
#[test]
fn duplicate_reads_run_once() {
    let runs = Rc::new(StdCell::new(0));
    let v = create_value(1);
    let sum = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            v.get() + v.get() + v.get()
        }
    });
    assert_eq!(sum.get(), 3);
    assert_eq!(runs.get(), 1);
    v.set(2);
    assert_eq!(sum.get(), 6);
    assert_eq!(runs.get(), 2);
}

// a rule whose output doesn't change does not wake its listeners
#[test]
fn unchanged_output_stays_quiet() {
    let watcher_runs = Rc::new(StdCell::new(0));
    let src = create_value(1);
    let clamped = create_rule_cell(move |_| src.get().min(10));
    let watcher = create_rule_cell({
        let watcher_runs = Rc::clone(&watcher_runs);
        move |_| {
            watcher_runs.set(watcher_runs.get() + 1);
            clamped.get()
        }
    });

    assert_eq!(watcher.get(), 1);
    assert_eq!(watcher_runs.get(), 1);

    src.set(20);
    assert_eq!(watcher.get(), 10);
    assert_eq!(watcher_runs.get(), 2);

    // clamped recomputes but its output is unchanged
    src.set(30);
    assert_eq!(watcher.get(), 10);
    assert_eq!(watcher_runs.get(), 2);
}

#[test]
fn write_overrides_rule_for_one_pulse() {
    let src = create_value(1);
    let mirror = create_cell(move |_| src.get(), 0);
    assert_eq!(mirror.get(), 1);

    mirror.set(10);
    assert_eq!(mirror.get(), 10);

    // next pulse: the rule is in charge again
    src.set(2);
    assert_eq!(mirror.get(), 2);
}

#[test]
fn untracked_reads_do_not_subscribe() {
    let runs = Rc::new(StdCell::new(0));
    let tracked = create_value(0);
    let ignored = create_value(0);
    let r = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            tracked.get() + untracked(|| ignored.get())
        }
    });
    assert_eq!(r.get(), 0);
    assert_eq!(runs.get(), 1);

    ignored.set(5);
    assert_eq!(runs.get(), 1);

    tracked.set(1);
    assert_eq!(r.get(), 6);
    assert_eq!(runs.get(), 2);
}

#[test]
fn update_in_place() {
    let v = create_value(vec![1, 2]);
    v.update(|v| v.push(3));
    assert_eq!(v.get(), vec![1, 2, 3]);
}

#[test]
fn writer_intercepts_writes() {
    let v = create_value_with_writer(0, |n: i32| n.clamp(0, 100));
    v.set(250);
    assert_eq!(v.get(), 100);
    v.set(-5);
    assert_eq!(v.get(), 0);
}

#[test]
fn constant_reads_have_no_dependencies() {
    let runs = Rc::new(StdCell::new(0));
    let k = constant(5);
    let v = create_value(1);
    let r = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            k.get() + v.get()
        }
    });
    assert_eq!(r.get(), 6);
    v.set(2);
    assert_eq!(r.get(), 7);
    assert_eq!(runs.get(), 2);
}

#[test]
fn batched_writes_are_one_pulse() {
    let runs = Rc::new(StdCell::new(0));
    let a = create_value(0);
    let b = create_value(0);
    let sum = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            a.get() + b.get()
        }
    });
    assert_eq!(sum.get(), 0);
    assert_eq!(runs.get(), 1);

    atomically(|| {
        a.set(1);
        b.set(2);
    });
    assert_eq!(sum.get(), 3);
    assert_eq!(runs.get(), 2);
}

// a polling rule refreshes on every externally-driven pulse
#[test]
fn poll_reruns_each_top_level_pulse() {
    let runs = Rc::new(StdCell::new(0));
    let base = create_value(10);
    let sampled = create_rule_cell({
        let runs = Rc::clone(&runs);
        move |_| {
            runs.set(runs.get() + 1);
            poll();
            base.get()
        }
    });
    assert_eq!(sampled.get(), 10);
    assert_eq!(runs.get(), 1);

    atomically(|| {});
    assert_eq!(runs.get(), 2);
    atomically(|| {});
    assert_eq!(runs.get(), 3);
    assert_eq!(sampled.get(), 10);
}

#[test]
fn dispose_detaches_reads() {
    let v = create_value(1);
    assert_eq!(v.try_get(), Some(1));
    v.dispose();
    assert_eq!(v.try_get(), None);
}
