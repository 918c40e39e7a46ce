use std::{cell::RefCell, rc::Rc};
use trellis_reactive::*;

// an event cell is observed with its event value for exactly one pulse,
// then with its reset value again
#[test]
fn discrete_value_resets_after_pulse() {
    let v = create_discrete(false);
    let log = Rc::new(RefCell::new(Vec::new()));
    let _o = create_observer({
        let log = Rc::clone(&log);
        move || log.borrow_mut().push(v.get())
    });
    assert_eq!(*log.borrow(), [false]);

    v.set(true);
    assert_eq!(*log.borrow(), [false, true, false]);
    assert_eq!(v.get(), false);
}

#[test]
fn discrete_reset_to_nondefault() {
    let level = create_discrete(0);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _o = create_observer({
        let seen = Rc::clone(&seen);
        move || seen.borrow_mut().push(level.get())
    });
    level.set(7);
    assert_eq!(*seen.borrow(), [0, 7, 0]);
}

// rules depending on a discrete cell see the event and then the reset,
// once each
#[test]
fn rules_see_event_then_reset() {
    let fired = create_discrete(false);
    let history = Rc::new(RefCell::new(Vec::new()));
    let tracker = create_rule_cell({
        let history = Rc::clone(&history);
        move |_| {
            let now = fired.get();
            history.borrow_mut().push(now);
            now
        }
    });
    assert_eq!(tracker.get(), false);
    fired.set(true);
    assert_eq!(tracker.get(), false);
    assert_eq!(*history.borrow(), [false, true, false]);
}

// a derived event: the rule's output reverts to the reset one pulse later
#[test]
fn discrete_rule_output_resets() {
    let n = create_value(1);
    let spike = create_discrete_rule(move |_| n.get() % 2 == 0, false);
    let log = Rc::new(RefCell::new(Vec::new()));
    let _o = create_observer({
        let log = Rc::clone(&log);
        move || log.borrow_mut().push(spike.get())
    });
    assert_eq!(*log.borrow(), [false]);

    n.set(2);
    // the spike fires for one pulse, then resets
    assert_eq!(*log.borrow(), [false, true, false]);
}

// setting a discrete cell to its reset value is a plain no-op
#[test]
fn discrete_set_to_reset_is_noop() {
    let v = create_discrete(false);
    let log = Rc::new(RefCell::new(Vec::new()));
    let _o = create_observer({
        let log = Rc::clone(&log);
        move || log.borrow_mut().push(v.get())
    });
    v.set(false);
    assert_eq!(*log.borrow(), [false]);
}
