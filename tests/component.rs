use std::{cell::RefCell, rc::Rc};
use trellis_reactive::*;

struct Thermometer {
    celsius: Value<f64>,
    fahrenheit: ReadOnlyCell<f64>,
}

fn thermometer() -> Component<Thermometer> {
    Component::build(|| {
        let celsius = create_value(20.0);
        let fahrenheit =
            create_rule_cell(move |_| celsius.get() * 9.0 / 5.0 + 32.0);
        Thermometer {
            celsius,
            fahrenheit,
        }
    })
}

#[test]
fn component_cells_work_together() {
    let t = thermometer();
    assert_eq!(t.fahrenheit.get(), 68.0);
    t.celsius.set(100.0);
    assert_eq!(t.fahrenheit.get(), 212.0);
}

#[test]
fn drop_disposes_owned_cells() {
    let t = thermometer();
    let celsius = t.celsius;
    let fahrenheit = t.fahrenheit;
    assert_eq!(fahrenheit.try_get(), Some(68.0));

    drop(t);
    assert_eq!(celsius.try_get(), None);
    assert_eq!(fahrenheit.try_get(), None);
}

#[test]
fn leak_releases_ownership() {
    let t = thermometer();
    let state = t.leak();
    assert_eq!(state.fahrenheit.get(), 68.0);
    state.celsius.set(0.0);
    assert_eq!(state.fahrenheit.get(), 32.0);

    state.fahrenheit.dispose();
    state.celsius.dispose();
}

// observers created inside a component die with it
#[test]
fn component_owns_its_observers() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let input = create_value(0);
    let c = Component::build({
        let log = Rc::clone(&log);
        move || {
            create_observer(move || log.borrow_mut().push(input.get()));
        }
    });
    input.set(1);
    assert_eq!(*log.borrow(), [0, 1]);

    drop(c);
    input.set(2);
    assert_eq!(*log.borrow(), [0, 1]);
}

// construction is atomic: rules initialized inside see each other's
// settled state, and observers fire once at the end
#[test]
fn construction_is_one_pulse() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let _c = Component::build({
        let log = Rc::clone(&log);
        move || {
            let a = create_value(1);
            let b = create_rule_cell(move |_| a.get() * 2);
            let o = create_observer({
                let log = Rc::clone(&log);
                move || log.borrow_mut().push(b.get())
            });
            a.set(5);
            (a, b, o)
        }
    });
    // one consistent picture: the observer never saw the intermediate 2
    assert_eq!(*log.borrow(), [10]);
}