#![forbid(unsafe_code)]

use crate::{atomically, controller::with_ctrl, graph::CellId};
use std::ops::Deref;

/// A bundle of cells built together and owned together.
///
/// `Component::build` runs a constructor inside one atomic operation, so a
/// component's rules see a consistent picture of each other from the very
/// first pulse. Every cell, observer, and task created during the
/// constructor is recorded; dropping the component disposes them all.
///
/// The constructor is where per-field cell records live: each field of the
/// returned state is a `create_*` call with that field's rule, initial
/// value, and discreteness.
///
/// ```
/// use trellis_reactive::*;
///
/// struct Thermometer {
///     celsius: Value<f64>,
///     fahrenheit: ReadOnlyCell<f64>,
/// }
///
/// let t = Component::build(|| {
///     let celsius = create_value(20.0);
///     let fahrenheit = create_rule_cell(move |_| celsius.get() * 9.0 / 5.0 + 32.0);
///     Thermometer { celsius, fahrenheit }
/// });
///
/// assert_eq!(t.fahrenheit.get(), 68.0);
/// t.celsius.set(100.0);
/// assert_eq!(t.fahrenheit.get(), 212.0);
/// drop(t); // disposes both cells
/// ```
pub struct Component<T> {
    state: Option<T>,
    owned: Vec<CellId>,
}

impl<T> Component<T> {
    /// Runs `constructor` atomically and takes ownership of every cell it
    /// creates.
    pub fn build(constructor: impl FnOnce() -> T) -> Component<T> {
        with_ctrl(|c| c.begin_capture());
        let state = atomically(constructor);
        let owned = with_ctrl(|c| c.end_capture());
        Component {
            state: Some(state),
            owned,
        }
    }

    /// The component's cell handles.
    pub fn state(&self) -> &T {
        self.state.as_ref().expect("component state present until drop")
    }

    /// Releases the cells from this component's ownership; they live until
    /// disposed individually.
    pub fn leak(mut self) -> T {
        self.owned.clear();
        self.state.take().expect("component state present until drop")
    }
}

impl<T> Deref for Component<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.state()
    }
}

impl<T> Drop for Component<T> {
    fn drop(&mut self) {
        with_ctrl(|c| {
            for id in self.owned.drain(..) {
                c.dispose_node(id);
            }
        });
    }
}
