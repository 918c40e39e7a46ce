use crate::{
    cell::{Cell, Constant, ReadOnlyCell},
    traits::CellWithUntracked,
    value::Value,
};
use serde::{Serialize, Serializer};

// Cells serialize as a snapshot of their current value, read without
// creating dependencies. An unresolvable handle (disposed, foreign thread,
// or a rule cell that has never run) serializes as `None`.

macro_rules! impl_serialize {
    ($($ty:ident),*) => {
        $(
            impl<T> Serialize for $ty<T>
            where
                T: Serialize + 'static,
            {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: Serializer,
                {
                    let mut serializer = Some(serializer);
                    let result = self.try_with_untracked(|v| {
                        v.serialize(serializer.take().expect("serializer consumed once"))
                    });
                    match result {
                        Some(result) => result,
                        None => serializer_none(
                            serializer.take().expect("serializer consumed once"),
                        ),
                    }
                }
            }
        )*
    };
}

fn serializer_none<S: Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_none()
}

impl_serialize![Value, ReadOnlyCell, Cell, Constant];
