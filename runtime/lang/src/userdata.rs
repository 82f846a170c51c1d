//! Host objects exposed to scripts.

use std::any::Any;

use crate::error::{Error, Result};
use crate::state::State;
use crate::value::Value;

/// A Rust value that scripts can hold, index and pass around.
///
/// Userdata is shared through an `Arc`, so the heap only drops the host
/// value once the last script reference has been collected and every clone
/// handed out by [`State::userdata`] is gone.
pub trait UserData: Any + Send + Sync {
    /// Name used in error messages and by `tostring`.
    fn type_name(&self) -> &'static str;

    /// `value[key]` from a script.
    fn index(&self, state: &mut State, key: Value) -> Result<Value> {
        let _ = (state, key);
        Err(Error::runtime(format!(
            "attempt to index a {} value",
            self.type_name()
        )))
    }

    /// `value[key] = v` from a script.
    fn new_index(&self, state: &mut State, key: Value, value: Value) -> Result<()> {
        let _ = (state, key, value);
        Err(Error::runtime(format!(
            "attempt to index a {} value",
            self.type_name()
        )))
    }

    fn as_any(&self) -> &dyn Any;

    /// Text for `tostring`; defaults to the type name and address.
    fn to_display(&self) -> Option<String> {
        None
    }
}
