//! kscript: a small embeddable scripting language.
//!
//! The language is a Lua-flavoured, integer-only dialect designed to be hosted
//! inside privileged code:
//!
//! - **Isolated states**: every [`State`] owns its heap, globals and threads;
//!   nothing is shared between states.
//! - **Pluggable allocation**: every heap object is charged to an
//!   [`Allocator`] supplied by the embedder, which may refuse requests. A
//!   refused request surfaces as [`Error::OutOfMemory`], never as a panic.
//! - **Resumable execution**: script threads run on an explicit frame stack,
//!   so a thread can yield back to the host and be resumed later, from any OS
//!   thread, through [`State::resume`].
//! - **Host objects**: Rust values implement [`UserData`] to be indexed and
//!   called from scripts.
//!
//! # Example
//!
//! ```
//! use kscript_lang::{CountingAllocator, State, Value};
//!
//! let mut state = State::new(Box::new(CountingAllocator::new())).unwrap();
//! let f = state.load("example", "local a, b = ... return a * b").unwrap();
//! let out = state.call(f, &[Value::Integer(6), Value::Integer(7)]).unwrap();
//! assert_eq!(out, vec![Value::Integer(42)]);
//! ```

mod alloc;
mod ast;
mod bytecode;
mod compiler;
mod error;
mod heap;
mod lexer;
mod parser;
mod state;
mod stdlib;
mod userdata;
mod value;

pub use alloc::{AllocError, Allocator, Block, CountingAllocator};
pub use error::{Error, Result};
pub use heap::NativeFn;
pub use state::{PinId, Resumed, State, ThreadStatus, MAX_CALL_DEPTH};
pub use stdlib::{
    arg, bad_argument, check_integer, check_string, check_table, opt_integer, register_all,
    Builtin,
};
pub use userdata::UserData;
pub use value::{GcRef, Value};

/// Checks that `source` compiles, without running it.
pub fn check(chunk: &str, source: &str) -> Result<()> {
    let mut heap = heap::Heap::new(Box::new(CountingAllocator::new()));
    compiler::compile(&mut heap, chunk, source).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<State>();
    }

    #[test]
    fn test_check() {
        assert!(check("ok", "local x = 1 return x").is_ok());
        assert!(matches!(check("bad", "local = 1"), Err(Error::Syntax(_))));
    }
}
