//! luastate
//!
//! A Lua 5.1 virtual machine driven through a stack-based embedding API.
//! The host creates a [`State`], exchanges values with scripts through the
//! state's value stack, registers host functions, loads chunks from
//! source or precompiled form, and runs them with protected or
//! unprotected calls and coroutines.
//!
//! ```
//! use luastate::State;
//!
//! let mut state = State::new();
//! luastate::stdlib::open_libs(&mut state).unwrap();
//! state.load_string("return 6 * 7").unwrap();
//! state.call(0, 1).unwrap();
//! assert_eq!(state.to_integer(-1), 42);
//! ```

pub mod compiler;
pub mod config;
pub mod error;
pub mod state;
pub mod stdlib;
pub mod vm;

// Re-export commonly used types
pub use config::{Config, ConfigError, GcConfig, Limits};
pub use error::{LuaError, Result, Status};
pub use state::{
    upvalue_index, ChunkReader, ChunkStream, Debug, GcCommand, HostFunction, Ownership,
    PanicHandler, ResumeStatus, State, ENVIRON_INDEX, GLOBALS_INDEX, MAX_UPVALUES, MULTRET, NOREF,
    REFNIL, REGISTRY_INDEX,
};
pub use vm::heap::ThreadStatus;
pub use vm::value::LuaType;
