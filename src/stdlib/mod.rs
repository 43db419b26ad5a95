//! Standard library
//!
//! The library is written against the public state API only, the same way
//! a host would write its own functions.

pub mod base;
pub mod coroutine;

use std::rc::Rc;

use crate::error::{LuaError, Result};
use crate::state::{HostFunction, State};

/// Register the base functions and the `coroutine` table
pub fn open_base(state: &mut State) -> Result<()> {
    base::init_base_lib(state)?;
    coroutine::init_coroutine_lib(state)
}

/// Open every library
pub fn open_libs(state: &mut State) -> Result<()> {
    open_base(state)
}

type LibFunction = fn(&mut State) -> Result<usize>;

/// Set each function as a field of the table on top of the stack
pub(crate) fn set_functions(state: &mut State, functions: &[(&str, LibFunction)]) -> Result<()> {
    for &(name, f) in functions {
        let f: HostFunction = Rc::new(f);
        state.push_host_function(f);
        state.set_field(-2, name)?;
    }
    Ok(())
}

/// Raise "bad argument #n to 'fname' (msg)" at the caller's position
pub(crate) fn arg_error(state: &mut State, n: i32, fname: &str, msg: &str) -> LuaError {
    state.raise(&format!("bad argument #{} to '{}' ({})", n, fname, msg))
}

pub(crate) fn type_error(state: &mut State, n: i32, fname: &str, expected: &str) -> LuaError {
    let got = state.type_name(n);
    arg_error(state, n, fname, &format!("{} expected, got {}", expected, got))
}

pub(crate) fn check_any(state: &mut State, n: i32, fname: &str) -> Result<()> {
    if state.is_none(n) {
        return Err(arg_error(state, n, fname, "value expected"));
    }
    Ok(())
}

pub(crate) fn check_table(state: &mut State, n: i32, fname: &str) -> Result<()> {
    if !state.is_table(n) {
        return Err(type_error(state, n, fname, "table"));
    }
    Ok(())
}

pub(crate) fn check_number(state: &mut State, n: i32, fname: &str) -> Result<f64> {
    match state.to_number_opt(n) {
        Some(v) => Ok(v),
        None => Err(type_error(state, n, fname, "number")),
    }
}

pub(crate) fn check_integer(state: &mut State, n: i32, fname: &str) -> Result<i64> {
    Ok(check_number(state, n, fname)? as i64)
}

pub(crate) fn opt_integer(state: &mut State, n: i32, fname: &str, default: i64) -> Result<i64> {
    if state.is_none_or_nil(n) {
        return Ok(default);
    }
    check_integer(state, n, fname)
}

pub(crate) fn check_bytes(state: &mut State, n: i32, fname: &str) -> Result<Vec<u8>> {
    match state.to_bytes(n) {
        Some(bytes) => Ok(bytes),
        None => Err(type_error(state, n, fname, "string")),
    }
}

pub(crate) fn opt_string(state: &mut State, n: i32, fname: &str, default: &str) -> Result<String> {
    if state.is_none_or_nil(n) {
        return Ok(default.to_string());
    }
    let bytes = check_bytes(state, n, fname)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Call metamethod `event` of the value at `idx` with that value
///
/// Leaves the single result on the stack and returns true, or returns
/// false with the stack untouched when there is no such metamethod.
pub(crate) fn call_meta_field(state: &mut State, idx: i32, event: &str) -> Result<bool> {
    let idx = state.abs_index(idx);
    if !state.get_metatable(idx) {
        return Ok(false);
    }
    state.push_string(event);
    state.raw_get(-2);
    if state.is_nil(-1) {
        state.pop(2);
        return Ok(false);
    }
    state.remove(-2);
    state.push_value(idx);
    state.call(1, 1)?;
    Ok(true)
}
