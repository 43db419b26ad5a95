//! Protected boundaries
//!
//! Errors travel as [`LuaError`] results. The value raised with an error
//! rides alongside in the heap until a boundary claims it: `pcall` and
//! `resume` unwind to their entry and leave the value on the stack, and an
//! error that reaches the host with no Lua frame below is handed to the
//! panic handler.

use tracing::warn;

use super::State;
use crate::error::{LuaError, Result};
use crate::vm::number::format_number;
use crate::vm::value::Value;

impl State {
    /// The value raised with `err`, or its message as a string
    pub(crate) fn error_value(&mut self, err: &LuaError) -> Value {
        let mut heap = self.heap_mut();
        match heap.take_raised(err) {
            Some(value) => value,
            None => heap.string_value(err.to_string().as_bytes()),
        }
    }

    /// Drop the raised value of an error that was handled
    pub(crate) fn clear_raised(&self, err: &LuaError) {
        let _ = self.heap_mut().take_raised(err);
    }

    fn at_top_level(&self) -> bool {
        let heap = self.heap();
        let thread = heap.thread(self.thread);
        thread.frames.is_empty() && thread.protect == 0
    }

    /// Run an operation that may raise
    ///
    /// Inside a running function the error is passed up untouched. At top
    /// level the `consumed` operands are dropped, the error value is pushed
    /// and the panic handler runs before the error is returned.
    pub(crate) fn guard<T>(&mut self, consumed: usize, op: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let top_level = self.at_top_level();
        let entry = self.stack_len();
        match op(self) {
            Err(err) if top_level => {
                self.unprotected(entry.saturating_sub(consumed), &err);
                Err(err)
            }
            other => other,
        }
    }

    fn unprotected(&mut self, len: usize, err: &LuaError) {
        self.with_thread(|t| t.frames.clear());
        let value = self.error_value(err);
        self.truncate(len);
        self.push(value);
        warn!(env = %self.env.id, status = %err.status(), error = %err, "unprotected error");
        let handler = self.env.panic.borrow().clone();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    /// Call the function below the top `nargs` values
    ///
    /// Unprotected: inside a running function an error propagates to the
    /// nearest protected boundary. Called from the host with no function
    /// running, the stack is restored to below the function, the error
    /// value is pushed and the panic handler runs.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<()> {
        let func = self.callee_position(nargs);
        self.guard(nargs + 1, move |state| state.call_at(func, nresults))
    }

    /// Call the function below the top `nargs` values in protected mode
    ///
    /// On failure everything from the function upwards is replaced by the
    /// error value. With `errfunc != 0` the function at that index receives
    /// runtime errors before the stack unwinds and its result becomes the
    /// error value; a handler that fails itself turns the status into
    /// [`LuaError::ErrorHandling`].
    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: i32) -> Result<()> {
        let handler = if errfunc != 0 { Some(self.value(errfunc)) } else { None };
        let func = self.callee_position(nargs);
        let frames = self.frame_count();

        self.with_thread(|t| t.protect += 1);
        let result = self.call_at(func, nresults);
        self.with_thread(|t| t.protect -= 1);

        let mut err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let mut value = self.error_value(&err);
        if let (Some(handler), LuaError::Runtime(_)) = (handler, &err) {
            match self.call_meta(handler, &[value]) {
                Ok(v) => {
                    value = v;
                    err = LuaError::Runtime(self.describe_error(&value));
                }
                Err(_) => {
                    err = LuaError::ErrorHandling;
                    value = self.heap_mut().string_value(err.to_string().as_bytes());
                }
            }
        }

        self.with_thread(|t| t.frames.truncate(frames));
        self.truncate(func);
        self.push(value);
        self.heap_mut().set_raised(value, &err);
        Err(err)
    }

    fn callee_position(&self, nargs: usize) -> usize {
        if (self.get_top() as usize) < nargs + 1 {
            panic!("not enough values on the stack for a call with {} arguments", nargs);
        }
        self.stack_len() - nargs - 1
    }

    /// Message text of an error value
    pub(crate) fn describe_error(&self, value: &Value) -> String {
        match value {
            Value::String(h) => self.heap().string_lossy(*h),
            Value::Number(n) => format_number(*n),
            other => format!("(error object is a {} value)", other.type_name()),
        }
    }

    /// Pop the error value and build the error that raises it
    ///
    /// Host functions fail with `return Err(state.error())`.
    pub fn error(&mut self) -> LuaError {
        let value = self.pop_value();
        let err = LuaError::Runtime(self.describe_error(&value));
        self.heap_mut().set_raised(value, &err);
        err
    }

    /// Raise `msg` prefixed with the position of the calling Lua function
    pub fn raise(&mut self, msg: &str) -> LuaError {
        let text = format!("{}{}", self.location(1), msg);
        self.push_string(&text);
        self.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_pcall_leaves_message() {
        let mut state = State::new();
        crate::stdlib::open_base(&mut state).unwrap();
        state.push_integer(1);
        state.load_string("error('boom', 0)").unwrap();
        let err = state.pcall(0, 0, 0).unwrap_err();
        assert_eq!(err.status(), Status::RuntimeError);
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_string(-1).as_deref(), Some("boom"));
    }

    #[test]
    fn test_error_objects_survive() {
        let mut state = State::new();
        crate::stdlib::open_base(&mut state).unwrap();
        state.load_string("error({code = 7})").unwrap();
        let err = state.pcall(0, 0, 0).unwrap_err();
        assert_eq!(err.to_string(), "(error object is a table value)");
        assert!(state.is_table(-1));
        state.get_field(-1, "code").unwrap();
        assert_eq!(state.to_integer(-1), 7);
    }

    #[test]
    fn test_message_handler_runs_before_unwind() {
        let mut state = State::new();
        crate::stdlib::open_base(&mut state).unwrap();
        state.push_host_function(Rc::new(|s: &mut State| {
            let depth = (0..).take_while(|&l| s.get_stack(l).is_some()).count();
            let msg = s.to_string(1).unwrap_or_default();
            s.push_string(&format!("{} (depth {})", msg, depth));
            Ok(1)
        }));
        state.load_string("local function inner() error('deep', 0) end inner()").unwrap();
        let err = state.pcall(0, 0, 1).unwrap_err();
        // handler, error, inner, main chunk
        assert_eq!(err.to_string(), "deep (depth 4)");
        assert_eq!(state.to_string(-1).as_deref(), Some("deep (depth 4)"));
        assert!(state.get_stack(0).is_none());
    }

    #[test]
    fn test_failing_handler() {
        let mut state = State::new();
        crate::stdlib::open_base(&mut state).unwrap();
        state.push_host_function(Rc::new(|s: &mut State| Err(s.raise("handler broke"))));
        state.load_string("error('x')").unwrap();
        let err = state.pcall(0, 0, 1).unwrap_err();
        assert_eq!(err, LuaError::ErrorHandling);
        assert_eq!(err.status(), Status::ErrorInErrorHandling);
        assert_eq!(state.to_string(-1).as_deref(), Some("error in error handling"));
    }

    #[test]
    fn test_unprotected_call_runs_panic_handler() {
        let mut state = State::new();
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        state.at_panic(Some(Rc::new(move |s: &mut State| {
            assert!(s.is_string(-1));
            seen.set(seen.get() + 1);
        })));
        state.push_integer(10);
        state.push_host_function(Rc::new(|s: &mut State| {
            s.push_string("failed");
            Err(s.error())
        }));
        state.push_integer(1);
        let err = state.call(1, 0).unwrap_err();
        assert_eq!(err.to_string(), "failed");
        assert_eq!(hits.get(), 1);
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_integer(1), 10);
        assert_eq!(state.to_string(2).as_deref(), Some("failed"));
    }
}
