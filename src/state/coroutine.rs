//! Coroutines
//!
//! A coroutine is a thread of the same environment with its own stack and
//! frames. A yield is requested by a host function through
//! [`State::yield_`] and takes effect when that function returns; the host
//! frame stays on the suspended thread and receives the values of the
//! next [`State::resume`] as its results.

use std::rc::Rc;

use tracing::trace;

use super::exec::{Exec, PreCall};
use super::{State, MULTRET};
use crate::error::{LuaError, Result, Status};
use crate::vm::heap::ThreadStatus;
use crate::vm::value::Value;

/// How a successful resume ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    /// The body returned; its results are on the thread's stack
    Finished,

    /// The body yielded; the yielded values are on the thread's stack
    Yielded,
}

impl From<ResumeStatus> for Status {
    fn from(status: ResumeStatus) -> Self {
        match status {
            ResumeStatus::Finished => Status::Ok,
            ResumeStatus::Yielded => Status::Yield,
        }
    }
}

impl State {
    /// Create a coroutine thread sharing this thread's globals
    ///
    /// The thread value is pushed on this stack; the returned handle keeps
    /// the thread alive on its own.
    pub fn new_thread(&mut self) -> State {
        let handle = {
            let mut heap = self.heap_mut();
            let globals = heap.thread(self.thread).globals;
            heap.new_thread(globals)
        };
        self.push(Value::Thread(handle));
        let thread = self.view(handle);
        self.gc_point();
        trace!(env = %self.env.id, thread = ?handle, "thread created");
        thread
    }

    fn set_status(&self, status: ThreadStatus) {
        self.with_thread(|t| t.status = status);
    }

    /// Leave `msg` on this thread's stack and fail the resume with it
    fn reject_resume(&mut self, msg: &str) -> LuaError {
        self.push_string(msg);
        LuaError::runtime(msg)
    }

    /// Start or continue this coroutine
    ///
    /// A fresh thread runs the function below the top `nargs` values. A
    /// suspended thread continues from its last yield, which returns the top
    /// `nargs` values. On error the thread becomes [`ThreadStatus::Errored`],
    /// its frames stay inspectable and the error value is left on its stack.
    pub fn resume(&mut self, nargs: usize) -> Result<ResumeStatus> {
        let status = self.status();
        match status {
            ThreadStatus::Fresh | ThreadStatus::Suspended => {}
            ThreadStatus::Dead | ThreadStatus::Errored => {
                return Err(self.reject_resume("cannot resume dead coroutine"));
            }
            ThreadStatus::Running => {
                return Err(self.reject_resume("cannot resume non-suspended coroutine"));
            }
        }
        let depth = self.env.host_depth.get();
        if depth >= self.env.config.limits.host_call_depth {
            return Err(self.reject_resume("C stack overflow"));
        }
        if (self.get_top() as usize) < nargs {
            panic!("not enough values on the thread for {} resume arguments", nargs);
        }

        self.env.host_depth.set(depth + 1);
        self.set_status(ThreadStatus::Running);
        trace!(env = %self.env.id, thread = ?self.thread, from = ?status, nargs, "resume");

        let outcome = match status {
            ThreadStatus::Fresh => {
                if (self.get_top() as usize) < nargs + 1 {
                    panic!("no function to start the coroutine with");
                }
                let func = self.stack_len() - nargs - 1;
                match self.precall(func, MULTRET) {
                    Ok(PreCall::Lua) => self.execute(0),
                    Ok(PreCall::Host) => Ok(Exec::Finished),
                    Ok(PreCall::Yielded) => Ok(Exec::Yielded),
                    Err(e) => Err(e),
                }
            }
            _ => {
                let first = self.stack_len() - nargs;
                self.poscall(first);
                if self.frame_count() > 0 {
                    self.execute(0)
                } else {
                    Ok(Exec::Finished)
                }
            }
        };
        self.env.host_depth.set(depth);

        match outcome {
            Ok(Exec::Finished) => {
                self.set_status(ThreadStatus::Dead);
                trace!(env = %self.env.id, thread = ?self.thread, results = self.get_top(), "coroutine finished");
                Ok(ResumeStatus::Finished)
            }
            Ok(Exec::Yielded) => {
                self.set_status(ThreadStatus::Suspended);
                trace!(env = %self.env.id, thread = ?self.thread, values = self.get_top(), "coroutine yielded");
                Ok(ResumeStatus::Yielded)
            }
            Err(err) => {
                self.set_status(ThreadStatus::Errored);
                let value = self.error_value(&err);
                self.push(value);
                trace!(env = %self.env.id, thread = ?self.thread, error = %err, "coroutine failed");
                Err(err)
            }
        }
    }

    /// Suspend the running coroutine with the top `nresults` values
    ///
    /// Only valid as the return expression of a host function:
    /// `return state.yield_(n)`.
    pub fn yield_(&mut self, nresults: usize) -> Result<usize> {
        let (main, nny) = {
            let heap = self.heap();
            (heap.main == self.thread, heap.thread(self.thread).nny)
        };
        if main {
            return Err(self.runtime_error("attempt to yield from outside a coroutine"));
        }
        if nny > 0 {
            return Err(self.runtime_error("attempt to yield across metamethod/C-call boundary"));
        }
        self.with_thread(|t| t.yield_request = Some(nresults));
        Ok(nresults)
    }

    /// Move the top `n` values of this thread onto `to`
    ///
    /// Both threads must belong to the same environment.
    pub fn xmove(&mut self, to: &mut State, n: usize) {
        if !Rc::ptr_eq(&self.env, &to.env) {
            panic!("moving values between different environments");
        }
        if self.thread == to.thread || n == 0 {
            return;
        }
        if (self.get_top() as usize) < n {
            panic!("not enough values to move");
        }
        let mut heap = self.heap_mut();
        let from = heap.thread_mut(self.thread);
        let start = from.stack.len() - n;
        let values: Vec<Value> = from.stack.drain(start..).collect();
        heap.thread_mut(to.thread).stack.extend(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yielder() -> super::super::HostFunction {
        Rc::new(|s: &mut State| {
            let n = s.get_top() as usize;
            s.yield_(n)
        })
    }

    #[test]
    fn test_host_body_yields_and_finishes() {
        let mut state = State::new();
        let mut co = state.new_thread();
        co.push_host_function(yielder());
        co.push_integer(1);
        co.push_integer(2);
        assert_eq!(co.resume(2).unwrap(), ResumeStatus::Yielded);
        assert_eq!(co.status(), ThreadStatus::Suspended);
        assert_eq!(co.get_top(), 2);
        co.pop(2);

        co.push_string("back");
        assert_eq!(co.resume(1).unwrap(), ResumeStatus::Finished);
        assert_eq!(co.status(), ThreadStatus::Dead);
        assert_eq!(co.to_string(-1).as_deref(), Some("back"));

        let err = co.resume(0).unwrap_err();
        assert_eq!(err.to_string(), "cannot resume dead coroutine");
        assert_eq!(co.to_string(-1).as_deref(), Some("cannot resume dead coroutine"));
    }

    #[test]
    fn test_yield_from_main_thread_rejected() {
        let mut state = State::new();
        state.push_host_function(yielder());
        let err = state.pcall(0, 0, 0).unwrap_err();
        assert_eq!(err.to_string(), "attempt to yield from outside a coroutine");
    }

    #[test]
    fn test_lua_body_yields_through_frames() {
        let mut state = State::new();
        state.register("pause", yielder()).unwrap();
        let mut co = state.new_thread();
        co.load_string("local a = ... local b = pause(a * 2) return a + b").unwrap();
        co.push_integer(5);
        assert_eq!(co.resume(1).unwrap(), ResumeStatus::Yielded);
        assert_eq!(co.to_integer(-1), 10);
        co.pop(1);
        co.push_integer(100);
        assert_eq!(co.resume(1).unwrap(), ResumeStatus::Finished);
        assert_eq!(co.get_top(), 1);
        assert_eq!(co.to_integer(-1), 105);
    }

    #[test]
    fn test_error_keeps_frames() {
        let mut state = State::new();
        let mut co = state.new_thread();
        co.load_buffer(b"local x = nil\nreturn x.y", "=co").unwrap();
        let err = co.resume(0).unwrap_err();
        assert_eq!(err.to_string(), "co:2: attempt to index local 'x' (a nil value)");
        assert_eq!(co.status(), ThreadStatus::Errored);
        assert!(co.get_stack(0).is_some());
        assert_eq!(co.to_string(-1).as_deref(), Some("co:2: attempt to index local 'x' (a nil value)"));
    }

    #[test]
    fn test_xmove_between_threads() {
        let mut state = State::new();
        let mut co = state.new_thread();
        co.push_integer(1);
        co.push_integer(2);
        co.xmove(&mut state, 2);
        assert_eq!(co.get_top(), 0);
        assert_eq!(state.get_top(), 3);
        assert_eq!(state.to_integer(-1), 2);
    }

    #[test]
    #[should_panic(expected = "different environments")]
    fn test_xmove_across_environments_panics() {
        let mut a = State::new();
        let mut b = State::new();
        a.push_integer(1);
        a.xmove(&mut b, 1);
    }
}
