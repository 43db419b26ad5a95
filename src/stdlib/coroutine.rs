//! The `coroutine` table

use std::rc::Rc;

use super::{arg_error, set_functions, type_error};
use crate::error::Result;
use crate::state::{upvalue_index, State};
use crate::vm::heap::ThreadStatus;

/// Register the `coroutine` table
pub fn init_coroutine_lib(state: &mut State) -> Result<()> {
    state.new_table();
    set_functions(
        state,
        &[
            ("create", lua_create),
            ("resume", lua_resume),
            ("running", lua_running),
            ("status", lua_status),
            ("wrap", lua_wrap),
            ("yield", lua_yield),
        ],
    )?;
    state.set_global("coroutine")
}

/// The coroutine at argument `n`
fn check_thread(state: &mut State, n: i32, fname: &str) -> Result<State> {
    match state.to_thread(n) {
        Some(co) => Ok(co),
        None => Err(type_error(state, n, fname, "coroutine")),
    }
}

/// Create a coroutine running the function at index 1 and push it
fn new_coroutine(state: &mut State, fname: &str) -> Result<State> {
    if !state.is_function(1) || state.is_host_function(1) {
        return Err(arg_error(state, 1, fname, "Lua function expected"));
    }
    let mut co = state.new_thread();
    state.push_value(1);
    state.xmove(&mut co, 1);
    Ok(co)
}

/// Resume `co` with the top `nargs` values of `state`
///
/// The results (or the error value) are moved back onto `state`.
fn resume_with(state: &mut State, co: &mut State, nargs: usize) -> Result<usize> {
    state.xmove(co, nargs);
    match co.resume(nargs) {
        Ok(_) => {
            let nres = co.get_top() as usize;
            if !state.check_stack(nres + 1) {
                return Err(state.raise("too many results to resume"));
            }
            co.xmove(state, nres);
            Ok(nres)
        }
        Err(err) => {
            co.clear_raised(&err);
            co.xmove(state, 1);
            Err(err)
        }
    }
}

fn lua_create(state: &mut State) -> Result<usize> {
    new_coroutine(state, "create")?;
    Ok(1)
}

fn lua_resume(state: &mut State) -> Result<usize> {
    let mut co = check_thread(state, 1, "resume")?;
    let nargs = state.get_top() as usize - 1;
    match resume_with(state, &mut co, nargs) {
        Ok(nres) => {
            state.push_boolean(true);
            state.insert(-(nres as i32) - 1);
            Ok(nres + 1)
        }
        Err(_) => {
            state.push_boolean(false);
            state.insert(-2);
            Ok(2)
        }
    }
}

fn lua_yield(state: &mut State) -> Result<usize> {
    let n = state.get_top() as usize;
    state.yield_(n)
}

fn lua_status(state: &mut State) -> Result<usize> {
    let co = check_thread(state, 1, "status")?;
    let status = if co.same_thread(state) {
        "running"
    } else {
        match co.status() {
            ThreadStatus::Fresh | ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "normal",
            ThreadStatus::Dead | ThreadStatus::Errored => "dead",
        }
    };
    state.push_string(status);
    Ok(1)
}

fn lua_running(state: &mut State) -> Result<usize> {
    if state.push_thread() {
        // the main thread is not a coroutine
        state.pop(1);
        state.push_nil();
    }
    Ok(1)
}

fn lua_wrap_step(state: &mut State) -> Result<usize> {
    let mut co = match state.to_thread(upvalue_index(1)) {
        Some(co) => co,
        None => return Err(state.raise("wrapped coroutine is missing")),
    };
    let nargs = state.get_top() as usize;
    match resume_with(state, &mut co, nargs) {
        Ok(nres) => Ok(nres),
        Err(_) => {
            if state.is_string(-1) {
                let position = state.location(1);
                state.push_string(&position);
                state.insert(-2);
                state.concat(2)?;
            }
            Err(state.error())
        }
    }
}

fn lua_wrap(state: &mut State) -> Result<usize> {
    new_coroutine(state, "wrap")?;
    state.push_host_closure(Rc::new(lua_wrap_step), 1);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::open_libs;

    fn run(state: &mut State, source: &str, nresults: i32) {
        state.load_buffer(source.as_bytes(), "=co").unwrap();
        state.call(0, nresults).unwrap();
    }

    #[test]
    fn test_resume_and_yield_values() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        run(
            &mut state,
            "local co = coroutine.create(function(a, b)
                 local c = coroutine.yield(a + b)
                 local d, e = coroutine.yield(c * 2)
                 return d + e
             end)
             local r = {}
             local ok1, v1 = coroutine.resume(co, 1, 2)
             local ok2, v2 = coroutine.resume(co, 10)
             local ok3, v3 = coroutine.resume(co, 3, 4)
             local ok4, v4 = coroutine.resume(co)
             return v1, v2, v3, ok4, v4, coroutine.status(co)",
            6,
        );
        assert_eq!(state.to_integer(1), 3);
        assert_eq!(state.to_integer(2), 20);
        assert_eq!(state.to_integer(3), 7);
        assert!(!state.to_boolean(4));
        assert_eq!(state.to_string(5).as_deref(), Some("cannot resume dead coroutine"));
        assert_eq!(state.to_string(6).as_deref(), Some("dead"));
    }

    #[test]
    fn test_status_from_inside() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        run(
            &mut state,
            "local co
             co = coroutine.create(function()
                 coroutine.yield(coroutine.status(co), coroutine.running() == co)
             end)
             local before = coroutine.status(co)
             local _, inside, same = coroutine.resume(co)
             return before, inside, same, coroutine.status(co), coroutine.running()",
            5,
        );
        assert_eq!(state.to_string(1).as_deref(), Some("suspended"));
        assert_eq!(state.to_string(2).as_deref(), Some("running"));
        assert!(state.to_boolean(3));
        assert_eq!(state.to_string(4).as_deref(), Some("suspended"));
        assert!(state.is_nil(5));
    }

    #[test]
    fn test_error_inside_coroutine() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        run(
            &mut state,
            "local co = coroutine.create(function() error('broken') end)
             local ok, msg = coroutine.resume(co)
             return ok, msg, coroutine.status(co)",
            3,
        );
        assert!(!state.to_boolean(1));
        assert_eq!(state.to_string(2).as_deref(), Some("co:1: broken"));
        assert_eq!(state.to_string(3).as_deref(), Some("dead"));
    }

    #[test]
    fn test_wrap() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        run(
            &mut state,
            "local gen = coroutine.wrap(function()
                 for i = 1, 3 do coroutine.yield(i) end
             end)
             return gen() + gen() + gen()",
            1,
        );
        assert_eq!(state.to_integer(1), 6);
    }

    #[test]
    fn test_wrap_error_gets_position() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        state
            .load_buffer(b"local f = coroutine.wrap(function() error('oops', 0) end)\nf()", "=w")
            .unwrap();
        let err = state.pcall(0, 0, 0).unwrap_err();
        assert_eq!(err.to_string(), "w:2: oops");
    }

    #[test]
    fn test_yield_across_pcall_rejected() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        run(
            &mut state,
            "local co = coroutine.create(function()
                 return pcall(coroutine.yield, 1)
             end)
             return coroutine.resume(co)",
            -1,
        );
        assert!(state.to_boolean(1));
        assert!(!state.to_boolean(2));
        assert_eq!(
            state.to_string(3).as_deref(),
            Some("attempt to yield across metamethod/C-call boundary")
        );
    }

    #[test]
    fn test_create_needs_lua_function() {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        state.load_buffer(b"coroutine.create(print)", "=c").unwrap();
        let err = state.pcall(0, 0, 0).unwrap_err();
        assert_eq!(err.to_string(), "c:1: bad argument #1 to 'create' (Lua function expected)");
    }
}
