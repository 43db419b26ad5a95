//! Coroutine threads driven from the host

use std::rc::Rc;

use luastate::stdlib::open_libs;
use luastate::{ResumeStatus, State, Status, ThreadStatus};

/// Yields its arguments
fn install_yield(state: &mut State) {
    state
        .register(
            "yield_all",
            Rc::new(|s: &mut State| {
                let n = s.get_top() as usize;
                s.yield_(n)
            }),
        )
        .unwrap();
}

#[test]
fn test_yield_k_then_return_m() {
    let mut state = State::new();
    install_yield(&mut state);

    let mut co = state.new_thread();
    co.load_buffer(b"yield_all('a', 'b', 'c')\nreturn 1, 2", "=body").unwrap();
    assert_eq!(co.status(), ThreadStatus::Fresh);

    // k = 3
    assert_eq!(co.resume(0).unwrap(), ResumeStatus::Yielded);
    assert_eq!(co.get_top(), 3);
    assert_eq!(co.to_string(1).as_deref(), Some("a"));
    assert_eq!(co.to_string(3).as_deref(), Some("c"));
    co.set_top(0);

    // m = 2
    let finished = co.resume(0).unwrap();
    assert_eq!(finished, ResumeStatus::Finished);
    assert_eq!(Status::from(finished), Status::Ok);
    assert_eq!(co.get_top(), 2);
    assert_eq!(co.to_integer(1), 1);
    assert_eq!(co.to_integer(2), 2);
    assert_eq!(co.status(), ThreadStatus::Dead);

    let err = co.resume(0).unwrap_err();
    assert_eq!(err.status(), Status::RuntimeError);
    assert_eq!(co.to_string(-1).as_deref(), Some("cannot resume dead coroutine"));
}

#[test]
fn test_resume_values_become_yield_results() {
    let mut state = State::new();
    install_yield(&mut state);
    let mut co = state.new_thread();
    co.load_string("local total = 0 while true do total = total + yield_all(total) end").unwrap();

    assert_eq!(co.resume(0).unwrap(), ResumeStatus::Yielded);
    for (input, expected) in [(5, 5), (10, 15), (1, 16)] {
        co.set_top(0);
        co.push_integer(input);
        assert_eq!(co.resume(1).unwrap(), ResumeStatus::Yielded);
        assert_eq!(co.to_integer(-1), expected);
    }
}

#[test]
fn test_yield_across_host_call_rejected() {
    let mut state = State::new();
    open_libs(&mut state).unwrap();
    install_yield(&mut state);
    state
        .register(
            "nested",
            Rc::new(|s: &mut State| {
                s.get_global("yield_all")?;
                s.push_integer(1);
                s.call(1, 0)?;
                Ok(0)
            }),
        )
        .unwrap();

    let mut co = state.new_thread();
    co.load_buffer(b"nested()", "=nest").unwrap();
    let err = co.resume(0).unwrap_err();
    assert_eq!(err.to_string(), "attempt to yield across metamethod/C-call boundary");
    assert_eq!(co.status(), ThreadStatus::Errored);

    let mut co = state.new_thread();
    co.load_buffer(b"return pcall(yield_all, 1)", "=nest").unwrap();
    assert_eq!(co.resume(0).unwrap(), ResumeStatus::Finished);
    assert!(!co.to_boolean(1));
}

#[test]
fn test_errored_thread_is_inspectable() {
    let mut state = State::new();
    let mut co = state.new_thread();
    co.load_buffer(b"local function inner()\n  local n = nil\n  return n + 1\nend\nreturn inner()", "=insp")
        .unwrap();
    let err = co.resume(0).unwrap_err();
    assert!(err.to_string().starts_with("insp:3: attempt to perform arithmetic"));

    let mut ar = co.get_stack(0).unwrap();
    assert!(co.get_info("Sl", &mut ar));
    assert_eq!(ar.current_line, 3);
    assert_eq!(ar.what, "Lua");
    assert!(co.resume(0).is_err());
}

#[test]
fn test_threads_share_globals() {
    let mut state = State::new();
    let mut co = state.new_thread();
    co.push_integer(42);
    co.set_global("shared").unwrap();
    state.get_global("shared").unwrap();
    assert_eq!(state.to_integer(-1), 42);
    assert!(!co.is_main_thread());
    assert!(state.is_main_thread());
    assert_eq!(co.environment_id(), state.environment_id());
}

#[test]
fn test_thread_survives_while_handle_lives() {
    let mut state = State::new();
    let mut co = state.new_thread();
    // drop the only stack reference
    state.pop(1);
    state.gc(luastate::GcCommand::Collect);
    co.push_integer(7);
    assert_eq!(co.to_integer(-1), 7);
}
