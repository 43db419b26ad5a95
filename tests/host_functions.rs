//! Host functions, protected calls and debug information

use std::cell::RefCell;
use std::rc::Rc;

use luastate::stdlib::open_libs;
use luastate::{upvalue_index, Debug, LuaError, State, Status, REGISTRY_INDEX};

fn run(state: &mut State, source: &str, nresults: i32) {
    state.load_buffer(source.as_bytes(), "=test").unwrap();
    state.call(0, nresults).unwrap();
}

#[test]
fn test_upvalues_persist_across_call_sites() {
    let mut state = State::new();
    open_libs(&mut state).unwrap();

    // upvalue 1 counts calls, upvalue 2 is never touched
    state.push_integer(0);
    state.push_string("tag");
    state.push_host_closure(
        Rc::new(|s: &mut State| {
            let calls = s.to_integer(upvalue_index(1)) + 1;
            s.push_integer(calls);
            s.replace(upvalue_index(1));
            s.push_integer(calls);
            s.push_value(upvalue_index(2));
            Ok(2)
        }),
        2,
    );
    state.set_global("tick").unwrap();

    run(
        &mut state,
        "local a, ta = tick()
         local function elsewhere() return tick() end
         local b, tb = elsewhere()
         return a, b, ta, tb",
        4,
    );
    assert_eq!(state.to_integer(1), 1);
    assert_eq!(state.to_integer(2), 2);
    assert_eq!(state.to_string(3).as_deref(), Some("tag"));
    assert_eq!(state.to_string(4).as_deref(), Some("tag"));

    // and from the host
    state.get_global("tick").unwrap();
    state.call(0, 1).unwrap();
    assert_eq!(state.to_integer(-1), 3);
}

#[test]
fn test_host_errors_carry_position() {
    let mut state = State::new();
    state
        .register(
            "fail",
            Rc::new(|s: &mut State| Err(s.raise("refused"))),
        )
        .unwrap();
    state.load_buffer(b"local x = 1\nfail()", "=caller").unwrap();
    let err = state.pcall(0, 0, 0).unwrap_err();
    assert_eq!(err, LuaError::Runtime("caller:2: refused".into()));
}

#[test]
fn test_pcall_message_handler_sees_traceback_level() {
    let mut state = State::new();
    open_libs(&mut state).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let record = seen.clone();
    state.push_host_function(Rc::new(move |s: &mut State| {
        let mut level = 0;
        while let Some(mut ar) = s.get_stack(level) {
            if s.get_info("Sl", &mut ar) {
                record.borrow_mut().push((ar.what.clone(), ar.current_line));
            }
            level += 1;
        }
        s.push_string("handled");
        Ok(1)
    }));
    state
        .load_buffer(b"local function f()\n  local t = nil\n  return t.x\nend\nf()", "=trace")
        .unwrap();
    let err = state.pcall(0, 0, 1).unwrap_err();
    assert_eq!(err.to_string(), "handled");
    assert_eq!(err.status(), Status::RuntimeError);

    let seen = seen.borrow();
    // the handler itself, then f at line 3, then the main chunk at line 5
    assert_eq!(seen[0].0, "C");
    assert_eq!(seen[1], ("Lua".to_string(), 3));
    assert_eq!(seen[2], ("main".to_string(), 5));
}

#[test]
fn test_debug_info_for_functions() {
    let mut state = State::new();
    state
        .load_buffer(b"local x = 1\n\nlocal function g(a, b)\n  return a\nend\nreturn g", "=dbg")
        .unwrap();
    state.call(0, 1).unwrap();

    let mut ar = Debug::default();
    state.push_value(-1);
    assert!(state.get_info(">Su", &mut ar));
    assert_eq!(ar.what, "Lua");
    assert_eq!(ar.short_src, "dbg");
    assert_eq!(ar.line_defined, 3);
    assert_eq!(ar.last_line_defined, 5);
    assert_eq!(ar.nups, 0);
    // '>' consumed the pushed copy
    assert_eq!(state.get_top(), 1);
    assert!(!state.get_info("?", &mut ar));
}

#[test]
fn test_registry_references_keep_values() {
    let mut state = State::new();
    let mut refs = Vec::new();
    for i in 0..5 {
        state.new_table();
        state.push_integer(i);
        state.set_field(-2, "n").unwrap();
        refs.push(state.reference(REGISTRY_INDEX));
    }
    state.gc(luastate::GcCommand::Collect);
    for (i, r) in refs.iter().enumerate() {
        state.raw_geti(REGISTRY_INDEX, *r as i64);
        state.get_field(-1, "n").unwrap();
        assert_eq!(state.to_integer(-1), i as i64);
        state.pop(2);
    }
    state.unreference(REGISTRY_INDEX, refs[2]);
    state.push_boolean(true);
    assert_eq!(state.reference(REGISTRY_INDEX), refs[2]);
}

#[test]
fn test_arithmetic_and_call_metamethods() {
    let mut state = State::new();
    open_libs(&mut state).unwrap();
    run(
        &mut state,
        "local V = {}
         V.__index = V
         V.__add = function(a, b) return setmetatable({x = a.x + b.x}, V) end
         V.__unm = function(a) return setmetatable({x = -a.x}, V) end
         V.__eq = function(a, b) return a.x == b.x end
         V.__lt = function(a, b) return a.x < b.x end
         V.__le = function(a, b) return a.x <= b.x end
         V.__concat = function(a, b) return 'V' .. tostring(b.x) end
         V.__call = function(self, k) return self.x * k end
         V.__len = function(a) return 99 end
         local function new(x) return setmetatable({x = x}, V) end
         local a, b = new(2), new(5)
         local c = a + b
         return c.x, (-a).x, a == new(2), a < b, b <= a, a .. b, c(10), #a",
        8,
    );
    assert_eq!(state.to_integer(1), 7);
    assert_eq!(state.to_integer(2), -2);
    assert!(state.to_boolean(3));
    assert!(state.to_boolean(4));
    assert!(!state.to_boolean(5));
    assert_eq!(state.to_string(6).as_deref(), Some("V5"));
    assert_eq!(state.to_integer(7), 70);
    // tables keep their raw length even with __len set
    assert_eq!(state.to_integer(8), 0);
}

#[test]
fn test_len_metamethod_on_userdata() {
    let mut state = State::new();
    state.new_userdata(vec![1u8, 2, 3]);
    state.new_table();
    state.push_host_function(Rc::new(|s: &mut State| {
        let n = s.with_userdata(1, |v: &mut Vec<u8>| v.len()).unwrap_or(0);
        s.push_integer(n as i64 * 10);
        Ok(1)
    }));
    state.set_field(-2, "__len").unwrap();
    state.set_metatable(1);
    state.set_global("bytes").unwrap();

    run(&mut state, "return #bytes", 1);
    assert_eq!(state.to_integer(-1), 30);
}

#[test]
fn test_runaway_tostring_recursion_is_bounded() {
    // default-size thread stack
    let outcome = std::thread::spawn(|| {
        let mut state = State::new();
        open_libs(&mut state).unwrap();
        state
            .load_buffer(
                b"local t = setmetatable({}, {__tostring = function(t) return tostring(t) end})\n\
                  return tostring(t)",
                "=loop",
            )
            .unwrap();
        let err = state.pcall(0, 1, 0).unwrap_err();
        (err.status(), err.to_string())
    })
    .join()
    .unwrap();
    assert_eq!(outcome.0, Status::RuntimeError);
    assert!(outcome.1.ends_with("C stack overflow"), "{}", outcome.1);
}

#[test]
fn test_closures_share_captured_locals() {
    let mut state = State::new();
    run(
        &mut state,
        "local function make()
             local n = 0
             local function inc() n = n + 1 return n end
             local function get() return n end
             return inc, get
         end
         local inc, get = make()
         local inc2, get2 = make()
         inc() inc() inc2()
         return get(), get2()",
        2,
    );
    assert_eq!(state.to_integer(1), 2);
    assert_eq!(state.to_integer(2), 1);
}

#[test]
fn test_memory_limit_reported_by_pcall() {
    let mut state = State::with_config(luastate::Config::with_memory_limit(128 * 1024)).unwrap();
    open_libs(&mut state).unwrap();
    state
        .load_buffer(b"local s = 'x' for i = 1, 40 do s = s .. s end return s", "=grow")
        .unwrap();
    let err = state.pcall(0, 1, 0).unwrap_err();
    assert_eq!(err, LuaError::Memory);
    assert_eq!(err.status(), Status::OutOfMemory);
    assert_eq!(state.to_string(-1).as_deref(), Some("not enough memory"));

    // the state stays usable once the garbage is gone
    state.pop(1);
    state.gc(luastate::GcCommand::Collect);
    run(&mut state, "return 1 + 1", 1);
    assert_eq!(state.to_integer(-1), 2);
}

#[test]
fn test_userdata_round_trip() {
    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    let mut state = State::new();
    state.new_userdata(Point { x: 1, y: 2 });
    state.register(
        "shift",
        Rc::new(|s: &mut State| {
            let dx = s.to_integer(2) as i32;
            let moved = s.with_userdata(1, |p: &mut Point| {
                p.x += dx;
                p.x
            });
            match moved {
                Some(x) => {
                    s.push_integer(x as i64);
                    Ok(1)
                }
                None => Err(s.raise("point expected")),
            }
        }),
    )
    .unwrap();
    state.get_global("shift").unwrap();
    state.push_value(1);
    state.push_integer(10);
    state.call(2, 1).unwrap();
    assert_eq!(state.to_integer(-1), 11);
    assert_eq!(state.with_userdata(1, |p: &mut Point| p.y), Some(2));
    assert_eq!(state.with_userdata(1, |s: &mut String| s.len()), None);
}
