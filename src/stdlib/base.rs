//! Base library functions
//!
//! The global functions every environment gets from [`open_base`]:
//! printing, type inspection, conversions, raised errors, protected
//! calls, raw table access, metatables, iteration and chunk loading.
//!
//! [`open_base`]: super::open_base

use std::io::Write;
use std::rc::Rc;

use super::{
    arg_error, call_meta_field, check_any, check_bytes, check_integer, check_table, opt_integer,
    opt_string, set_functions, type_error,
};
use crate::error::Result;
use crate::state::{upvalue_index, HostFunction, State, GLOBALS_INDEX, MULTRET};
use crate::vm::number::{format_number, parse_integer_base};
use crate::vm::value::LuaType;

/// Register the base functions as globals
pub fn init_base_lib(state: &mut State) -> Result<()> {
    state.push_value(GLOBALS_INDEX);
    state.push_value(-1);
    state.set_field(-2, "_G")?;
    set_functions(
        state,
        &[
            ("assert", lua_assert),
            ("collectgarbage", lua_collectgarbage),
            ("error", lua_error),
            ("getmetatable", lua_getmetatable),
            ("loadstring", lua_loadstring),
            ("next", lua_next),
            ("pcall", lua_pcall),
            ("print", lua_print),
            ("rawequal", lua_rawequal),
            ("rawget", lua_rawget),
            ("rawset", lua_rawset),
            ("select", lua_select),
            ("setmetatable", lua_setmetatable),
            ("tonumber", lua_tonumber),
            ("tostring", lua_tostring),
            ("type", lua_type),
            ("unpack", lua_unpack),
            ("xpcall", lua_xpcall),
        ],
    )?;

    // pairs and ipairs hand out their iterator from an upvalue
    let next: HostFunction = Rc::new(lua_next);
    state.push_host_function(next);
    state.push_host_closure(Rc::new(lua_pairs), 1);
    state.set_field(-2, "pairs")?;
    state.push_host_function(Rc::new(lua_ipairs_step));
    state.push_host_closure(Rc::new(lua_ipairs), 1);
    state.set_field(-2, "ipairs")?;

    state.push_string("Lua 5.1");
    state.set_field(-2, "_VERSION")?;
    state.pop(1);
    Ok(())
}

fn lua_print(state: &mut State) -> Result<usize> {
    let n = state.get_top();
    state.get_global("tostring")?;
    let mut line = Vec::new();
    for i in 1..=n {
        state.push_value(-1);
        state.push_value(i);
        state.call(1, 1)?;
        let text = match state.to_bytes(-1) {
            Some(bytes) => bytes,
            None => return Err(state.raise("'tostring' must return a string to 'print'")),
        };
        if i > 1 {
            line.push(b'\t');
        }
        line.extend_from_slice(&text);
        state.pop(1);
    }
    line.push(b'\n');
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    // output errors are not reported to scripts
    let _ = out.write_all(&line);
    let _ = out.flush();
    Ok(0)
}

fn lua_type(state: &mut State) -> Result<usize> {
    check_any(state, 1, "type")?;
    let name = state.type_name(1);
    state.push_string(name);
    Ok(1)
}

/// Push the text of the value at `idx` the way `tostring` does
pub(crate) fn push_tostring(state: &mut State, idx: i32) -> Result<()> {
    if call_meta_field(state, idx, "__tostring")? {
        return Ok(());
    }
    match state.type_of(idx) {
        LuaType::Number => {
            let text = format_number(state.to_number(idx));
            state.push_string(&text);
        }
        LuaType::String => state.push_value(idx),
        LuaType::Boolean => {
            let text = if state.to_boolean(idx) { "true" } else { "false" };
            state.push_string(text);
        }
        LuaType::Nil => state.push_string("nil"),
        _ => {
            let text = format!("{}: 0x{:08x}", state.type_name(idx), state.to_pointer(idx));
            state.push_string(&text);
        }
    }
    Ok(())
}

fn lua_tostring(state: &mut State) -> Result<usize> {
    check_any(state, 1, "tostring")?;
    push_tostring(state, 1)?;
    Ok(1)
}

fn lua_tonumber(state: &mut State) -> Result<usize> {
    let base = opt_integer(state, 2, "tonumber", 10)?;
    if base == 10 {
        check_any(state, 1, "tonumber")?;
        match state.to_number_opt(1) {
            Some(n) => state.push_number(n),
            None => state.push_nil(),
        }
        return Ok(1);
    }
    if !(2..=36).contains(&base) {
        return Err(arg_error(state, 2, "tonumber", "base out of range"));
    }
    let bytes = check_bytes(state, 1, "tonumber")?;
    match parse_integer_base(&bytes, base as u32) {
        Some(n) => state.push_number(n),
        None => state.push_nil(),
    }
    Ok(1)
}

fn lua_error(state: &mut State) -> Result<usize> {
    let level = opt_integer(state, 2, "error", 1)?;
    state.set_top(1);
    if state.is_string(1) && level > 0 {
        let position = state.location(level as usize);
        state.push_string(&position);
        state.insert(1);
        state.concat(2)?;
    }
    Err(state.error())
}

fn lua_assert(state: &mut State) -> Result<usize> {
    check_any(state, 1, "assert")?;
    if !state.to_boolean(1) {
        let msg = opt_string(state, 2, "assert", "assertion failed!")?;
        return Err(state.raise(&msg));
    }
    Ok(state.get_top() as usize)
}

/// Finish a protected call made with the callee at index `first`
fn finish_pcall(state: &mut State, result: Result<()>, first: i32) -> usize {
    match result {
        Ok(()) => {
            state.push_boolean(true);
            state.insert(first);
            (state.get_top() - first + 1) as usize
        }
        Err(err) => {
            // the error value is on the stack now
            state.clear_raised(&err);
            state.push_boolean(false);
            state.insert(-2);
            2
        }
    }
}

fn lua_pcall(state: &mut State) -> Result<usize> {
    check_any(state, 1, "pcall")?;
    let nargs = state.get_top() as usize - 1;
    let result = state.pcall(nargs, MULTRET, 0);
    Ok(finish_pcall(state, result, 1))
}

fn lua_xpcall(state: &mut State) -> Result<usize> {
    check_any(state, 2, "xpcall")?;
    state.set_top(2);
    // handler below the function
    state.insert(1);
    let result = state.pcall(0, MULTRET, 1);
    let n = finish_pcall(state, result, 2);
    state.remove(1);
    Ok(n)
}

fn lua_select(state: &mut State) -> Result<usize> {
    let n = state.get_top() as i64;
    if state.type_of(1) == LuaType::String && state.to_bytes(1).as_deref() == Some(&b"#"[..]) {
        state.push_integer(n - 1);
        return Ok(1);
    }
    let mut i = check_integer(state, 1, "select")?;
    if i < 0 {
        i += n;
    } else if i > n {
        i = n;
    }
    if i < 1 {
        return Err(arg_error(state, 1, "select", "index out of range"));
    }
    Ok((n - i) as usize)
}

fn lua_rawget(state: &mut State) -> Result<usize> {
    check_table(state, 1, "rawget")?;
    check_any(state, 2, "rawget")?;
    state.set_top(2);
    state.raw_get(1);
    Ok(1)
}

fn lua_rawset(state: &mut State) -> Result<usize> {
    check_table(state, 1, "rawset")?;
    check_any(state, 2, "rawset")?;
    check_any(state, 3, "rawset")?;
    state.set_top(3);
    state.raw_set(1)?;
    Ok(1)
}

fn lua_rawequal(state: &mut State) -> Result<usize> {
    check_any(state, 1, "rawequal")?;
    check_any(state, 2, "rawequal")?;
    let same = state.raw_equal(1, 2);
    state.push_boolean(same);
    Ok(1)
}

/// Push the `__metatable` field of the value's metatable; false if absent
fn push_protection(state: &mut State, idx: i32) -> bool {
    if !state.get_metatable(idx) {
        return false;
    }
    state.push_string("__metatable");
    state.raw_get(-2);
    state.remove(-2);
    if state.is_nil(-1) {
        state.pop(1);
        return false;
    }
    true
}

fn lua_setmetatable(state: &mut State) -> Result<usize> {
    check_table(state, 1, "setmetatable")?;
    if !matches!(state.type_of(2), LuaType::Nil | LuaType::Table) {
        return Err(type_error(state, 2, "setmetatable", "nil or table"));
    }
    if push_protection(state, 1) {
        return Err(state.raise("cannot change a protected metatable"));
    }
    state.set_top(2);
    state.set_metatable(1);
    Ok(1)
}

fn lua_getmetatable(state: &mut State) -> Result<usize> {
    check_any(state, 1, "getmetatable")?;
    if !state.get_metatable(1) {
        state.push_nil();
        return Ok(1);
    }
    // __metatable, when present, stands in for the metatable
    push_protection(state, 1);
    Ok(1)
}

fn lua_next(state: &mut State) -> Result<usize> {
    check_table(state, 1, "next")?;
    state.set_top(2);
    if state.next(1)? {
        Ok(2)
    } else {
        state.push_nil();
        Ok(1)
    }
}

fn lua_pairs(state: &mut State) -> Result<usize> {
    check_table(state, 1, "pairs")?;
    state.push_value(upvalue_index(1));
    state.push_value(1);
    state.push_nil();
    Ok(3)
}

fn lua_ipairs_step(state: &mut State) -> Result<usize> {
    check_table(state, 1, "ipairs")?;
    let i = check_integer(state, 2, "ipairs")? + 1;
    state.push_integer(i);
    state.raw_geti(1, i);
    if state.is_nil(-1) {
        return Ok(0);
    }
    Ok(2)
}

fn lua_ipairs(state: &mut State) -> Result<usize> {
    check_table(state, 1, "ipairs")?;
    state.push_value(upvalue_index(1));
    state.push_value(1);
    state.push_integer(0);
    Ok(3)
}

fn lua_unpack(state: &mut State) -> Result<usize> {
    check_table(state, 1, "unpack")?;
    let first = opt_integer(state, 2, "unpack", 1)?;
    let last = if state.is_none_or_nil(3) {
        state.obj_len(1) as i64
    } else {
        check_integer(state, 3, "unpack")?
    };
    if first > last {
        return Ok(0);
    }
    let n = (last - first + 1) as usize;
    if n >= i32::MAX as usize || !state.check_stack(n) {
        return Err(state.raise("too many results to unpack"));
    }
    for i in first..=last {
        state.raw_geti(1, i);
    }
    Ok(n)
}

fn lua_loadstring(state: &mut State) -> Result<usize> {
    let source = check_bytes(state, 1, "loadstring")?;
    let default = String::from_utf8_lossy(&source).into_owned();
    let name = opt_string(state, 2, "loadstring", &default)?;
    match state.load_buffer(&source, &name) {
        Ok(()) => Ok(1),
        Err(_) => {
            state.push_nil();
            state.insert(-2);
            Ok(2)
        }
    }
}

fn lua_collectgarbage(state: &mut State) -> Result<usize> {
    use crate::state::GcCommand;

    let option = opt_string(state, 1, "collectgarbage", "collect")?;
    let arg = opt_integer(state, 2, "collectgarbage", 0)? as i32;
    let cmd = match option.as_str() {
        "stop" => GcCommand::Stop,
        "restart" => GcCommand::Restart,
        "collect" => GcCommand::Collect,
        "count" => GcCommand::Count,
        "step" => GcCommand::Step(arg),
        "setpause" => GcCommand::SetPause(arg),
        other => {
            let msg = format!("invalid option '{}'", other);
            return Err(arg_error(state, 1, "collectgarbage", &msg));
        }
    };
    let result = state.gc(cmd);
    match cmd {
        GcCommand::Count => {
            let bytes = state.gc(GcCommand::CountBytes);
            state.push_number(result as f64 + bytes as f64 / 1024.0);
        }
        GcCommand::Step(_) => state.push_boolean(result == 1),
        _ => state.push_integer(result as i64),
    }
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LuaError;
    use crate::stdlib::open_base;

    fn run_err(state: &mut State, source: &str) -> LuaError {
        state.load_buffer(source.as_bytes(), "=t").unwrap();
        let err = state.pcall(0, 0, 0).unwrap_err();
        state.pop(1);
        err
    }

    fn run(state: &mut State, source: &str, nresults: i32) {
        state.load_buffer(source.as_bytes(), "=t").unwrap();
        state.call(0, nresults).unwrap();
    }

    fn base() -> State {
        let mut state = State::new();
        open_base(&mut state).unwrap();
        state
    }

    #[test]
    fn test_type_and_tostring() {
        let mut state = base();
        run(&mut state, "return type(nil), type({}), tostring(12), tostring(true), tostring(1.5)", 5);
        let got: Vec<String> = (1..=5).map(|i| state.to_string(i).unwrap()).collect();
        assert_eq!(got, ["nil", "table", "12", "true", "1.5"]);
    }

    #[test]
    fn test_tostring_metamethod_and_identity() {
        let mut state = base();
        run(
            &mut state,
            "local t = setmetatable({}, {__tostring = function() return 'custom' end})
             return tostring(t), tostring({})",
            2,
        );
        assert_eq!(state.to_string(1).as_deref(), Some("custom"));
        assert!(state.to_string(2).unwrap().starts_with("table: 0x"));
    }

    #[test]
    fn test_tonumber_bases() {
        let mut state = base();
        run(&mut state, "return tonumber('0x10'), tonumber('ff', 16), tonumber('z', 36), tonumber('12', 2), tonumber('  7  ')", 5);
        assert_eq!(state.to_integer(1), 16);
        assert_eq!(state.to_integer(2), 255);
        assert_eq!(state.to_integer(3), 35);
        assert!(state.is_nil(4));
        assert_eq!(state.to_integer(5), 7);
    }

    #[test]
    fn test_error_levels() {
        let mut state = base();
        assert_eq!(run_err(&mut state, "error('plain', 0)").to_string(), "plain");
        assert_eq!(run_err(&mut state, "\nerror('here')").to_string(), "t:2: here");
        assert_eq!(
            run_err(&mut state, "local function f() error('up', 2) end\n\nf()").to_string(),
            "t:3: up"
        );
    }

    #[test]
    fn test_assert() {
        let mut state = base();
        assert_eq!(run_err(&mut state, "assert(false)").to_string(), "t:1: assertion failed!");
        assert_eq!(run_err(&mut state, "assert(nil, 'why')").to_string(), "t:1: why");
        run(&mut state, "return assert(1, 2)", -1);
        assert_eq!(state.get_top(), 2);
    }

    #[test]
    fn test_pcall_results() {
        let mut state = base();
        run(
            &mut state,
            "local ok, a, b = pcall(function(x) return x, x * 2 end, 21)
             local bad, msg = pcall(error, 'nope', 0)
             return ok, a, b, bad, msg",
            5,
        );
        assert!(state.to_boolean(1));
        assert_eq!(state.to_integer(2), 21);
        assert_eq!(state.to_integer(3), 42);
        assert!(!state.to_boolean(4));
        assert_eq!(state.to_string(5).as_deref(), Some("nope"));
    }

    #[test]
    fn test_xpcall_handler() {
        let mut state = base();
        run(
            &mut state,
            "return xpcall(function() error('inner', 0) end, function(m) return 'handled: ' .. m end)",
            -1,
        );
        assert_eq!(state.get_top(), 2);
        assert!(!state.to_boolean(1));
        assert_eq!(state.to_string(2).as_deref(), Some("handled: inner"));
    }

    #[test]
    fn test_select() {
        let mut state = base();
        run(&mut state, "return select('#', 1, nil, 3), select(2, 'a', 'b', 'c'), select(-1, 'x', 'y')", -1);
        // only the last call keeps all of its results
        assert_eq!(state.get_top(), 3);
        assert_eq!(state.to_integer(1), 3);
        assert_eq!(state.to_string(2).as_deref(), Some("b"));
        assert_eq!(state.to_string(3).as_deref(), Some("y"));
        state.set_top(0);
        run(&mut state, "return select(2, 'a', 'b', 'c')", -1);
        assert_eq!(state.get_top(), 2);
        assert_eq!(
            run_err(&mut state, "select(0)").to_string(),
            "t:1: bad argument #1 to 'select' (index out of range)"
        );
    }

    #[test]
    fn test_raw_access_skips_metamethods() {
        let mut state = base();
        run(
            &mut state,
            "local t = setmetatable({}, {__index = function() return 'meta' end, __newindex = function() end})
             rawset(t, 'k', 'raw')
             t.other = 1
             return t.missing, rawget(t, 'missing'), rawget(t, 'k'), rawget(t, 'other'), rawequal(t, t)",
            5,
        );
        assert_eq!(state.to_string(1).as_deref(), Some("meta"));
        assert!(state.is_nil(2));
        assert_eq!(state.to_string(3).as_deref(), Some("raw"));
        assert!(state.is_nil(4));
        assert!(state.to_boolean(5));
    }

    #[test]
    fn test_protected_metatable() {
        let mut state = base();
        run(&mut state, "local t = setmetatable({}, {__metatable = 'locked'}) return getmetatable(t)", 1);
        assert_eq!(state.to_string(-1).as_deref(), Some("locked"));
        assert_eq!(
            run_err(&mut state, "setmetatable(setmetatable({}, {__metatable = 1}), {})").to_string(),
            "t:1: cannot change a protected metatable"
        );
        assert_eq!(
            run_err(&mut state, "setmetatable({}, 5)").to_string(),
            "t:1: bad argument #2 to 'setmetatable' (nil or table expected, got number)"
        );
    }

    #[test]
    fn test_iteration() {
        let mut state = base();
        run(
            &mut state,
            "local sum, keys = 0, 0
             for i, v in ipairs({10, 20, 30, nil, 50}) do sum = sum + i * v end
             for k, v in pairs({a = 1, b = 2, 3}) do keys = keys + v end
             return sum, keys",
            2,
        );
        assert_eq!(state.to_integer(1), 10 + 40 + 90);
        assert_eq!(state.to_integer(2), 6);
    }

    #[test]
    fn test_unpack() {
        let mut state = base();
        run(&mut state, "return unpack({1, 2, 3})", -1);
        assert_eq!(state.get_top(), 3);
        state.set_top(0);
        run(&mut state, "return unpack({1, 2, 3}, 2, 5)", -1);
        assert_eq!(state.get_top(), 4);
        assert_eq!(state.to_integer(1), 2);
        assert!(state.is_nil(4));
    }

    #[test]
    fn test_loadstring() {
        let mut state = base();
        run(
            &mut state,
            "local f = loadstring('return 1 + ...') local g, msg = loadstring('return +', '=bad')
             return f(41), g, msg",
            3,
        );
        assert_eq!(state.to_integer(1), 42);
        assert!(state.is_nil(2));
        assert!(state.to_string(3).unwrap().starts_with("bad:1:"));
    }

    #[test]
    fn test_collectgarbage() {
        let mut state = base();
        run(&mut state, "return collectgarbage('count'), collectgarbage(), collectgarbage('step')", 3);
        assert!(state.to_number(1) > 0.0);
        assert_eq!(state.to_integer(2), 0);
        assert!(state.to_boolean(3));
        assert_eq!(
            run_err(&mut state, "collectgarbage('bogus')").to_string(),
            "t:1: bad argument #1 to 'collectgarbage' (invalid option 'bogus')"
        );
    }

    #[test]
    fn test_globals_table() {
        let mut state = base();
        run(&mut state, "x = 5 return _G.x, _G._G == _G, _VERSION", 3);
        assert_eq!(state.to_integer(1), 5);
        assert!(state.to_boolean(2));
        assert_eq!(state.to_string(3).as_deref(), Some("Lua 5.1"));
    }
}
