//! Metamethod dispatch
//!
//! Indexing, arithmetic, concatenation, comparison and length with the
//! fallbacks of Lua 5.1. Handlers are called through [`State::call_at`], so
//! a yield inside a metamethod is rejected.

use super::State;
use crate::error::{LuaError, Result};
use crate::vm::heap::Event;
use crate::vm::number::lua_mod;
use crate::vm::value::Value;

/// Longest chain of `__index`/`__newindex` tables followed
const MAX_META_LOOP: usize = 100;

fn apply(event: Event, a: f64, b: f64) -> f64 {
    match event {
        Event::Add => a + b,
        Event::Sub => a - b,
        Event::Mul => a * b,
        Event::Div => a / b,
        Event::Mod => lua_mod(a, b),
        Event::Pow => a.powf(b),
        Event::Unm => -a,
        _ => f64::NAN,
    }
}

impl State {
    /// Runtime error positioned at the running Lua function, if any
    pub(crate) fn runtime_error(&self, msg: impl Into<String>) -> LuaError {
        LuaError::Runtime(format!("{}{}", self.location(0), msg.into()))
    }

    /// "attempt to <op> a <type> value", naming the operand when known
    pub(crate) fn type_error(&self, value: &Value, op: &str) -> LuaError {
        let named = match op {
            "index" | "call" => self.operand_name(),
            _ => None,
        };
        match named {
            Some(name) => self.runtime_error(format!(
                "attempt to {} {} (a {} value)",
                op,
                name,
                value.type_name()
            )),
            None => self.runtime_error(format!("attempt to {} a {} value", op, value.type_name())),
        }
    }

    fn metamethod(&self, value: &Value, event: Event) -> Value {
        self.heap().metamethod(value, event)
    }

    /// Call a handler with `args` and return its first result
    pub(crate) fn call_meta(&mut self, handler: Value, args: &[Value]) -> Result<Value> {
        let func = self.stack_len();
        self.push(handler);
        for &arg in args {
            self.push(arg);
        }
        self.call_at(func, 1)?;
        Ok(self.pop_value())
    }

    /// `object[key]` with `__index`
    pub(crate) fn index_value(&mut self, object: Value, key: Value) -> Result<Value> {
        let mut current = object;
        for _ in 0..MAX_META_LOOP {
            let handler = match current {
                Value::Table(t) => {
                    let raw = self.heap().table(t).get(&key);
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                    let handler = self.metamethod(&current, Event::Index);
                    if handler.is_nil() {
                        return Ok(Value::Nil);
                    }
                    handler
                }
                _ => {
                    let handler = self.metamethod(&current, Event::Index);
                    if handler.is_nil() {
                        return Err(self.type_error(&current, "index"));
                    }
                    handler
                }
            };
            if let Value::Function(_) = handler {
                return self.call_meta(handler, &[current, key]);
            }
            current = handler;
        }
        Err(self.runtime_error("loop in gettable"))
    }

    /// `object[key] = value` with `__newindex`
    pub(crate) fn set_index_value(&mut self, object: Value, key: Value, value: Value) -> Result<()> {
        let mut current = object;
        for _ in 0..MAX_META_LOOP {
            let handler = match current {
                Value::Table(t) => {
                    let existing = self.heap().table(t).get(&key);
                    let handler = if existing.is_nil() {
                        self.metamethod(&current, Event::NewIndex)
                    } else {
                        Value::Nil
                    };
                    if handler.is_nil() {
                        let stored = self.heap_mut().table_set(t, key, value);
                        return stored.map_err(|e| self.runtime_error(e.to_string()));
                    }
                    handler
                }
                _ => {
                    let handler = self.metamethod(&current, Event::NewIndex);
                    if handler.is_nil() {
                        return Err(self.type_error(&current, "index"));
                    }
                    handler
                }
            };
            if let Value::Function(_) = handler {
                self.call_meta(handler, &[current, key, value])?;
                return Ok(());
            }
            current = handler;
        }
        Err(self.runtime_error("loop in settable"))
    }

    /// Arithmetic with string coercion and the arithmetic metamethods
    pub(crate) fn arith(&mut self, event: Event, a: Value, b: Value) -> Result<Value> {
        if let (Some(x), Some(y)) = (self.coerce_number(&a), self.coerce_number(&b)) {
            return Ok(Value::Number(apply(event, x, y)));
        }
        let mut handler = self.metamethod(&a, event);
        if handler.is_nil() {
            handler = self.metamethod(&b, event);
        }
        if handler.is_nil() {
            let culprit = if self.coerce_number(&a).is_none() { a } else { b };
            return Err(self.type_error(&culprit, "perform arithmetic on"));
        }
        self.call_meta(handler, &[a, b])
    }

    /// Replace the top `n` values with their concatenation
    pub(crate) fn concat_top(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            let empty = self.heap_mut().string_value(b"");
            self.push(empty);
            return Ok(());
        }
        let mut remaining = n;
        while remaining > 1 {
            let len = self.stack_len();
            let a = self.stack_get(len - 2);
            let b = self.stack_get(len - 1);
            let joinable = self.coerce_bytes(&a).is_some() && self.coerce_bytes(&b).is_some();
            if !joinable {
                let mut handler = self.metamethod(&a, Event::Concat);
                if handler.is_nil() {
                    handler = self.metamethod(&b, Event::Concat);
                }
                if handler.is_nil() {
                    let culprit = if self.coerce_bytes(&a).is_some() { b } else { a };
                    return Err(self.type_error(&culprit, "concatenate"));
                }
                let result = self.call_meta(handler, &[a, b])?;
                self.truncate(len - 2);
                self.push(result);
                remaining -= 1;
                continue;
            }

            // join the longest run of strings and numbers ending at the top
            let mut count = 2;
            while count < remaining && self.coerce_bytes(&self.stack_get(len - count - 1)).is_some() {
                count += 1;
            }
            let mut joined = Vec::new();
            for pos in len - count..len {
                if let Some(bytes) = self.coerce_bytes(&self.stack_get(pos)) {
                    joined.extend_from_slice(&bytes);
                }
            }
            let value = self.heap_mut().string_value(&joined);
            self.truncate(len - count);
            self.push(value);
            remaining -= count - 1;
        }
        Ok(())
    }

    /// Equality with `__eq` for two tables or two userdata
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !comparable {
            return Ok(false);
        }
        let handler = self.metamethod(&a, Event::Eq);
        if handler.is_nil() || handler != self.metamethod(&b, Event::Eq) {
            return Ok(false);
        }
        Ok(self.call_meta(handler, &[a, b])?.truthy())
    }

    fn compare_bytes(&self, a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
        match (a, b) {
            (Value::String(x), Value::String(y)) => {
                let heap = self.heap();
                Some(heap.string_bytes(*x).cmp(heap.string_bytes(*y)))
            }
            _ => None,
        }
    }

    /// Shared handler of `event` for both operands
    fn order_handler(&self, a: &Value, b: &Value, event: Event) -> Option<Value> {
        if a.type_of() != b.type_of() {
            return None;
        }
        let handler = self.metamethod(a, event);
        if handler.is_nil() || handler != self.metamethod(b, event) {
            return None;
        }
        Some(handler)
    }

    fn order_error(&self, a: &Value, b: &Value) -> LuaError {
        let (ta, tb) = (a.type_name(), b.type_name());
        if ta == tb {
            self.runtime_error(format!("attempt to compare two {} values", ta))
        } else {
            self.runtime_error(format!("attempt to compare {} with {}", ta, tb))
        }
    }

    /// `a < b` with `__lt`
    pub(crate) fn values_less(&mut self, a: Value, b: Value) -> Result<bool> {
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return Ok(x < y);
        }
        if let Some(ord) = self.compare_bytes(&a, &b) {
            return Ok(ord.is_lt());
        }
        match self.order_handler(&a, &b, Event::Lt) {
            Some(handler) => Ok(self.call_meta(handler, &[a, b])?.truthy()),
            None => Err(self.order_error(&a, &b)),
        }
    }

    /// `a <= b` with `__le`, falling back to `not (b < a)` through `__lt`
    pub(crate) fn values_less_equal(&mut self, a: Value, b: Value) -> Result<bool> {
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return Ok(x <= y);
        }
        if let Some(ord) = self.compare_bytes(&a, &b) {
            return Ok(ord.is_le());
        }
        if let Some(handler) = self.order_handler(&a, &b, Event::Le) {
            return Ok(self.call_meta(handler, &[a, b])?.truthy());
        }
        match self.order_handler(&a, &b, Event::Lt) {
            Some(handler) => Ok(!self.call_meta(handler, &[b, a])?.truthy()),
            None => Err(self.order_error(&a, &b)),
        }
    }

    /// The length operator; `__len` applies to values other than strings and tables
    pub(crate) fn length_of(&mut self, value: Value) -> Result<Value> {
        match value {
            Value::String(h) => Ok(Value::Number(self.heap().string_bytes(h).len() as f64)),
            Value::Table(t) => Ok(Value::Number(self.heap().table(t).len() as f64)),
            other => {
                let handler = self.metamethod(&other, Event::Len);
                if handler.is_nil() {
                    return Err(self.type_error(&other, "get length of"));
                }
                self.call_meta(handler, &[other, Value::Nil])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_counts() {
        let mut state = State::new();
        state.concat(0).unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some(""));

        state.push_integer(7);
        state.concat(1).unwrap();
        assert_eq!(state.type_name(-1), "number");

        state.push_string("a");
        state.push_integer(1);
        state.push_string("c");
        state.concat(3).unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some("a1c"));
        assert_eq!(state.get_top(), 3);
    }

    #[test]
    fn test_concat_type_error() {
        let mut state = State::new();
        state.push_string("a");
        state.new_table();
        let err = state.concat(2).unwrap_err();
        assert_eq!(err.to_string(), "attempt to concatenate a table value");
    }

    #[test]
    fn test_compare_errors() {
        let mut state = State::new();
        state.new_table();
        state.push_integer(1);
        let err = state.less_than(1, 2).unwrap_err();
        assert_eq!(err.to_string(), "attempt to compare table with number");

        // the error message was left on top
        assert_eq!(state.get_top(), 3);

        state.push_string("a");
        state.push_string("b");
        assert!(state.less_than(-2, -1).unwrap());
        assert!(!state.less_than(-1, -2).unwrap());
        assert!(!state.less_than(-1, 99).unwrap());
    }

    #[test]
    fn test_index_non_table() {
        let mut state = State::new();
        state.push_integer(3);
        let err = state.get_field(1, "x").unwrap_err();
        assert_eq!(err.to_string(), "attempt to index a number value");
    }

    #[test]
    fn test_index_chain_through_tables() {
        let mut state = State::new();
        // base = { greeting = "hi" }
        state.new_table();
        state.push_string("hi");
        state.set_field(1, "greeting").unwrap();
        // obj with metatable { __index = base }
        state.new_table();
        state.new_table();
        state.push_value(1);
        state.set_field(3, "__index").unwrap();
        state.set_metatable(2);

        state.get_field(2, "greeting").unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some("hi"));
        state.pop(1);

        state.push_string("greeting");
        state.raw_get(2);
        assert!(state.is_nil(-1));
    }
}
