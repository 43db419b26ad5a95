//! Stack value protocol
//!
//! Every value crosses the host boundary through the stack of a [`State`].
//! Type tests and conversions never fail. Structural operations panic when
//! handed an index that does not name a value, and operations that may run
//! metamethods report failures as [`LuaError`](crate::error::LuaError).

use std::any::Any;
use std::fmt;

use super::index::Slot;
use super::{State, GLOBALS_INDEX};
use crate::error::Result;
use crate::vm::number::{format_number, parse_number, to_integer};
use crate::vm::value::{LuaType, TableHandle, Value};

impl State {
    // ---- basic stack manipulation ----

    /// Number of values in the current frame
    pub fn get_top(&self) -> i32 {
        let heap = self.heap();
        let thread = heap.thread(self.thread);
        (thread.stack.len() - thread.base()) as i32
    }

    /// Set the top of the current frame, filling new slots with nil
    ///
    /// A negative index counts from the current top, so `set_top(-1)`
    /// leaves the stack unchanged.
    pub fn set_top(&mut self, idx: i32) {
        let base = self.base();
        let len = self.stack_len();
        let new_len = if idx >= 0 {
            base + idx as usize
        } else {
            let back = (-(idx + 1)) as usize;
            if back > len - base {
                panic!("invalid new top {}", idx);
            }
            len - back
        };
        self.with_thread(|t| t.stack.resize(new_len, Value::Nil));
    }

    /// Pop `n` values
    pub fn pop(&mut self, n: i32) {
        self.set_top(-n - 1);
    }

    /// Push a copy of the value at `idx`
    pub fn push_value(&mut self, idx: i32) {
        let value = self.value(idx);
        self.push(value);
    }

    /// Move the top value into `idx`, shifting the values above it up
    pub fn insert(&mut self, idx: i32) {
        let pos = self.stack_pos(idx);
        self.with_thread(|t| {
            if let Some(value) = t.stack.pop() {
                t.stack.insert(pos, value);
            }
        });
    }

    /// Remove the value at `idx`, shifting the values above it down
    pub fn remove(&mut self, idx: i32) {
        let pos = self.stack_pos(idx);
        self.with_thread(|t| {
            t.stack.remove(pos);
        });
    }

    /// Pop the top value into `idx`
    pub fn replace(&mut self, idx: i32) {
        if self.get_top() == 0 {
            panic!("replace on an empty stack");
        }
        match self.slot(idx) {
            Some(Slot::Stack(pos)) => {
                let value = self.pop_value();
                if pos < self.stack_len() {
                    self.stack_set(pos, value);
                }
            }
            _ => {
                let value = self.pop_value();
                self.store(idx, value);
            }
        }
    }

    /// Make sure `extra` more slots fit under the configured stack limit
    ///
    /// Returns `false`, leaving the stack untouched, when they do not.
    pub fn check_stack(&mut self, extra: usize) -> bool {
        let len = self.stack_len();
        if len.saturating_add(extra) > self.env.config.limits.stack_limit {
            return false;
        }
        self.with_thread(|t| t.stack.reserve(extra));
        true
    }

    // ---- pushing values ----

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push(Value::Boolean(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(Value::Number(n));
    }

    pub fn push_integer(&mut self, n: i64) {
        self.push(Value::Number(n as f64));
    }

    pub fn push_string(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Push a byte string, which may contain embedded zeros
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let value = self.heap_mut().string_value(bytes);
        self.push(value);
        self.gc_point();
    }

    /// Push formatted text and return it
    ///
    /// ```
    /// let mut state = luastate::State::new();
    /// let text = state.push_fstring(format_args!("{} + {}", 1, 2));
    /// assert_eq!(text, "1 + 2");
    /// ```
    pub fn push_fstring(&mut self, args: fmt::Arguments<'_>) -> String {
        let text = fmt::format(args);
        self.push_string(&text);
        text
    }

    pub fn push_light_userdata(&mut self, p: usize) {
        self.push(Value::LightUserdata(p));
    }

    /// Push a full userdata holding `data`
    pub fn new_userdata<T: Any>(&mut self, data: T) {
        let handle = self
            .heap_mut()
            .new_userdata(Box::new(data), std::mem::size_of::<T>());
        self.push(Value::Userdata(handle));
        self.gc_point();
    }

    /// Push this handle's thread; true when it is the main thread
    pub fn push_thread(&mut self) -> bool {
        self.push(Value::Thread(self.thread));
        self.is_main_thread()
    }

    /// Push a new table with room for `narr` array and `nrec` hash entries
    pub fn create_table(&mut self, narr: usize, nrec: usize) {
        let handle = self.heap_mut().new_table(narr, nrec);
        self.push(Value::Table(handle));
        self.gc_point();
    }

    pub fn new_table(&mut self) {
        self.create_table(0, 0);
    }

    // ---- type tests ----

    /// Type of the value at `idx`; [`LuaType::None`] for a non-valid index
    pub fn type_of(&self, idx: i32) -> LuaType {
        self.value_opt(idx).map_or(LuaType::None, |v| v.type_of())
    }

    pub fn type_name(&self, idx: i32) -> &'static str {
        self.type_of(idx).name()
    }

    pub fn is_none(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::None
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Nil
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        matches!(self.type_of(idx), LuaType::None | LuaType::Nil)
    }

    pub fn is_boolean(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Boolean
    }

    /// Whether the value is a number or a string convertible to one
    pub fn is_number(&self, idx: i32) -> bool {
        self.to_number_opt(idx).is_some()
    }

    /// Whether the value is a string or a number
    pub fn is_string(&self, idx: i32) -> bool {
        matches!(self.type_of(idx), LuaType::String | LuaType::Number)
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Table
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Function
    }

    /// Whether the value is a full or light userdata
    pub fn is_userdata(&self, idx: i32) -> bool {
        matches!(self.type_of(idx), LuaType::Userdata | LuaType::LightUserdata)
    }

    pub fn is_light_userdata(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::LightUserdata
    }

    pub fn is_thread(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Thread
    }

    // ---- conversions ----

    /// Numeric value of a number or convertible string
    pub fn to_number_opt(&self, idx: i32) -> Option<f64> {
        let value = self.value_opt(idx)?;
        self.coerce_number(&value)
    }

    /// Numeric value, or 0 when the value is not convertible
    pub fn to_number(&self, idx: i32) -> f64 {
        self.to_number_opt(idx).unwrap_or(0.0)
    }

    /// Numeric value truncated towards zero, or 0
    pub fn to_integer(&self, idx: i32) -> i64 {
        self.to_number_opt(idx).map_or(0, to_integer)
    }

    /// Lua truthiness; false for a non-valid index
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_opt(idx).map_or(false, |v| v.truthy())
    }

    /// Bytes of a string or number; a number is converted in place
    pub fn to_bytes(&mut self, idx: i32) -> Option<Vec<u8>> {
        match self.value_opt(idx)? {
            Value::String(h) => Some(self.heap().string_bytes(h).to_vec()),
            Value::Number(n) => {
                let text = format_number(n);
                let converted = self.heap_mut().string_value(text.as_bytes());
                if let Some(Slot::Stack(pos)) = self.slot(idx) {
                    self.stack_set(pos, converted);
                }
                Some(text.into_bytes())
            }
            _ => None,
        }
    }

    /// Text of a string or number; a number is converted in place
    ///
    /// Invalid UTF-8 is replaced; use [`State::to_bytes`] for raw bytes.
    pub fn to_string(&mut self, idx: i32) -> Option<String> {
        self.to_bytes(idx)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn to_light_userdata(&self, idx: i32) -> Option<usize> {
        match self.value_opt(idx)? {
            Value::LightUserdata(p) => Some(p),
            _ => None,
        }
    }

    /// Run `f` on the contents of a full userdata of type `T`
    ///
    /// Returns `None` when the value is not a userdata holding a `T`. The
    /// state stays usable from inside `f`.
    pub fn with_userdata<T: Any, R>(&self, idx: i32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let handle = match self.value_opt(idx)? {
            Value::Userdata(h) => h,
            _ => return None,
        };
        let mut data = {
            let mut heap = self.heap_mut();
            let object = heap.userdata.get_mut(handle.0)?;
            if !object.data.is::<T>() {
                return None;
            }
            std::mem::replace(&mut object.data, Box::new(()))
        };
        let result = data.downcast_mut::<T>().map(f);
        if let Some(object) = self.heap_mut().userdata.get_mut(handle.0) {
            object.data = data;
        }
        result
    }

    /// Identity of a table, function, thread or userdata; 0 otherwise
    pub fn to_pointer(&self, idx: i32) -> usize {
        match self.value_opt(idx) {
            Some(v @ (Value::Table(_)
            | Value::Function(_)
            | Value::Thread(_)
            | Value::Userdata(_)
            | Value::LightUserdata(_))) => v.identity(),
            _ => 0,
        }
    }

    /// A shared handle on the thread at `idx`
    pub fn to_thread(&self, idx: i32) -> Option<State> {
        match self.value_opt(idx)? {
            Value::Thread(t) => Some(self.view(t)),
            _ => None,
        }
    }

    /// Length of a string, border of a table or size of a userdata
    ///
    /// A number is converted to a string in place first.
    pub fn obj_len(&mut self, idx: i32) -> usize {
        match self.value_opt(idx) {
            Some(Value::String(h)) => self.heap().string_bytes(h).len(),
            Some(Value::Number(_)) => self.to_bytes(idx).map_or(0, |b| b.len()),
            Some(Value::Table(t)) => self.heap().table(t).len(),
            Some(Value::Userdata(u)) => self.heap().userdata.get(u.0).map_or(0, |o| o.size),
            _ => 0,
        }
    }

    /// Byte length of a string or of the text of a number
    pub fn str_len(&self, idx: i32) -> usize {
        match self.value_opt(idx) {
            Some(Value::String(h)) => self.heap().string_bytes(h).len(),
            Some(Value::Number(n)) => format_number(n).len(),
            _ => 0,
        }
    }

    // ---- raw table access ----

    fn table_at(&self, idx: i32) -> TableHandle {
        match self.value(idx) {
            Value::Table(t) => t,
            other => panic!("table expected at index {}, got {}", idx, other.type_name()),
        }
    }

    /// Replace the key on top with `t[key]`, without metamethods
    pub fn raw_get(&mut self, idx: i32) {
        let t = self.table_at(idx);
        let key = self.value(-1);
        let value = self.heap().table(t).get(&key);
        self.stack_set(self.stack_len() - 1, value);
    }

    /// Push `t[n]`, without metamethods
    pub fn raw_geti(&mut self, idx: i32, n: i64) {
        let t = self.table_at(idx);
        let value = self.heap().table(t).get_int(n);
        self.push(value);
    }

    /// Pop a value and a key and store them into the table at `idx`
    ///
    /// Fails for a nil or NaN key.
    pub fn raw_set(&mut self, idx: i32) -> Result<()> {
        let t = self.table_at(idx);
        self.guard(2, move |state| {
            let key = state.value(-2);
            let value = state.value(-1);
            state.heap_mut().table_set(t, key, value)?;
            state.pop(2);
            Ok(())
        })
    }

    /// Pop a value into `t[n]`, without metamethods
    pub fn raw_seti(&mut self, idx: i32, n: i64) {
        let t = self.table_at(idx);
        let value = self.pop_value();
        // an integral key is never nil or NaN
        let _ = self.heap_mut().table_set(t, Value::Number(n as f64), value);
    }

    /// Primitive equality of two valid indices
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        match (self.value_opt(a), self.value_opt(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    // ---- table access with metamethods ----

    /// Replace the key on top with `t[key]`, honouring `__index`
    pub fn get_table(&mut self, idx: i32) -> Result<()> {
        let object = self.value(idx);
        self.guard(1, move |state| {
            let key = state.value(-1);
            let value = state.index_value(object, key)?;
            state.stack_set(state.stack_len() - 1, value);
            Ok(())
        })
    }

    /// Push `t[name]`, honouring `__index`
    pub fn get_field(&mut self, idx: i32, name: &str) -> Result<()> {
        let object = self.value(idx);
        let key = self.heap_mut().string_value(name.as_bytes());
        self.guard(0, move |state| {
            // anchor the key while metamethods run
            state.push(key);
            let value = state.index_value(object, key)?;
            state.stack_set(state.stack_len() - 1, value);
            Ok(())
        })
    }

    /// Pop a value and a key and assign `t[key] = value`, honouring `__newindex`
    pub fn set_table(&mut self, idx: i32) -> Result<()> {
        let object = self.value(idx);
        self.guard(2, move |state| {
            let key = state.value(-2);
            let value = state.value(-1);
            state.set_index_value(object, key, value)?;
            state.pop(2);
            Ok(())
        })
    }

    /// Pop a value and assign `t[name] = value`, honouring `__newindex`
    pub fn set_field(&mut self, idx: i32, name: &str) -> Result<()> {
        let object = self.value(idx);
        let key = self.heap_mut().string_value(name.as_bytes());
        self.guard(1, move |state| {
            let value = state.value(-1);
            state.push(key);
            state.set_index_value(object, key, value)?;
            state.pop(2);
            Ok(())
        })
    }

    /// Push the global `name`
    pub fn get_global(&mut self, name: &str) -> Result<()> {
        self.get_field(GLOBALS_INDEX, name)
    }

    /// Pop a value into the global `name`
    pub fn set_global(&mut self, name: &str) -> Result<()> {
        self.set_field(GLOBALS_INDEX, name)
    }

    /// Table traversal: pop a key and push the next key and value
    ///
    /// Returns `false`, pushing nothing, after the last entry. Start with a
    /// nil key.
    pub fn next(&mut self, idx: i32) -> Result<bool> {
        let t = self.table_at(idx);
        self.guard(1, move |state| {
            let key = state.value(-1);
            let entry = state.heap().table(t).next(&key)?;
            state.pop(1);
            match entry {
                Some((k, v)) => {
                    state.push(k);
                    state.push(v);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Concatenate the top `n` values, honouring `__concat`
    ///
    /// With `n == 0` an empty string is pushed; with `n == 1` the stack is
    /// left as it is.
    pub fn concat(&mut self, n: usize) -> Result<()> {
        if n > self.get_top() as usize {
            panic!("not enough values to concatenate");
        }
        self.guard(n, move |state| state.concat_top(n))?;
        self.gc_point();
        Ok(())
    }

    /// Equality honouring `__eq`; false when either index is not valid
    pub fn equal(&mut self, a: i32, b: i32) -> Result<bool> {
        let (x, y) = match (self.value_opt(a), self.value_opt(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Ok(false),
        };
        self.guard(0, move |state| state.values_equal(x, y))
    }

    /// Ordering honouring `__lt`; false when either index is not valid
    pub fn less_than(&mut self, a: i32, b: i32) -> Result<bool> {
        let (x, y) = match (self.value_opt(a), self.value_opt(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Ok(false),
        };
        self.guard(0, move |state| state.values_less(x, y))
    }

    // ---- metatables and environments ----

    /// Push the metatable of the value at `idx`, if it has one
    pub fn get_metatable(&mut self, idx: i32) -> bool {
        let value = match self.value_opt(idx) {
            Some(v) => v,
            None => return false,
        };
        let mt = self.heap().metatable_of(&value);
        match mt {
            Some(mt) => {
                self.push(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`
    ///
    /// Values other than tables and userdata share one metatable per type.
    pub fn set_metatable(&mut self, idx: i32) -> bool {
        let value = self.value(idx);
        let mt = match self.value(-1) {
            Value::Table(t) => Some(t),
            Value::Nil => None,
            other => panic!("table expected as metatable, got {}", other.type_name()),
        };
        self.heap_mut().set_metatable_of(&value, mt);
        self.pop(1);
        true
    }

    /// Push the environment of a function, or the globals of a thread
    pub fn get_fenv(&mut self, idx: i32) {
        let env = match self.value(idx) {
            Value::Function(f) => Value::Table(self.heap().function(f).env),
            Value::Thread(t) => Value::Table(self.heap().thread(t).globals),
            _ => Value::Nil,
        };
        self.push(env);
    }

    /// Pop a table and make it the environment of the function or thread at `idx`
    ///
    /// Returns `false` for any other kind of value.
    pub fn set_fenv(&mut self, idx: i32) -> bool {
        let target = self.value(idx);
        let env = match self.value(-1) {
            Value::Table(t) => t,
            other => panic!("table expected as environment, got {}", other.type_name()),
        };
        let done = {
            let mut heap = self.heap_mut();
            match target {
                Value::Function(f) => {
                    heap.function_mut(f).env = env;
                    true
                }
                Value::Thread(t) => {
                    heap.thread_mut(t).globals = env;
                    true
                }
                _ => false,
            }
        };
        self.pop(1);
        done
    }

    // ---- coercions shared with the interpreter ----

    /// A number, or a string that parses as one
    pub(crate) fn coerce_number(&self, value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => Some(*n),
            Value::String(h) => parse_number(self.heap().string_bytes(*h)),
            _ => None,
        }
    }

    /// Bytes of a string, or the text of a number
    pub(crate) fn coerce_bytes(&self, value: &Value) -> Option<Vec<u8>> {
        match value {
            Value::String(h) => Some(self.heap().string_bytes(*h).to_vec()),
            Value::Number(n) => Some(format_number(*n).into_bytes()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_restores_top() {
        let mut state = State::new();
        state.push_integer(1);
        let top = state.get_top();
        state.push_string("x");
        state.new_table();
        state.push_boolean(true);
        state.pop(3);
        assert_eq!(state.get_top(), top);
    }

    #[test]
    fn test_set_top_negative_and_fill() {
        let mut state = State::new();
        state.set_top(3);
        assert_eq!(state.get_top(), 3);
        assert!(state.is_nil(3));
        state.set_top(-1);
        assert_eq!(state.get_top(), 3);
        state.set_top(-3);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_insert_remove_replace() {
        let mut state = State::new();
        for i in 1..=3 {
            state.push_integer(i);
        }
        state.insert(1);
        assert_eq!(
            (state.to_integer(1), state.to_integer(2), state.to_integer(3)),
            (3, 1, 2)
        );
        state.remove(1);
        assert_eq!((state.to_integer(1), state.to_integer(2)), (1, 2));
        state.push_integer(9);
        state.replace(1);
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_integer(1), 9);
    }

    #[test]
    fn test_number_string_coercions() {
        let mut state = State::new();
        state.push_string("  0x10 ");
        assert!(state.is_number(-1));
        assert_eq!(state.to_integer(-1), 16);
        assert_eq!(state.type_of(-1), LuaType::String);

        state.push_number(2.5);
        assert!(state.is_string(-1));
        assert_eq!(state.to_string(-1).as_deref(), Some("2.5"));
        // converted in place
        assert_eq!(state.type_of(-1), LuaType::String);

        state.push_boolean(false);
        assert_eq!(state.to_string(-1), None);
        assert_eq!(state.to_number(-1), 0.0);
        assert!(!state.to_boolean(-1));
        assert!(!state.to_boolean(10));
    }

    #[test]
    fn test_embedded_zeros() {
        let mut state = State::new();
        state.push_bytes(b"a\0b");
        assert_eq!(state.obj_len(-1), 3);
        assert_eq!(state.to_bytes(-1).unwrap(), b"a\0b");
    }

    #[test]
    fn test_userdata_roundtrip() {
        let mut state = State::new();
        state.new_userdata(vec![1u32, 2, 3]);
        assert!(state.is_userdata(-1));
        assert!(!state.is_light_userdata(-1));
        let sum = state.with_userdata(-1, |v: &mut Vec<u32>| {
            v.push(4);
            v.iter().sum::<u32>()
        });
        assert_eq!(sum, Some(10));
        assert_eq!(state.with_userdata(-1, |v: &mut String| v.len()), None);
        assert_ne!(state.to_pointer(-1), 0);
    }

    #[test]
    fn test_raw_access() {
        let mut state = State::new();
        state.new_table();
        state.push_string("v");
        state.raw_seti(1, 1);
        state.raw_geti(1, 1);
        assert_eq!(state.to_string(-1).as_deref(), Some("v"));
        state.pop(1);

        state.push_string("k");
        state.push_integer(5);
        state.raw_set(1).unwrap();
        state.push_string("k");
        state.raw_get(1);
        assert_eq!(state.to_integer(-1), 5);
        state.pop(1);

        state.push_nil();
        state.push_integer(1);
        let err = state.raw_set(1).unwrap_err();
        assert_eq!(err.to_string(), "table index is nil");
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut state = State::new();
        state.push_integer(42);
        state.set_global("answer").unwrap();
        assert_eq!(state.get_top(), 0);
        state.get_global("answer").unwrap();
        assert_eq!(state.to_integer(-1), 42);
        state.get_global("missing").unwrap();
        assert!(state.is_nil(-1));
    }

    #[test]
    fn test_next_traversal() {
        let mut state = State::new();
        state.new_table();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            state.push_integer(i as i64);
            state.set_field(1, name).unwrap();
        }
        state.push_nil();
        let mut seen = 0;
        while state.next(1).unwrap() {
            seen += 1;
            state.pop(1);
        }
        assert_eq!(seen, 3);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_check_stack_limit() {
        let mut config = crate::config::Config::default();
        config.limits.stack_limit = 30;
        let mut state = State::with_config(config).unwrap();
        assert!(state.check_stack(20));
        assert!(!state.check_stack(31));
        assert_eq!(state.get_top(), 0);
    }

    #[test]
    fn test_metatable_and_fenv() {
        let mut state = State::new();
        state.new_table();
        assert!(!state.get_metatable(1));
        state.new_table();
        state.set_metatable(1);
        assert!(state.get_metatable(1));
        state.pop(1);

        state.push_thread();
        state.get_fenv(-1);
        assert!(state.raw_equal(-1, GLOBALS_INDEX));
        state.pop(2);

        state.push_integer(3);
        state.new_table();
        assert!(!state.set_fenv(-2));
    }
}
