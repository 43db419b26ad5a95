//! Index resolution
//!
//! Positive indices count from the base of the innermost frame, negative
//! ones from the top. Indices at or below [`REGISTRY_INDEX`] address the
//! registry, the running function's environment, the thread's globals and
//! the upvalues of the running host closure.

use super::{State, ENVIRON_INDEX, GLOBALS_INDEX, REGISTRY_INDEX};
use crate::vm::heap::{FrameKind, FunctionKind};
use crate::vm::value::{TableHandle, Value};

/// What an index refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Absolute position in the thread's stack
    Stack(usize),
    Registry,
    Environ,
    Globals,
    /// Zero-based upvalue of the running host closure
    Upvalue(usize),
}

/// Whether an index lies in the pseudo-index region
pub(crate) fn is_pseudo(idx: i32) -> bool {
    idx <= REGISTRY_INDEX
}

impl State {
    /// Resolve an index; `None` when it names no existing stack slot
    pub(crate) fn slot(&self, idx: i32) -> Option<Slot> {
        match idx {
            REGISTRY_INDEX => return Some(Slot::Registry),
            ENVIRON_INDEX => return Some(Slot::Environ),
            GLOBALS_INDEX => return Some(Slot::Globals),
            i if i < GLOBALS_INDEX => return Some(Slot::Upvalue((GLOBALS_INDEX - i - 1) as usize)),
            _ => {}
        }
        let heap = self.heap();
        let thread = heap.thread(self.thread);
        let base = thread.base();
        let len = thread.stack.len();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            (pos < len).then_some(Slot::Stack(pos))
        } else if idx < 0 {
            let back = (-idx) as usize;
            (back <= len.saturating_sub(base)).then(|| Slot::Stack(len - back))
        } else {
            None
        }
    }

    /// Absolute stack position of an index, panicking when it is not one
    pub(crate) fn stack_pos(&self, idx: i32) -> usize {
        match self.slot(idx) {
            Some(Slot::Stack(pos)) => pos,
            _ => panic!("invalid stack index {}", idx),
        }
    }

    /// Environment table of the running host closure, or the thread's globals
    pub(crate) fn current_env(&self) -> TableHandle {
        let heap = self.heap();
        let thread = heap.thread(self.thread);
        match thread.frames.last() {
            Some(frame) => heap.function(frame.closure()).env,
            None => thread.globals,
        }
    }

    /// Value at an index; `None` when the index holds no value
    pub(crate) fn value_opt(&self, idx: i32) -> Option<Value> {
        let slot = self.slot(idx)?;
        if slot == Slot::Environ {
            return Some(Value::Table(self.current_env()));
        }
        let heap = self.heap();
        let thread = heap.thread(self.thread);
        match slot {
            Slot::Stack(pos) => thread.stack.get(pos).copied(),
            Slot::Registry => Some(Value::Table(heap.registry)),
            Slot::Globals => Some(Value::Table(thread.globals)),
            Slot::Environ => None,
            Slot::Upvalue(i) => {
                let frame = thread.frames.last()?;
                match &frame.kind {
                    FrameKind::Host { closure } => match &heap.function(*closure).kind {
                        FunctionKind::Host { upvalues, .. } => upvalues.get(i).copied(),
                        FunctionKind::Lua { .. } => None,
                    },
                    FrameKind::Lua(_) => None,
                }
            }
        }
    }

    /// Value at an index that must be acceptable
    ///
    /// Upvalue indices beyond the closure's upvalues read as nil; other
    /// invalid indices panic.
    pub(crate) fn value(&self, idx: i32) -> Value {
        match self.value_opt(idx) {
            Some(v) => v,
            None if idx < GLOBALS_INDEX => Value::Nil,
            None => panic!("invalid stack index {}", idx),
        }
    }

    /// Store a value at an index, including the writable pseudo-indices
    pub(crate) fn store(&self, idx: i32, value: Value) {
        match self.slot(idx) {
            Some(Slot::Stack(pos)) => self.stack_set(pos, value),
            Some(Slot::Globals) => {
                if let Value::Table(t) = value {
                    self.with_thread(|th| th.globals = t);
                }
            }
            Some(Slot::Environ) => {
                if let Value::Table(t) = value {
                    let closure = self.heap().thread(self.thread).frames.last().map(|f| f.closure());
                    match closure {
                        Some(f) => self.heap_mut().function_mut(f).env = t,
                        None => self.with_thread(|th| th.globals = t),
                    }
                }
            }
            Some(Slot::Upvalue(i)) => {
                let mut heap = self.heap_mut();
                let closure = match heap.thread(self.thread).frames.last() {
                    Some(frame) => frame.closure(),
                    None => panic!("no running host closure for upvalue {}", i + 1),
                };
                match &mut heap.function_mut(closure).kind {
                    FunctionKind::Host { upvalues, .. } if i < upvalues.len() => upvalues[i] = value,
                    _ => panic!("invalid upvalue index {}", i + 1),
                }
            }
            Some(Slot::Registry) => panic!("cannot replace the registry"),
            None => panic!("invalid stack index {}", idx),
        }
    }

    /// Convert a top-relative index into a base-relative one
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || is_pseudo(idx) {
            idx
        } else {
            self.get_top() + idx + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::upvalue_index;
    use super::*;

    #[test]
    fn test_relative_and_absolute() {
        let mut state = State::new();
        state.push_integer(10);
        state.push_integer(20);
        state.push_integer(30);
        assert_eq!(state.abs_index(-1), 3);
        assert_eq!(state.abs_index(-3), 1);
        assert_eq!(state.abs_index(2), 2);
        assert_eq!(state.abs_index(REGISTRY_INDEX), REGISTRY_INDEX);
        assert_eq!(state.slot(4), None);
        assert_eq!(state.slot(-4), None);
        assert_eq!(state.slot(0), None);
    }

    #[test]
    fn test_pseudo_indices_are_tables() {
        let state = State::new();
        assert!(state.is_table(REGISTRY_INDEX));
        assert!(state.is_table(GLOBALS_INDEX));
        assert!(state.is_table(ENVIRON_INDEX));
        assert!(!state.raw_equal(REGISTRY_INDEX, GLOBALS_INDEX));
        assert!(state.raw_equal(ENVIRON_INDEX, GLOBALS_INDEX));
        assert!(state.is_none(upvalue_index(1)));
        assert_eq!(upvalue_index(1), -10003);
    }
}
