//! Host functions
//!
//! Host callables live in the environment's id registry; a function value
//! only carries the id. The entry is released when the collector frees the
//! last closure using it.

use super::{HostFunction, State, MAX_UPVALUES};
use crate::error::Result;
use crate::vm::heap::FunctionKind;
use crate::vm::value::{HostId, Value};

impl State {
    /// Push a host function without upvalues
    pub fn push_host_function(&mut self, f: HostFunction) {
        self.push_host_closure(f, 0);
    }

    /// Push a host closure taking the top `n` values as its upvalues
    ///
    /// The upvalues are popped and are reachable from the function through
    /// [`upvalue_index`](super::upvalue_index).
    pub fn push_host_closure(&mut self, f: HostFunction, n: usize) {
        assert!(n <= MAX_UPVALUES, "too many upvalues ({} > {})", n, MAX_UPVALUES);
        if (self.get_top() as usize) < n {
            panic!("not enough values for {} upvalues", n);
        }
        let id = HostId(self.env.hosts.borrow_mut().insert(f));
        let env = self.current_env();
        let handle = {
            let mut heap = self.heap_mut();
            let thread = heap.thread_mut(self.thread);
            let start = thread.stack.len() - n;
            let upvalues: Vec<Value> = thread.stack.drain(start..).collect();
            heap.new_function(FunctionKind::Host { id, upvalues }, env)
        };
        self.push(Value::Function(handle));
        self.gc_point();
    }

    /// Set the global `name` to a new host function
    pub fn register(&mut self, name: &str, f: HostFunction) -> Result<()> {
        self.push_host_function(f);
        self.set_global(name)
    }

    pub fn is_host_function(&self, idx: i32) -> bool {
        match self.value_opt(idx) {
            Some(Value::Function(f)) => matches!(self.heap().function(f).kind, FunctionKind::Host { .. }),
            _ => false,
        }
    }

    /// The host callable behind the function at `idx`
    pub fn to_host_function(&self, idx: i32) -> Option<HostFunction> {
        let id = match self.value_opt(idx)? {
            Value::Function(f) => match self.heap().function(f).kind {
                FunctionKind::Host { id, .. } => id,
                FunctionKind::Lua { .. } => return None,
            },
            _ => return None,
        };
        self.env.hosts.borrow().get(id.0).cloned()
    }
}
