//! Calls and the interpreter loop
//!
//! Lua-to-Lua calls push a frame and stay in the same [`State::execute`]
//! loop. Host functions run on the Rust stack; a host function that calls
//! back into Lua starts a nested loop that stops when its own frame count
//! is reached again. Errors leave the frames in place for the catcher to
//! inspect and unwind.

use std::rc::Rc;

use super::State;
use crate::error::Result;
use crate::vm::heap::{Event, Frame, FrameKind, FunctionKind, LuaFrame};
use crate::vm::proto::{Capture, Constant, Instruction, OpCode, Proto};
use crate::vm::value::{FunctionHandle, Value};

/// What `precall` did with the callee
pub(crate) enum PreCall {
    /// A Lua frame was pushed and is ready to run
    Lua,

    /// A host function ran to completion
    Host,

    /// A host function yielded; its frame stays on the thread
    Yielded,
}

/// How an `execute` loop ended
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Exec {
    Finished,
    Yielded,
}

fn arith_event(op: OpCode) -> Event {
    match op {
        OpCode::Add => Event::Add,
        OpCode::Sub => Event::Sub,
        OpCode::Mul => Event::Mul,
        OpCode::Div => Event::Div,
        OpCode::Mod => Event::Mod,
        _ => Event::Pow,
    }
}

/// Opcodes whose handlers can call back into Lua
fn runs_metamethods(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetTable
            | OpCode::GetField
            | OpCode::SetTable
            | OpCode::SelfOp
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Unm
            | OpCode::Len
            | OpCode::Concat
            | OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
    )
}

impl State {
    pub(crate) fn frame_count(&self) -> usize {
        self.heap().thread(self.thread).frames.len()
    }

    /// Call the function at absolute stack position `func` with every value
    /// above it as arguments, leaving `nresults` results (-1: all) at `func`
    ///
    /// This is the host-initiated call: it counts against the nested host
    /// call limit and forbids yields until it returns.
    pub(crate) fn call_at(&mut self, func: usize, nresults: i32) -> Result<()> {
        let depth = self.env.host_depth.get();
        if depth >= self.env.config.limits.host_call_depth {
            return Err(self.runtime_error("C stack overflow"));
        }
        self.env.host_depth.set(depth + 1);
        self.with_thread(|t| t.nny += 1);

        let entry = self.frame_count();
        let result = match self.precall(func, nresults) {
            Ok(PreCall::Lua) => self.execute(entry).map(|_| ()),
            Ok(PreCall::Host) | Ok(PreCall::Yielded) => Ok(()),
            Err(e) => Err(e),
        };

        self.env.host_depth.set(depth);
        if !self.env.closed.get() {
            self.with_thread(|t| t.nny -= 1);
        }
        result
    }

    /// Start a call: push a Lua frame, or run a host function to completion
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> Result<PreCall> {
        self.gc_check()?;

        let mut callee = self.stack_get(func);
        if !matches!(callee, Value::Function(_)) {
            let handler = self.heap().metamethod(&callee, Event::Call);
            if !matches!(handler, Value::Function(_)) {
                return Err(self.type_error(&callee, "call"));
            }
            self.with_thread(|t| t.stack.insert(func, handler));
            callee = handler;
        }
        let closure = match callee {
            Value::Function(f) => f,
            _ => return Err(self.type_error(&callee, "call")),
        };

        if self.frame_count() >= self.env.config.limits.call_depth {
            return Err(self.runtime_error("stack overflow"));
        }

        let host = {
            let heap = self.heap();
            match &heap.function(closure).kind {
                FunctionKind::Lua { proto, .. } => Err(proto.clone()),
                FunctionKind::Host { id, .. } => Ok(*id),
            }
        };
        match host {
            Err(proto) => {
                self.enter_lua(closure, proto, func, nresults)?;
                Ok(PreCall::Lua)
            }
            Ok(id) => {
                let callable = self.env.hosts.borrow().get(id.0).cloned();
                let callable = match callable {
                    Some(c) => c,
                    None => return Err(self.runtime_error("call of a released host function")),
                };
                self.call_host(closure, callable, func, nresults)
            }
        }
    }

    fn enter_lua(&mut self, closure: FunctionHandle, proto: Rc<Proto>, func: usize, nresults: i32) -> Result<()> {
        let base = func + 1;
        if base + proto.max_stack + 3 > self.env.config.limits.stack_limit {
            return Err(self.runtime_error("stack overflow"));
        }
        self.with_thread(|t| {
            let nargs = t.stack.len().saturating_sub(base);
            let varargs = if proto.is_vararg && nargs > proto.num_params {
                t.stack[base + proto.num_params..].to_vec()
            } else {
                Vec::new()
            };
            t.stack.resize(base + proto.num_params, Value::Nil);
            let cells = vec![None; proto.max_stack + 3];
            t.frames.push(Frame {
                func,
                base,
                nresults,
                kind: FrameKind::Lua(LuaFrame {
                    closure,
                    proto,
                    pc: 0,
                    varargs,
                    cells,
                }),
            });
        });
        Ok(())
    }

    fn call_host(
        &mut self,
        closure: FunctionHandle,
        callable: super::HostFunction,
        func: usize,
        nresults: i32,
    ) -> Result<PreCall> {
        let base = func + 1;
        self.with_thread(|t| {
            t.frames.push(Frame {
                func,
                base,
                nresults,
                kind: FrameKind::Host { closure },
            })
        });

        let returned = callable(self)?;

        let yielded = self.with_thread(|t| t.yield_request.take());
        if let Some(count) = yielded {
            self.with_thread(|t| {
                let start = t.stack.len().saturating_sub(count).max(base);
                t.stack.drain(base..start);
            });
            return Ok(PreCall::Yielded);
        }

        let len = self.stack_len();
        let available = len - base;
        if returned > available {
            return Err(self.runtime_error(format!(
                "host function returned {} results but its stack holds {}",
                returned, available
            )));
        }
        self.poscall(len - returned);
        Ok(PreCall::Host)
    }

    /// Finish the innermost call: move the values from `first` to the top
    /// into the function slot and adjust them to the wanted count
    pub(crate) fn poscall(&mut self, first: usize) {
        self.with_thread(|t| {
            let frame = match t.frames.pop() {
                Some(f) => f,
                None => return,
            };
            let first = first.min(t.stack.len()).max(frame.func);
            t.stack.drain(frame.func..first);
            if frame.nresults >= 0 {
                t.stack.resize(frame.func + frame.nresults as usize, Value::Nil);
            }
        });
    }

    // ---- interpreter helpers ----

    /// Constant `k` of the running prototype
    fn constant(&self, k: i32) -> Value {
        let mut heap = self.heap_mut();
        let text = {
            let thread = heap.thread(self.thread);
            match thread.frames.last().and_then(|f| f.lua()) {
                Some(lua) => match lua.proto.constants.get(k as usize) {
                    Some(Constant::Number(n)) => return Value::Number(*n),
                    Some(Constant::Str(s)) => s.clone(),
                    None => return Value::Nil,
                },
                None => return Value::Nil,
            }
        };
        heap.string_value(&text)
    }

    fn with_lua_frame<R>(&self, f: impl FnOnce(&mut LuaFrame) -> R) -> Option<R> {
        let mut heap = self.heap_mut();
        let frame = heap.thread_mut(self.thread).frames.last_mut()?;
        frame.lua_mut().map(f)
    }

    fn jump(&self, target: i32) {
        self.with_lua_frame(|lua| lua.pc = target as usize);
    }

    fn running_closure(&self) -> Option<FunctionHandle> {
        self.heap().thread(self.thread).frames.last().map(|f| f.closure())
    }

    fn peek(&self, depth: usize) -> Value {
        let len = self.stack_len();
        self.stack_get(len - depth)
    }

    /// Drop the top `n` values and push `value`
    fn collapse(&self, n: usize, value: Value) {
        self.with_thread(|t| {
            let len = t.stack.len();
            t.stack.truncate(len - n);
            t.stack.push(value);
        });
    }

    fn cell_of_local(&self, slot: usize) -> Option<crate::vm::value::CellHandle> {
        self.with_lua_frame(|lua| lua.cells.get(slot).copied().flatten())
            .flatten()
    }

    fn upvalue_cell(&self, idx: usize) -> Option<crate::vm::value::CellHandle> {
        let closure = self.running_closure()?;
        let heap = self.heap();
        match &heap.function(closure).kind {
            FunctionKind::Lua { upvalues, .. } => upvalues.get(idx).copied(),
            FunctionKind::Host { .. } => None,
        }
    }

    fn for_number(&self, value: Value, what: &str) -> Result<f64> {
        self.coerce_number(&value)
            .ok_or_else(|| self.runtime_error(format!("'for' {} must be a number", what)))
    }

    /// Run Lua frames until the frame count drops to `stop` or the thread yields
    pub(crate) fn execute(&mut self, stop: usize) -> Result<Exec> {
        loop {
            let fetched = {
                let mut heap = self.heap_mut();
                let thread = heap.thread_mut(self.thread);
                if thread.frames.len() <= stop {
                    return Ok(Exec::Finished);
                }
                match thread.frames.last_mut() {
                    Some(frame) => {
                        let base = frame.base;
                        match frame.lua_mut() {
                            Some(lua) => lua.proto.code.get(lua.pc).copied().map(|ins| {
                                lua.pc += 1;
                                (ins, base)
                            }),
                            None => None,
                        }
                    }
                    None => return Ok(Exec::Finished),
                }
            };
            let (ins, base) = match fetched {
                Some(f) => f,
                None => return Err(self.runtime_error("execution left the function body")),
            };

            match ins.op {
                OpCode::Call => {
                    let func = base + ins.a as usize;
                    if ins.b >= 0 {
                        self.truncate(func + 1 + ins.b as usize);
                    }
                    match self.precall(func, ins.c)? {
                        PreCall::Lua | PreCall::Host => {}
                        PreCall::Yielded => return Ok(Exec::Yielded),
                    }
                }
                op if runs_metamethods(op) => self.meta_step(ins, base)?,
                _ => self.plain_step(ins, base)?,
            }
        }
    }

    /// Instructions that may call back into Lua through a metamethod
    ///
    /// Kept out of `execute` so a nested call holds only the small
    /// dispatch frame plus this one on the Rust stack.
    #[inline(never)]
    fn meta_step(&mut self, ins: Instruction, base: usize) -> Result<()> {
        let a = ins.a;
        match ins.op {
            OpCode::GetGlobal => {
                let env = self.current_env();
                let key = self.constant(a);
                // anchor the key while metamethods run
                self.push(key);
                let v = self.index_value(Value::Table(env), key)?;
                self.collapse(1, v);
            }
            OpCode::SetGlobal => {
                let env = self.current_env();
                let key = self.constant(a);
                let v = self.peek(1);
                self.push(key);
                self.set_index_value(Value::Table(env), key, v)?;
                self.truncate(self.stack_len() - 2);
                self.gc_check()?;
            }
            OpCode::GetTable => {
                let object = self.peek(2);
                let key = self.peek(1);
                let v = self.index_value(object, key)?;
                self.collapse(2, v);
            }
            OpCode::GetField => {
                let object = self.peek(1);
                let key = self.constant(a);
                self.push(key);
                let v = self.index_value(object, key)?;
                self.collapse(2, v);
            }
            OpCode::SetTable => {
                let v = self.peek(1);
                let object = self.stack_get(base + a as usize);
                let key = self.stack_get(base + ins.b as usize);
                self.set_index_value(object, key, v)?;
                self.pop_value();
                self.gc_check()?;
            }
            OpCode::SelfOp => {
                let object = self.peek(1);
                let key = self.constant(a);
                self.push(key);
                let method = self.index_value(object, key)?;
                self.collapse(2, method);
                self.push(object);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let x = self.peek(2);
                let y = self.peek(1);
                let event = arith_event(ins.op);
                let v = self.arith(event, x, y)?;
                self.collapse(2, v);
            }
            OpCode::Unm => {
                let x = self.peek(1);
                let v = match x {
                    Value::Number(n) => Value::Number(-n),
                    _ => self.arith(Event::Unm, x, x)?,
                };
                self.collapse(1, v);
            }
            OpCode::Len => {
                let x = self.peek(1);
                let v = self.length_of(x)?;
                self.collapse(1, v);
            }
            OpCode::Concat => {
                self.concat_top(a.max(0) as usize)?;
                self.gc_check()?;
            }
            OpCode::Eq => {
                let x = self.peek(2);
                let y = self.peek(1);
                let v = self.values_equal(x, y)?;
                self.collapse(2, Value::Boolean(v));
            }
            OpCode::Lt | OpCode::Le => {
                let (mut x, mut y) = (self.peek(2), self.peek(1));
                if a == 1 {
                    std::mem::swap(&mut x, &mut y);
                }
                let v = if ins.op == OpCode::Lt {
                    self.values_less(x, y)?
                } else {
                    self.values_less_equal(x, y)?
                };
                self.collapse(2, Value::Boolean(v));
            }
            _ => {}
        }
        Ok(())
    }

    /// Instructions that never re-enter the interpreter
    #[inline(never)]
    fn plain_step(&mut self, ins: Instruction, base: usize) -> Result<()> {
        let a = ins.a;
        match ins.op {
            OpCode::LoadNil => {
                for _ in 0..a.max(0) {
                    self.push(Value::Nil);
                }
            }
            OpCode::LoadTrue => self.push(Value::Boolean(true)),
            OpCode::LoadFalse => self.push(Value::Boolean(false)),
            OpCode::LoadK => {
                let k = self.constant(a);
                self.push(k);
            }
            OpCode::Vararg => {
                let varargs = self.with_lua_frame(|lua| lua.varargs.clone()).unwrap_or_default();
                let wanted = if a < 0 { varargs.len() } else { a as usize };
                self.with_thread(|t| {
                    for i in 0..wanted {
                        t.stack.push(varargs.get(i).copied().unwrap_or(Value::Nil));
                    }
                });
            }
            OpCode::GetLocal => {
                let v = self.stack_get(base + a as usize);
                self.push(v);
            }
            OpCode::SetLocal => {
                let v = self.pop_value();
                self.stack_set(base + a as usize, v);
            }
            OpCode::BoxLocal => {
                let slot = a as usize;
                let v = self.stack_get(base + slot);
                let cell = self.heap_mut().new_cell(v);
                self.with_lua_frame(|lua| {
                    if slot < lua.cells.len() {
                        lua.cells[slot] = Some(cell);
                    }
                });
            }
            OpCode::GetCell => {
                let cell = self
                    .cell_of_local(a as usize)
                    .ok_or_else(|| self.runtime_error("access to an unboxed local"))?;
                let v = self.heap().cell(cell);
                self.push(v);
            }
            OpCode::SetCell => {
                let cell = self
                    .cell_of_local(a as usize)
                    .ok_or_else(|| self.runtime_error("access to an unboxed local"))?;
                let v = self.pop_value();
                self.heap_mut().set_cell(cell, v);
            }
            OpCode::GetUpval => {
                let cell = self
                    .upvalue_cell(a as usize)
                    .ok_or_else(|| self.runtime_error("bad upvalue index"))?;
                let v = self.heap().cell(cell);
                self.push(v);
            }
            OpCode::SetUpval => {
                let cell = self
                    .upvalue_cell(a as usize)
                    .ok_or_else(|| self.runtime_error("bad upvalue index"))?;
                let v = self.pop_value();
                self.heap_mut().set_cell(cell, v);
            }
            OpCode::InitField => {
                let key = self.peek(2);
                let v = self.peek(1);
                if let Value::Table(t) = self.stack_get(base + a as usize) {
                    let stored = self.heap_mut().table_set(t, key, v);
                    stored.map_err(|e| self.runtime_error(e.to_string()))?;
                }
                self.truncate(self.stack_len() - 2);
                self.gc_check()?;
            }
            OpCode::SetList => {
                let tslot = base + a as usize;
                let len = self.stack_len();
                let first = if ins.b < 0 { tslot + 1 } else { len - ins.b as usize };
                if let Value::Table(t) = self.stack_get(tslot) {
                    let values: Vec<Value> = (first..len).map(|p| self.stack_get(p)).collect();
                    let mut heap = self.heap_mut();
                    for (i, v) in values.into_iter().enumerate() {
                        let key = Value::Number((ins.c as usize + i) as f64);
                        // integral keys are always valid
                        let _ = heap.table_set(t, key, v);
                    }
                }
                self.truncate(first);
                self.gc_check()?;
            }
            OpCode::NewTable => {
                let t = self.heap_mut().new_table(a.max(0) as usize, ins.b.max(0) as usize);
                self.push(Value::Table(t));
                self.gc_check()?;
            }
            OpCode::Not => {
                let x = self.peek(1);
                self.collapse(1, Value::Boolean(!x.truthy()));
            }
            OpCode::Jump => self.jump(a),
            OpCode::JumpIfFalse => {
                if !self.pop_value().truthy() {
                    self.jump(a);
                }
            }
            OpCode::JumpIfTrue => {
                if self.pop_value().truthy() {
                    self.jump(a);
                }
            }
            OpCode::AndJump => {
                if self.peek(1).truthy() {
                    self.pop_value();
                } else {
                    self.jump(a);
                }
            }
            OpCode::OrJump => {
                if self.peek(1).truthy() {
                    self.jump(a);
                } else {
                    self.pop_value();
                }
            }
            OpCode::Return => {
                let first = base + a as usize;
                if ins.b >= 0 {
                    self.with_thread(|t| t.stack.resize(first + ins.b as usize, Value::Nil));
                }
                self.poscall(first);
            }
            OpCode::SetTop => {
                self.with_thread(|t| t.stack.resize(base + a as usize, Value::Nil));
            }
            OpCode::Closure => self.make_closure(a as usize, base)?,
            OpCode::ForPrep => {
                let slot = base + a as usize;
                let init = self.for_number(self.stack_get(slot), "initial value")?;
                let limit = self.for_number(self.stack_get(slot + 1), "limit")?;
                let step = self.for_number(self.stack_get(slot + 2), "step")?;
                let enter = if step > 0.0 { init <= limit } else { limit <= init };
                self.with_thread(|t| {
                    t.stack.truncate(slot);
                    t.stack.extend([Value::Number(init), Value::Number(limit), Value::Number(step)]);
                    if enter {
                        t.stack.push(Value::Number(init));
                    }
                });
                if !enter {
                    self.jump(ins.b);
                }
            }
            OpCode::ForLoop => {
                let slot = base + a as usize;
                let numbers = (
                    self.stack_get(slot).as_number(),
                    self.stack_get(slot + 1).as_number(),
                    self.stack_get(slot + 2).as_number(),
                );
                if let (Some(index), Some(limit), Some(step)) = numbers {
                    let next = index + step;
                    let more = if step > 0.0 { next <= limit } else { limit <= next };
                    if more {
                        self.with_thread(|t| {
                            t.stack.truncate(slot + 3);
                            t.stack[slot] = Value::Number(next);
                            t.stack.push(Value::Number(next));
                        });
                        self.jump(ins.b);
                    }
                }
            }
            OpCode::TForTest => {
                let slot = base + a as usize;
                let first = self.stack_get(slot + 3);
                if first.is_nil() {
                    self.jump(ins.b);
                } else {
                    self.stack_set(slot + 2, first);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn make_closure(&mut self, index: usize, base: usize) -> Result<()> {
        let (proto, closure) = {
            let heap = self.heap();
            let frame = heap.thread(self.thread).frames.last();
            match frame.and_then(|f| f.lua().map(|lua| (lua.proto.protos.get(index).cloned(), lua.closure))) {
                Some((Some(p), c)) => (p, c),
                _ => return Err(self.runtime_error("bad function prototype index")),
            }
        };

        let mut upvalues = Vec::with_capacity(proto.captures.len());
        for capture in &proto.captures {
            let cell = match *capture {
                Capture::Local(slot) => match self.cell_of_local(slot) {
                    Some(cell) => cell,
                    None => {
                        // box on first capture
                        let v = self.stack_get(base + slot);
                        let cell = self.heap_mut().new_cell(v);
                        self.with_lua_frame(|lua| {
                            if slot < lua.cells.len() {
                                lua.cells[slot] = Some(cell);
                            }
                        });
                        cell
                    }
                },
                Capture::Upvalue(idx) => self
                    .upvalue_cell(idx)
                    .ok_or_else(|| self.runtime_error("bad upvalue index"))?,
            };
            upvalues.push(cell);
        }

        let handle = {
            let mut heap = self.heap_mut();
            let env = heap.function(closure).env;
            heap.new_function(FunctionKind::Lua { proto, upvalues }, env)
        };
        self.push(Value::Function(handle));
        self.gc_check()
    }
}
