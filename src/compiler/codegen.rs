//! Bytecode generation
//!
//! Walks a resolved [`Chunk`] and emits stack-machine code. The generator
//! tracks the operand depth of every instruction statically: locals live in
//! the slots below the depth at their declaration and expression temporaries
//! are pushed above them.

use std::collections::HashMap;
use std::rc::Rc;

use super::ast::*;
use crate::vm::proto::{CallName, Capture, Constant, Instruction, OpCode, Proto, VarName};

/// Positional items of a table constructor flushed per `SetList`
const FIELDS_PER_FLUSH: usize = 50;

#[derive(Hash, PartialEq, Eq)]
enum ConstKey {
    Number(u64),
    Str(Vec<u8>),
}

struct LoopState {
    /// Depth to restore when leaving the loop
    depth: usize,

    /// Jumps to patch with the loop exit
    breaks: Vec<usize>,
}

struct FuncState {
    proto: Proto,
    depth: usize,
    locals: HashMap<LocalId, usize>,

    /// Locals of enclosing functions captured by this one, by upvalue index
    upvals: Vec<LocalId>,

    loops: Vec<LoopState>,
    constants: HashMap<ConstKey, usize>,
    line: u32,
}

impl FuncState {
    fn new(source: &str, line: u32) -> Self {
        FuncState {
            proto: Proto {
                source: source.to_string(),
                ..Proto::default()
            },
            depth: 0,
            locals: HashMap::new(),
            upvals: Vec::new(),
            loops: Vec::new(),
            constants: HashMap::new(),
            line,
        }
    }
}

/// Code generator for one chunk
pub struct CodeGen<'a> {
    chunk: &'a Chunk,
    source: &'a str,
    funcs: Vec<FuncState>,
}

/// Generate the main prototype of a parsed chunk
pub fn generate(chunk: &Chunk, source: &str) -> Rc<Proto> {
    let mut gen = CodeGen {
        chunk,
        source,
        funcs: Vec::new(),
    };
    Rc::new(gen.function(&chunk.main, true))
}

impl<'a> CodeGen<'a> {
    fn fs(&mut self) -> &mut FuncState {
        let last = self.funcs.len() - 1;
        &mut self.funcs[last]
    }

    fn depth(&self) -> usize {
        self.funcs[self.funcs.len() - 1].depth
    }

    fn pc(&self) -> usize {
        self.funcs[self.funcs.len() - 1].proto.code.len()
    }

    fn set_depth(&mut self, depth: usize) {
        let fs = self.fs();
        fs.depth = depth;
        fs.proto.max_stack = fs.proto.max_stack.max(depth);
    }

    fn grow(&mut self, n: usize) {
        let depth = self.depth() + n;
        self.set_depth(depth);
    }

    fn shrink(&mut self, n: usize) {
        let fs = self.fs();
        fs.depth -= n;
    }

    fn set_line(&mut self, line: u32) {
        if line > 0 {
            self.fs().line = line;
        }
    }

    fn emit(&mut self, op: OpCode, a: i32, b: i32, c: i32) -> usize {
        let fs = self.fs();
        let line = fs.line;
        fs.proto.code.push(Instruction::new(op, a, b, c));
        fs.proto.lines.push(line);
        fs.proto.code.len() - 1
    }

    /// Point the jump at `pc` to the current position
    fn patch_here(&mut self, pc: usize) {
        let target = self.pc() as i32;
        let ins = &mut self.fs().proto.code[pc];
        match ins.op {
            OpCode::ForPrep | OpCode::TForTest => ins.b = target,
            _ => ins.a = target,
        }
    }

    fn constant(&mut self, value: Constant) -> i32 {
        let key = match &value {
            Constant::Number(n) => ConstKey::Number(n.to_bits()),
            Constant::Str(s) => ConstKey::Str(s.clone()),
        };
        let fs = self.fs();
        if let Some(&idx) = fs.constants.get(&key) {
            return idx as i32;
        }
        fs.proto.constants.push(value);
        let idx = fs.proto.constants.len() - 1;
        fs.constants.insert(key, idx);
        idx as i32
    }

    fn string_constant(&mut self, s: &[u8]) -> i32 {
        self.constant(Constant::Str(s.to_vec()))
    }

    fn captured(&self, id: LocalId) -> bool {
        self.chunk.captured.get(id).copied().unwrap_or(false)
    }

    fn local_name(&self, id: LocalId) -> String {
        self.chunk.local_names.get(id).cloned().unwrap_or_default()
    }

    // ---- functions ----

    fn function(&mut self, body: &FuncBody, main: bool) -> Proto {
        let mut fs = FuncState::new(self.source, body.line);
        fs.proto.num_params = body.params.len();
        fs.proto.is_vararg = body.is_vararg;
        if !main {
            fs.proto.line_defined = body.line;
            fs.proto.last_line_defined = body.end_line;
        }
        self.funcs.push(fs);

        for (slot, &id) in body.params.iter().enumerate() {
            self.fs().locals.insert(id, slot);
        }
        self.set_depth(body.params.len());
        for (slot, &id) in body.params.iter().enumerate() {
            if self.captured(id) {
                self.emit(OpCode::BoxLocal, slot as i32, 0, 0);
            }
        }

        self.statements(&body.body.stats);
        self.set_line(body.end_line);
        self.emit(OpCode::Return, 0, 0, 0);

        match self.funcs.pop() {
            Some(fs) => fs.proto,
            None => Proto::default(),
        }
    }

    /// Index of the captured local `id` in the upvalues of function `level`
    fn upvalue_index(&mut self, level: usize, id: LocalId) -> usize {
        if let Some(idx) = self.funcs[level].upvals.iter().position(|&u| u == id) {
            return idx;
        }
        if level == 0 {
            return 0;
        }
        let capture = match self.funcs[level - 1].locals.get(&id) {
            Some(&slot) => Capture::Local(slot),
            None => Capture::Upvalue(self.upvalue_index(level - 1, id)),
        };
        let fs = &mut self.funcs[level];
        fs.upvals.push(id);
        fs.proto.captures.push(capture);
        fs.upvals.len() - 1
    }

    // ---- statements ----

    fn block(&mut self, block: &Block) {
        let start = self.depth();
        self.statements(&block.stats);
        self.close_to(start);
    }

    fn close_to(&mut self, depth: usize) {
        if self.depth() > depth {
            self.emit(OpCode::SetTop, depth as i32, 0, 0);
            self.set_depth(depth);
        }
    }

    fn statements(&mut self, stats: &[Stat]) {
        for stat in stats {
            self.statement(stat);
        }
    }

    /// Bind `id` to `slot`, moving it into a cell when a closure captures it
    fn declare(&mut self, id: LocalId, slot: usize) {
        self.fs().locals.insert(id, slot);
        if self.captured(id) {
            self.emit(OpCode::BoxLocal, slot as i32, 0, 0);
        }
    }

    fn statement(&mut self, stat: &Stat) {
        match stat {
            Stat::Call(call) => {
                self.set_line(call.line);
                self.call(call, 0);
            }
            Stat::Assign { targets, values, line } => {
                self.set_line(*line);
                self.assign(targets, values);
            }
            Stat::Local { names, values, line } => {
                self.set_line(*line);
                let base = self.depth();
                self.expr_list(values, names.len() as i32);
                for (i, &id) in names.iter().enumerate() {
                    self.declare(id, base + i);
                }
            }
            Stat::LocalFunction { name, func } => {
                self.set_line(func.line);
                let slot = self.depth();
                self.fs().locals.insert(*name, slot);
                if self.captured(*name) {
                    self.emit(OpCode::LoadNil, 1, 0, 0);
                    self.grow(1);
                    self.emit(OpCode::BoxLocal, slot as i32, 0, 0);
                    self.closure(func);
                    self.emit(OpCode::SetCell, slot as i32, 0, 0);
                    self.shrink(1);
                } else {
                    self.closure(func);
                }
            }
            Stat::Do(block) => self.block(block),
            Stat::While { cond, body, line } => {
                self.set_line(*line);
                let top = self.pc();
                self.expr(cond);
                let exit = self.emit(OpCode::JumpIfFalse, 0, 0, 0);
                self.shrink(1);
                self.enter_loop();
                self.block(body);
                self.emit(OpCode::Jump, top as i32, 0, 0);
                self.patch_here(exit);
                self.leave_loop();
            }
            Stat::Repeat { body, cond, line } => {
                self.set_line(*line);
                let start = self.depth();
                let top = self.pc();
                self.enter_loop();
                self.statements(&body.stats);
                self.expr(cond);
                let done = self.emit(OpCode::JumpIfTrue, 0, 0, 0);
                self.shrink(1);
                self.close_to(start);
                self.emit(OpCode::Jump, top as i32, 0, 0);
                // the exit path still carries the body's locals
                self.patch_here(done);
                self.emit(OpCode::SetTop, start as i32, 0, 0);
                self.set_depth(start);
                self.leave_loop();
            }
            Stat::If { arms, otherwise, line } => {
                self.set_line(*line);
                let mut ends = Vec::new();
                for (i, (cond, body)) in arms.iter().enumerate() {
                    self.expr(cond);
                    let next = self.emit(OpCode::JumpIfFalse, 0, 0, 0);
                    self.shrink(1);
                    self.block(body);
                    if i + 1 < arms.len() || otherwise.is_some() {
                        ends.push(self.emit(OpCode::Jump, 0, 0, 0));
                    }
                    self.patch_here(next);
                }
                if let Some(body) = otherwise {
                    self.block(body);
                }
                for pc in ends {
                    self.patch_here(pc);
                }
            }
            Stat::NumericFor { var, start, limit, step, body, line } => {
                self.set_line(*line);
                let base = self.depth();
                self.expr(start);
                self.expr(limit);
                match step {
                    Some(step) => self.expr(step),
                    None => {
                        let k = self.constant(Constant::Number(1.0));
                        self.emit(OpCode::LoadK, k, 0, 0);
                        self.grow(1);
                    }
                }
                let prep = self.emit(OpCode::ForPrep, base as i32, 0, 0);
                self.set_depth(base + 4);
                let body_start = self.pc();
                self.declare(*var, base + 3);
                self.enter_loop_at(base);
                self.block(body);
                self.set_line(*line);
                self.emit(OpCode::ForLoop, base as i32, body_start as i32, 0);
                self.patch_here(prep);
                self.leave_loop();
                self.emit(OpCode::SetTop, base as i32, 0, 0);
                self.set_depth(base);
            }
            Stat::GenericFor { vars, exprs, body, line } => {
                self.set_line(*line);
                let base = self.depth();
                self.expr_list(exprs, 3);
                let top = self.pc();
                for i in 0..3 {
                    self.emit(OpCode::GetLocal, (base + i) as i32, 0, 0);
                }
                self.grow(3);
                let call_pc = self.emit(OpCode::Call, (base + 3) as i32, 2, vars.len() as i32);
                self.fs().proto.call_names.push(CallName {
                    pc: call_pc,
                    namewhat: "for iterator".into(),
                    name: "for iterator".into(),
                });
                self.set_depth(base + 3 + vars.len());
                let test = self.emit(OpCode::TForTest, base as i32, 0, 0);
                for (i, &id) in vars.iter().enumerate() {
                    self.declare(id, base + 3 + i);
                }
                self.enter_loop_at(base);
                self.block(body);
                self.emit(OpCode::SetTop, (base + 3) as i32, 0, 0);
                self.emit(OpCode::Jump, top as i32, 0, 0);
                self.patch_here(test);
                self.leave_loop();
                self.emit(OpCode::SetTop, base as i32, 0, 0);
                self.set_depth(base);
            }
            Stat::Return { values, line } => {
                self.set_line(*line);
                let base = self.depth();
                let multi = values.last().map_or(false, Expr::is_multi);
                if multi {
                    self.expr_list(values, -1);
                    self.emit(OpCode::Return, base as i32, -1, 0);
                } else {
                    self.expr_list(values, values.len() as i32);
                    self.emit(OpCode::Return, base as i32, values.len() as i32, 0);
                }
                self.set_depth(base);
            }
            Stat::Break { line } => {
                self.set_line(*line);
                let depth = match self.fs().loops.last() {
                    Some(l) => l.depth,
                    None => return,
                };
                self.emit(OpCode::SetTop, depth as i32, 0, 0);
                let jump = self.emit(OpCode::Jump, 0, 0, 0);
                if let Some(l) = self.fs().loops.last_mut() {
                    l.breaks.push(jump);
                }
            }
        }
    }

    fn enter_loop(&mut self) {
        let depth = self.depth();
        self.enter_loop_at(depth);
    }

    fn enter_loop_at(&mut self, depth: usize) {
        self.fs().loops.push(LoopState {
            depth,
            breaks: Vec::new(),
        });
    }

    /// Patch the breaks of the innermost loop to the current position
    fn leave_loop(&mut self) {
        if let Some(l) = self.fs().loops.pop() {
            for pc in l.breaks {
                self.patch_here(pc);
            }
        }
    }

    fn assign(&mut self, targets: &[Expr], values: &[Expr]) {
        let base = self.depth();
        let mut slots = Vec::with_capacity(targets.len());
        for target in targets {
            if let Expr::Index(obj, key, line) = target {
                self.set_line(*line);
                self.expr(obj);
                self.expr(key);
                let depth = self.depth();
                slots.push(Some((depth - 2, depth - 1)));
            } else {
                slots.push(None);
            }
        }
        self.expr_list(values, targets.len() as i32);
        for (target, slot) in targets.iter().zip(slots).rev() {
            match (target, slot) {
                (_, Some((t, k))) => {
                    self.emit(OpCode::SetTable, t as i32, k as i32, 0);
                }
                (Expr::Local(id), None) => {
                    let slot = self.fs().locals[id] as i32;
                    let op = if self.captured(*id) { OpCode::SetCell } else { OpCode::SetLocal };
                    self.emit(op, slot, 0, 0);
                }
                (Expr::Upvalue(id), None) => {
                    let level = self.funcs.len() - 1;
                    let idx = self.upvalue_index(level, *id);
                    self.emit(OpCode::SetUpval, idx as i32, 0, 0);
                }
                (Expr::Global(name), None) => {
                    let k = self.string_constant(name.as_bytes());
                    self.emit(OpCode::SetGlobal, k, 0, 0);
                }
                _ => {}
            }
            self.shrink(1);
        }
        self.close_to(base);
    }

    // ---- expressions ----

    /// Push exactly `want` values for `exprs` (`-1`: every value)
    fn expr_list(&mut self, exprs: &[Expr], want: i32) {
        let base = self.depth();
        let count = exprs.len();
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == count && expr.is_multi() {
                let need = if want < 0 { -1 } else { (want - i as i32).max(0) };
                self.multi(expr, need);
                if want < 0 {
                    return;
                }
            } else {
                self.expr(expr);
            }
        }
        if want < 0 {
            return;
        }
        let have = self.depth() - base;
        let want = want as usize;
        if have < want {
            self.emit(OpCode::LoadNil, (want - have) as i32, 0, 0);
            self.grow(want - have);
        } else if have > want {
            self.close_to(base + want);
        }
    }

    /// Push `want` values from a call or `...` (`-1`: all of them)
    fn multi(&mut self, expr: &Expr, want: i32) {
        match expr {
            Expr::Call(call) => self.call(call, want),
            Expr::Vararg => {
                self.emit(OpCode::Vararg, want, 0, 0);
                if want > 0 {
                    self.grow(want as usize);
                }
            }
            other => self.expr(other),
        }
    }

    fn call(&mut self, call: &CallExpr, results: i32) {
        let fslot = self.depth();
        self.expr(&call.func);
        let mut nargs = 0;
        if let Some(method) = &call.method {
            let k = self.string_constant(method.as_bytes());
            self.emit(OpCode::SelfOp, k, 0, 0);
            self.grow(1);
            nargs = 1;
        }
        let multi = call.args.last().map_or(false, Expr::is_multi);
        self.expr_list(&call.args, if multi { -1 } else { call.args.len() as i32 });
        let nargs = if multi { -1 } else { nargs + call.args.len() as i32 };
        self.set_line(call.line);
        let pc = self.emit(OpCode::Call, fslot as i32, nargs, results);
        if let Some((namewhat, name)) = self.call_name(call) {
            self.fs().proto.call_names.push(CallName {
                pc,
                namewhat: namewhat.into(),
                name,
            });
        }
        self.set_depth(fslot + results.max(0) as usize);
    }

    fn name_load(&mut self, pc: usize, id: LocalId) {
        let name = self.local_name(id);
        self.fs().proto.var_names.push(VarName { pc, name });
    }

    fn call_name(&self, call: &CallExpr) -> Option<(&'static str, String)> {
        if let Some(method) = &call.method {
            return Some(("method", method.clone()));
        }
        match &call.func {
            Expr::Global(name) => Some(("global", name.clone())),
            Expr::Local(id) => Some(("local", self.local_name(*id))),
            Expr::Upvalue(id) => Some(("upvalue", self.local_name(*id))),
            Expr::Index(_, key, _) => match key.as_ref() {
                Expr::Str(k) => Some(("field", String::from_utf8_lossy(k).into_owned())),
                _ => None,
            },
            _ => None,
        }
    }

    fn closure(&mut self, body: &FuncBody) {
        let proto = self.function(body, false);
        let fs = self.fs();
        fs.proto.protos.push(Rc::new(proto));
        let idx = fs.proto.protos.len() - 1;
        self.set_line(body.line);
        self.emit(OpCode::Closure, idx as i32, 0, 0);
        self.grow(1);
    }

    /// Push the value of one expression
    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Nil => {
                self.emit(OpCode::LoadNil, 1, 0, 0);
                self.grow(1);
            }
            Expr::True => {
                self.emit(OpCode::LoadTrue, 0, 0, 0);
                self.grow(1);
            }
            Expr::False => {
                self.emit(OpCode::LoadFalse, 0, 0, 0);
                self.grow(1);
            }
            Expr::Number(n) => {
                let k = self.constant(Constant::Number(*n));
                self.emit(OpCode::LoadK, k, 0, 0);
                self.grow(1);
            }
            Expr::Str(s) => {
                let k = self.string_constant(s);
                self.emit(OpCode::LoadK, k, 0, 0);
                self.grow(1);
            }
            Expr::Vararg => self.multi(expr, 1),
            Expr::Function(body) => self.closure(body),
            Expr::Table(items, line) => {
                self.set_line(*line);
                self.table(items);
            }
            Expr::Local(id) => {
                let slot = self.fs().locals[id] as i32;
                let op = if self.captured(*id) { OpCode::GetCell } else { OpCode::GetLocal };
                let pc = self.emit(op, slot, 0, 0);
                self.name_load(pc, *id);
                self.grow(1);
            }
            Expr::Upvalue(id) => {
                let level = self.funcs.len() - 1;
                let idx = self.upvalue_index(level, *id);
                let pc = self.emit(OpCode::GetUpval, idx as i32, 0, 0);
                self.name_load(pc, *id);
                self.grow(1);
            }
            Expr::Global(name) => {
                let k = self.string_constant(name.as_bytes());
                self.emit(OpCode::GetGlobal, k, 0, 0);
                self.grow(1);
            }
            Expr::Index(obj, key, line) => {
                self.expr(obj);
                self.set_line(*line);
                if let Expr::Str(s) = key.as_ref() {
                    let k = self.string_constant(s);
                    self.emit(OpCode::GetField, k, 0, 0);
                } else {
                    self.expr(key);
                    self.set_line(*line);
                    self.emit(OpCode::GetTable, 0, 0, 0);
                    self.shrink(1);
                }
            }
            Expr::Call(call) => self.call(call, 1),
            Expr::Binary(op, left, right, line) => self.binary(*op, left, right, *line),
            Expr::Unary(op, operand, line) => {
                self.expr(operand);
                self.set_line(*line);
                let op = match op {
                    UnOp::Neg => OpCode::Unm,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                };
                self.emit(op, 0, 0, 0);
            }
            Expr::Paren(inner) => self.expr(inner),
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr, line: u32) {
        match op {
            BinOp::And | BinOp::Or => {
                self.expr(left);
                self.set_line(line);
                let jump_op = if op == BinOp::And { OpCode::AndJump } else { OpCode::OrJump };
                let jump = self.emit(jump_op, 0, 0, 0);
                self.shrink(1);
                self.expr(right);
                self.patch_here(jump);
            }
            BinOp::Concat => {
                let mut operands = vec![left];
                let mut rest = right;
                while let Expr::Binary(BinOp::Concat, l, r, _) = rest {
                    operands.push(l.as_ref());
                    rest = r.as_ref();
                }
                operands.push(rest);
                for operand in &operands {
                    self.expr(operand);
                }
                self.set_line(line);
                self.emit(OpCode::Concat, operands.len() as i32, 0, 0);
                self.shrink(operands.len() - 1);
            }
            _ => {
                self.expr(left);
                self.expr(right);
                self.set_line(line);
                let (code, swap) = match op {
                    BinOp::Add => (OpCode::Add, 0),
                    BinOp::Sub => (OpCode::Sub, 0),
                    BinOp::Mul => (OpCode::Mul, 0),
                    BinOp::Div => (OpCode::Div, 0),
                    BinOp::Mod => (OpCode::Mod, 0),
                    BinOp::Pow => (OpCode::Pow, 0),
                    BinOp::Eq | BinOp::Ne => (OpCode::Eq, 0),
                    BinOp::Lt => (OpCode::Lt, 0),
                    BinOp::Le => (OpCode::Le, 0),
                    BinOp::Gt => (OpCode::Lt, 1),
                    BinOp::Ge => (OpCode::Le, 1),
                    BinOp::And | BinOp::Or | BinOp::Concat => return,
                };
                self.emit(code, swap, 0, 0);
                self.shrink(1);
                if op == BinOp::Ne {
                    self.emit(OpCode::Not, 0, 0, 0);
                }
            }
        }
    }

    fn table(&mut self, items: &[TableItem]) {
        let narr = items.iter().filter(|i| matches!(i, TableItem::Positional(_))).count();
        let nrec = items.len() - narr;
        let tslot = self.depth() as i32;
        self.emit(OpCode::NewTable, narr as i32, nrec as i32, 0);
        self.grow(1);

        let mut pending = 0usize;
        let mut next_index = 1i32;
        let count = items.len();
        for (i, item) in items.iter().enumerate() {
            match item {
                TableItem::Keyed(key, value) => {
                    self.expr(key);
                    self.expr(value);
                    self.emit(OpCode::InitField, tslot, 0, 0);
                    self.shrink(2);
                }
                TableItem::Positional(value) => {
                    if i + 1 == count && value.is_multi() {
                        self.multi(value, -1);
                        self.emit(OpCode::SetList, tslot, -1, next_index);
                        self.set_depth(tslot as usize + 1);
                        return;
                    }
                    self.expr(value);
                    pending += 1;
                    if pending == FIELDS_PER_FLUSH {
                        self.emit(OpCode::SetList, tslot, pending as i32, next_index);
                        self.shrink(pending);
                        next_index += pending as i32;
                        pending = 0;
                    }
                }
            }
        }
        if pending > 0 {
            self.emit(OpCode::SetList, tslot, pending as i32, next_index);
            self.shrink(pending);
        }
    }
}
