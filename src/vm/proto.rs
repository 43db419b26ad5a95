//! Compiled functions: opcodes, instructions and prototypes
//!
//! The VM is a stack machine. Locals occupy fixed slots at the bottom of a
//! frame and expression temporaries are pushed above them; the compiler
//! tracks the operand depth statically, so instruction operands that name
//! slots are offsets from the frame base.

use std::rc::Rc;

/// VM opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Push `a` nils
    LoadNil = 0,
    LoadTrue = 1,
    LoadFalse = 2,
    /// Push constant `a`
    LoadK = 3,
    /// Push `a` varargs, or all of them when `a` is -1
    Vararg = 4,
    GetLocal = 5,
    SetLocal = 6,
    /// Move local `a` into a fresh cell so closures can share it
    BoxLocal = 7,
    GetCell = 8,
    SetCell = 9,
    GetUpval = 10,
    SetUpval = 11,
    GetGlobal = 12,
    SetGlobal = 13,
    /// Pop key and table, push `table[key]`
    GetTable = 14,
    /// Pop table, push `table[constant a]`
    GetField = 15,
    /// Pop a value and store it into `slot a [slot b]`
    SetTable = 16,
    /// Pop value and key, raw-set them into the table in slot `a`
    InitField = 17,
    /// Pop `b` values (-1: up to top) into the table in slot `a` from index `c`
    SetList = 18,
    NewTable = 19,
    /// Replace the object on top with `object[constant a]`, object
    SelfOp = 20,
    Add = 21,
    Sub = 22,
    Mul = 23,
    Div = 24,
    Mod = 25,
    Pow = 26,
    Unm = 27,
    Not = 28,
    Len = 29,
    /// Concatenate the top `a` values
    Concat = 30,
    Eq = 31,
    /// Less than; operands swapped when `a` is 1
    Lt = 32,
    Le = 33,
    Jump = 34,
    JumpIfFalse = 35,
    JumpIfTrue = 36,
    /// Keep the top and jump when it is false, otherwise pop it
    AndJump = 37,
    /// Keep the top and jump when it is true, otherwise pop it
    OrJump = 38,
    /// Call slot `a` with `b` arguments (-1: up to top) wanting `c` results (-1: all)
    Call = 39,
    /// Return `b` values starting at slot `a` (-1: up to top)
    Return = 40,
    SetTop = 41,
    Closure = 42,
    /// Numeric for setup: control slots at `a`, exit target `b`
    ForPrep = 43,
    /// Numeric for step: control slots at `a`, body target `b`
    ForLoop = 44,
    /// Generic for test: control slots at `a`, exit target `b`
    TForTest = 45,
}

impl OpCode {
    /// Decode an opcode byte
    pub fn from_u8(value: u8) -> Option<OpCode> {
        use OpCode::*;
        const ALL: [OpCode; 46] = [
            LoadNil, LoadTrue, LoadFalse, LoadK, Vararg, GetLocal, SetLocal, BoxLocal, GetCell,
            SetCell, GetUpval, SetUpval, GetGlobal, SetGlobal, GetTable, GetField, SetTable,
            InitField, SetList, NewTable, SelfOp, Add, Sub, Mul, Div, Mod, Pow, Unm, Not, Len,
            Concat, Eq, Lt, Le, Jump, JumpIfFalse, JumpIfTrue, AndJump, OrJump, Call, Return,
            SetTop, Closure, ForPrep, ForLoop, TForTest,
        ];
        ALL.get(value as usize).copied()
    }
}

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
}

impl Instruction {
    pub fn new(op: OpCode, a: i32, b: i32, c: i32) -> Self {
        Instruction { op, a, b, c }
    }
}

/// A constant operand
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    Str(Vec<u8>),
}

/// Where a closure finds a captured variable when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Cell of a local slot in the creating frame
    Local(usize),
    /// Upvalue of the creating closure
    Upvalue(usize),
}

/// How the callee of a call instruction was named in source
#[derive(Debug, Clone, PartialEq)]
pub struct CallName {
    /// Program counter of the call instruction
    pub pc: usize,

    /// "global", "local", "method", "field" or "upvalue"
    pub namewhat: String,

    pub name: String,
}

/// Source name of the variable an instruction loads
#[derive(Debug, Clone, PartialEq)]
pub struct VarName {
    /// Program counter of the `GetLocal`, `GetCell` or `GetUpval`
    pub pc: usize,

    pub name: String,
}

/// Function prototype (compiled bytecode)
#[derive(Debug, Clone, Default)]
pub struct Proto {
    pub code: Vec<Instruction>,

    /// Source line of each instruction
    pub lines: Vec<u32>,

    pub constants: Vec<Constant>,

    /// Nested function prototypes
    pub protos: Vec<Rc<Proto>>,

    /// Variables captured by closures of this prototype
    pub captures: Vec<Capture>,

    pub call_names: Vec<CallName>,

    /// Names of loaded locals and upvalues, ordered by pc
    pub var_names: Vec<VarName>,

    pub num_params: usize,

    pub is_vararg: bool,

    /// Highest operand depth reached
    pub max_stack: usize,

    /// Chunk name the function was loaded from
    pub source: String,

    pub line_defined: u32,

    pub last_line_defined: u32,
}

impl Proto {
    /// Source line of the instruction at `pc`
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }

    /// Name recorded for the call instruction at `pc`
    pub fn call_name_at(&self, pc: usize) -> Option<&CallName> {
        self.call_names
            .binary_search_by_key(&pc, |n| n.pc)
            .ok()
            .map(|i| &self.call_names[i])
    }

    /// Name of the variable loaded by the instruction at `pc`
    pub fn var_name_at(&self, pc: usize) -> Option<&str> {
        self.var_names
            .binary_search_by_key(&pc, |n| n.pc)
            .ok()
            .map(|i| self.var_names[i].name.as_str())
    }

    /// Whether any jump lands on `pc`
    pub fn is_jump_target(&self, pc: usize) -> bool {
        let target = pc as i32;
        self.code.iter().any(|ins| match ins.op {
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::AndJump | OpCode::OrJump => {
                ins.a == target
            }
            OpCode::ForPrep | OpCode::ForLoop | OpCode::TForTest => ins.b == target,
            _ => false,
        })
    }

    /// Estimated bytes held by this prototype and its children
    pub fn footprint(&self) -> usize {
        let constants: usize = self
            .constants
            .iter()
            .map(|k| match k {
                Constant::Number(_) => std::mem::size_of::<Constant>(),
                Constant::Str(s) => std::mem::size_of::<Constant>() + s.len(),
            })
            .sum();
        let children: usize = self.protos.iter().map(|p| p.footprint()).sum();
        std::mem::size_of::<Proto>()
            + self.code.len() * (std::mem::size_of::<Instruction>() + std::mem::size_of::<u32>())
            + constants
            + children
    }

    /// Check operands of a prototype that did not come from the compiler
    pub fn verify(&self) -> std::result::Result<(), String> {
        if self.code.is_empty() || self.lines.len() != self.code.len() {
            return Err("truncated code".into());
        }
        if !matches!(self.code[self.code.len() - 1].op, OpCode::Return | OpCode::Jump) {
            return Err("code does not end in a return".into());
        }
        if self.num_params > self.max_stack {
            return Err("bad parameter count".into());
        }
        let nconst = self.constants.len() as i32;
        let ncode = self.code.len() as i32;
        let slot_ok = |s: i32| s >= 0 && (s as usize) < self.max_stack.max(1) + 3;
        for (pc, ins) in self.code.iter().enumerate() {
            let ok = match ins.op {
                OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::GetField | OpCode::SelfOp => {
                    ins.a >= 0 && ins.a < nconst
                }
                OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::BoxLocal
                | OpCode::GetCell
                | OpCode::SetCell
                | OpCode::InitField
                | OpCode::SetList
                | OpCode::Return
                | OpCode::SetTop => slot_ok(ins.a),
                OpCode::SetTable => slot_ok(ins.a) && slot_ok(ins.b),
                OpCode::Call => slot_ok(ins.a) && ins.b >= -1 && ins.c >= -1,
                OpCode::GetUpval | OpCode::SetUpval => ins.a >= 0 && (ins.a as usize) < self.captures.len(),
                OpCode::Closure => ins.a >= 0 && (ins.a as usize) < self.protos.len(),
                OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::JumpIfTrue
                | OpCode::AndJump
                | OpCode::OrJump => ins.a >= 0 && ins.a < ncode,
                OpCode::ForPrep | OpCode::ForLoop | OpCode::TForTest => {
                    slot_ok(ins.a) && ins.b >= 0 && ins.b < ncode
                }
                OpCode::LoadNil | OpCode::Vararg | OpCode::Concat | OpCode::NewTable => ins.a >= -1,
                _ => true,
            };
            if !ok {
                return Err(format!("bad operand at instruction {}", pc));
            }
        }
        for proto in &self.protos {
            for capture in &proto.captures {
                let ok = match *capture {
                    Capture::Local(slot) => slot < self.max_stack.max(1) + 3,
                    Capture::Upvalue(idx) => idx < self.captures.len(),
                };
                if !ok {
                    return Err("bad capture".into());
                }
            }
            proto.verify()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_decoding() {
        for byte in 0..=45u8 {
            let op = OpCode::from_u8(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert_eq!(OpCode::from_u8(46), None);
    }

    #[test]
    fn test_verify_rejects_bad_constant() {
        let proto = Proto {
            code: vec![
                Instruction::new(OpCode::LoadK, 3, 0, 0),
                Instruction::new(OpCode::Return, 0, 0, 0),
            ],
            lines: vec![1, 1],
            max_stack: 1,
            ..Proto::default()
        };
        assert!(proto.verify().is_err());
    }

    #[test]
    fn test_call_name_lookup() {
        let proto = Proto {
            call_names: vec![
                CallName { pc: 2, namewhat: "global".into(), name: "print".into() },
                CallName { pc: 7, namewhat: "method".into(), name: "push".into() },
            ],
            ..Proto::default()
        };
        assert_eq!(proto.call_name_at(7).unwrap().name, "push");
        assert!(proto.call_name_at(3).is_none());
    }

    #[test]
    fn test_var_names_and_jump_targets() {
        let proto = Proto {
            code: vec![
                Instruction::new(OpCode::GetLocal, 0, 0, 0),
                Instruction::new(OpCode::OrJump, 3, 0, 0),
                Instruction::new(OpCode::GetUpval, 0, 0, 0),
                Instruction::new(OpCode::Return, 0, 1, 0),
            ],
            var_names: vec![
                VarName { pc: 0, name: "a".into() },
                VarName { pc: 2, name: "up".into() },
            ],
            ..Proto::default()
        };
        assert_eq!(proto.var_name_at(2), Some("up"));
        assert_eq!(proto.var_name_at(1), None);
        assert!(proto.is_jump_target(3));
        assert!(!proto.is_jump_target(2));
    }
}
