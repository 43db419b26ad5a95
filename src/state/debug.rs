//! Frame introspection
//!
//! Level 0 is the running function, level 1 its caller and so on.

use super::State;
use crate::compiler::chunk_id;
use crate::vm::heap::{FrameKind, FunctionKind, LuaHeap};
use crate::vm::proto::{Constant, OpCode, Proto};
use crate::vm::value::{FunctionHandle, Value};

/// Description of one activation record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Debug {
    /// Name the function was called by, when it can be told
    pub name: Option<String>,

    /// "global", "local", "method", "field", "upvalue" or empty
    pub namewhat: String,

    /// "Lua", "C" for host functions, or "main" for a chunk
    pub what: String,

    pub source: String,

    /// Printable chunk name
    pub short_src: String,

    /// Line being executed, -1 when not known
    pub current_line: i32,

    /// Number of upvalues
    pub nups: usize,

    pub line_defined: i32,

    pub last_line_defined: i32,

    /// Frame this record was taken from
    frame: Option<usize>,
}

fn constant_text(proto: &Proto, k: i32) -> Option<String> {
    match proto.constants.get(k as usize)? {
        Constant::Str(s) => Some(String::from_utf8_lossy(s).into_owned()),
        Constant::Number(_) => None,
    }
}

/// Line of the instruction a frame is executing
fn frame_line(proto: &Proto, pc: usize) -> i32 {
    proto
        .line_at(pc.saturating_sub(1))
        .map_or(-1, |l| l as i32)
}

impl State {
    /// Record for the frame at `level`, or `None` past the outermost frame
    pub fn get_stack(&self, level: usize) -> Option<Debug> {
        let heap = self.heap();
        let frames = &heap.thread(self.thread).frames;
        let index = frames.len().checked_sub(level + 1)?;
        Some(Debug {
            frame: Some(index),
            current_line: -1,
            line_defined: -1,
            last_line_defined: -1,
            ..Debug::default()
        })
    }

    /// Fill fields of `ar` selected by the characters of `what`
    ///
    /// `n` name, `S` source, `l` current line, `u` upvalue count, `f` push
    /// the function. A leading `>` describes the function on top of the
    /// stack instead of a frame, popping it. Returns `false` for an unknown
    /// option or a record that names no frame.
    pub fn get_info(&mut self, what: &str, ar: &mut Debug) -> bool {
        let (options, function, frame) = match what.strip_prefix('>') {
            Some(rest) => match self.pop_value() {
                Value::Function(f) => (rest, f, None),
                other => panic!("function expected, got {}", other.type_name()),
            },
            None => {
                let index = match ar.frame {
                    Some(i) => i,
                    None => return false,
                };
                let closure = {
                    let heap = self.heap();
                    match heap.thread(self.thread).frames.get(index) {
                        Some(frame) => frame.closure(),
                        None => return false,
                    }
                };
                (what, closure, Some(index))
            }
        };

        let mut ok = true;
        for option in options.chars() {
            match option {
                'S' => self.describe_source(function, ar),
                'l' => {
                    ar.current_line = frame.map_or(-1, |i| self.frame_current_line(i));
                }
                'u' => {
                    let heap = self.heap();
                    ar.nups = match &heap.function(function).kind {
                        FunctionKind::Lua { upvalues, .. } => upvalues.len(),
                        FunctionKind::Host { upvalues, .. } => upvalues.len(),
                    };
                }
                'n' => {
                    let named = frame.and_then(|i| self.frame_call_name(i));
                    match named {
                        Some((namewhat, name)) => {
                            ar.namewhat = namewhat;
                            ar.name = Some(name);
                        }
                        None => {
                            ar.namewhat = String::new();
                            ar.name = None;
                        }
                    }
                }
                'f' => self.push(Value::Function(function)),
                _ => ok = false,
            }
        }
        ok
    }

    fn describe_source(&self, function: FunctionHandle, ar: &mut Debug) {
        let heap = self.heap();
        match &heap.function(function).kind {
            FunctionKind::Lua { proto, .. } => {
                ar.source = proto.source.clone();
                ar.short_src = chunk_id(&proto.source);
                ar.what = if proto.line_defined == 0 { "main" } else { "Lua" }.into();
                ar.line_defined = proto.line_defined as i32;
                ar.last_line_defined = proto.last_line_defined as i32;
            }
            FunctionKind::Host { .. } => {
                ar.source = "=[C]".into();
                ar.short_src = "[C]".into();
                ar.what = "C".into();
                ar.line_defined = -1;
                ar.last_line_defined = -1;
            }
        }
    }

    fn frame_current_line(&self, index: usize) -> i32 {
        let heap = self.heap();
        match heap.thread(self.thread).frames.get(index).map(|f| &f.kind) {
            Some(FrameKind::Lua(lua)) => frame_line(&lua.proto, lua.pc),
            _ => -1,
        }
    }

    /// How the caller of frame `index` named it
    fn frame_call_name(&self, index: usize) -> Option<(String, String)> {
        let heap = self.heap();
        let caller = heap.thread(self.thread).frames.get(index.checked_sub(1)?)?;
        let lua = caller.lua()?;
        let name = lua.proto.call_name_at(lua.pc.checked_sub(1)?)?;
        Some((name.namewhat.clone(), name.name.clone()))
    }

    /// `chunk:line: ` of the Lua function at `level`, empty for host frames
    ///
    /// Host functions use this to give errors a position, as `error` does.
    pub fn location(&self, level: usize) -> String {
        let heap = self.heap();
        let frames = &heap.thread(self.thread).frames;
        let frame = match frames.len().checked_sub(level + 1) {
            Some(i) => &frames[i],
            None => return String::new(),
        };
        match &frame.kind {
            FrameKind::Lua(lua) => format!(
                "{}:{}: ",
                chunk_id(&lua.proto.source),
                frame_line(&lua.proto, lua.pc)
            ),
            FrameKind::Host { .. } => String::new(),
        }
    }

    /// Name of the operand of the instruction being executed
    ///
    /// Known for called functions and for objects indexed right after they
    /// were read from a global or a field.
    pub(crate) fn operand_name(&self) -> Option<String> {
        let heap = self.heap();
        operand_name(&heap, self)
    }
}

fn operand_name(heap: &LuaHeap, state: &State) -> Option<String> {
    let lua = heap.thread(state.thread).frames.last()?.lua()?;
    let pc = lua.pc.checked_sub(1)?;
    let proto = &lua.proto;
    let ins = proto.code.get(pc)?;
    match ins.op {
        OpCode::Call => proto
            .call_name_at(pc)
            .filter(|n| n.namewhat != "for iterator")
            .map(|n| format!("{} '{}'", n.namewhat, n.name)),
        OpCode::GetField | OpCode::SelfOp => loaded_name(proto, pc.checked_sub(1)?, pc),
        OpCode::GetTable => {
            // the key must be a single push for the object to sit right below it
            let key = pc.checked_sub(1)?;
            let single = matches!(
                proto.code.get(key)?.op,
                OpCode::LoadK
                    | OpCode::LoadTrue
                    | OpCode::LoadFalse
                    | OpCode::GetLocal
                    | OpCode::GetCell
                    | OpCode::GetUpval
                    | OpCode::GetGlobal
            );
            if !single || proto.is_jump_target(key) || proto.is_jump_target(pc) {
                return None;
            }
            loaded_name(proto, key.checked_sub(1)?, key)
        }
        _ => None,
    }
}

/// Describe the value pushed at `producer`, consumed by the instruction at `consumer`
fn loaded_name(proto: &Proto, producer: usize, consumer: usize) -> Option<String> {
    if proto.is_jump_target(consumer) {
        return None;
    }
    let prev = proto.code.get(producer)?;
    let (kind, name) = match prev.op {
        OpCode::GetGlobal => ("global", constant_text(proto, prev.a)?),
        OpCode::GetField => ("field", constant_text(proto, prev.a)?),
        OpCode::GetLocal | OpCode::GetCell => ("local", proto.var_name_at(producer)?.to_string()),
        OpCode::GetUpval => ("upvalue", proto.var_name_at(producer)?.to_string()),
        _ => return None,
    };
    Some(format!("{} '{}'", kind, name))
}
