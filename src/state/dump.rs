//! Precompiled chunks
//!
//! Layout: the signature `ESC "Lua"`, a version byte, a format byte, the
//! SHA-1 digest of the body, the body length (u32 little endian) and the
//! body. The body holds the function prototype tree; all integers are
//! little endian.

use std::io::Write;
use std::rc::Rc;

use sha1::{Digest, Sha1};
use tracing::debug;

use super::State;
use crate::compiler::chunk_id;
use crate::compiler::lexer::ByteSource;
use crate::error::{LuaError, Result};
use crate::vm::heap::FunctionKind;
use crate::vm::proto::{CallName, Capture, Constant, Instruction, OpCode, Proto, VarName};
use crate::vm::value::Value;

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x51;
const FORMAT: u8 = 0;
const DIGEST_LEN: usize = 20;
const MAX_NESTING: usize = 200;

impl State {
    /// Write the Lua function on top of the stack as a precompiled chunk
    ///
    /// The function stays on the stack. Upvalue values are not saved; a
    /// loaded copy starts with all upvalues nil.
    pub fn dump(&mut self, writer: &mut dyn Write) -> Result<()> {
        let proto = match self.value_opt(-1) {
            Some(Value::Function(f)) => match &self.heap().function(f).kind {
                FunctionKind::Lua { proto, .. } => Some(proto.clone()),
                FunctionKind::Host { .. } => None,
            },
            _ => None,
        };
        let proto = proto.ok_or_else(|| LuaError::runtime("unable to dump given function"))?;

        let mut body = Vec::new();
        write_proto(&mut body, &proto);
        let digest = Sha1::digest(&body);

        let mut chunk = Vec::with_capacity(body.len() + 30);
        chunk.extend_from_slice(SIGNATURE);
        chunk.push(VERSION);
        chunk.push(FORMAT);
        chunk.extend_from_slice(&digest);
        chunk.extend_from_slice(&(body.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&body);
        writer
            .write_all(&chunk)
            .map_err(|e| LuaError::runtime(format!("cannot write chunk: {}", e)))?;
        debug!(env = %self.env.id, bytes = chunk.len(), digest = %hex::encode(digest), "function dumped");
        Ok(())
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn write_proto(out: &mut Vec<u8>, proto: &Proto) {
    put_bytes(out, proto.source.as_bytes());
    put_u32(out, proto.line_defined);
    put_u32(out, proto.last_line_defined);
    put_u32(out, proto.num_params as u32);
    out.push(proto.is_vararg as u8);
    put_u32(out, proto.max_stack as u32);

    put_u32(out, proto.code.len() as u32);
    for (ins, line) in proto.code.iter().zip(&proto.lines) {
        out.push(ins.op as u8);
        out.extend_from_slice(&ins.a.to_le_bytes());
        out.extend_from_slice(&ins.b.to_le_bytes());
        out.extend_from_slice(&ins.c.to_le_bytes());
        put_u32(out, *line);
    }

    put_u32(out, proto.constants.len() as u32);
    for k in &proto.constants {
        match k {
            Constant::Number(n) => {
                out.push(0);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Str(s) => {
                out.push(1);
                put_bytes(out, s);
            }
        }
    }

    put_u32(out, proto.captures.len() as u32);
    for capture in &proto.captures {
        let (tag, idx) = match *capture {
            Capture::Local(slot) => (0, slot),
            Capture::Upvalue(idx) => (1, idx),
        };
        out.push(tag);
        put_u32(out, idx as u32);
    }

    put_u32(out, proto.call_names.len() as u32);
    for name in &proto.call_names {
        put_u32(out, name.pc as u32);
        put_bytes(out, name.namewhat.as_bytes());
        put_bytes(out, name.name.as_bytes());
    }

    put_u32(out, proto.var_names.len() as u32);
    for var in &proto.var_names {
        put_u32(out, var.pc as u32);
        put_bytes(out, var.name.as_bytes());
    }

    put_u32(out, proto.protos.len() as u32);
    for child in &proto.protos {
        write_proto(out, child);
    }
}

/// Read a precompiled chunk from `src`, whose first byte is the signature's
pub(crate) fn undump<S: ByteSource>(src: &mut S, chunkname: &str) -> Result<Rc<Proto>> {
    let bad = |why: &str| LuaError::syntax(format!("{}: {} in precompiled chunk", chunk_id(chunkname), why));

    let mut header = [0u8; 4 + 2 + DIGEST_LEN + 4];
    for b in header.iter_mut() {
        *b = src.next_byte().ok_or_else(|| bad("truncated header"))?;
    }
    if &header[..4] != SIGNATURE {
        return Err(bad("bad signature"));
    }
    if header[4] != VERSION {
        return Err(bad("version mismatch"));
    }
    if header[5] != FORMAT {
        return Err(bad("format mismatch"));
    }
    let expected = &header[6..6 + DIGEST_LEN];
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[6 + DIGEST_LEN..]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut body = Vec::new();
    while body.len() < len {
        match src.next_byte() {
            Some(b) => body.push(b),
            None => return Err(bad("truncated")),
        }
    }

    let actual = Sha1::digest(&body);
    if actual.as_slice() != expected {
        debug!(
            chunk = chunkname,
            expected = %hex::encode(expected),
            actual = %hex::encode(actual),
            "precompiled chunk digest mismatch"
        );
        return Err(bad("checksum mismatch"));
    }

    let mut reader = BodyReader { body: &body, pos: 0 };
    let proto = reader.proto(0).map_err(|why| bad(why))?;
    if reader.pos != body.len() {
        return Err(bad("trailing data"));
    }
    proto.verify().map_err(|why| bad(&why))?;
    Ok(Rc::new(proto))
}

struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
}

type Parse<T> = std::result::Result<T, &'static str>;

impl BodyReader<'_> {
    fn take(&mut self, n: usize) -> Parse<&[u8]> {
        if self.body.len() - self.pos < n {
            return Err("truncated");
        }
        let bytes = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Parse<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Parse<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn i32(&mut self) -> Parse<i32> {
        Ok(self.u32()? as i32)
    }

    fn f64(&mut self) -> Parse<f64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(buf))
    }

    /// An element count, bounded by the bytes left
    fn count(&mut self) -> Parse<usize> {
        let n = self.u32()? as usize;
        if n > self.body.len() - self.pos {
            return Err("bad count");
        }
        Ok(n)
    }

    fn bytes(&mut self) -> Parse<Vec<u8>> {
        let n = self.count()?;
        Ok(self.take(n)?.to_vec())
    }

    fn text(&mut self) -> Parse<String> {
        String::from_utf8(self.bytes()?).map_err(|_| "bad string")
    }

    fn proto(&mut self, depth: usize) -> Parse<Proto> {
        if depth > MAX_NESTING {
            return Err("too many nested functions");
        }
        let mut proto = Proto {
            source: self.text()?,
            line_defined: self.u32()?,
            last_line_defined: self.u32()?,
            num_params: self.u32()? as usize,
            is_vararg: self.u8()? != 0,
            max_stack: self.u32()? as usize,
            ..Proto::default()
        };

        let ncode = self.count()?;
        for _ in 0..ncode {
            let op = OpCode::from_u8(self.u8()?).ok_or("bad opcode")?;
            let (a, b, c) = (self.i32()?, self.i32()?, self.i32()?);
            proto.code.push(Instruction::new(op, a, b, c));
            proto.lines.push(self.u32()?);
        }

        let nconst = self.count()?;
        for _ in 0..nconst {
            let k = match self.u8()? {
                0 => Constant::Number(self.f64()?),
                1 => Constant::Str(self.bytes()?),
                _ => return Err("bad constant"),
            };
            proto.constants.push(k);
        }

        let ncapture = self.count()?;
        for _ in 0..ncapture {
            let capture = match self.u8()? {
                0 => Capture::Local(self.u32()? as usize),
                1 => Capture::Upvalue(self.u32()? as usize),
                _ => return Err("bad capture"),
            };
            proto.captures.push(capture);
        }

        let nnames = self.count()?;
        for _ in 0..nnames {
            proto.call_names.push(CallName {
                pc: self.u32()? as usize,
                namewhat: self.text()?,
                name: self.text()?,
            });
        }
        if proto.call_names.windows(2).any(|w| w[0].pc >= w[1].pc) {
            return Err("bad call names");
        }

        let nvars = self.count()?;
        for _ in 0..nvars {
            proto.var_names.push(VarName {
                pc: self.u32()? as usize,
                name: self.text()?,
            });
        }
        if proto.var_names.windows(2).any(|w| w[0].pc >= w[1].pc) {
            return Err("bad variable names");
        }

        let nprotos = self.count()?;
        for _ in 0..nprotos {
            let child = self.proto(depth + 1)?;
            proto.protos.push(Rc::new(child));
        }
        Ok(proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    fn dumped(state: &mut State, source: &str) -> Vec<u8> {
        state.load_buffer(source.as_bytes(), "=src").unwrap();
        let mut out: Vec<u8> = Vec::new();
        state.dump(&mut out).unwrap();
        state.pop(1);
        out
    }

    #[test]
    fn test_dump_and_reload() {
        let mut state = State::new();
        let chunk = dumped(&mut state, "local function sq(x) return x * x end\nreturn sq(7) + 1, 'done'");
        assert_eq!(&chunk[..4], b"\x1bLua");

        state.load_buffer(&chunk, "=bin").unwrap();
        state.call(0, 2).unwrap();
        assert_eq!(state.to_integer(1), 50);
        assert_eq!(state.to_string(2).as_deref(), Some("done"));
    }

    #[test]
    fn test_runtime_errors_keep_source_lines() {
        let mut state = State::new();
        let chunk = dumped(&mut state, "local t\n\nreturn t.x");
        state.load_buffer(&chunk, "=bin").unwrap();
        let err = state.pcall(0, 0, 0).unwrap_err();
        assert_eq!(err.to_string(), "src:3: attempt to index local 't' (a nil value)");
    }

    #[test]
    fn test_corrupted_body_rejected() {
        let mut state = State::new();
        let mut chunk = dumped(&mut state, "return 1");
        let last = chunk.len() - 1;
        chunk[last] ^= 0xFF;
        let err = state.load_buffer(&chunk, "=bin").unwrap_err();
        assert_eq!(err.status(), Status::SyntaxError);
        assert_eq!(err.to_string(), "bin: checksum mismatch in precompiled chunk");
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let mut state = State::new();
        let chunk = dumped(&mut state, "return 1");
        let err = state.load_buffer(&chunk[..chunk.len() - 3], "=bin").unwrap_err();
        assert_eq!(err.to_string(), "bin: truncated in precompiled chunk");
    }

    #[test]
    fn test_upvalues_start_nil() {
        let mut state = State::new();
        state.load_string("local x = 5 return function() return x end").unwrap();
        state.call(0, 1).unwrap();
        let mut chunk: Vec<u8> = Vec::new();
        state.dump(&mut chunk).unwrap();
        state.load_buffer(&chunk, "=inner").unwrap();
        state.call(0, 1).unwrap();
        assert!(state.is_nil(-1));
    }

    #[test]
    fn test_host_function_not_dumpable() {
        let mut state = State::new();
        state.push_host_function(Rc::new(|_: &mut State| Ok(0)));
        let mut sink: Vec<u8> = Vec::new();
        let err = state.dump(&mut sink).unwrap_err();
        assert_eq!(err.to_string(), "unable to dump given function");
        assert!(state.is_function(-1));
    }
}
