//! Chunk loading
//!
//! Bytes are pulled from a [`ChunkReader`] through a fixed buffer owned by
//! the loader. A reader reports the end of input and a failure the same
//! way, by producing no bytes; a reader that fails part way through looks
//! like a short chunk and normally ends in a syntax error.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::rc::Rc;

use tracing::debug;

use super::State;
use crate::compiler::lexer::{ByteSource, SliceSource};
use crate::compiler::{chunk_id, compile};
use crate::error::{LuaError, Result};
use crate::vm::heap::FunctionKind;
use crate::vm::proto::Proto;
use crate::vm::value::Value;

/// First byte of a precompiled chunk
pub(crate) const BINARY_MARK: u8 = 0x1B;

/// A pull-style producer of chunk bytes
pub trait ChunkReader {
    /// Fill `buf` from the start and return the number of bytes written
    ///
    /// Returning 0 ends the chunk; it is also how a failure is reported.
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize;
}

impl<R: Read> ChunkReader for R {
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        loop {
            match self.read(buf) {
                Ok(n) => return n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return 0,
            }
        }
    }
}

/// Buffered byte stream over a [`ChunkReader`]
pub struct ChunkStream<'r> {
    reader: &'r mut dyn ChunkReader,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,

    /// Bytes received from the reader so far
    received: usize,

    finished: bool,
}

impl<'r> ChunkStream<'r> {
    /// A stream reading `bufsize` bytes at a time (at least one)
    pub fn new(reader: &'r mut dyn ChunkReader, bufsize: usize) -> Self {
        ChunkStream {
            reader,
            buf: vec![0; bufsize.max(1)].into_boxed_slice(),
            pos: 0,
            len: 0,
            received: 0,
            finished: false,
        }
    }

    fn fill(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let n = self.reader.read_chunk(&mut self.buf).min(self.buf.len());
        if n == 0 {
            self.finished = true;
            return false;
        }
        self.pos = 0;
        self.len = n;
        self.received += n;
        true
    }

    /// The next byte without consuming it
    pub fn peek(&mut self) -> Option<u8> {
        if self.pos == self.len && !self.fill() {
            return None;
        }
        Some(self.buf[self.pos])
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

impl ByteSource for ChunkStream<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }
}

/// Reader over a file that hides a leading `#` line, keeping its newline
struct SkipShebang {
    file: io::BufReader<File>,
    checked: bool,
}

impl Read for SkipShebang {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.checked {
            self.checked = true;
            let mut first = [0u8; 1];
            let n = self.file.read(&mut first)?;
            if n == 0 {
                return Ok(0);
            }
            if first[0] == b'#' {
                let mut byte = [0u8; 1];
                while self.file.read(&mut byte)? == 1 {
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                if buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = b'\n';
                return Ok(1);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            buf[0] = first[0];
            return Ok(1);
        }
        self.file.read(buf)
    }
}

impl State {
    /// Load a chunk without running it
    ///
    /// On success the chunk's function is pushed, with the thread's globals
    /// as its environment. On failure the error message is pushed instead:
    /// a syntax error for bad source or a bad precompiled chunk, an
    /// out-of-memory error past the memory limit, and a reader error when
    /// the reader produced no bytes at all.
    pub fn load(&mut self, reader: &mut dyn ChunkReader, bufsize: usize, chunkname: &str) -> Result<()> {
        let mut stream = ChunkStream::new(reader, bufsize);
        let compiled = match stream.peek() {
            None => Err(LuaError::Reader(format!(
                "{}: no data from the chunk reader",
                chunk_id(chunkname)
            ))),
            Some(BINARY_MARK) => super::dump::undump(&mut stream, chunkname),
            Some(_) => compile(&mut stream, chunkname),
        };
        let received = stream.received();
        match compiled {
            Ok(proto) => self.push_chunk(proto, chunkname, received),
            Err(err) => {
                debug!(env = %self.env.id, chunk = chunkname, status = %err.status(), "chunk rejected");
                self.push_string(&err.to_string());
                Err(err)
            }
        }
    }

    fn push_chunk(&mut self, proto: Rc<Proto>, chunkname: &str, received: usize) -> Result<()> {
        let handle = {
            let mut heap = self.heap_mut();
            let globals = heap.thread(self.thread).globals;
            let upvalues = proto.captures.iter().map(|_| heap.new_cell(Value::Nil)).collect();
            heap.new_function(FunctionKind::Lua { proto, upvalues }, globals)
        };
        self.push(Value::Function(handle));
        if let Err(err) = self.gc_check() {
            self.pop(1);
            self.push_string(&err.to_string());
            return Err(err);
        }
        debug!(env = %self.env.id, chunk = chunkname, bytes = received, "chunk loaded");
        Ok(())
    }

    /// Load source text; the text is also the chunk name
    pub fn load_string(&mut self, source: &str) -> Result<()> {
        self.load_buffer(source.as_bytes(), source)
    }

    /// Load a chunk held in memory
    ///
    /// An empty buffer is a valid chunk with an empty body.
    pub fn load_buffer(&mut self, bytes: &[u8], chunkname: &str) -> Result<()> {
        if bytes.is_empty() {
            return match compile(SliceSource::new(bytes), chunkname) {
                Ok(proto) => self.push_chunk(proto, chunkname, 0),
                Err(err) => {
                    self.push_string(&err.to_string());
                    Err(err)
                }
            };
        }
        let mut reader = bytes;
        self.load(&mut reader, bytes.len(), chunkname)
    }

    /// Load a file, named `@path` in messages
    ///
    /// A first line starting with `#` is skipped.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let chunkname = format!("@{}", path.display());
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                let err = LuaError::Reader(format!("cannot open {}: {}", path.display(), e));
                self.push_string(&err.to_string());
                return Err(err);
            }
        };
        let mut reader = SkipShebang {
            file: io::BufReader::new(file),
            checked: false,
        };
        self.load(&mut reader, 8192, &chunkname)
    }
}
