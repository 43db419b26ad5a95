//! Chunk loading from readers, files and precompiled form

use std::io::Write;

use luastate::config::parse_config_file;
use luastate::{ChunkReader, State, Status};
use tempfile::NamedTempFile;

/// Reader handing out a fixed number of bytes per call
struct Pieces {
    data: Vec<u8>,
    pos: usize,
    step: usize,
    calls: usize,
}

impl ChunkReader for Pieces {
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        self.calls += 1;
        let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// Reader that never produces anything
struct Silent;

impl ChunkReader for Silent {
    fn read_chunk(&mut self, _buf: &mut [u8]) -> usize {
        0
    }
}

const PROGRAM: &str = r#"
local function fib(n)
    if n < 2 then return n end
    return fib(n - 1) + fib(n - 2)
end
local words = {}
for i = 1, 5 do words[#words + 1] = "w" .. i end
return fib(15), #words, words[5]
"#;

fn results(state: &mut State) -> (i64, i64, String) {
    state.call(0, 3).unwrap();
    let out = (
        state.to_integer(-3),
        state.to_integer(-2),
        state.to_string(-1).unwrap_or_default(),
    );
    state.pop(3);
    out
}

#[test]
fn test_buffering_is_transparent() {
    let mut blob = State::new();
    blob.load_buffer(PROGRAM.as_bytes(), "=program").unwrap();
    let expected = results(&mut blob);
    assert_eq!(expected, (610, 5, "w5".to_string()));

    let mut streamed = State::new();
    let mut reader = Pieces {
        data: PROGRAM.as_bytes().to_vec(),
        pos: 0,
        step: 7,
        calls: 0,
    };
    streamed.load(&mut reader, 4, "=program").unwrap();
    assert!(reader.calls > PROGRAM.len() / 4);
    assert_eq!(results(&mut streamed), expected);
}

#[test]
fn test_silent_reader_fails() {
    let mut state = State::new();
    state.push_integer(1);
    let err = state.load(&mut Silent, 64, "=silent").unwrap_err();
    assert_ne!(err.status(), Status::Ok);
    assert_eq!(err.status(), Status::ReaderFailure);
    assert_eq!(state.get_top(), 2);
    assert_eq!(state.to_string(-1), Some(err.to_string()));
}

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(PROGRAM.as_bytes()).unwrap();
    let mut state = State::new();
    state.load_file(file.path()).unwrap();
    assert_eq!(results(&mut state), (610, 5, "w5".to_string()));
}

#[test]
fn test_file_errors_name_the_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "local x = 1").unwrap();
    write!(file, "return x +").unwrap();
    let mut state = State::new();
    let err = state.load_file(file.path()).unwrap_err();
    assert_eq!(err.status(), Status::SyntaxError);
    let name = file.path().file_name().unwrap().to_string_lossy().into_owned();
    assert!(err.to_string().contains(&name), "{}", err);
    assert!(err.to_string().contains(":2:"), "{}", err);
}

#[test]
fn test_precompiled_round_trip_through_file() {
    let mut state = State::new();
    state.load_buffer(PROGRAM.as_bytes(), "=program").unwrap();
    let mut file = NamedTempFile::new().unwrap();
    state.dump(file.as_file_mut()).unwrap();
    state.pop(1);

    state.load_file(file.path()).unwrap();
    assert_eq!(results(&mut state), (610, 5, "w5".to_string()));
}

#[test]
fn test_precompiled_digest_mismatch() {
    let mut state = State::new();
    state.load_buffer(b"return 'payload'", "=p").unwrap();
    let mut chunk: Vec<u8> = Vec::new();
    state.dump(&mut chunk).unwrap();
    state.pop(1);

    // flip a byte inside the stored digest
    chunk[8] ^= 0x01;
    let err = state.load_buffer(&chunk, "=tampered").unwrap_err();
    assert_eq!(err.status(), Status::SyntaxError);
    assert_eq!(err.to_string(), "tampered: checksum mismatch in precompiled chunk");
    assert_eq!(state.get_top(), 1);
}

#[test]
fn test_config_from_file_limits_memory() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "memory-limit 256kb").unwrap();
    writeln!(file, "call-depth 100").unwrap();
    let config = parse_config_file(file.path()).unwrap();
    assert_eq!(config.limits.call_depth, 100);

    let mut state = State::with_config(config).unwrap();
    state
        .load_buffer(b"local t = {} for i = 1, 1e6 do t[i] = i end", "=hog")
        .unwrap();
    let err = state.pcall(0, 0, 0).unwrap_err();
    assert_eq!(err.status(), Status::OutOfMemory);
    assert_eq!(state.to_string(-1).as_deref(), Some("not enough memory"));
}

#[test]
fn test_code_after_block_comment_loads() {
    let mut state = State::new();
    for (source, expected) in [
        ("--[[a]] local x = 6 return x", 6),
        ("return --[[a]] 7", 7),
        ("--[[ block\n]] return 1", 1),
        ("--[==[ x ]==] return 2 --[[ trailing ]]", 2),
    ] {
        state.load_buffer(source.as_bytes(), "=c").unwrap();
        state.call(0, 1).unwrap();
        assert_eq!(state.to_integer(-1), expected, "{}", source);
        state.pop(1);
    }
}

#[test]
fn test_deep_nesting_is_a_syntax_error() {
    let mut state = State::new();
    let source = format!("return {}1{}", "(".repeat(10_000), ")".repeat(10_000));
    let err = state.load_buffer(source.as_bytes(), "=deep").unwrap_err();
    assert_eq!(err.status(), Status::SyntaxError);
    assert_eq!(err.to_string(), "deep:1: chunk has too many syntax levels");
    assert_eq!(state.to_string(-1), Some(err.to_string()));
}
