//! Source compiler
//!
//! Source text flows through the [`lexer`] into the [`parser`], which
//! resolves every name, and [`codegen`] turns the tree into a [`Proto`].

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;

use std::rc::Rc;

use crate::error::Result;
use crate::vm::proto::Proto;
use lexer::ByteSource;

/// Longest chunk id shown in messages
pub const ID_SIZE: usize = 60;

/// Compile Lua source pulled from `src`
///
/// `source` is the chunk name as given by the host; messages use the
/// shortened form produced by [`chunk_id`].
pub fn compile<S: ByteSource>(src: S, source: &str) -> Result<Rc<Proto>> {
    let chunk = parser::parse_chunk(src, &chunk_id(source))?;
    Ok(codegen::generate(&chunk, source))
}

/// Printable form of a chunk name
///
/// `=name` is used verbatim, `@file` names a file and keeps its tail when
/// too long, anything else is the source text itself and is shown as
/// `[string "first line..."]`.
pub fn chunk_id(source: &str) -> String {
    if let Some(name) = source.strip_prefix('=') {
        return name.chars().take(ID_SIZE - 1).collect();
    }
    if let Some(file) = source.strip_prefix('@') {
        let room = ID_SIZE - " '...' ".len() - 1;
        let chars: Vec<char> = file.chars().collect();
        if chars.len() > room {
            let tail: String = chars[chars.len() - room..].iter().collect();
            return format!("...{}", tail);
        }
        return file.to_string();
    }
    let room = ID_SIZE - " [string \"...\"] ".len() - 1;
    let first_line: String = source.chars().take_while(|&c| c != '\n' && c != '\r').collect();
    let truncated = first_line.chars().count() > room || first_line.len() < source.len();
    let shown: String = first_line.chars().take(room).collect();
    if truncated {
        format!("[string \"{}...\"]", shown)
    } else {
        format!("[string \"{}\"]", shown)
    }
}
