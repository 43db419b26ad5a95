//! Lexer for Lua 5.1
//!
//! The lexer pulls one byte at a time from a [`ByteSource`], so source text
//! never has to be held in memory as a whole.

use crate::error::{LuaError, Result};
use crate::vm::number::{format_number, parse_number};

/// A pull-based source of chunk bytes
pub trait ByteSource {
    /// The next byte, or `None` at the end of the chunk
    fn next_byte(&mut self) -> Option<u8>;
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn next_byte(&mut self) -> Option<u8> {
        (**self).next_byte()
    }
}

/// Byte source over an in-memory slice
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceSource { bytes, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = self.bytes.get(self.pos).copied();
        self.pos += 1;
        b
    }
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    // Literals
    Name(String),
    Str(Vec<u8>),
    Number(f64),

    // Keywords
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Assign,
    Concat,
    Dots,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semi,
    Colon,
    Comma,
    Dot,

    /// A byte that starts no token
    Other(u8),

    Eof,
}

impl Tok {
    /// Text used when a token is quoted in an error message
    pub fn text(&self) -> String {
        let fixed = match self {
            Tok::Name(s) => return s.clone(),
            Tok::Str(b) => return String::from_utf8_lossy(b).into_owned(),
            Tok::Number(n) => return format_number(*n),
            Tok::Other(c) => return (*c as char).to_string(),
            Tok::And => "and",
            Tok::Break => "break",
            Tok::Do => "do",
            Tok::Else => "else",
            Tok::Elseif => "elseif",
            Tok::End => "end",
            Tok::False => "false",
            Tok::For => "for",
            Tok::Function => "function",
            Tok::If => "if",
            Tok::In => "in",
            Tok::Local => "local",
            Tok::Nil => "nil",
            Tok::Not => "not",
            Tok::Or => "or",
            Tok::Repeat => "repeat",
            Tok::Return => "return",
            Tok::Then => "then",
            Tok::True => "true",
            Tok::Until => "until",
            Tok::While => "while",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::Caret => "^",
            Tok::Hash => "#",
            Tok::Eq => "==",
            Tok::Ne => "~=",
            Tok::Le => "<=",
            Tok::Ge => ">=",
            Tok::Lt => "<",
            Tok::Gt => ">",
            Tok::Assign => "=",
            Tok::Concat => "..",
            Tok::Dots => "...",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Semi => ";",
            Tok::Colon => ":",
            Tok::Comma => ",",
            Tok::Dot => ".",
            Tok::Eof => "<eof>",
        };
        fixed.to_string()
    }
}

fn keyword(name: &str) -> Option<Tok> {
    Some(match name {
        "and" => Tok::And,
        "break" => Tok::Break,
        "do" => Tok::Do,
        "else" => Tok::Else,
        "elseif" => Tok::Elseif,
        "end" => Tok::End,
        "false" => Tok::False,
        "for" => Tok::For,
        "function" => Tok::Function,
        "if" => Tok::If,
        "in" => Tok::In,
        "local" => Tok::Local,
        "nil" => Tok::Nil,
        "not" => Tok::Not,
        "or" => Tok::Or,
        "repeat" => Tok::Repeat,
        "return" => Tok::Return,
        "then" => Tok::Then,
        "true" => Tok::True,
        "until" => Tok::Until,
        "while" => Tok::While,
        _ => return None,
    })
}

/// A token with the line it started on
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

/// The lexer
pub struct Lexer<S: ByteSource> {
    src: S,

    /// Current byte (one byte of lookahead)
    current: Option<u8>,

    /// Current line
    line: u32,

    /// Chunk id used in messages
    chunk: String,

    /// Text of the token being read, for messages
    buf: Vec<u8>,
}

fn is_newline(c: Option<u8>) -> bool {
    matches!(c, Some(b'\n') | Some(b'\r'))
}

fn is_name_char(c: Option<u8>) -> bool {
    matches!(c, Some(b) if b.is_ascii_alphanumeric() || b == b'_')
}

impl<S: ByteSource> Lexer<S> {
    /// Create a new lexer
    pub fn new(mut src: S, chunk: impl Into<String>) -> Self {
        let current = src.next_byte();
        Lexer {
            src,
            current,
            line: 1,
            chunk: chunk.into(),
            buf: Vec::new(),
        }
    }

    /// Current line number
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Chunk id used in messages
    pub fn chunk(&self) -> &str {
        &self.chunk
    }

    /// Build a syntax error at the current line
    pub fn error(&self, msg: &str, near: Option<&str>) -> LuaError {
        match near {
            Some(near) => LuaError::Syntax(format!("{}:{}: {} near '{}'", self.chunk, self.line, msg, near)),
            None => LuaError::Syntax(format!("{}:{}: {}", self.chunk, self.line, msg)),
        }
    }

    fn lex_error(&self, msg: &str) -> LuaError {
        let near = if self.current.is_none() && self.buf.is_empty() {
            "<eof>".to_string()
        } else {
            String::from_utf8_lossy(&self.buf).into_owned()
        };
        self.error(msg, Some(&near))
    }

    fn advance(&mut self) {
        self.current = self.src.next_byte();
    }

    fn save_and_advance(&mut self) {
        if let Some(c) = self.current {
            self.buf.push(c);
        }
        self.advance();
    }

    /// Skip a newline sequence (`\n`, `\r`, `\r\n` or `\n\r`)
    fn inc_line(&mut self) {
        let old = self.current;
        self.advance();
        if is_newline(self.current) && self.current != old {
            self.advance();
        }
        self.line += 1;
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            // comments leave their delimiters behind
            self.buf.clear();
            let line = self.line;
            let tok = match self.current {
                None => Tok::Eof,
                Some(b'\n') | Some(b'\r') => {
                    self.inc_line();
                    continue;
                }
                Some(b' ') | Some(b'\t') | Some(0x0b) | Some(0x0c) => {
                    self.advance();
                    continue;
                }
                Some(b'-') => {
                    self.advance();
                    if self.current != Some(b'-') {
                        Tok::Minus
                    } else {
                        self.advance();
                        self.skip_comment()?;
                        continue;
                    }
                }
                Some(b'[') => {
                    let sep = self.skip_sep();
                    if sep >= 0 {
                        Tok::Str(self.read_long_string(sep as usize, false)?)
                    } else if sep == -1 {
                        Tok::LBracket
                    } else {
                        return Err(self.lex_error("invalid long string delimiter"));
                    }
                }
                Some(b'=') => self.one_or_two(b'=', Tok::Assign, Tok::Eq),
                Some(b'<') => self.one_or_two(b'=', Tok::Lt, Tok::Le),
                Some(b'>') => self.one_or_two(b'=', Tok::Gt, Tok::Ge),
                Some(b'~') => self.one_or_two(b'=', Tok::Other(b'~'), Tok::Ne),
                Some(q @ b'"') | Some(q @ b'\'') => Tok::Str(self.read_string(q)?),
                Some(b'.') => {
                    self.save_and_advance();
                    if self.current == Some(b'.') {
                        self.advance();
                        if self.current == Some(b'.') {
                            self.advance();
                            Tok::Dots
                        } else {
                            Tok::Concat
                        }
                    } else if matches!(self.current, Some(c) if c.is_ascii_digit()) {
                        Tok::Number(self.read_numeral()?)
                    } else {
                        Tok::Dot
                    }
                }
                Some(c) if c.is_ascii_digit() => Tok::Number(self.read_numeral()?),
                Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                    while is_name_char(self.current) {
                        self.save_and_advance();
                    }
                    let name = String::from_utf8_lossy(&self.buf).into_owned();
                    keyword(&name).unwrap_or(Tok::Name(name))
                }
                Some(c) => {
                    self.advance();
                    match c {
                        b'+' => Tok::Plus,
                        b'*' => Tok::Star,
                        b'/' => Tok::Slash,
                        b'%' => Tok::Percent,
                        b'^' => Tok::Caret,
                        b'#' => Tok::Hash,
                        b'(' => Tok::LParen,
                        b')' => Tok::RParen,
                        b']' => Tok::RBracket,
                        b'{' => Tok::LBrace,
                        b'}' => Tok::RBrace,
                        b';' => Tok::Semi,
                        b':' => Tok::Colon,
                        b',' => Tok::Comma,
                        other => Tok::Other(other),
                    }
                }
            };
            return Ok(Token { tok, line });
        }
    }

    fn one_or_two(&mut self, second: u8, one: Tok, two: Tok) -> Tok {
        self.advance();
        if self.current == Some(second) {
            self.advance();
            two
        } else {
            one
        }
    }

    fn skip_comment(&mut self) -> Result<()> {
        if self.current == Some(b'[') {
            let sep = self.skip_sep();
            self.buf.clear();
            if sep >= 0 {
                self.read_long_string(sep as usize, true)?;
                return Ok(());
            }
        }
        while self.current.is_some() && !is_newline(self.current) {
            self.advance();
        }
        Ok(())
    }

    /// Count `=` between brackets; `-1` when the second bracket is absent
    fn skip_sep(&mut self) -> i32 {
        let bracket = self.current;
        self.save_and_advance();
        let mut count = 0;
        while self.current == Some(b'=') {
            self.save_and_advance();
            count += 1;
        }
        if self.current == bracket {
            count
        } else {
            -count - 1
        }
    }

    fn read_long_string(&mut self, sep: usize, comment: bool) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        // second opening bracket
        self.save_and_advance();
        if is_newline(self.current) {
            self.inc_line();
        }
        loop {
            match self.current {
                None => {
                    let msg = if comment { "unfinished long comment" } else { "unfinished long string" };
                    return Err(self.error(msg, Some("<eof>")));
                }
                Some(b']') => {
                    let count = self.skip_sep();
                    if count == sep as i32 {
                        self.save_and_advance();
                        break;
                    }
                    if !comment {
                        content.push(b']');
                        let eqs = if count >= 0 { count } else { -count - 1 };
                        content.extend(std::iter::repeat(b'=').take(eqs as usize));
                    }
                }
                Some(b'\n') | Some(b'\r') => {
                    if !comment {
                        content.push(b'\n');
                    }
                    self.inc_line();
                }
                Some(c) => {
                    if !comment {
                        content.push(c);
                    }
                    self.advance();
                }
            }
        }
        Ok(content)
    }

    fn read_string(&mut self, delim: u8) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.save_and_advance();
        loop {
            match self.current {
                None => return Err(self.error("unfinished string", Some("<eof>"))),
                Some(b'\n') | Some(b'\r') => return Err(self.lex_error("unfinished string")),
                Some(c) if c == delim => {
                    self.save_and_advance();
                    break;
                }
                Some(b'\\') => {
                    self.save_and_advance();
                    let escaped = match self.current {
                        None => continue,
                        Some(b'a') => 7,
                        Some(b'b') => 8,
                        Some(b'f') => 12,
                        Some(b'n') => b'\n',
                        Some(b'r') => b'\r',
                        Some(b't') => b'\t',
                        Some(b'v') => 11,
                        Some(b'\n') | Some(b'\r') => {
                            content.push(b'\n');
                            self.inc_line();
                            continue;
                        }
                        Some(d) if d.is_ascii_digit() => {
                            let mut value: u32 = 0;
                            let mut digits = 0;
                            while digits < 3 {
                                match self.current {
                                    Some(d) if d.is_ascii_digit() => {
                                        value = value * 10 + (d - b'0') as u32;
                                        self.save_and_advance();
                                        digits += 1;
                                    }
                                    _ => break,
                                }
                            }
                            if value > 255 {
                                return Err(self.lex_error("escape sequence too large"));
                            }
                            content.push(value as u8);
                            continue;
                        }
                        Some(other) => other,
                    };
                    content.push(escaped);
                    self.save_and_advance();
                }
                Some(c) => {
                    content.push(c);
                    self.save_and_advance();
                }
            }
        }
        Ok(content)
    }

    fn read_numeral(&mut self) -> Result<f64> {
        while matches!(self.current, Some(c) if c.is_ascii_digit() || c == b'.') {
            self.save_and_advance();
        }
        if matches!(self.current, Some(b'e') | Some(b'E')) {
            self.save_and_advance();
            if matches!(self.current, Some(b'+') | Some(b'-')) {
                self.save_and_advance();
            }
        }
        while is_name_char(self.current) {
            self.save_and_advance();
        }
        parse_number(&self.buf).ok_or_else(|| self.lex_error("malformed number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Tok> {
        let mut lexer = Lexer::new(SliceSource::new(src.as_bytes()), "test");
        let mut out = Vec::new();
        loop {
            let t = lexer.next_token().unwrap();
            if t.tok == Tok::Eof {
                return out;
            }
            out.push(t.tok);
        }
    }

    #[test]
    fn test_operators_and_names() {
        assert_eq!(
            tokens("local x = a.b .. c ... ~= <= >= =="),
            vec![
                Tok::Local,
                Tok::Name("x".into()),
                Tok::Assign,
                Tok::Name("a".into()),
                Tok::Dot,
                Tok::Name("b".into()),
                Tok::Concat,
                Tok::Name("c".into()),
                Tok::Dots,
                Tok::Ne,
                Tok::Le,
                Tok::Ge,
                Tok::Eq,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("3 3.5 .5 1e2 0x10 2E-1"),
            vec![
                Tok::Number(3.0),
                Tok::Number(3.5),
                Tok::Number(0.5),
                Tok::Number(100.0),
                Tok::Number(16.0),
                Tok::Number(0.2),
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            tokens(r#""a\tb" 'q\'' "\65\066" "x\
y""#),
            vec![
                Tok::Str(b"a\tb".to_vec()),
                Tok::Str(b"q'".to_vec()),
                Tok::Str(b"AB".to_vec()),
                Tok::Str(b"x\ny".to_vec()),
            ]
        );
    }

    #[test]
    fn test_long_strings_and_comments() {
        assert_eq!(
            tokens("--[[ block\ncomment ]] [==[\nraw ]] text]==] -- line\nx"),
            vec![Tok::Str(b"raw ]] text".to_vec()), Tok::Name("x".into())]
        );
    }

    #[test]
    fn test_code_after_block_comment() {
        assert_eq!(
            tokens("--[[a]] local x = 6"),
            vec![Tok::Local, Tok::Name("x".into()), Tok::Assign, Tok::Number(6.0)]
        );
        assert_eq!(tokens("return --[[a]] 7"), vec![Tok::Return, Tok::Number(7.0)]);
        assert_eq!(tokens("--[==[ x ]==]name"), vec![Tok::Name("name".into())]);
    }

    #[test]
    fn test_line_counting() {
        let mut lexer = Lexer::new(SliceSource::new(b"a\r\nb\n\nc"), "test");
        assert_eq!(lexer.next_token().unwrap().line, 1);
        assert_eq!(lexer.next_token().unwrap().line, 2);
        assert_eq!(lexer.next_token().unwrap().line, 4);
    }

    #[test]
    fn test_errors() {
        let mut lexer = Lexer::new(SliceSource::new(b"x = \"open"), "=src");
        lexer.next_token().unwrap();
        lexer.next_token().unwrap();
        let err = lexer.next_token().unwrap_err();
        assert_eq!(err.to_string(), "=src:1: unfinished string near '<eof>'");

        let mut lexer = Lexer::new(SliceSource::new(b"3x"), "c");
        let err = lexer.next_token().unwrap_err();
        assert!(err.to_string().contains("malformed number near '3x'"));
    }
}
