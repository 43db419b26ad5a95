//! Error and status types
//!
//! Every failure that crosses the embedding boundary is reported as a
//! [`LuaError`]. Each error maps onto a numeric [`Status`] code that matches
//! the classic Lua 5.1 API, so hosts that only care about the category can
//! match on the status instead of the error itself.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

/// Result type for all state operations
pub type Result<T> = std::result::Result<T, LuaError>;

/// Errors surfaced by the state API
///
/// The `Display` text of an error is exactly the message that the failing
/// operation leaves on the stack.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LuaError {
    /// Error raised while running code (`error()`, type errors, failed host calls)
    #[error("{0}")]
    Runtime(String),

    /// Malformed source text or a bad precompiled chunk
    #[error("{0}")]
    Syntax(String),

    /// The environment exceeded its configured memory limit
    #[error("not enough memory")]
    Memory,

    /// The message handler of a protected call failed itself
    #[error("error in error handling")]
    ErrorHandling,

    /// The chunk reader produced no data at all
    #[error("{0}")]
    Reader(String),
}

impl LuaError {
    /// Create a runtime error from anything printable
    pub fn runtime(msg: impl Into<String>) -> Self {
        LuaError::Runtime(msg.into())
    }

    /// Create a syntax error from anything printable
    pub fn syntax(msg: impl Into<String>) -> Self {
        LuaError::Syntax(msg.into())
    }

    /// The status code this error is reported with
    pub fn status(&self) -> Status {
        match self {
            LuaError::Runtime(_) => Status::RuntimeError,
            LuaError::Syntax(_) => Status::SyntaxError,
            LuaError::Memory => Status::OutOfMemory,
            LuaError::ErrorHandling => Status::ErrorInErrorHandling,
            LuaError::Reader(_) => Status::ReaderFailure,
        }
    }

    /// The message carried by this error
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Outcome codes of protected operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// Success
    Ok = 0,

    /// The thread is suspended in a yield
    Yield = 1,

    /// Runtime error
    RuntimeError = 2,

    /// Syntax error during precompilation
    SyntaxError = 3,

    /// Memory allocation error
    OutOfMemory = 4,

    /// Error while running the message handler
    ErrorInErrorHandling = 5,

    /// The chunk reader failed to produce any bytes
    ReaderFailure = 6,
}

lazy_static! {
    static ref STATUS_DESCRIPTIONS: HashMap<Status, &'static str> = {
        let mut m = HashMap::new();
        m.insert(Status::Ok, "ok");
        m.insert(Status::Yield, "yield");
        m.insert(Status::RuntimeError, "run time error");
        m.insert(Status::SyntaxError, "syntax error");
        m.insert(Status::OutOfMemory, "out of memory");
        m.insert(Status::ErrorInErrorHandling, "error in error handling");
        m.insert(Status::ReaderFailure, "file error");
        m
    };
}

impl Status {
    /// Numeric code of this status
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a status by its numeric code
    pub fn from_code(code: i32) -> Option<Status> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Yield),
            2 => Some(Status::RuntimeError),
            3 => Some(Status::SyntaxError),
            4 => Some(Status::OutOfMemory),
            5 => Some(Status::ErrorInErrorHandling),
            6 => Some(Status::ReaderFailure),
            _ => None,
        }
    }

    /// Short human readable description
    pub fn description(self) -> &'static str {
        STATUS_DESCRIPTIONS.get(&self).copied().unwrap_or("unknown status")
    }

    /// Whether the status denotes a failure
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok | Status::Yield)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}
