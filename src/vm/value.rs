//! Lua value representation using generational arena handles

use std::fmt;
use std::hash::{Hash, Hasher};

use super::arena::Handle;

/// Type-safe handle for interned strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringHandle(pub Handle);

/// Type-safe handle for tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle(pub Handle);

/// Type-safe handle for functions (Lua closures and host closures)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub Handle);

/// Type-safe handle for captured-variable cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellHandle(pub Handle);

/// Type-safe handle for full userdata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserdataHandle(pub Handle);

/// Type-safe handle for threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub Handle);

/// Identifier of a host callable in the environment's host registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(pub Handle);

/// Basic type tags, numbered as in the Lua 5.1 API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum LuaType {
    /// No value at the given index
    None = -1,
    Nil = 0,
    Boolean = 1,
    LightUserdata = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
}

impl LuaType {
    /// The name Lua uses for this type
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata | LuaType::Userdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
        }
    }

    /// Numeric tag of this type
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Core Lua value type
///
/// Composite values are handles into the heap; copying a value never
/// copies the object it refers to.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(StringHandle),
    Table(TableHandle),
    Function(FunctionHandle),
    Userdata(UserdataHandle),
    LightUserdata(usize),
    Thread(ThreadHandle),
}

impl Value {
    /// Get the type tag of this value
    pub fn type_of(&self) -> LuaType {
        match self {
            Value::Nil => LuaType::Nil,
            Value::Boolean(_) => LuaType::Boolean,
            Value::Number(_) => LuaType::Number,
            Value::String(_) => LuaType::String,
            Value::Table(_) => LuaType::Table,
            Value::Function(_) => LuaType::Function,
            Value::Userdata(_) => LuaType::Userdata,
            Value::LightUserdata(_) => LuaType::LightUserdata,
            Value::Thread(_) => LuaType::Thread,
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        self.type_of().name()
    }

    /// Lua truthiness: only nil and false are false
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Check if nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// The number held by this value, without string coercion
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// A pseudo address identifying the referenced object, 0 for plain values
    pub fn identity(&self) -> usize {
        let (tag, handle) = match self {
            Value::String(h) => (1, h.0),
            Value::Table(h) => (2, h.0),
            Value::Function(h) => (3, h.0),
            Value::Userdata(h) => (4, h.0),
            Value::Thread(h) => (5, h.0),
            Value::LightUserdata(p) => return *p,
            _ => return 0,
        };
        // Keep pseudo addresses in a recognisable, non-null range
        0x1000_0000usize
            .wrapping_add((handle.to_bits() as usize).wrapping_mul(64))
            .wrapping_add(tag * 8)
    }
}

/// Raw equality: no metamethods, strings compare by interned handle
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Userdata(a), Value::Userdata(b)) => a == b,
            (Value::LightUserdata(a), Value::LightUserdata(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            _ => false,
        }
    }
}

// NaN never becomes a table key, so equality is reflexive for every stored key.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => 0u8.hash(state),
            Value::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                2u8.hash(state);
                // 0.0 and -0.0 are the same key
                let n = if *n == 0.0 { 0.0f64 } else { *n };
                n.to_bits().hash(state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Table(t) => {
                4u8.hash(state);
                t.hash(state);
            }
            Value::Function(f) => {
                5u8.hash(state);
                f.hash(state);
            }
            Value::Userdata(u) => {
                6u8.hash(state);
                u.hash(state);
            }
            Value::LightUserdata(p) => {
                7u8.hash(state);
                p.hash(state);
            }
            Value::Thread(t) => {
                8u8.hash(state);
                t.hash(state);
            }
        }
    }
}
