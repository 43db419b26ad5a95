//! Abstract syntax tree
//!
//! Names are resolved while parsing: every local declaration gets a
//! [`LocalId`], and references say whether they read a local of the
//! current function, a variable captured from an enclosing one, or a
//! global.

/// Identity of a declared local variable, unique within a chunk
pub type LocalId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    True,
    False,
    Number(f64),
    Str(Vec<u8>),
    Vararg,
    Function(Box<FuncBody>),
    Table(Vec<TableItem>, u32),
    Local(LocalId),
    /// Local of an enclosing function
    Upvalue(LocalId),
    Global(String),
    Index(Box<Expr>, Box<Expr>, u32),
    Call(Box<CallExpr>),
    Binary(BinOp, Box<Expr>, Box<Expr>, u32),
    Unary(UnOp, Box<Expr>, u32),
    /// Parenthesized expression, truncated to one value
    Paren(Box<Expr>),
}

impl Expr {
    /// Whether the expression can produce several values
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call(_) | Expr::Vararg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableItem {
    Positional(Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub func: Expr,

    /// Method name for `obj:name(...)` calls
    pub method: Option<String>,

    pub args: Vec<Expr>,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Left and right binding power
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::Concat => (5, 4),
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9),
        }
    }
}

/// Binding power of unary operators
pub const UNARY_PRIORITY: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    pub params: Vec<LocalId>,
    pub is_vararg: bool,
    pub body: Block,
    pub line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stats: Vec<Stat>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stat {
    Call(CallExpr),
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
        line: u32,
    },
    Local {
        names: Vec<LocalId>,
        values: Vec<Expr>,
        line: u32,
    },
    LocalFunction {
        name: LocalId,
        func: FuncBody,
    },
    Do(Block),
    While {
        cond: Expr,
        body: Block,
        line: u32,
    },
    Repeat {
        body: Block,
        cond: Expr,
        line: u32,
    },
    If {
        arms: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
        line: u32,
    },
    NumericFor {
        var: LocalId,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        line: u32,
    },
    GenericFor {
        vars: Vec<LocalId>,
        exprs: Vec<Expr>,
        body: Block,
        line: u32,
    },
    Return {
        values: Vec<Expr>,
        line: u32,
    },
    Break {
        line: u32,
    },
}

/// A parsed chunk with its resolution tables
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// The main function (vararg, no parameters)
    pub main: FuncBody,

    /// Source name of each local, by id
    pub local_names: Vec<String>,

    /// Whether a closure captures each local, by id
    pub captured: Vec<bool>,
}
