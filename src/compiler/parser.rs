//! Recursive descent parser for Lua 5.1
//!
//! Produces a [`Chunk`] whose variable references are already resolved to
//! locals, captured variables or globals.

use super::ast::*;
use super::lexer::{ByteSource, Lexer, Tok, Token};
use crate::error::{LuaError, Result};

/// Deepest nesting of statements and expressions a chunk may use
pub const MAX_SYNTAX_LEVELS: usize = 200;

/// Scope information for the function being parsed
struct FuncScope {
    /// Active locals, innermost last
    actives: Vec<(String, LocalId)>,

    /// Length of `actives` at the start of each open block
    blocks: Vec<usize>,

    is_vararg: bool,

    /// Enclosing loops, for `break`
    loops: usize,
}

/// The parser
pub struct Parser<S: ByteSource> {
    lexer: Lexer<S>,
    current: Token,
    ahead: Option<Token>,

    /// Line of the last consumed token
    last_line: u32,

    funcs: Vec<FuncScope>,
    local_names: Vec<String>,
    captured: Vec<bool>,

    /// Current syntactic nesting, bounded by [`MAX_SYNTAX_LEVELS`]
    level: usize,
}

/// Parse a whole chunk
pub fn parse_chunk<S: ByteSource>(src: S, chunk: &str) -> Result<Chunk> {
    let mut parser = Parser::new(Lexer::new(src, chunk))?;
    parser.chunk()
}

fn block_follow(tok: &Tok) -> bool {
    matches!(tok, Tok::Else | Tok::Elseif | Tok::End | Tok::Until | Tok::Eof)
}

fn binary_op(tok: &Tok) -> Option<BinOp> {
    Some(match tok {
        Tok::Plus => BinOp::Add,
        Tok::Minus => BinOp::Sub,
        Tok::Star => BinOp::Mul,
        Tok::Slash => BinOp::Div,
        Tok::Percent => BinOp::Mod,
        Tok::Caret => BinOp::Pow,
        Tok::Concat => BinOp::Concat,
        Tok::Eq => BinOp::Eq,
        Tok::Ne => BinOp::Ne,
        Tok::Lt => BinOp::Lt,
        Tok::Le => BinOp::Le,
        Tok::Gt => BinOp::Gt,
        Tok::Ge => BinOp::Ge,
        Tok::And => BinOp::And,
        Tok::Or => BinOp::Or,
        _ => return None,
    })
}

fn unary_op(tok: &Tok) -> Option<UnOp> {
    match tok {
        Tok::Minus => Some(UnOp::Neg),
        Tok::Not => Some(UnOp::Not),
        Tok::Hash => Some(UnOp::Len),
        _ => None,
    }
}

impl<S: ByteSource> Parser<S> {
    /// Create a parser positioned on the first token
    pub fn new(mut lexer: Lexer<S>) -> Result<Self> {
        let current = lexer.next_token()?;
        Ok(Parser {
            lexer,
            current,
            ahead: None,
            last_line: 1,
            funcs: Vec::new(),
            local_names: Vec::new(),
            captured: Vec::new(),
            level: 0,
        })
    }

    // ---- token helpers ----

    fn next(&mut self) -> Result<()> {
        self.last_line = self.current.line;
        self.current = match self.ahead.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        Ok(())
    }

    fn peek_ahead(&mut self) -> Result<&Tok> {
        if self.ahead.is_none() {
            self.ahead = Some(self.lexer.next_token()?);
        }
        match &self.ahead {
            Some(token) => Ok(&token.tok),
            None => Ok(&Tok::Eof),
        }
    }

    fn check(&self, tok: &Tok) -> bool {
        &self.current.tok == tok
    }

    fn test_next(&mut self, tok: &Tok) -> Result<bool> {
        if self.check(tok) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn error_near(&self, msg: &str) -> LuaError {
        LuaError::Syntax(format!(
            "{}:{}: {} near '{}'",
            self.lexer.chunk(),
            self.current.line,
            msg,
            self.current.tok.text()
        ))
    }

    fn enter_level(&mut self) -> Result<()> {
        self.level += 1;
        if self.level > MAX_SYNTAX_LEVELS {
            return Err(LuaError::Syntax(format!(
                "{}:{}: chunk has too many syntax levels",
                self.lexer.chunk(),
                self.current.line
            )));
        }
        Ok(())
    }

    fn leave_levels(&mut self, n: usize) {
        self.level -= n;
    }

    fn expect(&mut self, tok: Tok) -> Result<()> {
        if self.check(&tok) {
            self.next()
        } else {
            Err(self.error_near(&format!("'{}' expected", tok.text())))
        }
    }

    fn expect_match(&mut self, what: Tok, who: Tok, line: u32) -> Result<()> {
        if self.check(&what) {
            return self.next();
        }
        if line == self.current.line {
            Err(self.error_near(&format!("'{}' expected", what.text())))
        } else {
            Err(self.error_near(&format!(
                "'{}' expected (to close '{}' at line {})",
                what.text(),
                who.text(),
                line
            )))
        }
    }

    fn name(&mut self) -> Result<String> {
        match &self.current.tok {
            Tok::Name(name) => {
                let name = name.clone();
                self.next()?;
                Ok(name)
            }
            _ => Err(self.error_near("<name> expected")),
        }
    }

    // ---- scopes ----

    fn scope(&mut self) -> &mut FuncScope {
        let last = self.funcs.len() - 1;
        &mut self.funcs[last]
    }

    fn open_function(&mut self, is_vararg: bool) {
        self.funcs.push(FuncScope {
            actives: Vec::new(),
            blocks: vec![0],
            is_vararg,
            loops: 0,
        });
    }

    fn open_block(&mut self) {
        let scope = self.scope();
        let len = scope.actives.len();
        scope.blocks.push(len);
    }

    fn close_block(&mut self) {
        let scope = self.scope();
        if let Some(len) = scope.blocks.pop() {
            scope.actives.truncate(len);
        }
    }

    /// Create a local that is not yet visible
    fn declare(&mut self, name: String) -> LocalId {
        self.local_names.push(name);
        self.captured.push(false);
        self.local_names.len() - 1
    }

    fn activate(&mut self, ids: &[LocalId]) {
        for &id in ids {
            let name = self.local_names[id].clone();
            self.scope().actives.push((name, id));
        }
    }

    fn resolve(&mut self, name: &str) -> Expr {
        let innermost = self.funcs.len() - 1;
        for level in (0..self.funcs.len()).rev() {
            let found = self.funcs[level]
                .actives
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id);
            if let Some(id) = found {
                if level == innermost {
                    return Expr::Local(id);
                }
                self.captured[id] = true;
                return Expr::Upvalue(id);
            }
        }
        Expr::Global(name.to_string())
    }

    // ---- chunk and blocks ----

    fn chunk(&mut self) -> Result<Chunk> {
        self.open_function(true);
        let stats = self.statements()?;
        if !self.check(&Tok::Eof) {
            return Err(self.error_near("'<eof>' expected"));
        }
        let end_line = self.current.line;
        self.funcs.pop();
        Ok(Chunk {
            main: FuncBody {
                params: Vec::new(),
                is_vararg: true,
                body: Block { stats },
                line: 0,
                end_line,
            },
            local_names: std::mem::take(&mut self.local_names),
            captured: std::mem::take(&mut self.captured),
        })
    }

    fn statements(&mut self) -> Result<Vec<Stat>> {
        let mut stats = Vec::new();
        while !block_follow(&self.current.tok) {
            if self.check(&Tok::Return) {
                stats.push(self.return_stat()?);
                break;
            }
            self.enter_level()?;
            let stat = self.statement()?;
            self.leave_levels(1);
            self.test_next(&Tok::Semi)?;
            let last = matches!(stat, Stat::Break { .. });
            stats.push(stat);
            if last {
                break;
            }
        }
        Ok(stats)
    }

    fn block(&mut self) -> Result<Block> {
        self.open_block();
        let stats = self.statements()?;
        self.close_block();
        Ok(Block { stats })
    }

    fn loop_block(&mut self) -> Result<Block> {
        self.scope().loops += 1;
        let block = self.block();
        self.scope().loops -= 1;
        block
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Stat> {
        let line = self.current.line;
        match self.current.tok {
            Tok::If => self.if_stat(line),
            Tok::While => {
                self.next()?;
                let cond = self.expr()?;
                self.expect(Tok::Do)?;
                let body = self.loop_block()?;
                self.expect_match(Tok::End, Tok::While, line)?;
                Ok(Stat::While { cond, body, line })
            }
            Tok::Do => {
                self.next()?;
                let body = self.block()?;
                self.expect_match(Tok::End, Tok::Do, line)?;
                Ok(Stat::Do(body))
            }
            Tok::For => self.for_stat(line),
            Tok::Repeat => {
                self.next()?;
                self.scope().loops += 1;
                self.open_block();
                let stats = self.statements()?;
                self.expect_match(Tok::Until, Tok::Repeat, line)?;
                let cond = self.expr()?;
                self.close_block();
                self.scope().loops -= 1;
                Ok(Stat::Repeat {
                    body: Block { stats },
                    cond,
                    line,
                })
            }
            Tok::Function => self.func_stat(line),
            Tok::Local => {
                self.next()?;
                if self.test_next(&Tok::Function)? {
                    let name = self.name()?;
                    let id = self.declare(name);
                    self.activate(&[id]);
                    let func = self.body(false, line)?;
                    Ok(Stat::LocalFunction { name: id, func })
                } else {
                    self.local_stat(line)
                }
            }
            Tok::Break => {
                self.next()?;
                if self.scope().loops == 0 {
                    return Err(self.error_near("no loop to break"));
                }
                Ok(Stat::Break { line })
            }
            _ => self.expr_stat(line),
        }
    }

    fn if_stat(&mut self, line: u32) -> Result<Stat> {
        let mut arms = Vec::new();
        self.next()?;
        let cond = self.expr()?;
        self.expect(Tok::Then)?;
        arms.push((cond, self.block()?));
        let mut otherwise = None;
        loop {
            if self.test_next(&Tok::Elseif)? {
                let cond = self.expr()?;
                self.expect(Tok::Then)?;
                arms.push((cond, self.block()?));
            } else if self.test_next(&Tok::Else)? {
                otherwise = Some(self.block()?);
                break;
            } else {
                break;
            }
        }
        self.expect_match(Tok::End, Tok::If, line)?;
        Ok(Stat::If { arms, otherwise, line })
    }

    fn for_stat(&mut self, line: u32) -> Result<Stat> {
        self.next()?;
        let first = self.name()?;
        match self.current.tok {
            Tok::Assign => {
                self.next()?;
                let start = self.expr()?;
                self.expect(Tok::Comma)?;
                let limit = self.expr()?;
                let step = if self.test_next(&Tok::Comma)? {
                    Some(self.expr()?)
                } else {
                    None
                };
                self.expect(Tok::Do)?;
                self.open_block();
                let var = self.declare(first);
                self.activate(&[var]);
                let body = self.loop_block()?;
                self.close_block();
                self.expect_match(Tok::End, Tok::For, line)?;
                Ok(Stat::NumericFor {
                    var,
                    start,
                    limit,
                    step,
                    body,
                    line,
                })
            }
            Tok::Comma | Tok::In => {
                let mut names = vec![first];
                while self.test_next(&Tok::Comma)? {
                    names.push(self.name()?);
                }
                self.expect(Tok::In)?;
                let exprs = self.expr_list()?;
                self.expect(Tok::Do)?;
                self.open_block();
                let vars: Vec<LocalId> = names.into_iter().map(|n| self.declare(n)).collect();
                self.activate(&vars);
                let body = self.loop_block()?;
                self.close_block();
                self.expect_match(Tok::End, Tok::For, line)?;
                Ok(Stat::GenericFor {
                    vars,
                    exprs,
                    body,
                    line,
                })
            }
            _ => Err(self.error_near("'=' or 'in' expected")),
        }
    }

    fn func_stat(&mut self, line: u32) -> Result<Stat> {
        self.next()?;
        let name = self.name()?;
        let mut target = self.resolve(&name);
        let mut is_method = false;
        loop {
            match self.current.tok {
                Tok::Dot => {
                    self.next()?;
                    let key = self.name()?;
                    target = Expr::Index(Box::new(target), Box::new(Expr::Str(key.into_bytes())), line);
                }
                Tok::Colon => {
                    self.next()?;
                    let key = self.name()?;
                    target = Expr::Index(Box::new(target), Box::new(Expr::Str(key.into_bytes())), line);
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let func = self.body(is_method, line)?;
        Ok(Stat::Assign {
            targets: vec![target],
            values: vec![Expr::Function(Box::new(func))],
            line,
        })
    }

    fn local_stat(&mut self, line: u32) -> Result<Stat> {
        let mut names = vec![self.name()?];
        while self.test_next(&Tok::Comma)? {
            names.push(self.name()?);
        }
        let values = if self.test_next(&Tok::Assign)? {
            self.expr_list()?
        } else {
            Vec::new()
        };
        let ids: Vec<LocalId> = names.into_iter().map(|n| self.declare(n)).collect();
        self.activate(&ids);
        Ok(Stat::Local {
            names: ids,
            values,
            line,
        })
    }

    fn return_stat(&mut self) -> Result<Stat> {
        let line = self.current.line;
        self.next()?;
        let values = if block_follow(&self.current.tok) || self.check(&Tok::Semi) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.test_next(&Tok::Semi)?;
        Ok(Stat::Return { values, line })
    }

    fn expr_stat(&mut self, line: u32) -> Result<Stat> {
        let first = self.suffixed_expr()?;
        if self.check(&Tok::Assign) || self.check(&Tok::Comma) {
            let mut targets = vec![first];
            while self.test_next(&Tok::Comma)? {
                targets.push(self.suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Local(_) | Expr::Upvalue(_) | Expr::Global(_) | Expr::Index(..)) {
                    return Err(self.error_near("syntax error"));
                }
            }
            self.expect(Tok::Assign)?;
            let values = self.expr_list()?;
            return Ok(Stat::Assign { targets, values, line });
        }
        match first {
            Expr::Call(call) => Ok(Stat::Call(*call)),
            _ => Err(self.error_near("syntax error")),
        }
    }

    // ---- functions ----

    fn body(&mut self, is_method: bool, line: u32) -> Result<FuncBody> {
        self.open_function(false);
        let mut params = Vec::new();
        if is_method {
            params.push(self.declare("self".to_string()));
        }
        self.expect(Tok::LParen)?;
        let mut is_vararg = false;
        if !self.check(&Tok::RParen) {
            loop {
                match self.current.tok {
                    Tok::Name(_) => {
                        let name = self.name()?;
                        params.push(self.declare(name));
                    }
                    Tok::Dots => {
                        self.next()?;
                        is_vararg = true;
                    }
                    _ => return Err(self.error_near("<name> or '...' expected")),
                }
                if is_vararg || !self.test_next(&Tok::Comma)? {
                    break;
                }
            }
        }
        self.scope().is_vararg = is_vararg;
        self.activate(&params);
        self.expect(Tok::RParen)?;
        let stats = self.statements()?;
        let end_line = self.current.line;
        self.expect_match(Tok::End, Tok::Function, line)?;
        self.funcs.pop();
        Ok(FuncBody {
            params,
            is_vararg,
            body: Block { stats },
            line,
            end_line,
        })
    }

    // ---- expressions ----

    fn expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut list = vec![self.expr()?];
        while self.test_next(&Tok::Comma)? {
            list.push(self.expr()?);
        }
        Ok(list)
    }

    pub fn expr(&mut self) -> Result<Expr> {
        self.subexpr(0)
    }

    fn subexpr(&mut self, limit: u8) -> Result<Expr> {
        self.enter_level()?;
        let mut left = if let Some(op) = unary_op(&self.current.tok) {
            let line = self.current.line;
            self.next()?;
            let operand = self.subexpr(UNARY_PRIORITY)?;
            match (op, operand) {
                (UnOp::Neg, Expr::Number(n)) => Expr::Number(-n),
                (op, operand) => Expr::Unary(op, Box::new(operand), line),
            }
        } else {
            self.simple_expr()?
        };

        let mut folds = 0;
        while let Some(op) = binary_op(&self.current.tok) {
            let (left_prio, right_prio) = op.priority();
            if left_prio <= limit {
                break;
            }
            let line = self.current.line;
            self.next()?;
            let right = self.subexpr(right_prio)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right), line);
            // the tree deepens on the left as well
            self.enter_level()?;
            folds += 1;
        }
        self.leave_levels(folds + 1);
        Ok(left)
    }

    fn simple_expr(&mut self) -> Result<Expr> {
        let expr = match &self.current.tok {
            Tok::Number(n) => Expr::Number(*n),
            Tok::Str(s) => Expr::Str(s.clone()),
            Tok::Nil => Expr::Nil,
            Tok::True => Expr::True,
            Tok::False => Expr::False,
            Tok::Dots => {
                if !self.scope().is_vararg {
                    return Err(self.error_near("cannot use '...' outside a vararg function"));
                }
                Expr::Vararg
            }
            Tok::LBrace => return self.table(),
            Tok::Function => {
                let line = self.current.line;
                self.next()?;
                return Ok(Expr::Function(Box::new(self.body(false, line)?)));
            }
            _ => return self.suffixed_expr(),
        };
        self.next()?;
        Ok(expr)
    }

    fn primary_expr(&mut self) -> Result<Expr> {
        match &self.current.tok {
            Tok::Name(_) => {
                let name = self.name()?;
                Ok(self.resolve(&name))
            }
            Tok::LParen => {
                let line = self.current.line;
                self.next()?;
                let inner = self.expr()?;
                self.expect_match(Tok::RParen, Tok::LParen, line)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            _ => Err(self.error_near("unexpected symbol")),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Expr> {
        let mut expr = self.primary_expr()?;
        let mut folds = 0;
        loop {
            if folds > 0 {
                self.enter_level()?;
            }
            folds += 1;
            let line = self.current.line;
            match self.current.tok {
                Tok::Dot => {
                    self.next()?;
                    let key = self.name()?;
                    expr = Expr::Index(Box::new(expr), Box::new(Expr::Str(key.into_bytes())), line);
                }
                Tok::LBracket => {
                    self.next()?;
                    let key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(key), line);
                }
                Tok::Colon => {
                    self.next()?;
                    let method = self.name()?;
                    let args = self.call_args()?;
                    expr = Expr::Call(Box::new(CallExpr {
                        func: expr,
                        method: Some(method),
                        args,
                        line,
                    }));
                }
                Tok::LParen | Tok::Str(_) | Tok::LBrace => {
                    let args = self.call_args()?;
                    expr = Expr::Call(Box::new(CallExpr {
                        func: expr,
                        method: None,
                        args,
                        line,
                    }));
                }
                _ => {
                    self.leave_levels(folds - 1);
                    return Ok(expr);
                }
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        match &self.current.tok {
            Tok::Str(s) => {
                let arg = Expr::Str(s.clone());
                self.next()?;
                Ok(vec![arg])
            }
            Tok::LBrace => Ok(vec![self.table()?]),
            Tok::LParen => {
                let line = self.current.line;
                if line != self.last_line {
                    return Err(self.error_near("ambiguous syntax (function call x new statement)"));
                }
                self.next()?;
                let args = if self.check(&Tok::RParen) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect_match(Tok::RParen, Tok::LParen, line)?;
                Ok(args)
            }
            _ => Err(self.error_near("function arguments expected")),
        }
    }

    fn table(&mut self) -> Result<Expr> {
        let line = self.current.line;
        self.expect(Tok::LBrace)?;
        let mut items = Vec::new();
        while !self.check(&Tok::RBrace) {
            let named = matches!(self.current.tok, Tok::Name(_)) && self.peek_ahead()? == &Tok::Assign;
            match self.current.tok {
                Tok::Name(_) if named => {
                    let key = self.name()?;
                    self.next()?;
                    let value = self.expr()?;
                    items.push(TableItem::Keyed(Expr::Str(key.into_bytes()), value));
                }
                Tok::LBracket => {
                    self.next()?;
                    let key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    self.expect(Tok::Assign)?;
                    let value = self.expr()?;
                    items.push(TableItem::Keyed(key, value));
                }
                _ => items.push(TableItem::Positional(self.expr()?)),
            }
            if !self.test_next(&Tok::Comma)? && !self.test_next(&Tok::Semi)? {
                break;
            }
        }
        self.expect_match(Tok::RBrace, Tok::LBrace, line)?;
        Ok(Expr::Table(items, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::SliceSource;

    fn parse(src: &str) -> Result<Chunk> {
        parse_chunk(SliceSource::new(src.as_bytes()), "t")
    }

    #[test]
    fn test_resolution() {
        let chunk = parse("local a = 1 local function f() return a + b end").unwrap();
        assert_eq!(chunk.local_names, vec!["a".to_string(), "f".to_string()]);
        assert_eq!(chunk.captured, vec![true, false]);
        match &chunk.main.body.stats[1] {
            Stat::LocalFunction { func, .. } => match &func.body.stats[0] {
                Stat::Return { values, .. } => match &values[0] {
                    Expr::Binary(BinOp::Add, l, r, _) => {
                        assert_eq!(**l, Expr::Upvalue(0));
                        assert_eq!(**r, Expr::Global("b".into()));
                    }
                    other => panic!("unexpected {:?}", other),
                },
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_local_not_visible_in_own_initializer() {
        let chunk = parse("local x = x").unwrap();
        match &chunk.main.body.stats[0] {
            Stat::Local { values, .. } => assert_eq!(values[0], Expr::Global("x".into())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let chunk = parse("return 1 + 2 * 3 ^ 2 .. 'x'").unwrap();
        match &chunk.main.body.stats[0] {
            Stat::Return { values, .. } => match &values[0] {
                Expr::Binary(BinOp::Concat, l, _, _) => {
                    assert!(matches!(**l, Expr::Binary(BinOp::Add, _, _, _)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negative_literal_folds() {
        let chunk = parse("return -2").unwrap();
        assert_eq!(
            chunk.main.body.stats[0],
            Stat::Return { values: vec![Expr::Number(-2.0)], line: 1 }
        );
    }

    #[test]
    fn test_syntax_errors() {
        let err = parse("x = = 1").unwrap_err();
        assert_eq!(err.to_string(), "t:1: unexpected symbol near '='");

        let err = parse("function f()\n return 1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "t:2: 'end' expected (to close 'function' at line 1) near '<eof>'"
        );

        let err = parse("break").unwrap_err();
        assert!(err.to_string().contains("no loop to break"));

        let err = parse("function f() return ... end").unwrap_err();
        assert!(err.to_string().contains("cannot use '...' outside a vararg function"));

        let err = parse("f()\n(g)()").unwrap_err();
        assert!(err.to_string().contains("ambiguous syntax"));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let deep = format!("return {}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = parse(&deep).unwrap_err();
        assert_eq!(err.to_string(), "t:1: chunk has too many syntax levels");

        let tables = format!("x = {}{}", "{".repeat(5_000), "}".repeat(5_000));
        assert!(parse(&tables).unwrap_err().to_string().contains("too many syntax levels"));

        let blocks = format!("{}{}", "do ".repeat(5_000), "end ".repeat(5_000));
        assert!(parse(&blocks).unwrap_err().to_string().contains("too many syntax levels"));

        let chain = format!("return 1{}", " + 1".repeat(5_000));
        assert!(parse(&chain).unwrap_err().to_string().contains("too many syntax levels"));

        // moderate nesting still parses
        let shallow = format!("return {}1{}", "(".repeat(50), ")".repeat(50));
        assert!(parse(&shallow).is_ok());
        let fields = format!("return a{}", ".b".repeat(50));
        assert!(parse(&fields).is_ok());
    }

    #[test]
    fn test_method_definition_adds_self() {
        let chunk = parse("function obj:m(a) return self end").unwrap();
        match &chunk.main.body.stats[0] {
            Stat::Assign { values, .. } => match &values[0] {
                Expr::Function(body) => {
                    assert_eq!(body.params.len(), 2);
                    assert_eq!(chunk.local_names[body.params[0]], "self");
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }
}
