//! Recursive-descent parser producing a name-resolved syntax tree.

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token};

/// Unary operators bind tighter than every binary operator except `^`.
const UNARY_PRIORITY: u8 = 12;

/// Left and right binding power of a binary operator.
fn binary_priority(token: &Token) -> Option<(BinOp, u8, u8)> {
    let op = match token {
        Token::Plus => (BinOp::Add, 10, 10),
        Token::Minus => (BinOp::Sub, 10, 10),
        Token::Star => (BinOp::Mul, 11, 11),
        Token::Slash => (BinOp::Div, 11, 11),
        Token::DoubleSlash => (BinOp::IDiv, 11, 11),
        Token::Percent => (BinOp::Mod, 11, 11),
        Token::Caret => (BinOp::Pow, 14, 13),
        Token::Concat => (BinOp::Concat, 9, 8),
        Token::Eq => (BinOp::Eq, 3, 3),
        Token::Ne => (BinOp::Ne, 3, 3),
        Token::Lt => (BinOp::Lt, 3, 3),
        Token::Le => (BinOp::Le, 3, 3),
        Token::Gt => (BinOp::Gt, 3, 3),
        Token::Ge => (BinOp::Ge, 3, 3),
        _ => return None,
    };
    Some(op)
}

pub(crate) struct Parser<'a> {
    lexer: Lexer<'a>,
    chunk: &'a str,
    token: Token,
    line: u32,
    ahead: Option<(Token, u32)>,
    locals: Vec<LocalInfo>,
    /// Block scopes of every function being parsed, innermost last
    scopes: Vec<Vec<(String, LocalId)>>,
    depth: usize,
    /// Innermost loop nesting per function, for `break` checks
    loops: Vec<usize>,
    /// Whether each function being parsed accepts `...`
    varargs: Vec<bool>,
}

impl<'a> Parser<'a> {
    pub fn parse(chunk: &'a str, source: &'a str) -> Result<Chunk> {
        let mut lexer = Lexer::new(chunk, source);
        let (token, line) = lexer.next_token()?;
        let mut parser = Parser {
            lexer,
            chunk,
            token,
            line,
            ahead: None,
            locals: Vec::new(),
            scopes: Vec::new(),
            depth: 0,
            loops: vec![0],
            varargs: vec![true],
        };

        parser.scopes.push(Vec::new());
        let body = parser.block()?;
        parser.scopes.pop();
        if parser.token != Token::Eof {
            return Err(parser.unexpected());
        }

        Ok(Chunk {
            main: FuncBody {
                name: "main chunk".into(),
                params: Vec::new(),
                is_vararg: true,
                body,
                line: 0,
                end_line: parser.line,
            },
            locals: parser.locals,
        })
    }

    fn error(&self, message: impl core::fmt::Display) -> Error {
        Error::Syntax(format!("{}:{}: {}", self.chunk, self.line, message))
    }

    fn unexpected(&self) -> Error {
        self.error(format!("unexpected symbol near '{}'", self.token))
    }

    fn advance(&mut self) -> Result<Token> {
        let (next, line) = match self.ahead.take() {
            Some(ahead) => ahead,
            None => self.lexer.next_token()?,
        };
        self.line = line;
        Ok(core::mem::replace(&mut self.token, next))
    }

    /// Checks the token after the current one without consuming anything.
    fn next_is(&mut self, token: &Token) -> Result<bool> {
        if self.ahead.is_none() {
            self.ahead = Some(self.lexer.next_token()?);
        }
        Ok(matches!(&self.ahead, Some((next, _)) if next == token))
    }

    fn check(&self, token: &Token) -> bool {
        &self.token == token
    }

    fn accept(&mut self, token: &Token) -> Result<bool> {
        if self.check(token) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.check(&token) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!("'{}' expected near '{}'", token, self.token)))
        }
    }

    /// Expects `what` to close a construct opened at `line`.
    fn expect_match(&mut self, what: Token, who: Token, line: u32) -> Result<()> {
        if self.check(&what) {
            self.advance()?;
            return Ok(());
        }
        if line == self.line {
            Err(self.error(format!("'{}' expected near '{}'", what, self.token)))
        } else {
            Err(self.error(format!(
                "'{}' expected (to close '{}' at line {}) near '{}'",
                what, who, line, self.token
            )))
        }
    }

    fn name(&mut self) -> Result<String> {
        if matches!(self.token, Token::Name(_)) {
            if let Token::Name(name) = self.advance()? {
                return Ok(name);
            }
        }
        Err(self.error(format!("<name> expected near '{}'", self.token)))
    }

    // --- scopes ---

    fn declare(&mut self, name: String) -> LocalId {
        let id = self.locals.len();
        self.locals.push(LocalInfo {
            name: name.clone(),
            depth: self.depth,
            captured: false,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name, id));
        }
        id
    }

    fn resolve(&mut self, name: String) -> Name {
        let found = self
            .scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(local, _)| *local == name)
            .map(|&(_, id)| id);

        match found {
            Some(id) => {
                if self.locals[id].depth < self.depth {
                    self.locals[id].captured = true;
                }
                Name::Local(id)
            }
            None => Name::Global(name),
        }
    }

    fn scoped_block(&mut self) -> Result<Vec<Stmt>> {
        self.scopes.push(Vec::new());
        let block = self.block();
        self.scopes.pop();
        block
    }

    fn loop_block(&mut self) -> Result<Vec<Stmt>> {
        self.enter_loop();
        let block = self.scoped_block();
        self.leave_loop();
        block
    }

    fn enter_loop(&mut self) {
        if let Some(n) = self.loops.last_mut() {
            *n += 1;
        }
    }

    fn leave_loop(&mut self) {
        if let Some(n) = self.loops.last_mut() {
            *n -= 1;
        }
    }

    // --- statements ---

    fn block_follows(&self) -> bool {
        matches!(
            self.token,
            Token::Eof | Token::End | Token::Else | Token::Elseif | Token::Until
        )
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.block_follows() {
            if self.check(&Token::Return) {
                let line = self.line;
                self.advance()?;
                let exprs = if self.block_follows() || self.check(&Token::Semi) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.accept(&Token::Semi)?;
                stmts.push(Stmt {
                    kind: StmtKind::Return(exprs),
                    line,
                });
                if !self.block_follows() {
                    return Err(self.error(format!("'<eof>' expected near '{}'", self.token)));
                }
                break;
            }
            if let Some(stmt) = self.statement()? {
                stmts.push(stmt);
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Option<Stmt>> {
        let line = self.line;
        let kind = match self.token {
            Token::Semi => {
                self.advance()?;
                return Ok(None);
            }
            Token::If => self.if_stat(line)?,
            Token::While => {
                self.advance()?;
                let cond = self.expr()?;
                self.expect(Token::Do)?;
                let body = self.loop_block()?;
                self.expect_match(Token::End, Token::While, line)?;
                StmtKind::While(cond, body)
            }
            Token::Do => {
                self.advance()?;
                let body = self.scoped_block()?;
                self.expect_match(Token::End, Token::Do, line)?;
                StmtKind::Do(body)
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => {
                self.advance()?;
                // The condition sees the body's locals.
                self.enter_loop();
                self.scopes.push(Vec::new());
                let body = self.block();
                let cond = body.and_then(|body| {
                    self.expect_match(Token::Until, Token::Repeat, line)?;
                    Ok((body, self.expr()?))
                });
                self.scopes.pop();
                self.leave_loop();
                let (body, cond) = cond?;
                StmtKind::Repeat(body, cond)
            }
            Token::Function => self.function_stat(line)?,
            Token::Local => {
                self.advance()?;
                if self.accept(&Token::Function)? {
                    let name = self.name()?;
                    let id = self.declare(name.clone());
                    let body = self.function_body(name, false, line)?;
                    StmtKind::LocalFunction(id, Box::new(body))
                } else {
                    let mut names = vec![self.name()?];
                    while self.accept(&Token::Comma)? {
                        names.push(self.name()?);
                    }
                    let exprs = if self.accept(&Token::Assign)? {
                        self.expr_list()?
                    } else {
                        Vec::new()
                    };
                    let ids = names.into_iter().map(|n| self.declare(n)).collect();
                    StmtKind::Local(ids, exprs)
                }
            }
            Token::Break => {
                self.advance()?;
                if self.loops.last().copied().unwrap_or(0) == 0 {
                    return Err(self.error("break outside a loop"));
                }
                StmtKind::Break
            }
            _ => self.expr_stat()?,
        };
        Ok(Some(Stmt { kind, line }))
    }

    fn if_stat(&mut self, line: u32) -> Result<StmtKind> {
        let mut arms = Vec::new();
        let mut otherwise = None;

        self.advance()?;
        let cond = self.expr()?;
        self.expect(Token::Then)?;
        arms.push((cond, self.scoped_block()?));

        loop {
            if self.accept(&Token::Elseif)? {
                let cond = self.expr()?;
                self.expect(Token::Then)?;
                arms.push((cond, self.scoped_block()?));
            } else if self.accept(&Token::Else)? {
                otherwise = Some(self.scoped_block()?);
                self.expect_match(Token::End, Token::If, line)?;
                break;
            } else {
                self.expect_match(Token::End, Token::If, line)?;
                break;
            }
        }
        Ok(StmtKind::If(arms, otherwise))
    }

    fn for_stat(&mut self, line: u32) -> Result<StmtKind> {
        self.advance()?;
        let first = self.name()?;

        if self.accept(&Token::Assign)? {
            let start = self.expr()?;
            self.expect(Token::Comma)?;
            let limit = self.expr()?;
            let step = if self.accept(&Token::Comma)? {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect(Token::Do)?;

            self.scopes.push(Vec::new());
            let var = self.declare(first);
            let body = self.loop_block();
            self.scopes.pop();
            self.expect_match(Token::End, Token::For, line)?;
            return Ok(StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body: body?,
            });
        }

        let mut names = vec![first];
        while self.accept(&Token::Comma)? {
            names.push(self.name()?);
        }
        self.expect(Token::In)?;
        let exprs = self.expr_list()?;
        self.expect(Token::Do)?;

        self.scopes.push(Vec::new());
        let vars = names.into_iter().map(|n| self.declare(n)).collect();
        let body = self.loop_block();
        self.scopes.pop();
        self.expect_match(Token::End, Token::For, line)?;
        Ok(StmtKind::GenericFor {
            vars,
            exprs,
            body: body?,
        })
    }

    fn function_stat(&mut self, line: u32) -> Result<StmtKind> {
        self.advance()?;
        let first = self.name()?;
        let mut full_name = first.clone();
        let mut target = Expr::Name(self.resolve(first));
        let mut is_method = false;

        loop {
            if self.accept(&Token::Dot)? {
                let key = self.name()?;
                full_name.push('.');
                full_name.push_str(&key);
                target = Expr::Index(Box::new(target), Box::new(Expr::Str(key)), self.line);
            } else if self.accept(&Token::Colon)? {
                let key = self.name()?;
                full_name.push(':');
                full_name.push_str(&key);
                target = Expr::Index(Box::new(target), Box::new(Expr::Str(key)), self.line);
                is_method = true;
                break;
            } else {
                break;
            }
        }

        let body = self.function_body(full_name, is_method, line)?;
        Ok(StmtKind::Assign(
            vec![target],
            vec![Expr::Function(Box::new(body))],
        ))
    }

    fn expr_stat(&mut self) -> Result<StmtKind> {
        let expr = self.suffixed_expr()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![expr];
            while self.accept(&Token::Comma)? {
                targets.push(self.suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Name(_) | Expr::Index(..)) {
                    return Err(self.error("syntax error near '='"));
                }
            }
            self.expect(Token::Assign)?;
            let exprs = self.expr_list()?;
            return Ok(StmtKind::Assign(targets, exprs));
        }
        if !matches!(expr, Expr::Call(..) | Expr::Method(..)) {
            return Err(self.error(format!("syntax error near '{}'", self.token)));
        }
        Ok(StmtKind::Expr(expr))
    }

    fn function_body(&mut self, name: String, is_method: bool, line: u32) -> Result<FuncBody> {
        self.depth += 1;
        self.loops.push(0);
        self.varargs.push(false);
        self.scopes.push(Vec::new());
        let result = self.function_inner(name, is_method, line);
        self.scopes.pop();
        self.varargs.pop();
        self.loops.pop();
        self.depth -= 1;
        result
    }

    fn function_inner(&mut self, name: String, is_method: bool, line: u32) -> Result<FuncBody> {
        let mut params = Vec::new();
        let mut is_vararg = false;
        if is_method {
            params.push(self.declare("self".into()));
        }

        self.expect(Token::LParen)?;
        if !self.check(&Token::RParen) {
            loop {
                if self.accept(&Token::Ellipsis)? {
                    is_vararg = true;
                    break;
                }
                let param = self.name()?;
                params.push(self.declare(param));
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if let Some(vararg) = self.varargs.last_mut() {
            *vararg = is_vararg;
        }

        let body = self.block()?;
        let end_line = self.line;
        self.expect_match(Token::End, Token::Function, line)?;
        Ok(FuncBody {
            name,
            params,
            is_vararg,
            body,
            line,
            end_line,
        })
    }

    // --- expressions ---

    fn expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![self.expr()?];
        while self.accept(&Token::Comma)? {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    pub(crate) fn expr(&mut self) -> Result<Expr> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> Result<Expr> {
        let line = self.line;
        let mut left = match self.token {
            Token::Not => {
                self.advance()?;
                Expr::Unary(UnOp::Not, Box::new(self.sub_expr(UNARY_PRIORITY)?), line)
            }
            Token::Minus => {
                self.advance()?;
                match self.sub_expr(UNARY_PRIORITY)? {
                    Expr::Int(n) => Expr::Int(n.wrapping_neg()),
                    operand => Expr::Unary(UnOp::Neg, Box::new(operand), line),
                }
            }
            Token::Hash => {
                self.advance()?;
                Expr::Unary(UnOp::Len, Box::new(self.sub_expr(UNARY_PRIORITY)?), line)
            }
            _ => self.simple_expr()?,
        };

        loop {
            if self.check(&Token::And) && 2 > limit {
                self.advance()?;
                let right = self.sub_expr(2)?;
                left = Expr::And(Box::new(left), Box::new(right));
            } else if self.check(&Token::Or) && 1 > limit {
                self.advance()?;
                let right = self.sub_expr(1)?;
                left = Expr::Or(Box::new(left), Box::new(right));
            } else if let Some((op, lp, rp)) = binary_priority(&self.token) {
                if lp <= limit {
                    break;
                }
                let line = self.line;
                self.advance()?;
                let right = self.sub_expr(rp)?;
                left = Expr::Binary(op, Box::new(left), Box::new(right), line);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn simple_expr(&mut self) -> Result<Expr> {
        let line = self.line;
        let expr = match self.token {
            Token::Nil => Expr::Nil,
            Token::True => Expr::True,
            Token::False => Expr::False,
            Token::Int(n) => Expr::Int(n),
            Token::Str(_) => match self.advance()? {
                Token::Str(s) => return Ok(Expr::Str(s)),
                _ => return Err(self.unexpected()),
            },
            Token::Ellipsis => {
                if self.varargs.last().copied().unwrap_or(false) {
                    Expr::Vararg
                } else {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
            }
            Token::LBrace => return self.table_constructor(),
            Token::Function => {
                self.advance()?;
                let body = self.function_body("anonymous".into(), false, line)?;
                return Ok(Expr::Function(Box::new(body)));
            }
            _ => return self.suffixed_expr(),
        };
        self.advance()?;
        Ok(expr)
    }

    fn primary_expr(&mut self) -> Result<Expr> {
        match self.token {
            Token::Name(_) => {
                let name = self.name()?;
                Ok(Expr::Name(self.resolve(name)))
            }
            Token::LParen => {
                let line = self.line;
                self.advance()?;
                let inner = self.expr()?;
                self.expect_match(Token::RParen, Token::LParen, line)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            let line = self.line;
            match self.token {
                Token::Dot => {
                    self.advance()?;
                    let key = self.name()?;
                    expr = Expr::Index(Box::new(expr), Box::new(Expr::Str(key)), line);
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(key), line);
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.name()?;
                    let args = self.call_args()?;
                    expr = Expr::Method(Box::new(expr), method, args, line);
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    let args = self.call_args()?;
                    expr = Expr::Call(Box::new(expr), args, line);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        let line = self.line;
        match self.token {
            Token::Str(_) => match self.advance()? {
                Token::Str(s) => Ok(vec![Expr::Str(s)]),
                _ => Err(self.unexpected()),
            },
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            Token::LParen => {
                self.advance()?;
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect_match(Token::RParen, Token::LParen, line)?;
                Ok(args)
            }
            _ => Err(self.error("function arguments expected")),
        }
    }

    fn table_constructor(&mut self) -> Result<Expr> {
        let line = self.line;
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let named = matches!(self.token, Token::Name(_)) && self.next_is(&Token::Assign)?;
            let field = match self.token {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    self.expect(Token::Assign)?;
                    Field::Keyed(key, self.expr()?)
                }
                Token::Name(_) if named => {
                    let key = self.name()?;
                    self.advance()?;
                    Field::Keyed(Expr::Str(key), self.expr()?)
                }
                _ => Field::Positional(self.expr()?),
            };
            fields.push(field);
            if !self.accept(&Token::Comma)? && !self.accept(&Token::Semi)? {
                break;
            }
        }
        self.expect_match(Token::RBrace, Token::LBrace, line)?;
        Ok(Expr::Table(fields, line))
    }
}
