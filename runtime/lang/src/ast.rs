//! Syntax tree produced by the parser.
//!
//! Names are resolved while parsing: every local declaration gets a
//! [`LocalId`] and references to it carry that id, so the compiler never
//! has to search scopes again.

/// Chunk-wide identifier of a local variable declaration.
pub(crate) type LocalId = usize;

#[derive(Debug)]
pub(crate) struct LocalInfo {
    /// Source name of the local (read by tests)
    #[cfg_attr(not(test), allow(dead_code))]
    pub name: String,
    /// Nesting depth of the function that declares the local (0 = main chunk)
    pub depth: usize,
    /// Referenced from a nested function, so it must live in a cell
    pub captured: bool,
}

#[derive(Debug)]
pub(crate) struct Chunk {
    pub main: FuncBody,
    pub locals: Vec<LocalInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnOp {
    Neg,
    Not,
    Len,
}

#[derive(Debug)]
pub(crate) enum Name {
    Local(LocalId),
    Global(String),
}

#[derive(Debug)]
pub(crate) enum Expr {
    Nil,
    True,
    False,
    Int(i64),
    Str(String),
    Vararg,
    Name(Name),
    Index(Box<Expr>, Box<Expr>, u32),
    Call(Box<Expr>, Vec<Expr>, u32),
    Method(Box<Expr>, String, Vec<Expr>, u32),
    Function(Box<FuncBody>),
    Binary(BinOp, Box<Expr>, Box<Expr>, u32),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>, u32),
    Table(Vec<Field>, u32),
    Paren(Box<Expr>),
}

impl Expr {
    /// Expressions that may produce any number of values.
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call(..) | Expr::Method(..) | Expr::Vararg)
    }
}

#[derive(Debug)]
pub(crate) enum Field {
    Positional(Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug)]
pub(crate) struct FuncBody {
    pub name: String,
    pub params: Vec<LocalId>,
    pub is_vararg: bool,
    pub body: Vec<Stmt>,
    pub line: u32,
    pub end_line: u32,
}

#[derive(Debug)]
pub(crate) struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug)]
pub(crate) enum StmtKind {
    Expr(Expr),
    Local(Vec<LocalId>, Vec<Expr>),
    LocalFunction(LocalId, Box<FuncBody>),
    Assign(Vec<Expr>, Vec<Expr>),
    Do(Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    Repeat(Vec<Stmt>, Expr),
    If(Vec<(Expr, Vec<Stmt>)>, Option<Vec<Stmt>>),
    NumericFor {
        var: LocalId,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    GenericFor {
        vars: Vec<LocalId>,
        exprs: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Return(Vec<Expr>),
    Break,
}
