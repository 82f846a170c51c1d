//! Bytecode instructions and compiled function prototypes.

use std::fmt;
use std::sync::Arc;

use crate::ast::BinOp;
use crate::value::Value;

/// `want` operand meaning "keep every result".
pub(crate) const MULTI: u8 = u8::MAX;

/// A single VM instruction.
///
/// The VM is stack based: operands are pushed on the value stack above the
/// frame's local slots and instructions consume them from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Nil,
    True,
    False,
    Const(u32),
    Pop(u8),

    GetLocal(u16),
    SetLocal(u16),
    /// Pops a value and stores it in a fresh cell in the given slot
    InitCell(u16),
    GetCell(u16),
    SetCell(u16),
    GetUpval(u16),
    SetUpval(u16),
    GetGlobal(u32),
    SetGlobal(u32),

    NewTable,
    GetIndex,
    SetIndex,
    /// `[t, k, v]` → `[t]`, storing `t[k] = v`
    TableInit,
    /// Appends the last multi-value push to the table below it, from the given index
    TableAppendMulti(u32),
    /// `[obj]` → `[obj[name], obj]`
    Method(u32),
    Closure(u32),
    Vararg(u8),

    Call(u8, u8),
    /// Like `Call`, with the argument count extended by the last multi-value push
    CallMulti(u8, u8),
    Return(u8),
    ReturnMulti(u8),

    Jump(u32),
    JumpIfFalse(u32),
    JumpIfFalseOrPop(u32),
    JumpIfTrueOrPop(u32),

    /// Numeric `for` setup: slot, exit target
    ForPrep(u16, u32),
    /// Numeric `for` step: slot, body target
    ForLoop(u16, u32),
    /// Generic `for` step: slot, variable count, exit target
    TForLoop(u16, u8, u32),

    Binary(BinOp),
    Neg,
    Not,
    Len,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Nil => "NIL",
            Op::True => "TRUE",
            Op::False => "FALSE",
            Op::Const(_) => "CONST",
            Op::Pop(_) => "POP",
            Op::GetLocal(_) => "GET_LOCAL",
            Op::SetLocal(_) => "SET_LOCAL",
            Op::InitCell(_) => "INIT_CELL",
            Op::GetCell(_) => "GET_CELL",
            Op::SetCell(_) => "SET_CELL",
            Op::GetUpval(_) => "GET_UPVAL",
            Op::SetUpval(_) => "SET_UPVAL",
            Op::GetGlobal(_) => "GET_GLOBAL",
            Op::SetGlobal(_) => "SET_GLOBAL",
            Op::NewTable => "NEW_TABLE",
            Op::GetIndex => "GET_INDEX",
            Op::SetIndex => "SET_INDEX",
            Op::TableInit => "TABLE_INIT",
            Op::TableAppendMulti(_) => "TABLE_APPEND_MULTI",
            Op::Method(_) => "METHOD",
            Op::Closure(_) => "CLOSURE",
            Op::Vararg(_) => "VARARG",
            Op::Call(..) => "CALL",
            Op::CallMulti(..) => "CALL_MULTI",
            Op::Return(_) => "RETURN",
            Op::ReturnMulti(_) => "RETURN_MULTI",
            Op::Jump(_) => "JUMP",
            Op::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Op::JumpIfFalseOrPop(_) => "JUMP_IF_FALSE_OR_POP",
            Op::JumpIfTrueOrPop(_) => "JUMP_IF_TRUE_OR_POP",
            Op::ForPrep(..) => "FOR_PREP",
            Op::ForLoop(..) => "FOR_LOOP",
            Op::TForLoop(..) => "TFOR_LOOP",
            Op::Binary(_) => "BINARY",
            Op::Neg => "NEG",
            Op::Not => "NOT",
            Op::Len => "LEN",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Const(idx) | Op::GetGlobal(idx) | Op::SetGlobal(idx) | Op::Method(idx) => {
                write!(f, "{} {}", self.name(), idx)
            }
            Op::GetLocal(slot)
            | Op::SetLocal(slot)
            | Op::InitCell(slot)
            | Op::GetCell(slot)
            | Op::SetCell(slot)
            | Op::GetUpval(slot)
            | Op::SetUpval(slot) => write!(f, "{} {}", self.name(), slot),
            Op::Jump(target)
            | Op::JumpIfFalse(target)
            | Op::JumpIfFalseOrPop(target)
            | Op::JumpIfTrueOrPop(target) => write!(f, "{} -> {}", self.name(), target),
            Op::Call(argc, want) | Op::CallMulti(argc, want) => {
                write!(f, "{} {} {}", self.name(), argc, want)
            }
            Op::Binary(op) => write!(f, "{} {:?}", self.name(), op),
            _ => f.write_str(self.name()),
        }
    }
}

/// Where a closure finds an upvalue when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpvalDesc {
    /// A cell in a local slot of the enclosing frame
    Local(u16),
    /// An upvalue of the enclosing closure
    Upval(u16),
}

/// A compiled function.
#[derive(Debug)]
pub(crate) struct Proto {
    pub name: String,
    pub chunk: Arc<str>,
    pub line: u32,
    pub params: u8,
    pub is_vararg: bool,
    /// Local slots reserved above the frame base
    pub slots: u16,
    pub code: Vec<Op>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    pub protos: Vec<Arc<Proto>>,
    pub upvals: Vec<UpvalDesc>,
}

impl Proto {
    /// Line of the instruction at `pc`.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(self.line)
    }

    /// Visits every constant of this prototype and of its nested prototypes.
    pub fn for_each_constant(&self, f: &mut dyn FnMut(Value)) {
        for &constant in &self.constants {
            f(constant);
        }
        for proto in &self.protos {
            proto.for_each_constant(f);
        }
    }

    /// Human-readable listing of the instructions.
    pub fn disassemble(&self) -> String {
        let mut out = format!("function <{}:{}> {}\n", self.chunk, self.line, self.name);
        for (pc, op) in self.code.iter().enumerate() {
            out.push_str(&format!("  {:4} [{}] {}\n", pc, self.line_at(pc), op));
        }
        for proto in &self.protos {
            out.push_str(&proto.disassemble());
        }
        out
    }
}
