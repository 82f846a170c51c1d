//! Compiles a name-resolved syntax tree into stack bytecode.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::*;
use crate::bytecode::{Op, Proto, UpvalDesc, MULTI};
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::parser::Parser;
use crate::value::Value;

/// Parses and compiles `source`, interning string constants in `heap`.
pub(crate) fn compile(heap: &mut Heap, chunk: &str, source: &str) -> Result<Arc<Proto>> {
    let tree = Parser::parse(chunk, source)?;
    let mut compiler = Compiler {
        heap,
        chunk: Arc::from(chunk),
        locals: &tree.locals,
        funcs: Vec::new(),
    };
    let proto = compiler.function(&tree.main)?;
    log::trace!("compiled {}:\n{}", chunk, proto.disassemble());
    Ok(proto)
}

struct FuncState {
    proto: Proto,
    const_index: HashMap<Value, u32>,
    /// Slot of every local declared so far in this function
    slots: HashMap<LocalId, u16>,
    active: u16,
    /// Local each upvalue refers to, parallel to `proto.upvals`
    upval_ids: Vec<LocalId>,
    /// Pending `break` jumps, one list per enclosing loop
    breaks: Vec<Vec<usize>>,
    line: u32,
}

struct Compiler<'h, 't> {
    heap: &'h mut Heap,
    chunk: Arc<str>,
    locals: &'t [LocalInfo],
    funcs: Vec<FuncState>,
}

impl<'h, 't> Compiler<'h, 't> {
    fn error(&self, message: &str) -> Error {
        let line = self.funcs.last().map_or(0, |f| f.line);
        Error::Syntax(format!("{}:{}: {}", self.chunk, line, message))
    }

    fn func(&mut self) -> &mut FuncState {
        let last = self.funcs.len() - 1;
        &mut self.funcs[last]
    }

    fn emit(&mut self, op: Op) -> usize {
        let func = self.func();
        let line = func.line;
        func.proto.code.push(op);
        func.proto.lines.push(line);
        func.proto.code.len() - 1
    }

    fn pc(&mut self) -> u32 {
        self.func().proto.code.len() as u32
    }

    /// Points the jump at `at` to the current position.
    fn patch(&mut self, at: usize) {
        let target = self.pc();
        let op = &mut self.func().proto.code[at];
        *op = match *op {
            Op::Jump(_) => Op::Jump(target),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
            Op::JumpIfFalseOrPop(_) => Op::JumpIfFalseOrPop(target),
            Op::JumpIfTrueOrPop(_) => Op::JumpIfTrueOrPop(target),
            Op::ForPrep(slot, _) => Op::ForPrep(slot, target),
            Op::TForLoop(slot, n, _) => Op::TForLoop(slot, n, target),
            other => other,
        };
    }

    fn constant(&mut self, value: Value) -> Result<u32> {
        if let Some(&idx) = self.func().const_index.get(&value) {
            return Ok(idx);
        }
        let func = self.func();
        let idx = func.proto.constants.len() as u32;
        func.proto.constants.push(value);
        func.const_index.insert(value, idx);
        Ok(idx)
    }

    fn string_constant(&mut self, s: &str) -> Result<u32> {
        let r = self.heap.intern(s)?;
        self.constant(Value::String(r))
    }

    fn alloc_slot(&mut self) -> Result<u16> {
        let func = self.func();
        if func.active == u16::MAX {
            return Err(self.error("too many local variables"));
        }
        let slot = func.active;
        func.active += 1;
        func.proto.slots = func.proto.slots.max(func.active);
        Ok(slot)
    }

    fn declare(&mut self, id: LocalId) -> Result<u16> {
        let slot = self.alloc_slot()?;
        self.func().slots.insert(id, slot);
        Ok(slot)
    }

    fn captured(&self, id: LocalId) -> bool {
        self.locals[id].captured
    }

    /// Stores the value on top of the stack into a freshly declared local.
    fn store_new_local(&mut self, id: LocalId, slot: u16) {
        if self.captured(id) {
            self.emit(Op::InitCell(slot));
        } else {
            self.emit(Op::SetLocal(slot));
        }
    }

    // --- functions ---

    fn function(&mut self, body: &FuncBody) -> Result<Arc<Proto>> {
        if body.params.len() >= MULTI as usize {
            return Err(self.error("too many parameters"));
        }
        self.funcs.push(FuncState {
            proto: Proto {
                name: body.name.clone(),
                chunk: self.chunk.clone(),
                line: body.line,
                params: body.params.len() as u8,
                is_vararg: body.is_vararg,
                slots: 0,
                code: Vec::new(),
                lines: Vec::new(),
                constants: Vec::new(),
                protos: Vec::new(),
                upvals: Vec::new(),
            },
            const_index: HashMap::new(),
            slots: HashMap::new(),
            active: 0,
            upval_ids: Vec::new(),
            breaks: Vec::new(),
            line: body.line,
        });

        let result = self.function_body(body);
        let func = self.funcs.pop();
        result?;
        match func {
            Some(func) => Ok(Arc::new(func.proto)),
            None => Err(self.error("function state underflow")),
        }
    }

    fn function_body(&mut self, body: &FuncBody) -> Result<()> {
        for &param in &body.params {
            let slot = self.declare(param)?;
            if self.captured(param) {
                self.emit(Op::GetLocal(slot));
                self.emit(Op::InitCell(slot));
            }
        }
        self.block(&body.body)?;
        self.func().line = body.end_line;
        self.emit(Op::Return(0));
        Ok(())
    }

    /// Finds or creates the upvalue of function `fi` that refers to `id`.
    fn upvalue(&mut self, fi: usize, id: LocalId) -> Result<u16> {
        if let Some(pos) = self.funcs[fi].upval_ids.iter().position(|&u| u == id) {
            return Ok(pos as u16);
        }
        if fi == 0 {
            return Err(self.error("unresolved upvalue"));
        }
        let parent = fi - 1;
        let slot = match self.funcs[parent].slots.get(&id) {
            Some(&slot) if self.locals[id].depth == parent => Some(slot),
            _ => None,
        };
        let desc = match slot {
            Some(slot) => UpvalDesc::Local(slot),
            None => UpvalDesc::Upval(self.upvalue(parent, id)?),
        };
        let func = &mut self.funcs[fi];
        func.proto.upvals.push(desc);
        func.upval_ids.push(id);
        Ok((func.proto.upvals.len() - 1) as u16)
    }

    // --- statements ---

    fn block(&mut self, stmts: &[Stmt]) -> Result<()> {
        let saved = self.func().active;
        for stmt in stmts {
            self.func().line = stmt.line;
            self.statement(stmt)?;
        }
        self.func().active = saved;
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.call(expr, 0),
            StmtKind::Local(ids, exprs) => {
                self.expr_list(exprs, ids.len())?;
                let mut slots = Vec::with_capacity(ids.len());
                for &id in ids {
                    slots.push(self.declare(id)?);
                }
                for (&id, &slot) in ids.iter().zip(&slots).rev() {
                    self.store_new_local(id, slot);
                }
                Ok(())
            }
            StmtKind::LocalFunction(id, body) => {
                let slot = self.declare(*id)?;
                if self.captured(*id) {
                    self.emit(Op::Nil);
                    self.emit(Op::InitCell(slot));
                    self.closure(body)?;
                    self.emit(Op::SetCell(slot));
                } else {
                    self.closure(body)?;
                    self.emit(Op::SetLocal(slot));
                }
                Ok(())
            }
            StmtKind::Assign(targets, exprs) => self.assign(targets, exprs),
            StmtKind::Do(body) => self.block(body),
            StmtKind::While(cond, body) => {
                let start = self.pc();
                self.expr(cond)?;
                let exit = self.emit(Op::JumpIfFalse(0));
                self.loop_body(body, |c| {
                    c.emit(Op::Jump(start));
                    Ok(())
                })?;
                self.patch(exit);
                Ok(())
            }
            StmtKind::Repeat(body, cond) => {
                let start = self.pc();
                self.func().breaks.push(Vec::new());
                let saved = self.func().active;
                for stmt in body {
                    self.func().line = stmt.line;
                    self.statement(stmt)?;
                }
                self.expr(cond)?;
                self.emit(Op::JumpIfFalse(start));
                self.func().active = saved;
                self.patch_breaks();
                Ok(())
            }
            StmtKind::If(arms, otherwise) => {
                let mut ends = Vec::new();
                for (cond, body) in arms {
                    self.expr(cond)?;
                    let next = self.emit(Op::JumpIfFalse(0));
                    self.block(body)?;
                    ends.push(self.emit(Op::Jump(0)));
                    self.patch(next);
                }
                if let Some(body) = otherwise {
                    self.block(body)?;
                }
                for end in ends {
                    self.patch(end);
                }
                Ok(())
            }
            StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => self.numeric_for(*var, start, limit, step.as_ref(), body),
            StmtKind::GenericFor { vars, exprs, body } => self.generic_for(vars, exprs, body),
            StmtKind::Return(exprs) => {
                let (fixed, multi) = self.expr_list_multi(exprs)?;
                if multi {
                    self.emit(Op::ReturnMulti(fixed));
                } else {
                    self.emit(Op::Return(fixed));
                }
                Ok(())
            }
            StmtKind::Break => {
                let jump = self.emit(Op::Jump(0));
                match self.func().breaks.last_mut() {
                    Some(list) => {
                        list.push(jump);
                        Ok(())
                    }
                    None => Err(self.error("break outside a loop")),
                }
            }
        }
    }

    /// Compiles a loop body followed by `tail`, then resolves `break`s to
    /// the position after the tail.
    fn loop_body(
        &mut self,
        body: &[Stmt],
        tail: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.func().breaks.push(Vec::new());
        self.block(body)?;
        tail(self)?;
        self.patch_breaks();
        Ok(())
    }

    fn patch_breaks(&mut self) {
        if let Some(breaks) = self.func().breaks.pop() {
            for jump in breaks {
                self.patch(jump);
            }
        }
    }

    fn numeric_for(
        &mut self,
        var: LocalId,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> Result<()> {
        let saved = self.func().active;
        let base = self.alloc_slot()?;
        self.alloc_slot()?;
        self.alloc_slot()?;

        self.expr(start)?;
        self.emit(Op::SetLocal(base));
        self.expr(limit)?;
        self.emit(Op::SetLocal(base + 1));
        match step {
            Some(step) => self.expr(step)?,
            None => {
                let one = self.constant(Value::Integer(1))?;
                self.emit(Op::Const(one));
            }
        }
        self.emit(Op::SetLocal(base + 2));

        let var_slot = self.declare(var)?;
        let prep = self.emit(Op::ForPrep(base, 0));
        let body_start = self.pc();
        if self.captured(var) {
            self.emit(Op::GetLocal(var_slot));
            self.emit(Op::InitCell(var_slot));
        }
        self.loop_body(body, |c| {
            c.emit(Op::ForLoop(base, body_start));
            Ok(())
        })?;
        self.patch(prep);
        self.func().active = saved;
        Ok(())
    }

    fn generic_for(&mut self, vars: &[LocalId], exprs: &[Expr], body: &[Stmt]) -> Result<()> {
        if vars.len() >= MULTI as usize {
            return Err(self.error("too many loop variables"));
        }
        let saved = self.func().active;
        let base = self.alloc_slot()?;
        self.alloc_slot()?;
        self.alloc_slot()?;

        self.expr_list(exprs, 3)?;
        self.emit(Op::SetLocal(base + 2));
        self.emit(Op::SetLocal(base + 1));
        self.emit(Op::SetLocal(base));

        let mut slots = Vec::with_capacity(vars.len());
        for &var in vars {
            slots.push(self.declare(var)?);
        }

        let start = self.pc();
        self.emit(Op::GetLocal(base));
        self.emit(Op::GetLocal(base + 1));
        self.emit(Op::GetLocal(base + 2));
        self.emit(Op::Call(2, vars.len() as u8));
        let exit = self.emit(Op::TForLoop(base, vars.len() as u8, 0));
        for (&var, &slot) in vars.iter().zip(&slots) {
            if self.captured(var) {
                self.emit(Op::GetLocal(slot));
                self.emit(Op::InitCell(slot));
            }
        }
        self.loop_body(body, |c| {
            c.emit(Op::Jump(start));
            Ok(())
        })?;
        self.patch(exit);
        self.func().active = saved;
        Ok(())
    }

    fn assign(&mut self, targets: &[Expr], exprs: &[Expr]) -> Result<()> {
        if let ([target], [expr]) = (targets, exprs) {
            return match target {
                Expr::Index(table, key, line) => {
                    self.expr(table)?;
                    self.expr(key)?;
                    self.expr(expr)?;
                    self.func().line = *line;
                    self.emit(Op::SetIndex);
                    Ok(())
                }
                Expr::Name(name) => {
                    self.expr(expr)?;
                    self.store_name(name)
                }
                _ => Err(self.error("cannot assign")),
            };
        }

        // Table and key operands are evaluated before any value, and every
        // value before any store.
        let saved = self.func().active;
        let mut places = Vec::with_capacity(targets.len());
        for target in targets {
            match target {
                Expr::Index(table, key, _) => {
                    let t = self.alloc_slot()?;
                    let k = self.alloc_slot()?;
                    self.expr(table)?;
                    self.emit(Op::SetLocal(t));
                    self.expr(key)?;
                    self.emit(Op::SetLocal(k));
                    places.push(Some((t, k)));
                }
                _ => places.push(None),
            }
        }

        self.expr_list(exprs, targets.len())?;
        let mut temps = Vec::with_capacity(targets.len());
        for _ in targets {
            temps.push(self.alloc_slot()?);
        }
        for &temp in temps.iter().rev() {
            self.emit(Op::SetLocal(temp));
        }

        for ((target, place), &temp) in targets.iter().zip(&places).zip(&temps) {
            match (target, place) {
                (Expr::Index(..), Some((t, k))) => {
                    self.emit(Op::GetLocal(*t));
                    self.emit(Op::GetLocal(*k));
                    self.emit(Op::GetLocal(temp));
                    self.emit(Op::SetIndex);
                }
                (Expr::Name(name), _) => {
                    self.emit(Op::GetLocal(temp));
                    self.store_name(name)?;
                }
                _ => return Err(self.error("cannot assign")),
            }
        }
        self.func().active = saved;
        Ok(())
    }

    fn store_name(&mut self, name: &Name) -> Result<()> {
        match name {
            Name::Global(global) => {
                let idx = self.string_constant(global)?;
                self.emit(Op::SetGlobal(idx));
            }
            Name::Local(id) => {
                let depth = self.funcs.len() - 1;
                if self.locals[*id].depth == depth {
                    let slot = self.local_slot(*id)?;
                    if self.captured(*id) {
                        self.emit(Op::SetCell(slot));
                    } else {
                        self.emit(Op::SetLocal(slot));
                    }
                } else {
                    let idx = self.upvalue(depth, *id)?;
                    self.emit(Op::SetUpval(idx));
                }
            }
        }
        Ok(())
    }

    fn local_slot(&mut self, id: LocalId) -> Result<u16> {
        match self.func().slots.get(&id) {
            Some(&slot) => Ok(slot),
            None => Err(self.error("unresolved local")),
        }
    }

    // --- expressions ---

    /// Pushes exactly `n` values.
    fn expr_list(&mut self, exprs: &[Expr], n: usize) -> Result<()> {
        for (i, expr) in exprs.iter().enumerate() {
            let last = i + 1 == exprs.len();
            if last && expr.is_multi() {
                let want = n.saturating_sub(i);
                if want >= MULTI as usize {
                    return Err(self.error("too many values"));
                }
                return self.multi(expr, want as u8);
            }
            self.expr(expr)?;
            if i >= n {
                self.emit(Op::Pop(1));
            }
        }
        for _ in exprs.len()..n {
            self.emit(Op::Nil);
        }
        Ok(())
    }

    /// Pushes every value; returns the count of fixed values and whether the
    /// last expression pushed a variable number of values.
    fn expr_list_multi(&mut self, exprs: &[Expr]) -> Result<(u8, bool)> {
        if exprs.len() >= MULTI as usize {
            return Err(self.error("too many values"));
        }
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() && expr.is_multi() {
                self.multi(expr, MULTI)?;
                return Ok((i as u8, true));
            }
            self.expr(expr)?;
        }
        Ok((exprs.len() as u8, false))
    }

    fn multi(&mut self, expr: &Expr, want: u8) -> Result<()> {
        match expr {
            Expr::Vararg => {
                self.emit(Op::Vararg(want));
                Ok(())
            }
            _ => self.call(expr, want),
        }
    }

    fn call(&mut self, expr: &Expr, want: u8) -> Result<()> {
        match expr {
            Expr::Call(func, args, line) => {
                self.expr(func)?;
                let (fixed, multi) = self.expr_list_multi(args)?;
                self.func().line = *line;
                if multi {
                    self.emit(Op::CallMulti(fixed, want));
                } else {
                    self.emit(Op::Call(fixed, want));
                }
                Ok(())
            }
            Expr::Method(object, method, args, line) => {
                self.expr(object)?;
                let idx = self.string_constant(method)?;
                self.func().line = *line;
                self.emit(Op::Method(idx));
                let (fixed, multi) = self.expr_list_multi(args)?;
                if fixed as usize + 1 >= MULTI as usize {
                    return Err(self.error("too many arguments"));
                }
                self.func().line = *line;
                if multi {
                    self.emit(Op::CallMulti(fixed + 1, want));
                } else {
                    self.emit(Op::Call(fixed + 1, want));
                }
                Ok(())
            }
            _ => Err(self.error("function call expected")),
        }
    }

    fn closure(&mut self, body: &FuncBody) -> Result<()> {
        let proto = self.function(body)?;
        let func = self.func();
        let idx = func.proto.protos.len() as u32;
        func.proto.protos.push(proto);
        self.emit(Op::Closure(idx));
        Ok(())
    }

    /// Pushes exactly one value.
    fn expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Nil => {
                self.emit(Op::Nil);
            }
            Expr::True => {
                self.emit(Op::True);
            }
            Expr::False => {
                self.emit(Op::False);
            }
            Expr::Int(n) => {
                let idx = self.constant(Value::Integer(*n))?;
                self.emit(Op::Const(idx));
            }
            Expr::Str(s) => {
                let idx = self.string_constant(s)?;
                self.emit(Op::Const(idx));
            }
            Expr::Vararg => {
                self.emit(Op::Vararg(1));
            }
            Expr::Name(Name::Global(name)) => {
                let idx = self.string_constant(name)?;
                self.emit(Op::GetGlobal(idx));
            }
            Expr::Name(Name::Local(id)) => {
                let depth = self.funcs.len() - 1;
                if self.locals[*id].depth == depth {
                    let slot = self.local_slot(*id)?;
                    if self.captured(*id) {
                        self.emit(Op::GetCell(slot));
                    } else {
                        self.emit(Op::GetLocal(slot));
                    }
                } else {
                    let idx = self.upvalue(depth, *id)?;
                    self.emit(Op::GetUpval(idx));
                }
            }
            Expr::Index(table, key, line) => {
                self.expr(table)?;
                self.expr(key)?;
                self.func().line = *line;
                self.emit(Op::GetIndex);
            }
            Expr::Call(..) | Expr::Method(..) => self.call(expr, 1)?,
            Expr::Function(body) => self.closure(body)?,
            Expr::Binary(op, left, right, line) => {
                self.expr(left)?;
                self.expr(right)?;
                self.func().line = *line;
                self.emit(Op::Binary(*op));
            }
            Expr::And(left, right) => {
                self.expr(left)?;
                let end = self.emit(Op::JumpIfFalseOrPop(0));
                self.expr(right)?;
                self.patch(end);
            }
            Expr::Or(left, right) => {
                self.expr(left)?;
                let end = self.emit(Op::JumpIfTrueOrPop(0));
                self.expr(right)?;
                self.patch(end);
            }
            Expr::Unary(op, operand, line) => {
                self.expr(operand)?;
                self.func().line = *line;
                self.emit(match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                    UnOp::Len => Op::Len,
                });
            }
            Expr::Table(fields, line) => {
                self.func().line = *line;
                self.emit(Op::NewTable);
                let mut index: i64 = 1;
                for (i, field) in fields.iter().enumerate() {
                    match field {
                        Field::Keyed(key, value) => {
                            self.expr(key)?;
                            self.expr(value)?;
                            self.emit(Op::TableInit);
                        }
                        Field::Positional(value) if i + 1 == fields.len() && value.is_multi() => {
                            self.multi(value, MULTI)?;
                            self.emit(Op::TableAppendMulti(index as u32));
                        }
                        Field::Positional(value) => {
                            let idx = self.constant(Value::Integer(index))?;
                            self.emit(Op::Const(idx));
                            self.expr(value)?;
                            self.emit(Op::TableInit);
                            index += 1;
                        }
                    }
                }
            }
            Expr::Paren(inner) => self.expr(inner)?,
        }
        Ok(())
    }
}
