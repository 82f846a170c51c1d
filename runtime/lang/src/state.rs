//! The interpreter state and its bytecode VM.
//!
//! A [`State`] is a fully isolated interpreter: its own heap, globals and
//! threads. Execution is driven by an explicit frame stack per thread rather
//! than by Rust recursion, so a thread can be suspended in the middle of a
//! script (`coroutine.yield`) and resumed later, possibly from another OS
//! thread, as long as every yield happens directly from script code.
//!
//! Garbage collection runs only between instructions. Roots are the
//! globals, the pin registry, pending yield values and every thread on the
//! active chain. Native functions must therefore not keep freshly created
//! values in Rust locals across a call back into the VM.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::alloc::Allocator;
use crate::ast::BinOp;
use crate::bytecode::{Op, Proto, UpvalDesc, MULTI};
use crate::compiler;
use crate::error::{Error, Result};
use crate::heap::{Closure, Heap, NativeFn, Object, Table};
use crate::stdlib;
use crate::userdata::UserData;
use crate::value::{GcRef, Value};

/// Maximum number of nested calls, script and native combined.
pub const MAX_CALL_DEPTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but not started, or stopped at a yield
    Suspended,
    Running,
    /// Resumed another thread and is waiting for it
    Normal,
    Dead,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// Outcome of [`State::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumed {
    /// The thread yielded these values and may be resumed again
    Yielded(Vec<Value>),
    /// The thread's function returned these values; the thread is dead
    Returned(Vec<Value>),
}

/// Handle to a value kept alive by [`State::pin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId(u32);

enum RunOutcome {
    Returned(Vec<Value>),
    Yielded(Vec<Value>),
}

enum Callee {
    Script(GcRef, Arc<Proto>, Arc<[GcRef]>),
    Native(NativeFn),
}

pub(crate) struct Frame {
    closure: GcRef,
    proto: Arc<Proto>,
    upvals: Arc<[GcRef]>,
    pc: usize,
    base: usize,
    func_slot: usize,
    want: u8,
    /// Number of values produced by the last multi-value push
    varcount: usize,
    varargs: Vec<Value>,
}

pub(crate) struct Thread {
    id: Option<GcRef>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    status: ThreadStatus,
    /// Function to run on first resume
    start: Option<Value>,
    /// Call waiting for the values passed to the next resume
    pending: Option<(usize, u8)>,
    /// Native calls on this thread that re-entered the VM
    nested: usize,
}

impl Thread {
    fn new(id: Option<GcRef>, status: ThreadStatus) -> Self {
        Self {
            id,
            stack: Vec::new(),
            frames: Vec::new(),
            status,
            start: None,
            pending: None,
            nested: 0,
        }
    }

    pub(crate) fn trace(&self, out: &mut Vec<GcRef>) {
        out.extend(self.id);
        out.extend(self.stack.iter().filter_map(|v| v.gc_ref()));
        out.extend(self.start.and_then(|v| v.gc_ref()));
        for frame in &self.frames {
            out.push(frame.closure);
            out.extend(frame.varargs.iter().filter_map(|v| v.gc_ref()));
        }
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    fn peek(&self) -> Value {
        self.stack.last().copied().unwrap_or(Value::Nil)
    }

    fn frame(&mut self) -> &mut Frame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    /// Replaces the callee and its arguments at `func_slot` with `results`,
    /// adjusted to `want` values.
    fn place_results(&mut self, func_slot: usize, want: u8, mut results: Vec<Value>) {
        self.stack.truncate(func_slot);
        if want == MULTI {
            let n = results.len();
            self.stack.append(&mut results);
            if let Some(frame) = self.frames.last_mut() {
                frame.varcount = n;
            }
        } else {
            results.resize(want as usize, Value::Nil);
            self.stack.append(&mut results);
        }
    }
}

/// An isolated interpreter instance.
pub struct State {
    heap: Heap,
    globals: GcRef,
    string_lib: GcRef,
    registry: HashMap<u32, Value>,
    next_pin: u32,
    /// Active chain of threads; the main thread is first and the running one last
    threads: Vec<Box<Thread>>,
    pending_yield: Option<Vec<Value>>,
    native_depth: usize,
    extra: Option<Box<dyn Any + Send>>,
    output: Option<Box<dyn FnMut(&str) + Send>>,
}

impl State {
    /// Creates a state whose every allocation goes through `allocator`, with
    /// the standard library loaded.
    pub fn new(allocator: Box<dyn Allocator>) -> Result<Self> {
        let mut heap = Heap::new(allocator);
        let globals = heap.alloc(Object::Table(Table::default()))?;
        let string_lib = heap.alloc(Object::Table(Table::default()))?;

        let mut state = Self {
            heap,
            globals,
            string_lib,
            registry: HashMap::new(),
            next_pin: 0,
            threads: vec![Box::new(Thread::new(None, ThreadStatus::Running))],
            pending_yield: None,
            native_depth: 0,
            extra: None,
            output: None,
        };
        stdlib::open(&mut state)?;
        Ok(state)
    }

    pub(crate) fn string_lib(&self) -> Value {
        Value::Table(self.string_lib)
    }

    pub fn globals(&self) -> Value {
        Value::Table(self.globals)
    }

    // --- loading and calling ---

    /// Compiles `source` and returns it as a function.
    pub fn load(&mut self, chunk: &str, source: &str) -> Result<Value> {
        let proto = compiler::compile(&mut self.heap, chunk, source)?;
        let r = self.heap.alloc(Object::Closure(Closure {
            proto,
            upvals: Arc::from(Vec::new()),
        }))?;
        Ok(Value::Function(r))
    }

    /// Calls `func` on the running thread and returns all its results.
    ///
    /// On error the thread's stack is restored to what it was before the call.
    pub fn call(&mut self, func: Value, args: &[Value]) -> Result<Vec<Value>> {
        let idx = self.threads.len() - 1;
        let th = &mut self.threads[idx];
        let stack_mark = th.stack.len();
        let frames_mark = th.frames.len();
        th.stack.push(func);
        th.stack.extend_from_slice(args);
        th.nested += 1;

        let result = self.call_inner(stack_mark, args.len(), frames_mark);

        let th = &mut self.threads[idx];
        th.nested -= 1;
        if result.is_err() {
            th.stack.truncate(stack_mark);
            th.frames.truncate(frames_mark);
            self.pending_yield = None;
        }
        result
    }

    fn call_inner(&mut self, func_slot: usize, argc: usize, frames_mark: usize) -> Result<Vec<Value>> {
        let func = self.thread().stack[func_slot];
        match self.callee(func)? {
            Callee::Script(closure, proto, upvals) => {
                self.push_frame(closure, proto, upvals, func_slot, argc, MULTI)?;
                match self.run(frames_mark)? {
                    RunOutcome::Returned(values) => Ok(values),
                    RunOutcome::Yielded(_) => Err(Error::runtime(
                        "attempt to yield across a native call boundary",
                    )),
                }
            }
            Callee::Native(f) => {
                let args = self.thread().stack[func_slot + 1..].to_vec();
                let results = self.call_native(&f, &args)?;
                self.thread().stack.truncate(func_slot);
                Ok(results)
            }
        }
    }

    fn call_native(&mut self, f: &NativeFn, args: &[Value]) -> Result<Vec<Value>> {
        if self.native_depth >= MAX_CALL_DEPTH {
            return Err(Error::runtime("stack overflow (native calls)"));
        }
        self.native_depth += 1;
        let result = f(self, args);
        self.native_depth -= 1;
        result
    }

    fn callee(&self, func: Value) -> Result<Callee> {
        if let Value::Function(r) = func {
            match self.heap.get(r) {
                Some(Object::Closure(c)) => {
                    return Ok(Callee::Script(r, c.proto.clone(), c.upvals.clone()))
                }
                Some(Object::Native(f)) => return Ok(Callee::Native(f.clone())),
                _ => {}
            }
        }
        Err(Error::runtime(format!(
            "attempt to call a {} value",
            func.type_name()
        )))
    }

    fn thread(&mut self) -> &mut Thread {
        let idx = self.threads.len() - 1;
        &mut self.threads[idx]
    }

    fn push_frame(
        &mut self,
        closure: GcRef,
        proto: Arc<Proto>,
        upvals: Arc<[GcRef]>,
        func_slot: usize,
        argc: usize,
        want: u8,
    ) -> Result<()> {
        let th = self.thread();
        if th.frames.len() >= MAX_CALL_DEPTH {
            return Err(Error::runtime("stack overflow"));
        }
        let base = func_slot + 1;
        let params = proto.params as usize;
        let mut varargs = Vec::new();
        if argc > params {
            if proto.is_vararg {
                varargs = th.stack.split_off(base + params);
            } else {
                th.stack.truncate(base + params);
            }
        }
        th.stack.resize(base + proto.slots as usize, Value::Nil);
        th.frames.push(Frame {
            closure,
            proto,
            upvals,
            pc: 0,
            base,
            func_slot,
            want,
            varcount: 0,
            varargs,
        });
        Ok(())
    }

    // --- threads ---

    /// Creates a suspended thread that will run `func` on first resume.
    pub fn new_thread(&mut self, func: Value) -> Result<Value> {
        self.callee(func)?;
        let mut thread = Thread::new(None, ThreadStatus::Suspended);
        thread.start = Some(func);
        let r = self.heap.alloc(Object::Thread(Some(Box::new(thread))))?;
        if let Some(Object::Thread(Some(thread))) = self.heap.get_mut(r) {
            thread.id = Some(r);
        }
        Ok(Value::Thread(r))
    }

    pub fn thread_status(&self, thread: Value) -> Option<ThreadStatus> {
        let Value::Thread(r) = thread else {
            return None;
        };
        match self.heap.get(r) {
            Some(Object::Thread(Some(th))) => Some(th.status),
            Some(Object::Thread(None)) => self
                .threads
                .iter()
                .find(|th| th.id == Some(r))
                .map(|th| th.status),
            _ => None,
        }
    }

    /// Starts or continues `thread`, passing `args` as the function arguments
    /// (first resume) or as the results of the pending `coroutine.yield`.
    ///
    /// A script error kills the thread and is returned as `Err`.
    pub fn resume(&mut self, thread: Value, args: &[Value]) -> Result<Resumed> {
        let Value::Thread(r) = thread else {
            return Err(Error::runtime(format!(
                "cannot resume a {} value",
                thread.type_name()
            )));
        };
        let mut th = match self.heap.get_mut(r) {
            Some(Object::Thread(slot)) => match slot.take() {
                Some(th) => th,
                None => return Err(Error::runtime("cannot resume non-suspended coroutine")),
            },
            _ => return Err(Error::runtime("cannot resume a dead object")),
        };

        if th.status == ThreadStatus::Dead || self.threads.len() >= MAX_CALL_DEPTH {
            let message = if th.status == ThreadStatus::Dead {
                "cannot resume dead coroutine"
            } else {
                "stack overflow (coroutines)"
            };
            self.put_thread(r, th);
            return Err(Error::runtime(message));
        }

        th.status = ThreadStatus::Running;
        self.thread().status = ThreadStatus::Normal;
        self.threads.push(th);

        let outcome = self.resume_current(args);

        if let Some(mut th) = self.threads.pop() {
            th.status = match outcome {
                Ok(Resumed::Yielded(_)) => ThreadStatus::Suspended,
                _ => {
                    th.stack.clear();
                    th.frames.clear();
                    th.pending = None;
                    ThreadStatus::Dead
                }
            };
            self.put_thread(r, th);
        }
        self.thread().status = ThreadStatus::Running;
        if outcome.is_err() {
            self.pending_yield = None;
        }
        outcome
    }

    fn put_thread(&mut self, r: GcRef, th: Box<Thread>) {
        if let Some(Object::Thread(slot)) = self.heap.get_mut(r) {
            *slot = Some(th);
        }
    }

    fn resume_current(&mut self, args: &[Value]) -> Result<Resumed> {
        let th = self.thread();
        if let Some(func) = th.start.take() {
            th.stack.clear();
            th.stack.push(func);
            th.stack.extend_from_slice(args);
            match self.callee(func)? {
                Callee::Script(closure, proto, upvals) => {
                    self.push_frame(closure, proto, upvals, 0, args.len(), MULTI)?;
                }
                Callee::Native(f) => {
                    let results = self.call_native(&f, args)?;
                    self.thread().stack.clear();
                    return Ok(match self.pending_yield.take() {
                        Some(values) => Resumed::Yielded(values),
                        None => Resumed::Returned(results),
                    });
                }
            }
        } else {
            match th.pending.take() {
                Some((func_slot, want)) => th.place_results(func_slot, want, args.to_vec()),
                // Yielded from a native entry function: resuming finishes it.
                None => return Ok(Resumed::Returned(args.to_vec())),
            }
        }

        match self.run(0)? {
            RunOutcome::Returned(values) => Ok(Resumed::Returned(values)),
            RunOutcome::Yielded(values) => Ok(Resumed::Yielded(values)),
        }
    }

    /// Whether the running code may call [`State::request_yield`].
    pub fn is_yieldable(&self) -> bool {
        self.threads.len() > 1 && self.threads.last().map_or(false, |th| th.nested == 0)
    }

    /// Asks the VM to suspend the running thread with `values` once the
    /// current native function returns.
    pub fn request_yield(&mut self, values: Vec<Value>) -> Result<()> {
        if self.threads.len() == 1 {
            return Err(Error::runtime("attempt to yield from outside a coroutine"));
        }
        if !self.is_yieldable() {
            return Err(Error::runtime(
                "attempt to yield across a native call boundary",
            ));
        }
        self.pending_yield = Some(values);
        Ok(())
    }

    // --- the interpreter loop ---

    /// Executes the running thread until its frame count drops to `stop_at`.
    fn run(&mut self, stop_at: usize) -> Result<RunOutcome> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            let op = {
                let frame = self.thread().frame();
                let op = frame.proto.code[frame.pc];
                frame.pc += 1;
                op
            };
            match self.step(op, stop_at) {
                Ok(None) => {}
                Ok(Some(outcome)) => return Ok(outcome),
                Err(e) => return Err(self.locate(e)),
            }
        }
    }

    /// Prefixes an unlocated error with the current position and records a
    /// traceback.
    fn locate(&mut self, e: Error) -> Error {
        if e.is_located() {
            return e;
        }
        let traceback = self.traceback();
        let message = match e {
            Error::Runtime { message, .. } => message,
            other => return other,
        };
        let message = match self.threads.last().and_then(|th| th.frames.last()) {
            Some(frame) => format!(
                "{}:{}: {}",
                frame.proto.chunk,
                frame.proto.line_at(frame.pc.saturating_sub(1)),
                message
            ),
            None => message,
        };
        Error::Runtime { message, traceback }
    }

    /// Active frames of the running thread, innermost first.
    pub fn traceback(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .threads
            .last()
            .map(|th| {
                th.frames
                    .iter()
                    .rev()
                    .map(|frame| {
                        let line = frame.proto.line_at(frame.pc.saturating_sub(1));
                        if frame.proto.line == 0 {
                            format!("{}:{}: in main chunk", frame.proto.chunk, line)
                        } else {
                            format!(
                                "{}:{}: in function '{}'",
                                frame.proto.chunk, line, frame.proto.name
                            )
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        if lines.is_empty() {
            lines.push("[native]: in ?".into());
        }
        lines
    }

    fn step(&mut self, op: Op, stop_at: usize) -> Result<Option<RunOutcome>> {
        let idx = self.threads.len() - 1;
        let th = &mut self.threads[idx];
        let top = th.frames.len() - 1;
        let base = th.frames[top].base;

        match op {
            Op::Nil => th.stack.push(Value::Nil),
            Op::True => th.stack.push(Value::Boolean(true)),
            Op::False => th.stack.push(Value::Boolean(false)),
            Op::Const(i) => {
                let v = th.frames[top].proto.constants[i as usize];
                th.stack.push(v);
            }
            Op::Pop(n) => {
                let len = th.stack.len().saturating_sub(n as usize);
                th.stack.truncate(len);
            }
            Op::GetLocal(slot) => {
                let v = th.stack[base + slot as usize];
                th.stack.push(v);
            }
            Op::SetLocal(slot) => {
                let v = th.pop();
                th.stack[base + slot as usize] = v;
            }
            Op::InitCell(slot) => {
                let v = th.pop();
                let cell = self.heap.alloc(Object::Cell(v))?;
                self.threads[idx].stack[base + slot as usize] = Value::Cell(cell);
            }
            Op::GetCell(slot) => {
                let v = match th.stack[base + slot as usize] {
                    Value::Cell(cell) => self.heap.cell(cell),
                    other => other,
                };
                th.stack.push(v);
            }
            Op::SetCell(slot) => {
                let v = th.pop();
                match th.stack[base + slot as usize] {
                    Value::Cell(cell) => self.heap.set_cell(cell, v),
                    _ => th.stack[base + slot as usize] = v,
                }
            }
            Op::GetUpval(i) => {
                let cell = th.frames[top].upvals[i as usize];
                let v = self.heap.cell(cell);
                th.stack.push(v);
            }
            Op::SetUpval(i) => {
                let v = th.pop();
                let cell = th.frames[top].upvals[i as usize];
                self.heap.set_cell(cell, v);
            }
            Op::GetGlobal(i) => {
                let key = th.frames[top].proto.constants[i as usize];
                let v = self
                    .heap
                    .table(self.globals)
                    .map_or(Value::Nil, |g| g.get(key));
                th.stack.push(v);
            }
            Op::SetGlobal(i) => {
                let key = th.frames[top].proto.constants[i as usize];
                let v = th.pop();
                self.heap.table_set(self.globals, key, v)?;
            }
            Op::NewTable => {
                let r = self.heap.alloc(Object::Table(Table::default()))?;
                self.threads[idx].stack.push(Value::Table(r));
            }
            Op::GetIndex => {
                let key = th.pop();
                let target = th.pop();
                let v = self.index(target, key)?;
                self.thread().stack.push(v);
            }
            Op::SetIndex => {
                let value = th.pop();
                let key = th.pop();
                let target = th.pop();
                self.set_index(target, key, value)?;
            }
            Op::TableInit => {
                let value = th.pop();
                let key = th.pop();
                let target = th.peek();
                self.set_index(target, key, value)?;
            }
            Op::TableAppendMulti(start) => {
                let n = th.frames[top].varcount;
                let values = th.pop_n(n);
                let target = th.peek();
                for (i, value) in values.into_iter().enumerate() {
                    self.set_index(target, Value::Integer(start as i64 + i as i64), value)?;
                }
            }
            Op::Method(i) => {
                let name = th.frames[top].proto.constants[i as usize];
                let object = th.pop();
                let method = self.index(object, name)?;
                let th = self.thread();
                th.stack.push(method);
                th.stack.push(object);
            }
            Op::Closure(i) => {
                let frame = &th.frames[top];
                let proto = frame.proto.protos[i as usize].clone();
                let mut upvals = Vec::with_capacity(proto.upvals.len());
                for desc in &proto.upvals {
                    match *desc {
                        UpvalDesc::Local(slot) => match th.stack[base + slot as usize] {
                            Value::Cell(cell) => upvals.push(cell),
                            _ => return Err(Error::runtime("upvalue is not a cell")),
                        },
                        UpvalDesc::Upval(j) => upvals.push(frame.upvals[j as usize]),
                    }
                }
                let r = self.heap.alloc(Object::Closure(Closure {
                    proto,
                    upvals: Arc::from(upvals),
                }))?;
                self.threads[idx].stack.push(Value::Function(r));
            }
            Op::Vararg(want) => {
                let frame = &mut th.frames[top];
                let mut values = frame.varargs.clone();
                if want == MULTI {
                    frame.varcount = values.len();
                } else {
                    values.resize(want as usize, Value::Nil);
                }
                th.stack.append(&mut values);
            }
            Op::Call(argc, want) => {
                return self.call_value(argc as usize, want);
            }
            Op::CallMulti(fixed, want) => {
                let argc = fixed as usize + th.frames[top].varcount;
                return self.call_value(argc, want);
            }
            Op::Return(n) => return Ok(self.return_values(n as usize, stop_at)),
            Op::ReturnMulti(fixed) => {
                let n = fixed as usize + th.frames[top].varcount;
                return Ok(self.return_values(n, stop_at));
            }
            Op::Jump(target) => th.frames[top].pc = target as usize,
            Op::JumpIfFalse(target) => {
                if !th.pop().is_truthy() {
                    th.frames[top].pc = target as usize;
                }
            }
            Op::JumpIfFalseOrPop(target) => {
                if th.peek().is_truthy() {
                    th.pop();
                } else {
                    th.frames[top].pc = target as usize;
                }
            }
            Op::JumpIfTrueOrPop(target) => {
                if th.peek().is_truthy() {
                    th.frames[top].pc = target as usize;
                } else {
                    th.pop();
                }
            }
            Op::ForPrep(slot, exit) => {
                let at = base + slot as usize;
                let (start, limit, step) = match (th.stack[at], th.stack[at + 1], th.stack[at + 2]) {
                    (Value::Integer(a), Value::Integer(b), Value::Integer(c)) => (a, b, c),
                    (Value::Integer(_), Value::Integer(_), _) => {
                        return Err(Error::runtime("'for' step must be a number"))
                    }
                    (Value::Integer(_), _, _) => {
                        return Err(Error::runtime("'for' limit must be a number"))
                    }
                    _ => return Err(Error::runtime("'for' initial value must be a number")),
                };
                if step == 0 {
                    return Err(Error::runtime("'for' step is zero"));
                }
                if (step > 0 && start > limit) || (step < 0 && start < limit) {
                    th.frames[top].pc = exit as usize;
                } else {
                    th.stack[at + 3] = Value::Integer(start);
                }
            }
            Op::ForLoop(slot, body) => {
                let at = base + slot as usize;
                if let (Value::Integer(idx), Value::Integer(limit), Value::Integer(step)) =
                    (th.stack[at], th.stack[at + 1], th.stack[at + 2])
                {
                    if let Some(next) = idx.checked_add(step) {
                        let more = if step > 0 { next <= limit } else { next >= limit };
                        if more {
                            th.stack[at] = Value::Integer(next);
                            th.stack[at + 3] = Value::Integer(next);
                            th.frames[top].pc = body as usize;
                        }
                    }
                }
            }
            Op::TForLoop(slot, n, exit) => {
                let at = base + slot as usize;
                let values = th.pop_n(n as usize);
                let first = values.first().copied().unwrap_or(Value::Nil);
                if first.is_nil() {
                    th.frames[top].pc = exit as usize;
                } else {
                    th.stack[at + 2] = first;
                    for (i, value) in values.into_iter().enumerate() {
                        th.stack[at + 3 + i] = value;
                    }
                }
            }
            Op::Binary(op) => {
                let right = th.pop();
                let left = th.pop();
                let v = self.binary(op, left, right)?;
                self.thread().stack.push(v);
            }
            Op::Neg => {
                let v = th.pop();
                let n = self.to_integer(v).ok_or_else(|| {
                    Error::runtime(format!(
                        "attempt to perform arithmetic on a {} value",
                        v.type_name()
                    ))
                })?;
                self.thread().stack.push(Value::Integer(n.wrapping_neg()));
            }
            Op::Not => {
                let v = th.pop();
                th.stack.push(Value::Boolean(!v.is_truthy()));
            }
            Op::Len => {
                let v = th.pop();
                let n = match v {
                    Value::String(r) => self.heap.string(r).map_or(0, |s| s.len() as i64),
                    Value::Table(r) => self.heap.table(r).map_or(0, |t| t.len()),
                    other => {
                        return Err(Error::runtime(format!(
                            "attempt to get length of a {} value",
                            other.type_name()
                        )))
                    }
                };
                self.thread().stack.push(Value::Integer(n));
            }
        }
        Ok(None)
    }

    fn call_value(&mut self, argc: usize, want: u8) -> Result<Option<RunOutcome>> {
        let th = self.thread();
        let func_slot = th.stack.len() - argc - 1;
        let func = th.stack[func_slot];
        match self.callee(func)? {
            Callee::Script(closure, proto, upvals) => {
                self.push_frame(closure, proto, upvals, func_slot, argc, want)?;
                Ok(None)
            }
            Callee::Native(f) => {
                let args = self.thread().stack[func_slot + 1..].to_vec();
                let results = self.call_native(&f, &args)?;
                let pending = self.pending_yield.take();
                let th = self.thread();
                if let Some(values) = pending {
                    th.stack.truncate(func_slot);
                    th.pending = Some((func_slot, want));
                    return Ok(Some(RunOutcome::Yielded(values)));
                }
                th.place_results(func_slot, want, results);
                Ok(None)
            }
        }
    }

    fn return_values(&mut self, n: usize, stop_at: usize) -> Option<RunOutcome> {
        let th = self.thread();
        let values = th.pop_n(n);
        let frame = th.frames.pop()?;
        if th.frames.len() == stop_at {
            th.stack.truncate(frame.func_slot);
            return Some(RunOutcome::Returned(values));
        }
        th.place_results(frame.func_slot, frame.want, values);
        None
    }

    // --- value operations ---

    fn to_integer(&self, v: Value) -> Option<i64> {
        match v {
            Value::Integer(n) => Some(n),
            Value::String(r) => self.heap.string(r).and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    fn binary(&mut self, op: BinOp, left: Value, right: Value) -> Result<Value> {
        match op {
            BinOp::Eq => return Ok(Value::Boolean(left == right)),
            BinOp::Ne => return Ok(Value::Boolean(left != right)),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                return self.compare(op, left, right).map(Value::Boolean)
            }
            BinOp::Concat => return self.concat(left, right),
            _ => {}
        }

        let (Some(a), Some(b)) = (self.to_integer(left), self.to_integer(right)) else {
            let culprit = if self.to_integer(left).is_none() {
                left
            } else {
                right
            };
            return Err(Error::runtime(format!(
                "attempt to perform arithmetic on a {} value",
                culprit.type_name()
            )));
        };
        arith(op, a, b).map(Value::Integer)
    }

    fn compare(&self, op: BinOp, left: Value, right: Value) -> Result<bool> {
        let ordering = match (left, right) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(&b),
            (Value::String(a), Value::String(b)) => {
                let a = self.heap.string(a).unwrap_or_default();
                let b = self.heap.string(b).unwrap_or_default();
                a.cmp(b)
            }
            (a, b) if a.type_name() == b.type_name() => {
                return Err(Error::runtime(format!(
                    "attempt to compare two {} values",
                    a.type_name()
                )))
            }
            (a, b) => {
                return Err(Error::runtime(format!(
                    "attempt to compare {} with {}",
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        Ok(match op {
            BinOp::Lt => ordering.is_lt(),
            BinOp::Le => ordering.is_le(),
            BinOp::Gt => ordering.is_gt(),
            _ => ordering.is_ge(),
        })
    }

    fn concat(&mut self, left: Value, right: Value) -> Result<Value> {
        let mut text = String::new();
        for v in [left, right] {
            match v {
                Value::String(r) => text.push_str(self.heap.string(r).unwrap_or_default()),
                Value::Integer(n) => text.push_str(&n.to_string()),
                other => {
                    return Err(Error::runtime(format!(
                        "attempt to concatenate a {} value",
                        other.type_name()
                    )))
                }
            }
        }
        self.new_string(&text)
    }

    /// `target[key]`, dispatching to strings' methods and userdata.
    pub fn index(&mut self, target: Value, key: Value) -> Result<Value> {
        match target {
            Value::Table(r) => Ok(self.heap.table(r).map_or(Value::Nil, |t| t.get(key))),
            Value::String(_) => Ok(self
                .heap
                .table(self.string_lib)
                .map_or(Value::Nil, |t| t.get(key))),
            Value::Userdata(_) => match self.userdata(target) {
                Some(ud) => ud.index(self, key),
                None => Ok(Value::Nil),
            },
            other => Err(Error::runtime(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }

    /// `target[key] = value`, dispatching to userdata.
    pub fn set_index(&mut self, target: Value, key: Value, value: Value) -> Result<()> {
        match target {
            Value::Table(r) => {
                if key.is_nil() {
                    return Err(Error::runtime("table index is nil"));
                }
                self.heap.table_set(r, key, value)
            }
            Value::Userdata(_) => match self.userdata(target) {
                Some(ud) => ud.new_index(self, key, value),
                None => Ok(()),
            },
            other => Err(Error::runtime(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }

    // --- embedding API ---

    pub fn new_string(&mut self, s: &str) -> Result<Value> {
        Ok(Value::String(self.heap.intern(s)?))
    }

    /// Contents of a string value.
    pub fn to_str(&self, v: Value) -> Option<&str> {
        match v {
            Value::String(r) => self.heap.string(r),
            _ => None,
        }
    }

    pub fn new_table(&mut self) -> Result<Value> {
        Ok(Value::Table(self.heap.alloc(Object::Table(Table::default()))?))
    }

    pub fn raw_get(&self, table: Value, key: Value) -> Result<Value> {
        match table {
            Value::Table(r) => Ok(self.heap.table(r).map_or(Value::Nil, |t| t.get(key))),
            other => Err(Error::runtime(format!(
                "table expected, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn raw_set(&mut self, table: Value, key: Value, value: Value) -> Result<()> {
        match table {
            Value::Table(_) => self.set_index(table, key, value),
            other => Err(Error::runtime(format!(
                "table expected, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn raw_len(&self, table: Value) -> i64 {
        match table {
            Value::Table(r) => self.heap.table(r).map_or(0, |t| t.len()),
            _ => 0,
        }
    }

    /// The entry after `key` in `table`, for traversals.
    pub fn next(&self, table: Value, key: Value) -> Result<Option<(Value, Value)>> {
        match table {
            Value::Table(r) => match self.heap.table(r) {
                Some(t) => t.next(key),
                None => Ok(None),
            },
            other => Err(Error::runtime(format!(
                "table expected, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<()> {
        let key = self.new_string(name)?;
        self.heap.table_set(self.globals, key, value)
    }

    pub fn get_global(&self, name: &str) -> Value {
        match self.heap.lookup(name) {
            Some(r) => self
                .heap
                .table(self.globals)
                .map_or(Value::Nil, |g| g.get(Value::String(r))),
            None => Value::Nil,
        }
    }

    /// Wraps a Rust closure as a script function.
    pub fn new_function<F>(&mut self, f: F) -> Result<Value>
    where
        F: Fn(&mut State, &[Value]) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let f: NativeFn = Arc::new(f);
        Ok(Value::Function(self.heap.alloc(Object::Native(f))?))
    }

    /// Defines a global function.
    pub fn register<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&mut State, &[Value]) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let func = self.new_function(f)?;
        self.set_global(name, func)
    }

    pub fn new_userdata(&mut self, data: Arc<dyn UserData>) -> Result<Value> {
        Ok(Value::Userdata(self.heap.alloc(Object::Userdata(data))?))
    }

    pub fn userdata(&self, v: Value) -> Option<Arc<dyn UserData>> {
        match v {
            Value::Userdata(r) => match self.heap.get(r) {
                Some(Object::Userdata(data)) => Some(data.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Keeps `v` alive across collections until [`State::unpin`].
    pub fn pin(&mut self, v: Value) -> PinId {
        let id = self.next_pin;
        self.next_pin = self.next_pin.wrapping_add(1);
        self.registry.insert(id, v);
        PinId(id)
    }

    pub fn pinned(&self, id: PinId) -> Value {
        self.registry.get(&id.0).copied().unwrap_or(Value::Nil)
    }

    pub fn unpin(&mut self, id: PinId) -> Option<Value> {
        self.registry.remove(&id.0)
    }

    /// Attaches host data to the state, replacing any previous value.
    pub fn set_extra<T: Any + Send>(&mut self, data: T) {
        self.extra = Some(Box::new(data));
    }

    pub fn extra<T: Any + Send>(&self) -> Option<&T> {
        self.extra.as_ref().and_then(|e| e.downcast_ref())
    }

    pub fn extra_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.extra.as_mut().and_then(|e| e.downcast_mut())
    }

    /// Redirects `print`; by default output goes to the `log` facade.
    pub fn set_output<F: FnMut(&str) + Send + 'static>(&mut self, output: F) {
        self.output = Some(Box::new(output));
    }

    pub(crate) fn write_output(&mut self, line: &str) {
        match self.output.as_mut() {
            Some(output) => output(line),
            None => log::info!(target: "kscript::print", "{}", line),
        }
    }

    /// Runs a full collection and returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots = vec![self.globals, self.string_lib];
        roots.extend(self.registry.values().filter_map(|v| v.gc_ref()));
        if let Some(values) = &self.pending_yield {
            roots.extend(values.iter().filter_map(|v| v.gc_ref()));
        }
        for th in &self.threads {
            th.trace(&mut roots);
        }
        self.heap.collect(roots)
    }

    /// Bytes currently charged to the allocator.
    pub fn memory_in_use(&self) -> usize {
        self.heap.in_use()
    }

    pub fn object_count(&self) -> usize {
        self.heap.len()
    }

    /// Converts any value to text, as `tostring` does.
    pub fn tostring(&self, v: Value) -> String {
        match v {
            Value::String(r) => self.heap.string(r).unwrap_or_default().to_string(),
            Value::Userdata(_) => match self.userdata(v) {
                Some(ud) => ud
                    .to_display()
                    .unwrap_or_else(|| format!("{}: 0x{:08x}", ud.type_name(), v.gc_ref().map_or(0, |r| r.id()))),
                None => v.to_string(),
            },
            Value::Function(r) => match self.heap.get(r) {
                Some(Object::Native(_)) => format!("builtin: 0x{:08x}", r.id()),
                _ => v.to_string(),
            },
            other => other.to_string(),
        }
    }
}

fn arith(op: BinOp, a: i64, b: i64) -> Result<i64> {
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div | BinOp::IDiv => {
            if b == 0 {
                return Err(Error::runtime("attempt to perform 'n//0'"));
            }
            floor_div(a, b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Error::runtime("attempt to perform 'n%0'"));
            }
            a.wrapping_sub(floor_div(a, b).wrapping_mul(b))
        }
        BinOp::Pow => {
            if b < 0 {
                return Err(Error::runtime("negative exponent"));
            }
            let exp = u32::try_from(b).unwrap_or(u32::MAX);
            a.wrapping_pow(exp)
        }
        _ => return Err(Error::runtime("invalid arithmetic operator")),
    };
    Ok(v)
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;

    fn state() -> State {
        State::new(Box::new(CountingAllocator::new())).unwrap()
    }

    fn eval(state: &mut State, source: &str) -> Result<Vec<Value>> {
        let f = state.load("test", source)?;
        state.call(f, &[])
    }

    #[test]
    fn test_arith() {
        assert_eq!(arith(BinOp::IDiv, 7, 2), Ok(3));
        assert_eq!(arith(BinOp::IDiv, -7, 2), Ok(-4));
        assert_eq!(arith(BinOp::Mod, -7, 2), Ok(1));
        assert_eq!(arith(BinOp::Mod, 7, -2), Ok(-1));
        assert_eq!(arith(BinOp::Pow, 2, 10), Ok(1024));
        assert!(arith(BinOp::Div, 1, 0).is_err());
    }

    #[test]
    fn test_return_values() {
        let mut state = state();
        let values = eval(&mut state, "return 1, 2 + 3, nil").unwrap();
        assert_eq!(
            values,
            vec![Value::Integer(1), Value::Integer(5), Value::Nil]
        );
    }

    #[test]
    fn test_closures_share_cells() {
        let mut state = state();
        let values = eval(
            &mut state,
            r#"
            local function counter()
                local n = 0
                return function() n = n + 1 return n end
            end
            local a, b = counter(), counter()
            a() a()
            return a(), b()
            "#,
        )
        .unwrap();
        assert_eq!(values, vec![Value::Integer(3), Value::Integer(1)]);
    }

    #[test]
    fn test_loop_variables_are_fresh() {
        let mut state = state();
        let values = eval(
            &mut state,
            r#"
            local fns = {}
            for i = 1, 3 do fns[i] = function() return i end end
            return fns[1]() + fns[2]() * 10 + fns[3]() * 100
            "#,
        )
        .unwrap();
        assert_eq!(values, vec![Value::Integer(321)]);
    }

    #[test]
    fn test_error_location() {
        let mut state = state();
        let err = eval(&mut state, "local x = nil\nreturn x.y").unwrap_err();
        assert_eq!(err.to_string(), "test:2: attempt to index a nil value");
        assert_eq!(err.traceback(), &["test:2: in main chunk".to_string()]);
    }

    #[test]
    fn test_error_restores_stack() {
        let mut state = state();
        assert!(eval(&mut state, "error('x')").is_err());
        let values = eval(&mut state, "return 42").unwrap();
        assert_eq!(values, vec![Value::Integer(42)]);
        assert!(state.threads[0].stack.is_empty());
    }

    #[test]
    fn test_stack_overflow() {
        let mut state = state();
        let err = eval(&mut state, "local function f() return f() + 1 end return f()").unwrap_err();
        assert!(err.to_string().contains("stack overflow"));
    }

    #[test]
    fn test_resume_and_yield() {
        let mut state = state();
        let f = state
            .load(
                "co",
                "local a = ... local b = coroutine.yield(a + 1) return b * 2",
            )
            .unwrap();
        let co = state.new_thread(f).unwrap();
        assert_eq!(state.thread_status(co), Some(ThreadStatus::Suspended));

        let first = state.resume(co, &[Value::Integer(1)]).unwrap();
        assert_eq!(first, Resumed::Yielded(vec![Value::Integer(2)]));

        let second = state.resume(co, &[Value::Integer(5)]).unwrap();
        assert_eq!(second, Resumed::Returned(vec![Value::Integer(10)]));
        assert_eq!(state.thread_status(co), Some(ThreadStatus::Dead));
        assert!(state.resume(co, &[]).is_err());
    }

    #[test]
    fn test_yield_outside_coroutine() {
        let mut state = state();
        let err = eval(&mut state, "coroutine.yield(1)").unwrap_err();
        assert!(err.to_string().contains("outside a coroutine"));
    }

    #[test]
    fn test_gc_keeps_reachable() {
        let mut state = state();
        eval(&mut state, "keep = { 'a', 'b' } local tmp = { 'c' }").unwrap();
        let before = state.object_count();
        assert!(state.collect_garbage() > 0);
        assert!(state.object_count() < before);
        let values = eval(&mut state, "return keep[2]").unwrap();
        assert_eq!(state.to_str(values[0]), Some("b"));
    }

    #[test]
    fn test_pins_survive_collection() {
        let mut state = state();
        let t = state.new_table().unwrap();
        let id = state.pin(t);
        state.collect_garbage();
        assert_eq!(state.pinned(id), t);
        let key = state.new_string("x").unwrap();
        state.raw_set(t, key, Value::Integer(1)).unwrap();
        assert_eq!(state.unpin(id), Some(t));
    }

    #[test]
    fn test_memory_limit() {
        let mut state = State::new(Box::new(CountingAllocator::with_limit(256 * 1024))).unwrap();
        let err = eval(
            &mut state,
            "local t = {} for i = 1, 100000 do t[i] = tostring(i) end",
        )
        .unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
    }
}
