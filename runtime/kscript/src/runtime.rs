//! Embedded-interpreter runtimes
//!
//! A [`Runtime`] is a generic object whose payload is an isolated script
//! state. Its life follows
//!
//! ```text
//! Uninitialized -> Loading -> Ready -> (Running <-> Ready) -> Stopped
//! ```
//!
//! - **Loading**: the state is created with an allocator bridged to
//!   [`KernelMemory`], and the bootstrap script runs to completion. Loading
//!   may sleep, even for non-sleep runtimes.
//! - **Ready**: for non-sleep runtimes, the allocator flags are narrowed to
//!   [`Gfp::ATOMIC`] for good.
//! - **Running**: every resume holds the runtime's lock, a mutex or a spin
//!   lock depending on its class, so one state never runs on two threads.
//!   A task that yields releases the lock and keeps its continuation.
//! - **Stopped**: the state has been closed and cannot run again.

use core::fmt;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kscript_lang::{AllocError, Allocator, Block, PinId, State, ThreadStatus, Value};

use crate::bind::{self, Context};
use crate::class::{Class, ClassFlags, Method};
use crate::context;
use crate::error::{Error, Result};
use crate::kmem::{Extent, Gfp, KernelMemory};
use crate::object::Object;
use crate::rcu;

/// Runtime that may sleep; locked by a mutex
pub static RUNTIME: Class = Class {
    name: "runtime",
    methods: &[Method {
        name: "resume",
        op: bind::resume_runtime,
    }],
    release: None,
    flags: ClassFlags::SLEEP.union(ClassFlags::POINTER),
};

/// Runtime usable from atomic context; locked by a spin lock
pub static RUNTIME_ATOMIC: Class = Class {
    name: "runtime",
    methods: &[Method {
        name: "resume",
        op: bind::resume_runtime,
    }],
    release: None,
    flags: ClassFlags::POINTER,
};

/// Lifecycle of a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Loading,
    Ready,
    Running,
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Uninitialized => "uninitialized",
            RuntimeState::Loading => "loading",
            RuntimeState::Ready => "ready",
            RuntimeState::Running => "running",
            RuntimeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Finds bootstrap scripts by name
pub trait ScriptLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<String>;
}

/// Loads `<dir>/<name>.ks`
#[derive(Debug, Clone)]
pub struct DirLoader {
    dir: PathBuf,
}

impl DirLoader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl ScriptLoader for DirLoader {
    fn load(&self, name: &str) -> Result<String> {
        // Names are identifiers, not paths.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        }
        let path = self.dir.join(format!("{}.ks", name));
        std::fs::read_to_string(&path).map_err(|e| {
            log::warn!("cannot load {}: {}", path.display(), e);
            Error::NotFound {
                name: path.display().to_string(),
            }
        })
    }
}

/// Serves scripts registered in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    scripts: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.scripts.insert(name.into(), source.into());
    }

    /// Builder form of [`MemoryLoader::insert`]
    pub fn with(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }
}

impl ScriptLoader for MemoryLoader {
    fn load(&self, name: &str) -> Result<String> {
        self.scripts.get(name).cloned().ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })
    }
}

type Output = Arc<dyn Fn(&str) + Send + Sync>;

/// What runtimes are built from: where memory is charged, where scripts
/// come from, and where `print` goes.
#[derive(Clone)]
pub struct Environment {
    pub memory: KernelMemory,
    pub loader: Arc<dyn ScriptLoader>,
    /// Default bucket count of tables created by scripts
    pub table_size: usize,
    output: Option<Output>,
}

impl Environment {
    pub fn new(memory: KernelMemory, loader: Arc<dyn ScriptLoader>) -> Self {
        Self {
            memory,
            loader,
            table_size: rcu::DEFAULT_SIZE,
            output: None,
        }
    }

    pub fn with_table_size(mut self, table_size: usize) -> Self {
        self.table_size = table_size;
        self
    }

    /// Send script output to `output` instead of the log
    pub fn with_output(mut self, output: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(output));
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("memory", &self.memory)
            .field("table_size", &self.table_size)
            .finish_non_exhaustive()
    }
}

/// A value that can cross between runtimes or to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Nil,
    Boolean(bool),
    Integer(i64),
    String(String),
    Object(Object),
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transfer::Nil => f.write_str("nil"),
            Transfer::Boolean(b) => write!(f, "{}", b),
            Transfer::Integer(n) => write!(f, "{}", n),
            Transfer::String(s) => f.write_str(s),
            Transfer::Object(o) => write!(f, "{}: {:#x}", o.class().name, o.id()),
        }
    }
}

impl From<i64> for Transfer {
    fn from(n: i64) -> Self {
        Transfer::Integer(n)
    }
}

impl From<bool> for Transfer {
    fn from(b: bool) -> Self {
        Transfer::Boolean(b)
    }
}

impl From<&str> for Transfer {
    fn from(s: &str) -> Self {
        Transfer::String(s.to_string())
    }
}

/// Result of resuming a runtime's task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The task yielded these values and can be resumed again
    Yielded(Vec<Transfer>),
    /// The task finished with these values
    Returned(Vec<Transfer>),
}

impl Outcome {
    pub fn values(&self) -> &[Transfer] {
        match self {
            Outcome::Yielded(values) | Outcome::Returned(values) => values,
        }
    }

    pub fn into_values(self) -> Vec<Transfer> {
        match self {
            Outcome::Yielded(values) | Outcome::Returned(values) => values,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Outcome::Returned(_))
    }
}

/// Bit set in [`Block::cookie`] for vmalloc-backed blocks
const VMALLOC_COOKIE: u32 = 1;

/// Routes interpreter allocations to kernel memory with the runtime's
/// current allocation flags.
struct KernelAllocator {
    memory: KernelMemory,
    gfp: Arc<AtomicU32>,
}

impl KernelAllocator {
    fn gfp(&self) -> Gfp {
        Gfp::from_bits_retain(self.gfp.load(Ordering::Acquire))
    }
}

fn to_extent(block: Block) -> Extent {
    Extent {
        size: block.size,
        capacity: block.capacity,
        vmalloc: block.cookie & VMALLOC_COOKIE != 0,
    }
}

fn to_block(extent: Extent) -> Block {
    Block {
        size: extent.size,
        capacity: extent.capacity,
        cookie: if extent.vmalloc { VMALLOC_COOKIE } else { 0 },
    }
}

impl Allocator for KernelAllocator {
    fn reallocate(
        &mut self,
        block: Option<Block>,
        new_size: usize,
    ) -> core::result::Result<Option<Block>, AllocError> {
        let refused = |_| AllocError {
            requested: new_size,
        };
        match (block, new_size) {
            (None, 0) => Ok(None),
            (Some(block), 0) => {
                self.memory.kfree(to_extent(block));
                Ok(None)
            }
            (None, size) => self
                .memory
                .kmalloc(size, self.gfp())
                .map(|extent| Some(to_block(extent)))
                .map_err(refused),
            (Some(block), size) => self
                .memory
                .krealloc(to_extent(block), size, self.gfp())
                .map(|extent| Some(to_block(extent)))
                .map_err(refused),
        }
    }
}

/// Payload of a runtime object
pub(crate) struct Interp {
    name: String,
    state: State,
    task: Option<PinId>,
    status: RuntimeState,
}

impl Interp {
    fn set_status(&mut self, status: RuntimeState) {
        log::debug!("runtime '{}': {} -> {}", self.name, self.status, status);
        self.status = status;
    }

    /// Start or continue the task
    pub(crate) fn resume(&mut self, args: &[Transfer]) -> Result<Outcome> {
        let Some(pin) = self.task else {
            return Err(Error::invalid_state(format!(
                "runtime '{}' has no task",
                self.name
            )));
        };
        let task = self.state.pinned(pin);
        if self.state.thread_status(task) == Some(ThreadStatus::Dead) {
            return Err(Error::invalid_state(format!(
                "runtime '{}' task has finished",
                self.name
            )));
        }

        self.set_status(RuntimeState::Running);
        let outcome = run_task(&mut self.state, task, args);
        self.set_status(RuntimeState::Ready);
        outcome
    }
}

fn run_task(state: &mut State, task: Value, args: &[Transfer]) -> Result<Outcome> {
    let args = args
        .iter()
        .map(|t| bind::from_transfer(state, t.clone()))
        .collect::<kscript_lang::Result<Vec<_>>>()?;
    let convert = |state: &State, values: Vec<Value>| {
        values
            .into_iter()
            .map(|v| bind::to_transfer(state, v))
            .collect::<Result<Vec<_>>>()
    };
    Ok(match state.resume(task, &args)? {
        kscript_lang::Resumed::Yielded(values) => Outcome::Yielded(convert(state, values)?),
        kscript_lang::Resumed::Returned(values) => Outcome::Returned(convert(state, values)?),
    })
}

impl Drop for Interp {
    fn drop(&mut self) {
        log::debug!("runtime '{}': {} -> {}", self.name, self.status, RuntimeState::Stopped);
    }
}

pub(crate) fn interp(data: &mut dyn Any) -> Result<&mut Interp> {
    data.downcast_mut::<Interp>().ok_or(Error::WrongClass {
        expected: RUNTIME.name,
        found: "object",
    })
}

/// Handle to an embedded-interpreter runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    object: Object,
}

impl Runtime {
    /// Create a runtime and run its bootstrap script
    ///
    /// The script named `script` is fetched from the environment's loader
    /// and run to completion. If it returns a function, that function
    /// becomes the runtime's task, started by the first [`Runtime::resume`].
    ///
    /// # Errors
    /// - [`Error::WouldSleep`] from atomic context; loading may block
    /// - [`Error::NotFound`] if the loader has no such script
    /// - [`Error::Script`] if the script fails to compile or run
    /// - [`Error::OutOfMemory`] if the object cannot be allocated
    pub fn new(env: &Environment, script: &str, sleep: bool) -> Result<Self> {
        context::might_sleep("runtime::new")?;
        let class = if sleep { &RUNTIME } else { &RUNTIME_ATOMIC };
        let object = Object::with_pointer(class, &env.memory)?;
        log::debug!("runtime '{}': {} -> {}", script, RuntimeState::Uninitialized, RuntimeState::Loading);

        // Loading may block whatever the runtime's class.
        let gfp = Arc::new(AtomicU32::new(Gfp::KERNEL.bits()));
        let source = env.loader.load(script)?;
        let mut state = State::new(Box::new(KernelAllocator {
            memory: env.memory.clone(),
            gfp: gfp.clone(),
        }))?;
        state.set_extra(Context {
            owner: object.back_ref(),
            sleep,
            env: env.clone(),
        });
        if let Some(output) = env.output.clone() {
            state.set_output(move |line| output(line));
        }
        bind::open(&mut state)?;

        let main = state.load(script, &source)?;
        let results = state.call(main, &[])?;
        let task = match results.first() {
            Some(&f @ Value::Function(_)) => {
                let thread = state.new_thread(f)?;
                Some(state.pin(thread))
            }
            _ => None,
        };

        if !sleep {
            gfp.store(Gfp::ATOMIC.bits(), Ordering::Release);
        }
        object.attach(Interp {
            name: script.to_string(),
            state,
            task,
            status: RuntimeState::Ready,
        })?;
        log::info!(
            "runtime '{}' ready ({})",
            script,
            if sleep { "sleep" } else { "atomic" }
        );
        Ok(Self { object })
    }

    /// View an object as a runtime
    pub fn from_object(object: Object) -> Result<Self> {
        if is_runtime(&object) {
            Ok(Self { object })
        } else {
            Err(Error::WrongClass {
                expected: RUNTIME.name,
                found: object.class().name,
            })
        }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn into_object(self) -> Object {
        self.object
    }

    pub fn sleep(&self) -> bool {
        self.object.sleep()
    }

    /// Current lifecycle state; takes the runtime's lock
    pub fn state(&self) -> Result<RuntimeState> {
        match self.object.with(|interp: &mut Interp| interp.status) {
            Err(Error::Closed { .. }) => Ok(RuntimeState::Stopped),
            other => other,
        }
    }

    /// Start or continue the runtime's task
    ///
    /// Runs under the runtime's lock. On the first call `args` become the
    /// task's parameters; afterwards they are returned by the pending
    /// `coroutine.yield`.
    ///
    /// # Errors
    /// - [`Error::ContextMismatch`] for a sleep runtime from atomic context
    /// - [`Error::Closed`] once stopped
    /// - [`Error::Script`] if the task raises an error; the task is dead after that
    pub fn resume(&self, args: &[Transfer]) -> Result<Outcome> {
        self.check_context()?;
        self.object
            .monitor("resume", |data| interp(data)?.resume(args))
    }

    /// Run `f` against the runtime's state under its lock
    pub fn run<R>(&self, f: impl FnOnce(&mut State) -> Result<R>) -> Result<R> {
        self.check_context()?;
        self.object.monitor("run", |data| {
            let interp = interp(data)?;
            interp.set_status(RuntimeState::Running);
            let result = f(&mut interp.state);
            interp.set_status(RuntimeState::Ready);
            result
        })
    }

    /// Close the interpreter state; the runtime cannot run again
    pub fn stop(&self) -> Result<()> {
        self.object.close()?;
        log::info!("runtime {:#x} stopped", self.object.id());
        Ok(())
    }

    fn check_context(&self) -> Result<()> {
        if self.sleep() && context::in_atomic() {
            log::warn!("refusing to run a sleep runtime from atomic context");
            return Err(Error::ContextMismatch {
                class: self.object.class().name,
            });
        }
        Ok(())
    }
}

pub fn is_runtime(object: &Object) -> bool {
    object.is(&RUNTIME) || object.is(&RUNTIME_ATOMIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockKind;

    fn env(loader: MemoryLoader) -> Environment {
        Environment::new(KernelMemory::default(), Arc::new(loader))
    }

    #[test]
    fn test_lifecycle() {
        let env = env(MemoryLoader::new().with(
            "counter",
            "local n = 0 return function(step) while true do n = n + step step = coroutine.yield(n) end end",
        ));
        let rt = Runtime::new(&env, "counter", true).unwrap();
        assert_eq!(rt.state(), Ok(RuntimeState::Ready));
        assert_eq!(rt.object().lock_kind(), LockKind::Mutex);

        assert_eq!(
            rt.resume(&[Transfer::Integer(2)]),
            Ok(Outcome::Yielded(vec![Transfer::Integer(2)]))
        );
        assert_eq!(
            rt.resume(&[Transfer::Integer(3)]),
            Ok(Outcome::Yielded(vec![Transfer::Integer(5)]))
        );

        rt.stop().unwrap();
        assert_eq!(rt.state(), Ok(RuntimeState::Stopped));
        assert_eq!(rt.resume(&[]).unwrap_err().kind(), crate::ErrorKind::StaleHandle);
    }

    #[test]
    fn test_memory_returns_after_stop() {
        let env = env(MemoryLoader::new().with("t", "x = {} for i = 1, 100 do x[i] = 'v' .. i end"));
        let rt = Runtime::new(&env, "t", false).unwrap();
        assert!(env.memory.in_use() > 0);
        rt.stop().unwrap();
        drop(rt);
        assert_eq!(env.memory.in_use(), 0);
    }

    #[test]
    fn test_bootstrap_failure_releases_everything() {
        let env = env(
            MemoryLoader::new()
                .with("broken", "local x = ")
                .with("raises", "error('no')"),
        );
        assert!(matches!(
            Runtime::new(&env, "broken", true),
            Err(Error::Script(kscript_lang::Error::Syntax(_)))
        ));
        let err = Runtime::new(&env, "raises", true).unwrap_err();
        assert_eq!(err.to_string(), "raises:1: no");
        assert!(matches!(
            Runtime::new(&env, "missing", true),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(env.memory.in_use(), 0);
    }

    #[test]
    fn test_atomic_runtime_narrows_allocations() {
        let env = env(MemoryLoader::new().with(
            "grow",
            "local big = string.rep('x', 200000) return function() return #(big .. 'y') end",
        ));
        // The 200 KB string is above the slab limit: only loading may take it.
        let rt = Runtime::new(&env, "grow", false).unwrap();
        assert_eq!(rt.object().lock_kind(), LockKind::Spin);
        let err = rt.resume(&[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceExhaustion);

        let sleeper = Runtime::new(&env, "grow", true).unwrap();
        assert_eq!(
            sleeper.resume(&[]),
            Ok(Outcome::Returned(vec![Transfer::Integer(200001)]))
        );
    }

    #[test]
    fn test_sleep_runtime_refused_in_atomic_context() {
        let env = env(MemoryLoader::new().with("idle", "return function() end"));
        let rt = Runtime::new(&env, "idle", true).unwrap();
        let err = context::run_atomic(|| rt.resume(&[])).unwrap_err();
        assert_eq!(err, Error::ContextMismatch { class: "runtime" });
        assert!(context::run_atomic(|| Runtime::new(&env, "idle", false)).is_err());
    }

    #[test]
    fn test_script_reaches_its_own_runtime() {
        let env = env(MemoryLoader::new().with(
            "self",
            "local boot = runtime.current() \
             return function() local me = runtime.current() return me, boot, pcall(me.resume, me) end",
        ));
        let rt = Runtime::new(&env, "self", true).unwrap();
        let values = match rt.resume(&[]).unwrap() {
            Outcome::Returned(values) => values,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(values[0], Transfer::Object(rt.object().clone()));
        assert_eq!(values[1], values[0]);
        // Resuming itself finds its own lock held.
        assert_eq!(values[2], Transfer::Boolean(false));
        rt.stop().unwrap();
    }

    #[test]
    fn test_without_task() {
        let env = env(MemoryLoader::new().with("plain", "answer = 42"));
        let rt = Runtime::new(&env, "plain", true).unwrap();
        assert_eq!(rt.resume(&[]).unwrap_err().kind(), crate::ErrorKind::Argument);
        let answer = rt.run(|state| Ok(state.get_global("answer"))).unwrap();
        assert_eq!(answer, Value::Integer(42));
    }

    #[test]
    fn test_output_hook() {
        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = lines.clone();
        let env = env(MemoryLoader::new().with("hello", "print('hello', 1)"))
            .with_output(move |line| sink.lock().unwrap().push(line.to_string()));
        Runtime::new(&env, "hello", true).unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["hello\t1".to_string()]);
    }

    #[test]
    fn test_dir_loader_rejects_paths() {
        let loader = DirLoader::new(std::env::temp_dir());
        assert!(matches!(loader.load("../etc/passwd"), Err(Error::NotFound { .. })));
        assert!(matches!(loader.load("no-such-script"), Err(Error::NotFound { .. })));
    }
}
