//! Script bindings
//!
//! Objects reach scripts as userdata. Indexing one yields its class's
//! methods, each invoked through [`Object::invoke`] so the object's lock is
//! held for the call, plus `close`. Shared tables are indexed by key
//! instead. Two libraries are installed in every runtime:
//!
//! ```text
//! rcu.table([size [, sleep]])    new shared table
//! rcu.map(t, f)                  f(key, object) for every entry
//! rcu.close(t)
//! runtime.spawn(script [, sleep])
//! runtime.cansleep()
//! runtime.current()             the calling runtime
//! rt:resume(...)  rt:stop()
//! ```

use std::any::Any;
use std::sync::{Arc, OnceLock};

use kscript_lang::{
    arg, bad_argument, check_string, opt_integer, register_all, Builtin, State, UserData, Value,
};

use crate::class::{Class, Method};
use crate::error::{Error, Result};
use crate::object::{BackRef, Object};
use crate::rcu::{self, SharedTable};
use crate::runtime::{self, Environment, Runtime, Transfer};

/// Host data stored in every runtime's state
pub(crate) struct Context {
    /// The runtime object that owns the state. Not counted, so a script
    /// holding its own runtime in a global keeps it alive until `stop`.
    pub owner: BackRef,
    pub sleep: bool,
    pub env: Environment,
}

fn context(state: &State) -> Result<(bool, Environment)> {
    state
        .extra::<Context>()
        .map(|ctx| (ctx.sleep, ctx.env.clone()))
        .ok_or_else(|| Error::invalid_state("state has no runtime"))
}

/// Reject sleep-capable classes in a non-sleep runtime.
fn check_context(state: &State, class: &'static Class) -> Result<()> {
    let sleep = state.extra::<Context>().map_or(true, |ctx| ctx.sleep);
    if class.sleep() && !sleep {
        log::warn!("{}: used from a non-sleep runtime", class.name);
        return Err(Error::ContextMismatch { class: class.name });
    }
    Ok(())
}

/// Userdata wrapping an object handle
struct ObjectUd {
    object: Object,
    table: OnceLock<SharedTable>,
}

impl ObjectUd {
    fn table(&self) -> Result<&SharedTable> {
        if let Some(table) = self.table.get() {
            return Ok(table);
        }
        let table = SharedTable::from_object(&self.object)?;
        Ok(self.table.get_or_init(|| table))
    }

    fn is_table(&self) -> bool {
        self.object.is(&rcu::TABLE) || self.object.is(&rcu::TABLE_ATOMIC)
    }
}

impl UserData for ObjectUd {
    fn type_name(&self) -> &'static str {
        self.object.class().name
    }

    fn index(&self, state: &mut State, key: Value) -> kscript_lang::Result<Value> {
        if self.is_table() {
            check_context(state, self.object.class())?;
            let key = table_key(state, key)?;
            return match self.table()?.get(key.as_bytes())? {
                Some(object) => push_object(state, object),
                None => Ok(Value::Nil),
            };
        }

        let class = self.object.class();
        let Some(name) = state.to_str(key).map(str::to_owned) else {
            return Ok(Value::Nil);
        };
        if name == "close" || (name == "stop" && runtime::is_runtime(&self.object)) {
            return state.new_function(move |state, args| {
                let object = self_object(state, args, class)?;
                check_context(state, class)?;
                object.close()?;
                Ok(Vec::new())
            });
        }
        match class.method(&name) {
            Some(method) => state.new_function(move |state, args| call_method(state, args, class, method)),
            None => Ok(Value::Nil),
        }
    }

    fn new_index(&self, state: &mut State, key: Value, value: Value) -> kscript_lang::Result<()> {
        if !self.is_table() {
            return Err(kscript_lang::Error::runtime(format!(
                "attempt to index a {} value",
                self.type_name()
            )));
        }
        check_context(state, self.object.class())?;
        let key = table_key(state, key)?;
        let object = match value {
            Value::Nil => None,
            v => Some(to_object(state, v).ok_or_else(|| {
                kscript_lang::Error::runtime(format!(
                    "cannot store a {} value in a shared table",
                    v.type_name()
                ))
            })?),
        };
        self.table()?.set(key.as_bytes(), object.as_ref())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_display(&self) -> Option<String> {
        Some(format!(
            "{}: {:#x}",
            self.object.class().name,
            self.object.id()
        ))
    }
}

fn table_key(state: &State, key: Value) -> kscript_lang::Result<String> {
    match key {
        Value::Integer(n) => Ok(n.to_string()),
        v => state
            .to_str(v)
            .map(str::to_owned)
            .ok_or_else(|| kscript_lang::Error::runtime(format!("invalid key type ({})", v.type_name()))),
    }
}

/// The object behind argument 0, which must belong to `class`
fn self_object(state: &State, args: &[Value], class: &'static Class) -> Result<Object> {
    let object = to_object(state, arg(args, 0)).ok_or_else(|| Error::WrongClass {
        expected: class.name,
        found: arg(args, 0).type_name(),
    })?;
    object.check_class(class)?;
    Ok(object)
}

fn call_method(
    state: &mut State,
    args: &[Value],
    class: &'static Class,
    method: &'static Method,
) -> kscript_lang::Result<Vec<Value>> {
    let object = self_object(state, args, class)?;
    check_context(state, class)?;
    let results = object.invoke(method, state, &args[1..])?;
    // The object is unlocked again, so the caller may allocate freely.
    results
        .into_iter()
        .map(|t| from_transfer(state, t))
        .collect()
}

/// Wrap `object` as a script value
pub fn push_object(state: &mut State, object: Object) -> kscript_lang::Result<Value> {
    state.new_userdata(Arc::new(ObjectUd {
        object,
        table: OnceLock::new(),
    }))
}

/// The object behind a script value, if it is one
pub fn to_object(state: &State, value: Value) -> Option<Object> {
    let ud = state.userdata(value)?;
    ud.as_any()
        .downcast_ref::<ObjectUd>()
        .map(|ud| ud.object.clone())
}

pub(crate) fn to_transfer(state: &State, value: Value) -> Result<Transfer> {
    Ok(match value {
        Value::Nil => Transfer::Nil,
        Value::Boolean(b) => Transfer::Boolean(b),
        Value::Integer(n) => Transfer::Integer(n),
        Value::String(_) => Transfer::String(state.to_str(value).unwrap_or_default().to_string()),
        v => match to_object(state, v) {
            Some(object) => Transfer::Object(object),
            None => {
                return Err(Error::Transfer {
                    type_name: v.type_name(),
                })
            }
        },
    })
}

pub(crate) fn from_transfer(state: &mut State, value: Transfer) -> kscript_lang::Result<Value> {
    match value {
        Transfer::Nil => Ok(Value::Nil),
        Transfer::Boolean(b) => Ok(Value::Boolean(b)),
        Transfer::Integer(n) => Ok(Value::Integer(n)),
        Transfer::String(s) => state.new_string(&s),
        Transfer::Object(object) => push_object(state, object),
    }
}

/// `rt:resume(...)`, with the target runtime locked
pub(crate) fn resume_runtime(
    data: &mut dyn Any,
    state: &mut State,
    args: &[Value],
) -> Result<Vec<Transfer>> {
    let interp = runtime::interp(data)?;
    let args = args
        .iter()
        .map(|&v| to_transfer(state, v))
        .collect::<Result<Vec<_>>>()?;
    Ok(interp.resume(&args)?.into_values())
}

const RCU: &[(&str, Builtin)] = &[("table", rcu_table), ("map", rcu_map), ("close", rcu_close)];

const RUNTIME: &[(&str, Builtin)] = &[
    ("spawn", runtime_spawn),
    ("cansleep", runtime_cansleep),
    ("current", runtime_current),
];

/// Install the `rcu` and `runtime` libraries
pub(crate) fn open(state: &mut State) -> kscript_lang::Result<()> {
    for (name, entries) in [("rcu", RCU), ("runtime", RUNTIME)] {
        let lib = state.new_table()?;
        register_all(state, lib, entries)?;
        state.set_global(name, lib)?;
    }
    Ok(())
}

fn opt_boolean(args: &[Value], i: usize, name: &str, default: bool) -> kscript_lang::Result<bool> {
    match arg(args, i) {
        Value::Nil => Ok(default),
        Value::Boolean(b) => Ok(b),
        _ => Err(bad_argument(args, i, name, "boolean")),
    }
}

fn check_table(state: &State, args: &[Value], name: &str) -> kscript_lang::Result<SharedTable> {
    let object = to_object(state, arg(args, 0))
        .filter(|o| o.is(&rcu::TABLE) || o.is(&rcu::TABLE_ATOMIC))
        .ok_or_else(|| bad_argument(args, 0, name, "rcu"))?;
    check_context(state, object.class())?;
    Ok(SharedTable::from_object(&object)?)
}

fn rcu_table(state: &mut State, args: &[Value]) -> kscript_lang::Result<Vec<Value>> {
    let (_, env) = context(state)?;
    let size = opt_integer(state, args, 0, "table", env.table_size as i64)?;
    if size < 0 {
        return Err(kscript_lang::Error::runtime(
            "bad argument #1 to 'table' (size must not be negative)",
        ));
    }
    let sleep = opt_boolean(args, 1, "table", false)?;
    check_context(state, if sleep { &rcu::TABLE } else { &rcu::TABLE_ATOMIC })?;
    let table = SharedTable::new(&env.memory, size as usize, sleep)?;
    Ok(vec![push_object(state, table.object().clone())?])
}

fn rcu_map(state: &mut State, args: &[Value]) -> kscript_lang::Result<Vec<Value>> {
    let table = check_table(state, args, "map")?;
    let callback = match arg(args, 1) {
        f @ Value::Function(_) => f,
        _ => return Err(bad_argument(args, 1, "map", "function")),
    };
    table.map(|key, object| {
        let key = state.new_string(&String::from_utf8_lossy(key))?;
        let object = push_object(state, object)?;
        state.call(callback, &[key, object])?;
        Ok(())
    })?;
    Ok(Vec::new())
}

fn rcu_close(state: &mut State, args: &[Value]) -> kscript_lang::Result<Vec<Value>> {
    check_table(state, args, "close")?.close()?;
    Ok(Vec::new())
}

fn runtime_spawn(state: &mut State, args: &[Value]) -> kscript_lang::Result<Vec<Value>> {
    let script = check_string(state, args, 0, "spawn")?;
    let sleep = opt_boolean(args, 1, "spawn", true)?;
    let (_, env) = context(state)?;
    check_context(
        state,
        if sleep {
            &runtime::RUNTIME
        } else {
            &runtime::RUNTIME_ATOMIC
        },
    )?;
    let rt = Runtime::new(&env, &script, sleep)?;
    Ok(vec![push_object(state, rt.into_object())?])
}

fn runtime_cansleep(state: &mut State, _args: &[Value]) -> kscript_lang::Result<Vec<Value>> {
    let (sleep, _) = context(state)?;
    Ok(vec![Value::Boolean(sleep)])
}

fn runtime_current(state: &mut State, _args: &[Value]) -> kscript_lang::Result<Vec<Value>> {
    let owner = state
        .extra::<Context>()
        .map(|ctx| ctx.owner)
        .ok_or_else(|| Error::invalid_state("state has no runtime"))?;
    // SAFETY: a state only runs while a handle to its runtime is held,
    // either by the resuming caller or by `Runtime::new` during bootstrap.
    let object = unsafe { owner.object() };
    Ok(vec![push_object(state, object)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmem::KernelMemory;
    use crate::runtime::MemoryLoader;

    /// A bare state bound to an unstarted runtime object
    fn state(sleep: bool) -> (Object, State) {
        let memory = KernelMemory::default();
        let class = if sleep { &runtime::RUNTIME } else { &runtime::RUNTIME_ATOMIC };
        let owner = Object::with_pointer(class, &memory).unwrap();
        let mut state =
            State::new(Box::new(kscript_lang::CountingAllocator::new())).unwrap();
        state.set_extra(Context {
            owner: owner.back_ref(),
            sleep,
            env: Environment::new(memory, Arc::new(MemoryLoader::new())),
        });
        open(&mut state).unwrap();
        (owner, state)
    }

    fn run(state: &mut State, source: &str) -> kscript_lang::Result<Vec<Value>> {
        let f = state.load("test", source)?;
        state.call(f, &[])
    }

    #[test]
    fn test_table_from_script() {
        let (_owner, mut state) = state(true);
        let out = run(
            &mut state,
            "local t = rcu.table(8) local u = rcu.table(4) t.a = u t[1] = u \
             local n = 0 rcu.map(t, function(k, v) n = n + 1 end) \
             t.a = nil return t.a == nil, t['1'] ~= nil, n",
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Value::Boolean(true), Value::Boolean(true), Value::Integer(2)]
        );
    }

    #[test]
    fn test_sleep_class_rejected_in_atomic_runtime() {
        let (_owner, mut state) = state(false);
        let err = run(&mut state, "return rcu.table(16, true)").unwrap_err();
        assert!(err.to_string().contains("non-sleep runtime"), "{}", err);
        assert_eq!(run(&mut state, "return runtime.cansleep()").unwrap(), vec![Value::Boolean(false)]);
    }

    #[test]
    fn test_store_requires_object() {
        let (_owner, mut state) = state(true);
        let err = run(&mut state, "local t = rcu.table() t.x = 1").unwrap_err();
        assert!(err.to_string().contains("cannot store a number value"), "{}", err);
    }

    #[test]
    fn test_current_is_the_owning_object() {
        let (owner, mut state) = state(false);
        let out = run(&mut state, "return runtime.current()").unwrap();
        assert_eq!(to_object(&state, out[0]), Some(owner.clone()));
        assert_eq!(owner.refcount(), 2);
    }

    #[test]
    fn test_transfer_rejects_tables() {
        let (_owner, mut state) = state(true);
        let t = state.new_table().unwrap();
        assert_eq!(
            to_transfer(&state, t),
            Err(Error::Transfer { type_name: "table" })
        );
        let s = state.new_string("hi").unwrap();
        assert_eq!(to_transfer(&state, s), Ok(Transfer::String("hi".into())));
    }
}
