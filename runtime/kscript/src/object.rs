//! Generic objects
//!
//! An [`Object`] is a reference-counted, class-tagged container for a
//! private payload. Two lifetimes are tracked separately:
//!
//! - the *handle* lifetime, counted by the `kref` and ended when the last
//!   handle drops, and
//! - the *payload* lifetime, which ends either then or earlier through
//!   [`Object::close`]. A closed object stays valid as a handle; every access
//!   to its payload reports [`Error::Closed`].
//!
//! The payload sits behind an [`ObjectLock`] whose primitive follows the
//! class's sleep flag, so every payload access is serialized.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::any::Any;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use kscript_lang::{State, Value};

use crate::class::{Class, Method};
use crate::error::{Error, Result};
use crate::kmem::{Allocation, Extent, Gfp, KernelMemory};
use crate::lock::{LockKind, ObjectLock};
use crate::runtime::Transfer;

/// Payload plus the memory charged for it
struct Private {
    data: Box<dyn Any + Send>,
    _allocation: Option<Allocation>,
}

struct ObjectInner {
    kref: AtomicUsize,
    class: &'static Class,
    gfp: Gfp,
    closed: AtomicBool,
    private: ObjectLock<Option<Private>>,
    memory: KernelMemory,
    header: Extent,
}

/// Handle to a generic object
///
/// Cloning takes a reference; dropping releases it. The payload is released
/// when the last handle drops unless the object was closed first.
pub struct Object {
    inner: NonNull<ObjectInner>,
    _marker: PhantomData<ObjectInner>,
}

// SAFETY: the inner block is only freed by the last handle, the payload is
// only reached through its lock, and everything else in it is atomic or
// immutable.
unsafe impl Send for Object {}
unsafe impl Sync for Object {}

impl Object {
    /// Create an object of `class` holding `value`
    ///
    /// `size` bytes are charged to `memory` for the payload, in addition to
    /// the object itself, using the class's allocation flags.
    ///
    /// # Errors
    /// - [`Error::OutOfMemory`] or [`Error::WouldSleep`] if either charge fails
    /// - [`Error::InvalidState`] for a pointer class; use [`Object::with_pointer`]
    pub fn new<T: Any + Send>(
        class: &'static Class,
        memory: &KernelMemory,
        size: usize,
        value: T,
    ) -> Result<Self> {
        if class.pointer() {
            return Err(Error::invalid_state(format!(
                "{} payloads are attached, not allocated",
                class.name
            )));
        }
        let allocation = memory.allocate(size, class.gfp())?;
        Self::alloc(
            class,
            memory,
            Some(Private {
                data: Box::new(value),
                _allocation: Some(allocation),
            }),
        )
    }

    /// Create an object of a pointer class, without a payload
    ///
    /// The constructor supplies the payload later with [`Object::attach`].
    pub fn with_pointer(class: &'static Class, memory: &KernelMemory) -> Result<Self> {
        if !class.pointer() {
            return Err(Error::invalid_state(format!(
                "{} payloads are allocated, not attached",
                class.name
            )));
        }
        Self::alloc(class, memory, None)
    }

    fn alloc(class: &'static Class, memory: &KernelMemory, private: Option<Private>) -> Result<Self> {
        let gfp = class.gfp();
        let header = memory.kmalloc(core::mem::size_of::<ObjectInner>(), gfp)?;
        let inner = Box::new(ObjectInner {
            kref: AtomicUsize::new(1),
            class,
            gfp,
            closed: AtomicBool::new(false),
            private: ObjectLock::new(private, class.sleep()),
            memory: memory.clone(),
            header,
        });
        log::debug!("{}: created object", class.name);
        Ok(Self {
            inner: NonNull::from(Box::leak(inner)),
            _marker: PhantomData,
        })
    }

    fn inner(&self) -> &ObjectInner {
        // SAFETY: the block lives as long as any handle does.
        unsafe { self.inner.as_ref() }
    }

    pub fn class(&self) -> &'static Class {
        self.inner().class
    }

    /// Whether this object belongs to `class`
    pub fn is(&self, class: &'static Class) -> bool {
        self.class() == class
    }

    pub fn check_class(&self, class: &'static Class) -> Result<()> {
        if self.is(class) {
            Ok(())
        } else {
            Err(Error::WrongClass {
                expected: class.name,
                found: self.class().name,
            })
        }
    }

    /// Number of live handles
    pub fn refcount(&self) -> usize {
        self.inner().kref.load(Ordering::Acquire)
    }

    pub fn sleep(&self) -> bool {
        self.class().sleep()
    }

    pub fn gfp(&self) -> Gfp {
        self.inner().gfp
    }

    pub fn lock_kind(&self) -> LockKind {
        self.inner().private.kind()
    }

    /// Memory pool the object is charged to
    pub fn memory(&self) -> &KernelMemory {
        &self.inner().memory
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same object
    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        a.inner == b.inner
    }

    /// Stable address of the object, for display
    pub fn id(&self) -> usize {
        self.inner.as_ptr() as usize
    }

    /// Non-owning reference to this object, for a payload that points back
    /// at its owner
    pub(crate) fn back_ref(&self) -> BackRef {
        BackRef { inner: self.inner }
    }

    /// Supply the payload of a pointer-class object
    pub fn attach<T: Any + Send>(&self, value: T) -> Result<()> {
        let class = self.class();
        let mut slot = self.inner().private.lock(class.name)?;
        if self.is_closed() {
            return Err(Error::Closed { class: class.name });
        }
        if slot.is_some() {
            return Err(Error::invalid_state(format!(
                "{} payload already attached",
                class.name
            )));
        }
        *slot = Some(Private {
            data: Box::new(value),
            _allocation: None,
        });
        Ok(())
    }

    /// Release the payload now, keeping the handle valid
    ///
    /// The payload is detached under the lock and released after it.
    /// Closing a closed object does nothing.
    pub fn close(&self) -> Result<()> {
        let class = self.class();
        let private = {
            let mut slot = self.inner().private.lock(class.name)?;
            self.inner().closed.store(true, Ordering::Release);
            slot.take()
        };
        if let Some(private) = private {
            release(class, private);
            log::debug!("{}: closed object {:#x}", class.name, self.id());
        }
        Ok(())
    }

    /// Run `f` on the payload with the lock held
    ///
    /// # Errors
    /// [`Error::Closed`] if the payload is gone, or whatever `f` returns.
    pub fn with_private<R>(&self, f: impl FnOnce(&mut dyn Any) -> Result<R>) -> Result<R> {
        let class = self.class();
        let mut slot = self.inner().private.lock(class.name)?;
        match slot.as_mut() {
            Some(private) => f(&mut *private.data),
            None => Err(Error::Closed { class: class.name }),
        }
    }

    /// Run `f` on the payload, which must be a `T`
    pub fn with<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let found = self.class().name;
        self.with_private(|data| match data.downcast_mut::<T>() {
            Some(value) => Ok(f(value)),
            None => Err(Error::WrongClass {
                expected: core::any::type_name::<T>(),
                found,
            }),
        })
    }

    /// Run operation `op` on the payload with the lock held
    ///
    /// Errors are annotated with `op` once the lock has been released.
    pub fn monitor<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut dyn Any) -> Result<R>,
    ) -> Result<R> {
        self.with_private(f).map_err(|source| {
            log::debug!("{}.{} failed: {}", self.class().name, op, source);
            Error::Operation {
                op,
                source: Box::new(source),
            }
        })
    }

    /// Invoke one of the class's methods for a script
    pub fn invoke(
        &self,
        method: &Method,
        state: &mut State,
        args: &[Value],
    ) -> Result<Vec<Transfer>> {
        self.monitor(method.name, |data| (method.op)(data, state, args))
    }
}

/// Pointer from a payload back to the object that owns it
///
/// Takes no reference: the payload cannot outlive its object, and a cycle
/// through the payload would keep the object alive forever.
#[derive(Clone, Copy)]
pub(crate) struct BackRef {
    inner: NonNull<ObjectInner>,
}

// SAFETY: only dereferenced through `BackRef::object`, whose caller
// guarantees the object is alive; `Object` itself is Send and Sync.
unsafe impl Send for BackRef {}
unsafe impl Sync for BackRef {}

impl BackRef {
    /// Take a new reference on the object
    ///
    /// # Safety
    /// Some handle to the object must be live for the duration of the call,
    /// as it is while its payload is in use under the object's lock or by a
    /// caller holding a handle.
    pub(crate) unsafe fn object(&self) -> Object {
        let borrowed = core::mem::ManuallyDrop::new(Object {
            inner: self.inner,
            _marker: PhantomData,
        });
        (*borrowed).clone()
    }
}

fn release(class: &'static Class, mut private: Private) {
    if let Some(callback) = class.release {
        callback(&mut *private.data);
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        let old = self.inner().kref.fetch_add(1, Ordering::Relaxed);
        if old > isize::MAX as usize {
            std::process::abort();
        }
        Self {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if self.inner().kref.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // SAFETY: this was the last handle, and the block came from
        // `Box::leak` in `alloc`.
        let inner = unsafe { Box::from_raw(self.inner.as_ptr()) };
        let ObjectInner {
            class,
            private,
            memory,
            header,
            ..
        } = *inner;
        if let Some(private) = private.into_inner() {
            release(class, private);
        }
        memory.kfree(header);
        log::debug!("{}: destroyed object", class.name);
    }
}

/// Identity comparison
impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Object::ptr_eq(self, other)
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.class().name)
            .field("id", &format_args!("{:#x}", self.id()))
            .field("refcount", &self.refcount())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassFlags;
    use crate::context;

    static COUNTER: Class = Class {
        name: "counter",
        methods: &[],
        release: None,
        flags: ClassFlags::SLEEP,
    };

    static SPIN_COUNTER: Class = Class {
        name: "counter",
        methods: &[],
        release: None,
        flags: ClassFlags::empty(),
    };

    static HOOK: Class = Class {
        name: "hook",
        methods: &[],
        release: None,
        flags: ClassFlags::SLEEP.union(ClassFlags::POINTER),
    };

    #[test]
    fn test_clone_and_release() {
        let memory = KernelMemory::default();
        let a = Object::new(&COUNTER, &memory, 8, 0u64).unwrap();
        let b = a.clone();
        let c = b.clone();
        assert_eq!(a.refcount(), 3);
        assert!(Object::ptr_eq(&a, &c));

        drop(b);
        assert_eq!(a.refcount(), 2);
        drop(c);
        assert_eq!(a.refcount(), 1);
        assert!(memory.in_use() > 0);
        drop(a);
        assert_eq!(memory.in_use(), 0);
    }

    #[test]
    fn test_lock_kind_follows_class() {
        let memory = KernelMemory::default();
        let sleeping = Object::new(&COUNTER, &memory, 8, 0u64).unwrap();
        let spinning = Object::new(&SPIN_COUNTER, &memory, 8, 0u64).unwrap();
        assert_eq!(sleeping.lock_kind(), LockKind::Mutex);
        assert_eq!(sleeping.gfp(), Gfp::KERNEL);
        assert_eq!(spinning.lock_kind(), LockKind::Spin);
        assert_eq!(spinning.gfp(), Gfp::ATOMIC);
    }

    #[test]
    fn test_close_then_use() {
        let memory = KernelMemory::default();
        let obj = Object::new(&COUNTER, &memory, 8, 5u64).unwrap();
        let other = obj.clone();
        assert_eq!(obj.with(|n: &mut u64| *n), Ok(5));

        obj.close().unwrap();
        assert!(other.is_closed());
        assert_eq!(
            other.with(|n: &mut u64| *n),
            Err(Error::Closed { class: "counter" })
        );
        assert!(obj.close().is_ok());
        assert_eq!(other.refcount(), 2);

        // Only the object header is still charged.
        assert_eq!(
            memory.in_use(),
            core::mem::size_of::<ObjectInner>().next_power_of_two()
        );
    }

    #[test]
    fn test_with_wrong_payload_type() {
        let memory = KernelMemory::default();
        let obj = Object::new(&COUNTER, &memory, 8, 5u64).unwrap();
        let err = obj.with(|s: &mut String| s.len()).unwrap_err();
        assert!(matches!(err, Error::WrongClass { found: "counter", .. }));
    }

    #[test]
    fn test_check_class() {
        let memory = KernelMemory::default();
        let obj = Object::new(&COUNTER, &memory, 8, 5u64).unwrap();
        assert!(obj.check_class(&COUNTER).is_ok());
        assert!(!obj.is(&SPIN_COUNTER));
        assert_eq!(
            obj.check_class(&SPIN_COUNTER),
            Err(Error::WrongClass {
                expected: "counter",
                found: "counter"
            })
        );
    }

    #[test]
    fn test_monitor_annotates_and_unlocks() {
        let memory = KernelMemory::default();
        let obj = Object::new(&SPIN_COUNTER, &memory, 8, 0u64).unwrap();
        let err = obj
            .monitor("poke", |_| -> Result<()> {
                assert!(context::in_atomic());
                Err(Error::invalid_state("broken"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "poke: invalid state: broken");
        assert!(!context::in_atomic());
        assert!(obj.with(|n: &mut u64| *n += 1).is_ok());
    }

    #[test]
    fn test_monitor_rejects_reentry() {
        let memory = KernelMemory::default();
        let obj = Object::new(&COUNTER, &memory, 8, 0u64).unwrap();
        let err = obj
            .monitor("outer", |_| obj.with(|n: &mut u64| *n))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Argument);
    }

    #[test]
    fn test_pointer_class() {
        let memory = KernelMemory::default();
        assert!(Object::new(&HOOK, &memory, 8, 0u64).is_err());
        assert!(Object::with_pointer(&COUNTER, &memory).is_err());

        let obj = Object::with_pointer(&HOOK, &memory).unwrap();
        assert!(obj.with(|n: &mut u64| *n).is_err());
        obj.attach(9u64).unwrap();
        assert!(obj.attach(10u64).is_err());
        assert_eq!(obj.with(|n: &mut u64| *n), Ok(9));

        obj.close().unwrap();
        assert_eq!(obj.attach(11u64), Err(Error::Closed { class: "hook" }));
    }

    #[test]
    fn test_back_ref_takes_a_reference() {
        let memory = KernelMemory::default();
        let obj = Object::new(&COUNTER, &memory, 8, 1u64).unwrap();
        let back = obj.back_ref();
        assert_eq!(obj.refcount(), 1);

        let again = unsafe { back.object() };
        assert_eq!(again, obj);
        assert_eq!(obj.refcount(), 2);
        drop(again);
        assert_eq!(obj.refcount(), 1);
    }

    #[test]
    fn test_create_refused_in_atomic_context() {
        let memory = KernelMemory::default();
        let result = context::run_atomic(|| Object::new(&COUNTER, &memory, 8, 0u64));
        assert_eq!(result.unwrap_err(), Error::WouldSleep);
        assert!(context::run_atomic(|| Object::new(&SPIN_COUNTER, &memory, 8, 0u64)).is_ok());
        assert_eq!(memory.in_use(), 0);
    }
}
