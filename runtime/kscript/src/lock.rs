//! Dual lock
//!
//! Objects of sleep-capable classes are protected by a sleeping mutex;
//! objects of non-sleep classes by a spin lock that keeps the holder in
//! atomic context. The primitive is chosen once, at construction, and both
//! present the same guard type.

use core::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::context::{self, AtomicSection};
use crate::error::{Error, Result};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OWNER_TOKEN: u64 = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
}

fn current_owner() -> u64 {
    OWNER_TOKEN.with(|token| *token)
}

/// Which primitive an [`ObjectLock`] uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Mutex,
    Spin,
}

enum Primitive<T> {
    Mutex(Mutex<T>),
    Spin(spin::Mutex<T>),
}

/// Mutex XOR spin lock around an object's payload
pub struct ObjectLock<T> {
    primitive: Primitive<T>,
    /// Token of the holding thread, 0 when unlocked
    owner: AtomicU64,
}

impl<T> ObjectLock<T> {
    /// Create a sleeping lock when `sleep` is set, a spin lock otherwise
    pub fn new(value: T, sleep: bool) -> Self {
        let primitive = if sleep {
            Primitive::Mutex(Mutex::new(value))
        } else {
            Primitive::Spin(spin::Mutex::new(value))
        };
        Self {
            primitive,
            owner: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> LockKind {
        match self.primitive {
            Primitive::Mutex(_) => LockKind::Mutex,
            Primitive::Spin(_) => LockKind::Spin,
        }
    }

    /// Consume the lock without acquiring it
    pub fn into_inner(self) -> T {
        match self.primitive {
            Primitive::Mutex(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Primitive::Spin(spin) => spin.into_inner(),
        }
    }

    /// Acquire the lock
    ///
    /// `class` names the object in error reports.
    ///
    /// # Errors
    /// - [`Error::Recursion`] if this thread already holds the lock
    /// - [`Error::WouldSleep`] for a mutex requested from atomic context
    pub fn lock(&self, class: &'static str) -> Result<ObjectGuard<'_, T>> {
        let me = current_owner();
        if self.owner.load(Ordering::Acquire) == me {
            log::warn!("{}: recursive lock attempt", class);
            return Err(Error::Recursion { class });
        }

        let (inner, section) = match &self.primitive {
            Primitive::Mutex(mutex) => {
                context::might_sleep(class)?;
                // Poisoning is ignored: the payload records whether it is open.
                let guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
                (Inner::Mutex(guard), None)
            }
            Primitive::Spin(spin) => {
                let section = AtomicSection::enter();
                (Inner::Spin(spin.lock()), Some(section))
            }
        };
        self.owner.store(me, Ordering::Release);
        Ok(ObjectGuard {
            inner,
            _section: section,
            owner: &self.owner,
        })
    }
}

enum Inner<'a, T> {
    Mutex(MutexGuard<'a, T>),
    Spin(spin::MutexGuard<'a, T>),
}

/// Holds an [`ObjectLock`]; a spin guard also holds an atomic section.
pub struct ObjectGuard<'a, T> {
    // Field order matters: the lock is released before preemption is
    // re-enabled.
    inner: Inner<'a, T>,
    _section: Option<AtomicSection>,
    owner: &'a AtomicU64,
}

impl<T> Deref for ObjectGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            Inner::Mutex(guard) => &**guard,
            Inner::Spin(guard) => &**guard,
        }
    }
}

impl<T> DerefMut for ObjectGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Inner::Mutex(guard) => &mut **guard,
            Inner::Spin(guard) => &mut **guard,
        }
    }
}

impl<T> Drop for ObjectGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_kind_follows_sleep() {
        assert_eq!(ObjectLock::new((), true).kind(), LockKind::Mutex);
        assert_eq!(ObjectLock::new((), false).kind(), LockKind::Spin);
    }

    #[test]
    fn test_spin_guard_is_atomic() {
        let lock = ObjectLock::new(0, false);
        {
            let mut guard = lock.lock("test").unwrap();
            *guard += 1;
            assert!(context::in_atomic());
        }
        assert!(!context::in_atomic());
        assert_eq!(*lock.lock("test").unwrap(), 1);
    }

    #[test]
    fn test_mutex_refused_in_atomic_context() {
        let lock = ObjectLock::new(0, true);
        let result = context::run_atomic(|| lock.lock("test").map(|_| ()));
        assert_eq!(result.err(), Some(Error::WouldSleep));
    }

    #[test]
    fn test_recursion_detected() {
        for sleep in [true, false] {
            let lock = ObjectLock::new(0, sleep);
            let _guard = lock.lock("test").unwrap();
            assert_eq!(
                lock.lock("test").err(),
                Some(Error::Recursion { class: "test" })
            );
        }
    }

    #[test]
    fn test_serializes_threads() {
        for sleep in [true, false] {
            let lock = Arc::new(ObjectLock::new(0u64, sleep));
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let lock = lock.clone();
                    std::thread::spawn(move || {
                        for _ in 0..1000 {
                            let mut guard = lock.lock("test").unwrap();
                            let v = *guard;
                            *guard = v + 1;
                        }
                    })
                })
                .collect();
            for w in workers {
                w.join().unwrap();
            }
            assert_eq!(*lock.lock("test").unwrap(), 4000);
        }
    }
}
