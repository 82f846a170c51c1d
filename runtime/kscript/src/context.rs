//! Execution context tracking
//!
//! Kernel code distinguishes contexts that may block (process context) from
//! contexts that must not (interrupt, softirq, or anything holding a spin
//! lock). Each OS thread carries a preemption count: while it is non-zero the
//! thread is in atomic context and every sleeping primitive refuses to run.

use core::cell::Cell;
use core::marker::PhantomData;

use crate::error::{Error, Result};

thread_local! {
    static PREEMPT_COUNT: Cell<usize> = const { Cell::new(0) };
    static SLEEP_VIOLATIONS: Cell<usize> = const { Cell::new(0) };
}

/// Preemption-disabled region; the thread is atomic until the guard drops.
///
/// The guard is tied to the thread that created it.
#[must_use]
#[derive(Debug)]
pub struct AtomicSection {
    _thread: PhantomData<*const ()>,
}

impl AtomicSection {
    pub fn enter() -> Self {
        PREEMPT_COUNT.with(|count| count.set(count.get() + 1));
        Self {
            _thread: PhantomData,
        }
    }
}

impl Drop for AtomicSection {
    fn drop(&mut self) {
        PREEMPT_COUNT.with(|count| count.set(count.get().saturating_sub(1)));
    }
}

/// Nesting depth of atomic sections on this thread
pub fn preempt_count() -> usize {
    PREEMPT_COUNT.with(Cell::get)
}

pub fn in_atomic() -> bool {
    preempt_count() > 0
}

/// Checks that the caller may block.
///
/// From atomic context the violation is logged, counted, and reported as
/// [`Error::WouldSleep`]; the caller must back out instead of blocking.
pub fn might_sleep(what: &str) -> Result<()> {
    if !in_atomic() {
        return Ok(());
    }
    SLEEP_VIOLATIONS.with(|count| count.set(count.get() + 1));
    log::error!(
        "BUG: sleeping function called from invalid context: {} (preempt_count={})",
        what,
        preempt_count()
    );
    Err(Error::WouldSleep)
}

/// Runs `f` in atomic context, as an interrupt or softirq handler would.
pub fn run_atomic<R>(f: impl FnOnce() -> R) -> R {
    let _section = AtomicSection::enter();
    f()
}

/// Number of times this thread attempted to sleep from atomic context.
pub fn sleep_violations() -> usize {
    SLEEP_VIOLATIONS.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_nest() {
        assert!(!in_atomic());
        let outer = AtomicSection::enter();
        {
            let _inner = AtomicSection::enter();
            assert_eq!(preempt_count(), 2);
        }
        assert!(in_atomic());
        drop(outer);
        assert!(!in_atomic());
    }

    #[test]
    fn test_might_sleep() {
        let before = sleep_violations();
        assert!(might_sleep("test").is_ok());
        assert_eq!(run_atomic(|| might_sleep("test")), Err(Error::WouldSleep));
        assert_eq!(sleep_violations(), before + 1);
        assert!(!in_atomic());
    }

    #[test]
    fn test_context_is_per_thread() {
        run_atomic(|| {
            let other = std::thread::spawn(in_atomic).join().unwrap();
            assert!(!other);
            assert!(in_atomic());
        });
    }
}
