//! Kernel memory model
//!
//! Accounting allocator shaped after the kernel's two allocation paths:
//!
//! - **slab** (`kmalloc`): small requests, capacity rounded up to the next
//!   power of two. Available in any context when asked for with
//!   [`Gfp::ATOMIC`].
//! - **vmalloc**: requests above `kmalloc_max`, rounded up to whole pages.
//!   Only sleeping ([`Gfp::KERNEL`]) requests may take this path.
//!
//! Memory is accounted, not handed out: an [`Extent`] records what was
//! granted, and callers return it with [`KernelMemory::kfree`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use serde::Serialize;

use crate::context;
use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

/// Smallest slab object size
pub const SLAB_MIN: usize = 8;

/// Default ceiling for all kernel memory charged through one [`KernelMemory`]
pub const DEFAULT_TOTAL: usize = 64 * 1024 * 1024;

/// Default largest slab allocation
pub const DEFAULT_KMALLOC_MAX: usize = 128 * 1024;

bitflags! {
    /// Allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Gfp: u32 {
        /// May sleep and reclaim
        const KERNEL = 1 << 0;
        /// Never sleeps; fails instead
        const ATOMIC = 1 << 1;
    }
}

impl Gfp {
    /// Whether a request with these flags may block
    pub fn may_sleep(self) -> bool {
        self.contains(Gfp::KERNEL)
    }
}

/// A granted allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    /// Bytes requested
    pub size: usize,
    /// Bytes reserved (>= `size`)
    pub capacity: usize,
    /// Whether the extent came from the vmalloc path
    pub vmalloc: bool,
}

/// Snapshot of allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryStats {
    pub in_use: usize,
    pub peak: usize,
    pub allocations: usize,
    pub frees: usize,
    pub failures: usize,
    /// Bytes moved by reallocations that could not grow in place
    pub copied: usize,
}

#[derive(Debug)]
struct Inner {
    total: usize,
    kmalloc_max: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    failures: AtomicUsize,
    copied: AtomicUsize,
}

/// Shared, thread-safe kernel memory accounting
///
/// Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct KernelMemory {
    inner: Arc<Inner>,
}

impl Default for KernelMemory {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL, DEFAULT_KMALLOC_MAX)
    }
}

impl KernelMemory {
    /// Create a pool limited to `total` bytes
    ///
    /// # Arguments
    /// * `total` - Ceiling for all outstanding extents
    /// * `kmalloc_max` - Largest request served by the slab path
    pub fn new(total: usize, kmalloc_max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                total,
                kmalloc_max,
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                copied: AtomicUsize::new(0),
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.inner.total
    }

    pub fn kmalloc_max(&self) -> usize {
        self.inner.kmalloc_max
    }

    /// Bytes currently charged
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = &self.inner;
        MemoryStats {
            in_use: inner.in_use.load(Ordering::Acquire),
            peak: inner.peak.load(Ordering::Relaxed),
            allocations: inner.allocations.load(Ordering::Relaxed),
            frees: inner.frees.load(Ordering::Relaxed),
            failures: inner.failures.load(Ordering::Relaxed),
            copied: inner.copied.load(Ordering::Relaxed),
        }
    }

    /// Allocate `size` bytes
    ///
    /// # Errors
    /// - [`Error::WouldSleep`] for a sleeping request from atomic context
    /// - [`Error::OutOfMemory`] when the pool is exhausted, or when a
    ///   non-sleeping request exceeds `kmalloc_max`
    pub fn kmalloc(&self, size: usize, gfp: Gfp) -> Result<Extent> {
        if gfp.may_sleep() {
            context::might_sleep("kmalloc")?;
        }
        if size == 0 {
            return Ok(Extent::default());
        }

        let extent = if size <= self.inner.kmalloc_max {
            Extent {
                size,
                capacity: size.next_power_of_two().max(SLAB_MIN),
                vmalloc: false,
            }
        } else if gfp.may_sleep() {
            Extent {
                size,
                capacity: size.div_ceil(PAGE_SIZE) * PAGE_SIZE,
                vmalloc: true,
            }
        } else {
            return Err(self.fail(size));
        };

        self.charge(extent.capacity).map_err(|_| self.fail(size))?;
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(extent)
    }

    /// Resize `extent` to `size` bytes
    ///
    /// Grows in place while the reserved capacity suffices; otherwise a new
    /// extent is allocated, the old contents are copied over and the old
    /// extent is freed. Resizing to zero frees the extent. On failure the
    /// original extent is left untouched.
    pub fn krealloc(&self, extent: Extent, size: usize, gfp: Gfp) -> Result<Extent> {
        if size == 0 {
            self.kfree(extent);
            return Ok(Extent::default());
        }
        if size <= extent.capacity {
            return Ok(Extent { size, ..extent });
        }
        let fresh = self.kmalloc(size, gfp)?;
        self.inner.copied.fetch_add(extent.size, Ordering::Relaxed);
        self.kfree(extent);
        Ok(fresh)
    }

    pub fn kfree(&self, extent: Extent) {
        if extent.capacity == 0 {
            return;
        }
        self.inner.in_use.fetch_sub(extent.capacity, Ordering::AcqRel);
        self.inner.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocate `size` bytes, returned when the guard drops
    pub fn allocate(&self, size: usize, gfp: Gfp) -> Result<Allocation> {
        let extent = self.kmalloc(size, gfp)?;
        Ok(Allocation {
            memory: self.clone(),
            extent,
        })
    }

    fn charge(&self, bytes: usize) -> core::result::Result<(), ()> {
        let inner = &self.inner;
        let mut current = inner.in_use.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(bytes).ok_or(())?;
            if next > inner.total {
                return Err(());
            }
            match inner.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    inner.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn fail(&self, requested: usize) -> Error {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("kmalloc: refusing {} bytes ({} in use)", requested, self.in_use());
        Error::OutOfMemory { requested }
    }
}

/// An extent that is freed on drop
#[derive(Debug)]
pub struct Allocation {
    memory: KernelMemory,
    extent: Extent,
}

impl Allocation {
    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn size(&self) -> usize {
        self.extent.size
    }

    /// Resize in place or by moving, as [`KernelMemory::krealloc`]
    pub fn resize(&mut self, size: usize, gfp: Gfp) -> Result<()> {
        self.extent = self.memory.krealloc(self.extent, size, gfp)?;
        Ok(())
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.memory.kfree(self.extent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_rounding() {
        let memory = KernelMemory::default();
        let e = memory.kmalloc(3, Gfp::KERNEL).unwrap();
        assert_eq!(e.capacity, SLAB_MIN);
        let e2 = memory.kmalloc(100, Gfp::ATOMIC).unwrap();
        assert_eq!(e2.capacity, 128);
        assert_eq!(memory.in_use(), 136);

        memory.kfree(e);
        memory.kfree(e2);
        assert_eq!(memory.in_use(), 0);
        assert_eq!(memory.stats().peak, 136);
    }

    #[test]
    fn test_vmalloc_only_when_sleeping() {
        let memory = KernelMemory::new(1 << 20, 1024);
        let e = memory.kmalloc(5000, Gfp::KERNEL).unwrap();
        assert!(e.vmalloc);
        assert_eq!(e.capacity, 2 * PAGE_SIZE);

        assert_eq!(
            memory.kmalloc(5000, Gfp::ATOMIC),
            Err(Error::OutOfMemory { requested: 5000 })
        );
        assert_eq!(memory.stats().failures, 1);
    }

    #[test]
    fn test_limit() {
        let memory = KernelMemory::new(64, 64);
        let a = memory.kmalloc(64, Gfp::ATOMIC).unwrap();
        assert!(memory.kmalloc(1, Gfp::ATOMIC).is_err());
        memory.kfree(a);
        assert!(memory.kmalloc(1, Gfp::ATOMIC).is_ok());
    }

    #[test]
    fn test_krealloc_in_place_and_moving() {
        let memory = KernelMemory::default();
        let e = memory.kmalloc(10, Gfp::KERNEL).unwrap();
        assert_eq!(e.capacity, 16);

        let grown = memory.krealloc(e, 16, Gfp::KERNEL).unwrap();
        assert_eq!(grown.capacity, 16);
        assert_eq!(memory.stats().copied, 0);

        let moved = memory.krealloc(grown, 17, Gfp::KERNEL).unwrap();
        assert_eq!(moved.capacity, 32);
        assert_eq!(memory.stats().copied, 16);
        assert_eq!(memory.in_use(), 32);

        let freed = memory.krealloc(moved, 0, Gfp::KERNEL).unwrap();
        assert_eq!(freed.capacity, 0);
        assert_eq!(memory.in_use(), 0);
    }

    #[test]
    fn test_sleeping_request_from_atomic_context() {
        let memory = KernelMemory::default();
        let result = context::run_atomic(|| memory.kmalloc(16, Gfp::KERNEL));
        assert_eq!(result, Err(Error::WouldSleep));
        assert!(context::run_atomic(|| memory.kmalloc(16, Gfp::ATOMIC)).is_ok());
    }

    #[test]
    fn test_allocation_guard() {
        let memory = KernelMemory::default();
        {
            let mut a = memory.allocate(20, Gfp::KERNEL).unwrap();
            a.resize(100, Gfp::KERNEL).unwrap();
            assert_eq!(a.size(), 100);
            assert_eq!(memory.in_use(), 128);
        }
        assert_eq!(memory.in_use(), 0);
    }
}
