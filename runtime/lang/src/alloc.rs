//! Pluggable allocation accounting for the interpreter heap.
//!
//! Every heap object the interpreter creates is backed by a [`Block`] obtained
//! from an [`Allocator`]. The allocator never hands out memory itself; it
//! decides whether a request of a given size may be satisfied. This lets an
//! embedder route interpreter memory through its own allocator, apply limits,
//! or refuse to block.

use core::fmt;

/// A granted allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Size requested by the interpreter
    pub size: usize,
    /// Size actually reserved by the allocator (>= `size`)
    pub capacity: usize,
    /// Allocator-private tag, returned unchanged on reallocation
    pub cookie: u32,
}

/// An allocation request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    pub requested: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation of {} bytes refused", self.requested)
    }
}

/// Allocation hook used by the interpreter heap.
///
/// A single entry point handles allocation, resizing and release, mirroring
/// a `realloc`-style interface:
///
/// - `block == None`, `new_size > 0`: allocate
/// - `block == Some`, `new_size > 0`: resize, possibly returning a new block
/// - `new_size == 0`: free `block` and return `Ok(None)`; this never fails
pub trait Allocator: Send {
    fn reallocate(
        &mut self,
        block: Option<Block>,
        new_size: usize,
    ) -> Result<Option<Block>, AllocError>;
}

/// Allocator that only counts bytes, with an optional ceiling.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    in_use: usize,
    limit: Option<usize>,
}

impl CountingAllocator {
    /// An allocator without a limit.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            in_use: 0,
            limit: Some(limit),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

impl Allocator for CountingAllocator {
    fn reallocate(
        &mut self,
        block: Option<Block>,
        new_size: usize,
    ) -> Result<Option<Block>, AllocError> {
        let old = block.map_or(0, |b| b.capacity);
        if new_size == 0 {
            self.in_use -= old;
            return Ok(None);
        }
        let projected = self.in_use - old + new_size;
        if let Some(limit) = self.limit {
            if projected > limit {
                return Err(AllocError {
                    requested: new_size,
                });
            }
        }
        self.in_use = projected;
        Ok(Some(Block {
            size: new_size,
            capacity: new_size,
            cookie: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_allocator() {
        let mut alloc = CountingAllocator::new();
        let block = alloc.reallocate(None, 100).unwrap().unwrap();
        assert_eq!(alloc.in_use(), 100);

        let block = alloc.reallocate(Some(block), 40).unwrap().unwrap();
        assert_eq!(alloc.in_use(), 40);

        assert_eq!(alloc.reallocate(Some(block), 0).unwrap(), None);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_limit() {
        let mut alloc = CountingAllocator::with_limit(64);
        let block = alloc.reallocate(None, 60).unwrap();
        assert_eq!(
            alloc.reallocate(None, 8),
            Err(AllocError { requested: 8 })
        );
        // Shrinking an existing block always fits
        assert!(alloc.reallocate(block, 10).is_ok());
        assert_eq!(alloc.in_use(), 10);
    }
}
