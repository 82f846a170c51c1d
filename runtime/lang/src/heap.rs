//! The garbage-collected object heap.
//!
//! Objects live in a slot vector addressed by [`GcRef`]. Every slot is backed
//! by a [`Block`] from the embedder's [`Allocator`], so the embedder sees (and
//! may refuse) every allocation the interpreter makes. Collection is a simple
//! mark and sweep over explicit roots supplied by the VM.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::alloc::{Allocator, Block};
use crate::bytecode::Proto;
use crate::error::{Error, Result};
use crate::state::{State, Thread};
use crate::userdata::UserData;
use crate::value::{GcRef, Value};

/// A function implemented in Rust.
pub type NativeFn = Arc<dyn Fn(&mut State, &[Value]) -> Result<Vec<Value>> + Send + Sync>;

/// Collections are not attempted until this many bytes are in use.
const MIN_THRESHOLD: usize = 64 * 1024;

/// Tombstones are compacted away once they outnumber live entries.
const COMPACT_MIN: usize = 16;

#[derive(Default)]
pub(crate) struct Table {
    map: IndexMap<Value, Value>,
    /// Keys whose value was set to nil; kept so `next` stays valid while a
    /// traversal clears entries
    tombstones: usize,
}

impl Table {
    pub fn get(&self, key: Value) -> Value {
        self.map.get(&key).copied().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: Value, value: Value) {
        if let Some(slot) = self.map.get_mut(&key) {
            match (slot.is_nil(), value.is_nil()) {
                (false, true) => self.tombstones += 1,
                (true, false) => self.tombstones -= 1,
                _ => {}
            }
            *slot = value;
            return;
        }
        if value.is_nil() {
            return;
        }
        if self.tombstones >= COMPACT_MIN && self.tombstones > self.map.len() / 2 {
            self.map.retain(|_, v| !v.is_nil());
            self.tombstones = 0;
        }
        self.map.insert(key, value);
    }

    /// Length of the array part: the largest `n` such that `t[1..=n]` are non-nil.
    pub fn len(&self) -> i64 {
        let mut n = 0;
        while !self.get(Value::Integer(n + 1)).is_nil() {
            n += 1;
        }
        n
    }

    /// The entry following `key` in traversal order (`nil` starts a traversal).
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>> {
        let start = if key.is_nil() {
            0
        } else {
            match self.map.get_index_of(&key) {
                Some(idx) => idx + 1,
                None => return Err(Error::runtime("invalid key to 'next'")),
            }
        };
        Ok(self
            .map
            .iter()
            .skip(start)
            .find(|(_, v)| !v.is_nil())
            .map(|(&k, &v)| (k, v)))
    }

    fn capacity(&self) -> usize {
        self.map.capacity()
    }

    fn trace(&self, out: &mut Vec<GcRef>) {
        for (k, v) in &self.map {
            out.extend(k.gc_ref());
            out.extend(v.gc_ref());
        }
    }
}

pub(crate) struct Closure {
    pub proto: Arc<Proto>,
    /// Cells captured when the closure was created
    pub upvals: Arc<[GcRef]>,
}

pub(crate) enum Object {
    String(Arc<str>),
    Table(Table),
    Closure(Closure),
    Native(NativeFn),
    Cell(Value),
    Userdata(Arc<dyn UserData>),
    /// `None` while the thread is running and owned by the active chain
    Thread(Option<Box<Thread>>),
}

impl Object {
    /// Bytes charged to the allocator for this object.
    fn footprint(&self) -> usize {
        let payload = match self {
            Object::String(s) => s.len(),
            Object::Table(t) => t.capacity() * (2 * size_of::<Value>() + size_of::<usize>()),
            Object::Closure(c) => c.upvals.len() * size_of::<GcRef>(),
            Object::Native(_) => 2 * size_of::<usize>(),
            Object::Cell(_) => 0,
            Object::Userdata(_) => 2 * size_of::<usize>(),
            Object::Thread(_) => size_of::<Thread>(),
        };
        size_of::<Slot>() + payload
    }

    fn trace(&self, out: &mut Vec<GcRef>) {
        match self {
            Object::Table(t) => t.trace(out),
            Object::Closure(c) => {
                out.extend(c.upvals.iter().copied());
                c.proto.for_each_constant(&mut |v| out.extend(v.gc_ref()));
            }
            Object::Cell(v) => out.extend(v.gc_ref()),
            Object::Thread(Some(thread)) => thread.trace(out),
            Object::String(_) | Object::Native(_) | Object::Userdata(_) | Object::Thread(None) => {}
        }
    }
}

struct Slot {
    object: Object,
    block: Block,
    marked: bool,
}

pub(crate) struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    strings: HashMap<Arc<str>, GcRef>,
    allocator: Box<dyn Allocator>,
    in_use: usize,
    threshold: usize,
}

impl Heap {
    pub fn new(allocator: Box<dyn Allocator>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: HashMap::new(),
            allocator,
            in_use: 0,
            threshold: MIN_THRESHOLD,
        }
    }

    /// Bytes currently granted by the allocator.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn alloc(&mut self, object: Object) -> Result<GcRef> {
        let size = object.footprint();
        let block = match self.allocator.reallocate(None, size) {
            Ok(Some(block)) => block,
            Ok(None) | Err(_) => return Err(Error::OutOfMemory),
        };
        self.in_use += block.size;

        let slot = Slot {
            object,
            block,
            marked: false,
        };
        let r = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                GcRef(idx)
            }
            None => {
                self.slots.push(Some(slot));
                GcRef((self.slots.len() - 1) as u32)
            }
        };
        Ok(r)
    }

    /// Returns the interned string with these contents, creating it if needed.
    pub fn intern(&mut self, s: &str) -> Result<GcRef> {
        if let Some(&r) = self.strings.get(s) {
            return Ok(r);
        }
        let text: Arc<str> = Arc::from(s);
        let r = self.alloc(Object::String(text.clone()))?;
        self.strings.insert(text, r);
        Ok(r)
    }

    /// Finds an already interned string without allocating.
    pub fn lookup(&self, s: &str) -> Option<GcRef> {
        self.strings.get(s).copied()
    }

    pub fn get(&self, r: GcRef) -> Option<&Object> {
        self.slots
            .get(r.0 as usize)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.object)
    }

    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut Object> {
        self.slots
            .get_mut(r.0 as usize)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.object)
    }

    pub fn string(&self, r: GcRef) -> Option<&str> {
        match self.get(r) {
            Some(Object::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn table(&self, r: GcRef) -> Option<&Table> {
        match self.get(r) {
            Some(Object::Table(t)) => Some(t),
            _ => None,
        }
    }

    pub fn cell(&self, r: GcRef) -> Value {
        match self.get(r) {
            Some(Object::Cell(v)) => *v,
            _ => Value::Nil,
        }
    }

    pub fn set_cell(&mut self, r: GcRef, value: Value) {
        if let Some(Object::Cell(v)) = self.get_mut(r) {
            *v = value;
        }
    }

    /// Stores `t[key] = value`, charging the allocator if the table grows.
    pub fn table_set(&mut self, t: GcRef, key: Value, value: Value) -> Result<()> {
        let Some(slot) = self.slots.get_mut(t.0 as usize).and_then(|s| s.as_mut()) else {
            return Err(Error::runtime("attempt to index a dead table"));
        };
        let Object::Table(table) = &mut slot.object else {
            return Err(Error::runtime("table expected"));
        };
        table.set(key, value);

        let wanted = slot.object.footprint();
        if wanted > slot.block.size {
            match self.allocator.reallocate(Some(slot.block), wanted) {
                Ok(Some(block)) => {
                    self.in_use = self.in_use - slot.block.size + block.size;
                    slot.block = block;
                }
                _ => {
                    // Undo the store so the table matches what was charged.
                    if let Object::Table(table) = &mut slot.object {
                        table.set(key, Value::Nil);
                    }
                    return Err(Error::OutOfMemory);
                }
            }
        }
        Ok(())
    }

    pub fn should_collect(&self) -> bool {
        self.in_use > self.threshold
    }

    /// Marks everything reachable from `roots` and frees the rest.
    ///
    /// Returns the number of objects freed.
    pub fn collect(&mut self, roots: Vec<GcRef>) -> usize {
        let before = self.in_use;
        let mut work = roots;
        while let Some(r) = work.pop() {
            let Some(Some(slot)) = self.slots.get_mut(r.0 as usize) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            slot.object.trace(&mut work);
        }

        let mut freed = 0;
        for idx in 0..self.slots.len() {
            let marked = match &mut self.slots[idx] {
                Some(slot) => core::mem::replace(&mut slot.marked, false),
                None => continue,
            };
            if marked {
                continue;
            }
            if let Some(slot) = self.slots[idx].take() {
                self.release(slot);
                self.free.push(idx as u32);
                freed += 1;
            }
        }

        self.threshold = (self.in_use * 2).max(MIN_THRESHOLD);
        log::debug!(
            "gc: freed {} objects, {} -> {} bytes",
            freed,
            before,
            self.in_use
        );
        freed
    }

    fn release(&mut self, slot: Slot) {
        if let Object::String(s) = &slot.object {
            self.strings.remove(s);
        }
        self.in_use -= slot.block.size;
        // Freeing never fails.
        let _ = self.allocator.reallocate(Some(slot.block), 0);
        drop(slot.object);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.strings.clear();
        for slot in self.slots.iter_mut().filter_map(|s| s.take()) {
            self.in_use -= slot.block.size;
            let _ = self.allocator.reallocate(Some(slot.block), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;

    fn heap() -> Heap {
        Heap::new(Box::new(CountingAllocator::new()))
    }

    #[test]
    fn test_interning() {
        let mut heap = heap();
        let a = heap.intern("hello").unwrap();
        let b = heap.intern("hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.string(a), Some("hello"));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_collect_unreachable() {
        let mut heap = heap();
        let kept = heap.alloc(Object::Table(Table::default())).unwrap();
        let key = heap.intern("k").unwrap();
        let value = heap.intern("v").unwrap();
        heap.table_set(kept, Value::String(key), Value::String(value))
            .unwrap();
        heap.intern("garbage").unwrap();

        assert_eq!(heap.collect(vec![kept]), 1);
        assert_eq!(heap.len(), 3);
        // The freed string is no longer interned
        assert_eq!(heap.lookup("garbage"), None);
        assert!(heap.lookup("k").is_some());
    }

    #[test]
    fn test_slots_are_reused() {
        let mut heap = heap();
        heap.intern("a").unwrap();
        heap.collect(Vec::new());
        let r = heap.intern("b").unwrap();
        assert_eq!(r, GcRef(0));
    }

    #[test]
    fn test_allocation_failure() {
        let mut heap = Heap::new(Box::new(CountingAllocator::with_limit(16)));
        assert_eq!(heap.intern("too big for the limit"), Err(Error::OutOfMemory));
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn test_table_tombstones() {
        let mut table = Table::default();
        table.set(Value::Integer(1), Value::Boolean(true));
        table.set(Value::Integer(2), Value::Boolean(true));
        table.set(Value::Integer(1), Value::Nil);

        // A cleared key still works as a traversal cursor
        assert_eq!(
            table.next(Value::Integer(1)).unwrap(),
            Some((Value::Integer(2), Value::Boolean(true)))
        );
        assert_eq!(
            table.next(Value::Nil).unwrap(),
            Some((Value::Integer(2), Value::Boolean(true)))
        );
        assert!(table.next(Value::Integer(9)).is_err());
        assert_eq!(table.len(), 0);
    }
}
