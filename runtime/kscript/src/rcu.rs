//! RCU shared table
//!
//! A fixed-size, seeded hash table mapping byte-string keys to
//! [`Object`]s. Readers never take a lock: they walk bucket chains inside an
//! epoch critical section and take their own reference on what they find
//! before leaving it. Writers serialize on the table object's lock, publish
//! new entries with a single pointer store, and hand unlinked entries to the
//! epoch collector, which releases the entry's object reference once no
//! reader can still see it.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use static_assertions::const_assert;

use crate::class::{Class, ClassFlags};
use crate::error::{Error, Result};
use crate::kmem::{Allocation, Gfp, KernelMemory};
use crate::object::Object;

/// Longest key accepted, in bytes
pub const MAX_KEY_LEN: usize = 255;

/// Bucket count used when none is given
pub const DEFAULT_SIZE: usize = 256;

const_assert!(DEFAULT_SIZE.is_power_of_two());

/// Table locked by a mutex; writers may sleep
pub static TABLE: Class = Class {
    name: "rcu",
    methods: &[],
    release: Some(release_table),
    flags: ClassFlags::SLEEP.union(ClassFlags::SHARED),
};

/// Table locked by a spin lock; usable from atomic context
pub static TABLE_ATOMIC: Class = Class {
    name: "rcu",
    methods: &[],
    release: Some(release_table),
    flags: ClassFlags::SHARED,
};

struct Entry {
    key: Box<[u8]>,
    object: Object,
    next: Atomic<Entry>,
    _charge: Allocation,
}

/// Seeded bucket array, shared by every handle of one table
pub(crate) struct Buckets {
    seed: u32,
    heads: Box<[Atomic<Entry>]>,
}

impl Buckets {
    fn new(size: usize) -> Self {
        Self {
            seed: rand::random(),
            heads: (0..size).map(|_| Atomic::null()).collect(),
        }
    }

    fn bucket(&self, key: &[u8]) -> &Atomic<Entry> {
        let index = hash(self.seed, key) as usize & (self.heads.len() - 1);
        &self.heads[index]
    }

    /// Unlink every entry and defer its reclamation
    fn clear(&self) {
        let guard = &epoch::pin();
        for head in self.heads.iter() {
            let mut entry = head.swap(Shared::null(), Ordering::AcqRel, guard);
            while let Some(e) = unsafe { entry.as_ref() } {
                let next = e.next.load(Ordering::Acquire, guard);
                // SAFETY: unlinked above; readers that still hold it are
                // covered by the grace period.
                unsafe { guard.defer_destroy(entry) };
                entry = next;
            }
        }
    }
}

impl Drop for Buckets {
    fn drop(&mut self) {
        // SAFETY: no handle is left, so no reader can be traversing.
        let guard = unsafe { epoch::unprotected() };
        for head in self.heads.iter() {
            let mut entry = head.load(Ordering::Relaxed, guard);
            while !entry.is_null() {
                let owned = unsafe { entry.into_owned() };
                entry = owned.next.load(Ordering::Relaxed, guard);
                drop(owned);
            }
        }
    }
}

/// Payload of a table object; closing it empties the table
struct TablePrivate {
    buckets: Arc<Buckets>,
}

fn release_table(private: &mut dyn std::any::Any) {
    if let Some(table) = private.downcast_mut::<TablePrivate>() {
        table.buckets.clear();
    }
}

/// Key hash, seeded per table.
///
/// Mixes the bytes from last to first, starting from the seed combined with
/// the key length.
pub fn hash(seed: u32, key: &[u8]) -> u32 {
    let mut h = seed ^ key.len() as u32;
    for &b in key.iter().rev() {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(u32::from(b));
    }
    h
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

/// Handle to a shared table
///
/// Clones share the table. The underlying object can also travel on its own
/// (for instance through scripts) and be turned back into a handle with
/// [`SharedTable::from_object`].
#[derive(Clone)]
pub struct SharedTable {
    object: Object,
    buckets: Arc<Buckets>,
}

impl SharedTable {
    /// Create a table with at least `size` buckets
    ///
    /// The bucket count is rounded up to a power of two. `sleep` selects the
    /// table's lock: a mutex, or a spin lock for tables written from atomic
    /// context.
    pub fn new(memory: &KernelMemory, size: usize, sleep: bool) -> Result<Self> {
        let size = size
            .max(1)
            .checked_next_power_of_two()
            .ok_or(Error::OutOfMemory {
                requested: usize::MAX,
            })?;
        let class = if sleep { &TABLE } else { &TABLE_ATOMIC };
        let bytes = size.saturating_mul(core::mem::size_of::<Atomic<Entry>>());
        if bytes > memory.total() {
            return Err(Error::OutOfMemory { requested: bytes });
        }

        let buckets = Arc::new(Buckets::new(size));
        let object = Object::new(
            class,
            memory,
            bytes,
            TablePrivate {
                buckets: buckets.clone(),
            },
        )?;
        log::debug!("rcu: created table with {} buckets", size);
        Ok(Self { object, buckets })
    }

    /// Recover a table handle from its object
    pub fn from_object(object: &Object) -> Result<Self> {
        if !object.is(&TABLE) && !object.is(&TABLE_ATOMIC) {
            return Err(Error::WrongClass {
                expected: TABLE.name,
                found: object.class().name,
            });
        }
        let buckets = object.with(|table: &mut TablePrivate| table.buckets.clone())?;
        Ok(Self {
            object: object.clone(),
            buckets,
        })
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Number of buckets
    pub fn size(&self) -> usize {
        self.buckets.heads.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.object.is_closed() {
            return Err(Error::Closed {
                class: self.object.class().name,
            });
        }
        Ok(())
    }

    /// Look up `key`
    ///
    /// Lock-free; safe from any context. The returned handle holds its own
    /// reference, taken before the read-side critical section ends.
    pub fn get(&self, key: &[u8]) -> Result<Option<Object>> {
        check_key(key)?;
        self.check_open()?;
        let guard = &epoch::pin();
        Ok(find(self.buckets.bucket(key), key, guard)
            .map(|(_, entry)| unsafe { entry.deref() }.object.clone()))
    }

    /// Bind `key` to `object`, or remove it when `object` is `None`
    ///
    /// Returns whether `key` was bound before. A replaced or removed entry
    /// drops its object reference only after a grace period.
    ///
    /// # Errors
    /// - [`Error::KeyTooLong`] before anything is touched
    /// - [`Error::OutOfMemory`] if the new entry cannot be charged
    /// - [`Error::Closed`] once the table has been closed
    pub fn set(&self, key: &[u8], object: Option<&Object>) -> Result<bool> {
        check_key(key)?;
        let memory = self.object.memory();
        let gfp = self.object.gfp();
        self.object.with_private(|_| {
            let guard = &epoch::pin();
            let head = self.buckets.bucket(key);
            let found = find(head, key, guard);

            let Some(object) = object else {
                let Some((link, old)) = found else {
                    return Ok(false);
                };
                let next = unsafe { old.deref() }.next.load(Ordering::Acquire, guard);
                link.store(next, Ordering::Release);
                // SAFETY: unlinked under the table lock.
                unsafe { guard.defer_destroy(old) };
                log::debug!("rcu: removed {:?}", String::from_utf8_lossy(key));
                return Ok(true);
            };

            let mut entry = new_entry(memory, gfp, key, object)?;
            match found {
                Some((link, old)) => {
                    entry.next = Atomic::from(unsafe { old.deref() }.next.load(Ordering::Acquire, guard));
                    let old = link.swap(entry, Ordering::AcqRel, guard);
                    // SAFETY: replaced under the table lock.
                    unsafe { guard.defer_destroy(old) };
                    log::debug!("rcu: replaced {:?}", String::from_utf8_lossy(key));
                    Ok(true)
                }
                None => {
                    link_head(head, entry, guard);
                    log::debug!("rcu: inserted {:?}", String::from_utf8_lossy(key));
                    Ok(false)
                }
            }
        })
    }

    /// Bind `key` to `object` unless it is already bound
    ///
    /// The lookup and the insert happen under the table lock, so of several
    /// concurrent callers for one key exactly one succeeds. Returns whether
    /// `object` was inserted; an existing binding is left untouched.
    pub fn try_insert(&self, key: &[u8], object: &Object) -> Result<bool> {
        check_key(key)?;
        let memory = self.object.memory();
        let gfp = self.object.gfp();
        self.object.with_private(|_| {
            let guard = &epoch::pin();
            let head = self.buckets.bucket(key);
            if find(head, key, guard).is_some() {
                return Ok(false);
            }
            let entry = new_entry(memory, gfp, key, object)?;
            link_head(head, entry, guard);
            log::debug!("rcu: inserted {:?}", String::from_utf8_lossy(key));
            Ok(true)
        })
    }

    /// Call `f` for every entry
    ///
    /// `f` runs outside the read-side critical section with its own
    /// reference on the object, so it may block or modify this table.
    /// Entries are visited in bucket order; an entry is visited if it is
    /// still linked when the walk reaches it, and each key at most once.
    pub fn map<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Object) -> Result<()>,
    {
        self.check_open()?;
        let mut visited: HashSet<Box<[u8]>> = HashSet::new();
        for head in self.buckets.heads.iter() {
            visited.clear();
            loop {
                let next = {
                    let guard = &epoch::pin();
                    let mut current = head.load(Ordering::Acquire, guard);
                    let mut pick = None;
                    while let Some(entry) = unsafe { current.as_ref() } {
                        if !visited.contains(&entry.key) {
                            pick = Some((entry.key.clone(), entry.object.clone()));
                            break;
                        }
                        current = entry.next.load(Ordering::Acquire, guard);
                    }
                    pick
                };
                let Some((key, object)) = next else {
                    break;
                };
                f(&key, object)?;
                visited.insert(key);
            }
        }
        Ok(())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        for head in self.buckets.heads.iter() {
            let mut current = head.load(Ordering::Acquire, guard);
            while let Some(entry) = unsafe { current.as_ref() } {
                count += 1;
                current = entry.next.load(Ordering::Acquire, guard);
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the table, releasing every entry after a grace period
    pub fn close(&self) -> Result<()> {
        self.object.close()
    }
}

fn new_entry(memory: &KernelMemory, gfp: Gfp, key: &[u8], object: &Object) -> Result<Owned<Entry>> {
    let charge = memory.allocate(core::mem::size_of::<Entry>() + key.len(), gfp)?;
    Ok(Owned::new(Entry {
        key: key.into(),
        object: object.clone(),
        next: Atomic::null(),
        _charge: charge,
    }))
}

/// Publish `entry` at the head of a chain; the table lock must be held.
fn link_head(head: &Atomic<Entry>, mut entry: Owned<Entry>, guard: &Guard) {
    entry.next = Atomic::from(head.load(Ordering::Acquire, guard));
    head.store(entry, Ordering::Release);
}

/// Find `key` in the chain at `head`, returning the link that points at the
/// entry together with the entry.
fn find<'g>(
    head: &'g Atomic<Entry>,
    key: &[u8],
    guard: &'g Guard,
) -> Option<(&'g Atomic<Entry>, Shared<'g, Entry>)> {
    let mut link = head;
    loop {
        let current = link.load(Ordering::Acquire, guard);
        // SAFETY: entries are reclaimed only after every guard pinned while
        // they were reachable is gone.
        let entry = unsafe { current.as_ref() }?;
        if *entry.key == *key {
            return Some((link, current));
        }
        link = &entry.next;
    }
}

impl core::fmt::Debug for SharedTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedTable")
            .field("object", &self.object)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounds_up() {
        let memory = KernelMemory::default();
        assert_eq!(SharedTable::new(&memory, 0, true).unwrap().size(), 1);
        assert_eq!(SharedTable::new(&memory, 16, true).unwrap().size(), 16);
        assert_eq!(SharedTable::new(&memory, 17, false).unwrap().size(), 32);
    }

    #[test]
    fn test_hash_is_seeded() {
        assert_eq!(hash(1, b"key"), hash(1, b"key"));
        assert_ne!(hash(1, b"key"), hash(2, b"key"));
        assert_ne!(hash(1, b"key"), hash(1, b"kez"));
    }

    #[test]
    fn test_key_too_long() {
        let memory = KernelMemory::default();
        let table = SharedTable::new(&memory, 16, true).unwrap();
        let key = vec![b'k'; MAX_KEY_LEN + 1];
        assert_eq!(
            table.set(&key, None),
            Err(Error::KeyTooLong {
                len: MAX_KEY_LEN + 1,
                max: MAX_KEY_LEN
            })
        );
        assert!(table.get(&key[..MAX_KEY_LEN]).unwrap().is_none());
    }

    #[test]
    fn test_chained_bucket() {
        let memory = KernelMemory::default();
        let table = SharedTable::new(&memory, 1, false).unwrap();
        let objects: Vec<_> = (0..4)
            .map(|_| SharedTable::new(&memory, 1, false).unwrap().object().clone())
            .collect();
        for (i, obj) in objects.iter().enumerate() {
            assert!(!table.set(format!("k{i}").as_bytes(), Some(obj)).unwrap());
        }
        assert_eq!(table.len(), 4);
        assert!(table.set(b"k1", None).unwrap());
        assert!(table.set(b"k3", None).unwrap());
        assert_eq!(table.len(), 2);
        let found = table.get(b"k2").unwrap().unwrap();
        assert!(Object::ptr_eq(&found, &objects[2]));
        assert!(table.get(b"k1").unwrap().is_none());
    }

    static PLAIN: Class = Class {
        name: "plain",
        methods: &[],
        release: None,
        flags: ClassFlags::empty(),
    };

    #[test]
    fn test_from_object() {
        let memory = KernelMemory::default();
        let table = SharedTable::new(&memory, 4, true).unwrap();
        let copy = SharedTable::from_object(table.object()).unwrap();
        copy.set(b"self", Some(table.object())).unwrap();
        assert!(table.get(b"self").unwrap().is_some());
        assert!(table.set(b"self", None).unwrap());

        let plain = Object::new(&PLAIN, &memory, 0, ()).unwrap();
        assert_eq!(
            SharedTable::from_object(&plain).unwrap_err(),
            Error::WrongClass {
                expected: "rcu",
                found: "plain"
            }
        );
    }

    #[test]
    fn test_try_insert_keeps_existing_binding() {
        let memory = KernelMemory::default();
        let table = SharedTable::new(&memory, 4, false).unwrap();
        let first = Object::new(&PLAIN, &memory, 0, ()).unwrap();
        let second = Object::new(&PLAIN, &memory, 0, ()).unwrap();

        assert_eq!(table.try_insert(b"k", &first), Ok(true));
        assert_eq!(table.try_insert(b"k", &second), Ok(false));
        assert_eq!(table.get(b"k").unwrap(), Some(first));
        assert_eq!(second.refcount(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_missing_key() {
        let memory = KernelMemory::default();
        let table = SharedTable::new(&memory, 4, true).unwrap();
        assert_eq!(table.set(b"missing", None), Ok(false));
        assert!(table.is_empty());
    }

    #[test]
    fn test_closed_table() {
        let memory = KernelMemory::default();
        let table = SharedTable::new(&memory, 4, false).unwrap();
        let obj = Object::new(&PLAIN, &memory, 0, ()).unwrap();
        table.set(b"a", Some(&obj)).unwrap();
        table.close().unwrap();

        assert_eq!(table.get(b"a"), Err(Error::Closed { class: "rcu" }));
        assert_eq!(
            table.set(b"a", Some(&obj)),
            Err(Error::Closed { class: "rcu" })
        );
        assert!(table.is_empty());
    }
}
