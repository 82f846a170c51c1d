//! Integration tests for objects, shared tables and runtimes
//!
//! These exercise the public API the way an embedder would: several OS
//! threads, several runtimes and one memory pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use kscript::context;
use kscript::{
    Class, ClassFlags, Config, Environment, ErrorKind, KernelMemory, LockKind, MemoryLoader,
    Object, Outcome, Registry, Runtime, SharedTable, Transfer,
};

static CELL: Class = Class {
    name: "cell",
    methods: &[],
    release: None,
    flags: ClassFlags::SLEEP,
};

static SPIN_CELL: Class = Class {
    name: "cell",
    methods: &[],
    release: None,
    flags: ClassFlags::empty(),
};

fn cell(memory: &KernelMemory, value: u64) -> Object {
    Object::new(&CELL, memory, 8, value).unwrap()
}

/// Pump the epoch collector until `done` holds
fn wait_for_grace_period(done: impl Fn() -> bool) {
    for _ in 0..100_000 {
        if done() {
            return;
        }
        crossbeam::epoch::pin().flush();
        thread::yield_now();
    }
    panic!("deferred reclamation never ran");
}

static TRACKED_RELEASES: AtomicUsize = AtomicUsize::new(0);

fn count_tracked(_: &mut dyn std::any::Any) {
    TRACKED_RELEASES.fetch_add(1, Ordering::SeqCst);
}

static TRACKED: Class = Class {
    name: "tracked",
    methods: &[],
    release: Some(count_tracked),
    flags: ClassFlags::SLEEP,
};

#[test]
fn test_refcount_destroys_exactly_at_last_release() {
    let memory = KernelMemory::default();
    for clones in 0..8 {
        let obj = cell(&memory, 0);
        let mut handles: Vec<Object> = (0..clones).map(|_| obj.clone()).collect();
        handles.push(obj);
        assert_eq!(handles[0].refcount(), clones + 1);

        while handles.len() > 1 {
            handles.pop();
            assert!(memory.in_use() > 0);
            assert_eq!(handles[0].refcount(), handles.len());
        }
        handles.pop();
        assert_eq!(memory.in_use(), 0);
    }
}

#[test]
fn test_sleep_class_serializes_threads() {
    let memory = KernelMemory::default();
    let obj = cell(&memory, 0);
    assert_eq!(obj.lock_kind(), LockKind::Mutex);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let obj = obj.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    obj.with(|n: &mut u64| {
                        let seen = *n;
                        thread::yield_now();
                        *n = seen + 1;
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(obj.with(|n: &mut u64| *n), Ok(2000));
}

#[test]
fn test_spin_class_never_sleeps_in_interrupt_context() {
    let memory = KernelMemory::default();
    let obj = Object::new(&SPIN_CELL, &memory, 8, 0u64).unwrap();
    assert_eq!(obj.lock_kind(), LockKind::Spin);

    let before = context::sleep_violations();
    context::run_atomic(|| {
        obj.with(|n: &mut u64| *n += 1).unwrap();
        let copy = obj.clone();
        drop(copy);
    });
    assert_eq!(context::sleep_violations(), before);

    let sleeper = cell(&memory, 0);
    let err = context::run_atomic(|| sleeper.with(|n: &mut u64| *n)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
}

#[test]
fn test_readers_see_old_or_new_object() {
    let memory = KernelMemory::default();
    let table = SharedTable::new(&memory, 16, false).unwrap();
    let old = cell(&memory, 1);
    let new = cell(&memory, 2);
    table.set(b"key", Some(&old)).unwrap();

    let writer = {
        let table = table.clone();
        let (old, new) = (old.clone(), new.clone());
        thread::spawn(move || {
            for i in 0..2000 {
                let next = if i % 2 == 0 { &new } else { &old };
                assert!(table.set(b"key", Some(next)).unwrap());
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let table = table.clone();
            let (old, new) = (old.clone(), new.clone());
            thread::spawn(move || {
                for _ in 0..2000 {
                    let found = table.get(b"key").unwrap().expect("key is always bound");
                    assert!(found == old || found == new);
                    assert!(found.refcount() >= 2);
                    let value = found.with(|n: &mut u64| *n).unwrap();
                    assert!(value == 1 || value == 2);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_deleting_missing_key_is_not_an_error() {
    let memory = KernelMemory::default();
    let table = SharedTable::new(&memory, 16, true).unwrap();
    assert_eq!(table.set(b"nothing", None), Ok(false));
    table.set(b"k", Some(&cell(&memory, 0))).unwrap();
    assert_eq!(table.set(b"k", None), Ok(true));
    assert_eq!(table.set(b"k", None), Ok(false));
}

#[test]
fn test_close_then_use_reports_stale_handle() {
    let memory = KernelMemory::default();
    let obj = cell(&memory, 7);
    let other = obj.clone();
    obj.close().unwrap();
    for handle in [&obj, &other] {
        let err = handle.with(|n: &mut u64| *n).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleHandle);
    }

    let table = SharedTable::new(&memory, 4, true).unwrap();
    table.close().unwrap();
    assert_eq!(table.get(b"a").unwrap_err().kind(), ErrorKind::StaleHandle);
}

#[test]
fn test_get_takes_one_reference() {
    let memory = KernelMemory::default();
    let table = SharedTable::new(&memory, 16, true).unwrap();
    let obj1 = cell(&memory, 1);
    table.set(b"k1", Some(&obj1)).unwrap();
    assert_eq!(obj1.refcount(), 2);

    let found = table.get(b"k1").unwrap().unwrap();
    assert!(Object::ptr_eq(&found, &obj1));
    assert_eq!(obj1.refcount(), 3);
    drop(found);
    assert_eq!(obj1.refcount(), 2);
}

#[test]
fn test_replaced_object_released_after_grace_period() {
    let memory = KernelMemory::default();
    let table = SharedTable::new(&memory, 16, true).unwrap();
    let obj1 = cell(&memory, 1);
    let obj2 = cell(&memory, 2);

    table.set(b"k1", Some(&obj1)).unwrap();
    assert!(table.set(b"k1", Some(&obj2)).unwrap());
    let found = table.get(b"k1").unwrap().unwrap();
    assert!(Object::ptr_eq(&found, &obj2));

    wait_for_grace_period(|| obj1.refcount() == 1);
    assert_eq!(obj2.refcount(), 3);
}

#[test]
fn test_dropping_or_closing_a_table_releases_its_objects() {
    let memory = KernelMemory::default();
    let shared = cell(&memory, 1);
    let table = SharedTable::new(&memory, 8, true).unwrap();
    table.set(b"a", Some(&shared)).unwrap();
    table.set(b"b", Some(&shared)).unwrap();
    assert_eq!(shared.refcount(), 3);
    drop(table);
    wait_for_grace_period(|| shared.refcount() == 1);
    assert_eq!(shared.refcount(), 1);

    let spun = Object::new(&SPIN_CELL, &memory, 8, 2u64).unwrap();
    let table = SharedTable::new(&memory, 8, false).unwrap();
    table.set(b"c", Some(&spun)).unwrap();
    assert_eq!(spun.refcount(), 2);
    table.close().unwrap();
    wait_for_grace_period(|| spun.refcount() == 1);
    assert_eq!(spun.refcount(), 1);
    assert_eq!(table.get(b"c").unwrap_err().kind(), ErrorKind::StaleHandle);
}

#[test]
fn test_atomic_runtime_rejects_sleep_class() {
    let memory = KernelMemory::default();
    let loader = MemoryLoader::new().with(
        "tables",
        "local ok, err = pcall(rcu.table, 16, true) \
         local t = rcu.table(16, false) \
         return function() return ok, err, t ~= nil end",
    );
    let env = Environment::new(memory.clone(), Arc::new(loader));

    let rt = Runtime::new(&env, "tables", false).unwrap();
    let out = rt.resume(&[]).unwrap();
    assert!(out.is_finished());
    let values = out.into_values();
    assert_eq!(values[0], Transfer::Boolean(false));
    match &values[1] {
        Transfer::String(message) => assert!(message.contains("non-sleep runtime"), "{}", message),
        other => panic!("unexpected error value {:?}", other),
    }
    assert_eq!(values[2], Transfer::Boolean(true));

    rt.stop().unwrap();
    drop(rt);
    wait_for_grace_period(|| memory.in_use() == 0);
}

#[test]
fn test_map_survives_deletion_during_walk() {
    let memory = KernelMemory::default();
    let table = SharedTable::new(&memory, 16, true).unwrap();
    let objects: Vec<_> = (1..=3).map(|i| cell(&memory, i)).collect();
    for (i, obj) in objects.iter().enumerate() {
        table.set(format!("k{}", i + 1).as_bytes(), Some(obj)).unwrap();
    }

    let mut visited = Vec::new();
    table
        .map(|key, _| {
            if key == b"k1" {
                table.set(b"k2", None)?;
            }
            visited.push(String::from_utf8_lossy(key).into_owned());
            Ok(())
        })
        .unwrap();

    let unique: HashSet<_> = visited.iter().cloned().collect();
    assert_eq!(unique.len(), visited.len());
    assert!(unique.contains("k1"));
    assert!(unique.contains("k3"));
    assert_eq!(table.len(), 2);
}

#[test]
fn test_release_callback_runs_once() {
    let memory = KernelMemory::default();
    let before = TRACKED_RELEASES.load(Ordering::SeqCst);

    let obj = Object::new(&TRACKED, &memory, 16, ()).unwrap();
    let handles: Vec<_> = (0..5).map(|_| obj.clone()).collect();
    assert_eq!(obj.refcount(), 6);
    drop(handles);
    assert_eq!(TRACKED_RELEASES.load(Ordering::SeqCst), before);
    drop(obj);
    assert_eq!(TRACKED_RELEASES.load(Ordering::SeqCst), before + 1);

    // Closing early moves the callback; it still runs once.
    let obj = Object::new(&TRACKED, &memory, 16, ()).unwrap();
    let copy = obj.clone();
    obj.close().unwrap();
    obj.close().unwrap();
    drop(obj);
    drop(copy);
    assert_eq!(TRACKED_RELEASES.load(Ordering::SeqCst), before + 2);
    assert_eq!(memory.in_use(), 0);
}

#[test]
fn test_runtimes_share_objects_through_table() {
    let memory = KernelMemory::default();
    let loader = MemoryLoader::new()
        .with(
            "writer",
            "return function(t) t.shared = rcu.table(2) coroutine.yield(true) t.shared = nil end",
        )
        .with("reader", "return function(t) return t.shared ~= nil end");
    let env = Environment::new(memory.clone(), Arc::new(loader));
    let table = SharedTable::new(&memory, 16, false).unwrap();
    let handle = Transfer::Object(table.object().clone());

    let writer = Runtime::new(&env, "writer", true).unwrap();
    let reader = Runtime::new(&env, "reader", false).unwrap();
    assert_eq!(
        writer.resume(&[handle.clone()]),
        Ok(Outcome::Yielded(vec![Transfer::Boolean(true)]))
    );
    assert!(table.get(b"shared").unwrap().is_some());

    // The reader runs on another OS thread.
    let out = thread::spawn(move || reader.resume(&[handle]))
        .join()
        .unwrap();
    assert_eq!(out, Ok(Outcome::Returned(vec![Transfer::Boolean(true)])));

    assert!(writer.resume(&[]).unwrap().is_finished());
    assert!(table.get(b"shared").unwrap().is_none());
}

#[test]
fn test_runtime_resumes_child_runtime() {
    let loader = MemoryLoader::new()
        .with("echo", "return function(...) while true do coroutine.yield(...) end end")
        .with(
            "parent",
            "return function(n) local child = runtime.spawn('echo', false) \
             local a = child:resume(n) local b = child:resume(n + 1) \
             child:stop() return a + b, pcall(child.resume, child) end",
        );
    let env = Environment::new(KernelMemory::default(), Arc::new(loader));
    let parent = Runtime::new(&env, "parent", true).unwrap();
    let values = parent.resume(&[Transfer::Integer(20)]).unwrap().into_values();
    assert_eq!(values[0], Transfer::Integer(41));
    assert_eq!(values[1], Transfer::Boolean(false));
}

#[test]
fn test_registry_from_config() {
    let dir = std::env::temp_dir().join(format!("kscript-registry-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("tick.ks"), "local n = 0 return function() while true do n = n + 1 coroutine.yield(n) end end").unwrap();

    let config: Config = toml::from_str(&format!(
        "script_dir = {:?}\ntable_size = 8\n",
        dir.display().to_string()
    ))
    .unwrap();
    let registry = Registry::new(config.environment()).unwrap();
    registry.spawn("clock", "tick", config.sleep).unwrap();
    registry.resume("clock", &[]).unwrap();
    assert_eq!(
        registry.resume("clock", &[]),
        Ok(Outcome::Yielded(vec![Transfer::Integer(2)]))
    );
    assert_eq!(registry.list().unwrap(), vec!["clock"]);
    registry.shutdown().unwrap();

    std::fs::remove_dir_all(&dir).unwrap();
}
