//! Named runtimes, published through a shared table so lookups from any
//! context never block on a spawn or a stop.

use crate::error::{Error, Result};
use crate::rcu::SharedTable;
use crate::runtime::{Environment, Outcome, Runtime, Transfer};

pub struct Registry {
    env: Environment,
    table: SharedTable,
}

impl Registry {
    pub fn new(env: Environment) -> Result<Self> {
        let table = SharedTable::new(&env.memory, env.table_size, true)?;
        Ok(Self { env, table })
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Create a runtime from `script` and publish it as `name`
    ///
    /// The runtime is built before the name is claimed. If another caller
    /// published `name` in the meantime, the new runtime is stopped and
    /// [`Error::InvalidState`] is returned.
    pub fn spawn(&self, name: &str, script: &str, sleep: bool) -> Result<Runtime> {
        if self.table.get(name.as_bytes())?.is_some() {
            return Err(exists(name));
        }
        let rt = Runtime::new(&self.env, script, sleep)?;
        let published = match self.table.try_insert(name.as_bytes(), rt.object()) {
            Ok(published) => published,
            Err(e) => {
                rt.stop()?;
                return Err(e);
            }
        };
        if !published {
            log::warn!("registry: lost the race for '{}'", name);
            rt.stop()?;
            return Err(exists(name));
        }
        log::info!("registry: spawned '{}' from '{}'", name, script);
        Ok(rt)
    }

    pub fn get(&self, name: &str) -> Result<Option<Runtime>> {
        self.table
            .get(name.as_bytes())?
            .map(Runtime::from_object)
            .transpose()
    }

    fn require(&self, name: &str) -> Result<Runtime> {
        self.get(name)?.ok_or_else(|| Error::NotFound {
            name: format!("runtime '{}'", name),
        })
    }

    /// Names of all published runtimes, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.table.map(|key, _| {
            names.push(String::from_utf8_lossy(key).into_owned());
            Ok(())
        })?;
        names.sort();
        Ok(names)
    }

    pub fn resume(&self, name: &str, args: &[Transfer]) -> Result<Outcome> {
        self.require(name)?.resume(args)
    }

    /// Stop the runtime and unpublish it
    pub fn stop(&self, name: &str) -> Result<()> {
        let rt = self.require(name)?;
        rt.stop()?;
        self.table.set(name.as_bytes(), None)?;
        log::info!("registry: stopped '{}'", name);
        Ok(())
    }

    /// Stop every runtime
    pub fn shutdown(&self) -> Result<()> {
        for name in self.list()? {
            self.stop(&name)?;
        }
        Ok(())
    }
}

fn exists(name: &str) -> Error {
    Error::invalid_state(format!("runtime '{}' already exists", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmem::KernelMemory;
    use crate::runtime::MemoryLoader;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn registry() -> Registry {
        let loader = MemoryLoader::new()
            .with("echo", "return function(...) while true do coroutine.yield(...) end end")
            .with(
                "slow",
                "local n = 0 for i = 1, 200000 do n = n + 1 end return function() return n end",
            );
        Registry::new(Environment::new(KernelMemory::default(), Arc::new(loader))).unwrap()
    }

    #[test]
    fn test_spawn_get_stop() {
        let registry = registry();
        registry.spawn("b", "echo", true).unwrap();
        registry.spawn("a", "echo", false).unwrap();
        assert_eq!(registry.list().unwrap(), vec!["a", "b"]);
        assert!(registry.spawn("a", "echo", true).is_err());

        let out = registry.resume("a", &[Transfer::from("hi")]).unwrap();
        assert_eq!(out, Outcome::Yielded(vec![Transfer::from("hi")]));

        registry.stop("a").unwrap();
        assert!(registry.get("a").unwrap().is_none());
        assert!(matches!(
            registry.resume("a", &[]),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(registry.list().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_shutdown() {
        let registry = registry();
        let rt = registry.spawn("x", "echo", true).unwrap();
        registry.shutdown().unwrap();
        assert!(rt.object().is_closed());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_spawn_of_one_name() {
        let registry = Arc::new(registry());
        for round in 0..4 {
            let name = format!("r{}", round);
            let barrier = Arc::new(Barrier::new(2));
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    let name = name.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        registry.spawn(&name, "slow", true)
                    })
                })
                .collect();
            let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "round {}", round);
            let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
            assert_eq!(loser.kind(), crate::ErrorKind::Argument);

            let published = registry.get(&name).unwrap().unwrap();
            assert_eq!(&published, winners[0]);
            assert_eq!(
                published.resume(&[]),
                Ok(Outcome::Returned(vec![Transfer::Integer(200000)]))
            );
        }
        assert_eq!(registry.list().unwrap().len(), 4);
    }
}
