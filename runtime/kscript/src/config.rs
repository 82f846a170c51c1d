//! Configuration
//!
//! Every field has a default, so an empty document is a valid
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::kmem::{KernelMemory, DEFAULT_KMALLOC_MAX, DEFAULT_TOTAL};
use crate::rcu;
use crate::runtime::{DirLoader, Environment};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory bootstrap scripts (`<name>.ks`) are loaded from
    pub script_dir: PathBuf,
    /// Whether runtimes may sleep unless asked otherwise
    pub sleep: bool,
    /// Default bucket count for shared tables
    pub table_size: usize,
    pub memory: MemoryLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    /// Ceiling for all kernel memory, in bytes
    pub total: usize,
    /// Largest slab allocation, in bytes
    pub kmalloc_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from("."),
            sleep: true,
            table_size: rcu::DEFAULT_SIZE,
            memory: MemoryLimits::default(),
        }
    }
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            total: DEFAULT_TOTAL,
            kmalloc_max: DEFAULT_KMALLOC_MAX,
        }
    }
}

impl Config {
    /// Build an environment loading scripts from `script_dir`
    pub fn environment(&self) -> Environment {
        let memory = KernelMemory::new(self.memory.total, self.memory.kmalloc_max);
        Environment::new(memory, Arc::new(DirLoader::new(&self.script_dir)))
            .with_table_size(self.table_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.table_size, 256);
    }

    #[test]
    fn test_partial_document() {
        let config: Config = toml::from_str(
            r#"
            sleep = false
            script_dir = "/lib/scripts"

            [memory]
            total = 1048576
            "#,
        )
        .unwrap();
        assert!(!config.sleep);
        assert_eq!(config.script_dir, PathBuf::from("/lib/scripts"));
        assert_eq!(config.memory.total, 1 << 20);
        assert_eq!(config.memory.kmalloc_max, DEFAULT_KMALLOC_MAX);

        let env = config.environment();
        assert_eq!(env.memory.total(), 1 << 20);
        assert_eq!(env.table_size, 256);
    }
}
