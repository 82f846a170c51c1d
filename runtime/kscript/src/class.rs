//! Class descriptors
//!
//! A [`Class`] is the static identity of a capability kind: its name, the
//! operations scripts may invoke on its instances, how to release an
//! instance's payload, and which locking and allocation discipline its
//! instances follow. Classes are `static` items and are compared by address.

use std::any::Any;

use bitflags::bitflags;
use kscript_lang::{State, Value};

use crate::error::Result;
use crate::kmem::Gfp;
use crate::runtime::Transfer;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u8 {
        /// Instances use a sleeping lock and sleeping allocations
        const SLEEP = 1 << 0;
        /// Instances are usually referenced from more than one owner
        const SHARED = 1 << 1;
        /// The payload is supplied by the constructor after creation instead
        /// of being allocated with the object
        const POINTER = 1 << 2;
    }
}

/// An operation exposed to scripts.
///
/// Receives the locked payload of the object it was invoked on, the calling
/// script's state, and the call arguments (without the object itself).
/// Results are handed back to the caller's state once the object is
/// unlocked.
pub type Operation = fn(&mut dyn Any, &mut State, &[Value]) -> Result<Vec<Transfer>>;

/// Named entry of a class's operation table
pub struct Method {
    pub name: &'static str,
    pub op: Operation,
}

/// Static description of a capability kind
pub struct Class {
    pub name: &'static str,
    pub methods: &'static [Method],
    /// Called with the payload when it is released, before it is dropped
    pub release: Option<fn(&mut dyn Any)>,
    pub flags: ClassFlags,
}

impl Class {
    pub fn sleep(&self) -> bool {
        self.flags.contains(ClassFlags::SLEEP)
    }

    pub fn shared(&self) -> bool {
        self.flags.contains(ClassFlags::SHARED)
    }

    pub fn pointer(&self) -> bool {
        self.flags.contains(ClassFlags::POINTER)
    }

    /// Allocation flags for instances of this class
    pub fn gfp(&self) -> Gfp {
        if self.sleep() {
            Gfp::KERNEL
        } else {
            Gfp::ATOMIC
        }
    }

    pub fn method(&self, name: &str) -> Option<&'static Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

impl core::fmt::Debug for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Method").field("name", &self.name).finish()
    }
}

impl core::fmt::Debug for Class {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("flags", &self.flags)
            .finish()
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl Eq for Class {}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut dyn Any, _: &mut State, _: &[Value]) -> Result<Vec<Transfer>> {
        Ok(Vec::new())
    }

    static DEVICE: Class = Class {
        name: "device",
        methods: &[Method {
            name: "poke",
            op: noop,
        }],
        release: None,
        flags: ClassFlags::SLEEP.union(ClassFlags::SHARED),
    };

    static LOOKALIKE: Class = Class {
        name: "device",
        methods: &[],
        release: None,
        flags: ClassFlags::empty(),
    };

    #[test]
    fn test_flags() {
        assert!(DEVICE.sleep());
        assert!(DEVICE.shared());
        assert!(!DEVICE.pointer());
        assert_eq!(DEVICE.gfp(), Gfp::KERNEL);
        assert_eq!(LOOKALIKE.gfp(), Gfp::ATOMIC);
    }

    #[test]
    fn test_identity_is_by_address() {
        assert_eq!(DEVICE, DEVICE);
        assert_ne!(DEVICE, LOOKALIKE);
    }

    #[test]
    fn test_method_lookup() {
        assert!(DEVICE.method("poke").is_some());
        assert!(DEVICE.method("prod").is_none());
    }
}
