//! Script values.

use core::fmt;

/// Index of an object in the interpreter heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(pub(crate) u32);

impl GcRef {
    /// Stable address-like identifier, used when printing values.
    pub fn id(self) -> u32 {
        self.0
    }
}

/// A kscript value.
///
/// Values are small and `Copy`; heap-backed variants refer to objects owned by
/// the [`State`](crate::State) that created them and are only meaningful
/// there. Strings are interned, so two string values are equal exactly when
/// their contents are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    String(GcRef),
    Table(GcRef),
    Function(GcRef),
    Userdata(GcRef),
    Thread(GcRef),
    /// Storage cell of a captured local. Never observable from scripts.
    #[doc(hidden)]
    Cell(GcRef),
}

impl Value {
    /// `nil` and `false` are falsy, everything else is truthy.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_integer(self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(n),
            _ => None,
        }
    }

    /// Name of the value's type, as returned by `type()`.
    pub fn type_name(self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Userdata(_) => "userdata",
            Value::Thread(_) => "thread",
            Value::Cell(_) => "cell",
        }
    }

    pub(crate) fn gc_ref(self) -> Option<GcRef> {
        match self {
            Value::String(r)
            | Value::Table(r)
            | Value::Function(r)
            | Value::Userdata(r)
            | Value::Thread(r)
            | Value::Cell(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl fmt::Display for Value {
    /// Formats scalars; heap values print as `type: 0x…` since their contents
    /// live in the heap. Use [`State::tostring`](crate::State::tostring) for
    /// strings.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            other => match other.gc_ref() {
                Some(r) => write!(f, "{}: 0x{:08x}", other.type_name(), r.0),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::String(GcRef(1)).is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Integer(-3).to_string(), "-3");
        assert_eq!(Value::Table(GcRef(16)).to_string(), "table: 0x00000010");
    }
}
