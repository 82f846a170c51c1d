//! Error types for objects, tables and runtimes.

use thiserror::Error;

/// Errors reported by kscript operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// A sleeping allocation or lock was requested from atomic context
    #[error("sleeping operation attempted from atomic context")]
    WouldSleep,

    #[error("bad object ({expected} expected, got {found})")]
    WrongClass {
        expected: &'static str,
        found: &'static str,
    },

    #[error("key too long ({len} bytes, at most {max} allowed)")]
    KeyTooLong { len: usize, max: usize },

    /// A sleep-capable class was used from a non-sleep runtime
    #[error("cannot use sleepable {class} from a non-sleep runtime")]
    ContextMismatch { class: &'static str },

    #[error("{class} is already locked by this thread")]
    Recursion { class: &'static str },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("{name} not found")]
    NotFound { name: String },

    /// Only nil, booleans, integers, strings and objects cross runtimes
    #[error("cannot transfer a {type_name} value between runtimes")]
    Transfer { type_name: &'static str },

    /// The object's private payload has been released
    #[error("{class} is closed")]
    Closed { class: &'static str },

    #[error(transparent)]
    Script(#[from] kscript_lang::Error),

    /// An error raised inside a monitored operation
    #[error("{op}: {source}")]
    Operation {
        op: &'static str,
        source: Box<Error>,
    },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An allocation was refused
    ResourceExhaustion,
    /// The caller passed something unusable; nothing was mutated
    Argument,
    /// The object has already been closed
    StaleHandle,
    /// A script raised an error
    Script,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory { .. } | Error::WouldSleep => ErrorKind::ResourceExhaustion,
            Error::WrongClass { .. }
            | Error::KeyTooLong { .. }
            | Error::ContextMismatch { .. }
            | Error::Recursion { .. }
            | Error::InvalidState { .. }
            | Error::NotFound { .. }
            | Error::Transfer { .. } => ErrorKind::Argument,
            Error::Closed { .. } => ErrorKind::StaleHandle,
            Error::Script(kscript_lang::Error::OutOfMemory) => ErrorKind::ResourceExhaustion,
            Error::Script(_) => ErrorKind::Script,
            Error::Operation { source, .. } => source.kind(),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Error::InvalidState {
            reason: reason.into(),
        }
    }
}

/// Converts an error for delivery to a script.
///
/// Memory exhaustion stays recognisable as such inside the interpreter;
/// every other error becomes a runtime error carrying its message.
impl From<Error> for kscript_lang::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Script(inner) => inner,
            e if e.kind() == ErrorKind::ResourceExhaustion => kscript_lang::Error::OutOfMemory,
            e => kscript_lang::Error::runtime(e.to_string()),
        }
    }
}

/// Result type for kscript operations
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_keeps_source_kind() {
        let e = Error::Operation {
            op: "resume",
            source: Box::new(Error::Closed { class: "runtime" }),
        };
        assert_eq!(e.kind(), ErrorKind::StaleHandle);
        assert_eq!(e.to_string(), "resume: runtime is closed");
    }

    #[test]
    fn test_script_conversion() {
        let oom: kscript_lang::Error = Error::OutOfMemory { requested: 8 }.into();
        assert_eq!(oom, kscript_lang::Error::OutOfMemory);

        let e: kscript_lang::Error = Error::KeyTooLong { len: 300, max: 255 }.into();
        assert_eq!(e.to_string(), "key too long (300 bytes, at most 255 allowed)");

        let inner = kscript_lang::Error::runtime("x:1: boom");
        let e: kscript_lang::Error = Error::Script(inner.clone()).into();
        assert_eq!(e, inner);
    }

    #[test]
    fn test_kind() {
        assert_eq!(Error::WouldSleep.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(
            Error::ContextMismatch { class: "rcu" }.kind(),
            ErrorKind::Argument
        );
        assert_eq!(
            Error::Script(kscript_lang::Error::OutOfMemory).kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            Error::Script(kscript_lang::Error::runtime("boom")).kind(),
            ErrorKind::Script
        );
    }
}
