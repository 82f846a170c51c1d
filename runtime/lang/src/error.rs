//! Error types for the kscript language.

use thiserror::Error;

/// Errors raised while compiling or running kscript code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Source text could not be compiled; the message carries `chunk:line:`.
    #[error("{0}")]
    Syntax(String),

    /// An error raised while running code, either by the VM or by `error()`.
    ///
    /// `traceback` is empty until the error has been located in a script frame;
    /// after that it lists the active frames, innermost first.
    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Vec<String>,
    },

    /// The allocator refused a request
    #[error("not enough memory")]
    OutOfMemory,
}

impl Error {
    /// Builds an unlocated runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Returns the traceback recorded for a runtime error, if any.
    pub fn traceback(&self) -> &[String] {
        match self {
            Error::Runtime { traceback, .. } => traceback,
            _ => &[],
        }
    }

    pub(crate) fn is_located(&self) -> bool {
        !matches!(self, Error::Runtime { traceback, .. } if traceback.is_empty())
    }
}

/// Result type for language operations
pub type Result<T> = core::result::Result<T, Error>;
