/*!
 * Error types for fileflow
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::channel::Shape;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Error, Debug)]
pub enum FlowError {
    /// Enumerated or requested path does not exist
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error (bad values, bad wiring, bad patterns)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage received an item shape it does not accept
    #[error("Stage '{stage}' expected {expected} items but received {found}")]
    ShapeMismatch {
        stage: String,
        expected: String,
        found: Shape,
    },

    /// The producer of a channel went away without closing it
    #[error("Channel '{channel}' was dropped by its producer before close")]
    UpstreamAborted { channel: String },

    /// The consumer of a channel went away while items were still being emitted
    #[error("Channel '{channel}' has no consumer left")]
    DownstreamClosed { channel: String },

    /// Text-mode data that is not valid UTF-8
    #[error("Invalid UTF-8 text in {context}")]
    InvalidText { context: String },

    /// Container archive could not be read
    #[error("Archive error: {0}")]
    Archive(String),

    /// Compressed stream could not be decoded
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Stage thread panicked or could not be spawned
    #[error("Stage '{stage}' crashed: {reason}")]
    StageCrashed { stage: String, reason: String },
}

impl FlowError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_FATAL
        } else {
            EXIT_PARTIAL
        }
    }

    /// Check if this error terminates the stage that raised it
    pub fn is_fatal(&self) -> bool {
        !self.is_item_scoped()
    }

    /// Check if this error only affects the item being processed
    ///
    /// Item-scoped errors are logged and the item is dropped; the stage keeps running.
    pub fn is_item_scoped(&self) -> bool {
        matches!(self, FlowError::Archive(_) | FlowError::Decompression(_))
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            FlowError::SourceNotFound(_) => ErrorCategory::Validation,
            FlowError::Io(_) => ErrorCategory::IoError,
            FlowError::Config(_) => ErrorCategory::Configuration,
            FlowError::ShapeMismatch { .. } | FlowError::InvalidText { .. } => {
                ErrorCategory::Contract
            }
            FlowError::UpstreamAborted { .. } | FlowError::DownstreamClosed { .. } => {
                ErrorCategory::Channel
            }
            FlowError::Archive(_) | FlowError::Decompression(_) => ErrorCategory::Codec,
            FlowError::StageCrashed { .. } => ErrorCategory::Concurrency,
        }
    }

    /// Build a shape mismatch error for a stage
    pub fn shape_mismatch(stage: &str, expected: &str, found: Shape) -> Self {
        FlowError::ShapeMismatch {
            stage: stage.to_string(),
            expected: expected.to_string(),
            found,
        }
    }

    /// Map an open/stat failure on `path` to `SourceNotFound` or `Io`
    pub fn from_path_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            FlowError::SourceNotFound(path.into())
        } else {
            FlowError::Io(err)
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Path validation errors
    Validation,
    /// I/O operation errors
    IoError,
    /// Configuration errors
    Configuration,
    /// Channel protocol violations (shape, text encoding)
    Contract,
    /// Channel lifecycle errors
    Channel,
    /// Archive and compression errors
    Codec,
    /// Thread-level failures
    Concurrency,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Contract => write!(f, "contract"),
            ErrorCategory::Channel => write!(f, "channel"),
            ErrorCategory::Codec => write!(f, "codec"),
            ErrorCategory::Concurrency => write!(f, "concurrency"),
        }
    }
}

impl From<zip::result::ZipError> for FlowError {
    fn from(err: zip::result::ZipError) -> Self {
        FlowError::Archive(err.to_string())
    }
}

impl From<regex::Error> for FlowError {
    fn from(err: regex::Error) -> Self {
        FlowError::Config(format!("Invalid pattern: {}", err))
    }
}

impl From<glob::PatternError> for FlowError {
    fn from(err: glob::PatternError) -> Self {
        FlowError::Config(format!("Invalid glob pattern: {}", err))
    }
}

impl From<toml::de::Error> for FlowError {
    fn from(err: toml::de::Error) -> Self {
        FlowError::Config(format!("Invalid pipeline file: {}", err))
    }
}
