//! Error types for rowflow.
//!
//! Every failure mode carries a stable `E###` code and enough context
//! (paths, indices, class names) to act on without a debugger. The CLI maps
//! error classes onto process exit codes via [`FlowError::exit_code`].

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for rowflow operations.
#[derive(Error, Debug)]
pub enum FlowError {
    // =========================================================================
    // Configuration & discovery errors (E100-E199)
    // =========================================================================
    /// Configuration document failed to parse.
    #[error("E101: Failed to parse config at {path}: {cause}")]
    ConfigParse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Reason for the parse failure.
        cause: String,
    },

    /// A configuration value is missing or invalid.
    #[error("E102: Invalid configuration '{field}': {cause}")]
    ConfigValue {
        /// The configuration field at fault.
        field: String,
        /// Description of why the value is invalid.
        cause: String,
    },

    /// No registered factory matches the requested class name.
    #[error("E103: No matching class '{classname}' found in any search tier")]
    UnknownClass {
        /// The class name that could not be resolved.
        classname: String,
    },

    /// An `!include` directive cycles back on itself.
    #[error("E104: Configuration inclusion loop through {path}")]
    IncludeLoop {
        /// The file that was included a second time.
        path: PathBuf,
    },

    // =========================================================================
    // Dereferencing engine errors (E200-E299)
    // =========================================================================
    /// A selector is outside the source-side population.
    #[error("E201: Selector {index} out of range for source of {len} rows")]
    InvalidSelection {
        /// The offending selector value.
        index: i64,
        /// The source-side population size.
        len: u64,
    },

    /// Two arrays that must be aligned have different lengths.
    #[error("E202: Shape mismatch for {what}: expected {expected} rows, got {actual}")]
    ShapeMismatch {
        /// What was being aligned (e.g. "region index").
        what: String,
        /// Expected row count.
        expected: u64,
        /// Actual row count.
        actual: u64,
    },

    /// A dataset's row type is not what the operation requires.
    #[error("E203: Type mismatch at '{path}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// Dataset path.
        path: String,
        /// The required row type.
        expected: String,
        /// The row type found on disk.
        actual: String,
    },

    // =========================================================================
    // Storage errors (E300-E399)
    // =========================================================================
    /// Re-creation of an existing dataset with a conflicting row type.
    #[error("E301: Dataset '{path}' already exists with row type {actual}, not {requested}")]
    AlreadyExistsWithDifferentType {
        /// Dataset path.
        path: String,
        /// The row type requested by the caller.
        requested: String,
        /// The row type already on disk.
        actual: String,
    },

    /// The container file could not be grown.
    #[error("E302: Out of space extending {path} by {requested} bytes")]
    OutOfSpace {
        /// Path of the container file.
        path: PathBuf,
        /// Number of bytes that could not be allocated.
        requested: u64,
    },

    /// File I/O error.
    #[error("E303: I/O error at {path}: {cause}")]
    Io {
        /// The path where the I/O error occurred.
        path: PathBuf,
        /// Description of the I/O error.
        cause: String,
    },

    /// A dataset or group path does not exist.
    #[error("E304: No such dataset or group: '{path}'")]
    NotFound {
        /// The missing path.
        path: String,
    },

    /// Container file corruption detected.
    #[error("E305: Corrupt container file {path}: {cause}")]
    Corrupt {
        /// Path of the container file.
        path: PathBuf,
        /// Description of the corruption.
        cause: String,
    },

    // =========================================================================
    // Workflow runtime errors (E400-E499)
    // =========================================================================
    /// A user stage failed; the cause is propagated unchanged.
    #[error("E401: Stage '{stage}' failed: {cause}")]
    Stage {
        /// The configured stage name.
        stage: String,
        /// The stage's own error message.
        cause: String,
    },

    /// Collective alignment was violated around loop termination.
    #[error("E402: Termination protocol violated on rank {rank}: {cause}")]
    Termination {
        /// The rank that observed the violation.
        rank: usize,
        /// Description of the violation.
        cause: String,
    },

    /// The parallel substrate failed a collective.
    #[error("E403: Substrate error: {cause}")]
    Comm {
        /// Description of the substrate failure.
        cause: String,
    },
}

impl FlowError {
    /// Get the error code (e.g. "E101").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigParse { .. } => "E101",
            Self::ConfigValue { .. } => "E102",
            Self::UnknownClass { .. } => "E103",
            Self::IncludeLoop { .. } => "E104",
            Self::InvalidSelection { .. } => "E201",
            Self::ShapeMismatch { .. } => "E202",
            Self::TypeMismatch { .. } => "E203",
            Self::AlreadyExistsWithDifferentType { .. } => "E301",
            Self::OutOfSpace { .. } => "E302",
            Self::Io { .. } => "E303",
            Self::NotFound { .. } => "E304",
            Self::Corrupt { .. } => "E305",
            Self::Stage { .. } => "E401",
            Self::Termination { .. } => "E402",
            Self::Comm { .. } => "E403",
        }
    }

    /// Check if this error is a configuration or discovery error.
    ///
    /// Configuration errors are raised before any file write and map to
    /// exit code 1.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse { .. }
                | Self::ConfigValue { .. }
                | Self::UnknownClass { .. }
                | Self::IncludeLoop { .. }
        )
    }

    /// Check if this error originates in the storage layer.
    #[must_use]
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExistsWithDifferentType { .. }
                | Self::OutOfSpace { .. }
                | Self::Io { .. }
                | Self::NotFound { .. }
                | Self::Corrupt { .. }
        )
    }

    /// Process exit code for this error class.
    ///
    /// 1 = configuration or discovery, 2 = I/O, 3 = workflow runtime.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_config_error() {
            1
        } else if self.is_storage_error() {
            2
        } else {
            3
        }
    }

    /// Wrap an I/O error with its path.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            Self::OutOfSpace {
                path: path.into(),
                requested: 0,
            }
        } else {
            Self::Io {
                path: path.into(),
                cause: err.to_string(),
            }
        }
    }
}

/// Result type alias using [`FlowError`].
pub type Result<T> = std::result::Result<T, FlowError>;
