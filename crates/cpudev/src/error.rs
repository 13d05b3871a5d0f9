use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the driver core.
///
/// Only [`DriverError::OutOfMemory`] is recoverable. Every other variant is either a caller
/// programming error or a code generator / ABI mismatch; the driver never continues past one of
/// those for the failing command, and the caller decides the termination policy.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("out of memory allocating {size} bytes (alignment {align})")]
    OutOfMemory { size: usize, align: usize },
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("unsupported fill pattern size {0} (expected 1, 2, 4, 8, 16, 32, 64 or 128)")]
    UnsupportedPatternSize(usize),
    #[error("code generation for kernel `{kernel}` in {build_dir:?} failed: {message}")]
    CodeGen {
        build_dir: PathBuf,
        kernel: String,
        message: String,
    },
    #[error(
        "failed to load kernel module {path:?}: {diagnostic} \
         (missing symbols in the module may be reported as 'file not found')"
    )]
    ModuleLoad { path: PathBuf, diagnostic: String },
    #[error("kernel module {path:?} does not export `{symbol}`: {diagnostic}")]
    MissingSymbol {
        path: PathBuf,
        symbol: String,
        diagnostic: String,
    },
    #[error("kernel `{kernel}` has no resolved entry point; prepare the command before running it")]
    MissingEntryPoint { kernel: String },
}

impl DriverError {
    /// Whether the failing command must be abandoned (and the driver considered unusable for it).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DriverError::OutOfMemory { .. })
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}
