//! deformr error types

use numr::dtype::DType;

/// deformr result type
pub type Result<T> = std::result::Result<T, Error>;

/// deformr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Tensor shape disagrees with what the operation derived from its other inputs
    #[error("shape mismatch for '{arg}': expected {expected}, got {got}")]
    ShapeMismatch {
        /// Argument name
        arg: &'static str,
        /// Expected shape (or extent)
        expected: String,
        /// Actual shape (or extent)
        got: String,
    },

    /// Inputs that must share a dtype do not
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Floating-point type the kernels do not implement
    #[error("{op}: unsupported dtype {dtype:?}")]
    UnsupportedDType {
        /// Operation name
        op: &'static str,
        /// Offending dtype
        dtype: DType,
    },

    /// Module configuration rejected at construction time
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },

    /// Missing weight while loading a module
    #[error("weight not found: {name}")]
    WeightNotFound {
        /// Fully-qualified weight name
        name: String,
    },
}
