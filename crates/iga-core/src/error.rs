use thiserror::Error;

/// Recoverable error conditions of the kernel.
///
/// Contract violations (wrong direction index, dimension mismatch between
/// operands, negative degree elevation) are programmer errors and panic
/// instead; see the error-handling notes in DESIGN.md.
#[derive(Debug, Error)]
pub enum IgaError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Inconsistent knot vectors: {0}")]
    Inconsistent(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, IgaError>;
