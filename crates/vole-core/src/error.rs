/// All errors that can occur within the vole engine.
///
/// This enum captures every failure mode the engine distinguishes: device
/// allocation, shape preconditions, kernel launches, host/device transfers,
/// and numeric breakdowns (a zero softmax denominator, division by a zero
/// constant). Using a single error type across the workspace simplifies
/// error propagation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device (or pool) buffer allocation failed.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// An operation's shape precondition was violated.
    #[error("{op}: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        op: &'static str,
        expected: String,
        got: String,
    },

    /// A kernel launch (or library call standing in for one) was rejected
    /// by the runtime.
    #[error("launch failure in `{kernel}`: {detail}")]
    LaunchFailure {
        kernel: &'static str,
        detail: String,
    },

    /// A host↔device copy failed.
    #[error("transfer failure: {0}")]
    TransferFailure(String),

    /// The computation produced (or would produce) values the algorithm
    /// cannot proceed from, e.g. a non-finite maximum or a zero row sum.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for a [`Error::DimensionMismatch`] with formatted shapes.
    pub fn dims(op: &'static str, expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::DimensionMismatch {
            op,
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Convenience Result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
