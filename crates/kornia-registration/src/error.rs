use thiserror::Error;

/// Error types for the registration pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    /// Too few correspondences, descriptors or points to run a stage.
    #[error("Not enough data: required at least {required}, got {actual}")]
    InsufficientData {
        /// Minimum count required by the stage.
        required: usize,
        /// Count actually available.
        actual: usize,
    },

    /// The normal equation is singular or ill-conditioned.
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// The iteration budget was exhausted before the convergence criteria were met.
    #[error("No convergence after {iterations} iterations")]
    NoConvergence {
        /// Number of iterations performed.
        iterations: usize,
    },

    /// Empty clouds, missing attributes or otherwise malformed input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Two buffers that must be parallel have different lengths.
    #[error("Mismatched lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedLengths {
        /// Label for the left-hand buffer.
        left_name: &'static str,
        /// Length of the left-hand buffer.
        left_len: usize,
        /// Label for the right-hand buffer.
        right_name: &'static str,
        /// Length of the right-hand buffer.
        right_len: usize,
    },
}
