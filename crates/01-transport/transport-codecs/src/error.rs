use thiserror::Error;

/// Result alias for buffer layout operations.
pub type CodecResult<T, E = CodecError> = Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("payload needs {required} bytes but the buffer holds {available}")]
    CapacityExceeded { required: usize, available: usize },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("plane holds {actual} samples, expected {expected}")]
    PlaneSize { expected: usize, actual: usize },

    #[error("{value} does not fit a 32-bit fixed-point sample")]
    FixedOverflow { value: f64 },

    #[error("word {index} is outside a buffer of {words} words")]
    OutOfBounds { index: usize, words: usize },

    #[error("header field {field} holds {value}, which does not describe this buffer")]
    BadHeader { field: usize, value: i32 },

    #[error("result stream holds {reported} values, expected {expected}")]
    ResultCountMismatch { expected: usize, reported: usize },

    /// Every word of a result region still holds the value it was seeded with.
    #[error("result region at word {offset} was never written")]
    ResultNotWritten { offset: usize },
}
