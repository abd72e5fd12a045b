use thiserror::Error;

/// Errors raised by the replicated text and the local buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("unexpected delta in text change: {0}")]
    UnexpectedDelta(String),

    #[error("offset {offset} out of range for buffer of length {len}")]
    OffsetOutOfRange { offset: usize, len: usize },

    #[error("offset {0} is not on a character boundary")]
    NotCharBoundary(usize),

    #[error("overlapping edits at offset {0}")]
    OverlappingEdits(usize),

    #[error("failed to decode update: {0}")]
    Decode(String),

    #[error("failed to apply update: {0}")]
    Apply(String),

    #[error("transaction unavailable: {0}")]
    Transaction(String),

    #[error("failed to observe document: {0}")]
    Observe(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
