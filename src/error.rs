use crate::Label;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("dimension mismatch: expected {expected}, got {actual}")]
  DimensionMismatch { expected: usize, actual: usize },

  #[error("index is full (max_elements={max_elements})")]
  IndexFull { max_elements: usize },

  #[error("index is empty")]
  EmptyIndex,

  #[error("label {0} not found")]
  LabelNotFound(Label),

  #[error("label {0} is already deleted")]
  AlreadyDeleted(Label),

  #[error("label {0} is not deleted")]
  NotDeleted(Label),

  #[error("invalid snapshot: {0}")]
  InvalidSnapshot(String),

  #[error("invariant violation: {0}")]
  InvariantViolation(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
