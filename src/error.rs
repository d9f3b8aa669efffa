use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("partition offsets disagree across ranks at boundary {0}")]
    InconsistentOffsets(usize),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
