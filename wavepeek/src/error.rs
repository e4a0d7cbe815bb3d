use std::path::PathBuf;

use thiserror::Error;

use crate::trace::TraceKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("invalid trace file: {0}")]
    Format(String),
    #[error("no {0} file loaded, load one first")]
    NotLoaded(TraceKind),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Overflow(String),
    #[error("io error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
