use std::path::PathBuf;

use thiserror::Error;

use crate::types::Phase;

#[derive(Error, Debug)]
pub enum CollageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log encoding error: {0}")]
    LogEncoding(#[from] bincode::Error),

    #[error("Corrupt log {path}: {reason}")]
    CorruptLog { path: PathBuf, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid source specification: {0}")]
    InvalidSource(String),

    #[error("Invalid transaction id: {0:?}")]
    InvalidTransactionId(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Lock error on {file}: {reason}")]
    Lock { file: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CollageError>;
