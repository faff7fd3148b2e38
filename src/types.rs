use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{CollageError, Result};

/// Identifier of a node (the coordinator or a participant) on the messaging substrate.
pub type NodeId = String;

/// Globally unique identifier of a commit attempt.
///
/// The id doubles as the stem of the transaction's log file name, so it is
/// restricted to characters that are safe both on the wire (no `:` or `,`)
/// and in a file name (no path separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(String);

impl TxnId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Validates and wraps an id read from the wire or from a log file name.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::InvalidTransactionId`] if the id is empty or
    /// contains a character reserved by the wire format or the file system.
    pub fn parse(raw: &str) -> Result<Self> {
        let reserved = |c: char| matches!(c, ':' | ',' | '/' | '\\' | '.') || c.is_whitespace();
        if raw.is_empty() || raw.chars().any(reserved) {
            return Err(CollageError::InvalidTransactionId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinator-side phase of a transaction.
///
/// Phases only move forward: `Prepare` to either `Commit` or `Abort`, and from
/// there to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Prepare,
    Commit,
    Abort,
    Done,
}

impl Phase {
    /// Returns the decision carried by a decision phase.
    pub fn decision(self) -> Option<Decision> {
        match self {
            Phase::Commit => Some(Decision::Commit),
            Phase::Abort => Some(Decision::Abort),
            Phase::Prepare | Phase::Done => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prepare => write!(f, "prepare"),
            Phase::Commit => write!(f, "commit"),
            Phase::Abort => write!(f, "abort"),
            Phase::Done => write!(f, "done"),
        }
    }
}

/// Outcome of the vote collection, broadcast to every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    pub fn phase(self) -> Phase {
        match self {
            Decision::Commit => Phase::Commit,
            Decision::Abort => Phase::Abort,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Commit => "commit",
            Decision::Abort => "abort",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
