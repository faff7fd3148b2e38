//! Wire format of the commit protocol.
//!
//! Requests travel from the coordinator to participants:
//!
//! ```text
//! prepare:<txnId>:<file,file,...>:<base64 artifact>
//! decision:<txnId>:<commit|abort>:<file,file,...>
//! ```
//!
//! Replies travel back as `<txnId>:Yes`, `<txnId>:No` or `<txnId>:ACK`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::errors::{CollageError, Result};
use crate::types::{Decision, TxnId};

const PREPARE_TAG: &str = "prepare";
const DECISION_TAG: &str = "decision";

/// Phase-one request asking a participant to vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub txn_id: TxnId,
    pub files: Vec<String>,
    pub image: Vec<u8>,
}

/// Phase-two request carrying the coordinator's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRequest {
    pub txn_id: TxnId,
    pub decision: Decision,
    pub files: Vec<String>,
}

/// A coordinator-to-participant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Prepare(PrepareRequest),
    Decision(DecisionRequest),
}

impl Request {
    pub fn txn_id(&self) -> &TxnId {
        match self {
            Request::Prepare(prepare) => &prepare.txn_id,
            Request::Decision(decision) => &decision.txn_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Prepare(p) => format!(
                "{PREPARE_TAG}:{}:{}:{}",
                p.txn_id,
                p.files.join(","),
                BASE64.encode(&p.image)
            ),
            Request::Decision(d) => format!(
                "{DECISION_TAG}:{}:{}:{}",
                d.txn_id,
                d.decision,
                d.files.join(",")
            ),
        }
        .into_bytes()
    }

    /// Parses a request body.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::MalformedMessage`] for an unknown tag, a wrong
    /// field count, an unknown decision or undecodable artifact bytes.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| CollageError::MalformedMessage(format!("request is not UTF-8: {e}")))?;
        let fields: Vec<&str> = text.splitn(4, ':').collect();
        if fields.len() != 4 {
            return Err(CollageError::MalformedMessage(format!(
                "expected 4 fields, found {}",
                fields.len()
            )));
        }

        let txn_id = TxnId::parse(fields[1])?;
        match fields[0] {
            PREPARE_TAG => {
                let image = BASE64.decode(fields[3]).map_err(|e| {
                    CollageError::MalformedMessage(format!("artifact is not base64: {e}"))
                })?;
                Ok(Request::Prepare(PrepareRequest {
                    txn_id,
                    files: split_files(fields[2])?,
                    image,
                }))
            }
            DECISION_TAG => {
                let decision = match fields[2] {
                    "commit" => Decision::Commit,
                    "abort" => Decision::Abort,
                    other => {
                        return Err(CollageError::MalformedMessage(format!(
                            "unknown decision {other:?}"
                        )));
                    }
                };
                Ok(Request::Decision(DecisionRequest {
                    txn_id,
                    decision,
                    files: split_files(fields[3])?,
                }))
            }
            other => Err(CollageError::MalformedMessage(format!(
                "unknown request tag {other:?}"
            ))),
        }
    }
}

fn split_files(field: &str) -> Result<Vec<String>> {
    let files: Vec<String> = field.split(',').map(str::to_string).collect();
    if files.iter().any(String::is_empty) {
        return Err(CollageError::MalformedMessage(format!(
            "empty file name in {field:?}"
        )));
    }
    Ok(files)
}

/// Body of a participant reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Yes,
    No,
    Ack,
}

impl ReplyKind {
    pub fn from_vote(vote: bool) -> Self {
        if vote { ReplyKind::Yes } else { ReplyKind::No }
    }

    fn as_str(self) -> &'static str {
        match self {
            ReplyKind::Yes => "Yes",
            ReplyKind::No => "No",
            ReplyKind::Ack => "ACK",
        }
    }
}

/// A participant-to-coordinator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub txn_id: TxnId,
    pub kind: ReplyKind,
}

impl Reply {
    pub fn new(txn_id: TxnId, kind: ReplyKind) -> Self {
        Self { txn_id, kind }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}:{}", self.txn_id, self.kind.as_str()).into_bytes()
    }

    /// Parses a reply body.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::MalformedMessage`] unless the body is
    /// `<txnId>:Yes`, `<txnId>:No` or `<txnId>:ACK`.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| CollageError::MalformedMessage(format!("reply is not UTF-8: {e}")))?;
        let (id, kind) = text
            .split_once(':')
            .ok_or_else(|| CollageError::MalformedMessage(format!("reply {text:?} has no id")))?;
        let kind = match kind {
            "Yes" => ReplyKind::Yes,
            "No" => ReplyKind::No,
            "ACK" => ReplyKind::Ack,
            other => {
                return Err(CollageError::MalformedMessage(format!(
                    "unknown reply {other:?}"
                )));
            }
        };
        Ok(Self {
            txn_id: TxnId::parse(id)?,
            kind,
        })
    }
}
