use serde::{Deserialize, Serialize};

use crate::types::{Decision, Phase, TxnId};

/// Immutable parameters of a coordinator transaction.
///
/// Written as the first record of the coordinator's log so the transaction
/// can be rebuilt after a restart without any other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionParams {
    /// Name of the artifact to publish, relative to the artifact directory.
    pub file_name: String,
    /// Content of the artifact.
    pub image: Vec<u8>,
    /// Source specifications as `<participantId>:<fileName>`.
    pub sources: Vec<String>,
}

/// One entry of a write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Coordinator only, always first.
    Params(TransactionParams),
    /// Coordinator phase marker. The last one in a log is authoritative.
    Phase { txn_id: TxnId, phase: Phase },
    /// Participant vote, logged before it is sent.
    Vote {
        txn_id: TxnId,
        vote: bool,
        files: Vec<String>,
    },
    /// Participant acknowledgment of a decision, logged before it is sent.
    Ack { txn_id: TxnId, decision: Decision },
}
