use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::NodeId;

/// Default directory holding one write-ahead log file per transaction.
pub const DEFAULT_LOG_DIR: &str = "./logs";

/// Settings of the coordinator (server) process.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address of the coordinator on the messaging substrate.
    pub node_id: NodeId,
    /// Directory of the per-transaction logs, scanned on startup for recovery.
    pub log_dir: PathBuf,
    /// Directory the published artifacts are written to.
    pub artifact_dir: PathBuf,
    /// Deadline for collecting every vote, measured from the prepare broadcast.
    pub prepare_timeout: Duration,
    /// Interval between two passes of the retry loop.
    pub retry_interval: Duration,
    /// Upper bound on a single blocking receive, so the receiver can observe shutdown.
    pub receive_poll: Duration,
    /// Age of a decision phase after which missing acknowledgments are reported.
    pub stale_decision_warning: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "Server".to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            artifact_dir: PathBuf::from("."),
            prepare_timeout: Duration::from_secs(6),
            retry_interval: Duration::from_secs(2),
            receive_poll: Duration::from_millis(100),
            stale_decision_warning: Duration::from_secs(600),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_artifact_dir(mut self, artifact_dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = artifact_dir.into();
        self
    }

    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_stale_decision_warning(mut self, after: Duration) -> Self {
        self.stale_decision_warning = after;
        self
    }
}

/// Settings of a participant (user node) process.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParticipantConfig {
    /// Address of this participant on the messaging substrate.
    pub node_id: NodeId,
    /// Directory of this node's per-transaction logs.
    pub log_dir: PathBuf,
    /// Directory the file names in prepare and decision messages are relative to.
    pub work_dir: PathBuf,
    /// Upper bound on a single blocking receive in the node loop.
    pub receive_poll: Duration,
}

impl ParticipantConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            work_dir: PathBuf::from("."),
            receive_poll: Duration::from_millis(100),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}
