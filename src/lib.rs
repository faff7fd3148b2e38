pub mod config;
pub mod coordinator;
pub mod errors;
pub mod message;
pub mod network;
pub mod participant;
pub mod source_map;
pub mod types;
pub mod wal;

// Re-export key types and structs for easier access
pub use config::{CoordinatorConfig, ParticipantConfig};
pub use coordinator::Coordinator;
pub use errors::{CollageError, Result};
pub use network::{Message, Transport};
pub use participant::{Participant, ParticipantNode, UserConfirm};
pub use source_map::SourceMap;
pub use types::{Decision, NodeId, Phase, TxnId};

/// Everything needed to run a coordinator or a participant.
pub mod prelude {
    pub use crate::config::{CoordinatorConfig, ParticipantConfig};
    pub use crate::coordinator::Coordinator;
    pub use crate::errors::{CollageError, Result};
    pub use crate::network::{Delivery, MemoryEndpoint, MemoryNetwork, Message, Transport};
    pub use crate::participant::{Participant, ParticipantNode, UserConfirm};
    pub use crate::types::{Decision, NodeId, Phase, TxnId};
}
