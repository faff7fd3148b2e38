//! Boundary to the messaging substrate.
//!
//! The protocol assumes an unreliable transport: a sent message may be
//! delivered zero or more times and arrive arbitrarily late, but it is never
//! corrupted. Retries at the protocol level mask the losses.

pub mod memory;

use std::time::Duration;

use crate::errors::Result;
use crate::types::NodeId;

pub use memory::{Delivery, MemoryEndpoint, MemoryNetwork};

/// An opaque message on the substrate.
///
/// When sending, `addr` is the destination. When receiving, `addr` is the
/// sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub addr: NodeId,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(addr: impl Into<NodeId>, body: Vec<u8>) -> Self {
        Self {
            addr: addr.into(),
            body,
        }
    }
}

/// Trait for an endpoint attached to the messaging substrate.
///
/// Implementations must be `Send` and `Sync`: the coordinator sends from
/// both its receiver and its retry thread.
pub trait Transport: Send + Sync {
    /// Address other nodes use to reach this endpoint.
    fn local_addr(&self) -> &NodeId;

    /// Sends a message without waiting for delivery.
    ///
    /// A message that cannot be routed is not an error; the substrate is
    /// allowed to lose it.
    fn send(&self, msg: Message) -> Result<()>;

    /// Blocks until a message arrives or `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<Message>>;
}
