use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::table::TransactionTable;
use crate::coordinator::LoopCommand;
use crate::message::Reply;
use crate::network::{Message, Transport};
use crate::types::Phase;

/// Inbound dispatcher of the coordinator.
///
/// Routes every participant reply to the transaction it names and handles
/// it under that transaction's lock.
pub struct MsgReceiver {
    transport: Arc<dyn Transport>,
    table: Arc<TransactionTable>,
    poll: Duration,
}

impl MsgReceiver {
    pub fn new(transport: Arc<dyn Transport>, table: Arc<TransactionTable>, poll: Duration) -> Self {
        Self {
            transport,
            table,
            poll,
        }
    }

    pub fn dispatch(&self, msg: &Message) {
        let reply = match Reply::decode(&msg.body) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Dropping reply from {}: {}", msg.addr, e);
                return;
            }
        };
        let Some(shared) = self.table.get(&reply.txn_id) else {
            debug!(
                "Dropping reply from {} for unknown transaction {}",
                msg.addr, reply.txn_id
            );
            return;
        };

        let mut txn = shared.lock();
        if let Err(e) = txn.handle_response(&msg.addr, &reply) {
            error!(
                "Transaction {} failed to handle reply from {}: {}",
                reply.txn_id, msg.addr, e
            );
        }
        if txn.phase() == Phase::Done {
            drop(txn);
            self.table.remove(&reply.txn_id);
        }
    }

    /// Receives and dispatches until told to stop or the transport fails.
    pub fn run(self, commands: Receiver<LoopCommand>) {
        loop {
            match commands.try_recv() {
                Ok(LoopCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    debug!("Receive loop shutting down");
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.transport.receive(self.poll) {
                Ok(Some(msg)) => self.dispatch(&msg),
                Ok(None) => {}
                Err(e) => {
                    error!("Receive loop stopped: {}", e);
                    break;
                }
            }
        }
    }
}
