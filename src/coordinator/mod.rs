//! The coordinator (server) side of the commit protocol.
//!
//! [`Coordinator::start`] recovers the transactions left in the log
//! directory, then runs two threads over a shared [`TransactionTable`]: the
//! [`MsgReceiver`] feeding participant replies into their transactions and
//! the [`MsgSender`] re-driving transactions that are still waiting.

pub mod receiver;
pub mod recovery;
pub mod sender;
pub mod table;
pub mod transaction;

use crossbeam_channel::{bounded, Sender};
use log::{error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::CoordinatorConfig;
use crate::errors::{CollageError, Result};
use crate::network::Transport;
use crate::source_map::{is_plain_file_name, SourceMap};
use crate::types::{Phase, TxnId};

pub use receiver::MsgReceiver;
pub use recovery::RecoveryManager;
pub use sender::MsgSender;
pub use table::{SharedTransaction, TransactionTable};
pub use transaction::Transaction;

/// Commands sent to the background loops.
pub enum LoopCommand {
    /// Stop the loop.
    Shutdown,
}

/// A running coordinator.
///
/// The background loops stop on [`Coordinator::shutdown`] or when the
/// coordinator is dropped. Everything needed to finish the in-flight
/// transactions is in the log directory, so a new coordinator started on the
/// same directory picks up where this one stopped.
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    transport: Arc<dyn Transport>,
    table: Arc<TransactionTable>,
    loop_senders: Vec<Sender<LoopCommand>>,
    loop_handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Recovers the logged transactions and starts the background loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be read or a loop
    /// thread cannot be spawned.
    pub fn start(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let config = Arc::new(config);
        let table = Arc::new(TransactionTable::new());

        let recovery = RecoveryManager::new(config.clone(), transport.clone());
        for txn in recovery.transactions_to_recover()? {
            let shared = table.insert(txn);
            let mut txn = shared.lock();
            if let Err(e) = recovery.recover(&mut txn) {
                error!("Failed to recover transaction {}: {}", txn.id(), e);
            }
        }

        let mut coordinator = Self {
            config: config.clone(),
            transport: transport.clone(),
            table: table.clone(),
            loop_senders: Vec::with_capacity(2),
            loop_handles: Vec::with_capacity(2),
        };

        let receiver = MsgReceiver::new(transport, table.clone(), config.receive_poll);
        coordinator.spawn_loop("collage-receiver", move |commands| receiver.run(commands))?;
        let sender = MsgSender::new(table, config.retry_interval);
        coordinator.spawn_loop("collage-sender", move |commands| sender.run(commands))?;

        info!(
            "Coordinator {} started with {} live transaction(s)",
            config.node_id,
            coordinator.table.len()
        );
        Ok(coordinator)
    }

    fn spawn_loop<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(crossbeam_channel::Receiver<LoopCommand>) + Send + 'static,
    {
        let (command_sender, command_receiver) = bounded::<LoopCommand>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(command_receiver))?;
        self.loop_senders.push(command_sender);
        self.loop_handles.push(handle);
        Ok(())
    }

    /// Starts a commit of `image` as `file_name`, sourced from the given
    /// `<participantId>:<fileName>` specifications.
    ///
    /// Returns as soon as the prepare requests are sent; the outcome is
    /// observable through [`Coordinator::phase_of`] and the artifact
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::InvalidSource`] for an invalid artifact name or
    /// source list, and an I/O error if the transaction cannot be logged.
    pub fn start_commit<S: AsRef<str>>(
        &self,
        file_name: &str,
        image: Vec<u8>,
        sources: &[S],
    ) -> Result<TxnId> {
        if !is_plain_file_name(file_name) {
            return Err(CollageError::InvalidSource(format!(
                "artifact name {file_name:?} is not a plain file name"
            )));
        }
        let sources = SourceMap::parse(sources)?;

        let id = TxnId::generate();
        let txn = Transaction::create(
            id.clone(),
            file_name.to_string(),
            image,
            sources,
            self.transport.clone(),
            self.config.clone(),
        )?;
        // Published already locked: the retry loop must not see it before
        // the prepare marker is durable.
        let shared: SharedTransaction = Arc::new(Mutex::new(txn));
        let mut txn = shared.lock();
        self.table.publish(id.clone(), shared.clone());
        if let Err(e) = txn.ask_for_vote() {
            // Nothing was sent, so the transaction can vanish without a trace.
            txn.discard();
            drop(txn);
            self.table.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Phase of a live transaction. Finished and unknown transactions are `None`.
    pub fn phase_of(&self, id: &TxnId) -> Option<Phase> {
        self.table.get(id).map(|txn| txn.lock().phase())
    }

    pub fn is_active(&self, id: &TxnId) -> bool {
        self.table.get(id).is_some()
    }

    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.table.ids()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Stops the background loops and waits for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for sender in self.loop_senders.drain(..) {
            // A loop that already exited has dropped its receiver.
            let _ = sender.send(LoopCommand::Shutdown);
        }
        for handle in self.loop_handles.drain(..) {
            if handle.join().is_err() {
                error!("A coordinator loop panicked");
            }
        }
        info!("Coordinator {} stopped", self.config.node_id);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.loop_handles.is_empty() {
            self.stop();
        }
    }
}
