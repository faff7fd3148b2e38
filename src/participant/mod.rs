//! The participant (user node) side of the commit protocol.
//!
//! A participant holds source files. It votes on prepares by locking the
//! named files and asking its user, and applies the coordinator's decision.
//! Every answer is written to the transaction's log before it is sent, and a
//! repeated request is answered from that log, so retransmissions never
//! re-ask the user or delete anything twice.

pub mod lock_table;

use ahash::AHashMap as HashMap;
use crossbeam_channel::{bounded, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::ParticipantConfig;
use crate::errors::Result;
use crate::message::{DecisionRequest, PrepareRequest, Reply, ReplyKind, Request};
use crate::network::{Message, Transport};
use crate::source_map::is_plain_file_name;
use crate::types::{Decision, NodeId, TxnId};
use crate::wal::{self, LogRecord, Wal};

pub use lock_table::{LockSet, LockTable};

/// The external decision authority of a participant.
///
/// Called while the files are locked, with the artifact preview and the
/// local files it would consume. Blocking is allowed.
pub trait UserConfirm: Send + Sync {
    fn confirm(&self, image: &[u8], files: &[String]) -> bool;
}

impl<F> UserConfirm for F
where
    F: Fn(&[u8], &[String]) -> bool + Send + Sync,
{
    fn confirm(&self, image: &[u8], files: &[String]) -> bool {
        self(image, files)
    }
}

/// Request handling of one participant node.
///
/// Handlers for different transactions may run concurrently; requests for
/// the same transaction are serialized on its log.
pub struct Participant {
    config: ParticipantConfig,
    transport: Arc<dyn Transport>,
    confirm: Box<dyn UserConfirm>,
    locks: LockTable,
    logs: Mutex<HashMap<TxnId, Arc<Mutex<Wal>>>>,
}

impl Participant {
    pub fn new(
        config: ParticipantConfig,
        transport: Arc<dyn Transport>,
        confirm: impl UserConfirm + 'static,
    ) -> Self {
        let locks = LockTable::new(config.work_dir.clone());
        Self {
            config,
            transport,
            confirm: Box::new(confirm),
            locks,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &ParticipantConfig {
        &self.config
    }

    /// The file lock table, mainly for inspection.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Handles one inbound request and answers its sender.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed request or when the answer cannot be
    /// made durable; nothing is sent in either case.
    pub fn deliver_message(&self, msg: &Message) -> Result<()> {
        match Request::decode(&msg.body)? {
            Request::Prepare(prepare) => self.handle_prepare(&msg.addr, &prepare),
            Request::Decision(decision) => self.handle_decision(&msg.addr, &decision),
        }
    }

    /// Votes on a prepare, or repeats the vote already logged for it.
    pub fn handle_prepare(&self, from: &str, request: &PrepareRequest) -> Result<()> {
        let txn_id = &request.txn_id;
        let log = self.log_for(txn_id)?;
        let mut wal = log.lock();

        if let Some((vote, _)) = wal.recorded_vote() {
            debug!("Repeating logged vote on transaction {}", txn_id);
            return self.reply(from, txn_id, ReplyKind::from_vote(vote));
        }
        if let Some(decision) = wal.recorded_ack() {
            debug!(
                "Refusing prepare of transaction {}: already acknowledged {}",
                txn_id, decision
            );
            return self.reply(from, txn_id, ReplyKind::No);
        }

        let vote = self.vote(txn_id, request);
        if let Err(e) = wal.append_durable(LogRecord::Vote {
            txn_id: txn_id.clone(),
            vote,
            files: request.files.clone(),
        }) {
            error!("Could not log vote on transaction {}: {}", txn_id, e);
            self.locks.lock().release(txn_id, &request.files);
            return Err(e);
        }
        info!(
            "Voted {} on transaction {}",
            if vote { "Yes" } else { "No" },
            txn_id
        );
        self.reply(from, txn_id, ReplyKind::from_vote(vote))
    }

    fn vote(&self, txn_id: &TxnId, request: &PrepareRequest) -> bool {
        if let Some(file) = request.files.iter().find(|f| !is_plain_file_name(f)) {
            warn!("Transaction {} names {:?} outside the work directory", txn_id, file);
            return false;
        }
        let mut locks = self.locks.lock();
        if !locks.all_present(&request.files) {
            info!("Transaction {} names missing files {:?}", txn_id, request.files);
            return false;
        }
        if !locks.is_free_for(txn_id, &request.files) {
            info!(
                "Files {:?} of transaction {} are locked by another transaction",
                request.files, txn_id
            );
            return false;
        }
        if let Err(e) = locks.acquire(txn_id, &request.files) {
            info!("Could not lock files of transaction {}: {}", txn_id, e);
            return false;
        }

        let approved = self.confirm.confirm(&request.image, &request.files);
        if !approved {
            locks.release(txn_id, &request.files);
        }
        approved
    }

    /// Applies a decision, or repeats the acknowledgment already logged for it.
    pub fn handle_decision(&self, from: &str, request: &DecisionRequest) -> Result<()> {
        let txn_id = &request.txn_id;
        let log = self.log_for(txn_id)?;
        let mut wal = log.lock();

        if let Some(acked) = wal.recorded_ack() {
            if acked != request.decision {
                warn!(
                    "Transaction {} was acknowledged as {} but is now {}",
                    txn_id, acked, request.decision
                );
            }
            debug!("Repeating logged acknowledgment of transaction {}", txn_id);
            return self.reply(from, txn_id, ReplyKind::Ack);
        }

        match request.decision {
            Decision::Commit => {
                if !matches!(wal.recorded_vote(), Some((true, _))) {
                    error!(
                        "Ignoring commit of transaction {}: this node never voted Yes",
                        txn_id
                    );
                    return Ok(());
                }
                self.delete_sources(txn_id, &request.files)?;
            }
            Decision::Abort => {
                self.locks.lock().release(txn_id, &request.files);
            }
        }

        wal.append_durable(LogRecord::Ack {
            txn_id: txn_id.clone(),
            decision: request.decision,
        })?;
        drop(wal);
        self.logs.lock().remove(txn_id);
        info!("Acknowledged {} of transaction {}", request.decision, txn_id);
        self.reply(from, txn_id, ReplyKind::Ack)
    }

    /// Deletes committed source files and releases their locks.
    ///
    /// Runs inside the lock table's critical section so no other prepare
    /// can lock a file between its deletion and the release.
    fn delete_sources(&self, txn_id: &TxnId, files: &[String]) -> Result<()> {
        let mut locks = self.locks.lock();
        let mut parents = BTreeSet::new();
        for file in files {
            let path = locks.path_of(file)?;
            match fs::remove_file(&path) {
                Ok(()) => debug!("Deleted {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("{} was already deleted", path.display())
                }
                Err(e) => return Err(e.into()),
            }
            if let Some(parent) = path.parent() {
                parents.insert(parent.to_path_buf());
            }
        }
        for parent in parents {
            wal::sync_dir(&parent)?;
        }
        locks.release(txn_id, files);
        Ok(())
    }

    /// Re-locks the files of transactions that voted Yes and were not
    /// decided before the last shutdown. Returns how many transactions were
    /// re-locked.
    pub fn recover_locks(&self) -> Result<usize> {
        let mut relocked = 0;
        for txn_id in wal::list_transactions(&self.config.log_dir)? {
            let wal = match Wal::open(&self.config.log_dir, &txn_id) {
                Ok(wal) => wal,
                Err(e) => {
                    error!("Skipping log of transaction {}: {}", txn_id, e);
                    continue;
                }
            };
            let Some((true, files)) = wal.recorded_vote() else {
                continue;
            };
            if wal.recorded_ack().is_some() {
                continue;
            }
            match self.locks.lock().acquire(&txn_id, files) {
                Ok(()) => relocked += 1,
                Err(e) => warn!("Could not re-lock files of transaction {}: {}", txn_id, e),
            }
        }
        if relocked > 0 {
            info!("Re-locked files of {} undecided transaction(s)", relocked);
        }
        Ok(relocked)
    }

    fn log_for(&self, txn_id: &TxnId) -> Result<Arc<Mutex<Wal>>> {
        let mut logs = self.logs.lock();
        if let Some(log) = logs.get(txn_id) {
            return Ok(log.clone());
        }
        let log = Arc::new(Mutex::new(Wal::open(&self.config.log_dir, txn_id)?));
        logs.insert(txn_id.clone(), log.clone());
        Ok(log)
    }

    fn reply(&self, to: &str, txn_id: &TxnId, kind: ReplyKind) -> Result<()> {
        let reply = Reply::new(txn_id.clone(), kind);
        self.transport.send(Message::new(to, reply.encode()))
    }
}

/// Commands sent to the node loop.
enum NodeCommand {
    Shutdown,
}

/// A participant serving its transport on a background thread.
pub struct ParticipantNode {
    participant: Arc<Participant>,
    command_sender: Sender<NodeCommand>,
    handle: Option<JoinHandle<()>>,
}

impl ParticipantNode {
    /// Re-locks undecided files, then starts serving requests.
    pub fn spawn(participant: Arc<Participant>) -> Result<Self> {
        participant.recover_locks()?;

        let (command_sender, commands) = bounded::<NodeCommand>(1);
        let serving = participant.clone();
        let handle = thread::Builder::new()
            .name(format!("collage-node-{}", participant.node_id()))
            .spawn(move || serve(&serving, commands))?;
        info!("Participant {} started", participant.node_id());

        Ok(Self {
            participant,
            command_sender,
            handle: Some(handle),
        })
    }

    pub fn participant(&self) -> &Arc<Participant> {
        &self.participant
    }

    /// Stops the node loop and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // A loop that already exited has dropped its receiver.
        let _ = self.command_sender.send(NodeCommand::Shutdown);
        if handle.join().is_err() {
            error!("Node loop of {} panicked", self.participant.node_id());
        }
        info!("Participant {} stopped", self.participant.node_id());
    }
}

impl Drop for ParticipantNode {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(participant: &Participant, commands: crossbeam_channel::Receiver<NodeCommand>) {
    let poll = participant.config().receive_poll;
    loop {
        match commands.try_recv() {
            Ok(NodeCommand::Shutdown) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match participant.transport.receive(poll) {
            Ok(Some(msg)) => {
                if let Err(e) = participant.deliver_message(&msg) {
                    warn!(
                        "{} failed to handle message from {}: {}",
                        participant.node_id(),
                        msg.addr,
                        e
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Node loop of {} stopped: {}", participant.node_id(), e);
                break;
            }
        }
    }
}
